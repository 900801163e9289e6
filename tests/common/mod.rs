#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;

use valkyria_fix::{CodeMemory, Error, ModuleImage, Result};

pub const STUB_BASE: usize = 0x7000_0000;

/// Code buffer standing in for a process.
pub struct FakeMemory {
    code: Vec<u8>,
    stubs: BTreeMap<usize, Vec<u8>>,
    next_stub: usize,
    /// Instruction pointers of other "threads", checked on every code patch.
    pub thread_ips: Vec<usize>,
    pub relocated: Vec<(usize, usize)>,
    pub released: Vec<usize>,
    pub fail_patch: bool,
    pub patch_count: usize,
}

impl FakeMemory {
    pub fn new(code: Vec<u8>) -> FakeMemory {
        FakeMemory {
            code,
            stubs: BTreeMap::new(),
            next_stub: STUB_BASE,
            thread_ips: Vec::new(),
            relocated: Vec::new(),
            released: Vec::new(),
            fail_patch: false,
            patch_count: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.code.as_ptr() as usize
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    /// Image over the code buffer. Valid while the `FakeMemory` is alive, also after it
    /// has been moved into a registry.
    pub fn image(&self) -> ModuleImage<'static> {
        unsafe { ModuleImage::from_raw(self.base(), self.code.len()) }
    }

    pub fn stub(&self, address: usize) -> Option<&[u8]> {
        self.stubs.get(&address).map(|s| &s[..])
    }

    fn offset(&self, address: usize) -> Result<usize> {
        let offset = address.wrapping_sub(self.base());
        if offset < self.code.len() {
            Ok(offset)
        } else {
            Err(Error::InvalidAddress(address))
        }
    }
}

impl CodeMemory for FakeMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize> {
        let offset = self.offset(address)?;
        let len = buf.len().min(self.code.len() - offset);
        buf[..len].copy_from_slice(&self.code[offset..offset + len]);
        Ok(len)
    }

    fn allocate_stub(&mut self, len: usize) -> Result<usize> {
        let address = self.next_stub;
        self.next_stub += (len + 0xff) & !0xff;
        self.stubs.insert(address, vec![0xcc; len]);
        Ok(address)
    }

    fn write_stub(&mut self, stub: usize, code: &[u8]) -> Result<()> {
        let buf = self.stubs.get_mut(&stub).ok_or(Error::InvalidAddress(stub))?;
        buf[..code.len()].copy_from_slice(code);
        Ok(())
    }

    fn release_stub(&mut self, stub: usize) {
        self.stubs.remove(&stub);
        self.released.push(stub);
    }

    fn patch_code(
        &mut self,
        address: usize,
        code: &[u8],
        relocate_ip: &dyn Fn(usize) -> Option<usize>,
    ) -> Result<()> {
        if self.fail_patch {
            return Err(Error::Os(io::Error::new(io::ErrorKind::Other, "patch refused")));
        }
        let offset = self.offset(address)?;
        let mut moves = Vec::new();
        for &ip in &self.thread_ips {
            match relocate_ip(ip) {
                Some(new) if new == ip => (),
                Some(new) => moves.push((ip, new)),
                None => return Err(Error::ThreadInPatch(ip)),
            }
        }
        self.relocated.extend(moves);
        self.code[offset..offset + code.len()].copy_from_slice(code);
        self.patch_count += 1;
        Ok(())
    }
}

/// `len` bytes of `int3` with `pieces` copied in at their offsets.
pub fn code_with(len: usize, pieces: &[(usize, &[u8])]) -> Vec<u8> {
    let mut code = vec![0xcc; len];
    for &(offset, bytes) in pieces {
        code[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    code
}
