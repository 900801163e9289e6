//! Location and extent of the loaded target image.

use std::marker::PhantomData;
use std::slice;

use byteorder::{ByteOrder, LE};

use crate::error::{Error, Result};

const DOS_MAGIC: u16 = 0x5a4d;
const PE_MAGIC: u32 = 0x4550;
/// Size of the header page that is always mapped at the image base.
pub const HEADER_PAGE: usize = 0x1000;

/// A mapped module image, `[base, base + size)`.
///
/// The lifetime ties images built from a slice to that slice; images of the running
/// executable are `'static` since the process never unmaps its own exe.
#[derive(Copy, Clone, Debug)]
pub struct ModuleImage<'a> {
    base: usize,
    size: usize,
    phantom: PhantomData<&'a [u8]>,
}

impl<'a> ModuleImage<'a> {
    pub fn from_slice(bytes: &'a [u8]) -> ModuleImage<'a> {
        ModuleImage {
            base: bytes.as_ptr() as usize,
            size: bytes.len(),
            phantom: PhantomData,
        }
    }

    /// Preconditions: `[base, base + size)` is mapped and readable for as long as the
    /// image is used.
    pub unsafe fn from_raw(base: usize, size: usize) -> ModuleImage<'static> {
        ModuleImage {
            base,
            size,
            phantom: PhantomData,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// True if the `len` bytes at `address` all lie inside the image.
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base &&
            address.checked_add(len).map(|end| end <= self.end()).unwrap_or(false)
    }

    /// Offset of `address` from the image base.
    pub fn rva(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }

    /// The whole image.
    ///
    /// Code may be patched while the image exists, so the returned slice must not be held
    /// across a hook installation.
    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base as *const u8, self.size) }
    }

    /// Bytes from `address` to the end of the image, or `None` if `address` is outside.
    pub fn code_at(&self, address: usize) -> Option<&[u8]> {
        if address >= self.base && address < self.end() {
            Some(&self.bytes()[address - self.base..])
        } else {
            None
        }
    }
}

#[cfg(all(windows, target_arch = "x86"))]
impl ModuleImage<'static> {
    /// Image of the process executable, sized from its PE header.
    pub fn current_exe() -> Result<ModuleImage<'static>> {
        let base = crate::platform::exe_handle() as usize;
        if base == 0 {
            return Err(Error::last_os_error());
        }
        let headers = unsafe { slice::from_raw_parts(base as *const u8, HEADER_PAGE) };
        let size = image_size_from_headers(headers)?;
        if !crate::platform::is_readable(base, size) {
            return Err(Error::ModuleNotReadable { base, end: base + size });
        }
        Ok(unsafe { ModuleImage::from_raw(base, size) })
    }
}

/// Reads `SizeOfImage` from the optional header.
/// Preconditions: `headers` starts at the MS-DOS header of the image.
pub fn image_size_from_headers(headers: &[u8]) -> Result<usize> {
    let read_u16 = |offset: usize| headers.get(offset..offset + 2).map(LE::read_u16);
    let read_u32 = |offset: usize| headers.get(offset..offset + 4).map(LE::read_u32);

    if read_u16(0) != Some(DOS_MAGIC) {
        return Err(Error::InvalidPeHeader("missing MZ signature"));
    }
    let pe_offset = read_u32(0x3c).ok_or(Error::InvalidPeHeader("truncated DOS header"))?
        as usize;
    if pe_offset >= headers.len() || read_u32(pe_offset) != Some(PE_MAGIC) {
        return Err(Error::InvalidPeHeader("missing PE signature"));
    }
    let coff_header = pe_offset + 4;
    let opt_header_size = read_u16(coff_header + 0x10)
        .ok_or(Error::InvalidPeHeader("truncated COFF header"))?;
    let opt_header = coff_header + 0x14;
    if opt_header_size < 0x40 {
        return Err(Error::InvalidPeHeader("optional header too small"));
    }
    match read_u16(opt_header) {
        Some(0x10b) | Some(0x20b) => (),
        _ => return Err(Error::InvalidPeHeader("unknown optional header magic")),
    }
    // Same offset for PE32 and PE32+.
    let size = read_u32(opt_header + 0x38)
        .ok_or(Error::InvalidPeHeader("truncated optional header"))?;
    if size == 0 {
        return Err(Error::InvalidPeHeader("SizeOfImage is 0"));
    }
    Ok(size as usize)
}

#[cfg(test)]
fn fake_pe_headers(size_of_image: u32) -> Vec<u8> {
    let mut headers = vec![0u8; 0x200];
    LE::write_u16(&mut headers[0..], DOS_MAGIC);
    LE::write_u32(&mut headers[0x3c..], 0x80);
    LE::write_u32(&mut headers[0x80..], PE_MAGIC);
    LE::write_u16(&mut headers[0x84 + 0x10..], 0xe0);
    LE::write_u16(&mut headers[0x98..], 0x10b);
    LE::write_u32(&mut headers[0x98 + 0x38..], size_of_image);
    headers
}
