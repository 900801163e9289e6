//! Register snapshot handed to mid-hook callbacks.

use std::ptr;

/// Registers saved by a mid-hook stub. Indices are the x86 register encodings.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

/// Stack image built by the hook stub: xmm registers, then `pushfd`, then `pushad`.
///
/// Register fields are `usize` which is `u32` on the only architecture the stub exists for;
/// elsewhere the context is only constructed by tests.
/// Writes to registers other than `esp` are loaded back into the CPU when the stub returns.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    xmm: [[u32; 4]; 8],
    eflags: usize,
    // pushad order, lowest address first
    edi: usize,
    esi: usize,
    ebp: usize,
    esp: usize,
    ebx: usize,
    edx: usize,
    ecx: usize,
    eax: usize,
}

#[cfg(target_arch = "x86")]
const _: () = assert!(::std::mem::size_of::<HookContext>() == 0x80 + 4 + 0x20);

impl HookContext {
    pub fn get(&self, reg: Register) -> usize {
        match reg {
            Register::Eax => self.eax,
            Register::Ecx => self.ecx,
            Register::Edx => self.edx,
            Register::Ebx => self.ebx,
            Register::Esp => self.esp,
            Register::Ebp => self.ebp,
            Register::Esi => self.esi,
            Register::Edi => self.edi,
        }
    }

    pub fn set(&mut self, reg: Register, value: usize) {
        let slot = match reg {
            Register::Eax => &mut self.eax,
            Register::Ecx => &mut self.ecx,
            Register::Edx => &mut self.edx,
            Register::Ebx => &mut self.ebx,
            Register::Esp => &mut self.esp,
            Register::Ebp => &mut self.ebp,
            Register::Esi => &mut self.esi,
            Register::Edi => &mut self.edi,
        };
        *slot = value;
    }

    pub fn eax(&self) -> usize {
        self.eax
    }

    pub fn ecx(&self) -> usize {
        self.ecx
    }

    pub fn edx(&self) -> usize {
        self.edx
    }

    pub fn ebx(&self) -> usize {
        self.ebx
    }

    /// Stack pointer at the hooked instruction.
    pub fn esp(&self) -> usize {
        self.esp
    }

    pub fn ebp(&self) -> usize {
        self.ebp
    }

    pub fn esi(&self) -> usize {
        self.esi
    }

    pub fn edi(&self) -> usize {
        self.edi
    }

    pub fn eflags(&self) -> usize {
        self.eflags
    }

    /// Lanes of `xmm<index>` as floats.
    pub fn xmm(&self, index: usize) -> [f32; 4] {
        let lanes = self.xmm[index];
        [
            f32::from_bits(lanes[0]),
            f32::from_bits(lanes[1]),
            f32::from_bits(lanes[2]),
            f32::from_bits(lanes[3]),
        ]
    }

    /// `reg + offset`.
    pub fn address_of(&self, reg: Register, offset: isize) -> usize {
        self.get(reg).wrapping_add(offset as usize)
    }

    /// Preconditions: `reg + offset` is readable for 4 bytes.
    pub unsafe fn read_f32(&self, reg: Register, offset: isize) -> f32 {
        ptr::read_unaligned(self.address_of(reg, offset) as *const f32)
    }

    /// Preconditions: `reg + offset` is writable for 4 bytes.
    pub unsafe fn write_f32(&self, reg: Register, offset: isize, value: f32) {
        ptr::write_unaligned(self.address_of(reg, offset) as *mut f32, value)
    }

    /// Preconditions: `reg + offset` is readable for 4 bytes.
    pub unsafe fn read_u32(&self, reg: Register, offset: isize) -> u32 {
        ptr::read_unaligned(self.address_of(reg, offset) as *const u32)
    }

    /// Preconditions: `reg + offset` is writable for 4 bytes.
    pub unsafe fn write_u32(&self, reg: Register, offset: isize, value: u32) {
        ptr::write_unaligned(self.address_of(reg, offset) as *mut u32, value)
    }
}
