//! 32-bit x86 code generation for mid-function hooks.
//!
//! A hook overwrites the first instructions at the hooked address with a `jmp` to a stub.
//! The stub saves every register, calls the hook callback with a `HookContext`, restores
//! the registers, runs the overwritten instructions from their new location and jumps
//! back to the first instruction that was not overwritten.

use byteorder::{ByteOrder, LE};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Length of `jmp rel32`, the shortest patch a hook can use.
pub const JUMP_LEN: usize = 5;
/// Enough bytes to always decode `JUMP_LEN` bytes of instructions.
pub const MAX_WINDOW: usize = JUMP_LEN - 1 + 15;

const XMM_SAVE_SIZE: usize = 0x80;
const XMM_COUNT: u8 = 8;

pub fn nop() -> u8 {
    0x90
}

/// `jmp to` written at `from`, padded with nops to `len` bytes.
pub fn jump_patch(from: usize, to: usize, len: usize) -> SmallVec<[u8; 16]> {
    debug_assert!(len >= JUMP_LEN);
    let mut patch = SmallVec::new();
    patch.push(0xe9);
    let mut rel = [0u8; 4];
    LE::write_u32(&mut rel, to.wrapping_sub(from).wrapping_sub(JUMP_LEN) as u32);
    patch.extend_from_slice(&rel);
    while patch.len() < len {
        patch.push(nop());
    }
    patch
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Relocation {
    Copy,
    /// `e8`/`e9`/`0f 8x`, the displacement follows `opcode_len` bytes.
    Rel32 { opcode_len: usize },
    /// `7x rel8`, widened to `0f 8x rel32`.
    ShortJcc { condition: u8 },
    /// `eb rel8`, widened to `e9 rel32`.
    ShortJmp,
}

#[derive(Debug, Copy, Clone)]
struct PlannedInstruction {
    source_offset: usize,
    source_len: usize,
    dest_offset: usize,
    dest_len: usize,
    relocation: Relocation,
    target: Option<usize>,
}

/// Decoded instructions covering at least `JUMP_LEN` bytes at an address, and how each of
/// them is rewritten when moved into a stub.
#[derive(Debug, Clone)]
pub struct RelocationPlan {
    address: usize,
    bytes: SmallVec<[u8; 32]>,
    instructions: SmallVec<[PlannedInstruction; 8]>,
    relocated_len: usize,
}

fn is_prefix(byte: u8) -> bool {
    match byte {
        0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 => true,
        _ => false,
    }
}

fn is_branch(ins: &[u8]) -> bool {
    match ins[0] {
        0x70 ..= 0x7f | 0xe0 ..= 0xe3 | 0xe8 | 0xe9 | 0xeb => true,
        0x0f => ins.get(1).map(|&b| b & 0xf0 == 0x80).unwrap_or(false),
        _ => false,
    }
}

/// Control never falls through to the next instruction.
fn ends_flow(ins: &[u8]) -> bool {
    match ins[0] {
        0xc2 | 0xc3 | 0xca | 0xcb | 0xe9 | 0xeb => true,
        // jmp r/m32, jmp m16:32
        0xff => ins.get(1).map(|&modrm| matches!((modrm >> 3) & 7, 4 | 5)).unwrap_or(false),
        _ => false,
    }
}

fn rel32_target(next: usize, rel: &[u8]) -> usize {
    next.wrapping_add(LE::read_i32(rel) as isize as usize)
}

fn rel8_target(next: usize, rel: u8) -> usize {
    next.wrapping_add(rel as i8 as isize as usize)
}

impl RelocationPlan {
    /// Decodes instructions from `code`, which is located at `address`, until at least
    /// `min_len` bytes are covered.
    pub fn new(address: usize, code: &[u8], min_len: usize) -> Result<RelocationPlan> {
        let mut instructions = SmallVec::<[PlannedInstruction; 8]>::new();
        let mut offset = 0;
        let mut dest_offset = 0;
        for (opcode, _) in lde::X86.iter(code, 0) {
            if offset >= min_len {
                break;
            }
            let ins: &[u8] = &opcode[..];
            let ins_address = address + offset;
            let next = ins_address + ins.len();
            let prefixes = ins.iter().take_while(|&&b| is_prefix(b)).count();
            if prefixes == ins.len() {
                return Err(Error::UndecodableInstruction(ins_address));
            }
            let body = &ins[prefixes..];
            if prefixes != 0 && is_branch(body) {
                return Err(Error::UnrelocatableInstruction { address: ins_address, opcode: body[0] });
            }
            if ends_flow(body) && offset + ins.len() < min_len {
                return Err(Error::InstructionTooShort {
                    address,
                    available: offset + ins.len(),
                    required: min_len,
                });
            }
            let (relocation, dest_len, target) = match body[0] {
                0xe8 | 0xe9 if ins.len() == 5 => {
                    (Relocation::Rel32 { opcode_len: 1 }, 5, Some(rel32_target(next, &ins[1..])))
                }
                0x0f if ins.len() == 6 && ins[1] & 0xf0 == 0x80 => {
                    (Relocation::Rel32 { opcode_len: 2 }, 6, Some(rel32_target(next, &ins[2..])))
                }
                0x70 ..= 0x7f if ins.len() == 2 => {
                    let condition = ins[0] & 0xf;
                    (Relocation::ShortJcc { condition }, 6, Some(rel8_target(next, ins[1])))
                }
                0xeb if ins.len() == 2 => {
                    (Relocation::ShortJmp, 5, Some(rel8_target(next, ins[1])))
                }
                op if is_branch(body) => {
                    return Err(Error::UnrelocatableInstruction { address: ins_address, opcode: op });
                }
                _ => (Relocation::Copy, ins.len(), None),
            };
            instructions.push(PlannedInstruction {
                source_offset: offset,
                source_len: ins.len(),
                dest_offset,
                dest_len,
                relocation,
                target,
            });
            offset += ins.len();
            dest_offset += dest_len;
        }
        if offset < min_len {
            if offset >= code.len() {
                return Err(Error::InstructionTooShort { address, available: offset, required: min_len });
            }
            return Err(Error::UndecodableInstruction(address + offset));
        }
        for ins in &instructions {
            if let Some(target) = ins.target {
                if target > address && target < address + offset {
                    return Err(Error::BranchIntoPatch {
                        address: address + ins.source_offset,
                        target,
                    });
                }
            }
        }
        Ok(RelocationPlan {
            address,
            bytes: code[..offset].iter().cloned().collect(),
            instructions,
            relocated_len: dest_offset,
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes that the hook patch overwrites.
    pub fn source_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn original_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn relocated_len(&self) -> usize {
        self.relocated_len
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Appends the relocated instructions to `buf`, assuming `buf[0]` is at `buf_address`.
    pub fn emit(&self, buf: &mut Vec<u8>, buf_address: usize) {
        let start = buf.len();
        for ins in &self.instructions {
            let src = &self.bytes[ins.source_offset..ins.source_offset + ins.source_len];
            let next = buf_address + start + ins.dest_offset + ins.dest_len;
            let rel = |target: Option<usize>| {
                target.unwrap_or(0).wrapping_sub(next) as u32
            };
            match ins.relocation {
                Relocation::Copy => buf.extend_from_slice(src),
                Relocation::Rel32 { opcode_len } => {
                    buf.extend_from_slice(&src[..opcode_len]);
                    push_u32(buf, rel(ins.target));
                }
                Relocation::ShortJcc { condition } => {
                    buf.extend_from_slice(&[0x0f, 0x80 | condition]);
                    push_u32(buf, rel(ins.target));
                }
                Relocation::ShortJmp => {
                    buf.push(0xe9);
                    push_u32(buf, rel(ins.target));
                }
            }
        }
    }

    /// Where a thread whose instruction pointer is `ip` has to continue once the patch is
    /// written and the relocated code lives at `relocated_address`.
    ///
    /// Returns `None` if `ip` points inside an instruction of the window.
    pub fn map_ip(&self, ip: usize, relocated_address: usize) -> Option<usize> {
        if ip <= self.address || ip >= self.address + self.source_len() {
            return Some(ip);
        }
        let offset = ip - self.address;
        self.instructions
            .iter()
            .find(|ins| ins.source_offset == offset)
            .map(|ins| relocated_address + ins.dest_offset)
    }
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    LE::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Byte buffer that knows the address it will be copied to.
pub struct AssemblerBuf {
    buf: Vec<u8>,
    address: usize,
}

impl AssemblerBuf {
    pub fn new(address: usize) -> AssemblerBuf {
        AssemblerBuf {
            buf: Vec::with_capacity(192),
            address,
        }
    }

    fn current_address(&self) -> usize {
        self.address + self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_constant(&mut self, value: u32) {
        self.buf.push(0x68);
        push_u32(&mut self.buf, value);
    }

    pub fn push_register(&mut self, reg: u8) {
        self.buf.push(0x50 + reg);
    }

    pub fn stack_add(&mut self, value: usize) {
        match value {
            0 => (),
            x if x < 0x80 => self.raw(&[0x83, 0xc4, x as u8]),
            x => {
                self.raw(&[0x81, 0xc4]);
                push_u32(&mut self.buf, x as u32);
            }
        }
    }

    pub fn stack_sub(&mut self, value: usize) {
        match value {
            0 => (),
            x if x < 0x80 => self.raw(&[0x83, 0xec, x as u8]),
            x => {
                self.raw(&[0x81, 0xec]);
                push_u32(&mut self.buf, x as u32);
            }
        }
    }

    /// `movdqu [esp + offset], xmm<index>`
    pub fn store_xmm(&mut self, index: u8, offset: u8) {
        self.raw(&[0xf3, 0x0f, 0x7f, 0x44 | (index << 3), 0x24, offset]);
    }

    /// `movdqu xmm<index>, [esp + offset]`
    pub fn load_xmm(&mut self, index: u8, offset: u8) {
        self.raw(&[0xf3, 0x0f, 0x6f, 0x44 | (index << 3), 0x24, offset]);
    }

    pub fn call(&mut self, target: usize) {
        self.buf.push(0xe8);
        let value = target.wrapping_sub(self.current_address() + 4) as u32;
        push_u32(&mut self.buf, value);
    }

    pub fn jump(&mut self, target: usize) {
        self.buf.push(0xe9);
        let value = target.wrapping_sub(self.current_address() + 4) as u32;
        push_u32(&mut self.buf, value);
    }

    pub fn relocated(&mut self, plan: &RelocationPlan) {
        let address = self.address;
        plan.emit(&mut self.buf, address);
    }
}

/// Stub of a single mid-function hook.
///
/// `thunk` is called as `extern "C" fn(*mut HookContext, data)`.
pub struct MidHookStub<'a> {
    plan: &'a RelocationPlan,
    thunk: usize,
    data: usize,
}

/// Bytes before the relocated instructions.
const PRELUDE_LEN: usize = 3 + 6 + 6 * XMM_COUNT as usize + 2 + 5 + 1 + 5 + 3 +
    6 * XMM_COUNT as usize + 6 + 2;

impl<'a> MidHookStub<'a> {
    pub fn new(plan: &'a RelocationPlan, thunk: usize, data: usize) -> MidHookStub<'a> {
        MidHookStub {
            plan,
            thunk,
            data,
        }
    }

    pub fn len(&self) -> usize {
        PRELUDE_LEN + self.plan.relocated_len() + JUMP_LEN
    }

    /// Address of the relocated instructions in a stub placed at `stub`.
    pub fn relocated_address(&self, stub: usize) -> usize {
        stub + PRELUDE_LEN
    }

    /// Assembles the stub for placement at `stub`.
    pub fn assemble(&self, stub: usize) -> Vec<u8> {
        let mut buf = AssemblerBuf::new(stub);
        // pushad; pushfd; cld
        buf.raw(&[0x60, 0x9c, 0xfc]);
        // Forced imm32 form so that the prelude length is constant.
        buf.raw(&[0x81, 0xec]);
        push_u32(&mut buf.buf, XMM_SAVE_SIZE as u32);
        for i in 0..XMM_COUNT {
            buf.store_xmm(i, i * 0x10);
        }
        // mov eax, esp
        buf.raw(&[0x89, 0xe0]);
        buf.push_constant(self.data as u32);
        buf.push_register(0);
        buf.call(self.thunk);
        buf.stack_add(8);
        for i in 0..XMM_COUNT {
            buf.load_xmm(i, i * 0x10);
        }
        buf.raw(&[0x81, 0xc4]);
        push_u32(&mut buf.buf, XMM_SAVE_SIZE as u32);
        // popfd; popad
        buf.raw(&[0x9d, 0x61]);
        debug_assert_eq!(buf.len(), PRELUDE_LEN);
        buf.relocated(self.plan);
        buf.jump(self.plan.address() + self.plan.source_len());
        buf.into_inner()
    }
}
