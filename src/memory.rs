//! Access to the code being hooked.
//!
//! `HookRegistry` only touches memory through `CodeMemory`, which allows the hook logic to
//! run against a plain buffer in tests.

use crate::error::Result;

pub trait CodeMemory {
    /// Copies bytes at `address` to `buf`, returning how many could be read.
    /// Fewer than `buf.len()` is not an error as long as at least one byte was read.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize>;

    /// Allocates executable memory for a stub.
    fn allocate_stub(&mut self, len: usize) -> Result<usize>;

    fn write_stub(&mut self, stub: usize, code: &[u8]) -> Result<()>;

    /// Frees a stub that never got reachable from patched code.
    fn release_stub(&mut self, stub: usize);

    /// Writes `code` over executable code at `address`.
    ///
    /// Other threads must not observe a partial write. Any thread whose instruction pointer
    /// is inside the written range is moved to `relocate_ip(ip)`; if that returns `None`
    /// for some thread, nothing is written.
    fn patch_code(
        &mut self,
        address: usize,
        code: &[u8],
        relocate_ip: &dyn Fn(usize) -> Option<usize>,
    ) -> Result<()>;
}

/// Applies `apply` to each item in order. If one fails, the items already applied are
/// handed to `undo` in reverse order and the index of the failed item is returned.
///
/// Must not allocate: it runs while every other thread is suspended.
#[cfg_attr(not(all(windows, target_arch = "x86")), allow(dead_code))]
pub(crate) fn apply_or_undo<T>(
    items: &[T],
    mut apply: impl FnMut(&T) -> bool,
    mut undo: impl FnMut(&T),
) -> std::result::Result<(), usize> {
    for (i, item) in items.iter().enumerate() {
        if !apply(item) {
            for done in items[..i].iter().rev() {
                undo(done);
            }
            return Err(i);
        }
    }
    Ok(())
}

#[cfg(all(windows, target_arch = "x86"))]
pub use self::process::ProcessMemory;

#[cfg(all(windows, target_arch = "x86"))]
mod process {
    use std::ptr;

    use crate::error::{Error, Result};
    use crate::platform::{self, ExecutableHeap, MemoryProtection, ThreadFreeze};

    use super::CodeMemory;

    /// Memory of the current process.
    pub struct ProcessMemory {
        heap: ExecutableHeap,
    }

    impl ProcessMemory {
        pub fn new() -> Result<ProcessMemory> {
            Ok(ProcessMemory {
                heap: ExecutableHeap::new()?,
            })
        }
    }

    impl CodeMemory for ProcessMemory {
        fn read(&self, address: usize, buf: &mut [u8]) -> Result<usize> {
            let len = platform::readable_len(address, buf.len());
            if len == 0 {
                return Err(Error::InvalidAddress(address));
            }
            unsafe {
                ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), len);
            }
            Ok(len)
        }

        fn allocate_stub(&mut self, len: usize) -> Result<usize> {
            self.heap.allocate(len).map(|ptr| ptr as usize)
        }

        fn write_stub(&mut self, stub: usize, code: &[u8]) -> Result<()> {
            unsafe {
                ptr::copy_nonoverlapping(code.as_ptr(), stub as *mut u8, code.len());
            }
            platform::flush_instruction_cache(stub, code.len());
            Ok(())
        }

        fn release_stub(&mut self, stub: usize) {
            self.heap.free(stub as *mut u8);
        }

        fn patch_code(
            &mut self,
            address: usize,
            code: &[u8],
            relocate_ip: &dyn Fn(usize) -> Option<usize>,
        ) -> Result<()> {
            // Nothing here may allocate once threads are suspended; a suspended thread
            // could hold the process heap lock.
            let protection = MemoryProtection::new(address, code.len())?;
            let mut freeze = ThreadFreeze::new()?;
            // On error every thread is back where it was stopped.
            freeze.relocate_ip(relocate_ip)?;
            unsafe {
                ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
            }
            drop(protection);
            platform::flush_instruction_cache(address, code.len());
            drop(freeze);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::Cell;

    #[test]
    fn all_items_applied() {
        let mut applied = Vec::new();
        let result = apply_or_undo(&[1, 2, 3], |&x| { applied.push(x); true }, |_| panic!());
        assert_eq!(result, Ok(()));
        assert_eq!(applied, vec![1, 2, 3]);
    }

    #[test]
    fn failure_undoes_earlier_items() {
        let state = [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)];
        let mut undone = Vec::new();
        let result = apply_or_undo(
            &[0usize, 1, 2, 3],
            |&i| {
                if i == 2 {
                    return false;
                }
                state[i].set(1);
                true
            },
            |&i| {
                state[i].set(0);
                undone.push(i);
            },
        );
        assert_eq!(result, Err(2));
        assert!(state.iter().all(|s| s.get() == 0));
        assert_eq!(undone, vec![1, 0]);
    }

    #[test]
    fn first_failure_undoes_nothing() {
        let result = apply_or_undo(&[7], |_| false, |_| panic!());
        assert_eq!(result, Err(0));
    }
}
