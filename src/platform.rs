//! Win32 helpers used when running inside the target process.

use std::ffi::OsString;
use std::mem;
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr;

use smallvec::SmallVec;
use winapi::shared::minwindef::{DWORD, HMODULE, LPCVOID};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::heapapi::{HeapAlloc, HeapCreate, HeapFree};
use winapi::um::libloaderapi::{GetModuleFileNameW, GetModuleHandleW};
use winapi::um::memoryapi::{VirtualProtect, VirtualQuery};
use winapi::um::processthreadsapi::{
    FlushInstructionCache, GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId,
    GetThreadContext, OpenThread, ResumeThread, SetThreadContext, SuspendThread,
};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{self, HANDLE};
use winapi::um::winuser::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

use crate::error::{Error, Result};
use crate::memory;

pub fn exe_handle() -> HMODULE {
    unsafe {
        GetModuleHandleW(ptr::null())
    }
}

/// Full path of a loaded module, `None` handle being the executable.
pub fn module_path(module: Option<HMODULE>) -> Option<PathBuf> {
    let mut buf = vec![0u16; 260];
    loop {
        let len = unsafe {
            GetModuleFileNameW(
                module.unwrap_or(ptr::null_mut()),
                buf.as_mut_ptr(),
                buf.len() as DWORD,
            )
        } as usize;
        if len == 0 {
            return None;
        }
        if len < buf.len() {
            return Some(OsString::from_wide(&buf[..len]).into());
        }
        // Truncated
        let new_len = buf.len() * 2;
        buf.resize(new_len, 0);
    }
}

/// Size of the primary monitor.
pub fn desktop_resolution() -> Option<(u32, u32)> {
    let (width, height) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
    if width <= 0 || height <= 0 {
        None
    } else {
        Some((width as u32, height as u32))
    }
}

fn query(address: usize) -> Option<winnt::MEMORY_BASIC_INFORMATION> {
    unsafe {
        let mut mem_info: winnt::MEMORY_BASIC_INFORMATION = mem::zeroed();
        let size = mem::size_of_val(&mem_info);
        if VirtualQuery(address as LPCVOID, &mut mem_info, size) == 0 {
            None
        } else {
            Some(mem_info)
        }
    }
}

/// Length of the committed and readable prefix of `[address, address + max)`.
pub fn readable_len(address: usize, max: usize) -> usize {
    let end = address.saturating_add(max);
    let mut pos = address;
    while pos < end {
        let mem_info = match query(pos) {
            Some(s) => s,
            None => break,
        };
        let protect = mem_info.Protect;
        if mem_info.State != winnt::MEM_COMMIT ||
            protect & (winnt::PAGE_NOACCESS | winnt::PAGE_GUARD) != 0
        {
            break;
        }
        pos = mem_info.BaseAddress as usize + mem_info.RegionSize;
    }
    pos.min(end) - address
}

pub fn is_readable(address: usize, len: usize) -> bool {
    address.checked_add(len).is_some() && readable_len(address, len) == len
}

pub struct ExecutableHeap {
    handle: HANDLE,
}

unsafe impl Send for ExecutableHeap {
}

unsafe impl Sync for ExecutableHeap {
}

impl ExecutableHeap {
    pub fn new() -> Result<ExecutableHeap> {
        let handle = unsafe { HeapCreate(winnt::HEAP_CREATE_ENABLE_EXECUTE, 0, 0) };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(ExecutableHeap {
            handle,
        })
    }

    pub fn allocate(&self, size: usize) -> Result<*mut u8> {
        let ptr = unsafe { HeapAlloc(self.handle, 0, size) as *mut u8 };
        if ptr.is_null() {
            Err(Error::AllocationFailed(size))
        } else {
            Ok(ptr)
        }
    }

    pub fn free(&self, ptr: *mut u8) {
        unsafe { HeapFree(self.handle, 0, ptr as *mut _); }
    }
}

/// Makes `[address, address + len)` writable and restores the old protection on drop.
#[must_use]
pub struct MemoryProtection {
    protections: SmallVec<[(usize, usize, DWORD); 2]>,
}

impl MemoryProtection {
    pub fn new(address: usize, len: usize) -> Result<MemoryProtection> {
        let mut result = MemoryProtection {
            protections: SmallVec::new(),
        };
        let end = address + len;
        let mut pos = address;
        while pos < end {
            let mem_info = query(pos).ok_or_else(Error::last_os_error)?;
            let region_end = mem_info.BaseAddress as usize + mem_info.RegionSize;
            let chunk = region_end.min(end) - pos;
            let mut old = 0;
            let ok = unsafe {
                VirtualProtect(pos as *mut _, chunk, winnt::PAGE_EXECUTE_READWRITE, &mut old)
            };
            if ok == 0 {
                // Dropping `result` restores what was already changed.
                return Err(Error::last_os_error());
            }
            result.protections.push((pos, chunk, old));
            pos = region_end;
        }
        Ok(result)
    }
}

impl Drop for MemoryProtection {
    fn drop(&mut self) {
        unsafe {
            let mut tmp = 0;
            for &(address, len, protect) in self.protections.iter() {
                VirtualProtect(address as *mut _, len, protect, &mut tmp);
            }
        }
    }
}

pub fn flush_instruction_cache(address: usize, len: usize) {
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), address as LPCVOID, len);
    }
}

/// Every other thread of the process, suspended until drop.
///
/// All memory is reserved before the first thread is suspended.
pub struct ThreadFreeze {
    threads: Vec<HANDLE>,
    /// Thread, context when stopped, context to move it to.
    moves: Vec<(HANDLE, winnt::CONTEXT, winnt::CONTEXT)>,
}

struct Snapshot(HANDLE);

impl Drop for Snapshot {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0); }
    }
}

/// Ids of the other threads of this process.
fn other_thread_ids() -> Result<Vec<DWORD>> {
    let mut ids = Vec::new();
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(Error::last_os_error());
        }
        let snapshot = Snapshot(snapshot);
        let process = GetCurrentProcessId();
        let current = GetCurrentThreadId();
        let mut entry = THREADENTRY32 {
            dwSize: mem::size_of::<THREADENTRY32>() as u32,
            .. mem::zeroed()
        };
        let mut ok = Thread32First(snapshot.0, &mut entry);
        while ok != 0 {
            if entry.th32OwnerProcessID == process && entry.th32ThreadID != current {
                ids.push(entry.th32ThreadID);
            }
            ok = Thread32Next(snapshot.0, &mut entry);
        }
    }
    Ok(ids)
}

impl ThreadFreeze {
    pub fn new() -> Result<ThreadFreeze> {
        let ids = other_thread_ids()?;
        let mut result = ThreadFreeze {
            threads: Vec::with_capacity(ids.len()),
            moves: Vec::with_capacity(ids.len()),
        };
        let access = winnt::THREAD_SUSPEND_RESUME |
            winnt::THREAD_GET_CONTEXT |
            winnt::THREAD_SET_CONTEXT;
        for &id in &ids {
            unsafe {
                let thread = OpenThread(access, 0, id);
                if thread.is_null() {
                    // Exited since the snapshot
                    continue;
                }
                if SuspendThread(thread) == !0 {
                    CloseHandle(thread);
                } else {
                    result.threads.push(thread);
                }
            }
        }
        Ok(result)
    }

    /// Moves the instruction pointer of each suspended thread through `relocate`.
    ///
    /// `None` means the thread is stopped somewhere it cannot be moved from. On any error
    /// every thread is left at, or put back to, the place it was stopped.
    pub fn relocate_ip(&mut self, relocate: &dyn Fn(usize) -> Option<usize>) -> Result<()> {
        self.moves.clear();
        for &thread in &self.threads {
            unsafe {
                let mut context: winnt::CONTEXT = mem::zeroed();
                context.ContextFlags = winnt::CONTEXT_CONTROL;
                if GetThreadContext(thread, &mut context) == 0 {
                    continue;
                }
                let eip = context.Eip as usize;
                match relocate(eip) {
                    Some(new) if new == eip => (),
                    Some(new) => {
                        let mut moved = context;
                        moved.Eip = new as DWORD;
                        self.moves.push((thread, context, moved));
                    }
                    None => return Err(Error::ThreadInPatch(eip)),
                }
            }
        }
        let mut error = None;
        let result = memory::apply_or_undo(
            &self.moves,
            |(thread, _, moved)| {
                let ok = unsafe { SetThreadContext(*thread, moved) } != 0;
                if !ok {
                    error = Some(Error::last_os_error());
                }
                ok
            },
            |(thread, stopped, _)| unsafe {
                SetThreadContext(*thread, stopped);
            },
        );
        match result {
            Ok(()) => Ok(()),
            Err(_) => Err(error.unwrap_or_else(Error::last_os_error)),
        }
    }
}

impl Drop for ThreadFreeze {
    fn drop(&mut self) {
        for &thread in &self.threads {
            unsafe {
                ResumeThread(thread);
                CloseHandle(thread);
            }
        }
    }
}
