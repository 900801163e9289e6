//! DLL entry point. Everything runs once, on a thread started at process attach.

use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{error, info};
use winapi::shared::minwindef::{BOOL, DWORD, HINSTANCE, HMODULE, LPVOID, TRUE};
use winapi::um::processthreadsapi::SetThreadPriority;
use winapi::um::winbase::THREAD_PRIORITY_HIGHEST;
use winapi::um::winnt::DLL_PROCESS_ATTACH;

use crate::config::{ConfigFile, CONFIG_FILE_NAME};
use crate::error::Result;
use crate::fixes;
use crate::hook::HookRegistry;
use crate::logging;
use crate::memory::ProcessMemory;
use crate::module::ModuleImage;
use crate::platform;

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(module: HINSTANCE, reason: DWORD, _reserved: LPVOID) -> BOOL {
    if reason == DLL_PROCESS_ATTACH {
        let module = module as usize;
        let spawned = thread::Builder::new()
            .name("valkyria-fix".into())
            .spawn(move || initialize(module));
        if let Ok(handle) = spawned {
            unsafe {
                SetThreadPriority(handle.as_raw_handle() as _, THREAD_PRIORITY_HIGHEST as i32);
            }
        }
    }
    TRUE
}

/// Directory containing this DLL, where the config and log files live.
fn dll_directory(module: usize) -> PathBuf {
    platform::module_path(Some(module as HMODULE))
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .unwrap_or_default()
}

pub fn initialize(module: usize) {
    let directory = dll_directory(module);
    // Without a log file the fixes are still applied, just silently.
    if logging::init(&directory).is_ok() {
        logging::install_panic_hook();
    }
    if let Err(e) = run(&directory) {
        error!("Initialization failed: {}", e);
    }
}

fn run(directory: &Path) -> Result<()> {
    let image = ModuleImage::current_exe()?;
    let exe_path = platform::module_path(None);
    logging::log_module_details(exe_path.as_deref(), image.base());

    let config = ConfigFile::load(directory.join(CONFIG_FILE_NAME))?
        .resolve(platform::desktop_resolution)?;
    config.log_summary();

    let mut hooks = HookRegistry::new(ProcessMemory::new()?);
    let reports = fixes::apply_all(&image, &mut hooks, &config);
    for report in &reports {
        info!("{}", report);
    }
    // The game never unloads the fix; hooks stay installed until the process exits.
    Box::leak(Box::new(hooks));
    Ok(())
}
