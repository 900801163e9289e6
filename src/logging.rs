use std::fs::File;
use std::io;
use std::panic;
use std::path::Path;
use std::sync::Mutex;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

pub const LOG_FILE_NAME: &str = "ValkyriaChroniclesFix.log";

/// Sends all events to `<directory>/ValkyriaChroniclesFix.log`, truncating it.
///
/// The level is taken from `RUST_LOG` and defaults to `info`.
pub fn init(directory: &Path) -> Result<()> {
    let file = File::create(directory.join(LOG_FILE_NAME))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Os(io::Error::new(io::ErrorKind::Other, e)))
}

/// Logs panics, which would otherwise go to a stderr nobody sees.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        error!("{}", info);
    }));
}

pub fn log_module_details(exe_path: Option<&Path>, base: usize) {
    info!(
        "{} v{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
    );
    let name = exe_path
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("Module Name: {}", name);
    if let Some(path) = exe_path {
        info!("Module Path: {}", path.display());
    }
    info!("Module Address: 0x{:x}", base);
}
