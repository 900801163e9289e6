//! Widescreen fix for Valkyria Chronicles, loaded into the game process as a DLL.
//!
//! At process attach a thread locates the executable image, reads the configuration and
//! then, for each fix, scans the image for a byte signature and installs a mid-function
//! hook at the match. The hooks write corrected UI coordinates computed from the configured
//! resolution. Nothing is changed on disk.
//!
//! Everything except the process-specific parts (`entry`, `platform`, `ProcessMemory`) is
//! plain byte logic and can be used and tested on any host:
//!
//! ```
//! use valkyria_fix::{BytePattern, ModuleImage};
//!
//! let code = [0x90, 0xd9, 0x5d, 0xf8, 0xa8, 0x04, 0x74, 0x0e, 0xcc];
//! let image = ModuleImage::from_slice(&code);
//! let pattern = BytePattern::parse("D9 5D ??    A8 04").unwrap();
//! assert_eq!(pattern.scan(&image).first(), Some(image.base() + 1));
//! ```

pub mod config;
pub mod context;
mod error;
pub mod fixes;
pub mod hook;
pub mod logging;
pub mod memory;
pub mod module;
pub mod pattern;
pub mod x86;

#[cfg(all(windows, target_arch = "x86"))]
mod entry;
#[cfg(all(windows, target_arch = "x86"))]
pub mod platform;

pub use crate::config::{ConfigFile, FixFlags, RuntimeConfig};
pub use crate::context::{HookContext, Register};
pub use crate::error::{Error, Result};
pub use crate::fixes::{apply, apply_all, Fix, FixReport, FixStatus};
pub use crate::hook::{HookCallback, HookRegistry, HookSite, MidHookRequest};
pub use crate::memory::CodeMemory;
pub use crate::module::ModuleImage;
pub use crate::pattern::{BytePattern, MatchResult};

#[cfg(all(windows, target_arch = "x86"))]
pub use crate::entry::initialize;
#[cfg(all(windows, target_arch = "x86"))]
pub use crate::memory::ProcessMemory;
