//! Configuration file and the immutable `RuntimeConfig` derived from it.
//!
//! The file is only read once, before any hook is installed. Everything the hooks need
//! afterwards is taken from `RuntimeConfig`, which is never mutated.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "ValkyriaChroniclesFix.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub name: String,
    pub master_enable: bool,
    pub resolution: ResolutionSection,
    pub fixes: FixesSection,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResolutionSection {
    /// 0 means "use the desktop width".
    pub width: u32,
    /// 0 means "use the desktop height".
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixesSection {
    pub center_hud: Toggle,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Toggle {
    pub enable: bool,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
        let content = fs::read_to_string(path)?;
        ConfigFile::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<ConfigFile> {
        Ok(toml::from_str(content)?)
    }

    /// Produces the runtime configuration, querying `desktop` only when the file leaves
    /// the width or height at 0. Both dimensions are taken from the desktop in that case.
    pub fn resolve<F>(self, desktop: F) -> Result<RuntimeConfig>
    where F: FnOnce() -> Option<(u32, u32)>,
    {
        let ResolutionSection { mut width, mut height } = self.resolution;
        if width == 0 || height == 0 {
            let (w, h) = desktop().ok_or_else(|| Error::InvalidConfig {
                field: "resolution",
                message: "left at 0 and the desktop resolution is unavailable".into(),
            })?;
            width = w;
            height = h;
        }
        let flags = FixFlags {
            center_hud: self.fixes.center_hud.enable,
        };
        RuntimeConfig::new(self.name, width, height, self.master_enable, flags)
    }
}

/// Per-fix enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixFlags {
    /// Gates the icon centering, UI scaling and minimap overlay corrections.
    pub center_hud: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    name: String,
    width: u32,
    height: u32,
    aspect_ratio: f32,
    master_enable: bool,
    fixes: FixFlags,
}

impl RuntimeConfig {
    pub fn new(
        name: String,
        width: u32,
        height: u32,
        master_enable: bool,
        fixes: FixFlags,
    ) -> Result<RuntimeConfig> {
        if width == 0 {
            return Err(Error::InvalidConfig { field: "resolution.width", message: "is 0".into() });
        }
        if height == 0 {
            return Err(Error::InvalidConfig { field: "resolution.height", message: "is 0".into() });
        }
        Ok(RuntimeConfig {
            name,
            width,
            height,
            aspect_ratio: width as f32 / height as f32,
            master_enable,
            fixes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }

    pub fn master_enable(&self) -> bool {
        self.master_enable
    }

    pub fn fixes(&self) -> FixFlags {
        self.fixes
    }

    pub fn log_summary(&self) {
        info!("Name: {}", self.name);
        info!("MasterEnable: {}", self.master_enable);
        info!("Resolution.Width: {}", self.width);
        info!("Resolution.Height: {}", self.height);
        info!("Resolution.AspectRatio: {}", self.aspect_ratio);
        info!("Fix.CenterHud.Enable: {}", self.fixes.center_hud);
    }
}
