//! The four widescreen corrections.
//!
//! Each fix scans the executable for one signature, hooks the first match (plus a fixed
//! offset) and writes corrected floats from the hook. When a signature matches more than
//! once the lowest address is used and the other matches are logged.

use std::fmt;
use std::ptr;

use byteorder::{ByteOrder, LE};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::context::{HookContext, Register};
use crate::error::{Error, Result};
use crate::hook::{HookRegistry, MidHookRequest};
use crate::memory::CodeMemory;
use crate::module::ModuleImage;
use crate::pattern::BytePattern;
use crate::x86::JUMP_LEN;

/// Horizontal reference dimension the game's UI code is written against.
pub const NATIVE_UI_WIDTH: f32 = 1280.0;
/// UI scale the game computes for a 2560 pixel wide 16:9 screen.
pub const NATIVE_UI_SCALE: f32 = 2.0;

pub trait Fix {
    /// Passed to every invocation of the callback.
    type Data: Send + Sync + 'static;

    const NAME: &'static str;
    const SIGNATURE: &'static str;
    /// Hook address relative to the signature match.
    const HOOK_OFFSET: usize = 0;
    /// Memory written by the callback.
    const WRITES: &'static str;

    fn is_enabled(config: &RuntimeConfig) -> bool;

    /// Computes the callback data once the hook address is known.
    fn prepare(image: &ModuleImage, hook: usize, config: &RuntimeConfig) -> Result<Self::Data>;

    /// # Safety
    /// Only called from the hook stub, with the registers of the hooked instruction.
    unsafe fn callback(context: &mut HookContext, data: &Self::Data);
}

/// Places the icons of the unit status bar relative to the 1280 wide UI.
pub struct CenterUiIcons;

impl Fix for CenterUiIcons {
    type Data = ();

    const NAME: &'static str = "CenterUiIcons";
    const SIGNATURE: &'static str = "D9 46 64    D9 5C 24 1C    D9 46 68    D9 5C 24 14    D9 46 6C";
    const WRITES: &'static str = "f32 [esp + 0xc] = 1280.0";

    fn is_enabled(config: &RuntimeConfig) -> bool {
        config.master_enable() && config.fixes().center_hud
    }

    fn prepare(_: &ModuleImage, _: usize, _: &RuntimeConfig) -> Result<()> {
        Ok(())
    }

    unsafe fn callback(context: &mut HookContext, _: &()) {
        context.write_f32(Register::Esp, 0xc, NATIVE_UI_WIDTH);
    }
}

/// Global float the game scales its UI with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UiScalerSlot {
    pub address: usize,
}

/// Forces the UI scale factor back to the 16:9 value, which keeps the HUD centered.
pub struct UiScaling;

impl UiScaling {
    /// `fld dword [addr]` at the hook, `addr` being the scaler.
    pub fn scaler_address(code: &[u8]) -> Option<usize> {
        match code {
            [0xd9, 0x05, rest @ ..] if rest.len() >= 4 => Some(LE::read_u32(rest) as usize),
            _ => None,
        }
    }
}

impl Fix for UiScaling {
    type Data = UiScalerSlot;

    const NAME: &'static str = "UiScaling";
    const SIGNATURE: &'static str = "D9 05 ?? ?? ?? ??    D9 98 88 00 00 00    D9 45 08";
    const WRITES: &'static str = "f32 [scaler] = 2.0";

    fn is_enabled(config: &RuntimeConfig) -> bool {
        config.master_enable() && config.fixes().center_hud
    }

    fn prepare(image: &ModuleImage, hook: usize, _: &RuntimeConfig) -> Result<UiScalerSlot> {
        let code = image.code_at(hook).ok_or(Error::InvalidAddress(hook))?;
        let address = UiScaling::scaler_address(code).ok_or(Error::InvalidAddress(hook))?;
        // The scaler is a global of the executable.
        if !image.contains(address, 4) {
            return Err(Error::InvalidAddress(address));
        }
        let current = image.code_at(address).map(LE::read_f32).unwrap_or(0.0);
        info!("{}: Scaler @ 0x{:x}, currently {}", Self::NAME, address, current);
        Ok(UiScalerSlot { address })
    }

    unsafe fn callback(_: &mut HookContext, data: &UiScalerSlot) {
        ptr::write_unaligned(data.address as *mut f32, NATIVE_UI_SCALE);
    }
}

/// Horizontal limits of the minimap overlay icons.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MinimapBounds {
    pub low: f32,
    pub high: f32,
}

/// Computes the overlay limits for a `width` x `height` screen.
///
/// The game places the overlay at `(164 -/+ 77) * 2 + 1280` for 2560x1440; this scales the
/// half-width with the ratio to a 16:9 screen of the same height and centers the result.
pub fn minimap_bounds(width: u32, height: u32) -> MinimapBounds {
    let width = width as f32;
    let default_width = default_width(height as f32);
    let pixel_scaler = pixel_scaler(width, default_width);
    let center_offset = (width - default_width) / 2.0;
    MinimapBounds {
        low: ((164.0 - pixel_scaler) * 2.0) + center_offset,
        high: ((164.0 + pixel_scaler) * 2.0) + center_offset,
    }
}

/// Width of a 16:9 screen `height` pixels tall.
fn default_width(height: f32) -> f32 {
    (height * 16.0) / 9.0
}

fn pixel_scaler(width: f32, default_width: f32) -> f32 {
    77.0 * (width / default_width)
}

/// Keeps the minimap overlay icons on the minimap.
pub struct MinimapOverlay;

impl Fix for MinimapOverlay {
    type Data = MinimapBounds;

    const NAME: &'static str = "MinimapOverlay";
    const SIGNATURE: &'static str = "DE C1    DE C9    D9 98 9C 00 00 00";
    const WRITES: &'static str = "f32 [eax + 0x90] = low, f32 [eax + 0x98] = high";

    fn is_enabled(config: &RuntimeConfig) -> bool {
        config.master_enable() && config.fixes().center_hud
    }

    fn prepare(_: &ModuleImage, _: usize, config: &RuntimeConfig) -> Result<MinimapBounds> {
        let bounds = minimap_bounds(config.width(), config.height());
        info!("{}: low {}, high {}", Self::NAME, bounds.low, bounds.high);
        Ok(bounds)
    }

    unsafe fn callback(context: &mut HookContext, data: &MinimapBounds) {
        context.write_f32(Register::Eax, 0x90, data.low);
        context.write_f32(Register::Eax, 0x98, data.high);
    }
}

/// Keeps dialogue text boxes inside the 16:9 area. Applied whenever fixes are enabled.
pub struct Textbox;

impl Fix for Textbox {
    type Data = ();

    const NAME: &'static str = "Textbox";
    const SIGNATURE: &'static str = "D9 5D F8    A8 04    74 0E";
    // After `fstp dword [ebp - 8]`
    const HOOK_OFFSET: usize = 3;
    const WRITES: &'static str = "f32 [ebp - 0x8] = 1280.0";

    fn is_enabled(config: &RuntimeConfig) -> bool {
        config.master_enable()
    }

    fn prepare(_: &ModuleImage, _: usize, _: &RuntimeConfig) -> Result<()> {
        Ok(())
    }

    unsafe fn callback(context: &mut HookContext, _: &()) {
        context.write_f32(Register::Ebp, -0x8, NATIVE_UI_WIDTH);
    }
}

#[derive(Debug)]
pub enum FixStatus {
    /// Turned off by configuration; no scan was done.
    Disabled,
    NotFound,
    Hooked { address: usize },
    Failed(Error),
}

#[derive(Debug)]
pub struct FixReport {
    pub name: &'static str,
    pub status: FixStatus,
}

impl FixReport {
    pub fn is_hooked(&self) -> bool {
        matches!(self.status, FixStatus::Hooked { .. })
    }
}

impl fmt::Display for FixReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            FixStatus::Disabled => write!(f, "{}: disabled", self.name),
            FixStatus::NotFound => write!(f, "{}: not found", self.name),
            FixStatus::Hooked { address } => write!(f, "{}: hooked @ 0x{:x}", self.name, address),
            FixStatus::Failed(ref e) => write!(f, "{}: failed: {}", self.name, e),
        }
    }
}

/// Scans for and hooks a single fix.
pub fn apply<F, M>(
    image: &ModuleImage,
    hooks: &mut HookRegistry<M>,
    config: &RuntimeConfig,
) -> FixReport
where F: Fix,
      M: CodeMemory,
{
    let status = match try_apply::<F, M>(image, hooks, config) {
        Ok(status) => status,
        Err(e) => {
            warn!("{}: {}", F::NAME, e);
            FixStatus::Failed(e)
        }
    };
    FixReport {
        name: F::NAME,
        status,
    }
}

fn try_apply<F, M>(
    image: &ModuleImage,
    hooks: &mut HookRegistry<M>,
    config: &RuntimeConfig,
) -> Result<FixStatus>
where F: Fix,
      M: CodeMemory,
{
    let enabled = F::is_enabled(config);
    info!("{}: Fix {}", F::NAME, if enabled { "Enabled" } else { "Disabled" });
    if !enabled {
        return Ok(FixStatus::Disabled);
    }
    let pattern = BytePattern::parse(F::SIGNATURE)?;
    let matches = pattern.scan(image);
    let found = match matches.first() {
        Some(s) => s,
        None => {
            info!("{}: Did not find '{}'", F::NAME, F::SIGNATURE);
            return Ok(FixStatus::NotFound);
        }
    };
    let rva = image.rva(found);
    info!("{}: Found '{}' @ 0x{:x}", F::NAME, F::SIGNATURE, rva);
    if matches.len() > 1 {
        let others: Vec<String> = matches
            .iter()
            .skip(1)
            .map(|&a| format!("0x{:x}", image.rva(a)))
            .collect();
        warn!("{}: Using the first of {} matches, ignoring {}", F::NAME, matches.len(), others.join(", "));
    }
    let hook = found + F::HOOK_OFFSET;
    if !image.contains(hook, JUMP_LEN) {
        return Err(Error::InvalidAddress(hook));
    }
    let data = F::prepare(image, hook, config)?;
    hooks.install(MidHookRequest {
        address: hook,
        description: F::WRITES,
        data,
        callback: F::callback,
    })?;
    info!("{}: Hooked @ 0x{:x} + 0x{:x} = 0x{:x}", F::NAME, rva, F::HOOK_OFFSET, image.rva(hook));
    Ok(FixStatus::Hooked { address: hook })
}

/// Applies every fix in order. A failing fix does not stop the ones after it.
pub fn apply_all<M: CodeMemory>(
    image: &ModuleImage,
    hooks: &mut HookRegistry<M>,
    config: &RuntimeConfig,
) -> Vec<FixReport> {
    vec![
        apply::<CenterUiIcons, M>(image, hooks, config),
        apply::<UiScaling, M>(image, hooks, config),
        apply::<MinimapOverlay, M>(image, hooks, config),
        apply::<Textbox, M>(image, hooks, config),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::FixFlags;

    fn config(master: bool, center_hud: bool) -> RuntimeConfig {
        RuntimeConfig::new(String::new(), 3440, 1440, master, FixFlags { center_hud }).unwrap()
    }

    #[test]
    fn minimap_formula_is_exact() {
        let bounds = minimap_bounds(3440, 1440);
        assert_eq!(bounds.low, 561.0625);
        assert_eq!(bounds.high, 974.9375);
        // Native 16:9 gives the game's own values.
        let bounds = minimap_bounds(2560, 1440);
        assert_eq!(bounds.low, 174.0);
        assert_eq!(bounds.high, 482.0);
    }

    #[test]
    fn minimap_intermediates_are_exact() {
        assert_eq!(default_width(1440.0), 2560.0);
        assert_eq!(pixel_scaler(3440.0, 2560.0), 103.46875);
        assert_eq!(pixel_scaler(2560.0, 2560.0), 77.0);
    }

    #[test]
    fn minimap_formula_32_9() {
        let bounds = minimap_bounds(5120, 1440);
        assert_eq!(bounds.low, 1300.0);
        assert_eq!(bounds.high, 1916.0);
    }

    #[test]
    fn enable_predicates() {
        assert!(CenterUiIcons::is_enabled(&config(true, true)));
        assert!(!CenterUiIcons::is_enabled(&config(true, false)));
        assert!(!UiScaling::is_enabled(&config(false, true)));
        assert!(!MinimapOverlay::is_enabled(&config(true, false)));
        assert!(Textbox::is_enabled(&config(true, false)));
        assert!(!Textbox::is_enabled(&config(false, true)));
    }

    #[test]
    fn signatures_parse() {
        assert_eq!(BytePattern::parse(CenterUiIcons::SIGNATURE).unwrap().len(), 17);
        assert_eq!(BytePattern::parse(UiScaling::SIGNATURE).unwrap().len(), 15);
        assert_eq!(BytePattern::parse(MinimapOverlay::SIGNATURE).unwrap().len(), 10);
        assert_eq!(BytePattern::parse(Textbox::SIGNATURE).unwrap().len(), 7);
    }

    #[test]
    fn scaler_address_from_fld() {
        let code = [0xd9, 0x05, 0x10, 0x43, 0x35, 0x01, 0xd9, 0x98];
        assert_eq!(UiScaling::scaler_address(&code), Some(0x0135_4310));
        assert_eq!(UiScaling::scaler_address(&[0xd9, 0x05, 0x10]), None);
        assert_eq!(UiScaling::scaler_address(&[0xd9, 0x45, 0x08, 0, 0, 0]), None);
    }

    #[test]
    fn callbacks_write_through_registers() {
        let mut stack = [0f32; 8];
        let mut frame = [0f32; 4];
        let mut object = [0f32; 0x28];
        let mut scaler = 5.0f32;
        let mut ctx = HookContext::default();
        ctx.set(Register::Esp, stack.as_mut_ptr() as usize);
        ctx.set(Register::Ebp, frame.as_mut_ptr() as usize + 0x10);
        ctx.set(Register::Eax, object.as_mut_ptr() as usize);
        let bounds = minimap_bounds(3440, 1440);
        unsafe {
            CenterUiIcons::callback(&mut ctx, &());
            Textbox::callback(&mut ctx, &());
            MinimapOverlay::callback(&mut ctx, &bounds);
            UiScaling::callback(&mut ctx, &UiScalerSlot { address: &mut scaler as *mut f32 as usize });
        }
        assert_eq!(stack[3], 1280.0);
        assert_eq!(frame[2], 1280.0);
        assert_eq!(object[0x90 / 4], 561.0625);
        assert_eq!(object[0x98 / 4], 974.9375);
        assert_eq!(scaler, 2.0);
        assert_eq!(stack.iter().filter(|&&x| x != 0.0).count(), 1);
    }
}
