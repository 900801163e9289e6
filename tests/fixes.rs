mod common;

use byteorder::{ByteOrder, LE};

use common::{code_with, FakeMemory};
use valkyria_fix::fixes::{CenterUiIcons, MinimapOverlay, Textbox, UiScaling};
use valkyria_fix::{apply, apply_all, Error, FixFlags, FixStatus, HookRegistry, RuntimeConfig};

const CENTER_UI_ICONS: &[u8] = &[
    0xd9, 0x46, 0x64, 0xd9, 0x5c, 0x24, 0x1c, 0xd9, 0x46, 0x68, 0xd9, 0x5c, 0x24, 0x14, 0xd9, 0x46,
    0x6c,
];
const MINIMAP: &[u8] = &[0xde, 0xc1, 0xde, 0xc9, 0xd9, 0x98, 0x9c, 0x00, 0x00, 0x00];
const TEXTBOX: &[u8] = &[0xd9, 0x5d, 0xf8, 0xa8, 0x04, 0x74, 0x0e, 0xd9, 0x45, 0xf8];

fn config(master: bool, center_hud: bool) -> RuntimeConfig {
    RuntimeConfig::new("test".into(), 3440, 1440, master, FixFlags { center_hud }).unwrap()
}

fn game_image() -> Vec<u8> {
    code_with(0x400, &[(0x100, CENTER_UI_ICONS), (0x200, MINIMAP), (0x300, TEXTBOX)])
}

fn hooked_address(status: &FixStatus) -> Option<usize> {
    match *status {
        FixStatus::Hooked { address } => Some(address),
        _ => None,
    }
}

#[test]
fn all_fixes_in_order() {
    let memory = FakeMemory::new(game_image());
    let image = memory.image();
    let base = image.base();
    let mut hooks = HookRegistry::new(memory);
    let reports = apply_all(&image, &mut hooks, &config(true, true));

    let names: Vec<&str> = reports.iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["CenterUiIcons", "UiScaling", "MinimapOverlay", "Textbox"]);
    assert_eq!(hooked_address(&reports[0].status), Some(base + 0x100));
    assert!(matches!(reports[1].status, FixStatus::NotFound));
    assert_eq!(hooked_address(&reports[2].status), Some(base + 0x200));
    // Textbox hooks after the `fstp`
    assert_eq!(hooked_address(&reports[3].status), Some(base + 0x303));

    assert_eq!(hooks.len(), 3);
    let bytes = hooks.memory().bytes();
    assert_eq!(bytes[0x100], 0xe9);
    assert_eq!(bytes[0x200], 0xe9);
    assert_eq!(&bytes[0x300..0x304], &[0xd9, 0x5d, 0xf8, 0xe9]);
    assert_eq!(hooks.site(base + 0x200).unwrap().original_bytes(), MINIMAP);
    assert_eq!(hooks.site(base + 0x100).unwrap().original_bytes(), &CENTER_UI_ICONS[..7]);
}

#[test]
fn master_disabled_touches_nothing() {
    let code = game_image();
    let memory = FakeMemory::new(code.clone());
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let reports = apply_all(&image, &mut hooks, &config(false, true));
    assert!(reports.iter().all(|r| matches!(r.status, FixStatus::Disabled)));
    assert!(hooks.is_empty());
    assert_eq!(hooks.memory().bytes(), &code[..]);
    assert_eq!(hooks.memory().patch_count, 0);
}

#[test]
fn textbox_only_needs_master() {
    let memory = FakeMemory::new(game_image());
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let reports = apply_all(&image, &mut hooks, &config(true, false));
    for report in &reports[..3] {
        assert!(matches!(report.status, FixStatus::Disabled), "{}", report);
    }
    assert!(reports[3].is_hooked());
    assert_eq!(hooks.len(), 1);
}

#[test]
fn missing_signatures_are_not_errors() {
    let memory = FakeMemory::new(vec![0xcc; 0x400]);
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let reports = apply_all(&image, &mut hooks, &config(true, true));
    assert!(reports.iter().all(|r| matches!(r.status, FixStatus::NotFound)));
    assert_eq!(hooks.memory().patch_count, 0);
}

#[test]
fn first_match_wins() {
    let code = code_with(0x400, &[(0x180, TEXTBOX), (0x300, TEXTBOX)]);
    let memory = FakeMemory::new(code);
    let image = memory.image();
    let base = image.base();
    let mut hooks = HookRegistry::new(memory);
    let report = apply::<Textbox, _>(&image, &mut hooks, &config(true, true));
    assert_eq!(hooked_address(&report.status), Some(base + 0x183));
    assert!(!hooks.is_hooked(base + 0x303));
    assert_eq!(hooks.memory().bytes()[0x303], 0xa8);
}

#[test]
fn hooked_signature_no_longer_matches() {
    let memory = FakeMemory::new(game_image());
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let config = config(true, true);
    assert!(apply::<MinimapOverlay, _>(&image, &mut hooks, &config).is_hooked());
    // The hook replaced the signature bytes, so it no longer matches.
    let again = apply::<MinimapOverlay, _>(&image, &mut hooks, &config);
    assert!(matches!(again.status, FixStatus::NotFound));
    assert!(apply::<CenterUiIcons, _>(&image, &mut hooks, &config).is_hooked());
    assert_eq!(hooks.len(), 2);
}

#[test]
fn ui_scaler_outside_image_fails_locally() {
    let mut fld = vec![0xd9, 0x05];
    fld.extend_from_slice(&[0u8; 4]);
    LE::write_u32(&mut fld[2..], 0x10);
    fld.extend_from_slice(&[0xd9, 0x98, 0x88, 0x00, 0x00, 0x00, 0xd9, 0x45, 0x08]);
    let mut code = game_image();
    code[0x380..0x380 + fld.len()].copy_from_slice(&fld);
    let memory = FakeMemory::new(code);
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let reports = apply_all(&image, &mut hooks, &config(true, true));
    match reports[1].status {
        FixStatus::Failed(Error::InvalidAddress(a)) => assert_eq!(a, 0x10),
        ref other => panic!("{:?}", other),
    }
    // The remaining fixes still ran
    assert!(reports[2].is_hooked());
    assert!(reports[3].is_hooked());
    assert!(!hooks.is_hooked(image.base() + 0x380));
}

#[test]
fn signature_too_close_to_end() {
    // The jump at signature + 3 needs 5 bytes, only 4 are left in the image.
    let code = code_with(0x20, &[(0x20 - 7, &TEXTBOX[..7])]);
    let memory = FakeMemory::new(code.clone());
    let image = memory.image();
    let mut hooks = HookRegistry::new(memory);
    let report = apply::<Textbox, _>(&image, &mut hooks, &config(true, true));
    assert!(matches!(report.status, FixStatus::Failed(_)), "{}", report);
    assert_eq!(hooks.memory().bytes(), &code[..]);
}

#[test]
fn scaler_address_is_read_from_the_hook() {
    let code = [0xd9, 0x05, 0x10, 0x43, 0x35, 0x01];
    assert_eq!(UiScaling::scaler_address(&code), Some(0x0135_4310));
}
