use std::fs;

use valkyria_fix::config::CONFIG_FILE_NAME;
use valkyria_fix::{ConfigFile, Error};

#[test]
fn load_next_to_dll() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    fs::write(
        &path,
        "name = \"Valkyria Chronicles Fix\"\n\
         masterEnable = true\n\
         [resolution]\n\
         width = 0\n\
         height = 0\n\
         [fixes.centerHud]\n\
         enable = false\n",
    )
    .unwrap();
    let config = ConfigFile::load(&path).unwrap().resolve(|| Some((3840, 1600))).unwrap();
    assert_eq!(config.name(), "Valkyria Chronicles Fix");
    assert_eq!((config.width(), config.height()), (3840, 1600));
    assert_eq!(config.aspect_ratio(), 2.4);
    assert!(config.master_enable());
    assert!(!config.fixes().center_hud);
}

#[test]
fn missing_file_is_os_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigFile::load(dir.path().join(CONFIG_FILE_NAME)).unwrap_err();
    assert!(matches!(err, Error::Os(_)));
}

#[test]
fn wrong_type_is_parse_error() {
    let text = "masterEnable = \"yes\"\n[resolution]\nwidth = 1\nheight = 1\n[fixes.centerHud]\nenable = true\n";
    assert!(matches!(ConfigFile::from_toml_str(text), Err(Error::ConfigParse(_))));
}

#[test]
fn shipped_config_parses() {
    let file = ConfigFile::from_toml_str(include_str!("../ValkyriaChroniclesFix.toml")).unwrap();
    assert!(file.master_enable);
    assert_eq!((file.resolution.width, file.resolution.height), (0, 0));
    let config = file.resolve(|| Some((2560, 1080))).unwrap();
    assert!(config.fixes().center_hud);
}
