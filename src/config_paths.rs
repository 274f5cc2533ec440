use std::path::PathBuf;

use crate::store::StoreError;

pub fn skiff_config_dir() -> Result<PathBuf, StoreError> {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .map_err(|_| StoreError::Config("Unable to resolve USERPROFILE/HOME".to_string()))?
    } else {
        std::env::var("HOME")
            .map_err(|_| StoreError::Config("Unable to resolve HOME".to_string()))?
    };

    let mut path = PathBuf::from(home);
    if cfg!(target_os = "macos") {
        path.push("Library");
        path.push("Application Support");
        path.push("skiff");
    } else {
        path.push(".config");
        path.push("skiff");
    }
    Ok(path)
}

pub fn profiles_path() -> Result<PathBuf, StoreError> {
    Ok(skiff_config_dir()?.join("profiles.json"))
}

pub fn settings_path() -> Result<PathBuf, StoreError> {
    Ok(skiff_config_dir()?.join("settings.json"))
}

pub fn transfers_path() -> Result<PathBuf, StoreError> {
    Ok(skiff_config_dir()?.join("transfers.json"))
}
