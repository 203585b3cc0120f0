use std::path::PathBuf;

use dirs_next::{config_dir, data_dir, home_dir};

/// Expands a leading `~` into the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = p.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// `<config_dir>/runlane`, falling back to the working directory.
pub fn default_config_dir() -> PathBuf {
    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("runlane")
}

/// `<data_dir>/runlane`, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    data_dir().unwrap_or_else(|| PathBuf::from(".")).join("runlane")
}
