use std::path::PathBuf;

/// Returns the platform default storage root for notes.
///
/// Uses the user's data directory (`~/.local/share` on Linux, `~/Library/Application Support`
/// on macOS, `%APPDATA%` on Windows). In debug mode a separate `tack-dev` folder is used so
/// development builds never touch real notes.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_storage_root(debug: bool) -> Option<PathBuf> {
    let folder = if debug { "tack-dev" } else { "tack" };
    dirs::data_dir().map(|dir| dir.join(folder))
}

/// Returns the default location of `settings.json`.
pub fn default_settings_path(debug: bool) -> Option<PathBuf> {
    let folder = if debug { "tack-dev" } else { "tack" };
    dirs::config_dir().map(|dir| dir.join(folder).join("settings.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_root_is_separate() {
        if let (Some(release), Some(debug)) =
            (default_storage_root(false), default_storage_root(true))
        {
            assert_ne!(release, debug);
            assert!(debug.ends_with("tack-dev"));
        }
    }
}
