use crate::settings::Settings;
use std::path::{Path, PathBuf};

/// Directory category a bare file name resolves under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileDirectory {
    GCodes,
    System,
    Macros,
    Filaments,
    Web,
    Scans,
}

impl FileDirectory {
    fn name(self, settings: &Settings) -> &str {
        match self {
            FileDirectory::GCodes => &settings.gcodes_directory,
            FileDirectory::System => &settings.system_directory,
            FileDirectory::Macros => &settings.macros_directory,
            FileDirectory::Filaments => &settings.filaments_directory,
            FileDirectory::Web => &settings.web_directory,
            FileDirectory::Scans => &settings.scans_directory,
        }
    }

    fn all() -> [FileDirectory; 6] {
        [
            FileDirectory::GCodes,
            FileDirectory::System,
            FileDirectory::Macros,
            FileDirectory::Filaments,
            FileDirectory::Web,
            FileDirectory::Scans,
        ]
    }
}

/// Maps a virtual path (`0:/gcodes/part.g`, `sys/config.g`, `part.g`) to the
/// physical location under the configured base directory.
///
/// - a `0:/` (or `/`) prefix is stripped and the remainder resolved under
///   the base directory;
/// - a leading segment naming a known directory resolves under the base
///   directory as well;
/// - anything else lands in the default category's directory.
pub fn to_physical(settings: &Settings, path: &str, default: FileDirectory) -> PathBuf {
    let trimmed = path
        .strip_prefix("0:/")
        .or_else(|| path.strip_prefix("0:"))
        .unwrap_or(path);
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);

    if let Some((first, _rest)) = trimmed.split_once('/') {
        if FileDirectory::all()
            .iter()
            .any(|dir| dir.name(settings) == first)
        {
            return settings.base_directory.join(trimmed);
        }
    }
    settings
        .base_directory
        .join(default.name(settings))
        .join(trimmed)
}

/// Physical root of one directory category.
pub fn directory(settings: &Settings, category: FileDirectory) -> PathBuf {
    settings.base_directory.join(category.name(settings))
}

/// Virtual rendering of a physical path, for reports.
pub fn to_virtual(settings: &Settings, physical: &Path) -> String {
    match physical.strip_prefix(&settings.base_directory) {
        Ok(rest) => format!("0:/{}", rest.display()),
        Err(_) => physical.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::with_base("/data/sd")
    }

    #[test]
    fn virtual_prefix_resolves_under_base() {
        let s = settings();
        assert_eq!(
            to_physical(&s, "0:/gcodes/part.g", FileDirectory::System),
            PathBuf::from("/data/sd/gcodes/part.g")
        );
    }

    #[test]
    fn known_directory_prefix_wins_over_default() {
        let s = settings();
        assert_eq!(
            to_physical(&s, "sys/config.g", FileDirectory::GCodes),
            PathBuf::from("/data/sd/sys/config.g")
        );
    }

    #[test]
    fn bare_names_resolve_under_the_default_directory() {
        let s = settings();
        assert_eq!(
            to_physical(&s, "part.g", FileDirectory::GCodes),
            PathBuf::from("/data/sd/gcodes/part.g")
        );
        assert_eq!(
            to_physical(&s, "probe/mesh.g", FileDirectory::System),
            PathBuf::from("/data/sd/sys/probe/mesh.g")
        );
    }

    #[test]
    fn round_trips_to_virtual_form() {
        let s = settings();
        let physical = to_physical(&s, "0:/macros/home.g", FileDirectory::Macros);
        assert_eq!(to_virtual(&s, &physical), "0:/macros/home.g");
    }
}
