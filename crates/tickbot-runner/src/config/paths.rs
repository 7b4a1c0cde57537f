use std::env;
use std::path::{Path, PathBuf};

/// Where tickbot keeps its files.
///
/// Unix-like systems follow the XDG base directories
/// (`$XDG_CONFIG_HOME/tickbot`, `$XDG_DATA_HOME/tickbot`); Windows uses
/// `%APPDATA%\tickbot` for both.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl ProjectPaths {
    /// Resolve the directories for `name`; `None` without a home directory
    pub fn new(name: &str) -> Option<Self> {
        let home = home_dir()?;
        Some(Self {
            config_dir: config_root(&home).join(name),
            data_dir: data_root(&home).join(name),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(not(target_os = "windows"))]
fn config_root(home: &Path) -> PathBuf {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(".config"))
}

#[cfg(not(target_os = "windows"))]
fn data_root(home: &Path) -> PathBuf {
    env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(".local").join("share"))
}

#[cfg(target_os = "windows")]
fn config_root(home: &Path) -> PathBuf {
    env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join("AppData").join("Roaming"))
}

#[cfg(target_os = "windows")]
fn data_root(home: &Path) -> PathBuf {
    config_root(home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_namespaced() {
        // Nothing to resolve without a home directory
        let Some(paths) = ProjectPaths::new("tickbot") else {
            return;
        };
        assert!(paths.config_dir().ends_with("tickbot"));
        assert!(paths.data_dir().ends_with("tickbot"));
        assert_eq!(paths.config_file().file_name().unwrap(), "config.toml");
        assert!(paths.log_dir().starts_with(paths.data_dir()));
    }
}
