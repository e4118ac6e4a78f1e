//! The TOML configuration file: named backup sets, each pairing source
//! trees with one or more storages. The first storage of a set receives
//! backups; `sync` mirrors it to the rest.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use ebakup_types::error::{EbakupError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backups: Vec<BackupSet>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSet {
    pub name: String,
    pub storages: Vec<PathBuf>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EbakupError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| EbakupError::Config(format!("in '{}': {e}", path.display())))?;
        for set in &config.backups {
            if set.storages.is_empty() {
                return Err(EbakupError::Config(format!(
                    "backup set '{}' names no storages",
                    set.name
                )));
            }
        }
        Ok(config)
    }

    /// The sets selected by name, or all of them when no names are given.
    pub fn select(&self, names: &[String]) -> Result<Vec<&BackupSet>> {
        if names.is_empty() {
            return Ok(self.backups.iter().collect());
        }
        let mut selected = Vec::new();
        for name in names {
            let set = self
                .backups
                .iter()
                .find(|set| &set.name == name)
                .ok_or_else(|| {
                    EbakupError::Config(format!("no backup set named '{name}'"))
                })?;
            selected.push(set);
        }
        Ok(selected)
    }
}

/// Resolution order: explicit flag, $EBAKUP_CONFIG, ./ebakup.toml,
/// ~/.config/ebakup/config.toml.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("EBAKUP_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from("ebakup.toml");
    if local.exists() {
        return Some(local);
    }
    if let Ok(home) = std::env::var("HOME") {
        let user = PathBuf::from(home)
            .join(".config")
            .join("ebakup")
            .join("config.toml");
        if user.exists() {
            return Some(user);
        }
    }
    None
}
