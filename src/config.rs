use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct UnitsConfig {
    #[serde(default = "UnitsConfig::default_script_root")]
    pub script_root: PathBuf,
    #[serde(default = "UnitsConfig::default_extension")]
    pub extension: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReloadConfig {
    #[serde(default)]
    pub everything_reloadable: bool,
    #[serde(default = "ReloadConfig::default_force_reload")]
    pub force_reload_on_first_load: bool,
    #[serde(default = "ReloadConfig::default_watch")]
    pub watch: bool,
    #[serde(default = "ReloadConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    #[serde(default = "LevelConfig::default_save_path")]
    pub save_path: PathBuf,
    #[serde(default = "LevelConfig::default_pretty")]
    pub pretty: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LiveConfig {
    #[serde(default)]
    pub units: UnitsConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub level: LevelConfig,
}

#[derive(Debug, Clone, Default)]
pub struct LiveConfigOverrides {
    pub script_root: Option<PathBuf>,
    pub save_path: Option<PathBuf>,
    pub everything_reloadable: Option<bool>,
}

impl UnitsConfig {
    fn default_script_root() -> PathBuf {
        PathBuf::from("scripts")
    }

    fn default_extension() -> String {
        crate::units::script::DEFAULT_EXTENSION.to_string()
    }
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self { script_root: Self::default_script_root(), extension: Self::default_extension() }
    }
}

impl ReloadConfig {
    const fn default_force_reload() -> bool {
        true
    }

    const fn default_watch() -> bool {
        true
    }

    const fn default_poll_interval_ms() -> u64 {
        300
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            everything_reloadable: false,
            force_reload_on_first_load: Self::default_force_reload(),
            watch: Self::default_watch(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl LevelConfig {
    fn default_save_path() -> PathBuf {
        PathBuf::from("save.json")
    }

    const fn default_pretty() -> bool {
        true
    }
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self { save_path: Self::default_save_path(), pretty: Self::default_pretty() }
    }
}

impl LiveConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("[config] {err:#}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &LiveConfigOverrides) {
        if let Some(root) = &overrides.script_root {
            self.units.script_root = root.clone();
        }
        if let Some(path) = &overrides.save_path {
            self.level.save_path = path.clone();
        }
        if let Some(everything) = overrides.everything_reloadable {
            self.reload.everything_reloadable = everything;
        }
    }
}

impl LiveConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.script_root.is_none() && self.save_path.is_none() && self.everything_reloadable.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.script_root.is_some() {
            fields.push("script_root");
        }
        if self.save_path.is_some() {
            fields.push("save_path");
        }
        if self.everything_reloadable.is_some() {
            fields.push("everything_reloadable");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: LiveConfig = serde_json::from_str(r#"{"reload": {"watch": false}}"#).expect("parse");
        assert!(!cfg.reload.watch);
        assert!(cfg.reload.force_reload_on_first_load);
        assert_eq!(cfg.reload.poll_interval(), Duration::from_millis(300));
        assert_eq!(cfg.units.script_root, PathBuf::from("scripts"));
        assert_eq!(cfg.units.extension, "rhai");
        assert_eq!(cfg.level.save_path, PathBuf::from("save.json"));
    }

    #[test]
    fn load_reads_file_and_overrides_apply() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{"units": {{"script_root": "game/scripts"}}, "level": {{"pretty": false}}}}"#).unwrap();
        let mut cfg = LiveConfig::load(file.path()).expect("load config");
        assert_eq!(cfg.units.script_root, PathBuf::from("game/scripts"));
        assert!(!cfg.level.pretty);

        let overrides = LiveConfigOverrides {
            save_path: Some(PathBuf::from("levels/one.json")),
            everything_reloadable: Some(true),
            ..Default::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.level.save_path, PathBuf::from("levels/one.json"));
        assert!(cfg.reload.everything_reloadable);
        assert_eq!(overrides.applied_fields(), ["save_path", "everything_reloadable"]);
    }

    #[test]
    fn unreadable_config_falls_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = LiveConfig::load_or_default(dir.path().join("missing.json"));
        assert!(cfg.reload.watch);
    }
}
