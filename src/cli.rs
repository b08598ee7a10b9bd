use crate::config::LiveConfigOverrides;
use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    script_root: Option<PathBuf>,
    level: Option<PathBuf>,
    reloadable: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Use --script-root/--level/--reloadable with values.");
            };
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "script-root" => overrides.script_root = Some(PathBuf::from(value)),
                "level" => overrides.level = Some(PathBuf::from(value)),
                "reloadable" => overrides.reloadable = Some(parse_bool_flag("reloadable", &value)?),
                _ => bail!("Unknown flag '{flag}'. Supported flags: --script-root, --level, --reloadable."),
            }
        }
        Ok(overrides)
    }

    pub fn into_config_overrides(self) -> LiveConfigOverrides {
        LiveConfigOverrides { script_root: self.script_root, save_path: self.level, everything_reloadable: self.reloadable }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_flags() {
        let args = ["live", "--script-root", "game/scripts", "--level", "one.json", "--reloadable", "on"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.script_root, Some(PathBuf::from("game/scripts")));
        assert_eq!(overrides.save_path, Some(PathBuf::from("one.json")));
        assert_eq!(overrides.everything_reloadable, Some(true));
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["live", "--level", "a.json", "--level", "b.json"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.level, Some(PathBuf::from("b.json")));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["live", "--level"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags_and_bad_bools() {
        let err = CliOverrides::parse(["live", "--width", "800"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
        let err = CliOverrides::parse(["live", "--reloadable", "maybe"]).unwrap_err();
        assert!(err.to_string().contains("Invalid reloadable"));
    }
}
