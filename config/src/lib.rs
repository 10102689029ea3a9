//! Load configuration from XDG `config.toml` and project `.env`, then apply to the process
//! environment with priority: **existing env > .env > XDG**.
//!
//! Typed settings for the two services live in [`settings`]; binaries call
//! `load_and_apply` first, then build their settings struct from the environment.

mod dotenv;
pub mod settings;
mod xdg_toml;

use std::path::Path;
use thiserror::Error;

pub use settings::{AgentHostSettings, SettingsError, ToolsProviderSettings};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config path: {0}")]
    XdgPath(String),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads config from XDG `config.toml` and optional project `.env`, then sets environment
/// variables only for keys that are **not** already set (so existing env has highest priority).
///
/// Order of precedence when a key is missing in the process environment:
/// 1. Value from project `.env` (current directory or `override_dir` if given)
/// 2. Value from `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]` table
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        let value = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)).cloned();
        if let Some(v) = value {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_env_wins() {
        std::env::set_var("AGENTRY_CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("agentry", None);
        assert_eq!(
            std::env::var("AGENTRY_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        std::env::remove_var("AGENTRY_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn load_and_apply_no_config_ok() {
        let r = load_and_apply("agentry-nonexistent-app-xyz", None::<&std::path::Path>);
        assert!(r.is_ok());
    }

    #[test]
    fn dotenv_value_applied_when_env_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "AGENTRY_CONFIG_TEST_DOTENV=from_dotenv\n",
        )
        .unwrap();
        std::env::remove_var("AGENTRY_CONFIG_TEST_DOTENV");
        load_and_apply("agentry-nonexistent-app-xyz", Some(dir.path())).unwrap();
        assert_eq!(
            std::env::var("AGENTRY_CONFIG_TEST_DOTENV").as_deref(),
            Ok("from_dotenv")
        );
        std::env::remove_var("AGENTRY_CONFIG_TEST_DOTENV");
    }
}
