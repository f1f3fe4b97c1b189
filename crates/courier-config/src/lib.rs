//! # Courier Configuration
//!
//! Loads the workspace configuration consumed by the scripting layer:
//! - Multiple formats (YAML, TOML, JSON)
//! - Environment variable expansion (`${VAR}`, `${VAR:-default}`)
//! - Validation
//! - Environment toggles for the scripting runtime

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod settings;
pub mod validator;

pub use builder::ConfigBuilder;
pub use loader::{load_config, load_from_file, load_from_str};
pub use settings::ScriptingSettings;
pub use validator::validate_config;

use courier_core::{Error, Result, ScriptingConfig};
use std::path::Path;

/// Load configuration from a file
pub fn load<P: AsRef<Path>>(path: P) -> Result<ScriptingConfig> {
    load_config(path)
}

/// Load configuration from a string
pub fn load_str(content: &str, format: ConfigFormat) -> Result<ScriptingConfig> {
    let config = load_from_str(content, format)?;
    validate_config(&config)?;
    Ok(config)
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from a workspace file's extension (case-insensitive)
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                Error::Config(format!("Cannot detect the format of '{}'", path.display()))
            })?;

        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(Error::Config(format!("Unsupported workspace file format: .{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_format_from_path() {
        let cases = [
            ("workspaces.yml", ConfigFormat::Yaml),
            ("Workspaces.YAML", ConfigFormat::Yaml),
            ("workspaces.toml", ConfigFormat::Toml),
            ("workspaces.json", ConfigFormat::Json),
        ];
        for (file, format) in cases {
            assert_eq!(ConfigFormat::from_path(&PathBuf::from(file)).unwrap(), format);
        }
        assert!(ConfigFormat::from_path(&PathBuf::from("workspaces.txt")).is_err());
        assert!(ConfigFormat::from_path(&PathBuf::from("workspaces")).is_err());
    }

    #[test]
    fn test_load_str_validates() {
        let ok = load_str("workspaces:\n  - name: staging\n", ConfigFormat::Yaml).unwrap();
        assert_eq!(ok.workspaces[0].name, "staging");

        let duplicate = "workspaces:\n  - name: staging\n  - name: staging\n";
        assert!(load_str(duplicate, ConfigFormat::Yaml).is_err());
    }
}
