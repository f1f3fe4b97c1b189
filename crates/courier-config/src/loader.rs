//! Configuration loading

use crate::ConfigFormat;
use courier_core::{Error, Result, ScriptingConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("env var pattern is valid")
});

/// Load configuration from a file without validating it
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ScriptingConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in ENV_VAR.captures_iter(content) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match default_value {
                Some(default) => default.to_string(),
                None => {
                    return Err(Error::Config(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string and link workspace parents
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<ScriptingConfig> {
    let expanded_content = expand_env_vars(content)?;

    let mut config: ScriptingConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse JSON: {e}")))?,
    };

    config.link();
    tracing::debug!(
        workspaces = config.workspaces.len(),
        scripts = config.scripts.len(),
        "Configuration parsed"
    );

    Ok(config)
}

/// Load, link and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ScriptingConfig> {
    let config = load_from_file(path)?;

    crate::validator::validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML_CONFIG: &str = r#"
active_workspace: staging
init:
  lua: "boot = true"
workspaces:
  - name: base
    base_url: https://api.example.com
    post_response:
      lua: "return base(ctx) .. '|base'"
  - name: staging
    extend: base
    base_url: ${COURIER_TEST_STAGING_URL:-https://staging.example.com}
    requests:
      login:
        method: POST
        endpoint: /login
scripts:
  hello:
    body:
      lua: "'hello'"
"#;

    #[test]
    fn test_load_yaml_config() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.active_workspace.as_deref(), Some("staging"));
        assert_eq!(config.workspaces.len(), 2);

        let staging = config.workspace("staging").unwrap();
        assert_eq!(staging.base.as_deref(), Some("base"));
        assert_eq!(
            staging.base_url.as_deref(),
            Some("https://staging.example.com")
        );
        assert_eq!(staging.requests["login"].name, "login");
        assert_eq!(staging.requests["login"].method, "POST");
        assert_eq!(config.scripts["hello"].name, "hello");
    }

    #[test]
    fn test_load_json_config() {
        let json = r#"{
            "workspaces": [{ "name": "solo", "properties": { "retries": 3 } }],
            "post_response": { "rhai": "this.body" }
        }"#;
        let config = load_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.workspaces[0].properties["retries"], 3);
    }

    #[test]
    fn test_load_toml_config() {
        let toml = r#"
active_workspace = "dev"

[[workspaces]]
name = "dev"
base_url = "http://localhost:8080"

[workspaces.init]
lua = "ready = true"
"#;
        let config = load_from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.workspaces[0].name, "dev");
        assert!(!config.workspaces[0].init.is_empty());
    }

    #[test]
    fn test_missing_env_var_without_default() {
        let content = "active_workspace: ${COURIER_TEST_DEFINITELY_UNSET_VAR}";
        assert!(load_from_str(content, ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(YAML_CONFIG.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.workspaces.len(), 2);
    }
}
