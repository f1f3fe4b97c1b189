//! Environment toggles for the scripting runtime

use serde::{Deserialize, Serialize};

/// Verbose step tracing
pub const ENV_TRACE: &str = "COURIER_SCRIPT_TRACE";
/// Initialize the native engine even when no body targets it
pub const ENV_FORCE_NATIVE: &str = "COURIER_FORCE_NATIVE";
/// Only project the active workspace and its ancestors
pub const ENV_ACTIVE_ONLY: &str = "COURIER_PROJECT_ACTIVE_ONLY";
/// Operation budget for a single native-engine call
pub const ENV_MAX_OPERATIONS: &str = "COURIER_NATIVE_MAX_OPERATIONS";

/// Runtime toggles read by the script orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptingSettings {
    /// Log every orchestration step at `debug` instead of `trace`
    #[serde(default)]
    pub trace_steps: bool,

    /// Initialize the native engine even when nothing targets it
    #[serde(default)]
    pub force_native: bool,

    /// Restrict projection to the active workspace and its ancestors
    #[serde(default)]
    pub limit_to_active_chain: bool,

    /// Operation budget for one native call (0 = unlimited)
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
}

fn default_max_operations() -> u64 {
    1_000_000
}

impl Default for ScriptingSettings {
    fn default() -> Self {
        Self {
            trace_steps: false,
            force_native: false,
            limit_to_active_chain: false,
            max_operations: default_max_operations(),
        }
    }
}

impl ScriptingSettings {
    /// Read toggles from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read toggles through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| parse_flag(&v)).unwrap_or(false);

        let max_operations = match lookup(ENV_MAX_OPERATIONS) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_MAX_OPERATIONS);
                default_max_operations()
            }),
            None => default_max_operations(),
        };

        Self {
            trace_steps: flag(ENV_TRACE),
            force_native: flag(ENV_FORCE_NATIVE),
            limit_to_active_chain: flag(ENV_ACTIVE_ONLY),
            max_operations,
        }
    }

    /// Enable step tracing
    pub fn with_trace_steps(mut self) -> Self {
        self.trace_steps = true;
        self
    }

    /// Force native-engine initialization
    pub fn with_force_native(mut self) -> Self {
        self.force_native = true;
        self
    }

    /// Limit projection to the active chain
    pub fn with_active_chain_only(mut self) -> Self {
        self.limit_to_active_chain = true;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_env() {
        let settings = ScriptingSettings::from_lookup(|_| None);
        assert_eq!(settings, ScriptingSettings::default());
    }

    #[test]
    fn test_flags_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_TRACE, "TRUE"),
            (ENV_FORCE_NATIVE, "1"),
            (ENV_ACTIVE_ONLY, "no"),
            (ENV_MAX_OPERATIONS, "5000"),
        ]
        .into_iter()
        .collect();

        let settings = ScriptingSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(settings.trace_steps);
        assert!(settings.force_native);
        assert!(!settings.limit_to_active_chain);
        assert_eq!(settings.max_operations, 5000);
    }

    #[test]
    fn test_invalid_budget_falls_back() {
        let settings = ScriptingSettings::from_lookup(|k| {
            (k == ENV_MAX_OPERATIONS).then(|| "lots".to_string())
        });
        assert_eq!(settings.max_operations, 1_000_000);
    }
}
