//! Configuration validation
//!
//! Only structural problems that make the graph ambiguous are rejected.
//! Dangling parents and unknown language tags are logged here and reported
//! again by the scripting layer when the affected workspace is activated.

use courier_core::{Error, Result, ScriptLanguage, ScriptingConfig};
use std::collections::HashSet;

/// Validate configuration
pub fn validate_config(config: &ScriptingConfig) -> Result<()> {
    validate_workspaces(config)?;
    validate_scripts(config)?;
    validate_active(config);

    Ok(())
}

fn validate_workspaces(config: &ScriptingConfig) -> Result<()> {
    let mut seen = HashSet::new();

    for workspace in &config.workspaces {
        if workspace.name.trim().is_empty() {
            return Err(Error::Config("workspace name cannot be empty".to_string()));
        }

        if !seen.insert(workspace.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate workspace name: {}",
                workspace.name
            )));
        }

        if let Some(parent) = &workspace.extend {
            if config.workspace(parent).is_none() {
                tracing::warn!(
                    workspace = %workspace.name,
                    parent = %parent,
                    "Workspace extends an unknown workspace"
                );
            }
        }

        for tag in workspace
            .init
            .unknown_tags()
            .chain(workspace.pre_request.unknown_tags())
            .chain(workspace.post_response.unknown_tags())
        {
            tracing::warn!(workspace = %workspace.name, tag, "Unknown script language tag");
        }

        for (name, request) in &workspace.requests {
            if request.endpoint.is_empty() {
                tracing::debug!(workspace = %workspace.name, request = %name, "Request has no endpoint");
            }
            validate_arguments(&request.arguments, name)?;
        }
    }

    Ok(())
}

fn validate_scripts(config: &ScriptingConfig) -> Result<()> {
    let root = config.scripts.iter();
    let nested = config.workspaces.iter().flat_map(|w| w.scripts.iter());

    for (name, script) in root.chain(nested) {
        if name.trim().is_empty() {
            return Err(Error::Config("script name cannot be empty".to_string()));
        }

        if script.body.primary().is_none() {
            tracing::warn!(
                script = %name,
                known = ?ScriptLanguage::ALL,
                "Script has no body for a known engine"
            );
        }

        validate_arguments(&script.arguments, name)?;
    }

    Ok(())
}

fn validate_arguments(arguments: &[courier_core::Argument], owner: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for argument in arguments {
        if argument.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "Argument name cannot be empty (in '{owner}')"
            )));
        }
        if argument.type_token.trim().is_empty() {
            return Err(Error::Config(format!(
                "Argument '{}' of '{owner}' has an empty type",
                argument.name
            )));
        }
        if !seen.insert(argument.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate argument '{}' in '{owner}'",
                argument.name
            )));
        }
    }
    Ok(())
}

fn validate_active(config: &ScriptingConfig) {
    if let Some(active) = &config.active_workspace {
        if config.workspace(active).is_none() {
            tracing::warn!(workspace = %active, "Active workspace is not defined");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Argument, ScriptDefinition, WorkspaceDefinition};

    fn minimal_config() -> ScriptingConfig {
        let mut config = ScriptingConfig {
            workspaces: vec![
                WorkspaceDefinition::new("base"),
                WorkspaceDefinition::new("staging").extending("base"),
            ],
            active_workspace: Some("staging".into()),
            ..Default::default()
        };
        config.link();
        config
    }

    #[test]
    fn test_valid_minimal_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_duplicate_workspace() {
        let mut config = minimal_config();
        config.workspaces.push(WorkspaceDefinition::new("base"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_workspace_name() {
        let mut config = minimal_config();
        config.workspaces.push(WorkspaceDefinition::new(" "));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_dangling_parent_is_not_fatal() {
        let mut config = minimal_config();
        config
            .workspaces
            .push(WorkspaceDefinition::new("orphan").extending("missing"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_duplicate_argument() {
        let mut config = minimal_config();
        config.scripts.insert(
            "sum".into(),
            ScriptDefinition::new("sum", "rhai", "a + b")
                .with_argument(Argument::new("a", "int"))
                .with_argument(Argument::new("a", "int")),
        );
        assert!(validate_config(&config).is_err());
    }
}
