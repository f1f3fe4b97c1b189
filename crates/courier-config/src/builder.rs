//! Configuration builder

use courier_core::{ScriptBlock, ScriptDefinition, ScriptingConfig, WorkspaceDefinition};

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ScriptingConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workspace
    pub fn workspace(mut self, workspace: WorkspaceDefinition) -> Self {
        self.config.workspaces.push(workspace);
        self
    }

    /// Add a root script
    pub fn script(mut self, script: ScriptDefinition) -> Self {
        self.config.scripts.insert(script.name.clone(), script);
        self
    }

    /// Set the global init body
    pub fn init(mut self, block: ScriptBlock) -> Self {
        self.config.init = block;
        self
    }

    /// Set the global pre-request hook
    pub fn pre_request(mut self, block: ScriptBlock) -> Self {
        self.config.pre_request = block;
        self
    }

    /// Set the global post-response hook
    pub fn post_response(mut self, block: ScriptBlock) -> Self {
        self.config.post_response = block;
        self
    }

    /// Set the active workspace
    pub fn active(mut self, name: impl Into<String>) -> Self {
        self.config.active_workspace = Some(name.into());
        self
    }

    /// Link, validate and return the configuration
    pub fn build(self) -> courier_core::Result<ScriptingConfig> {
        let mut config = self.config;
        config.link();
        crate::validator::validate_config(&config)?;
        Ok(config)
    }
}
