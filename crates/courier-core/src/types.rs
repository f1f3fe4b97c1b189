//! Workspace configuration graph read by the scripting layer

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::language::ScriptLanguage;

/// Script bodies keyed by engine-language tag
///
/// Tags are matched case-insensitively with aliases, so `{ LUA: "..." }` and
/// `{ lua54: "..." }` both target the dynamic engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptBlock(BTreeMap<String, String>);

impl ScriptBlock {
    /// Empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Block with a single body
    pub fn single(tag: impl Into<String>, body: impl Into<String>) -> Self {
        let mut block = Self::new();
        block.insert(tag, body);
        block
    }

    /// Add or replace a body for `tag`
    pub fn insert(&mut self, tag: impl Into<String>, body: impl Into<String>) {
        self.0.insert(tag.into(), body.into());
    }

    /// Builder-style [`ScriptBlock::insert`]
    pub fn with(mut self, tag: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(tag, body);
        self
    }

    /// Body written for `language`, if any
    pub fn body_for(&self, language: ScriptLanguage) -> Option<&str> {
        self.0
            .iter()
            .find(|(tag, body)| language.matches(tag) && !body.trim().is_empty())
            .map(|(_, body)| body.as_str())
    }

    /// First body whose tag names a known engine
    pub fn primary(&self) -> Option<(ScriptLanguage, &str)> {
        self.0.iter().find_map(|(tag, body)| {
            let language = ScriptLanguage::from_tag(tag)?;
            (!body.trim().is_empty()).then_some((language, body.as_str()))
        })
    }

    /// Whether any body targets `language`
    pub fn targets(&self, language: ScriptLanguage) -> bool {
        self.body_for(language).is_some()
    }

    /// Tags that do not name a known engine
    pub fn unknown_tags(&self) -> impl Iterator<Item = &str> {
        self.0
            .keys()
            .filter(|tag| ScriptLanguage::from_tag(tag).is_none())
            .map(String::as_str)
    }

    /// Whether the block holds no bodies
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Declared script or request argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Argument name
    pub name: String,

    /// Type token (`string`, `int`, `Guid`, `T[]`, `Dictionary<string, T>`, ...)
    #[serde(rename = "type", default = "default_type_token")]
    pub type_token: String,

    /// Whether the caller must supply a value
    #[serde(default)]
    pub required: bool,

    /// Value used when the argument is omitted
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn default_type_token() -> String {
    "string".to_string()
}

impl Argument {
    /// Create an optional argument
    pub fn new(name: impl Into<String>, type_token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_token: type_token.into(),
            required: false,
            default: None,
        }
    }

    /// Mark the argument as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set a default value
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// User-authored script attached to a workspace or to the root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    /// Script name (filled from the map key when omitted)
    #[serde(default)]
    pub name: String,

    /// Human readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Body keyed by engine tag
    #[serde(default)]
    pub body: ScriptBlock,

    /// Ordered argument declarations
    #[serde(default)]
    pub arguments: Vec<Argument>,
}

impl ScriptDefinition {
    /// Create a script with a single body
    pub fn new(name: impl Into<String>, tag: &str, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            body: ScriptBlock::single(tag, body),
            arguments: Vec::new(),
        }
    }

    /// Append an argument declaration
    pub fn with_argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }
}

/// Request template owned by a workspace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDefinition {
    /// Request name (filled from the map key when omitted)
    #[serde(default)]
    pub name: String,

    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Endpoint template relative to the workspace base URL
    #[serde(default)]
    pub endpoint: String,

    /// Header templates
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Cookie templates
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,

    /// Query parameter templates
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Payload template
    #[serde(default)]
    pub payload: Option<String>,

    /// Request-level pre-request hook
    #[serde(default)]
    pub pre_request: ScriptBlock,

    /// Request-level post-response hook
    #[serde(default)]
    pub post_response: ScriptBlock,

    /// Ordered argument declarations
    #[serde(default)]
    pub arguments: Vec<Argument>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Workspace definition with optional single-parent inheritance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDefinition {
    /// Workspace name
    pub name: String,

    /// Parent workspace name
    #[serde(default)]
    pub extend: Option<String>,

    /// Resolved parent, set by [`ScriptingConfig::link`]
    #[serde(skip)]
    pub base: Option<String>,

    /// Base URL requests are resolved against
    #[serde(default)]
    pub base_url: Option<String>,

    /// Requests by name
    #[serde(default)]
    pub requests: BTreeMap<String, RequestDefinition>,

    /// Scripts by name
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptDefinition>,

    /// Initialization body, run once per activation, base-first
    #[serde(default)]
    pub init: ScriptBlock,

    /// Workspace-level pre-request hook
    #[serde(default)]
    pub pre_request: ScriptBlock,

    /// Workspace-level post-response hook
    #[serde(default)]
    pub post_response: ScriptBlock,

    /// Free-form properties exposed to scripts
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,

    /// Hidden from listings
    #[serde(default, rename = "hidden")]
    pub is_hidden: bool,
}

impl WorkspaceDefinition {
    /// Create an empty workspace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the parent workspace
    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extend = Some(parent.into());
        self
    }

    /// Whether any body in this workspace targets `language`
    pub fn targets(&self, language: ScriptLanguage) -> bool {
        self.init.targets(language)
            || self.pre_request.targets(language)
            || self.post_response.targets(language)
            || self
                .scripts
                .values()
                .any(|script| matches!(script.body.primary(), Some((l, _)) if l == language))
            || self.requests.values().any(|request| {
                request.pre_request.targets(language) || request.post_response.targets(language)
            })
    }
}

/// Why an inheritance walk stopped before reaching a root workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AncestryHalt {
    /// The walk came back to a workspace it had already visited
    Cycle {
        /// Workspace reached twice
        at: String,
    },
    /// A workspace extends a name that does not exist
    Unresolved {
        /// Workspace holding the dangling reference
        child: String,
        /// Missing parent name
        parent: String,
    },
}

/// Result of walking a workspace's inheritance chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ancestry {
    /// Workspace names, base-first, ending with the start workspace
    pub chain: Vec<String>,
    /// Set when the walk halted on a cycle or a dangling parent
    pub halt: Option<AncestryHalt>,
}

impl Ancestry {
    /// Whether `name` belongs to the chain
    pub fn contains(&self, name: &str) -> bool {
        self.chain.iter().any(|n| n == name)
    }
}

/// Configuration snapshot consumed by the scripting layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Workspaces in document order
    #[serde(default)]
    pub workspaces: Vec<WorkspaceDefinition>,

    /// Root scripts, callable from every workspace
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptDefinition>,

    /// Global initialization body
    #[serde(default)]
    pub init: ScriptBlock,

    /// Global pre-request hook
    #[serde(default)]
    pub pre_request: ScriptBlock,

    /// Global post-response hook
    #[serde(default)]
    pub post_response: ScriptBlock,

    /// Active workspace name
    #[serde(default)]
    pub active_workspace: Option<String>,
}

impl ScriptingConfig {
    /// Look up a workspace by name
    pub fn workspace(&self, name: &str) -> Option<&WorkspaceDefinition> {
        self.workspaces.iter().find(|w| w.name == name)
    }

    /// Fill names from map keys and resolve `extend` into `base`
    ///
    /// Dangling parents leave `base` unset; they are reported later by the
    /// chain builder when the workspace is activated.
    pub fn link(&mut self) {
        for (key, script) in self.scripts.iter_mut() {
            if script.name.is_empty() {
                script.name = key.clone();
            }
        }

        let names: HashSet<String> = self.workspaces.iter().map(|w| w.name.clone()).collect();
        for workspace in &mut self.workspaces {
            workspace.base = workspace
                .extend
                .as_ref()
                .filter(|parent| names.contains(parent.as_str()) && **parent != workspace.name)
                .cloned();

            for (key, script) in workspace.scripts.iter_mut() {
                if script.name.is_empty() {
                    script.name = key.clone();
                }
            }
            for (key, request) in workspace.requests.iter_mut() {
                if request.name.is_empty() {
                    request.name = key.clone();
                }
            }
        }
    }

    /// Walk `name`'s inheritance chain, visiting each workspace at most once
    pub fn ancestry(&self, name: &str) -> Ancestry {
        let mut visited = HashSet::new();
        let mut chain = Vec::new();
        let mut halt = None;
        let mut current = self.workspace(name);

        while let Some(workspace) = current {
            if !visited.insert(workspace.name.as_str()) {
                halt = Some(AncestryHalt::Cycle {
                    at: workspace.name.clone(),
                });
                break;
            }
            chain.push(workspace.name.clone());

            current = match &workspace.extend {
                Some(parent) => match self.workspace(parent) {
                    Some(parent) => Some(parent),
                    None => {
                        halt = Some(AncestryHalt::Unresolved {
                            child: workspace.name.clone(),
                            parent: parent.clone(),
                        });
                        None
                    }
                },
                None => None,
            };
        }

        chain.reverse();
        Ancestry { chain, halt }
    }

    /// Find a request on `workspace` or the nearest ancestor declaring it
    pub fn find_request(
        &self,
        workspace: &str,
        request: &str,
    ) -> Option<(&WorkspaceDefinition, &RequestDefinition)> {
        let ancestry = self.ancestry(workspace);
        ancestry.chain.iter().rev().find_map(|name| {
            let owner = self.workspace(name)?;
            owner.requests.get(request).map(|r| (owner, r))
        })
    }

    /// Whether any global, workspace or root body targets `language`
    ///
    /// With `only` set, workspaces outside that set are ignored.
    pub fn targets(&self, language: ScriptLanguage, only: Option<&Ancestry>) -> bool {
        self.init.targets(language)
            || self.pre_request.targets(language)
            || self.post_response.targets(language)
            || self
                .scripts
                .values()
                .any(|script| matches!(script.body.primary(), Some((l, _)) if l == language))
            || self
                .workspaces
                .iter()
                .filter(|w| only.map_or(true, |a| a.contains(&w.name)))
                .any(|w| w.targets(language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_config() -> ScriptingConfig {
        let mut config = ScriptingConfig {
            workspaces: vec![
                WorkspaceDefinition::new("a").extending("b"),
                WorkspaceDefinition::new("b").extending("c"),
                WorkspaceDefinition::new("c"),
            ],
            ..Default::default()
        };
        config.link();
        config
    }

    #[test]
    fn test_ancestry_is_base_first() {
        let config = chain_config();
        let ancestry = config.ancestry("a");
        assert_eq!(ancestry.chain, vec!["c", "b", "a"]);
        assert!(ancestry.halt.is_none());
        assert_eq!(config.workspace("a").unwrap().base.as_deref(), Some("b"));
    }

    #[test]
    fn test_ancestry_halts_on_cycle() {
        let mut config = ScriptingConfig {
            workspaces: vec![
                WorkspaceDefinition::new("a").extending("b"),
                WorkspaceDefinition::new("b").extending("a"),
            ],
            ..Default::default()
        };
        config.link();

        let ancestry = config.ancestry("a");
        assert_eq!(ancestry.chain, vec!["b", "a"]);
        assert_eq!(ancestry.halt, Some(AncestryHalt::Cycle { at: "a".into() }));
    }

    #[test]
    fn test_ancestry_reports_dangling_parent() {
        let mut config = ScriptingConfig {
            workspaces: vec![WorkspaceDefinition::new("a").extending("ghost")],
            ..Default::default()
        };
        config.link();

        let ancestry = config.ancestry("a");
        assert_eq!(ancestry.chain, vec!["a"]);
        assert!(matches!(
            ancestry.halt,
            Some(AncestryHalt::Unresolved { ref parent, .. }) if parent == "ghost"
        ));
        assert!(config.workspace("a").unwrap().base.is_none());
    }

    #[test]
    fn test_find_request_walks_ancestors() {
        let mut config = chain_config();
        config.workspaces[2].requests.insert(
            "login".into(),
            RequestDefinition {
                endpoint: "/login".into(),
                ..Default::default()
            },
        );
        config.link();

        let (owner, request) = config.find_request("a", "login").unwrap();
        assert_eq!(owner.name, "c");
        assert_eq!(request.name, "login");
        assert!(config.find_request("a", "logout").is_none());
    }

    #[test]
    fn test_script_block_matching() {
        let block = ScriptBlock::new()
            .with("LUA", "return 1")
            .with("native", "1")
            .with("python", "1");

        assert_eq!(block.body_for(ScriptLanguage::Lua), Some("return 1"));
        assert_eq!(block.body_for(ScriptLanguage::Rhai), Some("1"));
        assert_eq!(block.unknown_tags().collect::<Vec<_>>(), vec!["python"]);
        assert!(ScriptBlock::single("lua", "   ").body_for(ScriptLanguage::Lua).is_none());
    }

    #[test]
    fn test_deserialize_workspace() {
        let yaml = r#"
name: staging
extend: base
base_url: https://staging.example.com
pre_request:
  lua: ctx.headers["X-Env"] = "staging"
scripts:
  token:
    body:
      rhai: "\"abc\""
    arguments:
      - name: id
        type: Guid
        required: true
hidden: true
"#;
        let workspace: WorkspaceDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workspace.extend.as_deref(), Some("base"));
        assert!(workspace.is_hidden);
        assert!(workspace.targets(ScriptLanguage::Rhai));
        let token = &workspace.scripts["token"];
        assert_eq!(token.arguments[0].type_token, "Guid");
        assert!(token.arguments[0].required);
    }
}
