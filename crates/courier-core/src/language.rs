//! Script engine language tags

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Engine a script body is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Dynamic, metatable-based engine (Lua)
    Lua,
    /// Native compiled-snippet engine (Rhai)
    Rhai,
}

impl ScriptLanguage {
    /// All engines, in the order their hooks run
    pub const ALL: [ScriptLanguage; 2] = [ScriptLanguage::Rhai, ScriptLanguage::Lua];

    /// Canonical tag for this engine
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Lua => "lua",
            Self::Rhai => "rhai",
        }
    }

    /// Tags accepted for this engine (compared case-insensitively)
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Lua => &["lua", "lua54", "luajit", "dynamic"],
            Self::Rhai => &["rhai", "native"],
        }
    }

    /// Resolve a tag, ignoring case and surrounding whitespace
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        Self::ALL.into_iter().find(|language| {
            language
                .aliases()
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(tag))
        })
    }

    /// Whether `tag` names this engine
    pub fn matches(&self, tag: &str) -> bool {
        Self::from_tag(tag) == Some(*self)
    }
}

impl FromStr for ScriptLanguage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| Error::UnknownLanguage(s.to_string()))
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_case_insensitive() {
        assert_eq!(ScriptLanguage::from_tag("LUA"), Some(ScriptLanguage::Lua));
        assert_eq!(ScriptLanguage::from_tag(" Rhai "), Some(ScriptLanguage::Rhai));
        assert_eq!(ScriptLanguage::from_tag("Native"), Some(ScriptLanguage::Rhai));
        assert_eq!(ScriptLanguage::from_tag("lua54"), Some(ScriptLanguage::Lua));
        assert_eq!(ScriptLanguage::from_tag("python"), None);
    }

    #[test]
    fn test_matches() {
        assert!(ScriptLanguage::Lua.matches("LuaJIT"));
        assert!(!ScriptLanguage::Lua.matches("rhai"));
        assert!("rhai".parse::<ScriptLanguage>().is_ok());
        assert!("csharp".parse::<ScriptLanguage>().is_err());
    }
}
