//! Script execution error types

use std::fmt;

/// Script execution result type
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Script execution error
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// Script compilation/parsing error
    #[error("Script compilation error in {origin}: {message}")]
    Compilation {
        /// Where the body came from (engine, workspace, wrapper)
        origin: String,
        /// Engine diagnostic text
        message: String,
    },

    /// Script runtime error
    #[error("Script runtime error in {origin}: {message}")]
    Runtime {
        /// Where the body came from (engine, workspace, wrapper)
        origin: String,
        /// Engine diagnostic text
        message: String,
    },

    /// Argument could not be converted to its declared type
    #[error("Wrapper '{wrapper}' cannot convert argument '{argument}' value {value} to {target}: {reason}")]
    Conversion {
        /// Wrapper or script being called
        wrapper: String,
        /// Declared argument name
        argument: String,
        /// Offending value, as text
        value: String,
        /// Declared type token
        target: String,
        /// Why the conversion failed
        reason: String,
    },

    /// Script not found in the workspace chain or the root scripts
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// Workspace not found
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// Request shim invoked before an executor was registered
    #[error("No request executor registered: the '{0}' bridge is missing")]
    MissingExecutor(String),

    /// Orchestrator used before `initialize`
    #[error("Script orchestrator is not initialized")]
    NotInitialized,

    /// Native engine required but not initialized
    #[error("Native engine is not initialized")]
    NativeUnavailable,

    /// Cross-engine bridge failure
    #[error("Cross-engine bridge error: {0}")]
    Bridge(String),

    /// Type conversion error between host and engine values
    #[error("Script type error: {0}")]
    TypeError(String),
}

impl ScriptError {
    /// Create a compilation error
    pub fn compilation(origin: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::Compilation {
            origin: origin.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a runtime error
    pub fn runtime(origin: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::Runtime {
            origin: origin.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a type error
    pub fn type_error(message: impl fmt::Display) -> Self {
        Self::TypeError(message.to_string())
    }

    /// Prefix the origin of engine errors with `context`, leaving the cause intact
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::Compilation { origin, message } => Self::Compilation {
                origin: format!("{context} ({origin})"),
                message,
            },
            Self::Runtime { origin, message } => Self::Runtime {
                origin: format!("{context} ({origin})"),
                message,
            },
            other => other,
        }
    }

    /// Engine diagnostic text, when the error came from an engine
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Self::Compilation { message, .. } | Self::Runtime { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for ScriptError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        if let rhai::EvalAltResult::ErrorParsing(parse, _) = err.as_ref() {
            return Self::compilation("rhai", parse);
        }
        Self::runtime("rhai", err)
    }
}

impl From<rhai::ParseError> for ScriptError {
    fn from(err: rhai::ParseError) -> Self {
        Self::compilation("rhai", err)
    }
}

impl From<mlua::Error> for ScriptError {
    fn from(err: mlua::Error) -> Self {
        if let Some(inner) = find_script_error(&err) {
            return inner;
        }
        match err {
            mlua::Error::SyntaxError { message, .. } => Self::compilation("lua", message),
            other => Self::runtime("lua", other),
        }
    }
}

/// Recover a [`ScriptError`] raised from a host callback and carried through Lua
fn find_script_error(err: &mlua::Error) -> Option<ScriptError> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<ScriptError>().cloned(),
        mlua::Error::CallbackError { cause, .. } => find_script_error(cause),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_context_keeps_cause() {
        let err = ScriptError::runtime("lua", "attempt to index a nil value")
            .with_context("workspace 'staging' pre-request");
        assert_eq!(err.engine_message(), Some("attempt to index a nil value"));
        assert!(err.to_string().contains("workspace 'staging' pre-request (lua)"));
    }

    #[test]
    fn test_conversion_names_wrapper_and_value() {
        let err = ScriptError::Conversion {
            wrapper: "lookup".into(),
            argument: "id".into(),
            value: "\"nope\"".into(),
            target: "Guid".into(),
            reason: "invalid character".into(),
        };
        let text = err.to_string();
        assert!(text.contains("'lookup'"));
        assert!(text.contains("\"nope\""));
        assert!(text.contains("Guid"));
    }

    #[test]
    fn test_script_error_survives_lua_callback() {
        let original = ScriptError::MissingExecutor("request executor".into());
        let wrapped = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: std::sync::Arc::new(mlua::Error::external(original)),
        };
        assert!(matches!(
            ScriptError::from(wrapped),
            ScriptError::MissingExecutor(_)
        ));
    }
}
