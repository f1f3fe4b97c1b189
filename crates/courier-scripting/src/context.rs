//! Hook contexts exposed to pre-request and post-response scripts

use crate::engine::{render_text, HostValue};
use crate::error::{Result, ScriptError};
use courier_core::RequestDefinition;
use serde_json::json;
use std::collections::BTreeMap;

/// Outgoing request state handed to pre-request hooks
///
/// Hooks receive it as `ctx` (dynamic engine) or `this` (native engine) and
/// may change headers, parameters, cookies and the payload in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreRequestContext {
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Query or form parameters
    pub parameters: BTreeMap<String, String>,
    /// Cookies
    pub cookies: BTreeMap<String, String>,
    /// Request payload
    pub payload: Option<String>,
    /// Extra positional arguments from the caller
    pub args: Vec<HostValue>,
}

impl PreRequestContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from a request definition
    pub fn from_request(request: &RequestDefinition) -> Self {
        Self {
            headers: request.headers.clone(),
            parameters: request.parameters.clone(),
            cookies: request.cookies.clone(),
            payload: request.payload.clone(),
            args: Vec::new(),
        }
    }

    /// Set a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Host value handed to hooks
    pub fn to_host(&self) -> HostValue {
        json!({
            "headers": self.headers,
            "parameters": self.parameters,
            "cookies": self.cookies,
            "payload": self.payload,
            "args": self.args,
        })
    }

    /// Copy a hook's modifications back
    ///
    /// Missing sections are left as they were; a null payload clears it.
    pub fn apply_host(&mut self, value: &HostValue) -> Result<()> {
        let object = value
            .as_object()
            .ok_or_else(|| ScriptError::type_error("pre-request context must stay a table"))?;

        if let Some(headers) = object.get("headers") {
            self.headers = text_map("headers", headers)?;
        }
        if let Some(parameters) = object.get("parameters") {
            self.parameters = text_map("parameters", parameters)?;
        }
        if let Some(cookies) = object.get("cookies") {
            self.cookies = text_map("cookies", cookies)?;
        }
        self.payload = match object.get("payload") {
            None | Some(HostValue::Null) => None,
            Some(payload) => Some(render_text(payload)),
        };
        Ok(())
    }
}

/// Received response handed to post-response hooks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostResponseContext {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body as received
    pub body: String,
    /// Extra positional arguments from the caller
    pub args: Vec<HostValue>,
}

impl PostResponseContext {
    /// Create a context for `body` with status 200
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            ..Self::default()
        }
    }

    /// Set the status code
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parse the body as JSON
    pub fn body_json(&self) -> Result<HostValue> {
        serde_json::from_str(&self.body).map_err(|e| ScriptError::type_error(format!("response body is not JSON: {e}")))
    }

    /// Host value handed to hooks
    pub fn to_host(&self) -> HostValue {
        json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
            "args": self.args,
        })
    }
}

fn text_map(section: &str, value: &HostValue) -> Result<BTreeMap<String, String>> {
    match value {
        HostValue::Object(map) => Ok(map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), render_text(v)))
            .collect()),
        // An emptied Lua table has no way to say it was an object
        HostValue::Array(items) if items.is_empty() => Ok(BTreeMap::new()),
        other => Err(ScriptError::type_error(format!(
            "context field '{section}' must be a table, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_host_updates_fields() {
        let mut ctx = PreRequestContext::new()
            .with_header("Accept", "application/json")
            .with_payload("{}");

        let mut host = ctx.to_host();
        host["headers"]["X-Trace"] = json!(42);
        host["parameters"] = json!({"page": "2"});
        host["payload"] = HostValue::Null;

        ctx.apply_host(&host).unwrap();
        assert_eq!(ctx.headers["X-Trace"], "42");
        assert_eq!(ctx.headers["Accept"], "application/json");
        assert_eq!(ctx.parameters["page"], "2");
        assert_eq!(ctx.payload, None);
    }

    #[test]
    fn test_apply_host_rejects_non_table() {
        let mut ctx = PreRequestContext::new();
        assert!(ctx.apply_host(&json!("nope")).is_err());
        assert!(ctx.apply_host(&json!({"headers": 5})).is_err());
    }

    #[test]
    fn test_from_request_copies_definition() {
        let mut request = RequestDefinition::default();
        request.headers.insert("Authorization".into(), "Bearer x".into());
        request.payload = Some("body".into());

        let ctx = PreRequestContext::from_request(&request);
        assert_eq!(ctx.headers["Authorization"], "Bearer x");
        assert_eq!(ctx.payload.as_deref(), Some("body"));
    }

    #[test]
    fn test_post_context() {
        let ctx = PostResponseContext::new(r#"{"ok":true}"#).with_status(201);
        assert_eq!(ctx.body_json().unwrap(), json!({"ok": true}));
        assert_eq!(ctx.to_host()["status"], json!(201));
        assert!(PostResponseContext::new("plain").body_json().is_err());
    }
}
