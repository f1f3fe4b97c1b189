//! Argument coercion from loosely-typed host values to declared types
//!
//! Values reach wrappers as JSON (from Lua tables or CLI text). Each declared
//! type token selects a conversion; failures carry a reason and are never
//! defaulted.

use crate::engine::HostValue;
use crate::error::{Result, ScriptError};
use crate::rhai_engine::{json_to_dynamic, EnumValue};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use courier_core::Argument;
use rhai::Dynamic;
use std::collections::HashMap;
use url::Url;
use uuid::Uuid;

/// Parsed form of an argument's type token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeToken {
    /// `T[]` or `List<T>`
    Array(Box<TypeToken>),
    /// `Dictionary<string, T>` or `map`
    Dictionary(Box<TypeToken>),
    /// `DateTime`, `DateTimeOffset`
    DateTime,
    /// `Guid`
    Guid,
    /// `Uri`
    Uri,
    /// `int`, `long`
    Int,
    /// `float`, `double`
    Float,
    /// `bool`
    Bool,
    /// `string`
    String,
    /// Registered enumeration
    Enum(String),
    /// Anything else; values pass through unchanged
    Other(String),
}

impl TypeToken {
    /// Parse a declared token, resolving enumeration names through `enums`
    pub fn parse(token: &str, enums: &EnumRegistry) -> Self {
        let token = token.trim();
        let token = token.strip_prefix("System.").unwrap_or(token);
        let token = token.strip_suffix('?').unwrap_or(token).trim();

        if let Some(inner) = token.strip_suffix("[]") {
            return Self::Array(Box::new(Self::parse(inner, enums)));
        }

        let lower = token.to_ascii_lowercase();
        if let Some(inner) = generic_argument(token, &lower, &["list<", "ienumerable<"]) {
            return Self::Array(Box::new(Self::parse(inner, enums)));
        }
        if let Some(inner) = generic_argument(token, &lower, &["dictionary<", "idictionary<"]) {
            let value = inner.split_once(',').map_or(inner, |(_, v)| v);
            return Self::Dictionary(Box::new(Self::parse(value, enums)));
        }

        match lower.as_str() {
            "map" | "dictionary" | "object{}" => Self::Dictionary(Box::new(Self::Other("any".into()))),
            "datetime" | "datetimeoffset" | "date" => Self::DateTime,
            "guid" | "uuid" => Self::Guid,
            "uri" | "url" => Self::Uri,
            "int" | "int32" | "int64" | "long" | "short" | "integer" => Self::Int,
            "float" | "double" | "single" | "decimal" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            "string" | "str" => Self::String,
            _ => match enums.get(token) {
                Some(definition) => Self::Enum(definition.name.clone()),
                None => Self::Other(token.to_string()),
            },
        }
    }
}

fn generic_argument<'a>(token: &'a str, lower: &str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| {
        if lower.starts_with(prefix) && lower.ends_with('>') {
            Some(token[prefix.len()..token.len() - 1].trim())
        } else {
            None
        }
    })
}

/// Enumeration known to the coercer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDefinition {
    /// Type name as declared in argument tokens
    pub name: String,
    /// Members and their integral values
    pub members: Vec<(String, i64)>,
}

impl EnumDefinition {
    /// Member by name, ignoring case
    pub fn by_name(&self, name: &str) -> Option<&(String, i64)> {
        self.members.iter().find(|(m, _)| m.eq_ignore_ascii_case(name))
    }

    /// Member by integral value
    pub fn by_value(&self, value: i64) -> Option<&(String, i64)> {
        self.members.iter().find(|(_, v)| *v == value)
    }

    fn value_of(&self, member: &(String, i64)) -> EnumValue {
        EnumValue {
            type_name: self.name.clone(),
            member: member.0.clone(),
            value: member.1,
        }
    }
}

/// Enumerations that argument tokens may name
#[derive(Debug, Clone)]
pub struct EnumRegistry {
    enums: HashMap<String, EnumDefinition>,
}

impl EnumRegistry {
    /// Registry without any enumeration
    pub fn empty() -> Self {
        Self {
            enums: HashMap::new(),
        }
    }

    /// Register an enumeration, replacing one with the same name
    pub fn register<S: Into<String>>(&mut self, name: &str, members: impl IntoIterator<Item = (S, i64)>) {
        let definition = EnumDefinition {
            name: name.to_string(),
            members: members.into_iter().map(|(m, v)| (m.into(), v)).collect(),
        };
        self.enums.insert(name.to_ascii_lowercase(), definition);
    }

    /// Look up an enumeration by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&EnumDefinition> {
        self.enums.get(&name.to_ascii_lowercase())
    }
}

impl Default for EnumRegistry {
    /// Registry with the built-in `HttpMethod` enumeration
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "HttpMethod",
            [
                ("Get", 0),
                ("Post", 1),
                ("Put", 2),
                ("Delete", 3),
                ("Patch", 4),
                ("Head", 5),
                ("Options", 6),
            ],
        );
        registry
    }
}

/// A value converted to its declared type
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    /// Unchanged or primitive value
    Json(HostValue),
    /// Parsed `Guid`
    Guid(Uuid),
    /// Parsed `DateTime`
    DateTime(DateTime<FixedOffset>),
    /// Parsed `Uri`
    Uri(Url),
    /// Enumeration member
    Enum(EnumValue),
    /// Typed array
    Array(Vec<Coerced>),
    /// String-keyed dictionary
    Map(Vec<(String, Coerced)>),
}

impl Coerced {
    /// Convert into a native-engine value
    pub fn into_dynamic(self) -> Result<Dynamic> {
        Ok(match self {
            Self::Json(value) => json_to_dynamic(&value)?,
            Self::Guid(guid) => Dynamic::from(guid),
            Self::DateTime(date) => Dynamic::from(date),
            Self::Uri(url) => Dynamic::from(url),
            Self::Enum(member) => Dynamic::from(member),
            Self::Array(items) => Dynamic::from_array(
                items
                    .into_iter()
                    .map(Coerced::into_dynamic)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Map(entries) => {
                let mut map = rhai::Map::new();
                for (key, value) in entries {
                    map.insert(key.into(), value.into_dynamic()?);
                }
                Dynamic::from_map(map)
            }
        })
    }

    /// Convert into a host value; typed scalars become their canonical text
    pub fn into_json(self) -> HostValue {
        match self {
            Self::Json(value) => value,
            Self::Guid(guid) => HostValue::String(guid.to_string()),
            Self::DateTime(date) => HostValue::String(date.to_rfc3339()),
            Self::Uri(url) => HostValue::String(url.to_string()),
            Self::Enum(member) => HostValue::String(member.member),
            Self::Array(items) => HostValue::Array(items.into_iter().map(Coerced::into_json).collect()),
            Self::Map(entries) => HostValue::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
        }
    }
}

/// Convert `value` to `token`, or explain why it cannot be
pub fn coerce(value: &HostValue, token: &TypeToken, enums: &EnumRegistry) -> std::result::Result<Coerced, String> {
    match token {
        TypeToken::Array(inner) => {
            let items = match value {
                HostValue::Array(items) => items.clone(),
                HostValue::String(text) => split_array_text(text)?,
                other => return Err(format!("expected an array, got {}", kind_of(other))),
            };
            items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    coerce(item, inner, enums).map_err(|reason| format!("element {index}: {reason}"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Coerced::Array)
        }
        TypeToken::Dictionary(inner) => {
            let map = match value {
                HostValue::Object(map) => map.clone(),
                HostValue::String(text) => match serde_json::from_str::<HostValue>(text) {
                    Ok(HostValue::Object(map)) => map,
                    Ok(other) => return Err(format!("expected an object literal, got {}", kind_of(&other))),
                    Err(e) => return Err(format!("invalid object literal: {e}")),
                },
                other => return Err(format!("expected an object, got {}", kind_of(other))),
            };
            map.iter()
                .map(|(key, item)| {
                    coerce(item, inner, enums)
                        .map(|c| (key.clone(), c))
                        .map_err(|reason| format!("key '{key}': {reason}"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Coerced::Map)
        }
        TypeToken::DateTime => parse_date(expect_text(value)?).map(Coerced::DateTime),
        TypeToken::Guid => Uuid::parse_str(expect_text(value)?.trim())
            .map(Coerced::Guid)
            .map_err(|e| e.to_string()),
        TypeToken::Uri => Url::parse(expect_text(value)?.trim())
            .map(Coerced::Uri)
            .map_err(|e| e.to_string()),
        TypeToken::Enum(name) => {
            let definition = enums
                .get(name)
                .ok_or_else(|| format!("enumeration '{name}' is not registered"))?;
            coerce_enum(value, definition).map(Coerced::Enum)
        }
        TypeToken::Int => match value {
            HostValue::String(text) => text
                .trim()
                .parse::<i64>()
                .map(|i| Coerced::Json(HostValue::from(i)))
                .map_err(|e| format!("not an integer: {e}")),
            other => Ok(Coerced::Json(other.clone())),
        },
        TypeToken::Float => match value {
            HostValue::String(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("not a number: {e}"))
                .and_then(|f| {
                    serde_json::Number::from_f64(f)
                        .map(|n| Coerced::Json(HostValue::Number(n)))
                        .ok_or_else(|| "not a finite number".to_string())
                }),
            other => Ok(Coerced::Json(other.clone())),
        },
        TypeToken::Bool => match value {
            HostValue::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Coerced::Json(HostValue::Bool(true))),
                "false" | "0" | "no" => Ok(Coerced::Json(HostValue::Bool(false))),
                _ => Err("not a boolean".to_string()),
            },
            other => Ok(Coerced::Json(other.clone())),
        },
        TypeToken::String | TypeToken::Other(_) => Ok(Coerced::Json(value.clone())),
    }
}

fn coerce_enum(value: &HostValue, definition: &EnumDefinition) -> std::result::Result<EnumValue, String> {
    let integral = match value {
        HostValue::Number(n) => n.as_i64(),
        HostValue::String(text) => {
            if let Some(member) = definition.by_name(text.trim()) {
                return Ok(definition.value_of(member));
            }
            text.trim().parse::<i64>().ok()
        }
        _ => None,
    };

    match integral {
        Some(number) => Ok(match definition.by_value(number) {
            Some(member) => definition.value_of(member),
            None => EnumValue {
                type_name: definition.name.clone(),
                member: number.to_string(),
                value: number,
            },
        }),
        None => Err(format!("not a member of {}", definition.name)),
    }
}

fn expect_text(value: &HostValue) -> std::result::Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected text, got {}", kind_of(value)))
}

fn split_array_text(text: &str) -> std::result::Result<Vec<HostValue>, String> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        if let Ok(HostValue::Array(items)) = serde_json::from_str::<HostValue>(trimmed) {
            return Ok(items);
        }
    }
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(trimmed
        .split(',')
        .map(|part| HostValue::String(part.trim().to_string()))
        .collect())
}

fn parse_date(text: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Ok(date);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).fixed_offset())
        .ok_or_else(|| format!("'{text}' is not a recognized date"))
}

fn kind_of(value: &HostValue) -> &'static str {
    match value {
        HostValue::Null => "null",
        HostValue::Bool(_) => "a boolean",
        HostValue::Number(_) => "a number",
        HostValue::String(_) => "text",
        HostValue::Array(_) => "an array",
        HostValue::Object(_) => "an object",
    }
}

/// Bind positional values to declared arguments
///
/// Missing (or null) positions take the declared default, coerced like a
/// supplied value, or fail when the argument is required. Extra values are
/// appended unchanged.
pub fn bind_arguments(
    wrapper: &str,
    arguments: &[Argument],
    supplied: Vec<HostValue>,
    enums: &EnumRegistry,
) -> Result<Vec<Coerced>> {
    let mut supplied = supplied.into_iter();
    let mut bound = Vec::with_capacity(arguments.len());

    for argument in arguments {
        let token = TypeToken::parse(&argument.type_token, enums);
        let value = match supplied.next().filter(|v| !v.is_null()) {
            Some(value) => value,
            None => match &argument.default {
                Some(default) => default.clone(),
                None if argument.required => {
                    return Err(conversion_error(wrapper, argument, &HostValue::Null, "required argument is missing"))
                }
                None => {
                    bound.push(Coerced::Json(HostValue::Null));
                    continue;
                }
            },
        };

        let coerced =
            coerce(&value, &token, enums).map_err(|reason| conversion_error(wrapper, argument, &value, reason))?;
        bound.push(coerced);
    }

    bound.extend(supplied.map(Coerced::Json));
    Ok(bound)
}

fn conversion_error(wrapper: &str, argument: &Argument, value: &HostValue, reason: impl Into<String>) -> ScriptError {
    ScriptError::Conversion {
        wrapper: wrapper.to_string(),
        argument: argument.name.clone(),
        value: value.to_string(),
        target: argument.type_token.clone(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use proptest::prelude::*;
    use serde_json::json;

    fn token(text: &str) -> TypeToken {
        TypeToken::parse(text, &EnumRegistry::default())
    }

    fn convert(value: HostValue, text: &str) -> std::result::Result<Coerced, String> {
        coerce(&value, &token(text), &EnumRegistry::default())
    }

    #[test]
    fn test_token_parsing() {
        assert_eq!(token("Guid"), TypeToken::Guid);
        assert_eq!(token("System.Guid?"), TypeToken::Guid);
        assert_eq!(token("int[]"), TypeToken::Array(Box::new(TypeToken::Int)));
        assert_eq!(token("List<Uri>"), TypeToken::Array(Box::new(TypeToken::Uri)));
        assert_eq!(
            token("Dictionary<string, DateTime>"),
            TypeToken::Dictionary(Box::new(TypeToken::DateTime))
        );
        assert_eq!(token("httpmethod"), TypeToken::Enum("HttpMethod".into()));
        assert_eq!(token("Widget"), TypeToken::Other("Widget".into()));
    }

    #[test]
    fn test_array_from_json_literal_or_commas() {
        assert_eq!(
            convert(json!("[1, 2]"), "int[]").unwrap().into_json(),
            json!([1, 2])
        );
        assert_eq!(
            convert(json!("3, 4 ,5"), "long[]").unwrap().into_json(),
            json!([3, 4, 5])
        );
        assert_eq!(convert(json!(""), "string[]").unwrap().into_json(), json!([]));
        assert!(convert(json!("1,x"), "int[]").unwrap_err().contains("element 1"));
    }

    #[test]
    fn test_dictionary_from_object_literal() {
        let coerced = convert(json!(r#"{"a": "1", "b": "2"}"#), "Dictionary<string, int>").unwrap();
        assert_eq!(coerced.into_json(), json!({"a": 1, "b": 2}));
        assert!(convert(json!("[1]"), "map").is_err());
    }

    #[test]
    fn test_dates() {
        let Coerced::DateTime(date) = convert(json!("2024-03-01T10:30:00+02:00"), "DateTimeOffset").unwrap() else {
            panic!("expected a date");
        };
        assert_eq!(date.offset().local_minus_utc(), 7200);

        let Coerced::DateTime(date) = convert(json!("2024-03-01"), "DateTime").unwrap() else {
            panic!("expected a date");
        };
        assert_eq!((date.year(), date.month(), date.day(), date.hour()), (2024, 3, 1, 0));

        assert!(convert(json!("yesterday"), "DateTime").is_err());
    }

    #[test]
    fn test_enum_by_name_or_value() {
        let Coerced::Enum(member) = convert(json!("post"), "HttpMethod").unwrap() else {
            panic!("expected an enum");
        };
        assert_eq!((member.member.as_str(), member.value), ("Post", 1));

        let Coerced::Enum(member) = convert(json!(3), "HttpMethod").unwrap() else {
            panic!("expected an enum");
        };
        assert_eq!(member.member, "Delete");

        assert!(convert(json!("teleport"), "HttpMethod").is_err());
    }

    #[test]
    fn test_other_tokens_pass_through() {
        assert_eq!(convert(json!({"x": 1}), "Widget").unwrap(), Coerced::Json(json!({"x": 1})));
        assert_eq!(convert(json!(7), "string").unwrap(), Coerced::Json(json!(7)));
        assert_eq!(convert(json!(true), "int").unwrap(), Coerced::Json(json!(true)));
    }

    #[test]
    fn test_bind_arguments() {
        let arguments = vec![
            Argument::new("id", "Guid").required(),
            Argument::new("method", "HttpMethod").with_default(json!("get")),
            Argument::new("note", "string"),
        ];
        let enums = EnumRegistry::default();

        let bound = bind_arguments(
            "lookup",
            &arguments,
            vec![json!("6f9619ff-8b86-d011-b42d-00cf4fc964ff")],
            &enums,
        )
        .unwrap();
        assert_eq!(bound.len(), 3);
        assert!(matches!(&bound[1], Coerced::Enum(m) if m.member == "Get"));
        assert_eq!(bound[2], Coerced::Json(HostValue::Null));

        let err = bind_arguments("lookup", &arguments, vec![], &enums).unwrap_err();
        assert!(matches!(err, ScriptError::Conversion { ref argument, .. } if argument == "id"));

        let err = bind_arguments("lookup", &arguments, vec![json!("nope")], &enums).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("'lookup'") && text.contains("\"nope\"") && text.contains("Guid"));
    }

    #[test]
    fn test_into_dynamic_keeps_registered_types() {
        let dynamic = convert(json!("6f9619ff-8b86-d011-b42d-00cf4fc964ff"), "Guid")
            .unwrap()
            .into_dynamic()
            .unwrap();
        assert!(dynamic.is::<Uuid>());

        let dynamic = convert(json!("a,b"), "string[]").unwrap().into_dynamic().unwrap();
        assert!(dynamic.is_array());
    }

    proptest! {
        #[test]
        fn prop_integer_text_parses(n in any::<i64>()) {
            prop_assert_eq!(convert(json!(n.to_string()), "long").unwrap(), Coerced::Json(json!(n)));
        }

        #[test]
        fn prop_guid_text_parses(bytes in any::<[u8; 16]>()) {
            let guid = Uuid::from_bytes(bytes);
            prop_assert_eq!(convert(json!(guid.to_string()), "Guid").unwrap(), Coerced::Guid(guid));
        }

        #[test]
        fn prop_comma_list_keeps_order(items in proptest::collection::vec(any::<i32>(), 1..8)) {
            let text = items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
            let expected: Vec<HostValue> = items.iter().map(|i| json!(i)).collect();
            prop_assert_eq!(convert(json!(text), "int[]").unwrap().into_json(), HostValue::Array(expected));
        }
    }
}
