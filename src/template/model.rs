//! The template document, as it is read from JSON.
//!
//! Everything is kept close to the document's own shape; checks that need context (argument
//! counts, field ordering, directive parameters) happen during expansion so the error can say where.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::str::FromStr;

use crate::error::TemplateError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Kept loose so a missing or non-integer count is reported as such, not as a JSON type error
    #[serde(default)]
    pub arg_count: Option<Value>,
    #[serde(default)]
    pub messages: Option<Vec<MessageDef>>,
    /// Shorthand for a single message
    #[serde(default)]
    pub segments: Option<Vec<SegmentDef>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDef {
    #[serde(default)]
    pub segments: Vec<SegmentDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub field_count: Option<usize>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,

    // Only meaningful on MSH
    #[serde(default)]
    pub repeat: Option<Value>,
    #[serde(default)]
    pub start: Option<Value>,
    #[serde(default)]
    pub end: Option<Value>,
    #[serde(default)]
    pub inc: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldDef {
    pub id: usize,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub pre: String,
    #[serde(default)]
    pub post: String,
    #[serde(default)]
    pub subfields: Vec<FieldDef>,

    #[serde(default, deserialize_with = "lenient")]
    pub min: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub max: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub dp: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub start: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub datafile: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub store: Option<usize>,
    /// Label to threshold, in document order
    #[serde(default)]
    pub ranges: Map<String, Value>,
    #[serde(default)]
    pub hidden: bool,

    // Form hints for interactive expansion
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(json: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Template {
    /// The number of positional arguments a batch expansion must supply.
    pub fn arg_count(&self) -> Result<usize, TemplateError> {
        self.arg_count
            .as_ref()
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .map(|n| n as usize)
            .ok_or(TemplateError::MissingArgCount)
    }

    /// Each message's segment list, whether the document used `messages` or bare `segments`.
    pub fn message_definitions(&self) -> Result<Vec<&[SegmentDef]>, TemplateError> {
        let defs: Vec<&[SegmentDef]> = match (&self.messages, &self.segments) {
            (Some(messages), _) if !messages.is_empty() => {
                messages.iter().map(|m| m.segments.as_slice()).collect()
            }
            (_, Some(segments)) => vec![segments.as_slice()],
            _ => Vec::new(),
        };

        if defs.is_empty() || defs.iter().any(|segments| segments.is_empty()) {
            return Err(TemplateError::NoSegments);
        }
        Ok(defs)
    }
}

/// Accepts either a JSON number or a string holding one; template authors use both.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
        Some(Value::Number(n)) => n.to_string().parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!(
            "expected a number, found {}",
            other
        ))),
    }
}
