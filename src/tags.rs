use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("A tags object was provided of an unknown type: {0}")]
    UnknownType(String),

    #[error("A malformed tags object was provided: {0}")]
    MalformedTags(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Accepts either a plain `{name: value}` object or a list of `{Key, Value}`
/// objects. Object keys keep their insertion order.
pub fn normalize_tags(tags: &Value) -> Result<Vec<Tag>, Error> {
    match tags {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                scalar_text(value)
                    .map(|value| Tag::new(key.clone(), value))
                    .ok_or_else(|| Error::MalformedTags(tags.to_string()))
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| tag_from_entry(item).ok_or_else(|| Error::MalformedTags(tags.to_string())))
            .collect(),
        other => Err(Error::UnknownType(other.to_string())),
    }
}

/// Folds tags into a `{name: value}` object; later entries win.
pub fn tags_to_map(tags: &[Tag]) -> Map<String, Value> {
    tags.iter().fold(Map::new(), |mut acc, tag| {
        acc.insert(tag.key.clone(), Value::String(tag.value.clone()));
        acc
    })
}

fn tag_from_entry(entry: &Value) -> Option<Tag> {
    let entry = entry.as_object()?;
    if entry.len() != 2 {
        return None;
    }

    let key = scalar_text(entry.get("Key")?)?;
    let value = scalar_text(entry.get("Value")?)?;
    Some(Tag { key, value })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
