use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::{fs, io, path::Path, path::PathBuf};
use validator::{Validate, ValidationError};

use crate::tags::{self, normalize_tags, Tag};

pub const DEFAULT_CONFIG_FILE: &str = "cfn-deployer.yaml";

const TEMPLATE_EXTENSIONS: &[&str] = &["yml", "yaml", "json", "template"];
const OUTPUT_EXTENSIONS: &[&str] = &["json", "env"];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputsFile {
    pub location: PathBuf,
}

/// Template parameter values may be written as plain YAML scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
            Self::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StackEntry {
    #[validate(required)]
    pub stack_name: Option<String>,

    #[validate(custom = "validate_template_file")]
    pub template: PathBuf,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom = "validate_tags")]
    pub tags: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ScalarValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom = "validate_outputs_file")]
    pub outputs: Option<OutputsFile>,
}

impl StackEntry {
    pub fn name(&self) -> &str {
        self.stack_name.as_deref().unwrap_or_default()
    }

    pub fn tags(&self) -> Result<Vec<Tag>, tags::Error> {
        match &self.tags {
            Some(tags) => normalize_tags(tags),
            None => Ok(Vec::new()),
        }
    }

    pub fn parameter_values(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[validate(length(min = 1))]
    pub stacks: Vec<StackEntry>,
}

impl Config {
    pub fn stack(&self, name: &str) -> Option<&StackEntry> {
        self.stacks.iter().find(|entry| entry.name() == name)
    }
}

pub fn parse(path: &Path) -> Result<Config, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    if let Err(error) = config.validate() {
        return Err(Error::ValidationError(error.to_string()));
    }
    for entry in &config.stacks {
        if let Err(error) = entry.validate() {
            return Err(Error::ValidationError(format!("{}: {}", entry.name(), error)));
        }
    }

    let mut seen = Vec::with_capacity(config.stacks.len());
    for entry in &config.stacks {
        if seen.contains(&entry.name()) {
            return Err(Error::ValidationError(format!(
                "stack `{}` is configured more than once",
                entry.name()
            )));
        }
        seen.push(entry.name());
    }

    Ok(config)
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| allowed.contains(&extension))
        .unwrap_or(false)
}

fn validate_template_file(template: &PathBuf) -> Result<(), ValidationError> {
    if !has_extension(template, TEMPLATE_EXTENSIONS) {
        return Err(ValidationError::new(
            "The template location has to end with `.yml`, `.yaml`, `.json` or `.template`",
        ));
    }

    Ok(())
}

fn validate_outputs_file(outputs: &OutputsFile) -> Result<(), ValidationError> {
    if !has_extension(&outputs.location, OUTPUT_EXTENSIONS) {
        return Err(ValidationError::new(
            "The outputs file location has to end with `.json` or `.env`",
        ));
    }

    Ok(())
}

fn validate_tags(tags: &serde_json::Value) -> Result<(), ValidationError> {
    match normalize_tags(tags) {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new(
            "Tags have to be a map or a list of `Key` / `Value` objects",
        )),
    }
}
