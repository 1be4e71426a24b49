use std::fs;
use std::path::Path;

use serde_json::{Map, Value};

use crate::provider::{Parameter, StackOutput};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Unsupported output file {0}, expected `.json` or `.env`")]
    UnsupportedFormat(String),

    #[error("Unable to write {path}: {message}")]
    WriteError { path: String, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Dotenv,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("env") => Ok(Self::Dotenv),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }
}

pub fn write_outputs(path: &Path, outputs: &[StackOutput]) -> Result<(), Error> {
    let pairs: Vec<(&str, &str)> = outputs
        .iter()
        .map(|output| (output.key.as_str(), output.value.as_str()))
        .collect();
    write_pairs(path, &pairs)
}

pub fn write_parameters(path: &Path, parameters: &[Parameter]) -> Result<(), Error> {
    let pairs: Vec<(&str, &str)> = parameters
        .iter()
        .map(|parameter| (parameter.name.as_str(), parameter.value.as_str()))
        .collect();
    write_pairs(path, &pairs)
}

fn write_pairs(path: &Path, pairs: &[(&str, &str)]) -> Result<(), Error> {
    let file_contents = match OutputFormat::from_path(path)? {
        OutputFormat::Json => to_json(pairs)?,
        OutputFormat::Dotenv => to_dotenv(pairs),
    };

    let write_error = |error: std::io::Error| Error::WriteError {
        path: path.display().to_string(),
        message: error.to_string(),
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(path, file_contents).map_err(write_error)?;

    log::info!("Wrote {} entries to {}", pairs.len(), path.display());
    Ok(())
}

fn to_json(pairs: &[(&str, &str)]) -> Result<String, Error> {
    let contents = pairs.iter().fold(Map::new(), |mut acc, (key, value)| {
        acc.insert((*key).to_owned(), Value::String((*value).to_owned()));
        acc
    });

    serde_json::to_string_pretty(&contents)
        .map_err(|error| Error::SerializationError(error.to_string()))
}

fn to_dotenv(pairs: &[(&str, &str)]) -> String {
    pairs.iter().fold(String::new(), |mut acc, (key, value)| {
        acc.push_str(&format!("{}=\"{}\"\n", env_key(key), escape(value)));
        acc
    })
}

/// `/app/db-host` becomes `APP_DB_HOST`.
fn env_key(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
