//! Bulk management of SSM parameters: definition normalisation plus retried,
//! strictly sequential create / upsert / delete calls.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::backoff::{self, format_delay, schedule_with_backoff, BackoffAttempt, BackoffPolicy, Probe};
use crate::provider::{
    FetchedParameters, Parameter, ParameterService, ParameterType, ProviderError,
    PutParameterRequest,
};
use crate::tags::{self, normalize_tags, tags_to_map, Tag};

/// 0.5s initial delay, 50 attempts, never more than 30s between attempts.
pub const WRITE_POLICY: BackoffPolicy = match BackoffPolicy::new(500, 50, 30_000) {
    Ok(policy) => policy,
    Err(_) => panic!("invalid parameter write policy"),
};

/// DeleteParameters and GetParameters accept at most 10 names per call.
pub const BULK_CHUNK_SIZE: usize = 10;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Invalid Parameter Definition ({key}) must be either a string or an object defining the parameter: {reason}")]
    InvalidDefinition { key: String, reason: String },

    #[error(transparent)]
    MalformedTags(#[from] tags::Error),

    #[error("Parameter ({name}) already exists and cannot be created, try using upsert instead.")]
    AlreadyExists { name: String, source: ProviderError },

    #[error("Parameter ({0}) not found")]
    NotFound(String),

    #[error("Gave up on parameter ({target}) after {attempts} attempts (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    RetriesExhausted {
        target: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The object form of a definition; the string form is shorthand for `{value}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionObject {
    value: Value,
    #[serde(rename = "type")]
    parameter_type: Option<ParameterType>,
    name: Option<String>,
    overwrite: Option<bool>,
    description: Option<String>,
    tags: Option<Value>,
}

/// Turns `{key: "value" | {value, type, name, overwrite, description, tags}}`
/// into put-parameter payloads, keeping the definitions' order.
pub fn definitions_to_requests(
    definitions: &Map<String, Value>,
    overwrite: bool,
    tags: &[Tag],
) -> Result<Vec<PutParameterRequest>, Error> {
    definitions
        .iter()
        .map(|(key, definition)| definition_to_request(key, definition, overwrite, tags))
        .collect()
}

fn definition_to_request(
    key: &str,
    definition: &Value,
    overwrite: bool,
    tags: &[Tag],
) -> Result<PutParameterRequest, Error> {
    let invalid = |reason: String| Error::InvalidDefinition {
        key: key.to_owned(),
        reason,
    };

    let request = match definition {
        Value::String(value) => PutParameterRequest {
            name: key.to_owned(),
            value: value.clone(),
            parameter_type: ParameterType::String,
            description: String::new(),
            overwrite,
            tags: tags.to_vec(),
        },
        Value::Object(_) => {
            let object: DefinitionObject =
                serde_json::from_value(definition.clone()).map_err(|e| invalid(e.to_string()))?;

            let mut merged = tags_to_map(tags);
            if let Some(own_tags) = &object.tags {
                merged.extend(tags_to_map(&normalize_tags(own_tags)?));
            }

            PutParameterRequest {
                name: object.name.unwrap_or_else(|| key.to_owned()),
                value: definition_value(&object.value).map_err(invalid)?,
                parameter_type: object.parameter_type.unwrap_or_default(),
                description: object.description.unwrap_or_default(),
                overwrite: object.overwrite.unwrap_or(overwrite),
                tags: normalize_tags(&Value::Object(merged))?,
            }
        }
        other => return Err(invalid(format!("got {other}"))),
    };

    if request.name.is_empty() {
        return Err(invalid(String::from("parameter name is empty")));
    }
    Ok(request)
}

/// Scalars are used as-is; a list becomes the comma separated StringList form.
fn definition_value(value: &Value) -> Result<String, String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(_) | Value::Object(_) | Value::Null => {
                    Err(format!("list values must be scalars, got {item}"))
                }
                scalar => definition_value(scalar),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|items| items.join(",")),
        Value::Null | Value::Object(_) => Err(format!("unsupported value {value}")),
    }
}

pub struct ParameterStore<P> {
    service: P,
    policy: BackoffPolicy,
}

impl<P: ParameterService> ParameterStore<P> {
    pub fn new(service: P) -> Self {
        Self::with_policy(service, WRITE_POLICY)
    }

    pub fn with_policy(service: P, policy: BackoffPolicy) -> Self {
        Self { service, policy }
    }

    pub fn service(&self) -> &P {
        &self.service
    }

    /// Creates every parameter, one at a time and in order. Fails with
    /// [`Error::AlreadyExists`] on the first parameter that already exists;
    /// parameters written before it are left in place.
    pub async fn create(
        &self,
        definitions: &Map<String, Value>,
        tags: &[Tag],
    ) -> Result<Vec<String>, Error> {
        let requests = definitions_to_requests(definitions, false, tags)?;

        let mut written = Vec::with_capacity(requests.len());
        for request in &requests {
            log::info!("Creating parameter ({})", request.name);
            self.put_with_backoff(request).await.map_err(|error| match error {
                Error::Provider(source) if source.has_code("ParameterAlreadyExists") => {
                    Error::AlreadyExists {
                        name: request.name.clone(),
                        source,
                    }
                }
                other => other,
            })?;
            written.push(request.name.clone());
        }

        Ok(written)
    }

    /// Creates or overwrites every parameter, one at a time and in order.
    pub async fn upsert(
        &self,
        definitions: &Map<String, Value>,
        tags: &[Tag],
    ) -> Result<Vec<String>, Error> {
        let requests = definitions_to_requests(definitions, true, tags)?;

        let mut written = Vec::with_capacity(requests.len());
        for request in &requests {
            log::info!("Upserting parameter ({})", request.name);
            self.put_with_backoff(request).await?;
            written.push(request.name.clone());
        }

        Ok(written)
    }

    /// Returns `false` without calling the provider when `name` is empty.
    pub async fn delete(&self, name: &str) -> Result<bool, Error> {
        if name.is_empty() {
            return Ok(false);
        }

        log::info!("Deleting parameter ({})", name);
        self.service
            .delete_parameter(name)
            .await
            .map_err(|error| not_found_or(error, name))?;
        Ok(true)
    }

    /// Deletes in chunks of [`BULK_CHUNK_SIZE`], one chunk at a time, and
    /// returns every name the provider reported as deleted in input order.
    pub async fn delete_multiple(&self, names: &[String]) -> Result<Vec<String>, Error> {
        let mut deleted = Vec::with_capacity(names.len());

        for (index, chunk) in names.chunks(BULK_CHUNK_SIZE).enumerate() {
            log::info!(
                "Deleting parameter chunk {} ({} names)",
                index + 1,
                chunk.len()
            );
            let target = chunk.join(", ");
            let chunk_deleted = schedule_with_backoff(&self.policy, |attempt| {
                let target = &target;
                async move {
                    match self.service.delete_parameters(chunk).await {
                        Ok(chunk_deleted) => Ok(Probe::Ready(chunk_deleted)),
                        Err(error) => retry_if_transient(error, target, &attempt),
                    }
                }
            })
            .await
            .map_err(|error| backoff_error(error, &target))?;

            deleted.extend(chunk_deleted);
        }

        Ok(deleted)
    }

    pub async fn retrieve(&self, name: &str) -> Result<Parameter, Error> {
        self.service
            .get_parameter(name)
            .await
            .map_err(|error| not_found_or(error, name))
    }

    /// Best effort: names the provider does not know are reported in
    /// `invalid` rather than failing the call.
    pub async fn retrieve_multiple(&self, names: &[String]) -> Result<FetchedParameters, Error> {
        let mut fetched = FetchedParameters::default();

        for chunk in names.chunks(BULK_CHUNK_SIZE) {
            let page = self.service.get_parameters(chunk).await?;
            fetched.parameters.extend(page.parameters);
            fetched.invalid.extend(page.invalid);
        }

        Ok(fetched)
    }

    /// Follows continuation tokens until the provider stops returning one.
    pub async fn retrieve_all_by_path(&self, path: &str) -> Result<Vec<Parameter>, Error> {
        let mut found = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .service
                .get_parameters_by_path(path, next_token.as_deref())
                .await?;
            found.extend(page.parameters);

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(found),
            }
        }
    }

    async fn put_with_backoff(&self, request: &PutParameterRequest) -> Result<(), Error> {
        schedule_with_backoff(&self.policy, |attempt| async move {
            match self.service.put_parameter(request).await {
                Ok(()) => Ok(Probe::Ready(())),
                // an earlier attempt may have been committed before it failed
                Err(error)
                    if attempt.index > 0
                        && !request.overwrite
                        && error.has_code("ParameterAlreadyExists") =>
                {
                    match self.service.get_parameter(&request.name).await {
                        Ok(stored) if stored.value == request.value => {
                            log::info!(
                                "Parameter ({}) was written by an earlier attempt",
                                request.name
                            );
                            Ok(Probe::Ready(()))
                        }
                        _ => Err(error),
                    }
                }
                Err(error) => retry_if_transient(error, &request.name, &attempt),
            }
        })
        .await
        .map_err(|error| backoff_error(error, &request.name))
    }
}

fn retry_if_transient<T>(
    error: ProviderError,
    target: &str,
    attempt: &BackoffAttempt,
) -> Result<Probe<T>, ProviderError> {
    if !error.is_transient() {
        return Err(error);
    }

    match attempt.next_delay() {
        Some(delay) => log::warn!(
            "Parameter call for ({}) failed, retrying in {}: {}",
            target,
            format_delay(delay),
            error
        ),
        None => log::warn!("Parameter call for ({}) failed: {}", target, error),
    }
    Ok(Probe::Retry(Some(error.to_string())))
}

fn backoff_error(error: backoff::Error<ProviderError>, target: &str) -> Error {
    match error {
        backoff::Error::Exhausted {
            attempts,
            last_reason,
        } => Error::RetriesExhausted {
            target: target.to_owned(),
            attempts,
            last_error: last_reason,
        },
        backoff::Error::Probe(error) => Error::Provider(error),
    }
}

fn not_found_or(error: ProviderError, name: &str) -> Error {
    if error.has_code("ParameterNotFound") {
        Error::NotFound(name.to_owned())
    } else {
        Error::Provider(error)
    }
}
