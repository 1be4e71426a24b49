//! The narrow surfaces the orchestrator and the reconciler talk to. The AWS
//! backed implementations live in [`crate::aws`]; tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::status::StackStatus;
use crate::tags::Tag;

/// Provider error codes that are worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyUpdates",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "InternalServerError",
    "InternalFailure",
    "ServiceUnavailable",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Service error ocurred ({code}): {message}.")]
    Service { code: String, message: String },

    #[error("Transport error ocurred: {0}.")]
    Transport(String),

    #[error("Unknown error ocurred: {0}.")]
    Unknown(String),
}

impl ProviderError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn has_code(&self, expected: &str) -> bool {
        self.code() == Some(expected)
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Service { code, .. } => TRANSIENT_CODES.contains(&code.as_str()),
            Self::Unknown(_) => false,
        }
    }

    /// CloudFormation reports unknown stacks as a `ValidationError`.
    pub fn is_missing_stack(&self) -> bool {
        match self {
            Self::Service { code, message } => {
                code == "ValidationError" && message.contains("does not exist")
            }
            _ => false,
        }
    }

    pub fn is_no_op_update(&self) -> bool {
        match self {
            Self::Service { code, message } => {
                code == "ValidationError" && message.contains("No updates are to be performed")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackParameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSpec {
    pub template_body: String,
    pub stack_name: String,
    pub parameters: Vec<StackParameter>,
    pub capabilities: Vec<String>,
    pub tags: Vec<Tag>,
}

/// What create/update/delete hand back right after accepting a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackResponse {
    pub stack_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackDescription {
    pub stack_id: Option<String>,
    pub stack_name: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub outputs: Vec<StackOutput>,
}

impl StackDescription {
    pub fn matches(&self, name_or_id: &str) -> bool {
        self.stack_name == name_or_id || self.stack_id.as_deref() == Some(name_or_id)
    }
}

/// A parameter declared by a template, as reported by the stack service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    pub key: String,
    pub default_value: Option<String>,
    pub description: Option<String>,
    pub parameter_type: String,
    pub no_echo: bool,
    pub allowed_values: Vec<String>,
    pub allowed_pattern: Option<String>,
}

#[async_trait]
pub trait StackService: Send + Sync {
    async fn create_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError>;

    async fn update_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError>;

    async fn delete_stack(&self, name_or_id: &str) -> Result<StackResponse, ProviderError>;

    async fn describe_stacks(
        &self,
        name_or_id: &str,
    ) -> Result<Vec<StackDescription>, ProviderError>;

    async fn get_template_summary(
        &self,
        template_body: &str,
    ) -> Result<Vec<ParameterMetadata>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParameterType {
    #[default]
    String,
    StringList,
    SecureString,
}

impl ParameterType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::StringList => "StringList",
            Self::SecureString => "SecureString",
        }
    }
}

impl std::str::FromStr for ParameterType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "String" => Ok(Self::String),
            "StringList" => Ok(Self::StringList),
            "SecureString" => Ok(Self::SecureString),
            other => Err(format!(
                "unsupported parameter type `{other}`, expected String, StringList or SecureString"
            )),
        }
    }
}

/// Payload for a single put-parameter call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutParameterRequest {
    pub name: String,
    pub value: String,
    pub parameter_type: ParameterType,
    pub description: String,
    pub overwrite: bool,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    pub parameter_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterPage {
    pub parameters: Vec<Parameter>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchedParameters {
    pub parameters: Vec<Parameter>,
    pub invalid: Vec<String>,
}

#[async_trait]
pub trait ParameterService: Send + Sync {
    async fn put_parameter(&self, request: &PutParameterRequest) -> Result<(), ProviderError>;

    async fn delete_parameter(&self, name: &str) -> Result<(), ProviderError>;

    /// Returns the names the provider reports as deleted.
    async fn delete_parameters(&self, names: &[String]) -> Result<Vec<String>, ProviderError>;

    async fn get_parameter(&self, name: &str) -> Result<Parameter, ProviderError>;

    async fn get_parameters(&self, names: &[String]) -> Result<FetchedParameters, ProviderError>;

    async fn get_parameters_by_path(
        &self,
        path: &str,
        next_token: Option<&str>,
    ) -> Result<ParameterPage, ProviderError>;
}
