//! Declared template parameters: extraction through the stack service,
//! conversion into prompt descriptions, and resolution of supplied values.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};
use regex::Regex;
use serde::Serialize;

use crate::provider::{ParameterMetadata, ProviderError, StackParameter, StackService};

/// The only declared parameter type prompts know how to collect.
pub const SUPPORTED_TYPE: &str = "String";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Unable to read template {path}: {message}")]
    FileRead { path: String, message: String },

    #[error("ParameterType ({parameter_type}) of parameter ({key}) not yet supported!")]
    UnsupportedParameterType { key: String, parameter_type: String },

    #[error("AllowedPattern of parameter ({key}) is not a valid pattern: {reason}")]
    InvalidPattern { key: String, reason: String },

    #[error("No value provided for parameter ({0}) and the template declares no default")]
    MissingValue(String),

    #[error("Invalid value for parameter ({key}): {reason}")]
    InvalidValue { key: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Everything a prompt renderer needs to ask for one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterPrompt {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub default: Option<String>,
    pub message: String,
    pub description: Option<String>,
    pub allowed_values: Vec<String>,
    pub allowed_pattern: Option<String>,
    pub no_echo: bool,
}

impl ParameterPrompt {
    pub fn validate(&self, input: &str) -> Result<(), String> {
        if !self.allowed_values.is_empty() && !self.allowed_values.iter().any(|v| v == input) {
            return Err(format!(
                "Invalid value, must be one of: {}.",
                self.allowed_values.join(", ")
            ));
        }

        if let Some(pattern) = &self.allowed_pattern {
            let matcher = anchored(pattern).map_err(|error| error.to_string())?;
            if !matcher.is_match(input) {
                return Err(format!("Invalid format, must be of type {pattern}."));
            }
        }

        Ok(())
    }
}

/// CloudFormation matches `AllowedPattern` against the whole value.
fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Summarises the template's declared parameters, in declaration order.
pub async fn extract_parameters<S>(
    service: &S,
    template_body: &str,
) -> Result<Vec<ParameterMetadata>, Error>
where
    S: StackService + ?Sized,
{
    let declared = service.get_template_summary(template_body).await?;
    let patterns = declared_patterns(template_body);

    declared
        .into_iter()
        .map(|mut parameter| -> Result<ParameterMetadata, Error> {
            ensure_supported(&parameter)?;
            if parameter.allowed_pattern.is_none() {
                parameter.allowed_pattern = patterns.get(&parameter.key).cloned();
            }
            Ok(parameter)
        })
        .collect()
}

/// Reads every template one after the other and concatenates their
/// parameters in the order the paths were given.
pub async fn load_parameters_from_files<S>(
    service: &S,
    paths: &[PathBuf],
) -> Result<Vec<ParameterMetadata>, Error>
where
    S: StackService + ?Sized,
{
    stream::iter(paths)
        .then(|path| async move {
            let template_body = read_template(path).await?;
            extract_parameters(service, &template_body).await
        })
        .try_concat()
        .await
}

pub fn convert_parameters_to_prompts(
    parameters: &[ParameterMetadata],
) -> Result<Vec<ParameterPrompt>, Error> {
    parameters
        .iter()
        .map(|parameter| -> Result<ParameterPrompt, Error> {
            ensure_supported(parameter)?;
            if let Some(pattern) = &parameter.allowed_pattern {
                anchored(pattern).map_err(|error| Error::InvalidPattern {
                    key: parameter.key.clone(),
                    reason: error.to_string(),
                })?;
            }

            let description = parameter
                .description
                .clone()
                .filter(|description| !description.trim().is_empty());
            let message = match &description {
                Some(description) => format!("{description} => "),
                None => format!(
                    "Please enter a {} for {} => ",
                    parameter.parameter_type, parameter.key
                ),
            };

            Ok(ParameterPrompt {
                kind: parameter.parameter_type.clone(),
                name: parameter.key.clone(),
                default: parameter.default_value.clone(),
                message,
                description,
                allowed_values: parameter.allowed_values.clone(),
                allowed_pattern: parameter.allowed_pattern.clone(),
                no_echo: parameter.no_echo,
            })
        })
        .collect()
}

/// Answers every prompt from `values`, falling back to the declared default.
/// Values for parameters the template does not declare are skipped.
pub fn resolve_parameter_values(
    prompts: &[ParameterPrompt],
    values: &BTreeMap<String, String>,
) -> Result<Vec<StackParameter>, Error> {
    for key in values.keys() {
        if !prompts.iter().any(|prompt| &prompt.name == key) {
            log::warn!("Ignoring value for undeclared parameter ({})", key);
        }
    }

    prompts
        .iter()
        .map(|prompt| -> Result<StackParameter, Error> {
            let value = values
                .get(&prompt.name)
                .or(prompt.default.as_ref())
                .cloned()
                .ok_or_else(|| Error::MissingValue(prompt.name.clone()))?;

            prompt
                .validate(&value)
                .map_err(|reason| Error::InvalidValue {
                    key: prompt.name.clone(),
                    reason,
                })?;

            Ok(StackParameter {
                key: prompt.name.clone(),
                value,
            })
        })
        .collect()
}

/// Renders parameters the way `aws cloudformation deploy` expects them.
pub fn format_parameter_overrides(parameters: &[StackParameter]) -> String {
    parameters
        .iter()
        .fold(String::from("--parameter-overrides"), |mut acc, parameter| {
            acc.push_str(&format!(" {}={}", parameter.key, parameter.value));
            acc
        })
}

fn ensure_supported(parameter: &ParameterMetadata) -> Result<(), Error> {
    if parameter.parameter_type == SUPPORTED_TYPE {
        Ok(())
    } else {
        Err(Error::UnsupportedParameterType {
            key: parameter.key.clone(),
            parameter_type: parameter.parameter_type.clone(),
        })
    }
}

/// `AllowedPattern` per parameter key; the summary API does not report it.
fn declared_patterns(template_body: &str) -> HashMap<String, String> {
    let template: serde_yaml::Value = match serde_yaml::from_str(template_body) {
        Ok(template) => template,
        Err(error) => {
            log::debug!("Template body is not parsable, skipping AllowedPattern lookup: {}", error);
            return HashMap::new();
        }
    };

    let Some(parameters) = template.get("Parameters").and_then(|p| p.as_mapping()) else {
        return HashMap::new();
    };

    parameters
        .iter()
        .filter_map(|(key, declaration)| {
            let key = key.as_str()?;
            let pattern = declaration.get("AllowedPattern")?.as_str()?;
            Some((key.to_owned(), pattern.to_owned()))
        })
        .collect()
}

async fn read_template(path: &Path) -> Result<String, Error> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|error| Error::FileRead {
            path: path.display().to_string(),
            message: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::{
        convert_parameters_to_prompts, extract_parameters, format_parameter_overrides,
        load_parameters_from_files, resolve_parameter_values, Error,
    };
    use crate::provider::{ParameterMetadata, StackParameter};
    use crate::testing::FakeStackService;

    const NO_PARAMS: &str = "
Description:
  Valid CF Template with no params.

Resources:
  InternetGateway:
    Type: AWS::EC2::InternetGateway
";

    const VPC: &str = "
AWSTemplateFormatVersion: 2010-09-09
Description:
  A VPC.

Parameters:
  EnvironmentName:
    Description: Environment Name
    Type: String
    AllowedPattern: ^[0-9a-z-]*$
  VpcCIDR:
    Description: VPC CIDR
    Type: String
    Default: 10.10.0.0/16
  NumberOfSubnets:
    Description: Number of Subnets to create
    Type: String
    Default: 6
  SubnetOffset:
    Description: Offset of the subnet from the VPC CIDR
    Type: String
    Default: 8

Resources:
  VPC:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: !Ref VpcCIDR
      Tags:
        - Key: Name
          Value: !Join [ '-', [!Ref EnvironmentName, 'vpc' ]]
";

    fn string_parameter(key: &str, default: Option<&str>, description: &str) -> ParameterMetadata {
        ParameterMetadata {
            key: key.to_owned(),
            default_value: default.map(str::to_owned),
            description: Some(description.to_owned()),
            parameter_type: String::from("String"),
            ..ParameterMetadata::default()
        }
    }

    /// The order the summary API reports the VPC template's parameters in.
    fn vpc_summary() -> Vec<ParameterMetadata> {
        vec![
            string_parameter("VpcCIDR", Some("10.10.0.0/16"), "VPC CIDR"),
            string_parameter("EnvironmentName", None, "Environment Name"),
            string_parameter("SubnetOffset", Some("8"), "Offset of the subnet from the VPC CIDR"),
            string_parameter("NumberOfSubnets", Some("6"), "Number of Subnets to create"),
        ]
    }

    fn vpc_service() -> FakeStackService {
        let service = FakeStackService::new("vpc");
        service.state().template_parameters = vpc_summary();
        service
    }

    #[tokio::test]
    async fn templates_without_parameters_yield_nothing() {
        let service = FakeStackService::new("empty");
        let parameters = extract_parameters(&service, NO_PARAMS).await.unwrap();
        assert!(parameters.is_empty());
    }

    #[tokio::test]
    async fn extracts_declared_parameters_in_order() {
        let service = vpc_service();

        let parameters = extract_parameters(&service, VPC).await.unwrap();

        let keys: Vec<&str> = parameters.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(vec!["VpcCIDR", "EnvironmentName", "SubnetOffset", "NumberOfSubnets"], keys);
        assert_eq!(Some(String::from("^[0-9a-z-]*$")), parameters[1].allowed_pattern);
        assert!(parameters
            .iter()
            .filter(|p| p.key != "EnvironmentName")
            .all(|p| p.allowed_pattern.is_none()));
    }

    #[tokio::test]
    async fn rejects_unsupported_parameter_types() {
        for parameter_type in [
            "Number",
            "List<Number>",
            "CommaDelimitedList",
            "AWS::EC2::VPC::Id",
            "List<AWS::EC2::Subnet::Id>",
            "AWS::SSM::Parameter::Value<String>",
        ] {
            let service = FakeStackService::new("typed");
            service.state().template_parameters = vec![
                string_parameter("EnvironmentName", None, "Environment Name"),
                ParameterMetadata {
                    key: String::from("Typed"),
                    parameter_type: parameter_type.to_owned(),
                    ..ParameterMetadata::default()
                },
            ];

            assert_eq!(
                Err(Error::UnsupportedParameterType {
                    key: String::from("Typed"),
                    parameter_type: parameter_type.to_owned(),
                }),
                extract_parameters(&service, "Parameters: {}").await
            );
        }
    }

    #[tokio::test]
    async fn loads_files_sequentially() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("vpc.yml");
        let second = dir.path().join("empty.yml");
        std::fs::write(&first, VPC).unwrap();
        std::fs::write(&second, NO_PARAMS).unwrap();
        let service = vpc_service();

        let parameters = load_parameters_from_files(&service, &[first, second])
            .await
            .unwrap();

        // the fake reports the same summary for both templates
        assert_eq!(8, parameters.len());
        let templates = service.state().templates.clone();
        assert_eq!(vec![VPC.to_owned(), NO_PARAMS.to_owned()], templates);
    }

    #[tokio::test]
    async fn unreadable_files_fail() {
        let dir = tempdir().unwrap();
        let service = vpc_service();

        let result = load_parameters_from_files(&service, &[dir.path().join("missing.yml")]).await;

        match result.err().unwrap() {
            Error::FileRead { .. } => {}
            _ => panic!("Expected `FileRead` error"),
        }
        assert!(service.state().calls.is_empty());
    }

    #[tokio::test]
    async fn converts_parameters_to_prompts() {
        let service = vpc_service();
        let parameters = extract_parameters(&service, VPC).await.unwrap();

        let prompts = convert_parameters_to_prompts(&parameters).unwrap();

        assert_eq!(4, prompts.len());
        assert_eq!("VpcCIDR", prompts[0].name);
        assert_eq!(Some(String::from("10.10.0.0/16")), prompts[0].default);
        assert_eq!("String", prompts[0].kind);
        assert_eq!("VPC CIDR => ", prompts[0].message);

        assert_eq!("EnvironmentName", prompts[1].name);
        assert_eq!(None, prompts[1].default);

        assert_eq!(Some(String::from("8")), prompts[2].default);
        assert_eq!(Some(String::from("6")), prompts[3].default);
    }

    #[test]
    fn falls_back_to_a_generic_message() {
        let mut parameter = string_parameter("Name", None, "  ");
        parameter.description = None;

        let prompts = convert_parameters_to_prompts(&[parameter]).unwrap();

        assert_eq!("Please enter a String for Name => ", prompts[0].message);
        assert_eq!(None, prompts[0].description);
    }

    #[test]
    fn prompts_validate_input() {
        let mut parameter = string_parameter("Environment", None, "Environment");
        parameter.allowed_values = vec![String::from("dev"), String::from("prod"), String::from("Prod")];
        parameter.allowed_pattern = Some(String::from("[a-z]+"));

        let prompt = convert_parameters_to_prompts(&[parameter]).unwrap().remove(0);

        assert_eq!(Ok(()), prompt.validate("dev"));
        assert!(prompt.validate("qa").is_err());
        // allowed, but does not match the pattern as a whole
        assert!(prompt.validate("Prod").is_err());
    }

    #[test]
    fn rejects_broken_patterns() {
        let mut parameter = string_parameter("Name", None, "Name");
        parameter.allowed_pattern = Some(String::from("[a-z"));

        assert!(matches!(
            convert_parameters_to_prompts(&[parameter]),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn resolves_values_against_prompts() {
        let mut environment = string_parameter("EnvironmentName", None, "Environment Name");
        environment.allowed_pattern = Some(String::from("^[0-9a-z-]*$"));
        let prompts = convert_parameters_to_prompts(&[
            string_parameter("VpcCIDR", Some("10.10.0.0/16"), "VPC CIDR"),
            environment,
        ])
        .unwrap();

        let mut values = BTreeMap::new();
        values.insert(String::from("EnvironmentName"), String::from("dev-1"));
        values.insert(String::from("Unused"), String::from("x"));

        let parameters = resolve_parameter_values(&prompts, &values).unwrap();
        assert_eq!(
            vec![
                StackParameter {
                    key: String::from("VpcCIDR"),
                    value: String::from("10.10.0.0/16"),
                },
                StackParameter {
                    key: String::from("EnvironmentName"),
                    value: String::from("dev-1"),
                },
            ],
            parameters
        );
        assert_eq!(
            "--parameter-overrides VpcCIDR=10.10.0.0/16 EnvironmentName=dev-1",
            format_parameter_overrides(&parameters)
        );

        assert_eq!(
            Err(Error::MissingValue(String::from("EnvironmentName"))),
            resolve_parameter_values(&prompts, &BTreeMap::new())
        );

        values.insert(String::from("EnvironmentName"), String::from("Dev"));
        assert!(matches!(
            resolve_parameter_values(&prompts, &values),
            Err(Error::InvalidValue { .. })
        ));
    }
}
