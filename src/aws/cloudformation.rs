use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudformation::types::{Capability, Output, Parameter, ParameterDeclaration, Stack, Tag};
use aws_sdk_cloudformation::Client;

use super::provider_error;
use crate::provider::{
    ParameterMetadata, ProviderError, StackDescription, StackOutput, StackResponse, StackService,
    StackSpec,
};
use crate::status::StackStatus;

pub struct CloudFormationService {
    client: Client,
}

impl CloudFormationService {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

struct StackInput {
    parameters: Vec<Parameter>,
    capabilities: Vec<Capability>,
    tags: Vec<Tag>,
}

fn stack_input(spec: &StackSpec) -> StackInput {
    let parameters = spec
        .parameters
        .iter()
        .map(|parameter| {
            Parameter::builder()
                .parameter_key(&parameter.key)
                .parameter_value(&parameter.value)
                .build()
        })
        .collect();

    let tags = spec
        .tags
        .iter()
        .map(|tag| Tag::builder().key(&tag.key).value(&tag.value).build())
        .collect();

    StackInput {
        parameters,
        capabilities: spec
            .capabilities
            .iter()
            .map(|capability| Capability::from(capability.as_str()))
            .collect(),
        tags,
    }
}

fn to_description(stack: &Stack) -> StackDescription {
    StackDescription {
        stack_id: stack.stack_id().map(str::to_owned),
        stack_name: stack.stack_name().unwrap_or_default().to_owned(),
        // a missing status polls like any other unrecognized one
        status: stack
            .stack_status()
            .map(|status| StackStatus::from(status.as_str()))
            .unwrap_or_else(|| StackStatus::Unknown(String::new())),
        status_reason: stack.stack_status_reason().map(str::to_owned),
        outputs: stack.outputs().iter().filter_map(to_output).collect(),
    }
}

fn to_output(output: &Output) -> Option<StackOutput> {
    Some(StackOutput {
        key: output.output_key()?.to_owned(),
        value: output.output_value()?.to_owned(),
        description: output.description().map(str::to_owned),
        export_name: output.export_name().map(str::to_owned),
    })
}

fn to_metadata(declaration: &ParameterDeclaration) -> ParameterMetadata {
    let constraints = declaration.parameter_constraints();

    ParameterMetadata {
        key: declaration.parameter_key().unwrap_or_default().to_owned(),
        default_value: declaration.default_value().map(str::to_owned),
        description: declaration.description().map(str::to_owned),
        parameter_type: declaration.parameter_type().unwrap_or_default().to_owned(),
        no_echo: declaration.no_echo().unwrap_or(false),
        allowed_values: constraints
            .map(|constraints| constraints.allowed_values().to_vec())
            .unwrap_or_default(),
        allowed_pattern: None,
    }
}

#[async_trait]
impl StackService for CloudFormationService {
    async fn create_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError> {
        let input = stack_input(spec);
        log::debug!("CreateStack {} ({} parameters)", spec.stack_name, input.parameters.len());

        let output = self
            .client
            .create_stack()
            .stack_name(&spec.stack_name)
            .template_body(&spec.template_body)
            .set_parameters(Some(input.parameters))
            .set_capabilities(Some(input.capabilities))
            .set_tags(Some(input.tags))
            .send()
            .await
            .map_err(provider_error)?;

        Ok(StackResponse {
            stack_id: output.stack_id().map(str::to_owned),
        })
    }

    async fn update_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError> {
        let input = stack_input(spec);
        log::debug!("UpdateStack {} ({} parameters)", spec.stack_name, input.parameters.len());

        let output = self
            .client
            .update_stack()
            .stack_name(&spec.stack_name)
            .template_body(&spec.template_body)
            .set_parameters(Some(input.parameters))
            .set_capabilities(Some(input.capabilities))
            .set_tags(Some(input.tags))
            .send()
            .await
            .map_err(provider_error)?;

        Ok(StackResponse {
            stack_id: output.stack_id().map(str::to_owned),
        })
    }

    async fn delete_stack(&self, name_or_id: &str) -> Result<StackResponse, ProviderError> {
        self.client
            .delete_stack()
            .stack_name(name_or_id)
            .send()
            .await
            .map_err(provider_error)?;

        Ok(StackResponse {
            stack_id: name_or_id
                .starts_with("arn:")
                .then(|| name_or_id.to_owned()),
        })
    }

    async fn describe_stacks(
        &self,
        name_or_id: &str,
    ) -> Result<Vec<StackDescription>, ProviderError> {
        let output = self
            .client
            .describe_stacks()
            .stack_name(name_or_id)
            .send()
            .await
            .map_err(provider_error)?;

        Ok(output.stacks().iter().map(to_description).collect())
    }

    async fn get_template_summary(
        &self,
        template_body: &str,
    ) -> Result<Vec<ParameterMetadata>, ProviderError> {
        let output = self
            .client
            .get_template_summary()
            .template_body(template_body)
            .send()
            .await
            .map_err(provider_error)?;

        Ok(output.parameters().iter().map(to_metadata).collect())
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_cloudformation::types::{
        Output, ParameterConstraints, ParameterDeclaration, Stack, StackStatus as SdkStatus,
    };

    use super::{stack_input, to_description, to_metadata, to_output};
    use crate::provider::{StackParameter, StackSpec};
    use crate::status::StackStatus;
    use crate::tags::Tag;

    #[test]
    fn builds_stack_input() {
        let spec = StackSpec {
            template_body: String::from("Resources: {}"),
            stack_name: String::from("network"),
            parameters: vec![StackParameter {
                key: String::from("EnvironmentName"),
                value: String::from("dev"),
            }],
            capabilities: vec![String::from("CAPABILITY_NAMED_IAM")],
            tags: vec![Tag::new("Team", "platform")],
        };

        let input = stack_input(&spec);

        assert_eq!(Some("EnvironmentName"), input.parameters[0].parameter_key());
        assert_eq!(Some("dev"), input.parameters[0].parameter_value());
        assert_eq!("CAPABILITY_NAMED_IAM", input.capabilities[0].as_str());
        assert_eq!(Some("Team"), input.tags[0].key());
        assert_eq!(Some("platform"), input.tags[0].value());
    }

    #[test]
    fn describes_stacks() {
        let stack = Stack::builder()
            .stack_id("arn:aws:cloudformation:us-west-2:123456789012:stack/network/1")
            .stack_name("network")
            .stack_status(SdkStatus::UpdateRollbackFailed)
            .outputs(Output::builder().output_key("VpcId").output_value("vpc-123").build())
            .build();

        let description = to_description(&stack);

        assert_eq!("network", description.stack_name);
        assert_eq!(StackStatus::UpdateRollbackFailed, description.status);
        assert_eq!("vpc-123", description.outputs[0].value);
    }

    #[test]
    fn missing_status_is_unrecognized() {
        let stack = Stack::builder().stack_name("network").build();

        assert_eq!(StackStatus::Unknown(String::new()), to_description(&stack).status);
    }

    #[test]
    fn maps_parameter_declarations() {
        let declaration = ParameterDeclaration::builder()
            .parameter_key("Environment")
            .parameter_type("String")
            .default_value("dev")
            .no_echo(true)
            .parameter_constraints(
                ParameterConstraints::builder()
                    .allowed_values("dev")
                    .allowed_values("prod")
                    .build(),
            )
            .build();

        let metadata = to_metadata(&declaration);

        assert_eq!("Environment", metadata.key);
        assert_eq!("String", metadata.parameter_type);
        assert_eq!(Some(String::from("dev")), metadata.default_value);
        assert!(metadata.no_echo);
        assert_eq!(vec![String::from("dev"), String::from("prod")], metadata.allowed_values);
    }

    #[test]
    fn skips_incomplete_outputs() {
        let complete = Output::builder()
            .output_key("VpcId")
            .output_value("vpc-123")
            .export_name("network-vpc")
            .build();
        let incomplete = Output::builder().output_key("Dangling").build();

        assert_eq!(Some(String::from("network-vpc")), to_output(&complete).unwrap().export_name);
        assert_eq!(None, to_output(&incomplete));
    }
}
