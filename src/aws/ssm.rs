use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ssm::types::{ParameterType as SsmParameterType, ResourceTypeForTagging, Tag};
use aws_sdk_ssm::Client;

use super::{build_error, provider_error};
use crate::provider::{
    FetchedParameters, Parameter, ParameterPage, ParameterService, ProviderError,
    PutParameterRequest,
};

pub struct ParameterStoreService {
    client: Client,
}

impl ParameterStoreService {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    async fn add_tags(&self, name: &str, tags: Vec<Tag>) -> Result<(), ProviderError> {
        self.client
            .add_tags_to_resource()
            .resource_type(ResourceTypeForTagging::Parameter)
            .resource_id(name)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }
}

fn to_tags(request: &PutParameterRequest) -> Result<Vec<Tag>, ProviderError> {
    request
        .tags
        .iter()
        .map(|tag| {
            Tag::builder()
                .key(&tag.key)
                .value(&tag.value)
                .build()
                .map_err(build_error)
        })
        .collect()
}

fn to_parameter(parameter: &aws_sdk_ssm::types::Parameter) -> Parameter {
    Parameter {
        name: parameter.name().unwrap_or_default().to_owned(),
        value: parameter.value().unwrap_or_default().to_owned(),
        parameter_type: parameter
            .r#type()
            .map(|parameter_type| parameter_type.as_str().to_owned())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ParameterService for ParameterStoreService {
    /// PutParameter refuses tags on overwrite, so those are applied afterwards.
    async fn put_parameter(&self, request: &PutParameterRequest) -> Result<(), ProviderError> {
        let tags = to_tags(request)?;
        let tag_afterwards = request.overwrite && !tags.is_empty();

        let mut put = self
            .client
            .put_parameter()
            .name(&request.name)
            .value(&request.value)
            .r#type(SsmParameterType::from(request.parameter_type.as_str()))
            .overwrite(request.overwrite);
        if !request.description.is_empty() {
            put = put.description(&request.description);
        }
        if !tag_afterwards && !tags.is_empty() {
            put = put.set_tags(Some(tags.clone()));
        }

        put.send().await.map_err(provider_error)?;

        if tag_afterwards {
            self.add_tags(&request.name, tags).await?;
        }
        Ok(())
    }

    async fn delete_parameter(&self, name: &str) -> Result<(), ProviderError> {
        self.client
            .delete_parameter()
            .name(name)
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn delete_parameters(&self, names: &[String]) -> Result<Vec<String>, ProviderError> {
        let output = self
            .client
            .delete_parameters()
            .set_names(Some(names.to_vec()))
            .send()
            .await
            .map_err(provider_error)?;

        if !output.invalid_parameters().is_empty() {
            log::debug!("Unknown parameters skipped: {:?}", output.invalid_parameters());
        }
        Ok(output.deleted_parameters().to_vec())
    }

    async fn get_parameter(&self, name: &str) -> Result<Parameter, ProviderError> {
        let output = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(provider_error)?;

        output
            .parameter()
            .map(to_parameter)
            .ok_or_else(|| ProviderError::service("ParameterNotFound", format!("{name} was not returned")))
    }

    async fn get_parameters(&self, names: &[String]) -> Result<FetchedParameters, ProviderError> {
        let output = self
            .client
            .get_parameters()
            .set_names(Some(names.to_vec()))
            .with_decryption(true)
            .send()
            .await
            .map_err(provider_error)?;

        Ok(FetchedParameters {
            parameters: output.parameters().iter().map(to_parameter).collect(),
            invalid: output.invalid_parameters().to_vec(),
        })
    }

    async fn get_parameters_by_path(
        &self,
        path: &str,
        next_token: Option<&str>,
    ) -> Result<ParameterPage, ProviderError> {
        let output = self
            .client
            .get_parameters_by_path()
            .path(path)
            .recursive(true)
            .with_decryption(true)
            .set_next_token(next_token.map(str::to_owned))
            .send()
            .await
            .map_err(provider_error)?;

        Ok(ParameterPage {
            parameters: output.parameters().iter().map(to_parameter).collect(),
            next_token: output.next_token().map(str::to_owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_ssm::types::{Parameter, ParameterType};

    use super::{to_parameter, to_tags};
    use crate::provider::{self, PutParameterRequest};
    use crate::tags::Tag;

    #[test]
    fn converts_request_tags() {
        let request = PutParameterRequest {
            name: String::from("/app/db/host"),
            value: String::from("db.internal"),
            parameter_type: provider::ParameterType::String,
            description: String::new(),
            overwrite: true,
            tags: vec![Tag::new("Environment", "dev"), Tag::new("Team", "platform")],
        };

        let tags = to_tags(&request).unwrap();

        assert_eq!(2, tags.len());
        assert_eq!("Team", tags[1].key());
        assert_eq!("platform", tags[1].value());
    }

    #[test]
    fn converts_parameters() {
        let parameter = Parameter::builder()
            .name("/app/db/password")
            .value("hunter2")
            .r#type(ParameterType::SecureString)
            .build();

        let converted = to_parameter(&parameter);

        assert_eq!("/app/db/password", converted.name);
        assert_eq!("hunter2", converted.value);
        assert_eq!("SecureString", converted.parameter_type);
    }
}
