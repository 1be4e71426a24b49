//! SDK backed implementations of the provider seams.

mod cloudformation;
mod ssm;

use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_types::region::Region;

use crate::provider::ProviderError;

pub use cloudformation::CloudFormationService;
pub use ssm::ParameterStoreService;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: Option<String>,
    pub profile: Option<String>,
}

/// An explicit region wins, otherwise the default provider chain decides.
pub async fn load_sdk_config(settings: &AwsSettings) -> SdkConfig {
    let region = RegionProviderChain::first_try(settings.region.clone().map(Region::new))
        .or_default_provider();

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
    if let Some(profile) = &settings.profile {
        loader = loader.profile_name(profile);
    }

    let config = loader.load().await;
    match config.region() {
        Some(region) => log::debug!("Loaded AWS config for region {}", region),
        None => log::warn!("No AWS region configured"),
    }
    config
}

fn provider_error<E, R>(error: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &error {
        SdkError::ServiceError(service) => {
            let err = service.err();
            ProviderError::Service {
                code: err.code().unwrap_or("Unknown").to_owned(),
                message: err
                    .message()
                    .map(str::to_owned)
                    .unwrap_or_else(|| DisplayErrorContext(err).to_string()),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ProviderError::Transport(DisplayErrorContext(&error).to_string())
        }
        _ => ProviderError::Unknown(DisplayErrorContext(&error).to_string()),
    }
}

fn build_error(error: impl std::fmt::Display) -> ProviderError {
    ProviderError::Unknown(format!("Unable to build request: {error}"))
}
