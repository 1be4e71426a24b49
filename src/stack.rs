//! Deploy / await / teardown of CloudFormation stacks.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::backoff::{self, format_delay, schedule_with_backoff, BackoffPolicy, Probe};
use crate::provider::{
    ProviderError, StackDescription, StackParameter, StackResponse, StackService, StackSpec,
};
use crate::status::{classify, StackStatus, WaitDecision};
use crate::tags::Tag;

/// 3s initial delay, 45 attempts, never more than a minute between checks:
/// gives up at roughly the one hour mark.
pub const POLL_POLICY: BackoffPolicy = match BackoffPolicy::new(3_000, 45, 60_000) {
    Ok(policy) => policy,
    Err(_) => panic!("invalid stack polling policy"),
};

pub const DEPLOY_WAIT_SET: [StackStatus; 7] = [
    StackStatus::CreateComplete,
    StackStatus::CreateFailed,
    StackStatus::RollbackComplete,
    StackStatus::RollbackFailed,
    StackStatus::UpdateComplete,
    StackStatus::UpdateRollbackComplete,
    StackStatus::UpdateRollbackFailed,
];

/// Members of [`DEPLOY_WAIT_SET`] that mean the deploy did not go through.
pub const DEPLOY_FAILURES: [StackStatus; 5] = [
    StackStatus::CreateFailed,
    StackStatus::RollbackComplete,
    StackStatus::RollbackFailed,
    StackStatus::UpdateRollbackComplete,
    StackStatus::UpdateRollbackFailed,
];

pub const TEARDOWN_WAIT_SET: [StackStatus; 2] =
    [StackStatus::DeleteComplete, StackStatus::DeleteFailed];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Deploy,
    Teardown,
    Await,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => f.write_str("deploy"),
            Self::Teardown => f.write_str("delete"),
            Self::Await => f.write_str("await"),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Failed to {operation} stack, please see stack ({stack}): {}", .final_status.status)]
    OperationFailed {
        operation: Operation,
        stack: String,
        initial_response: StackResponse,
        final_status: Box<StackDescription>,
    },

    #[error("Stack ({stack}) already exists and cannot be created, deploy it instead")]
    AlreadyExistsOnCreateOnly { stack: String, source: ProviderError },

    #[error("Gave up waiting on stack ({stack}) after {attempts} attempts (last seen: {})", .last_seen.as_deref().unwrap_or("nothing"))]
    RetriesExhausted {
        stack: String,
        attempts: u32,
        last_seen: Option<String>,
    },

    #[error("Stack not found: {0}")]
    NotFound(String),

    #[error("Unable to read template {path}: {message}")]
    FileRead { path: String, message: String },

    #[error("Stack ({stack}) call failed: {source}")]
    Provider { stack: String, source: ProviderError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub capabilities: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackOperationResult {
    pub initial_response: StackResponse,
    pub final_status: StackDescription,
}

/// How polling ended.
enum Settled {
    Reached(StackDescription),
    Failed(StackDescription),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhenMissing {
    KeepPolling,
    TreatAsDeleted,
}

pub struct StackOrchestrator<S> {
    service: S,
    policy: BackoffPolicy,
}

impl<S: StackService> StackOrchestrator<S> {
    pub fn new(service: S) -> Self {
        Self::with_policy(service, POLL_POLICY)
    }

    pub fn with_policy(service: S, policy: BackoffPolicy) -> Self {
        Self { service, policy }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub async fn deploy_template_file(
        &self,
        path: &Path,
        name: &str,
        parameters: Vec<StackParameter>,
        options: &DeployOptions,
    ) -> Result<StackOperationResult, Error> {
        let template_body = read_template(path).await?;
        self.deploy_template(name, &template_body, parameters, options)
            .await
    }

    /// Creates the stack, or updates it when it already exists, then waits
    /// for it to settle.
    pub async fn deploy_template(
        &self,
        name: &str,
        template_body: &str,
        parameters: Vec<StackParameter>,
        options: &DeployOptions,
    ) -> Result<StackOperationResult, Error> {
        let spec = stack_spec(name, template_body, parameters, options);

        log::info!("Creating stack ({})", name);
        let initial_response = match self.service.create_stack(&spec).await {
            Ok(response) => response,
            Err(error) if error.has_code("AlreadyExistsException") => {
                log::info!("Stack ({}) already exists, updating it instead", name);
                match self.service.update_stack(&spec).await {
                    Ok(response) => response,
                    Err(error) if error.is_no_op_update() => {
                        log::info!("No updates are to be performed on stack ({})", name);
                        return self.current_state(name).await;
                    }
                    Err(error) => return Err(provider_error(name, error)),
                }
            }
            Err(error) => return Err(provider_error(name, error)),
        };

        self.settle_deploy(name, initial_response).await
    }

    /// Like [`Self::deploy_template`] but never falls back to an update.
    pub async fn create_template(
        &self,
        name: &str,
        template_body: &str,
        parameters: Vec<StackParameter>,
        options: &DeployOptions,
    ) -> Result<StackOperationResult, Error> {
        let spec = stack_spec(name, template_body, parameters, options);

        log::info!("Creating stack ({})", name);
        let initial_response = self.service.create_stack(&spec).await.map_err(|error| {
            if error.has_code("AlreadyExistsException") {
                Error::AlreadyExistsOnCreateOnly {
                    stack: name.to_owned(),
                    source: error,
                }
            } else {
                provider_error(name, error)
            }
        })?;

        self.settle_deploy(name, initial_response).await
    }

    /// Deletes the stack and waits until it is gone. A stack that can no
    /// longer be described while waiting counts as deleted.
    pub async fn teardown_stack(&self, name_or_id: &str) -> Result<StackOperationResult, Error> {
        // Deleted stacks can still be described by id, not by name.
        let (stack_ref, previous) = match self.retrieve_stack_status(name_or_id).await {
            Ok(Some(description)) => (
                description
                    .stack_id
                    .unwrap_or_else(|| name_or_id.to_owned()),
                description.status,
            ),
            Ok(None) => return Err(Error::NotFound(name_or_id.to_owned())),
            Err(error) => return Err(provider_error(name_or_id, error)),
        };

        log::info!("Deleting stack ({})", name_or_id);
        let initial_response = self
            .service
            .delete_stack(&stack_ref)
            .await
            .map_err(|error| provider_error(name_or_id, error))?;

        // a stack deleted out of a failed state may still report it on the first read
        let settled = self
            .poll_status(
                &stack_ref,
                &TEARDOWN_WAIT_SET,
                WhenMissing::TreatAsDeleted,
                Some(&previous),
            )
            .await?;

        match settled {
            Settled::Reached(final_status) if final_status.status != StackStatus::DeleteFailed => {
                Ok(StackOperationResult {
                    initial_response,
                    final_status,
                })
            }
            Settled::Reached(final_status) | Settled::Failed(final_status) => {
                Err(operation_failed(
                    Operation::Teardown,
                    name_or_id,
                    initial_response,
                    final_status,
                ))
            }
        }
    }

    /// Polls until the stack reports one of `wait_set`. A failure status
    /// outside `wait_set` ends the wait with [`Error::OperationFailed`].
    pub async fn await_stack_status(
        &self,
        name_or_id: &str,
        wait_set: &[StackStatus],
    ) -> Result<StackDescription, Error> {
        match self
            .poll_status(name_or_id, wait_set, WhenMissing::KeepPolling, None)
            .await?
        {
            Settled::Reached(description) => Ok(description),
            Settled::Failed(description) => {
                let initial_response = StackResponse {
                    stack_id: description.stack_id.clone(),
                };
                Err(operation_failed(
                    Operation::Await,
                    name_or_id,
                    initial_response,
                    description,
                ))
            }
        }
    }

    /// The stack whose id or name equals `name_or_id`, if the provider knows it.
    pub async fn retrieve_stack_status(
        &self,
        name_or_id: &str,
    ) -> Result<Option<StackDescription>, ProviderError> {
        match self.service.describe_stacks(name_or_id).await {
            Ok(stacks) => Ok(stacks
                .into_iter()
                .find(|stack| stack.matches(name_or_id))),
            Err(error) if error.is_missing_stack() => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn settle_deploy(
        &self,
        name: &str,
        initial_response: StackResponse,
    ) -> Result<StackOperationResult, Error> {
        let stack_ref = initial_response
            .stack_id
            .clone()
            .unwrap_or_else(|| name.to_owned());

        let final_status = match self
            .poll_status(&stack_ref, &DEPLOY_WAIT_SET, WhenMissing::KeepPolling, None)
            .await?
        {
            Settled::Reached(description) if !DEPLOY_FAILURES.contains(&description.status) => {
                description
            }
            Settled::Reached(description) | Settled::Failed(description) => {
                return Err(operation_failed(
                    Operation::Deploy,
                    &stack_ref,
                    initial_response,
                    description,
                ))
            }
        };

        log::info!("Stack ({}) reached {}", name, final_status.status);
        Ok(StackOperationResult {
            initial_response,
            final_status,
        })
    }

    async fn current_state(&self, name: &str) -> Result<StackOperationResult, Error> {
        let current = self
            .retrieve_stack_status(name)
            .await
            .map_err(|error| provider_error(name, error))?
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;

        Ok(StackOperationResult {
            initial_response: StackResponse {
                stack_id: current.stack_id.clone(),
            },
            final_status: current,
        })
    }

    async fn poll_status(
        &self,
        name_or_id: &str,
        wait_set: &[StackStatus],
        when_missing: WhenMissing,
        stale: Option<&StackStatus>,
    ) -> Result<Settled, Error> {
        schedule_with_backoff(&self.policy, |attempt| async move {
            log::info!(
                "Attempting to retrieve stack ({}) status after delaying, (HH:MM:SS.mmm) {}",
                name_or_id,
                format_delay(attempt.waited())
            );

            let description = match self.retrieve_stack_status(name_or_id).await {
                Ok(Some(description)) => description,
                Ok(None) if when_missing == WhenMissing::TreatAsDeleted => {
                    log::info!("Stack ({}) is no longer visible, treating it as deleted", name_or_id);
                    return Ok(Probe::Ready(Settled::Reached(vanished(name_or_id))));
                }
                Ok(None) => {
                    return Ok(Probe::Retry(Some(format!(
                        "stack ({name_or_id}) is not visible yet"
                    ))))
                }
                Err(error) if error.is_transient() => {
                    log::warn!("Retrieving stack ({}) failed: {}", name_or_id, error);
                    return Ok(Probe::Retry(Some(error.to_string())));
                }
                Err(error) => return Err(error),
            };

            match classify(&description.status, wait_set) {
                WaitDecision::MatchesWaitSet => Ok(Probe::Ready(Settled::Reached(description))),
                WaitDecision::Fatal if stale != Some(&description.status) => {
                    log::error!("Stack ({}) reached {}", name_or_id, description.status);
                    Ok(Probe::Ready(Settled::Failed(description)))
                }
                WaitDecision::InProgress | WaitDecision::Fatal => {
                    log::debug!("Stack ({}) is {}", name_or_id, description.status);
                    Ok(Probe::Retry(Some(description.status.to_string())))
                }
                WaitDecision::UnknownOngoing => {
                    log::warn!(
                        "Stack ({}) reported unrecognized status {}, still waiting",
                        name_or_id,
                        description.status
                    );
                    Ok(Probe::Retry(Some(description.status.to_string())))
                }
            }
        })
        .await
        .map_err(|error| match error {
            backoff::Error::Exhausted {
                attempts,
                last_reason,
            } => Error::RetriesExhausted {
                stack: name_or_id.to_owned(),
                attempts,
                last_seen: last_reason,
            },
            backoff::Error::Probe(error) => provider_error(name_or_id, error),
        })
    }
}

fn stack_spec(
    name: &str,
    template_body: &str,
    parameters: Vec<StackParameter>,
    options: &DeployOptions,
) -> StackSpec {
    StackSpec {
        template_body: template_body.to_owned(),
        stack_name: name.to_owned(),
        parameters,
        capabilities: options.capabilities.clone(),
        tags: options.tags.clone(),
    }
}

fn operation_failed(
    operation: Operation,
    stack: &str,
    initial_response: StackResponse,
    final_status: StackDescription,
) -> Error {
    Error::OperationFailed {
        operation,
        stack: stack.to_owned(),
        initial_response,
        final_status: Box::new(final_status),
    }
}

fn vanished(name_or_id: &str) -> StackDescription {
    StackDescription {
        stack_id: None,
        stack_name: name_or_id.to_owned(),
        status: StackStatus::DeleteComplete,
        status_reason: Some(String::from("Stack is no longer visible")),
        outputs: Vec::new(),
    }
}

fn provider_error(stack: &str, source: ProviderError) -> Error {
    Error::Provider {
        stack: stack.to_owned(),
        source,
    }
}

async fn read_template(path: &Path) -> Result<String, Error> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|error| Error::FileRead {
            path: path.display().to_string(),
            message: error.to_string(),
        })
}
