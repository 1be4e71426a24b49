//! In-memory stand-ins for the stack and parameter services.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::provider::{
    FetchedParameters, Parameter, ParameterMetadata, ParameterPage, ParameterService,
    ProviderError, PutParameterRequest, StackDescription, StackOutput, StackResponse,
    StackService, StackSpec,
};
use crate::status::StackStatus;
use crate::tags::Tag;

#[derive(Debug, Default)]
pub struct FakeStackState {
    pub stack_name: String,
    pub exists: bool,
    /// Served one per describe call; the last one repeats.
    pub statuses: VecDeque<StackStatus>,
    /// Served before any status.
    pub describe_errors: VecDeque<ProviderError>,
    /// Describe reports the stack as missing once it has been deleted.
    pub vanish_after_delete: bool,
    pub deleted: bool,
    pub create_error: Option<ProviderError>,
    pub update_error: Option<ProviderError>,
    pub template_parameters: Vec<ParameterMetadata>,
    pub template_error: Option<ProviderError>,
    pub outputs: Vec<StackOutput>,
    pub calls: Vec<String>,
    pub specs: Vec<StackSpec>,
    pub templates: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeStackService {
    state: Mutex<FakeStackState>,
}

impl FakeStackService {
    pub fn new(stack_name: &str) -> Self {
        let service = Self::default();
        service.state().stack_name = stack_name.to_owned();
        service
    }

    pub fn state(&self) -> MutexGuard<'_, FakeStackState> {
        self.state.lock().unwrap()
    }

    pub fn stack_id(stack_name: &str) -> String {
        format!("arn:aws:cloudformation:us-west-2:123456789012:stack/{stack_name}/fake")
    }
}

#[async_trait]
impl StackService for FakeStackService {
    async fn create_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("create:{}", spec.stack_name));
        state.specs.push(spec.clone());

        if let Some(error) = state.create_error.clone() {
            return Err(error);
        }
        if state.exists {
            return Err(ProviderError::service(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", spec.stack_name),
            ));
        }

        state.exists = true;
        Ok(StackResponse {
            stack_id: Some(Self::stack_id(&spec.stack_name)),
        })
    }

    async fn update_stack(&self, spec: &StackSpec) -> Result<StackResponse, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("update:{}", spec.stack_name));
        state.specs.push(spec.clone());

        if let Some(error) = state.update_error.clone() {
            return Err(error);
        }
        Ok(StackResponse {
            stack_id: Some(Self::stack_id(&spec.stack_name)),
        })
    }

    async fn delete_stack(&self, name_or_id: &str) -> Result<StackResponse, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("delete:{name_or_id}"));
        state.deleted = true;
        Ok(StackResponse::default())
    }

    async fn describe_stacks(
        &self,
        name_or_id: &str,
    ) -> Result<Vec<StackDescription>, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("describe:{name_or_id}"));

        if let Some(error) = state.describe_errors.pop_front() {
            return Err(error);
        }
        if state.deleted && state.vanish_after_delete {
            return Err(ProviderError::service(
                "ValidationError",
                format!("Stack with id {name_or_id} does not exist"),
            ));
        }

        let status = if state.statuses.len() > 1 {
            state.statuses.pop_front()
        } else {
            state.statuses.front().cloned()
        };

        Ok(status
            .map(|status| StackDescription {
                stack_id: Some(Self::stack_id(&state.stack_name)),
                stack_name: state.stack_name.clone(),
                status,
                status_reason: None,
                outputs: state.outputs.clone(),
            })
            .into_iter()
            .collect())
    }

    async fn get_template_summary(
        &self,
        template_body: &str,
    ) -> Result<Vec<ParameterMetadata>, ProviderError> {
        let mut state = self.state();
        state.calls.push(String::from("summary"));
        state.templates.push(template_body.to_owned());

        match state.template_error.clone() {
            Some(error) => Err(error),
            None => Ok(state.template_parameters.clone()),
        }
    }
}

#[derive(Debug)]
pub struct FakeParameterState {
    pub store: BTreeMap<String, Parameter>,
    pub tags: BTreeMap<String, Vec<Tag>>,
    /// Served before the next put / bulk delete is applied.
    pub put_failures: VecDeque<ProviderError>,
    pub delete_failures: VecDeque<ProviderError>,
    /// Served after the next put has been applied.
    pub put_failures_after_commit: VecDeque<ProviderError>,
    pub page_size: usize,
    pub puts: Vec<PutParameterRequest>,
    pub delete_batches: Vec<Vec<String>>,
    pub get_batches: Vec<Vec<String>>,
    pub path_calls: Vec<Option<String>>,
}

impl Default for FakeParameterState {
    fn default() -> Self {
        Self {
            store: BTreeMap::new(),
            tags: BTreeMap::new(),
            put_failures: VecDeque::new(),
            delete_failures: VecDeque::new(),
            put_failures_after_commit: VecDeque::new(),
            page_size: 10,
            puts: Vec::new(),
            delete_batches: Vec::new(),
            get_batches: Vec::new(),
            path_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeParameterService {
    state: Mutex<FakeParameterState>,
}

impl FakeParameterService {
    pub fn state(&self) -> MutexGuard<'_, FakeParameterState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, name: &str, value: &str) {
        self.state().store.insert(
            name.to_owned(),
            Parameter {
                name: name.to_owned(),
                value: value.to_owned(),
                parameter_type: String::from("String"),
            },
        );
    }
}

fn not_found(name: &str) -> ProviderError {
    ProviderError::service("ParameterNotFound", format!("Parameter {name} not found."))
}

#[async_trait]
impl ParameterService for FakeParameterService {
    async fn put_parameter(&self, request: &PutParameterRequest) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.puts.push(request.clone());

        if let Some(error) = state.put_failures.pop_front() {
            return Err(error);
        }
        if state.store.contains_key(&request.name) && !request.overwrite {
            return Err(ProviderError::service(
                "ParameterAlreadyExists",
                "The parameter already exists. To overwrite this value, set the overwrite option in the request to true.",
            ));
        }

        state.store.insert(
            request.name.clone(),
            Parameter {
                name: request.name.clone(),
                value: request.value.clone(),
                parameter_type: request.parameter_type.as_str().to_owned(),
            },
        );
        state.tags.insert(request.name.clone(), request.tags.clone());

        match state.put_failures_after_commit.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn delete_parameter(&self, name: &str) -> Result<(), ProviderError> {
        match self.state().store.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(name)),
        }
    }

    async fn delete_parameters(&self, names: &[String]) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.delete_batches.push(names.to_vec());

        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error);
        }
        if names.len() > 10 {
            return Err(ProviderError::service(
                "ValidationException",
                "Member must have length less than or equal to 10",
            ));
        }

        Ok(names
            .iter()
            .filter(|name| state.store.remove(name.as_str()).is_some())
            .cloned()
            .collect())
    }

    async fn get_parameter(&self, name: &str) -> Result<Parameter, ProviderError> {
        self.state().store.get(name).cloned().ok_or_else(|| not_found(name))
    }

    async fn get_parameters(&self, names: &[String]) -> Result<FetchedParameters, ProviderError> {
        let mut state = self.state();
        state.get_batches.push(names.to_vec());

        let mut fetched = FetchedParameters::default();
        for name in names {
            match state.store.get(name) {
                Some(parameter) => fetched.parameters.push(parameter.clone()),
                None => fetched.invalid.push(name.clone()),
            }
        }
        Ok(fetched)
    }

    async fn get_parameters_by_path(
        &self,
        path: &str,
        next_token: Option<&str>,
    ) -> Result<ParameterPage, ProviderError> {
        let mut state = self.state();
        state.path_calls.push(next_token.map(str::to_owned));

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let matching: Vec<Parameter> = state
            .store
            .values()
            .filter(|parameter| parameter.name.starts_with(&prefix))
            .cloned()
            .collect();

        let offset: usize = next_token.map(|token| token.parse().unwrap()).unwrap_or(0);
        let end = (offset + state.page_size).min(matching.len());
        Ok(ParameterPage {
            parameters: matching[offset..end].to_vec(),
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }
}
