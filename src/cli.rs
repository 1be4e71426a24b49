//! Command line surface: argument parsing and the glue between config, the
//! AWS adapters and the orchestration layer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::aws::{self, AwsSettings, CloudFormationService, ParameterStoreService};
use crate::config::{self, Config, ScalarValue, StackEntry, DEFAULT_CONFIG_FILE};
use crate::parameters::ParameterStore;
use crate::stack::{DeployOptions, StackOrchestrator};
use crate::tags::Tag;
use crate::template::{self, ParameterPrompt};
use crate::writer;

/// Deploy CloudFormation stacks and manage SSM parameters in bulk
#[derive(Parser, Debug)]
#[command(name = "cfn-deployer")]
#[command(version)]
#[command(about = "Deploy CloudFormation stacks and manage SSM parameters in bulk", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        global = true,
        env = "CFN_DEPLOYER_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// AWS region (overrides config file)
    #[arg(long, value_name = "REGION", global = true)]
    pub region: Option<String>,

    /// Shared config profile (overrides config file)
    #[arg(long, value_name = "PROFILE", global = true)]
    pub profile: Option<String>,

    /// More output per occurrence; RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deploy the configured stacks, one after the other
    Deploy {
        /// Only deploy this stack
        #[arg(long, value_name = "NAME")]
        stack: Option<String>,
    },
    /// Delete a stack and wait until it is gone
    Teardown { stack: String },
    /// Print the current state of a stack
    Status { stack: String },
    /// Print the parameters declared by templates
    TemplateParams {
        #[arg(required = true, value_name = "TEMPLATE")]
        files: Vec<PathBuf>,

        /// YAML/JSON map of parameter values to resolve against the templates
        #[arg(long, value_name = "FILE")]
        values: Option<PathBuf>,

        /// Print `--parameter-overrides K=V ...` instead of JSON
        #[arg(long)]
        as_parameter_overrides: bool,
    },
    /// Manage SSM parameters
    Params {
        #[command(subcommand)]
        command: ParamsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ParamsCommand {
    /// Create parameters, failing on the first one that already exists
    Create {
        /// YAML/JSON map of parameter definitions
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        /// Tag applied to every parameter, may be repeated
        #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = parse_tag)]
        tags: Vec<Tag>,
    },
    /// Create or overwrite parameters
    Upsert {
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = parse_tag)]
        tags: Vec<Tag>,
    },
    /// Delete parameters by name
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print a single parameter
    Get { name: String },
    /// Print several parameters, reporting unknown names
    GetMany {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print or save every parameter below a path
    List {
        path: String,

        /// Write to a `.json` or `.env` file instead of printing
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Deploy { stack } => {
            let config = config::parse(&cli.config)
                .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
            let entries = select_stacks(&config, stack.as_deref())?;

            let sdk_config = aws::load_sdk_config(&settings(&cli, Some(&config))).await;
            let orchestrator = StackOrchestrator::new(CloudFormationService::new(&sdk_config));
            for entry in entries {
                deploy_stack(&orchestrator, entry).await?;
            }
            Ok(())
        }
        Command::Teardown { stack } => {
            let orchestrator = StackOrchestrator::new(CloudFormationService::new(
                &aws::load_sdk_config(&optional_settings(&cli)?).await,
            ));
            let result = orchestrator.teardown_stack(stack).await?;
            print_json(&result)
        }
        Command::Status { stack } => {
            let orchestrator = StackOrchestrator::new(CloudFormationService::new(
                &aws::load_sdk_config(&optional_settings(&cli)?).await,
            ));
            match orchestrator.retrieve_stack_status(stack).await? {
                Some(description) => print_json(&description),
                None => bail!("Stack not found: {}", stack),
            }
        }
        Command::TemplateParams {
            files,
            values,
            as_parameter_overrides,
        } => {
            let values = values.as_deref().map(read_values).transpose()?;
            let service = CloudFormationService::new(
                &aws::load_sdk_config(&optional_settings(&cli)?).await,
            );

            let declared = template::load_parameters_from_files(&service, files).await?;
            let prompts = template::convert_parameters_to_prompts(&declared)?;
            print_template_params(&prompts, values, *as_parameter_overrides)
        }
        Command::Params { command } => run_params(&cli, command).await,
    }
}

async fn run_params(cli: &Cli, command: &ParamsCommand) -> Result<()> {
    // inputs are read before any AWS call
    let definitions = match command {
        ParamsCommand::Create { file, .. } | ParamsCommand::Upsert { file, .. } => {
            Some(read_definitions(file)?)
        }
        _ => None,
    };

    let store = ParameterStore::new(ParameterStoreService::new(
        &aws::load_sdk_config(&optional_settings(cli)?).await,
    ));

    match (command, definitions) {
        (ParamsCommand::Create { tags, .. }, Some(definitions)) => {
            print_json(&store.create(&definitions, tags).await?)
        }
        (ParamsCommand::Upsert { tags, .. }, Some(definitions)) => {
            print_json(&store.upsert(&definitions, tags).await?)
        }
        (ParamsCommand::Delete { names }, _) => {
            let deleted = match names.as_slice() {
                [name] => {
                    store.delete(name).await?;
                    vec![name.clone()]
                }
                _ => store.delete_multiple(names).await?,
            };
            print_json(&deleted)
        }
        (ParamsCommand::Get { name }, _) => print_json(&store.retrieve(name).await?),
        (ParamsCommand::GetMany { names }, _) => {
            let fetched = store.retrieve_multiple(names).await?;
            if !fetched.invalid.is_empty() {
                log::warn!("Unknown parameters: {}", fetched.invalid.join(", "));
            }
            print_json(&fetched)
        }
        (ParamsCommand::List { path, output }, _) => {
            let parameters = store.retrieve_all_by_path(path).await?;
            match output {
                Some(output) => Ok(writer::write_parameters(output, &parameters)?),
                None => print_json(&parameters),
            }
        }
        (ParamsCommand::Create { .. } | ParamsCommand::Upsert { .. }, None) => {
            bail!("No parameter definitions were read")
        }
    }
}

async fn deploy_stack(
    orchestrator: &StackOrchestrator<CloudFormationService>,
    entry: &StackEntry,
) -> Result<()> {
    let template_body = tokio::fs::read_to_string(&entry.template)
        .await
        .with_context(|| format!("Failed to read template {}", entry.template.display()))?;

    let declared = template::extract_parameters(orchestrator.service(), &template_body).await?;
    let prompts = template::convert_parameters_to_prompts(&declared)?;
    let parameters = template::resolve_parameter_values(&prompts, &entry.parameter_values())?;
    let options = DeployOptions {
        capabilities: entry.capabilities.clone(),
        tags: entry.tags()?,
    };

    let result = orchestrator
        .deploy_template(entry.name(), &template_body, parameters, &options)
        .await?;

    if let Some(outputs) = &entry.outputs {
        writer::write_outputs(&outputs.location, &result.final_status.outputs)?;
    }
    print_json(&result)
}

fn select_stacks<'a>(config: &'a Config, only: Option<&str>) -> Result<Vec<&'a StackEntry>> {
    match only {
        Some(name) => match config.stack(name) {
            Some(entry) => Ok(vec![entry]),
            None => bail!("Stack {} is not configured", name),
        },
        None => Ok(config.stacks.iter().collect()),
    }
}

/// Command line flags win over the config file.
fn settings(cli: &Cli, config: Option<&Config>) -> AwsSettings {
    AwsSettings {
        region: cli
            .region
            .clone()
            .or_else(|| config.and_then(|config| config.region.clone())),
        profile: cli
            .profile
            .clone()
            .or_else(|| config.and_then(|config| config.profile.clone())),
    }
}

/// Commands other than deploy only consult the config file when it exists.
fn optional_settings(cli: &Cli) -> Result<AwsSettings> {
    if !cli.config.exists() {
        return Ok(settings(cli, None));
    }

    let config = config::parse(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    Ok(settings(cli, Some(&config)))
}

fn print_template_params(
    prompts: &[ParameterPrompt],
    values: Option<BTreeMap<String, String>>,
    as_parameter_overrides: bool,
) -> Result<()> {
    if values.is_none() && !as_parameter_overrides {
        return print_json(&prompts);
    }

    let parameters = template::resolve_parameter_values(prompts, &values.unwrap_or_default())?;
    if as_parameter_overrides {
        println!("{}", template::format_parameter_overrides(&parameters));
        Ok(())
    } else {
        print_json(&parameters)
    }
}

fn parse_tag(raw: &str) -> Result<Tag, String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok(Tag::new(key.trim(), value)),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn read_definitions(path: &Path) -> Result<Map<String, Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter definitions {}", path.display()))?;
    let definitions: Value = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse parameter definitions {}", path.display()))?;

    match definitions {
        Value::Object(definitions) => Ok(definitions),
        other => bail!(
            "Parameter definitions in {} must be a map, got {}",
            path.display(),
            other
        ),
    }
}

fn read_values(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameter values {}", path.display()))?;
    let values: BTreeMap<String, ScalarValue> = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse parameter values {}", path.display()))?;

    Ok(values
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
