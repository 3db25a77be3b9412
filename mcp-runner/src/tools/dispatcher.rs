use super::args::split_params;
use super::{ConfiguredArguments, DiscoverArguments, ExecuteArguments, ToolError, ToolHandler};
use super::{DISCOVER_COMMANDS, EXECUTE_COMMAND};
use crate::catalog::{CommandCatalog, Discovery, PatternMatcher};
use crate::config::{CommandConfig, Config};
use crate::executor::{ExecutionRequest, ExecutionResult, Executor};
use serde::Serialize;
use serde_json::Value;
use tracing::*;

/// Routes tool calls to the catalog or the executor, applying configured defaults and limits.
/// Commands from the config are tools of their own, looked up after the built-in ones.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    config: Config,
    executor: Executor,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let executor = Executor::new(&config.execution);
        for command in &config.commands {
            debug!(name = %command.name, command = %command.command, "Registered configured command");
        }
        Self { config, executor }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Search the current executable search path.  The path is read fresh on every call.
    pub fn discover_commands(&self, args: DiscoverArguments) -> Result<Discovery, ToolError> {
        let discovery = &self.config.discovery;
        let matcher =
            PatternMatcher::new(&args.pattern, discovery.match_mode, discovery.case_sensitive)
                .map_err(|e| ToolError::invalid("pattern", e.reason))?;
        let max_results = args
            .max_results
            .unwrap_or(discovery.default_max_results)
            .min(discovery.max_results_limit);

        let catalog = CommandCatalog::from_env(discovery);
        Ok(catalog.discover(&matcher, max_results))
    }

    pub async fn execute_command(&self, args: ExecuteArguments) -> Result<ExecutionResult, ToolError> {
        let request = ExecutionRequest {
            command: args.command,
            args: args.args,
            timeout: self.effective_timeout(args.timeout),
            workdir: args.workdir,
            env: Default::default(),
        };

        Ok(self.executor.execute(&request).await?)
    }

    /// Run a command from the config.  The client's `args` are appended only when the command
    /// allows it; a configured `workdir` wins over the client's.
    pub async fn run_configured(
        &self,
        command: &CommandConfig,
        args: ConfiguredArguments,
    ) -> Result<ExecutionResult, ToolError> {
        if !args.args.is_empty() && !command.allow_args {
            return Err(ToolError::invalid(
                "args",
                format!("'{}' does not accept extra arguments", command.name),
            ));
        }

        let request = ExecutionRequest {
            command: command.command.clone(),
            args: command.args.iter().cloned().chain(args.args).collect(),
            timeout: self.effective_timeout(command.timeout),
            workdir: command.workdir.clone().or(args.workdir),
            env: command.env.clone(),
        };

        Ok(self.executor.execute(&request).await?)
    }

    fn effective_timeout(&self, requested: Option<std::time::Duration>) -> std::time::Duration {
        let execution = &self.config.execution;
        let timeout = requested.unwrap_or(execution.default_timeout);
        if timeout > execution.max_timeout {
            debug!(
                requested = ?timeout,
                max = ?execution.max_timeout,
                "Clamping requested timeout"
            );
        }
        timeout.min(execution.max_timeout)
    }
}

#[async_trait::async_trait]
impl ToolHandler for Dispatcher {
    #[instrument(skip_all, fields(tool = field::Empty))]
    async fn call_tool(&self, params: Option<Value>) -> Result<Value, ToolError> {
        let (name, arguments) = split_params(params)?;
        Span::current().record("tool", name.as_str());

        match name.as_str() {
            DISCOVER_COMMANDS => {
                let args = DiscoverArguments::from_arguments(&arguments)?;
                to_result(self.discover_commands(args)?)
            }
            EXECUTE_COMMAND => {
                let args = ExecuteArguments::from_arguments(&arguments)?;
                to_result(self.execute_command(args).await?)
            }
            _ => match self.config.command(&name) {
                Some(command) => {
                    let args = ConfiguredArguments::from_arguments(&arguments)?;
                    to_result(self.run_configured(command, args).await?)
                }
                None => Err(ToolError::ToolNotFound(name)),
            },
        }
    }
}

fn to_result(value: impl Serialize) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(ToolError::Internal)
}
