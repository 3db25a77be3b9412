//! Typed tool arguments, validated out of the loosely-typed JSON a client sends.
//!
//! Validation is done by hand rather than with `#[derive(Deserialize)]` so that every failure can
//! name the exact field at fault (including the index into `args`).  Defaults and clamping depend
//! on configuration and are applied by the dispatcher, not here.
use super::ToolError;
use crate::duration;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Arguments of a `tools/call`, split into the tool name and its argument object.
pub(crate) fn split_params(params: Option<Value>) -> Result<(String, Map<String, Value>), ToolError> {
    let mut params = match params {
        Some(Value::Object(params)) => params,
        Some(_) => return Err(ToolError::invalid("params", "must be an object")),
        None => return Err(ToolError::invalid("params", "is required")),
    };

    let name = match params.remove("name") {
        Some(Value::String(name)) => name,
        Some(_) => return Err(ToolError::invalid("name", "must be a string")),
        None => return Err(ToolError::invalid("name", "is required")),
    };

    let arguments = match params.remove("arguments") {
        Some(Value::Object(arguments)) => arguments,
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(ToolError::invalid("arguments", "must be an object")),
    };

    Ok((name, arguments))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoverArguments {
    pub pattern: String,
    pub max_results: Option<usize>,
}

impl DiscoverArguments {
    pub fn from_arguments(arguments: &Map<String, Value>) -> Result<Self, ToolError> {
        let pattern = required_string(arguments, "pattern")?;

        let max_results = match optional(arguments, "max_results") {
            None => None,
            Some(value) => {
                let n = value
                    .as_u64()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| ToolError::invalid("max_results", "must be a positive integer"))?;
                Some(usize::try_from(n).unwrap_or(usize::MAX))
            }
        };

        Ok(Self {
            pattern,
            max_results,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteArguments {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub workdir: Option<PathBuf>,
}

impl ExecuteArguments {
    pub fn from_arguments(arguments: &Map<String, Value>) -> Result<Self, ToolError> {
        let command = required_string(arguments, "command")?;
        if command.is_empty() {
            return Err(ToolError::invalid("command", "must not be empty"));
        }

        let args = parse_args(arguments)?;
        let timeout = optional(arguments, "timeout").map(parse_timeout).transpose()?;
        let workdir = parse_workdir(arguments)?;

        Ok(Self {
            command,
            args,
            timeout,
            workdir,
        })
    }
}

/// What a client may pass to a command exposed from the config.  Everything else about the run is
/// fixed by the config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfiguredArguments {
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl ConfiguredArguments {
    pub fn from_arguments(arguments: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(Self {
            args: parse_args(arguments)?,
            workdir: parse_workdir(arguments)?,
        })
    }
}

fn parse_args(arguments: &Map<String, Value>) -> Result<Vec<String>, ToolError> {
    match optional(arguments, "args") {
        None => Ok(vec![]),
        Some(Value::Array(values)) => values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ToolError::invalid(format!("args[{index}]"), "must be a string"))
            })
            .collect(),
        Some(_) => Err(ToolError::invalid("args", "must be an array of strings")),
    }
}

fn parse_workdir(arguments: &Map<String, Value>) -> Result<Option<PathBuf>, ToolError> {
    match optional(arguments, "workdir") {
        None => Ok(None),
        Some(Value::String(workdir)) => validate_workdir(workdir).map(Some),
        Some(_) => Err(ToolError::invalid("workdir", "must be a string")),
    }
}

/// An argument that is absent or explicitly `null` is treated the same way
fn optional<'a>(arguments: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    arguments.get(field).filter(|value| !value.is_null())
}

fn required_string(arguments: &Map<String, Value>, field: &str) -> Result<String, ToolError> {
    match optional(arguments, field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ToolError::invalid(field, "must be a string")),
        None => Err(ToolError::invalid(field, "is required")),
    }
}

/// Timeouts come either as a duration string (`"5s"`) or as a number of seconds
fn parse_timeout(value: &Value) -> Result<Duration, ToolError> {
    let timeout = match value {
        Value::String(s) => {
            duration::parse_duration(s).map_err(|e| ToolError::invalid("timeout", e.to_string()))?
        }
        Value::Number(n) => n
            .as_f64()
            .and_then(duration::from_secs_f64)
            .ok_or_else(|| ToolError::invalid("timeout", "must be a non-negative number of seconds"))?,
        _ => {
            return Err(ToolError::invalid(
                "timeout",
                "must be a duration string or a number of seconds",
            ))
        }
    };

    if timeout.is_zero() {
        return Err(ToolError::invalid("timeout", "must be greater than zero"));
    }
    Ok(timeout)
}

fn validate_workdir(workdir: &str) -> Result<PathBuf, ToolError> {
    let path = PathBuf::from(workdir);
    if !path.is_absolute() {
        return Err(ToolError::invalid("workdir", "must be an absolute path"));
    }

    match std::fs::metadata(&path) {
        Ok(metadata) if metadata.is_dir() => Ok(path),
        Ok(_) => Err(ToolError::invalid(
            "workdir",
            format!("'{workdir}' is not a directory"),
        )),
        Err(e) => Err(ToolError::invalid(
            "workdir",
            format!("'{workdir}' is not accessible: {e}"),
        )),
    }
}
