//! The tools this server exposes, and the validation boundary in front of them.
//!
//! Everything that arrives in `tools/call` params is checked here.  Past this point the catalog
//! and executor only ever see well-typed arguments.
mod args;
mod dispatcher;

pub use args::{ConfiguredArguments, DiscoverArguments, ExecuteArguments};
pub use dispatcher::Dispatcher;

use crate::executor::ExecError;
use crate::protocol::ErrorKind;
use serde_json::Value;
use thiserror::Error;

pub const DISCOVER_COMMANDS: &str = "discover_commands";
pub const EXECUTE_COMMAND: &str = "execute_command";

/// Failure of a single tool call.  Each variant corresponds to one error kind on the wire.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid argument '{field}': {reason}")]
    InvalidArguments { field: String, reason: String },

    #[error(transparent)]
    CommandNotFound(ExecError),

    #[error(transparent)]
    ExecutionFailed(ExecError),

    #[error("Failed to encode tool result")]
    Internal(#[source] serde_json::Error),
}

impl ToolError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            ToolError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            ToolError::CommandNotFound(_) => ErrorKind::CommandNotFound,
            ToolError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            ToolError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<ExecError> for ToolError {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::CommandNotFound { .. } => ToolError::CommandNotFound(error),
            ExecError::SpawnFailed { .. } | ExecError::WaitFailed { .. } => {
                ToolError::ExecutionFailed(error)
            }
        }
    }
}

/// Something that can answer `tools/call` requests.  [`Dispatcher`] is the real implementation;
/// the session only depends on this trait.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handle the `params` of a `tools/call` request, returning the `result` payload.
    async fn call_tool(&self, params: Option<Value>) -> Result<Value, ToolError>;
}
