/// Error types for the mcp-runner crate.  Component-level failures that have to reach the wire
/// protocol have their own `thiserror` types ([`crate::executor::ExecError`],
/// [`crate::tools::ToolError`]); everything else is plumbing and uses anyhow.
pub type Result<T> = anyhow::Result<T>;
