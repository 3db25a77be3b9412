pub mod catalog;
pub mod config;
pub mod duration;
mod error;
pub mod executor;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::Result;
pub use session::serve;
pub use tools::Dispatcher;
pub use transport::{McpTransport, RequestLine, StdioTransport, StreamTransport};

#[cfg(test)]
pub mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }

    /// Write an executable file named `name` into `dir`, returning its path.
    #[cfg(unix)]
    pub fn fake_executable(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
