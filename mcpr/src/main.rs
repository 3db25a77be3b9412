use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mcp_runner::config::{LogFormat, LogLevel};
use mcp_runner::{Config, Dispatcher, StdioTransport};
use std::path::{Path, PathBuf};
use std::process::exit;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Globals {
    /// Load configuration from this YAML file instead of using the built-in defaults
    #[arg(short, long, value_name = "FILE", global = true, env = "MCPR_CONFIG")]
    config: Option<PathBuf>,

    /// Turn debugging information on.  Repeat for more detail (-d info, -dd debug, -ddd trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Format of the log events written to stderr.  Overrides `logging.format` in the config
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tool calls, reading requests on stdin and responding on stdout (the default)
    ///
    /// Log events are written to stderr.  Runs until stdin is closed or Ctrl-C is pressed.
    #[command(alias = "run")]
    Serve,

    /// Load and validate the configuration, then print the effective settings
    CheckConfig,

    /// Write a configuration file populated with the defaults
    InitConfig {
        /// Where to write the file.  Prints to stdout if omitted
        path: Option<PathBuf>,

        /// Overwrite the file if it already exists
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    async fn execute(self, config: Config) -> anyhow::Result<()> {
        use Commands::*;
        match self {
            Serve => {
                let cancel = CancellationToken::new();
                tokio::spawn({
                    let cancel = cancel.clone();
                    async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("Ctrl-C detected; shutting down");
                            cancel.cancel();
                        }
                    }
                });

                let transport = StdioTransport::stdio(tokio::io::stdin(), tokio::io::stdout())
                    .with_max_line_bytes(config.transport.max_line_bytes);
                let dispatcher = Dispatcher::new(config);
                info!("Listening on stdin");

                mcp_runner::serve(Box::new(transport), &dispatcher, cancel).await?;
            }
            CheckConfig => {
                let yaml = serde_yaml::to_string(&config).context("Failed to render config")?;
                print!("{yaml}");
            }
            InitConfig { path, force } => {
                let yaml = Config::default_yaml()?;
                match path {
                    None => print!("{yaml}"),
                    Some(path) => {
                        write_config(&path, &yaml, force)?;
                        info!(path = %path.display(), "Wrote default config");
                    }
                }
            }
        }

        Ok(())
    }
}

fn write_config(path: &Path, contents: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!(
            "'{}' already exists; use --force to overwrite it",
            path.display()
        );
    }

    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file '{}'", path.display()))
}

fn load_config(globals: &Globals) -> anyhow::Result<Config> {
    match globals.config.as_deref() {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

/// Log events always go to stderr; stdout belongs to the protocol.
fn init_logging(globals: &Globals, config: &Config) -> anyhow::Result<()> {
    let default_log_directive = match globals.debug {
        0 => level_filter(config.logging.level),
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let format = match globals.log_format {
        Some(LogFormatArg::Text) => LogFormat::Text,
        Some(LogFormatArg::Json) => LogFormat::Json,
        None => config.logging.format,
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
    }
    .context("Failed to set subscriber")
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings can come from the config file, so a config that fails to load is reported
    // with default logging
    let config = load_config(&cli.globals);
    let logging_config = config.as_ref().cloned().unwrap_or_default();
    if let Err(e) = init_logging(&cli.globals, &logging_config) {
        eprintln!("{e:#}");
        exit(1);
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    };
    if let Some(config_path) = cli.globals.config.as_deref() {
        debug!("Loaded config from {}", config_path.display());
    }

    let command = cli.command.unwrap_or(Commands::Serve);
    if let Err(e) = command.execute(config).await {
        error!("{:#}", e);
        exit(1);
    }
    debug!("command executed successfully");

    // The stdin reader runs on a blocking thread that may still be waiting for input after a
    // Ctrl-C; don't wait for it
    exit(0);
}
