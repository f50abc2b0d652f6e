mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use studyhub_connect::{
    BackendClient, ConnectFlow, ConnectionRequest, ConnectionsBackend, MessageBus,
    ModePreference, RaceCoordinator, RuntimeEnvironment, SystemBrowserLauncher,
    SystemBrowserNavigator,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "studyhub", about = "Connect studyhub to your external accounts")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize a provider/service pair and wait for it to connect
    Connect {
        provider: String,
        service: String,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Show the connections known to the backend
    List,
    /// Remove a connection
    Disconnect { provider: String, service: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Popup,
    Redirect,
}

impl From<ModeArg> for ModePreference {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => ModePreference::Auto,
            ModeArg::Popup => ModePreference::Popup,
            ModeArg::Redirect => ModePreference::Redirect,
        }
    }
}

fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("io", "studyhub", "studyhub") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config/default.toml")
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(get_config_path);
    let mut config = Config::load_or_default(&config_path);
    config.apply_env();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

fn backend_client(config: &Config) -> BackendClient {
    let client = BackendClient::new(config.backend.base_url.clone());
    match &config.backend.access_token {
        Some(token) => client.with_access_token(token.clone()),
        None => client,
    }
}

/// The backend's host stands in for the page host: a local backend means a
/// dev setup, where redirect mode is preferred.
fn runtime_environment(config: &Config) -> RuntimeEnvironment {
    let host = url::Url::parse(&config.backend.base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    RuntimeEnvironment::new(host).restrictive(config.connect.restrictive)
}

async fn run(command: Command, config: Config) -> Result<()> {
    let backend = Arc::new(backend_client(&config));

    match command {
        Command::Connect {
            provider,
            service,
            mode,
        } => {
            let mut settings = config.connect.settings();
            if let Some(mode) = mode {
                settings.mode = mode.into();
            }
            let coordinator = RaceCoordinator::new(
                backend,
                Arc::new(SystemBrowserLauncher),
                Arc::new(SystemBrowserNavigator),
                MessageBus::new(),
            )
            .with_settings(settings);

            let request = ConnectionRequest::new(provider, service);
            println!("Connecting {}...", request);
            match coordinator
                .connect(&request, &runtime_environment(&config))
                .await
            {
                ConnectFlow::Redirected { authorization_url } => {
                    println!("Continue in your browser:\n\n  {}\n", authorization_url);
                    println!("Finish authorizing there, then run `studyhub list`.");
                }
                ConnectFlow::Completed(outcome) if outcome.success => match outcome.email {
                    Some(email) => println!("Connected {} as {}", outcome.provider, email),
                    None => println!("Connected {}", outcome.provider),
                },
                ConnectFlow::Completed(outcome) => {
                    let Some(error) = outcome.error else {
                        bail!("Connecting {} failed", outcome.provider);
                    };
                    eprintln!("{}", error.user_message());
                    bail!("Connecting {} failed: {}", outcome.provider, error);
                }
            }
        }
        Command::List => {
            let connections = backend
                .list_connections()
                .await
                .map_err(|e| anyhow::anyhow!("{} ({})", e.user_message(), e))?;
            if connections.is_empty() {
                println!("No connections yet.");
            }
            for conn in connections {
                println!(
                    "{:<12} {:<12} {:<13} {}",
                    conn.provider,
                    conn.service,
                    conn.status_label(),
                    conn.user_email.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Disconnect { provider, service } => {
            let request = ConnectionRequest::new(provider, service);
            backend
                .disconnect(&request)
                .await
                .with_context(|| format!("Could not disconnect {}", request))?;
            println!("Disconnected {}", request);
        }
    }

    Ok(())
}
