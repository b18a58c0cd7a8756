//! chatbridge CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "chatbridge", version)]
#[command(about = "Normalizes one chat platform's events onto the canonical event bus")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Which platform this process adapts. Required for `start`/`restart`.
    #[arg(short, long, global = true, value_enum)]
    platform: Option<Platform>,

    /// Path to the platform's YAML config file
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Platform {
    Discord,
    Slack,
    Telegram,
    Zulip,
    Shell,
    TextFile,
}

impl Platform {
    fn as_str(self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Slack => "slack",
            Platform::Telegram => "telegram",
            Platform::Zulip => "zulip",
            Platform::Shell => "shell",
            Platform::TextFile => "text_file",
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start the adapter daemon (default when no subcommand is given)
    Start {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running adapter daemon
    Stop,
    /// Restart the adapter daemon (stop + start)
    Restart {
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show status of the running adapter daemon
    Status,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { foreground: false });

    match command {
        Command::Start { foreground } => cmd_start(cli.platform, cli.config, cli.debug, foreground),
        Command::Stop => cmd_stop(cli.platform),
        Command::Restart { foreground } => {
            cmd_stop_if_running(cli.platform);
            cmd_start(cli.platform, cli.config, cli.debug, foreground)
        }
        Command::Status => cmd_status(cli.platform),
    }
}

fn require_platform(platform: Option<Platform>) -> anyhow::Result<Platform> {
    platform.context("--platform is required (discord, slack, telegram, zulip, shell, text-file)")
}

fn daemon_paths(platform: Platform) -> chatbridge::daemon::DaemonPaths {
    let instance_dir = chatbridge::daemon::DaemonPaths::default_instance_dir().join(platform.as_str());
    chatbridge::daemon::DaemonPaths::new(&instance_dir)
}

fn load_config(
    config_path: &Option<std::path::PathBuf>,
) -> anyhow::Result<chatbridge::config::Config> {
    let path = config_path
        .clone()
        .context("--config is required (path to the platform's YAML config file)")?;
    chatbridge::config::Config::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn cmd_start(
    platform: Option<Platform>,
    config_path: Option<std::path::PathBuf>,
    debug: bool,
    foreground: bool,
) -> anyhow::Result<()> {
    let platform = require_platform(platform)?;
    let paths = daemon_paths(platform);

    if let Some(pid) = chatbridge::daemon::is_running(&paths) {
        eprintln!("chatbridge ({}) is already running (pid {pid})", platform.as_str());
        std::process::exit(1);
    }

    let config = load_config(&config_path)?;

    if !foreground {
        chatbridge::daemon::daemonize(&paths)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        if foreground {
            chatbridge::daemon::init_foreground_tracing(debug);
        } else {
            chatbridge::daemon::init_background_tracing(&paths, debug);
        }

        run(platform, config, paths).await
    })
}

#[tokio::main]
async fn cmd_stop(platform: Option<Platform>) -> anyhow::Result<()> {
    let platform = require_platform(platform)?;
    let paths = daemon_paths(platform);

    let Some(pid) = chatbridge::daemon::is_running(&paths) else {
        eprintln!("chatbridge ({}) is not running", platform.as_str());
        std::process::exit(1);
    };

    match chatbridge::daemon::send_command(&paths, chatbridge::daemon::IpcCommand::Shutdown).await {
        Ok(chatbridge::daemon::IpcResponse::Ok) => {
            eprintln!("stopping chatbridge ({}, pid {pid})...", platform.as_str());
        }
        Ok(chatbridge::daemon::IpcResponse::Error { message }) => {
            eprintln!("shutdown failed: {message}");
            std::process::exit(1);
        }
        Ok(_) => {
            eprintln!("unexpected response from daemon");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("failed to send shutdown command: {error}");
            std::process::exit(1);
        }
    }

    if chatbridge::daemon::wait_for_exit(pid) {
        eprintln!("chatbridge ({}) stopped", platform.as_str());
    } else {
        eprintln!("chatbridge ({}) did not stop within 10 seconds (pid {pid})", platform.as_str());
        std::process::exit(1);
    }

    Ok(())
}

/// Stop if running, don't error if not — used ahead of `restart`.
fn cmd_stop_if_running(platform: Option<Platform>) {
    let Some(platform) = platform else { return };
    let paths = daemon_paths(platform);

    let Some(pid) = chatbridge::daemon::is_running(&paths) else {
        return;
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        return;
    };

    runtime.block_on(async {
        if let Ok(chatbridge::daemon::IpcResponse::Ok) =
            chatbridge::daemon::send_command(&paths, chatbridge::daemon::IpcCommand::Shutdown).await
        {
            eprintln!("stopping chatbridge ({}, pid {pid})...", platform.as_str());
            chatbridge::daemon::wait_for_exit(pid);
        }
    });
}

fn cmd_status(platform: Option<Platform>) -> anyhow::Result<()> {
    let platform = require_platform(platform)?;
    let paths = daemon_paths(platform);

    let Some(_pid) = chatbridge::daemon::is_running(&paths) else {
        eprintln!("chatbridge ({}) is not running", platform.as_str());
        std::process::exit(1);
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        match chatbridge::daemon::send_command(&paths, chatbridge::daemon::IpcCommand::Status).await {
            Ok(chatbridge::daemon::IpcResponse::Status { pid, uptime_seconds }) => {
                let hours = uptime_seconds / 3600;
                let minutes = (uptime_seconds % 3600) / 60;
                let seconds = uptime_seconds % 60;
                eprintln!("chatbridge ({}) is running", platform.as_str());
                eprintln!("  pid:    {pid}");
                eprintln!("  uptime: {hours}h {minutes}m {seconds}s");
            }
            Ok(chatbridge::daemon::IpcResponse::Error { message }) => {
                eprintln!("status query failed: {message}");
                std::process::exit(1);
            }
            Ok(_) => {
                eprintln!("unexpected response from daemon");
                std::process::exit(1);
            }
            Err(error) => {
                eprintln!("failed to query daemon status: {error}");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

/// Builds the configured adapter and runs it until `stop`/a signal requests
/// shutdown. One process always runs exactly one platform adapter, matching
/// spec.md §5's "single-threaded cooperative concurrency within each adapter
/// process" scheduling model.
async fn run(
    platform: Platform,
    config: chatbridge::config::Config,
    paths: chatbridge::daemon::DaemonPaths,
) -> anyhow::Result<()> {
    use chatbridge::messaging::Messaging as _;

    tracing::info!(platform = platform.as_str(), "starting chatbridge");

    let (shutdown_rx, _ipc_handle) = chatbridge::daemon::start_ipc_server(&paths)
        .await
        .context("failed to start IPC server")?;

    let result = match platform {
        Platform::Discord => {
            chatbridge::messaging::discord::DiscordAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
        Platform::Slack => {
            chatbridge::messaging::slack::SlackAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
        Platform::Telegram => {
            chatbridge::messaging::telegram::TelegramAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
        Platform::Zulip => {
            chatbridge::messaging::zulip::ZulipAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
        Platform::Shell => {
            chatbridge::messaging::shell::ShellAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
        Platform::TextFile => {
            chatbridge::messaging::text_file::TextFileAdapter::from_config(&config)?
                .run(shutdown_rx)
                .await
        }
    };

    chatbridge::daemon::cleanup(&paths);
    result.map_err(Into::into)
}
