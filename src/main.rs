use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use geo_tunnel::config::{AppSettings, TunnelSettings};
use geo_tunnel::controller::TunnelController;
use geo_tunnel::logging::{self, LogLevel};
use geo_tunnel::network_session::{LogOnly, NetworkSession, ProxyRules, RulesFile};
use geo_tunnel::probe;
use geo_tunnel::resume::ResumeMonitor;
use geo_tunnel::ssh_transport::SshConnector;

#[derive(Parser, Debug)]
#[command(name = "geo-tunnel")]
#[command(version, about = "Relay a browser session through an SSH host", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit structured JSON log lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel and serve until Ctrl-C
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// Write the active proxy rule to this file
        #[arg(long)]
        rules_file: Option<PathBuf>,
    },
    /// Check that the host is reachable and the agent can authenticate
    Test {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
    /// Show or change the saved host and user
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    Set {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// SSH host (overrides saved setting and SSH_HOST)
    #[arg(long)]
    host: Option<String>,

    /// SSH user (overrides saved setting and SSH_USER)
    #[arg(long)]
    user: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(LogLevel::from_flags(cli.verbose, cli.quiet), cli.json_logs);

    // Classified errors carry their user-facing text in Display.
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), Box<dyn Error>> {
    let settings_path = AppSettings::default_path()?;
    let saved = AppSettings::load_from(&settings_path);

    match command {
        Command::Connect { target, rules_file } => {
            let config = saved.resolve(target.host, target.user);
            let session: Arc<dyn NetworkSession> = match rules_file {
                Some(path) => Arc::new(RulesFile::new(path)),
                None => Arc::new(LogOnly),
            };
            let controller = Arc::new(TunnelController::new(Arc::new(SshConnector::new(
                TunnelSettings::from_env(),
            ))));

            let addr = controller.initialize(Arc::clone(&session), config).await?;
            println!("{}", ProxyRules::Socks5(addr));

            let cancel = CancellationToken::new();
            let monitor = ResumeMonitor::default().spawn(Arc::clone(&controller), cancel.clone());

            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            let _ = monitor.await;
            controller.teardown(Some(&*session)).await?;
        }
        Command::Test { target, timeout_ms } => {
            let config = saved.resolve(target.host, target.user);
            let connector = SshConnector::new(TunnelSettings::from_env());
            let timeout = std::time::Duration::from_millis(timeout_ms);
            let report = probe::test(&connector, &config, timeout).await?;
            println!("Connected to {} in {} ms", config.host, report.latency_ms);
        }
        Command::Settings { action } => match action {
            SettingsAction::Show => {
                println!("{}", serde_json::to_string_pretty(&saved)?);
                println!("# {}", settings_path.display());
            }
            SettingsAction::Set { target } => {
                let mut updated = saved;
                updated.merge(target.host, target.user);
                updated.save_to(&settings_path)?;
                println!("Saved {}", settings_path.display());
            }
        },
    }

    Ok(())
}
