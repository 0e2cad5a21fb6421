use std::process::ExitCode;

use imapwatchd::daemon::{DaemonConfig, DaemonRuntime};
use imapwatchd::logging::init_logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: imapwatchd [--help]");
    println!();
    println!("Watches IMAP accounts and triggers the sync worker on mailbox changes.");
    println!("Configuration is read from the environment and an optional .env file:");
    println!("  WATCHER_SYNC_PATH            sync worker executable (required)");
    println!("  WATCHER_DATABASE_URL         sqlite URL of the status database");
    println!("  WATCHER_MAX_ATTEMPTS_COUNT   connect attempts before giving up (3)");
    println!("  WATCHER_ATTEMPTS_TIMEOUT     delay between attempts in ms (300)");
    println!("  WATCHER_ERROR_LOG_PATH       directory for daily warning/error logs");
    println!("  WATCHER_IDLE_TIMEOUT_SECS    IDLE re-issue interval (1500)");
    println!("  MAIL_TLS, MAIL_TLS_ACCEPT_INVALID_CERTS, MAIL_AUTH_TIMEOUT, MAIL_CONN_TIMEOUT");
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    if parse_cli_mode(std::env::args())? == CliMode::Help {
        print_usage();
        return Ok(ExitCode::SUCCESS);
    }
    let config = DaemonConfig::from_env()?;
    let _log_guard = init_logging(&config.log)?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    let outcome = daemon.run().await?;
    Ok(outcome.exit_code())
}
