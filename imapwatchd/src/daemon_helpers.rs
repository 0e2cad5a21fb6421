fn default_database_url() -> String {
    let path = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATA_DIR_NAME)
        .join(DEFAULT_DATABASE_FILE);
    format!("sqlite://{}", path.display())
}

/// On-disk file behind a sqlite URL, if it has one.
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed waiting for SIGINT")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    Ok("ctrl-c")
}

async fn shutdown_requested(stop: CancellationToken) -> ShutdownReason {
    tokio::select! {
        signal = wait_for_signal() => signal_reason(signal),
        _ = stop.cancelled() => ShutdownReason::Requested,
    }
}

fn signal_reason(signal: anyhow::Result<&'static str>) -> ShutdownReason {
    match signal {
        Ok(name) => ShutdownReason::Signal(name),
        Err(err) => {
            tracing::error!(error = ?err, "signal handling failed");
            ShutdownReason::SignalHandlerFailed
        }
    }
}

/// A mailbox connection that gives up stays `Failed`; other accounts keep
/// being watched.
fn account_connection_failed(err: ConnectError) {
    tracing::error!(error = %err, "giving up on account connection");
}

fn log_aggregate(err: &AggregateError) {
    tracing::warn!(error = %err, "some connections did not close cleanly");
    for failure in &err.failures {
        tracing::warn!(error = %failure, "close failed");
    }
}
