//! Daemon startup and lifecycle.
//!
//! Startup fails fast on anything a restart cannot fix: invalid
//! configuration, a missing token or a sink that rejects the credentials.
//! Everything after that is the session's job, which retries forever.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use oxibridge_core::{
    Config, InfluxSink, Link, MetricSink, OxibridgeError, Session, SessionSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::cli::Cli;
use crate::state::AppState;

/// Configuration after files, environment and flags, validated.
///
/// # Errors
///
/// Returns a configuration error if any layer fails to load or the result
/// does not validate.
pub fn load_config(cli: &Cli, env: &HashMap<String, String>) -> Result<Config, OxibridgeError> {
    let mut config = Config::load_from(cli.config.as_deref(), env)?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Run the daemon until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if startup fails. Errors that carry an
/// [`OxibridgeError`] map to its exit code.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let config = load_config(&cli, &env)?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let token = config.sink.resolve_token().map_err(OxibridgeError::from)?;
    let sink = InfluxSink::new(&config.sink.influx_settings(token)).map_err(OxibridgeError::from)?;

    match sink.verify().await {
        Ok(()) => info!(
            url = %config.sink.url,
            org = %config.sink.org,
            bucket = %config.sink.bucket,
            "Sink verified"
        ),
        Err(e) if e.is_retryable() => warn!(
            error = %e,
            url = %config.sink.url,
            "Sink not reachable yet, samples will be retried"
        ),
        Err(e) => return Err(OxibridgeError::from(e).into()),
    }

    let link = open_link(&config).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let session = Session::new(
        link,
        Arc::new(sink) as Arc<dyn MetricSink>,
        SessionSettings::from_config(&config),
    );

    let server = if config.status.enabled {
        let addr = config.status.socket_addr().map_err(OxibridgeError::from)?;
        let state = AppState::new(session.subscribe());
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, token).await {
                error!(error = %e, "Status server failed");
            }
        }))
    } else {
        None
    };

    let summary = session.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Some(server) = server {
        server.await.context("status server task panicked")?;
    }

    info!(
        streams = summary.streams_started,
        written = summary.forwarder.written,
        dropped = summary.forwarder.dropped,
        "oxibridge stopped"
    );
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn open_link(config: &Config) -> anyhow::Result<Box<dyn Link>> {
    let link = oxibridge_core::BluerLink::new(config.device.adapter.as_deref())
        .await
        .map_err(OxibridgeError::from)?;
    Ok(Box::new(link))
}

#[cfg(not(feature = "bluetooth"))]
async fn open_link(_config: &Config) -> anyhow::Result<Box<dyn Link>> {
    Err(OxibridgeError::BluetoothUnavailable(
        "oxibridge was built without the bluetooth feature".to_string(),
    )
    .into())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
        () = token.cancelled() => return,
    }
    token.cancel();
}

/// Exit code for an error returned by [`run`].
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<OxibridgeError>()
        .map_or(2, OxibridgeError::exit_code)
}

/// Machine-readable code for an error returned by [`run`], for the logs.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<OxibridgeError>()
        .map_or("INTERNAL", OxibridgeError::error_code)
}
