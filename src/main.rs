// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use queue_watcher::{
    configs::Configs,
    errors::HandlerError,
    handler::MessageHandler,
    health::{self, HealthState},
    logging,
    message::MessageBody,
    watcher::WatcherService,
};
use std::{process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default handler of the standalone binary: logs what it receives.
struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, body: MessageBody<'_>) -> Result<(), HandlerError> {
        info!(bytes = body.as_bytes().len(), body = body.as_text(), "message received");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let configs = match Configs::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = err.to_string(), "fatal configuration error");
            return ExitCode::FAILURE;
        }
    };

    let watcher = WatcherService::new(configs.clone(), Arc::new(LogHandler));
    if let Err(err) = watcher.start().await {
        error!(error = err.to_string(), "fatal configuration error");
        return ExitCode::FAILURE;
    }

    let http_shutdown = CancellationToken::new();
    let http = tokio::spawn(health::serve(
        HealthState::new(configs.app.clone(), watcher.subscribe()),
        configs.app.port,
        http_shutdown.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown signal received");

    watcher.stop().await;
    http_shutdown.cancel();
    match http.await {
        Ok(Err(err)) => error!(error = err.to_string(), "health server failure"),
        Err(err) => error!(error = err.to_string(), "health server task failure"),
        Ok(Ok(())) => {}
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
