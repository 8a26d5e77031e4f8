use index_reconciler_lib::{
    cli::parse_args,
    config::Config,
    logging::{format_error_report, init_logging},
    server::{register_metrics, setup_server_with_addr},
    state::AppState,
    stores::ServiceConnector,
    sync_service::{SyncService, SyncSettings},
};
use std::sync::Arc;

use dotenv::dotenv;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels the shared token when a SIGTERM or SIGINT signal is received.
async fn handle_shutdown_signals(state: Arc<AppState>) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(
                event = "signal_handler_failed",
                error = %err,
                "could not register shutdown signal handlers"
            );
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
        _ = state.shutdown_token.cancelled() => return,
    }

    state.shutdown_token.cancel();
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let args = parse_args();
    let mode = if args.once { "once" } else { "loop" };
    let logging_context = init_logging("index_reconciler", mode, &args.log_level);
    let run_span = tracing::info_span!(
        "reconciler_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id
    );
    let _run_guard = run_span.enter();

    let config = match Config::from_env().and_then(|mut config| {
        args.apply_to(&mut config)?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(err) => {
            error!(
                event = "config_invalid",
                error = %err,
                report = %format_error_report(&err),
                "configuration incorrectly specified"
            );
            std::process::exit(2);
        }
    };
    let filter = match config.tag_filter() {
        Ok(filter) => filter,
        Err(err) => {
            error!(event = "config_invalid", error = %err, "invalid INCLUSIVE_TAGS expression");
            std::process::exit(2);
        }
    };
    info!(
        event = "reconciler_starting",
        source_table = %config.source_table,
        index_name = %config.index_name,
        retention_days = config.retention_days,
        inclusive_tags = %config.inclusive_tags,
        "starting index reconciler"
    );

    let state = Arc::new(AppState::new(CancellationToken::new()));
    let shutdown_handle = tokio::spawn(handle_shutdown_signals(state.clone()));

    let mut service = SyncService::new(
        ServiceConnector::from_config(&config),
        SyncSettings::from_config(&config),
        filter,
    );

    let exit_code = if args.once {
        register_metrics(&state).await;
        match service.run_once(&state.shutdown_token).await {
            Ok(report) => {
                info!(
                    event = "single_cycle_completed",
                    checked = report.checked,
                    mismatches = report.mismatches,
                    records_pushed = report.records_pushed,
                    expired = report.expired,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    plan = %service.plan(),
                    "single reconciliation cycle completed"
                );
                0
            }
            Err(err) => {
                error!(
                    event = "single_cycle_failed",
                    error = %err,
                    report = %format_error_report(&err),
                    "single reconciliation cycle failed"
                );
                1
            }
        }
    } else {
        let server_handle = match setup_server_with_addr(state.clone(), config.metrics_addr).await
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    event = "monitoring_server_unavailable",
                    addr = %config.metrics_addr,
                    error = %err,
                    "could not bind monitoring server; continuing without it"
                );
                None
            }
        };

        service.run(state.shutdown_token.clone()).await;

        if let Some(handle) = server_handle {
            if let Err(err) = handle.await {
                warn!(
                    event = "monitoring_server_join_failed",
                    error = %err,
                    "monitoring server task failed"
                );
            }
        }
        0
    };

    state.shutdown_token.cancel();
    let _ = shutdown_handle.await;
    info!(event = "reconciler_stopped", exit_code, "index reconciler stopped");

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
