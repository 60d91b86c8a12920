//! m17d: M17 station daemon.
//!
//! Binds the gateway, relays its frames to the audio bridges, and takes
//! control lines on stdin.

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use m17_core::config::M17Config;
use m17_services::{LogSink, M17Gateway, RouteMap, StreamAdmission};

mod bridge;
mod control;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = M17Config::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = M17Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        M17Config::default()
    });
    tracing::info!(
        callsign = %config.station.callsign,
        module = %config.station.module,
        net_type = ?config.network.net_type,
        "m17d starting"
    );

    // Route map
    let routes = RouteMap::new();
    match routes.load(&config.routes.file) {
        Ok(n) => tracing::info!(count = n, path = %config.routes.file.display(), "routes loaded"),
        Err(e) => tracing::warn!(error = %e, "no routes loaded"),
    }

    // Operator log
    let bridge_dir = config.ipc.enabled.then(|| config.ipc.bridge_dir.clone());
    let (log, log_lines) = if bridge_dir.is_some() {
        let (log, lines) = LogSink::channel();
        (log, Some(lines))
    } else {
        (LogSink::new(), None)
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Gateway ──────────────────────────────────────────────────────────────
    let admission = StreamAdmission::new();
    let (to_audio, from_gateway) = mpsc::unbounded_channel();
    let (gateway, handle) = M17Gateway::init(
        &config,
        to_audio,
        admission,
        log.clone(),
        shutdown_tx.subscribe(),
    )
    .context("failed to start gateway")?;

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let gateway_task = tokio::spawn(gateway.run());

    let relay_task = tokio::spawn(
        bridge::AudioRelay::new(
            from_gateway,
            bridge_dir.as_deref(),
            log.clone(),
            shutdown_tx.subscribe(),
        )?
        .run(),
    );

    if let Some(dir) = &bridge_dir {
        let socket = bridge::bind_inbound(dir)?;
        tracing::info!(dir = %dir.display(), "audio bridges up");
        let handle = handle.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = bridge::inbound_loop(socket, handle, shutdown).await {
                tracing::error!(error = %e, "am2m17 bridge failed");
            }
        });
        if let Some(lines) = log_lines {
            tokio::spawn(bridge::log_loop(lines, dir.clone(), shutdown_tx.subscribe()));
        }
    }

    let control_task = tokio::spawn(
        control::Control::new(handle, routes.clone(), shutdown_tx.clone()).run(),
    );

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = gateway_task       => tracing::error!("gateway exited: {:?}", r),
        r = relay_task         => tracing::error!("audio relay exited: {:?}", r),
        r = control_task       => tracing::info!("control exited: {:?}", r),
    }

    if let Err(e) = routes.save(&config.routes.file) {
        tracing::warn!(error = %e, "failed to save routes");
    }
    if let Some(dir) = &bridge_dir {
        let _ = std::fs::remove_file(dir.join(bridge::AM2M17));
    }

    Ok(())
}
