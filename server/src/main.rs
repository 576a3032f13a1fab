//! Browser terminal daemon entry point: parse CLI flags, load configuration,
//! build the session registry and HTTP/WebSocket router, and serve until a
//! termination signal triggers graceful shutdown (spec §3 "process-wide
//! teardown on shutdown signal destroys all sessions").

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tty_core::config::{self, DaemonConfig};
use tty_core::registry::SessionRegistry;

/// Browser terminal daemon.
#[derive(Parser, Debug)]
#[command(name = "tty-server", version, about)]
struct Cli {
    /// Host:port the message channel and companion HTTP surface listen on.
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML config file; missing or absent fields fall back to
    /// defaults, then to environment overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shell command line to spawn for every new session, e.g. `--shell
    /// "bash -l"`. Overrides the configured `shell_argv`.
    #[arg(long)]
    shell: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(shell) = cli.shell {
        cfg.shell_argv = shell.split_whitespace().map(str::to_string).collect();
    }
    cfg.require_auth_secret()
        .context("refusing to start without an authentication secret")?;

    let cfg = Arc::new(cfg);
    config::install((*cfg).clone());

    let registry = Arc::new(SessionRegistry::new(cfg.shell_argv.clone(), cfg.scrollback_capacity));
    let sweep_handle = Arc::clone(&registry).spawn_sweep_task();

    let state = tty_server::AppState { registry: Arc::clone(&registry), config: Arc::clone(&cfg) };
    let router = tty_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    info!(bind = %cfg.bind, "tty-server listening");

    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    let result = serve.await.context("server task failed");

    sweep_handle.abort();
    info!("shutting down, destroying all sessions");
    registry.destroy_all().await;

    result
}

/// Resolves once SIGINT or (on unix) SIGTERM is received, triggering the
/// server's graceful shutdown and, after it returns, full session teardown.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
