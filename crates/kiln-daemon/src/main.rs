use std::{net::SocketAddr, sync::Arc};

use kiln_daemon::{api, auth, config, logging, scheduler::Scheduler, state::AppState};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let root = config::data_root();
    let _log_guard = logging::init(&root)?;

    let state = AppState::open(&root).await?;
    auth::ensure_admin(&state.identities).await?;

    let scheduler = Scheduler::new(state.tasks.clone(), Arc::new(state.instances.clone()));
    let scheduler = tokio::spawn(scheduler.run(state.shutdown.child_token()));

    if config::skip_autostart() {
        tracing::info!("autostart disabled");
    } else {
        state.instances.start_on_boot().await;
        state.tunnels.start_on_boot().await;
    }

    let addr = config::listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, root = %root.display(), "kiln-daemon HTTP listening");

    let app = api::router(state.clone());
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown.cancel();
    let _ = scheduler.await;
    state.instances.shutdown().await;
    state.tunnels.shutdown().await;
    state.jobs.shutdown().await;
    tracing::info!("kiln-daemon stopped");
    Ok(())
}
