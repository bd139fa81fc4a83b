pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::config::RegistryConfig;
use crate::serve::state::AppState;

pub async fn run_server(config: RegistryConfig, host: String, port: u16) -> Result<()> {
    let state = AppState::new(config);

    let router = routes::build_router(state.clone());
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;

    eprintln!("Quayside registry listening on {addr}");
    eprintln!("  API: http://{addr}/v2/");
    eprintln!(
        "  Deletion: {}",
        if state.config.enable_delete {
            "enabled"
        } else {
            "disabled (405)"
        }
    );
    eprintln!(
        "  Cross-mount auto-discovery: {}",
        if state.config.auto_mount_discovery {
            "enabled"
        } else {
            "disabled"
        }
    );

    let upload_sessions = state.upload_sessions.clone();
    let max_age = state.config.upload_session_max_age;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let expired = {
                let mut sessions = upload_sessions.write().await;
                sessions.cleanup_expired(max_age)
            };
            for session in expired {
                log::debug!(
                    "Reaped stale upload session {} ({} bytes buffered)",
                    session.id,
                    session.bytes_received()
                );
            }
        }
    });

    axum::serve(listener, router).await?;
    Ok(())
}
