pub mod handlers;
pub mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;
use crate::error::{InferError, Result};
use crate::session::GenerationCoordinator;

pub async fn serve(
    config: &Config,
    coordinator: Arc<GenerationCoordinator>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|e| InferError::Config(format!("failed to bind {}: {e}", config.bind)))?;

    info!(bind = %config.bind, "listening (HTTP)");

    serve_on(listener, config, coordinator, shutdown).await
}

/// Serve on an already bound listener until `shutdown` fires.
///
/// On shutdown every active generation is stopped so that open response
/// bodies reach `[DONE]` and the graceful drain can finish.
async fn serve_on(
    listener: TcpListener,
    config: &Config,
    coordinator: Arc<GenerationCoordinator>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = routes::build(Arc::clone(&coordinator), config)?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("shutting down, stopping active generations");
            // Runs alongside the drain; each stopped stream ends its body.
            tokio::spawn(async move { coordinator.stop_all().await });
        })
        .await
        .map_err(|e| InferError::Config(format!("server error: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::model::ModelGateway;
    use crate::model::scripted::ScriptedGateway;
    use crate::session::coordinator::CoordinatorOptions;

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_open_streams() {
        let gateway: Arc<dyn ModelGateway> =
            Arc::new(ScriptedGateway::new(["tok"]).hold_until_stopped());
        let coordinator = Arc::new(GenerationCoordinator::new(
            gateway,
            CoordinatorOptions {
                system_prompt: "intro".into(),
                channel_capacity: 4,
                stop_join_timeout: Duration::from_millis(100),
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { serve_on(listener, &Config::default(), coordinator, shutdown_rx).await }
        });

        let client = reqwest::Client::new();
        let mut response = client
            .post(format!("http://{addr}/generate"))
            .json(&serde_json::json!({"conversationId": 1, "prompt": "go"}))
            .send()
            .await
            .unwrap();
        let first = tokio::time::timeout(WAIT, response.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"tok");
        assert_eq!(coordinator.registry().len(), 1);

        shutdown_tx.send(()).unwrap();

        let mut rest = Vec::new();
        while let Some(chunk) = tokio::time::timeout(WAIT, response.chunk())
            .await
            .unwrap()
            .unwrap()
        {
            rest.extend_from_slice(&chunk);
        }
        assert_eq!(rest, b"[DONE]");

        let result = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(coordinator.registry().is_empty());
    }
}
