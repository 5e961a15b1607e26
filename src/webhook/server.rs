use std::io;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;

use crate::db::{Database, DbHandle, DbScope, ExecutorKind, ReqInfo};
use crate::routing::dispatch::panic_message;
use crate::session::ConcurrentUserSession;
use crate::webhook::{WebhookEvent, WebhookRegistry};

/// Remove a stale socket file and bind a fresh listener.
pub fn bind_socket(path: impl AsRef<Path>) -> io::Result<UnixListener> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

#[derive(Clone)]
pub struct WebhookServer {
    registry: Arc<WebhookRegistry>,
    database: Arc<dyn Database>,
}

impl WebhookServer {
    pub fn new(registry: WebhookRegistry, database: Arc<dyn Database>) -> Self {
        Self {
            registry: Arc::new(registry),
            database,
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(self, listener: UnixListener, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(handlers = self.registry.len(), "Webhook listener starting");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve(stream).await {
                                tracing::warn!(error = %e, "Webhook connection failed");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Error accepting webhook connection"),
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Webhook listener stopped");
    }

    /// Answer every event line on `stream` until EOF.
    pub async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let mut reply = self.process(&line).await;
            reply.push('\n');
            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    /// Handle one event line and return the reply (without newline).
    pub async fn process(&self, line: &str) -> String {
        let event: WebhookEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => return failure(&format!("invalid event: {e}")),
        };
        let Some(handler) = self.registry.get(&event.webhook_name) else {
            tracing::warn!(webhook = %event.webhook_name, "Unknown webhook");
            return failure(&format!("unknown webhook {}", event.webhook_name));
        };

        let session = event.session();
        let scope = DbScope::from_session(&session);
        let db = match DbHandle::open(&self.database, ExecutorKind::Tx, scope).await {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(webhook = %event.webhook_name, error = %e, "Webhook transaction failed to open");
                return failure(&e.to_string());
            }
        };
        let mut info = ReqInfo::new(Arc::new(ConcurrentUserSession::new(session)), db);

        let outcome = AssertUnwindSafe(handler.handle(&mut info, &event))
            .catch_unwind()
            .await;

        let (success, reply) = match outcome {
            Ok(Ok(reply)) => (true, reply),
            Ok(Err(e)) => {
                tracing::error!(webhook = %event.webhook_name, user_id = %event.user_id, error = %e, "Webhook handler failed");
                (false, failure(&e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(webhook = %event.webhook_name, user_id = %event.user_id, panic = %message, "Webhook handler panicked");
                (false, failure(&message))
            }
        };

        if let Err(e) = info.db.release(success).await {
            tracing::error!(webhook = %event.webhook_name, error = %e, "Webhook transaction release failed");
            return failure(&e.to_string());
        }
        reply
    }
}

fn failure(reason: &str) -> String {
    json!({ "success": false, "reason": reason }).to_string()
}
