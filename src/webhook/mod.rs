//! Identity-provider webhook channel.
//!
//! # Responsibilities
//! - Listen on a local stream socket for newline-delimited JSON events
//! - Look up the handler named by `webhookName`
//! - Run it inside a scoped transaction with a session synthesized from
//!   the event
//! - Answer each event with one JSON line
//!
//! # Design Decisions
//! - A connection carries any number of events; a bad or unknown event is
//!   answered and the connection stays open
//! - A panicking handler rolls back and reports `{"success":false,"reason"}`

mod event;
mod server;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::db::ReqInfo;
use crate::error::ApiError;

pub use event::WebhookEvent;
pub use server::{bind_socket, WebhookServer};

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Handle one event; the returned string is written back verbatim.
    async fn handle(&self, info: &mut ReqInfo, event: &WebhookEvent) -> Result<String, ApiError>;
}

struct FnWebhook<F>(F);

#[async_trait]
impl<F> WebhookHandler for FnWebhook<F>
where
    F: for<'a> Fn(&'a mut ReqInfo, &'a WebhookEvent) -> BoxFuture<'a, Result<String, ApiError>>
        + Send
        + Sync,
{
    async fn handle(&self, info: &mut ReqInfo, event: &WebhookEvent) -> Result<String, ApiError> {
        (self.0)(info, event).await
    }
}

/// Wrap a closure returning a boxed future as a [`WebhookHandler`].
pub fn webhook_fn<F>(f: F) -> Arc<dyn WebhookHandler>
where
    F: for<'a> Fn(&'a mut ReqInfo, &'a WebhookEvent) -> BoxFuture<'a, Result<String, ApiError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnWebhook(f))
}

/// Webhook handlers keyed by webhook name (`REGISTER`, `REGISTER_VALIDATE`, …).
#[derive(Default, Clone)]
pub struct WebhookRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn WebhookHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
