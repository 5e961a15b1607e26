//! Handler contract and the process-wide handler map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::db::ReqInfo;
use crate::error::ApiError;

/// What a handler hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Json(Value),
    /// Raw bytes for multipart responses.
    Bytes(Vec<u8>),
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Json(value)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, info: &mut ReqInfo, input: Value) -> Result<HandlerOutput, ApiError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut ReqInfo, Value) -> BoxFuture<'a, Result<HandlerOutput, ApiError>>
        + Send
        + Sync,
{
    async fn call(&self, info: &mut ReqInfo, input: Value) -> Result<HandlerOutput, ApiError> {
        (self.0)(info, input).await
    }
}

/// Wrap a closure returning a boxed future as a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut ReqInfo, Value) -> BoxFuture<'a, Result<HandlerOutput, ApiError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers keyed by service method name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
