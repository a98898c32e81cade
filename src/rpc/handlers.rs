//! Registry of handlers for requests initiated by the agent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::protocol::ErrorObject;

/// Outcome returned to the agent for one of its requests.
pub type HandlerResult = std::result::Result<Value, ErrorObject>;

/// Type-erased async request handler.
pub type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure into a [`RequestHandler`].
pub fn request_handler<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params| handler(params).boxed())
}

/// Method name to handler map, shared by the client facade and the dispatch
/// loop.
#[derive(Default)]
pub struct RequestHandlers {
    handlers: RwLock<HashMap<String, RequestHandler>>,
}

impl std::fmt::Debug for RequestHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("RequestHandlers")
            .field("methods", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestHandlers {
    /// Install `handler` for `method`, returning the one it replaced.
    pub fn insert(&self, method: impl Into<String>, handler: RequestHandler) -> Option<RequestHandler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), handler)
    }

    /// Remove the handler for `method`.
    pub fn remove(&self, method: &str) -> Option<RequestHandler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
    }

    /// Handler registered for `method`, if any.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<RequestHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }
}
