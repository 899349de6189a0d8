use std::sync::{Arc, RwLock};
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::request::IncomingRequest;

/// What a handler sends back
pub enum HandlerReply<M> {
    Reply(M),
    NoReply,
    /// a response that is computed asynchronously; `None` means no response
    Later(BoxFuture<'static, Option<M>>),
}

/// Handles messages from the peer. Handlers run wherever the channel decodes frames (see
///  `ChannelOptions::deserialize_in_connection_thread`), so they should not block.
pub trait RequestHandler<M>: Send + Sync + 'static {
    fn handle(&self, request: IncomingRequest<M>) -> HandlerReply<M>;
}

impl<M, F> RequestHandler<M> for F
where F: Fn(IncomingRequest<M>) -> HandlerReply<M> + Send + Sync + 'static
{
    fn handle(&self, request: IncomingRequest<M>) -> HandlerReply<M> {
        self(request)
    }
}

/// Handlers by message type, plus an optional catch-all for all other types
pub struct HandlerRegistry<M> {
    by_type: RwLock<FxHashMap<u32, Arc<dyn RequestHandler<M>>>>,
    fallback: RwLock<Option<Arc<dyn RequestHandler<M>>>>,
}

impl<M> Default for HandlerRegistry<M> {
    fn default() -> Self {
        HandlerRegistry {
            by_type: Default::default(),
            fallback: Default::default(),
        }
    }
}

impl<M: 'static> HandlerRegistry<M> {
    pub fn new() -> HandlerRegistry<M> {
        Default::default()
    }

    /// Replaces a previous handler for the same type
    pub fn register(&self, msg_type: u32, handler: impl RequestHandler<M>) {
        debug!(msg_type, "registering request handler");
        self.by_type.write().unwrap()
            .insert(msg_type, Arc::new(handler));
    }

    pub fn register_fallback(&self, handler: impl RequestHandler<M>) {
        *self.fallback.write().unwrap() = Some(Arc::new(handler));
    }

    pub fn unregister(&self, msg_type: u32) -> bool {
        self.by_type.write().unwrap()
            .remove(&msg_type)
            .is_some()
    }

    pub fn find(&self, msg_type: u32) -> Option<Arc<dyn RequestHandler<M>>> {
        if let Some(handler) = self.by_type.read().unwrap().get(&msg_type) {
            return Some(handler.clone());
        }
        self.fallback.read().unwrap().clone()
    }
}
