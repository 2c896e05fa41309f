//! The message router.
//!
//! Handlers declare the kinds they accept; the builder assembles a static
//! table from tag to handler at startup, so dispatch is one lookup with no
//! scan over the handler list. When several handlers claim the same kind,
//! the first registered wins.
//!
//! Handlers receive a [`HandlerContext`] carrying the `send` and `publish`
//! capabilities; event publication is reachable only through it.

use std::collections::HashMap;
use std::sync::Arc;

use parley_types::events::{Event, EventSink};
use parley_wire::message::Message;
use parley_wire::tag::MessageTag;
use tokio::sync::mpsc;

use crate::{Result, RouterError};

/// Capabilities handed to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    outbound: mpsc::UnboundedSender<Message>,
    events: Arc<dyn EventSink>,
}

impl HandlerContext {
    /// Create a context from the outbound queue and event sink.
    pub fn new(outbound: mpsc::UnboundedSender<Message>, events: Arc<dyn EventSink>) -> Self {
        Self { outbound, events }
    }

    /// Queue a message for the connection writer.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ChannelClosed`] if the connection is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RouterError::ChannelClosed)
    }

    /// Publish an event to subscribers.
    pub fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    /// The underlying event sink, for sharing with engines.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }
}

/// A message handler.
pub trait MessageHandler: Send + Sync {
    /// The kinds this handler accepts.
    fn accepts(&self) -> &[MessageTag];

    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Handler`] when processing fails; the router
    /// surfaces it to the caller, the connection stays up.
    fn handle(&self, ctx: &HandlerContext, message: Message) -> Result<()>;
}

/// Builds the dispatch table.
#[derive(Default)]
pub struct RouterBuilder {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registration order decides contested kinds.
    pub fn register(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Assemble the router.
    pub fn build(self, ctx: HandlerContext) -> Router {
        let mut table = HashMap::new();
        for (index, handler) in self.handlers.iter().enumerate() {
            for &tag in handler.accepts() {
                table.entry(tag).or_insert(index);
            }
        }
        Router {
            table,
            handlers: self.handlers,
            ctx,
        }
    }
}

/// Dispatches parsed messages to their handler.
pub struct Router {
    table: HashMap<MessageTag, usize>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    ctx: HandlerContext,
}

impl Router {
    /// The handler context, for callers that need the same capabilities.
    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Dispatch one message to its handler.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoHandler`] for kinds without a registered
    /// handler; an error event is published before returning.
    pub fn dispatch(&self, message: Message) -> Result<()> {
        let tag = message.tag();
        let Some(&index) = self.table.get(&tag) else {
            tracing::warn!(?tag, "no handler for message kind");
            self.ctx.publish(Event::Error {
                level: parley_types::events::ErrorLevel::Warning,
                kind: "NO_HANDLER".to_string(),
                message: format!("no handler for message kind {tag:?}"),
            });
            return Err(RouterError::NoHandler(tag));
        };
        self.handlers[index].handle(&self.ctx, message)
    }
}
