//! Publishing of aggregated Tilt messages.
//!
//! The scan loop hands every non-empty window message to a [`Publisher`]. The
//! trait keeps the loop independent of the actual message bus so it can be
//! tested with an in-memory publisher.

pub mod json;

use crate::message::CycleMessage;
use std::future::Future;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// Exchange the brewing history service listens to.
pub const HISTORY_EXCHANGE: &str = "brewcast";

/// Errors returned when a message cannot be delivered.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialise message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write message: {0}")]
    Io(#[from] io::Error),
}

/// Boxed future returned by [`Publisher::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

/// Destination for aggregated window messages.
///
/// Delivery is best effort: a failed publish is reported to the caller, which
/// logs it and moves on. Nothing is retried.
pub trait Publisher: Send {
    /// Publish `message` on `channel` with the given routing key.
    fn publish<'a>(
        &'a mut self,
        channel: &'a str,
        routing_key: &'a str,
        message: &'a CycleMessage,
    ) -> PublishFuture<'a>;
}
