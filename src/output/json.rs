//! JSON lines publisher.
//!
//! Writes one envelope per published message:
//!
//! ```text
//! {"exchange":"brewcast","routing":"tilt","message":{"Red":{"Temperature[degF]":70,...}}}
//! ```
//!
//! Pointing it at stdout lets any bus bridge (or a plain log collector) pick
//! the messages up.

use crate::message::CycleMessage;
use crate::output::{PublishError, PublishFuture, Publisher};
use log::debug;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    exchange: &'a str,
    routing: &'a str,
    message: &'a CycleMessage,
}

/// Publisher writing JSON lines to any async writer.
pub struct JsonPublisher<W> {
    out: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonPublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Consume the publisher and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    async fn write_envelope(&mut self, envelope: &Envelope<'_>) -> Result<(), PublishError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.out.flush().await?;
        debug!(
            "Published {} colour(s) to {}/{}",
            envelope.message.len(),
            envelope.exchange,
            envelope.routing
        );
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send> Publisher for JsonPublisher<W> {
    fn publish<'a>(
        &'a mut self,
        channel: &'a str,
        routing_key: &'a str,
        message: &'a CycleMessage,
    ) -> PublishFuture<'a> {
        Box::pin(async move {
            let envelope = Envelope {
                exchange: channel,
                routing: routing_key,
                message,
            };
            self.write_envelope(&envelope).await
        })
    }
}
