//! Built-in alert channels

use async_trait::async_trait;

use crate::domain::AlertPayload;
use crate::infra::{AlertChannel, ChannelError};

/// Channel that writes alerts to the log.
///
/// Default when no external subscriber channel is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingChannel;

impl TracingChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertChannel for TracingChannel {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn send(&self, payload: &AlertPayload) -> Result<(), ChannelError> {
        tracing::warn!(
            target: "inventory::alerts",
            store = %payload.store,
            item = %payload.item,
            quantity = payload.quantity,
            threshold = payload.threshold,
            subject = %payload.subject(),
            "{}",
            payload.message()
        );
        Ok(())
    }
}
