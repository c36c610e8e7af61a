use serde::Deserialize;

use courier_api::{
    BoxFuture, CourierError, FailureClass, Handler, HandlerContext, INVALID_ENCODING_ATTR, Message,
    Outcome,
};

/// Business rule applied to payloads before they are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Any bytes.
    #[default]
    Raw,
    /// Valid UTF-8.
    Utf8,
    /// A single JSON document.
    Json,
}

/// `[handler]` section of the worker config.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// How much of the payload goes into the per-message debug log.
    #[serde(default = "default_log_preview_bytes")]
    pub log_preview_bytes: usize,
}

fn default_log_preview_bytes() -> usize {
    256
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            payload_format: PayloadFormat::default(),
            log_preview_bytes: default_log_preview_bytes(),
        }
    }
}

/// Default handler: validate the payload, then record the message id in the
/// store. The store write is the only side effect.
pub struct RecordHandler {
    config: HandlerConfig,
}

impl RecordHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }

    fn validate(&self, message: &Message) -> Result<(), CourierError> {
        if message.id.is_empty() {
            return Err(CourierError::format("message has no id"));
        }
        if let Some(encoding) = message.attributes.get(INVALID_ENCODING_ATTR) {
            return Err(CourierError::format(format!("payload is not valid {encoding}")));
        }
        match self.config.payload_format {
            PayloadFormat::Raw => Ok(()),
            PayloadFormat::Utf8 => {
                std::str::from_utf8(&message.payload)?;
                Ok(())
            }
            PayloadFormat::Json => {
                serde_json::from_slice::<serde::de::IgnoredAny>(&message.payload)?;
                Ok(())
            }
        }
    }
}

impl Default for RecordHandler {
    fn default() -> Self {
        Self::new(HandlerConfig::default())
    }
}

/// Map a store failure onto a handler outcome.
pub fn classify_store_error(err: CourierError) -> Outcome {
    match err.class() {
        FailureClass::TransientIo => Outcome::RetryableFailure(err),
        FailureClass::PoisonMessage | FailureClass::FatalInfrastructure => {
            Outcome::FatalFailure(err)
        }
    }
}

impl Handler for RecordHandler {
    fn handle<'a>(
        &'a self,
        message: &'a Message,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            tracing::debug!(
                id = %message.id,
                attempt = message.delivery_attempt,
                payload = %message.payload_preview(self.config.log_preview_bytes),
                "got message"
            );

            if let Err(e) = self.validate(message) {
                return Outcome::FatalFailure(e.with_context(format!("message {}", message.id)));
            }

            match ctx.store.record_if_absent(&message.id, &message.payload).await {
                Ok(write) => Outcome::Committed(write),
                Err(e) => classify_store_error(e.with_context("record_if_absent")),
            }
        })
    }
}
