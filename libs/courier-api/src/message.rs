use std::collections::BTreeMap;
use std::fmt;

use crate::BoxFuture;
use crate::error::CourierError;

/// Attribute set by broker adapters when the wire payload could not be decoded.
/// The value names the expected encoding (e.g. `base64`).
pub const INVALID_ENCODING_ATTR: &str = "courier-invalid-encoding";

/// A message as delivered by the broker.
///
/// `id` is unique within the subscription's retention window and is the
/// idempotency key for the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub id: String,
    pub payload: Vec<u8>,
    /// 1-based delivery counter, `0` when the broker does not report it.
    pub delivery_attempt: u32,
    pub attributes: BTreeMap<String, String>,
    pub publish_time: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_attempt(mut self, delivery_attempt: u32) -> Self {
        self.delivery_attempt = delivery_attempt;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Payload as text for logging, cut at `max` bytes on a char boundary.
    pub fn payload_preview(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.len() <= max {
            return text.into_owned();
        }
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// Acknowledgment handle for one delivery.
///
/// `ack` consumes the handle, so a delivery is acknowledged at most once.
/// Dropping the handle without calling `ack` withholds acknowledgment and
/// leaves redelivery to the broker.
pub trait Acker: Send {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), CourierError>>;
}

/// One delivery of a message together with its acknowledgment handle.
pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn into_parts(self) -> (Message, Box<dyn Acker>) {
        (self.message, self.acker)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.message.id)
            .field("delivery_attempt", &self.message.delivery_attempt)
            .field("payload_len", &self.message.payload.len())
            .finish()
    }
}
