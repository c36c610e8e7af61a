pub mod error;
pub mod handler;
pub mod message;
pub mod store;
pub mod subscription;

use std::future::Future;
use std::pin::Pin;

pub use error::{CourierError, ErrorKind, FailureClass};
pub use handler::{Handler, HandlerContext, Outcome};
pub use message::{Acker, Delivery, INVALID_ENCODING_ATTR, Message};
pub use store::{ProcessedStore, WriteOutcome};
pub use subscription::{Subscription, SubscriptionProbe};

/// Boxed `Send` future returned by the trait methods of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
