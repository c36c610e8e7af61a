pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod preflight;
pub mod session;
pub mod signal;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::EngineError;
pub use handler::{HandlerConfig, PayloadFormat, RecordHandler};
pub use session::{ConsumptionSession, PoisonRecord, SessionReport, SessionState};
