use courier_api::CourierError;
use courier_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Courier(#[from] CourierError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("http: {0}")]
    Http(String),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
