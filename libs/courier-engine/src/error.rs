use courier_api::CourierError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("infrastructure failure ({context}): {source}")]
    Infrastructure { context: String, source: CourierError },

    #[error("subscription: {0}")]
    Subscription(CourierError),

    #[error("drain timed out with {in_flight} handler(s) still in flight")]
    DrainTimeout { in_flight: usize },

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("consumption session already started")]
    AlreadyRan,
}

impl EngineError {
    pub fn infrastructure(context: impl Into<String>, source: CourierError) -> Self {
        EngineError::Infrastructure {
            context: context.into(),
            source,
        }
    }
}
