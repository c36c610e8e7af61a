use std::fmt;

/// Error kind reported by stores, brokers and handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Auth,
    Schema,
    Constraint,
    Format,
    Logic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Auth => f.write_str("auth"),
            ErrorKind::Schema => f.write_str("schema"),
            ErrorKind::Constraint => f.write_str("constraint"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// How far a failure reaches.
///
/// - `TransientIo`: contained in one handler invocation, retried by broker redelivery.
/// - `PoisonMessage`: the message can never succeed; acknowledge it and surface the error.
/// - `FatalInfrastructure`: no progress is possible; the whole consumer stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    TransientIo,
    PoisonMessage,
    FatalInfrastructure,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::TransientIo => f.write_str("transient_io"),
            FailureClass::PoisonMessage => f.write_str("poison_message"),
            FailureClass::FatalInfrastructure => f.write_str("fatal_infrastructure"),
        }
    }
}

/// Error returned by every trait method of this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CourierError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Auth, message: msg.into() }
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Schema, message: msg.into() }
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Constraint, message: msg.into() }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self.kind {
            ErrorKind::Io => FailureClass::TransientIo,
            ErrorKind::Format | ErrorKind::Constraint | ErrorKind::Logic => {
                FailureClass::PoisonMessage
            }
            ErrorKind::Config | ErrorKind::Auth | ErrorKind::Schema => {
                FailureClass::FatalInfrastructure
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::TransientIo
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class() == FailureClass::FatalInfrastructure
    }
}

impl fmt::Display for CourierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CourierError {}

// ---------------------------------------------------------------------------
// From impls: standard error types → CourierError with correct ErrorKind
// ---------------------------------------------------------------------------

impl From<std::io::Error> for CourierError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::str::Utf8Error> for CourierError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::format(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for CourierError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::format(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_failure_classes() {
        assert_eq!(CourierError::io("down").class(), FailureClass::TransientIo);
        assert_eq!(CourierError::format("bad").class(), FailureClass::PoisonMessage);
        assert_eq!(CourierError::constraint("fk").class(), FailureClass::PoisonMessage);
        assert_eq!(CourierError::logic("x").class(), FailureClass::PoisonMessage);
        assert_eq!(CourierError::schema("no table").class(), FailureClass::FatalInfrastructure);
        assert_eq!(CourierError::auth("denied").class(), FailureClass::FatalInfrastructure);
        assert_eq!(CourierError::config("bad url").class(), FailureClass::FatalInfrastructure);
    }

    #[test]
    fn context_keeps_kind() {
        let e = CourierError::io("connection refused").with_context("ping");
        assert_eq!(e.kind, ErrorKind::Io);
        assert_eq!(e.message, "ping: connection refused");
        assert_eq!(e.to_string(), "io: ping: connection refused");
    }

    #[test]
    fn json_errors_are_format() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: CourierError = err.into();
        assert_eq!(e.kind, ErrorKind::Format);
    }
}
