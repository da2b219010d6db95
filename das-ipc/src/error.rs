//! Crate-wide error taxonomy.
//!
//! Every variant's discriminant IS the wire `error_code`: `0` is success
//! (never constructed as an error — see [`ErrorCode::S_OK`]), positive values
//! are success-ish informational codes (`s_false`), negative values are
//! failures grouped by kind. The discriminants are part of the wire contract
//! and must never be renumbered once a peer depends on them.

use thiserror::Error;

/// Informational / success discriminant carried on the wire.
pub const S_OK: i32 = 0;
/// Partial success / already-initialized, still non-fatal.
pub const S_FALSE: i32 = 1;

/// Typed error returned by every fallible operation in this crate.
///
/// The `code()` of an `IpcError` is exactly what gets copied into a
/// [`crate::header::MessageHeader::error_code`] field when a callee's
/// result crosses the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    // ---- Invalid input ----
    #[error("null pointer")]
    NullPointer,
    #[error("invalid enum value")]
    InvalidEnum,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid object id")]
    InvalidObjectId,

    // ---- Not found ----
    #[error("object not found")]
    ObjectNotFound,
    #[error("no such interface")]
    NoInterface,
    #[error("value out of range")]
    OutOfRange,

    // ---- Lifetime ----
    #[error("stale object handle")]
    StaleObjectHandle,
    #[error("strong reference not available")]
    NoStrongReference,
    #[error("duplicate element")]
    DuplicateElement,

    // ---- Resource ----
    #[error("out of memory")]
    OutOfMemory,
    #[error("shared memory operation failed: {0}")]
    SharedMemoryFailed(String),
    #[error("message queue operation failed: {0}")]
    MessageQueueFailed(String),
    #[error("connection lost")]
    ConnectionLost,

    // ---- Protocol ----
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid message header")]
    InvalidMessageHeader,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("invalid state for this operation")]
    InvalidState,
    #[error("deserialization failed")]
    DeserializationFailed,

    // ---- Concurrency ----
    #[error("operation timed out")]
    Timeout,
    #[error("deadlock detected: nesting bound exceeded")]
    DeadlockDetected,
    #[error("connection limit reached")]
    ConnectionLimitReached,

    // ---- Generic ----
    #[error("undefined return value")]
    UndefinedReturnValue,
    #[error("internal fatal error: {0}")]
    InternalFatalError(String),
    #[error("not implemented")]
    NoImplementation,
    #[error("partial success")]
    SFalse,
}

impl IpcError {
    /// The stable wire-level error code for this variant.
    ///
    /// These values are deliberately hand-assigned and non-contiguous within
    /// their groups so that inserting a new variant in one group never shifts
    /// the code of a variant in another.
    pub fn code(&self) -> i32 {
        match self {
            IpcError::NullPointer => -1,
            IpcError::InvalidEnum => -2,
            IpcError::InvalidArgument => -3,
            IpcError::InvalidObjectId => -4,

            IpcError::ObjectNotFound => -10,
            IpcError::NoInterface => -11,
            IpcError::OutOfRange => -12,

            IpcError::StaleObjectHandle => -20,
            IpcError::NoStrongReference => -21,
            IpcError::DuplicateElement => -22,

            IpcError::OutOfMemory => -30,
            IpcError::SharedMemoryFailed(_) => -31,
            IpcError::MessageQueueFailed(_) => -32,
            IpcError::ConnectionLost => -33,

            IpcError::InvalidMessage => -40,
            IpcError::InvalidMessageHeader => -41,
            IpcError::InvalidMessageType => -42,
            IpcError::HandshakeFailed => -43,
            IpcError::InvalidState => -44,
            IpcError::DeserializationFailed => -45,

            IpcError::Timeout => -50,
            IpcError::DeadlockDetected => -51,
            IpcError::ConnectionLimitReached => -52,

            IpcError::UndefinedReturnValue => -60,
            IpcError::InternalFatalError(_) => -61,
            IpcError::NoImplementation => -62,
            IpcError::SFalse => S_FALSE,
        }
    }

    /// Reconstruct a coarse error from a wire code received from a peer.
    ///
    /// Peers only exchange the integer; string payloads (e.g. the detail in
    /// `SharedMemoryFailed`) never cross the wire, so codes round-trip to a
    /// generic instance of the matching variant.
    pub fn from_wire_code(code: i32) -> Option<IpcError> {
        Some(match code {
            S_OK => return None,
            -1 => IpcError::NullPointer,
            -2 => IpcError::InvalidEnum,
            -3 => IpcError::InvalidArgument,
            -4 => IpcError::InvalidObjectId,
            -10 => IpcError::ObjectNotFound,
            -11 => IpcError::NoInterface,
            -12 => IpcError::OutOfRange,
            -20 => IpcError::StaleObjectHandle,
            -21 => IpcError::NoStrongReference,
            -22 => IpcError::DuplicateElement,
            -30 => IpcError::OutOfMemory,
            -31 => IpcError::SharedMemoryFailed(String::new()),
            -32 => IpcError::MessageQueueFailed(String::new()),
            -33 => IpcError::ConnectionLost,
            -40 => IpcError::InvalidMessage,
            -41 => IpcError::InvalidMessageHeader,
            -42 => IpcError::InvalidMessageType,
            -43 => IpcError::HandshakeFailed,
            -44 => IpcError::InvalidState,
            -45 => IpcError::DeserializationFailed,
            -50 => IpcError::Timeout,
            -51 => IpcError::DeadlockDetected,
            -52 => IpcError::ConnectionLimitReached,
            -60 => IpcError::UndefinedReturnValue,
            -61 => IpcError::InternalFatalError(String::new()),
            -62 => IpcError::NoImplementation,
            S_FALSE => IpcError::SFalse,
            _ => IpcError::InternalFatalError(format!("unrecognized wire code {code}")),
        })
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::MessageQueueFailed(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IpcError>;
