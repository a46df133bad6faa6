/// A type alias for `anyhow::Error`, representing any error type.
///
/// This type is used at crate boundaries where callers need to propagate a
/// heterogeneous failure (e.g. `Agent::from_env`) without committing to one
/// of the typed enums below.
pub type AnyError = anyhow::Error;

/// A type alias for `Result<T, E>` where `E` defaults to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}

/// Route-registration faults (spec ERR_ROUTE_CONFLICT / ERR_EMPTY_PATH /
/// ERR_RELATIVE_PATH / ERR_EMPTY_METHOD). Surfaced at config load time; a
/// route error never aborts the process, it is logged and the offending
/// route is skipped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route conflict: a wildcard child already exists at this node")]
    Conflict,
    #[error("route path must not be empty")]
    EmptyPath,
    #[error("route path must start with '/': {0:?}")]
    RelativePath(String),
    #[error("method must not be empty")]
    EmptyMethod,
}

/// Field-extractor faults (ERR_FIELD_ABSENT / ERR_BAD_FIELD). These are
/// treated as soft failures by the Event Builder: the field is left empty.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("field absent: {0}")]
    FieldAbsent(String),
    #[error("malformed field path: {0}")]
    BadField(String),
}

/// Configuration parse/load faults (ERR_BAD_CONFIG).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("configuration byte provider failed: {0}")]
    Provider(#[source] AnyError),
}

/// Event Builder faults (ERR_WRONG_ENVELOPE). Not fatal: the publisher
/// advances to the next registered builder, and only reports this upward if
/// every builder rejects the envelope.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("envelope variant not supported by this builder")]
    WrongEnvelope,
}
