use crate::query::backtrace::Backtrace as DatumBacktrace;
use crate::response::ResponseType;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorCode {
    Client,
    Compile,
    Runtime,
    Interrupted,
    InvalidConfig,
}

impl CacheErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheErrorCode::Client => "client_error",
            CacheErrorCode::Compile => "compile_error",
            CacheErrorCode::Runtime => "runtime_error",
            CacheErrorCode::Interrupted => "interrupted",
            CacheErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("{message}")]
    Client { message: String },
    #[error("{message}")]
    Compile {
        message: String,
        backtrace: DatumBacktrace,
    },
    #[error("{message}")]
    Runtime {
        message: String,
        backtrace: DatumBacktrace,
    },
    #[error("interrupted")]
    Interrupted,
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl CacheError {
    pub fn code(&self) -> CacheErrorCode {
        match self {
            CacheError::Client { .. } => CacheErrorCode::Client,
            CacheError::Compile { .. } => CacheErrorCode::Compile,
            CacheError::Runtime { .. } => CacheErrorCode::Runtime,
            CacheError::Interrupted => CacheErrorCode::Interrupted,
            CacheError::InvalidConfig { .. } => CacheErrorCode::InvalidConfig,
        }
    }

    /// Response category this error is reported under, or `None` for
    /// control-flow conditions that never reach the client as a response.
    pub fn response_type(&self) -> Option<ResponseType> {
        match self {
            CacheError::Client { .. } => Some(ResponseType::ClientError),
            CacheError::Compile { .. } => Some(ResponseType::CompileError),
            CacheError::Runtime { .. } => Some(ResponseType::RuntimeError),
            CacheError::Interrupted | CacheError::InvalidConfig { .. } => None,
        }
    }

    pub fn backtrace(&self) -> Option<&DatumBacktrace> {
        match self {
            CacheError::Compile { backtrace, .. } | CacheError::Runtime { backtrace, .. } => {
                Some(backtrace)
            }
            _ => None,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        CacheError::Client {
            message: message.into(),
        }
    }

    pub(crate) fn duplicate_token(token: i64) -> Self {
        CacheError::client(format!("ERROR: duplicate token {token}"))
    }

    pub(crate) fn unknown_token(token: i64) -> Self {
        CacheError::client(format!("Token {token} not in stream cache."))
    }

    pub(crate) fn terminated_externally() -> Self {
        CacheError::Runtime {
            message: "Query terminated externally.".into(),
            backtrace: DatumBacktrace::empty(),
        }
    }
}
