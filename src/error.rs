use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing tenant context")]
    MissingTenantContext,
    #[error("invalid tenant context: {0}")]
    InvalidTenantContext(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("tenant {0} not found")]
    TenantNotFound(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("password hash error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("operation exceeded its deadline")]
    DeadlineExceeded,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The operation had no usable tenant binding. Never retried, never downgraded.
    pub fn is_isolation_violation(&self) -> bool {
        match self {
            Error::MissingTenantContext | Error::InvalidTenantContext(_) => true,
            Error::Context { source, .. } => source.is_isolation_violation(),
            _ => false,
        }
    }

    /// Infrastructure failures that may succeed on redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Db(sqlx::Error::RowNotFound) => false,
            Error::Db(_) | Error::Io(_) | Error::Broker(_) | Error::DeadlineExceeded => true,
            Error::Join(_) => true,
            Error::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Errors a consumer must dead-letter immediately instead of redelivering.
    pub fn is_poison(&self) -> bool {
        match self {
            Error::InvalidEnvelope(_) | Error::Serde(_) => true,
            Error::Context { source, .. } => source.is_poison(),
            other => other.is_isolation_violation(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sees_through_context() {
        let err: Result<()> = Err(Error::MissingTenantContext);
        let wrapped = err.context("loading cached user").unwrap_err();
        assert!(wrapped.is_isolation_violation());
        assert!(wrapped.is_poison());
        assert!(!wrapped.is_transient());
    }

    #[test]
    fn broker_outage_is_transient() {
        let err = Error::Broker("connection refused".into());
        assert!(err.is_transient());
        assert!(!err.is_poison());
    }
}
