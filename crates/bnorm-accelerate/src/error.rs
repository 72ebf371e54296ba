use thiserror::Error;

/// Coarse outcome reported to callers that only need a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Unimplemented,
    InvalidArguments,
    RuntimeError,
}

#[derive(Debug, Error)]
pub enum BnormError {
    /// The descriptor asks for something this implementation does not do.
    /// Deterministic; retrying with the same descriptor fails the same way.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    /// A serialized compile-time record does not match the current layout.
    #[error("malformed kernel cache key: {0}")]
    MalformedCacheKey(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// Failure reported by the kernel provider, passed through untouched.
    #[error(transparent)]
    Device(anyhow::Error),
}

impl BnormError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        BnormError::Unsupported(message.into())
    }

    pub fn malformed_key(message: impl Into<String>) -> Self {
        BnormError::MalformedCacheKey(message.into())
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        BnormError::InvalidArguments(message.into())
    }

    pub fn status(&self) -> Status {
        match self {
            BnormError::Unsupported(_) => Status::Unimplemented,
            BnormError::InvalidArguments(_) => Status::InvalidArguments,
            BnormError::MalformedCacheKey(_) | BnormError::Device(_) => Status::RuntimeError,
        }
    }
}

pub type BnormResult<T> = Result<T, BnormError>;

/// Status view of a result, for callers bridging to status-code APIs.
pub fn status_of<T>(result: &BnormResult<T>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_keep_their_source() {
        #[derive(Debug, Error)]
        #[error("queue lost")]
        struct QueueLost;

        let err = BnormError::Device(anyhow::Error::new(QueueLost));
        assert_eq!(err.to_string(), "queue lost");
        match err {
            BnormError::Device(inner) => assert!(inner.downcast_ref::<QueueLost>().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_mapping() {
        let ok: BnormResult<()> = Ok(());
        assert_eq!(status_of(&ok), Status::Success);
        let unsupported: BnormResult<()> = Err(BnormError::unsupported("s8 training"));
        assert_eq!(status_of(&unsupported), Status::Unimplemented);
        assert_eq!(
            BnormError::malformed_key("short").status(),
            Status::RuntimeError
        );
    }
}
