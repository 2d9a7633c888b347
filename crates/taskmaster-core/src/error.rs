use std::path::PathBuf;

/// Failure of a document store call.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("document store io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document store record in {path} line {line} is malformed: {source}")]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("permission denied for {collection}")]
    PermissionDenied { collection: String },
    #[error("document store unavailable: {message}")]
    Unavailable { message: String },
}

impl ChannelError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignInError {
    #[error("sign-in was cancelled")]
    Cancelled,
    #[error("identity provider failed: {message}")]
    Failed { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no user is signed in; run `taskmaster login` first")]
    Unauthenticated,
    #[error(transparent)]
    SignIn(#[from] SignInError),
}
