use thiserror::Error;

/// Controller errors
///
/// Only configuration problems are fatal; everything raised while watching or
/// syncing is logged and retried by the caller.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid route set \"{path}\": {reason}")]
    ConfigValidation { path: String, reason: String },

    #[error("Base path '{base_path}' is declared by both \"{first}\" and \"{second}\"")]
    DuplicateBasePath {
        base_path: String,
        first: String,
        second: String,
    },

    #[error("Ingress {0} is declared more than once")]
    DuplicateTarget(String),

    #[error("Failed to read configuration {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Invalid environment override {name}={value}")]
    EnvOverride { name: String, value: String },
}

impl ControllerError {
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failure while submitting an Ingress update
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("update rejected with code {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<kube::Error> for SyncError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => SyncError::Rejected {
                code: resp.code,
                message: resp.message,
            },
            other => SyncError::Transport(other.to_string()),
        }
    }
}
