use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while connecting to the cluster or building the datastore
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes client error: {0}")]
    Client(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer cluster config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("cannot watch {kind}: {source}")]
    Watch {
        kind: String,
        #[source]
        source: kube::Error,
    },

    #[error("invalid label selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid {stage} filter: {reason}")]
    InvalidFilter { stage: &'static str, reason: String },
}

impl Error {
    pub(crate) fn selector(selector: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn filter(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            stage,
            reason: reason.into(),
        }
    }
}
