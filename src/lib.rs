use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// An inner error with a message describing what was being attempted
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("templateRef is not provided - it's not possible to fetch related TierTemplate resource")]
    TemplateRefNotProvided,

    #[error("unable to connect to the host cluster: unknown cluster")]
    HostClusterUnavailable,

    #[error("the host cluster is not ready")]
    HostClusterNotReady,

    #[error("tiertemplates.toolchain.dev.openshift.com \"{0}\" not found")]
    TierTemplateNotFound(String),

    #[error("template parameter {0} is required and must be specified")]
    MissingTemplateParameter(String),

    #[error("invalid template object: {0}")]
    InvalidObject(String),

    #[error("namespace doesn't have owner label")]
    MissingOwnerLabel,

    #[error("NSTemplateSet deletion has not completed in over 1 minute")]
    DeletionTimeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Context { source, .. } => source.metric_label(),
            Error::TemplateRefNotProvided => "TemplateRefNotProvided",
            Error::HostClusterUnavailable => "HostClusterUnavailable",
            Error::HostClusterNotReady => "HostClusterNotReady",
            Error::TierTemplateNotFound(_) => "TierTemplateNotFound",
            Error::MissingTemplateParameter(_) => "MissingTemplateParameter",
            Error::InvalidObject(_) => "InvalidObject",
            Error::MissingOwnerLabel => "MissingOwnerLabel",
            Error::DeletionTimeout => "DeletionTimeout",
        }
    }

    /// Prefix the error with a description of the failed operation
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the root cause is an object that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::TierTemplateNotFound(_) => true,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Kubernetes access used by the reconcilers
pub mod client;

pub mod controllers;

pub use controllers::State;

/// Access to the host cluster holding the tier templates
pub mod host;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources
pub mod resources;

pub mod template;

#[cfg(test)]
mod test_support;
