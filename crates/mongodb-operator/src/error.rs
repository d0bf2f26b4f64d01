//! Error types for mongodb-operator.

/// Result type alias using [`OperatorError`].
pub type OperatorResult<T> = Result<T, OperatorError>;

/// Errors that can occur while reconciling a MongoDB resource.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// Remote control plane call failed.
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// The deployment document was modified since it was read.
    #[error("deployment version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Version the publish was based on.
        expected: u64,
        /// Version currently stored remotely.
        actual: u64,
    },

    /// The control plane refused project tags (older API versions).
    #[error("project tags rejected: {0}")]
    TagsRejected(String),

    /// Certificate authority call failed.
    #[error("certificate authority error: {0}")]
    CertificateAuthority(String),

    /// An object with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The stored status changed since it was read.
    #[error("status conflict for {resource}: expected revision {expected}, found {actual}")]
    StatusConflict {
        /// Resource key.
        resource: String,
        /// Revision the write was based on.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },

    /// Workload collaborator error.
    #[error("workload error: {0}")]
    Workload(String),

    /// The deployment document does not have the expected shape.
    #[error("deployment document error: {0}")]
    Document(String),

    /// Requested object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The project holds processes of another deployment.
    #[error("cannot have more than 1 MongoDB Cluster per project, found {excess} processes not belonging to {resource}")]
    ProjectOccupied {
        /// Processes in the project that belong elsewhere.
        excess: usize,
        /// Resource being reconciled.
        resource: String,
    },

    /// Declared spec is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// Create a control plane error.
    #[must_use]
    pub fn control_plane(msg: impl Into<String>) -> Self {
        Self::ControlPlane(msg.into())
    }

    /// Create a certificate authority error.
    #[must_use]
    pub fn certificate_authority(msg: impl Into<String>) -> Self {
        Self::CertificateAuthority(msg.into())
    }

    /// Create a deployment document error.
    #[must_use]
    pub fn document(msg: impl Into<String>) -> Self {
        Self::Document(msg.into())
    }

    /// Create a workload error.
    #[must_use]
    pub fn workload(msg: impl Into<String>) -> Self {
        Self::Workload(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Prefix the error message with the operation that produced it.
    ///
    /// The variant is kept so callers can still match on it. Conflicts
    /// already name the versions involved and serialisation errors keep
    /// their source, so those two pass through unchanged.
    #[must_use]
    pub fn context(self, operation: &str) -> Self {
        let prefix = |msg: String| format!("{operation}: {msg}");
        match self {
            Self::ControlPlane(msg) => Self::ControlPlane(prefix(msg)),
            Self::TagsRejected(msg) => Self::TagsRejected(prefix(msg)),
            Self::CertificateAuthority(msg) => Self::CertificateAuthority(prefix(msg)),
            Self::AlreadyExists(msg) => Self::AlreadyExists(prefix(msg)),
            Self::Workload(msg) => Self::Workload(prefix(msg)),
            Self::Document(msg) => Self::Document(prefix(msg)),
            Self::NotFound(msg) => Self::NotFound(prefix(msg)),
            Self::Validation(msg) => Self::Validation(prefix(msg)),
            Self::Config(msg) => Self::Config(prefix(msg)),
            Self::Internal(msg) => Self::Internal(prefix(msg)),
            Self::ProjectOccupied { .. }
            | Self::VersionConflict { .. }
            | Self::StatusConflict { .. }
            | Self::Serialisation(_) => self,
        }
    }

    /// Whether this error is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::StatusConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_names_the_operation_and_keeps_the_variant() {
        let err = OperatorError::NotFound("project p".to_owned()).context("read project");
        assert!(matches!(&err, OperatorError::NotFound(msg) if msg == "read project: project p"));

        let err = OperatorError::AlreadyExists("rs-0.ns".to_owned()).context("create request");
        assert_eq!(err.to_string(), "already exists: create request: rs-0.ns");

        let err = OperatorError::TagsRejected("old API".to_owned()).context("create project");
        assert!(matches!(err, OperatorError::TagsRejected(_)));
    }

    #[test]
    fn conflicts_pass_through_unchanged() {
        let err = OperatorError::VersionConflict {
            expected: 1,
            actual: 2,
        }
        .context("publish deployment");
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "deployment version conflict: expected 1, found 2"
        );
    }
}
