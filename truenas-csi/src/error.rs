use thiserror::Error;
use tonic::Status;
use tracing::error;
use truenas_client::ApiError;

use crate::catalog::ObjectKind;

/// Driver-level failure, mapped to a gRPC status at the service boundary.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Internal(String),

    #[error("failed to {action} {kind} '{key}': {source}")]
    Remote {
        action: &'static str,
        kind: ObjectKind,
        key: String,
        #[source]
        source: ApiError,
    },
}

impl DriverError {
    /// Wrap an appliance failure, logging the object it concerned.
    pub fn remote(
        action: &'static str,
        kind: ObjectKind,
        key: impl Into<String>,
        source: ApiError,
    ) -> Self {
        let key = key.into();
        error!(
            action = action,
            object = %kind,
            key = %key,
            error = %source,
            "Appliance request failed"
        );
        DriverError::Remote {
            action,
            kind,
            key,
            source,
        }
    }

    /// Short status label for metrics.
    pub fn code_name(&self) -> &'static str {
        match self {
            DriverError::InvalidArgument(_) => "invalid_argument",
            DriverError::OutOfRange(_) => "out_of_range",
            DriverError::NotFound(_) => "not_found",
            DriverError::PermissionDenied(_) => "permission_denied",
            DriverError::Unimplemented(_) => "unimplemented",
            DriverError::Aborted(_) => "aborted",
            DriverError::Internal(_) | DriverError::Remote { .. } => "internal",
        }
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        let message = err.to_string();
        match err {
            DriverError::InvalidArgument(_) => Status::invalid_argument(message),
            DriverError::OutOfRange(_) => Status::out_of_range(message),
            DriverError::NotFound(_) => Status::not_found(message),
            DriverError::PermissionDenied(_) => Status::permission_denied(message),
            DriverError::Unimplemented(_) => Status::unimplemented(message),
            DriverError::Aborted(_) => Status::aborted(message),
            DriverError::Internal(_) | DriverError::Remote { .. } => Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
