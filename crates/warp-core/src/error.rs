//! Terminal errors of a run

use crate::context::CancelReason;
use crate::identity::{CacheError, RegistrationError};
use crate::options::ValidationError;
use crate::scanner::ScanError;
use crate::tunnel::TunnelError;
use thiserror::Error;

/// Message carried by the AmneziaWG stub
pub const AMNEZIA_NOT_IMPLEMENTED: &str = "AmneziaWG connection logic not implemented yet";

/// Error kind, for callers that branch on the failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Cache,
    Registration,
    Scan,
    NotImplemented,
    Tunnel,
    Cancelled,
}

/// Every way a run can end without a session
#[derive(Debug, Error)]
pub enum WarpError {
    #[error("invalid options: {0}")]
    Validation(#[from] ValidationError),

    #[error("identity cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("endpoint scan failed: {0}")]
    Scan(ScanError),

    #[error("{0}")]
    NotImplemented(&'static str),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("{0}")]
    Cancelled(CancelReason),
}

impl WarpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarpError::Validation(_) => ErrorKind::Validation,
            WarpError::Cache(_) => ErrorKind::Cache,
            WarpError::Registration(_) => ErrorKind::Registration,
            WarpError::Scan(_) => ErrorKind::Scan,
            WarpError::NotImplemented(_) => ErrorKind::NotImplemented,
            WarpError::Tunnel(_) => ErrorKind::Tunnel,
            WarpError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// The caller may retry the whole run (possibly with relaxed options)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Registration | ErrorKind::Scan | ErrorKind::Tunnel
        )
    }

    /// The run neither succeeded nor was rejected
    pub fn is_inconclusive(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<CancelReason> for WarpError {
    fn from(reason: CancelReason) -> Self {
        WarpError::Cancelled(reason)
    }
}

impl From<ScanError> for WarpError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Cancelled(reason) => WarpError::Cancelled(reason),
            other => WarpError::Scan(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WarpError>;
