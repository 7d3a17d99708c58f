use dde_proto::SysError;
use smol_str::SmolStr;
use thiserror::Error;

/// Errors surfaced by the managed DDE objects.
///
/// The first three groups are local contract violations detected before any
/// facility call is made; `Protocol` wraps a failure reported by the facility
/// itself, together with its numeric last-error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DdeError {
    #[error("object disposed")]
    Disposed,
    #[error("context is already initialized")]
    AlreadyInitialized,
    #[error("conversation is already established")]
    AlreadyConnected,
    #[error("conversation is not established")]
    NotConnected,
    #[error("already paused")]
    AlreadyPaused,
    #[error("not paused")]
    NotPaused,
    #[error("service is already registered")]
    AlreadyRegistered,
    #[error("service is not registered")]
    NotRegistered,
    #[error("item {item} is already being advised")]
    AlreadyAdvised { item: SmolStr },
    #[error("item {item} is not being advised")]
    NotAdvised { item: SmolStr },
    #[error("transaction filter is already added")]
    FilterAlreadyAdded,
    #[error("transaction filter is not added")]
    FilterNotAdded,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{operation} failed: {code}")]
    Protocol { operation: &'static str, code: SysError },
    #[error("owning thread is no longer running")]
    ThreadGone,
}

impl DdeError {
    pub(crate) fn protocol(operation: &'static str, code: SysError) -> Self {
        DdeError::Protocol { operation, code }
    }

    /// Facility error code for `Protocol` errors, `None` for local ones.
    pub fn sys_code(&self) -> Option<SysError> {
        match self {
            DdeError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Numeric status returned by the non-panicking `try_*` operations.
///
/// Zero is success, positive values are facility error codes, small negative
/// values are the local contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(i32);

impl Status {
    pub const OK: Self = Self(0);
    pub const DISPOSED: Self = Self(-1);
    pub const NOT_CONNECTED: Self = Self(-2);
    pub const INVALID_ARGUMENT: Self = Self(-3);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn code(self) -> i32 {
        self.0
    }

    /// Facility error code when the status carries one.
    pub fn sys_code(self) -> Option<SysError> {
        u16::try_from(self.0).ok().filter(|&c| c != 0).map(SysError::from)
    }
}

impl From<SysError> for Status {
    fn from(code: SysError) -> Self {
        Self(i32::from(code.code()))
    }
}

impl From<&DdeError> for Status {
    fn from(error: &DdeError) -> Self {
        match error {
            DdeError::Disposed => Status::DISPOSED,
            DdeError::NotConnected => Status::NOT_CONNECTED,
            DdeError::Protocol { code, .. } => Status::from(*code),
            _ => Status::INVALID_ARGUMENT,
        }
    }
}

pub(crate) fn status_of<T>(result: &Result<T, DdeError>) -> Status {
    match result {
        Ok(_) => Status::OK,
        Err(error) => Status::from(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(Status::OK.is_ok());
        assert_eq!(Status::from(&DdeError::Disposed), Status::DISPOSED);
        assert_eq!(Status::from(&DdeError::NotConnected), Status::NOT_CONNECTED);
        assert_eq!(Status::from(&DdeError::InvalidArgument("timeout")), Status::INVALID_ARGUMENT);

        let status = Status::from(&DdeError::protocol("execute", SysError::NOTPROCESSED));
        assert_eq!(status.code(), 0x4009);
        assert_eq!(status.sys_code(), Some(SysError::NOTPROCESSED));
        assert_eq!(Status::OK.sys_code(), None);
    }

    #[test]
    fn protocol_error_reports_code() {
        let error = DdeError::protocol("request", SysError::DATAACKTIMEOUT);
        assert_eq!(error.sys_code(), Some(SysError::DATAACKTIMEOUT));
        assert_eq!(error.to_string(), "request failed: DMLERR_DATAACKTIMEOUT (0x4002)");
        assert_eq!(DdeError::NotConnected.sys_code(), None);
    }
}
