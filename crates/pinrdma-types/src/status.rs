use std::fmt;

use crate::status_code::{self, status_code_t};

/// Error crossing the session trigger boundary.
///
/// Layer errors (`MemError`, `RdmaError`) fold into one of these so the
/// caller sees a code, a message and the errno a write call would return.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: String,
}

impl Status {
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }

    pub fn code(&self) -> status_code_t {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errno(&self) -> i32 {
        status_code::to_errno(self.code)
    }
}

impl fmt::Display for Status {
    /// Renders like `Mem::InvalidAddress(1002) no page mapped at 0x1000`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) {}", status_code::to_string(self.code), self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{MemCode, RdmaCode};

    #[test]
    fn test_display_names_the_code() {
        let s = Status::with_message(MemCode::INVALID_ADDRESS, "page 3 not mapped");
        assert_eq!(s.code(), 1002);
        assert_eq!(s.message(), "page 3 not mapped");
        assert_eq!(s.to_string(), "Mem::InvalidAddress(1002) page 3 not mapped");
    }

    #[test]
    fn test_errno_follows_code() {
        let s = Status::with_message(RdmaCode::DEVICE_NOT_FOUND, "mlx5_9");
        assert_eq!(s.errno(), libc::ENODEV);
        let e: &dyn std::error::Error = &s;
        assert!(e.to_string().starts_with("Rdma::DeviceNotFound"));
    }
}
