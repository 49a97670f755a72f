// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

/// Everything a target operation can fail with. Each kind carries a fixed
/// human-readable message and a stable negative code so embedding controllers
/// can report failures without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("Invalid command parameter")]
    Parameter,
    #[error("Error opening the communication with the system under test")]
    OpenSession,
    #[error("Error sending command to the system under test")]
    SendCommand,
    #[error("Error forwarding keyboard input")]
    ForwardInput,
    #[error("Error receiving the results of action")]
    ReceiveResults,
    #[error("Local error while transferring file")]
    LocalFile,
    #[error("Error sending file to the system under test")]
    SendFile,
    #[error("Remote error while transferring file")]
    RemoteFile,
    #[error("Error receiving file from the system under test")]
    ReceiveFile,
    #[error("Failed to interrupt command")]
    InterruptCommand,
    #[error("Invalid target spec")]
    InvalidTargetSpec,
    #[error("Unknown plugin")]
    UnknownPlugin,
    #[error("Incompatible plugin")]
    IncompatiblePlugin,
    #[error("Command timed out")]
    CommandTimeout,
    #[error("Operation not supported")]
    NotSupported,
}

impl Error {
    const ALL: [Error; 15] = [
        Error::Parameter,
        Error::OpenSession,
        Error::SendCommand,
        Error::ForwardInput,
        Error::ReceiveResults,
        Error::LocalFile,
        Error::SendFile,
        Error::RemoteFile,
        Error::ReceiveFile,
        Error::InterruptCommand,
        Error::InvalidTargetSpec,
        Error::UnknownPlugin,
        Error::IncompatiblePlugin,
        Error::CommandTimeout,
        Error::NotSupported,
    ];

    /// Stable negative code for this error kind.
    pub fn code(self) -> i32 {
        match self {
            Error::Parameter => -1,
            Error::OpenSession => -2,
            Error::SendCommand => -3,
            Error::ForwardInput => -4,
            Error::ReceiveResults => -5,
            Error::LocalFile => -6,
            Error::SendFile => -7,
            Error::RemoteFile => -8,
            Error::ReceiveFile => -9,
            Error::InterruptCommand => -10,
            Error::InvalidTargetSpec => -11,
            Error::UnknownPlugin => -12,
            Error::IncompatiblePlugin => -13,
            Error::CommandTimeout => -14,
            Error::NotSupported => -15,
        }
    }

    pub fn from_code(code: i32) -> Option<Error> {
        Error::ALL.iter().copied().find(|err| err.code() == code)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fixed message for an error code, `"Unknown error"` for anything else.
pub fn strerror(code: i32) -> &'static str {
    match code {
        -1 => "Invalid command parameter",
        -2 => "Error opening the communication with the system under test",
        -3 => "Error sending command to the system under test",
        -4 => "Error forwarding keyboard input",
        -5 => "Error receiving the results of action",
        -6 => "Local error while transferring file",
        -7 => "Error sending file to the system under test",
        -8 => "Remote error while transferring file",
        -9 => "Error receiving file from the system under test",
        -10 => "Failed to interrupt command",
        -11 => "Invalid target spec",
        -12 => "Unknown plugin",
        -13 => "Incompatible plugin",
        -14 => "Command timed out",
        -15 => "Operation not supported",
        _ => "Unknown error",
    }
}

/// Writes `"<prefix>: <message>.\n"` to the controller's diagnostic stream.
pub fn perror(prefix: &str, code: i32) {
    eprintln!("{prefix}: {}.", strerror(code));
}

/// Result pair reported by remote operations. On a clean exit `major` is zero
/// and `minor` carries the exit code; when the remote process died from a
/// signal, `major` is `EFAULT` and `minor` the signal number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub major: i32,
    pub minor: i32,
}

impl Status {
    pub fn exited(code: i32) -> Status {
        Status { major: 0, minor: code }
    }

    pub fn signaled(signo: i32) -> Status {
        Status { major: libc::EFAULT, minor: signo }
    }

    pub fn is_clean(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Status, strerror};

    #[test]
    fn codes_are_negative_and_unique() {
        let mut seen = Vec::new();
        for err in Error::ALL {
            let code = err.code();
            assert!(code < 0, "{err:?} has non-negative code {code}");
            assert!(!seen.contains(&code), "duplicate code {code}");
            seen.push(code);
        }
    }

    #[test]
    fn from_code_round_trips() {
        for err in Error::ALL {
            assert_eq!(Error::from_code(err.code()), Some(err));
        }
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(-100), None);
    }

    #[test]
    fn strerror_matches_display() {
        for err in Error::ALL {
            assert_eq!(strerror(err.code()), err.to_string());
        }
        assert_eq!(strerror(7), "Unknown error");
    }

    #[test]
    fn status_constructors() {
        assert_eq!(Status::exited(42), Status { major: 0, minor: 42 });
        let signaled = Status::signaled(15);
        assert_eq!(signaled.major, libc::EFAULT);
        assert_eq!(signaled.minor, 15);
        assert!(Status::default().is_clean());
        assert!(!signaled.is_clean());
    }
}
