// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use crate::io::InputStream;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A command to run on the system under test.
///
/// Remote stdout and stderr are delivered to the target's current output
/// sink; stdin is fed from the attached [`InputStream`].
pub struct Command {
    pub(crate) command: String,
    pub(crate) user: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) request_tty: bool,
    pub(crate) stdin: InputStream,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Command {
        Command {
            command: command.into(),
            user: None,
            timeout: DEFAULT_TIMEOUT,
            request_tty: false,
            stdin: InputStream::null(),
        }
    }

    /// Remote user to run as. Defaults to `root`.
    pub fn user(mut self, user: impl Into<String>) -> Command {
        self.user = Some(user.into());
        self
    }

    /// Hard deadline for the whole transaction, connection setup included.
    pub fn timeout(mut self, timeout: Duration) -> Command {
        self.timeout = timeout;
        self
    }

    /// Ask the server for a PTY before executing the command.
    pub fn request_tty(mut self, request_tty: bool) -> Command {
        self.request_tty = request_tty;
        self
    }

    pub fn stdin(mut self, stdin: InputStream) -> Command {
        self.stdin = stdin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, DEFAULT_TIMEOUT};
    use std::time::Duration;

    #[test]
    fn defaults() {
        let cmd = Command::new("/bin/true");
        assert_eq!(cmd.command, "/bin/true");
        assert_eq!(cmd.user, None);
        assert_eq!(cmd.timeout, DEFAULT_TIMEOUT);
        assert!(!cmd.request_tty);
    }

    #[test]
    fn builder_overrides() {
        let cmd = Command::new("/bin/cat")
            .user("joe")
            .timeout(Duration::from_secs(5))
            .request_tty(true);
        assert_eq!(cmd.user.as_deref(), Some("joe"));
        assert_eq!(cmd.timeout, Duration::from_secs(5));
        assert!(cmd.request_tty);
    }
}
