// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::command::Command;
use crate::errors::{Error, Result, Status};
use crate::io::{InputStream, OutputStream};
use crate::sink::OutputSink;

/// A named transport backend. `init` binds a backend-specific target spec
/// (the part after the scheme) to a fresh handle.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, spec: &str) -> Result<Box<dyn TargetOps>>;
}

/// The operation vector a backend exposes for one target.
///
/// Every method has a default body answering [`Error::NotSupported`], so a
/// backend only implements the operations it actually has a wire
/// representation for.
#[async_trait]
pub trait TargetOps: Send + Sync {
    async fn run_command(&self, cmd: Command, sink: &Mutex<OutputSink>) -> Result<Status> {
        let _ = (cmd, sink);
        Err(Error::NotSupported)
    }

    async fn inject_file(
        &self,
        user: Option<&str>,
        source: InputStream,
        remote_path: &str,
        mode: u32,
        sink: &Mutex<OutputSink>,
    ) -> Result<Status> {
        let _ = (user, source, remote_path, mode, sink);
        Err(Error::NotSupported)
    }

    async fn extract_file(
        &self,
        user: Option<&str>,
        remote_path: &str,
        dest: &mut OutputStream,
        sink: &Mutex<OutputSink>,
    ) -> Result<Status> {
        let _ = (user, remote_path, dest, sink);
        Err(Error::NotSupported)
    }

    async fn interrupt_command(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    async fn exit_remote(&self) -> Result<()> {
        Err(Error::NotSupported)
    }
}

// Process-wide backend table, keyed by scheme. Populated lazily, entries
// live for the process lifetime, the first registration of a scheme wins.
static BACKENDS: LazyLock<Mutex<HashMap<String, Arc<dyn Backend>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn backends() -> MutexGuard<'static, HashMap<String, Arc<dyn Backend>>> {
    BACKENDS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn builtin_backend(scheme: &str) -> Option<Arc<dyn Backend>> {
    match scheme {
        "ssh" => Some(Arc::new(crate::ssh::SshBackend)),
        _ => None,
    }
}

/// Extends the known scheme set with an out-of-tree backend. A duplicate
/// scheme or a malformed backend name is rejected as incompatible.
pub fn register_backend(backend: Arc<dyn Backend>) -> Result<()> {
    let name = backend.name().to_string();
    if name.is_empty() || name.contains(':') {
        return Err(Error::IncompatiblePlugin);
    }
    let mut table = backends();
    if table.contains_key(&name) || builtin_backend(&name).is_some() {
        return Err(Error::IncompatiblePlugin);
    }
    table.insert(name, backend);
    Ok(())
}

pub(crate) fn backend_for(scheme: &str) -> Result<Arc<dyn Backend>> {
    let mut table = backends();
    if let Some(backend) = table.get(scheme) {
        return Ok(backend.clone());
    }
    let Some(backend) = builtin_backend(scheme) else {
        return Err(Error::UnknownPlugin);
    };
    table.insert(scheme.to_string(), backend.clone());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::{Backend, TargetOps, backend_for, register_backend};
    use crate::errors::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NamedBackend(&'static str);

    #[async_trait]
    impl Backend for NamedBackend {
        fn name(&self) -> &str {
            self.0
        }

        async fn init(&self, _spec: &str) -> Result<Box<dyn TargetOps>> {
            struct NoOps;
            impl TargetOps for NoOps {}
            Ok(Box::new(NoOps))
        }
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert_eq!(backend_for("bogus").err(), Some(Error::UnknownPlugin));
    }

    #[test]
    fn builtin_ssh_is_found_and_cached() {
        let first = backend_for("ssh").unwrap();
        let second = backend_for("ssh").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn duplicate_registration_is_incompatible() {
        register_backend(Arc::new(NamedBackend("dup"))).unwrap();
        let err = register_backend(Arc::new(NamedBackend("dup"))).unwrap_err();
        assert_eq!(err, Error::IncompatiblePlugin);
    }

    #[test]
    fn malformed_backend_names_are_incompatible() {
        let err = register_backend(Arc::new(NamedBackend(""))).unwrap_err();
        assert_eq!(err, Error::IncompatiblePlugin);
        let err = register_backend(Arc::new(NamedBackend("a:b"))).unwrap_err();
        assert_eq!(err, Error::IncompatiblePlugin);
        let err = register_backend(Arc::new(NamedBackend("ssh"))).unwrap_err();
        assert_eq!(err, Error::IncompatiblePlugin);
    }
}
