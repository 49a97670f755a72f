// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::mem;
use std::sync::Mutex;

use crate::backend::{self, TargetOps};
use crate::command::Command;
use crate::errors::{Error, Result, Status};
use crate::io::{InputStream, OutputStream};
use crate::sink::{OutputSink, lock_sink};

/// A handle bound to one backend instance addressing one system under test.
///
/// Obtained from a `scheme:spec` string; every subsequent operation flows
/// through the backend bound at construction. Dropping the handle releases
/// the backend state.
pub struct Target {
    backend: String,
    ops: Box<dyn TargetOps>,
    sink: Mutex<OutputSink>,
}

fn split_target_spec(spec: &str) -> Result<(&str, &str)> {
    let (scheme, rest) = match spec.split_once(':') {
        Some((scheme, rest)) => (scheme, rest),
        None => (spec, ""),
    };
    if scheme.is_empty() {
        return Err(Error::InvalidTargetSpec);
    }
    Ok((scheme, rest))
}

impl Target {
    /// Resolves `spec` (`scheme[:backend-spec]`) to a registered backend and
    /// binds a target handle through its `init`.
    #[tracing::instrument(name = "target", level = "debug", skip_all, fields(spec = %spec))]
    pub async fn new(spec: &str) -> Result<Target> {
        let (scheme, rest) = split_target_spec(spec)?;
        let backend = backend::backend_for(scheme)?;
        let ops = backend.init(rest).await.map_err(|err| {
            log::debug!("backend {scheme} rejected target spec {rest:?}: {err}");
            Error::UnknownPlugin
        })?;
        Ok(Target {
            backend: scheme.to_string(),
            ops,
            sink: Mutex::new(OutputSink::discard()),
        })
    }

    pub fn backend_name(&self) -> &str {
        &self.backend
    }

    /// Replaces the current output sink.
    pub fn set_output(&self, sink: OutputSink) {
        *lock_sink(&self.sink) = sink;
    }

    /// Takes the current output sink, leaving a discarding one behind.
    pub fn take_output(&self) -> OutputSink {
        mem::replace(&mut *lock_sink(&self.sink), OutputSink::discard())
    }

    /// Runs a command on the target, streaming its stdio through the current
    /// sink, and reports the remote exit status.
    #[tracing::instrument(name = "run", level = "debug", skip(self, cmd), fields(backend = %self.backend))]
    pub async fn run(&self, cmd: Command) -> Result<Status> {
        self.ops.run_command(cmd, &self.sink).await
    }

    /// Uploads a local byte source to `remote_path` with the given mode.
    #[tracing::instrument(
        name = "inject",
        level = "debug",
        skip_all,
        fields(backend = %self.backend, path = %remote_path)
    )]
    pub async fn inject_file(
        &self,
        user: Option<&str>,
        source: InputStream,
        remote_path: &str,
        mode: u32,
    ) -> Result<Status> {
        self.ops
            .inject_file(user, source, remote_path, mode, &self.sink)
            .await
    }

    /// Downloads `remote_path` into a local byte sink.
    #[tracing::instrument(
        name = "extract",
        level = "debug",
        skip_all,
        fields(backend = %self.backend, path = %remote_path)
    )]
    pub async fn extract_file(
        &self,
        user: Option<&str>,
        remote_path: &str,
        dest: &mut OutputStream,
    ) -> Result<Status> {
        self.ops.extract_file(user, remote_path, dest, &self.sink).await
    }

    /// Forwards a controller interrupt to the foreground command.
    pub async fn interrupt(&self) -> Result<()> {
        self.ops.interrupt_command().await
    }

    /// Asks the remote end to shut down. Not every backend has a wire
    /// representation for this.
    pub async fn exit_remote(&self) -> Result<()> {
        self.ops.exit_remote().await
    }
}
