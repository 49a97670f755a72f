// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{Backend, TargetOps};
use crate::command::Command;
use crate::errors::{Error, Result, Status};
use crate::io::{InputStream, OutputStream};
use crate::sink::OutputSink;

mod exec;
mod scp;
mod session;

use exec::ForegroundSlot;
use session::SessionTemplate;

/// Work-buffer size for moving bytes between the channel and local streams.
pub(crate) const CHUNK_SIZE: usize = 16 * 1024;

/// The built-in SSH/SCP backend. Target specs look like `HOST[:PORT]` with
/// an optional `[ipv6]` bracket form; the default port is 22.
pub(crate) struct SshBackend;

#[async_trait]
impl Backend for SshBackend {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn init(&self, spec: &str) -> Result<Box<dyn TargetOps>> {
        let Some((host, port)) = parse_target_spec(spec) else {
            log::debug!("unusable ssh target spec {spec:?}");
            return Err(Error::UnknownPlugin);
        };
        Ok(Box::new(SshTarget {
            template: SessionTemplate::new(host, port),
            foreground: ForegroundSlot::default(),
        }))
    }
}

/// One SSH target: the session template plus the single-slot foreground
/// transaction reference.
pub(crate) struct SshTarget {
    pub(crate) template: SessionTemplate,
    pub(crate) foreground: ForegroundSlot,
}

#[async_trait]
impl TargetOps for SshTarget {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, cmd, sink),
        fields(op = "run_command", host = %self.template.host(), port = self.template.port())
    )]
    async fn run_command(&self, cmd: Command, sink: &Mutex<OutputSink>) -> Result<Status> {
        exec::run(self, cmd, sink).await
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip_all,
        fields(op = "inject_file", host = %self.template.host(), port = self.template.port(), path = %remote_path)
    )]
    async fn inject_file(
        &self,
        user: Option<&str>,
        source: InputStream,
        remote_path: &str,
        mode: u32,
        sink: &Mutex<OutputSink>,
    ) -> Result<Status> {
        scp::inject(self, user, source, remote_path, mode, sink).await
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip_all,
        fields(op = "extract_file", host = %self.template.host(), port = self.template.port(), path = %remote_path)
    )]
    async fn extract_file(
        &self,
        user: Option<&str>,
        remote_path: &str,
        dest: &mut OutputStream,
        sink: &Mutex<OutputSink>,
    ) -> Result<Status> {
        scp::extract(self, user, remote_path, dest, sink).await
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self),
        fields(op = "interrupt", host = %self.template.host(), port = self.template.port())
    )]
    async fn interrupt_command(&self) -> Result<()> {
        exec::interrupt(&self.foreground).await
    }

    // exit_remote has no wire representation over SSH; the trait default
    // answers NotSupported.
}

/// Parses `HOST[:PORT]`. The rightmost `:` separates the port from the
/// host; an IPv6 host keeps its brackets in the spec (`[::1]:2222`) and
/// loses them here. Ports must be decimal, nonzero and below 65535.
fn parse_target_spec(spec: &str) -> Option<(String, u16)> {
    if spec.is_empty() {
        return None;
    }
    let Some((host, port)) = spec.rsplit_once(':') else {
        return Some((spec.to_string(), 22));
    };

    let port: u32 = port.parse().ok()?;
    if port == 0 || port >= 65535 {
        return None;
    }

    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port as u16))
}

#[cfg(test)]
mod tests {
    use super::parse_target_spec;

    #[test]
    fn bare_hostname_gets_the_default_port() {
        assert_eq!(parse_target_spec("sut.example"), Some(("sut.example".to_string(), 22)));
    }

    #[test]
    fn port_suffix_is_split_off() {
        assert_eq!(parse_target_spec("sut:2200"), Some(("sut".to_string(), 2200)));
    }

    #[test]
    fn bracketed_ipv6_hosts_are_unwrapped() {
        assert_eq!(parse_target_spec("[::1]:2222"), Some(("::1".to_string(), 2222)));
        assert_eq!(
            parse_target_spec("[fe80::1%eth0]:22"),
            Some(("fe80::1%eth0".to_string(), 22))
        );
    }

    #[test]
    fn bracketed_host_without_port_is_rejected() {
        // The rightmost colon is taken for a port separator, and "1]" is
        // not a port.
        assert_eq!(parse_target_spec("[::1]"), None);
    }

    #[test]
    fn bad_ports_are_rejected() {
        assert_eq!(parse_target_spec("sut:0"), None);
        assert_eq!(parse_target_spec("sut:65535"), None);
        assert_eq!(parse_target_spec("sut:652xx"), None);
        assert_eq!(parse_target_spec("sut:"), None);
        assert_eq!(parse_target_spec(":22"), None);
    }

    #[test]
    fn highest_valid_port_is_accepted() {
        assert_eq!(parse_target_spec("sut:65534"), Some(("sut".to_string(), 65534)));
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert_eq!(parse_target_spec(""), None);
    }
}
