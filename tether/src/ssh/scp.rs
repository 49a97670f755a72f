// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Mutex;

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use thiserror::Error as ThisError;

use crate::errors::{Error, Result, Status};
use crate::io::{InputStream, OutputStream};
use crate::sink::{OutputSink, lock_sink};
use crate::ssh::session::ClientHandler;
use crate::ssh::{CHUNK_SIZE, SshTarget};

// Remote status codes carried in scp acknowledgements. A transport or
// framing failure is reported like a fatal remote error.
const SCP_WARNING: u8 = 1;
const SCP_FATAL: u8 = 2;

#[derive(Debug, ThisError)]
enum ScpError {
    #[error("remote scp error ({code}): {message}")]
    Remote { code: u8, message: String },
    #[error("scp stream ended mid-transfer")]
    Truncated,
    #[error("malformed scp message")]
    Protocol,
    #[error("scp transport failure")]
    Transport,
}

impl ScpError {
    fn status_code(&self) -> i32 {
        match self {
            ScpError::Remote { code, .. } => i32::from(*code),
            _ => i32::from(SCP_FATAL),
        }
    }
}

/// What the remote scp source offers next.
#[derive(Debug, PartialEq, Eq)]
enum PullRequest {
    File { name: String, size: u64, mode: u32 },
    Dir { name: String, mode: u32 },
    EndDir,
    Eof,
}

/// One scp conversation over an exec channel, with buffered reads of the
/// remote byte stream.
struct ScpChannel {
    channel: Channel<Msg>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl ScpChannel {
    async fn open(session: &Handle<ClientHandler>, command: String) -> Result<ScpChannel> {
        let mut channel = session.channel_open_session().await.map_err(|err| {
            log::debug!("scp channel open failed: {err}");
            Error::OpenSession
        })?;
        channel.exec(true, command.as_str()).await.map_err(|err| {
            log::debug!("scp exec failed: {err}");
            Error::OpenSession
        })?;
        Ok(ScpChannel { channel, buf: Vec::new(), pos: 0, eof: false })
    }

    /// Opens the remote side in sink mode (upload into `directory`). The
    /// remote signals readiness with an acknowledgement.
    async fn open_sink(session: &Handle<ClientHandler>, directory: &str) -> Result<ScpChannel> {
        let mut scp = ScpChannel::open(session, scp_sink_command(directory)).await?;
        scp.read_ack().await.map_err(|err| {
            log::debug!("scp sink handshake failed: {err}");
            Error::OpenSession
        })?;
        Ok(scp)
    }

    /// Opens the remote side in source mode (download of `path`). The first
    /// acknowledgement is ours.
    async fn open_source(
        session: &Handle<ClientHandler>,
        path: &str,
        recursive: bool,
    ) -> Result<ScpChannel> {
        let mut scp = ScpChannel::open(session, scp_source_command(path, recursive)).await?;
        scp.send_ack().await.map_err(|err| {
            log::debug!("scp source handshake failed: {err}");
            Error::OpenSession
        })?;
        Ok(scp)
    }

    async fn refill(&mut self) -> std::result::Result<(), ScpError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    self.buf = data.to_vec();
                    self.pos = 0;
                    return Ok(());
                }
                // Remote scp chatter on stderr is not part of the protocol.
                Some(ChannelMsg::ExtendedData { .. }) => {}
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                    self.eof = true;
                    return Ok(());
                }
                Some(_) => {}
            }
        }
    }

    async fn next_byte(&mut self) -> std::result::Result<Option<u8>, ScpError> {
        loop {
            if self.pos < self.buf.len() {
                let byte = self.buf[self.pos];
                self.pos += 1;
                return Ok(Some(byte));
            }
            if self.eof {
                return Ok(None);
            }
            self.refill().await?;
        }
    }

    async fn read_line(&mut self) -> std::result::Result<String, ScpError> {
        let mut line = Vec::new();
        loop {
            let Some(byte) = self.next_byte().await? else {
                return Err(ScpError::Truncated);
            };
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn read_chunk(&mut self, out: &mut [u8]) -> std::result::Result<(), ScpError> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos < self.buf.len() {
                let take = (self.buf.len() - self.pos).min(out.len() - filled);
                out[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
                filled += take;
            } else if self.eof {
                return Err(ScpError::Truncated);
            } else {
                self.refill().await?;
            }
        }
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> std::result::Result<(), ScpError> {
        self.channel.data(data).await.map_err(|_| ScpError::Transport)
    }

    async fn send_ack(&mut self) -> std::result::Result<(), ScpError> {
        self.write_all(&[0]).await
    }

    async fn read_ack(&mut self) -> std::result::Result<(), ScpError> {
        let Some(code) = self.next_byte().await? else {
            return Err(ScpError::Truncated);
        };
        match code {
            0 => Ok(()),
            SCP_WARNING | SCP_FATAL => {
                let message = self.read_line().await.unwrap_or_default();
                Err(ScpError::Remote { code, message })
            }
            _ => Err(ScpError::Protocol),
        }
    }

    /// Next request from a remote source: a file or directory announcement,
    /// an end-of-directory marker, or the end of the conversation.
    async fn pull_request(&mut self) -> std::result::Result<PullRequest, ScpError> {
        loop {
            let Some(kind) = self.next_byte().await? else {
                return Ok(PullRequest::Eof);
            };
            match kind {
                b'C' => {
                    let line = self.read_line().await?;
                    let (mode, size, name) =
                        parse_copy_header(&line).ok_or(ScpError::Protocol)?;
                    return Ok(PullRequest::File { name, size, mode });
                }
                b'D' => {
                    let line = self.read_line().await?;
                    let (mode, _, name) = parse_copy_header(&line).ok_or(ScpError::Protocol)?;
                    return Ok(PullRequest::Dir { name, mode });
                }
                b'E' => {
                    self.read_line().await?;
                    return Ok(PullRequest::EndDir);
                }
                // Timestamp announcements are acknowledged and skipped.
                b'T' => {
                    self.read_line().await?;
                    self.send_ack().await?;
                }
                SCP_WARNING | SCP_FATAL => {
                    let message = self.read_line().await.unwrap_or_default();
                    return Err(ScpError::Remote { code: kind, message });
                }
                _ => return Err(ScpError::Protocol),
            }
        }
    }

    /// Terminates an announced upload: the end-of-file byte, then the
    /// remote's verdict.
    async fn finish_write(&mut self) -> std::result::Result<(), ScpError> {
        self.send_ack().await?;
        self.read_ack().await
    }

    /// Consumes the remote's end-of-file byte after a download and confirms.
    async fn finish_read(&mut self) -> std::result::Result<(), ScpError> {
        self.read_ack().await?;
        self.send_ack().await
    }

    async fn shutdown(mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

/// Very small, safe-ish shell escaper for remote paths.
fn sh_quote(path: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&path.replace('\'', r"'\''"));
    out.push('\'');
    out
}

fn scp_sink_command(directory: &str) -> String {
    format!("scp -t {}", sh_quote(directory))
}

fn scp_source_command(path: &str, recursive: bool) -> String {
    if recursive {
        format!("scp -r -f {}", sh_quote(path))
    } else {
        format!("scp -f {}", sh_quote(path))
    }
}

fn parse_copy_header(line: &str) -> Option<(u32, u64, String)> {
    let mut parts = line.splitn(3, ' ');
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let size = parts.next()?.parse::<u64>().ok()?;
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some((mode, size, name.to_string()))
}

/// Splits a remote path into the directory the scp sink is opened against
/// and the announced basename.
fn split_remote_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/".to_string(), String::new());
    }
    match trimmed.rfind('/') {
        None => (".".to_string(), trimmed.to_string()),
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
    }
}

/// Some servers answer an upload into a missing directory by creating a
/// regular file with the directory's name. Probe the directory first: a
/// recursive source request against it must announce a directory.
async fn remote_dir_exists(session: &Handle<ClientHandler>, directory: &str) -> bool {
    let Ok(mut scp) = ScpChannel::open_source(session, directory, true).await else {
        return false;
    };
    let exists = match scp.pull_request().await {
        Ok(PullRequest::Dir { name, mode }) => {
            log::debug!("remote announced directory {name} (mode {mode:04o})");
            true
        }
        _ => false,
    };
    scp.shutdown().await;
    exists
}

async fn put_progress(sink: &Mutex<OutputSink>, byte: u8) {
    let _ = lock_sink(sink).putc(false, byte);
}

/// Uploads a local byte source to `remote_path` on the target.
pub(crate) async fn inject(
    target: &SshTarget,
    user: Option<&str>,
    mut source: InputStream,
    remote_path: &str,
    mode: u32,
    sink: &Mutex<OutputSink>,
) -> Result<Status> {
    let mut status = Status::default();
    let session = target.template.open(user).await?;
    let outcome =
        inject_with_session(&session, &mut source, remote_path, mode, sink, &mut status).await;
    let _ = session
        .disconnect(russh::Disconnect::ByApplication, "", "")
        .await;
    finish_transfer(outcome, status)
}

/// Downloads `remote_path` from the target into a local byte sink.
pub(crate) async fn extract(
    target: &SshTarget,
    user: Option<&str>,
    remote_path: &str,
    dest: &mut OutputStream,
    sink: &Mutex<OutputSink>,
) -> Result<Status> {
    let mut status = Status::default();
    let session = target.template.open(user).await?;
    let outcome = extract_with_session(&session, remote_path, dest, sink, &mut status).await;
    let _ = session
        .disconnect(russh::Disconnect::ByApplication, "", "")
        .await;
    finish_transfer(outcome, status)
}

/// A transfer that went through but left a nonzero status is a remote-side
/// failure.
fn finish_transfer(outcome: Result<()>, status: Status) -> Result<Status> {
    match outcome {
        Ok(()) if !status.is_clean() => Err(Error::RemoteFile),
        Ok(()) => Ok(status),
        Err(err) => Err(err),
    }
}

async fn inject_with_session(
    session: &Handle<ClientHandler>,
    source: &mut InputStream,
    remote_path: &str,
    mode: u32,
    sink: &Mutex<OutputSink>,
    status: &mut Status,
) -> Result<()> {
    // The scp protocol wants the file length up front. A source that cannot
    // tell its size is drained into memory and sent from there.
    let size = match source.byte_len().await {
        Some(size) => size,
        None => {
            let data = source.read_to_end().await.map_err(|err| {
                log::debug!("buffering local stream failed: {err}");
                Error::LocalFile
            })?;
            let size = data.len() as u64;
            *source = InputStream::bytes(data);
            size
        }
    };

    let (directory, basename) = split_remote_path(remote_path);
    if basename.is_empty() {
        return Err(Error::SendFile);
    }
    if !remote_dir_exists(session, &directory).await {
        log::debug!("remote directory {directory} does not exist");
        return Err(Error::SendFile);
    }

    let mut scp = ScpChannel::open_sink(session, &directory).await?;
    let header = format!("C{:04o} {} {}\n", mode & 0o7777, size, basename);
    let announced = match scp.write_all(header.as_bytes()).await {
        Ok(()) => scp.read_ack().await,
        Err(err) => Err(err),
    };
    if let Err(err) = announced {
        log::debug!("announcing {basename} failed: {err}");
        status.major = err.status_code();
        scp.shutdown().await;
        return Err(Error::SendFile);
    }

    let result = send_chunks(&mut scp, source, size, sink, status).await;
    scp.shutdown().await;
    result
}

async fn send_chunks(
    scp: &mut ScpChannel,
    source: &mut InputStream,
    size: u64,
    sink: &Mutex<OutputSink>,
    status: &mut Status,
) -> Result<()> {
    let mut remaining = size;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let chunk = remaining.min(CHUNK_SIZE as u64) as usize;
        if let Err(err) = source.read_exact(&mut buf[..chunk]).await {
            log::debug!("short read from local stream: {err}");
            put_progress(sink, b'\n').await;
            return Err(Error::LocalFile);
        }
        if let Err(err) = scp.write_all(&buf[..chunk]).await {
            status.major = err.status_code();
            put_progress(sink, b'\n').await;
            return Err(Error::SendFile);
        }
        put_progress(sink, b'.').await;
        remaining -= chunk as u64;
    }
    if let Err(err) = scp.finish_write().await {
        log::debug!("remote rejected the upload: {err}");
        status.major = err.status_code();
        put_progress(sink, b'\n').await;
        return Err(Error::SendFile);
    }
    put_progress(sink, b'\n').await;
    Ok(())
}

async fn extract_with_session(
    session: &Handle<ClientHandler>,
    remote_path: &str,
    dest: &mut OutputStream,
    sink: &Mutex<OutputSink>,
    status: &mut Status,
) -> Result<()> {
    let mut scp = ScpChannel::open_source(session, remote_path, false).await?;

    let size = match scp.pull_request().await {
        Ok(PullRequest::File { name, size, mode }) => {
            log::debug!("remote announced {name} ({size} bytes, mode {mode:04o})");
            size
        }
        Ok(request) => {
            log::debug!("expected a file announcement, got {request:?}");
            status.major = i32::from(SCP_FATAL);
            scp.shutdown().await;
            return Err(Error::ReceiveFile);
        }
        Err(err) => {
            log::debug!("pull request failed: {err}");
            status.major = err.status_code();
            scp.shutdown().await;
            return Err(Error::ReceiveFile);
        }
    };

    // An empty remote file has nothing to accept or loop over.
    if size == 0 {
        scp.shutdown().await;
        return Ok(());
    }

    if scp.send_ack().await.is_err() {
        status.major = i32::from(SCP_FATAL);
        scp.shutdown().await;
        return Err(Error::ReceiveFile);
    }

    let mut result = receive_chunks(&mut scp, dest, size, sink, status).await;
    if result.is_ok() {
        result = match scp.pull_request().await {
            Ok(PullRequest::Eof) => Ok(()),
            Ok(request) => {
                log::debug!("expected end of transfer, got {request:?}");
                status.major = i32::from(SCP_FATAL);
                Err(Error::ReceiveFile)
            }
            Err(err) => {
                status.major = err.status_code();
                Err(Error::ReceiveFile)
            }
        };
    }
    scp.shutdown().await;
    if result.is_ok() {
        dest.flush().await.map_err(|_| Error::LocalFile)?;
    }
    result
}

async fn receive_chunks(
    scp: &mut ScpChannel,
    dest: &mut OutputStream,
    size: u64,
    sink: &Mutex<OutputSink>,
    status: &mut Status,
) -> Result<()> {
    let mut remaining = size;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let chunk = remaining.min(CHUNK_SIZE as u64) as usize;
        if let Err(err) = scp.read_chunk(&mut buf[..chunk]).await {
            log::debug!("short read from remote file: {err}");
            status.major = err.status_code();
            put_progress(sink, b'\n').await;
            return Err(Error::ReceiveFile);
        }
        if let Err(err) = dest.write_all(&buf[..chunk]).await {
            log::debug!("writing local stream failed: {err}");
            put_progress(sink, b'\n').await;
            return Err(Error::LocalFile);
        }
        put_progress(sink, b'.').await;
        remaining -= chunk as u64;
    }
    if let Err(err) = scp.finish_read().await {
        status.major = err.status_code();
        put_progress(sink, b'\n').await;
        return Err(Error::ReceiveFile);
    }
    put_progress(sink, b'\n').await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        parse_copy_header, scp_sink_command, scp_source_command, sh_quote, split_remote_path,
    };

    #[test]
    fn copy_headers_parse_mode_size_and_name() {
        assert_eq!(
            parse_copy_header("0644 1234 blob.bin"),
            Some((0o644, 1234, "blob.bin".to_string()))
        );
        assert_eq!(
            parse_copy_header("0755 0 dir"),
            Some((0o755, 0, "dir".to_string()))
        );
        // Names may contain spaces; only the first two fields are split.
        assert_eq!(
            parse_copy_header("0600 7 a b c"),
            Some((0o600, 7, "a b c".to_string()))
        );
    }

    #[test]
    fn malformed_copy_headers_are_rejected() {
        assert_eq!(parse_copy_header(""), None);
        assert_eq!(parse_copy_header("worse"), None);
        assert_eq!(parse_copy_header("0644"), None);
        assert_eq!(parse_copy_header("0644 notasize name"), None);
        assert_eq!(parse_copy_header("0644 12 "), None);
    }

    #[test]
    fn remote_paths_split_into_directory_and_basename() {
        assert_eq!(
            split_remote_path("/tmp/blob"),
            ("/tmp".to_string(), "blob".to_string())
        );
        assert_eq!(split_remote_path("/blob"), ("/".to_string(), "blob".to_string()));
        assert_eq!(split_remote_path("blob"), (".".to_string(), "blob".to_string()));
        assert_eq!(
            split_remote_path("/a/b/c/"),
            ("/a/b".to_string(), "c".to_string())
        );
        assert_eq!(split_remote_path("/"), ("/".to_string(), String::new()));
    }

    #[test]
    fn scp_commands_quote_their_paths() {
        assert_eq!(scp_sink_command("/tmp"), "scp -t '/tmp'");
        assert_eq!(scp_source_command("/tmp/x", false), "scp -f '/tmp/x'");
        assert_eq!(scp_source_command("/tmp", true), "scp -r -f '/tmp'");
        assert_eq!(
            scp_sink_command("/odd'name"),
            r"scp -t '/odd'\''name'"
        );
    }
}
