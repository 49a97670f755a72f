// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Destination for the bytes a remote command writes to its stdout and
/// stderr: dropped, passed through to the controller's terminal, collected
/// into one shared buffer, or collected into two separate buffers.
///
/// Buffered modes have a fixed capacity; bytes past the capacity are silently
/// dropped and the write reports how many bytes were actually stored.
#[derive(Debug)]
pub struct OutputSink {
    mode: Mode,
    outbuf: CappedBuffer,
    errbuf: CappedBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Discard,
    Screen,
    Buffer,
    BufferSeparately,
}

#[derive(Debug, Default)]
struct CappedBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl CappedBuffer {
    fn with_capacity(capacity: usize) -> CappedBuffer {
        CappedBuffer { data: Vec::new(), capacity }
    }

    fn put(&mut self, byte: u8) -> bool {
        if self.data.len() >= self.capacity {
            return false;
        }
        self.data.push(byte);
        true
    }

    fn fill(&mut self, bytes: &[u8]) -> usize {
        let mut stored = 0;
        for &byte in bytes {
            if !self.put(byte) {
                break;
            }
            stored += 1;
        }
        stored
    }
}

impl OutputSink {
    /// Drops everything.
    pub fn discard() -> OutputSink {
        OutputSink {
            mode: Mode::Discard,
            outbuf: CappedBuffer::default(),
            errbuf: CappedBuffer::default(),
        }
    }

    /// Passes remote output through to the controller's own stdout/stderr.
    pub fn screen() -> OutputSink {
        OutputSink {
            mode: Mode::Screen,
            outbuf: CappedBuffer::default(),
            errbuf: CappedBuffer::default(),
        }
    }

    /// Collects stdout and stderr into one shared buffer of `capacity` bytes.
    pub fn buffered(capacity: usize) -> OutputSink {
        if capacity == 0 {
            log::warn!("no capacity supplied for buffered output mode, falling back to discard");
            return OutputSink::discard();
        }
        OutputSink {
            mode: Mode::Buffer,
            outbuf: CappedBuffer::with_capacity(capacity),
            errbuf: CappedBuffer::default(),
        }
    }

    /// Collects stdout and stderr into two buffers of `capacity` bytes each.
    pub fn buffered_separately(capacity: usize) -> OutputSink {
        if capacity == 0 {
            log::warn!(
                "no capacity supplied for separately buffered output mode, falling back to discard"
            );
            return OutputSink::discard();
        }
        OutputSink {
            mode: Mode::BufferSeparately,
            outbuf: CappedBuffer::with_capacity(capacity),
            errbuf: CappedBuffer::with_capacity(capacity),
        }
    }

    /// Delivers a run of bytes from the remote stdout (`is_err == false`) or
    /// stderr stream. Returns the number of bytes actually stored; only a
    /// screen-mode syscall failure is an error.
    pub(crate) fn write(&mut self, is_err: bool, bytes: &[u8]) -> io::Result<usize> {
        match self.mode {
            Mode::Discard => Ok(bytes.len()),
            Mode::Screen => {
                if is_err {
                    let mut stderr = io::stderr().lock();
                    stderr.write_all(bytes)?;
                    stderr.flush()?;
                } else {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(bytes)?;
                    stdout.flush()?;
                }
                Ok(bytes.len())
            }
            Mode::Buffer => Ok(self.outbuf.fill(bytes)),
            Mode::BufferSeparately => {
                if is_err {
                    Ok(self.errbuf.fill(bytes))
                } else {
                    Ok(self.outbuf.fill(bytes))
                }
            }
        }
    }

    pub(crate) fn putc(&mut self, is_err: bool, byte: u8) -> io::Result<usize> {
        self.write(is_err, &[byte])
    }

    /// Bytes collected from the remote stdout (and, in shared-buffer mode,
    /// stderr as well).
    pub fn stdout_bytes(&self) -> &[u8] {
        &self.outbuf.data
    }

    /// Bytes collected from the remote stderr. Empty unless the sink is in
    /// separately-buffered mode.
    pub fn stderr_bytes(&self) -> &[u8] {
        &self.errbuf.data
    }
}

pub(crate) fn lock_sink(sink: &Mutex<OutputSink>) -> MutexGuard<'_, OutputSink> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::OutputSink;

    #[test]
    fn discard_counts_everything_as_delivered() {
        let mut sink = OutputSink::discard();
        assert_eq!(sink.write(false, b"hello").unwrap(), 5);
        assert_eq!(sink.write(true, b"world").unwrap(), 5);
        assert!(sink.stdout_bytes().is_empty());
    }

    #[test]
    fn shared_buffer_interleaves_both_streams() {
        let mut sink = OutputSink::buffered(64);
        sink.write(false, b"out").unwrap();
        sink.write(true, b"err").unwrap();
        sink.write(false, b"!").unwrap();
        assert_eq!(sink.stdout_bytes(), b"outerr!");
        assert!(sink.stderr_bytes().is_empty());
    }

    #[test]
    fn split_buffers_keep_streams_apart() {
        let mut sink = OutputSink::buffered_separately(64);
        sink.write(false, b"out").unwrap();
        sink.write(true, b"err").unwrap();
        assert_eq!(sink.stdout_bytes(), b"out");
        assert_eq!(sink.stderr_bytes(), b"err");
    }

    #[test]
    fn buffer_truncates_silently_at_capacity() {
        let mut sink = OutputSink::buffered(4);
        assert_eq!(sink.write(false, b"abcdef").unwrap(), 4);
        assert_eq!(sink.write(false, b"gh").unwrap(), 0);
        assert_eq!(sink.stdout_bytes(), b"abcd");
    }

    #[test]
    fn split_buffers_truncate_independently() {
        let mut sink = OutputSink::buffered_separately(2);
        assert_eq!(sink.write(false, b"abc").unwrap(), 2);
        assert_eq!(sink.write(true, b"x").unwrap(), 1);
        assert_eq!(sink.stdout_bytes(), b"ab");
        assert_eq!(sink.stderr_bytes(), b"x");
    }

    #[test]
    fn zero_capacity_coerces_to_discard() {
        let mut sink = OutputSink::buffered(0);
        assert_eq!(sink.write(false, b"abc").unwrap(), 3);
        assert!(sink.stdout_bytes().is_empty());

        let mut sink = OutputSink::buffered_separately(0);
        assert_eq!(sink.write(true, b"abc").unwrap(), 3);
        assert!(sink.stderr_bytes().is_empty());
    }
}
