// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::{self, Cursor};
use std::path::Path;

use tokio::fs as tokiofs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Local byte source bound to a command's stdin or to a file upload.
///
/// `Bytes` sources are always ready and report their length; `Stdin` and
/// `Reader` sources have no usable length up front, so uploads drain them
/// into memory first.
pub enum InputStream {
    /// Immediate EOF.
    Null,
    /// In-memory bytes.
    Bytes(Cursor<Vec<u8>>),
    /// An already opened local file.
    File(tokiofs::File),
    /// The controller's own stdin.
    Stdin(tokio::io::Stdin),
    /// Any other byte source, e.g. a pipe.
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl InputStream {
    pub fn null() -> InputStream {
        InputStream::Null
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> InputStream {
        InputStream::Bytes(Cursor::new(data.into()))
    }

    pub async fn open(path: impl AsRef<Path>) -> io::Result<InputStream> {
        Ok(InputStream::File(tokiofs::File::open(path).await?))
    }

    pub fn stdin() -> InputStream {
        InputStream::Stdin(tokio::io::stdin())
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> InputStream {
        InputStream::Reader(Box::new(reader))
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputStream::Null => Ok(0),
            InputStream::Bytes(cursor) => cursor.read(buf).await,
            InputStream::File(file) => file.read(buf).await,
            InputStream::Stdin(stdin) => stdin.read(buf).await,
            InputStream::Reader(reader) => reader.read(buf).await,
        }
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self {
            InputStream::Null => Err(io::ErrorKind::UnexpectedEof.into()),
            InputStream::Bytes(cursor) => cursor.read_exact(buf).await.map(drop),
            InputStream::File(file) => file.read_exact(buf).await.map(drop),
            InputStream::Stdin(stdin) => stdin.read_exact(buf).await.map(drop),
            InputStream::Reader(reader) => reader.read_exact(buf).await.map(drop),
        }
    }

    /// Remaining length of the source, when it can be known without
    /// consuming it.
    pub(crate) async fn byte_len(&self) -> Option<u64> {
        match self {
            InputStream::Null => Some(0),
            InputStream::Bytes(cursor) => {
                Some((cursor.get_ref().len() as u64).saturating_sub(cursor.position()))
            }
            InputStream::File(file) => file.metadata().await.ok().map(|meta| meta.len()),
            InputStream::Stdin(_) | InputStream::Reader(_) => None,
        }
    }

    /// Drains whatever is left in the source into memory.
    pub(crate) async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        match self {
            InputStream::Null => {}
            InputStream::Bytes(cursor) => {
                cursor.read_to_end(&mut data).await?;
            }
            InputStream::File(file) => {
                file.read_to_end(&mut data).await?;
            }
            InputStream::Stdin(stdin) => {
                stdin.read_to_end(&mut data).await?;
            }
            InputStream::Reader(reader) => {
                reader.read_to_end(&mut data).await?;
            }
        }
        Ok(data)
    }
}

/// Local byte sink receiving a downloaded file.
pub enum OutputStream {
    /// Drops everything.
    Null,
    /// Accumulates in memory.
    Bytes(Vec<u8>),
    /// A local file, created up front so an empty transfer still leaves an
    /// empty file behind.
    File(tokiofs::File),
}

impl OutputStream {
    pub fn null() -> OutputStream {
        OutputStream::Null
    }

    pub fn buffer() -> OutputStream {
        OutputStream::Bytes(Vec::new())
    }

    pub async fn create(path: impl AsRef<Path>) -> io::Result<OutputStream> {
        Ok(OutputStream::File(tokiofs::File::create(path).await?))
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            OutputStream::Null => Ok(()),
            OutputStream::Bytes(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            OutputStream::File(file) => file.write_all(data).await,
        }
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::File(file) => file.flush().await,
            _ => Ok(()),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            OutputStream::Bytes(buf) => buf,
            _ => &[],
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            OutputStream::Bytes(buf) => buf,
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InputStream, OutputStream};
    use std::fs;

    #[tokio::test]
    async fn bytes_source_reads_and_knows_its_length() {
        let mut stream = InputStream::bytes(b"abc".to_vec());
        assert_eq!(stream.byte_len().await, Some(3));

        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(stream.byte_len().await, Some(1));

        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn null_source_is_at_eof() {
        let mut stream = InputStream::null();
        assert_eq!(stream.byte_len().await, Some(0));
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reader_source_has_no_length_but_drains() {
        let mut stream = InputStream::from_reader(std::io::Cursor::new(b"pipe data".to_vec()));
        assert_eq!(stream.byte_len().await, None);
        assert_eq!(stream.read_to_end().await.unwrap(), b"pipe data");
    }

    #[tokio::test]
    async fn file_source_reports_metadata_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"0123456789").unwrap();

        let stream = InputStream::open(&path).await.unwrap();
        assert_eq!(stream.byte_len().await, Some(10));
    }

    #[tokio::test]
    async fn output_buffer_accumulates() {
        let mut out = OutputStream::buffer();
        out.write_all(b"abc").await.unwrap();
        out.write_all(b"def").await.unwrap();
        assert_eq!(out.as_slice(), b"abcdef");
        assert_eq!(out.into_vec(), b"abcdef");
    }

    #[tokio::test]
    async fn output_file_is_created_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("download");

        let out = OutputStream::create(&path).await.unwrap();
        drop(out);
        assert_eq!(fs::read(&path).unwrap(), b"");
    }
}
