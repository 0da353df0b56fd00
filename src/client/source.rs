//! Random-access byte sources the orchestrator reads parts from.

use crate::errors::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

#[async_trait]
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes>;
}

fn range_error(offset: u64, len: u64, total: u64) -> UploadError {
    UploadError::Validation(format!(
        "range {offset}+{len} is outside a {total} byte source"
    ))
}

#[async_trait]
impl ByteSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes> {
        let total = ByteSource::len(self);
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= total)
            .ok_or_else(|| range_error(offset, len, total))?;
        Ok(self.slice(offset as usize..end as usize))
    }
}

/// Local read failures are reported as invalid input, not as transfer
/// failures, so they never trigger a strategy fallback.
fn read_error(path: &Path, err: io::Error) -> UploadError {
    UploadError::Validation(format!("could not read {}: {err}", path.display()))
}

/// A file on disk, reopened for every range so parts are read one at a time
/// instead of holding the whole file in memory.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl Into<PathBuf>) -> UploadResult<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path)
            .await
            .map_err(|err| read_error(&path, err))?
            .len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, len: u64) -> UploadResult<Bytes> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(range_error(offset, len, self.len));
        }
        let size = usize::try_from(len).map_err(|_| range_error(offset, len, self.len))?;
        let mut file = File::open(&self.path)
            .await
            .map_err(|err| read_error(&self.path, err))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| read_error(&self.path, err))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)
            .await
            .map_err(|err| read_error(&self.path, err))?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn bytes_source_slices_ranges() {
        let source = Bytes::from_static(b"0123456789");
        assert_eq!(ByteSource::len(&source), 10);
        let part = source.read_range(3, 4).await.unwrap();
        assert_eq!(&part[..], b"3456");
        assert!(source.read_range(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_the_requested_window() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abcdefghij").unwrap();
        tmp.flush().unwrap();

        let source = FileSource::open(tmp.path()).await.unwrap();
        assert_eq!(source.len(), 10);
        assert_eq!(&source.read_range(6, 4).await.unwrap()[..], b"ghij");
        assert!(source.read_range(6, 5).await.is_err());
    }

    #[tokio::test]
    async fn file_shrunk_after_open_is_a_local_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abcdefghij").unwrap();
        tmp.flush().unwrap();
        let source = FileSource::open(tmp.path()).await.unwrap();
        tmp.as_file().set_len(2).unwrap();

        let err = source.read_range(0, 10).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Validation);
        assert!(err.to_string().contains(&source.path().display().to_string()));
    }
}
