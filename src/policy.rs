//! Transfer-size constants shared by the client selector and the server.

use chrono::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Files at or above this size always go through a multipart session.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * MIB;

/// Size of every multipart part except the last.
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * MIB;

/// Request-size ceiling of the relay path.
pub const DEFAULT_PROXY_CEILING: u64 = 6 * MIB;

/// Upload credentials are assumed valid for this long after issuance.
pub const DEFAULT_CREDENTIAL_TTL_SECS: i64 = 24 * 60 * 60;

/// Hash header value that tells the store to skip verification.
pub const HASH_SKIP_SENTINEL: &str = "do_not_verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    pub proxy_ceiling: u64,
    pub credential_ttl_secs: i64,
    /// Whether single-shot uploads send a real SHA-1 instead of the sentinel.
    pub verify_whole_file: bool,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            proxy_ceiling: DEFAULT_PROXY_CEILING,
            credential_ttl_secs: DEFAULT_CREDENTIAL_TTL_SECS,
            verify_whole_file: false,
        }
    }
}

impl UploadPolicy {
    pub fn credential_ttl(&self) -> Duration {
        Duration::seconds(self.credential_ttl_secs)
    }

    /// Number of parts a multipart upload of `size` bytes is split into.
    pub fn part_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size).max(1)
    }

    /// Byte range `(offset, len)` of the 1-based part `index`.
    pub fn part_range(&self, size: u64, index: u64) -> (u64, u64) {
        let offset = (index - 1) * self.chunk_size;
        let len = self.chunk_size.min(size.saturating_sub(offset));
        (offset, len)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk size must be positive".into());
        }
        if self.multipart_threshold == 0 {
            return Err("multipart threshold must be positive".into());
        }
        if self.credential_ttl_secs <= 0 {
            return Err("credential lifetime must be positive".into());
        }
        Ok(())
    }
}
