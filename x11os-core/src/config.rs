//! Tuning knobs for the connection core.

use serde::Deserialize;
use std::time::Duration;

/// Default capacity of a fresh input or output buffer.
pub const BUFSIZE: usize = 16384;
/// Buffers that grew beyond this are freed instead of recycled.
pub const BUFWATERMARK: usize = 32768;
/// Largest request the big-request extension accepts, in words.
pub const MAX_BIG_REQUEST_WORDS: u32 = (4 << 20) - 1;
/// Default limit on output queued for a single client.
pub const MAX_OUTPUT_BYTES: usize = 64 << 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OsConfig {
    /// Client slots, not counting the server's own slot.
    pub max_clients: usize,
    /// Requests declaring more words than this are discarded with BadLength.
    pub max_request_words: u32,
    pub buffer_size: usize,
    pub buffer_watermark: usize,
    /// Output queued for one client beyond this closes the client.
    pub max_output_bytes: usize,
    /// Upper bound on idle buffers kept in each free list.
    pub free_buffers: usize,
    /// Connections that have not finished setup after this are closed.
    pub accept_timeout_ms: u64,
    /// How long one client may hold the dispatcher before yielding.
    pub schedule_slice_ms: u64,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            max_clients: 256,
            max_request_words: MAX_BIG_REQUEST_WORDS,
            buffer_size: BUFSIZE,
            buffer_watermark: BUFWATERMARK,
            max_output_bytes: MAX_OUTPUT_BYTES,
            free_buffers: 16,
            accept_timeout_ms: 60_000,
            schedule_slice_ms: 20,
        }
    }
}

impl OsConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn schedule_slice(&self) -> Duration {
        Duration::from_millis(self.schedule_slice_ms)
    }

    /// Largest acceptable request in bytes.
    pub fn max_request_bytes(&self) -> u64 {
        u64::from(self.max_request_words) << 2
    }
}
