use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

pub type SharedUpload = Arc<Mutex<Upload>>;

// Process-wide upload allowance shared by every torrent: a token bucket
// refilled once a second to `limit` KB. A negative limit means unlimited.
#[derive(Debug)]
pub struct Upload {

    // KB per second, < 0 for unlimited.
    limit: i64,

    // Bytes still allowed this second. May go negative on a large write.
    tokens: i64,

    // Currently unchoked peers across all torrents.
    unchoked: usize,

    last_refill: Instant,

}

impl Upload {

    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            tokens: limit.max(0) * 1024,
            unchoked: 0,
            last_refill: Instant::now(),
        }
    }

    pub fn shared(limit: i64) -> SharedUpload {
        Arc::new(Mutex::new(Self::new(limit)))
    }

    pub fn locked(shared: &SharedUpload) -> MutexGuard<'_, Upload> {
        shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_limit(&mut self, limit: i64) {
        self.limit = limit;
    }

    pub fn refill(&mut self, now: Instant) {
        if now.duration_since(self.last_refill) >= Duration::from_secs(1) {
            self.tokens = self.limit.max(0) * 1024;
            self.last_refill = now;
        }
    }

    pub fn can_upload(&self) -> bool {
        self.limit < 0 || self.tokens > 0
    }

    pub fn uploaded(&mut self, bytes: usize) {
        if self.limit >= 0 {
            self.tokens -= bytes as i64;
        }
    }

    // Room for another unchoked peer, roughly one slot per KB/s allowed.
    pub fn can_unchoke(&self) -> bool {
        self.limit < 0 || (self.unchoked as i64) < self.limit
    }

    pub fn unchoked(&mut self) {
        self.unchoked += 1;
    }

    pub fn choked(&mut self) {
        self.unchoked = self.unchoked.saturating_sub(1);
    }
}
