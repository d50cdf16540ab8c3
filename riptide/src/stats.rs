use crate::torrent::Status;

// Snapshot of a session, assembled under the session lock. The interface
// polls this every second or so.
#[derive(Debug, Clone)]
pub struct TorrentStat {

    pub status: Status,

    // The latest tracker error message, if any.
    pub error: Option<String>,

    // Fraction of blocks held, in [0, 1].
    pub progress: f32,

    // KB/s over the rolling window.
    pub rate_download: f32,
    pub rate_upload: f32,

    // Estimated seconds to completion, -1 when unknown.
    pub eta: i64,

    pub peers_total: usize,

    // Peers currently getting blocks to us.
    pub peers_uploading: usize,

    // Peers we are currently sending blocks to.
    pub peers_downloading: usize,

    // 120 availability buckets: -1 for a piece we hold, else the number of
    // peers that have it.
    pub pieces: Vec<i8>,

    // Cumulative bytes this run.
    pub downloaded: u64,
    pub uploaded: u64,

}
