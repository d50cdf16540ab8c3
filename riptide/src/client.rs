use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use rand::Rng;
use crate::{
    metainfo::{MetaInfo, MetaInfoError},
    stats::TorrentStat,
    torrent::Torrent,
    tracker::{self, TrackerError},
    upload::{SharedUpload, Upload},
    ID,
};

pub const MAX_TORRENTS: usize = 20;

const DEFAULT_BIND_PORT: u16 = 9090;
const DEFAULT_UPLOAD_LIMIT: i64 = 20;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("maximum number of torrents reached")]
    TooManyTorrents,

    #[error("torrent already open")]
    DuplicateTorrent,
}

// Owns the shared upload bucket, the peer identity and the open sessions.
// Everything a session needs arrives through here; there is no process
// global anywhere.
pub struct Client {

    upload: SharedUpload,

    bind_port: u16,

    peer_id: ID,

    // Sessions addressed by index; closing shifts the tail down.
    torrents: Vec<Torrent>,

}

impl Client {

    pub fn new() -> Self {
        let peer_id = generate_peer_id();
        tracing::debug!("peer id: {}", String::from_utf8_lossy(&peer_id));
        Self {
            upload: Upload::shared(DEFAULT_UPLOAD_LIMIT),
            bind_port: DEFAULT_BIND_PORT,
            peer_id,
            torrents: Vec::new(),
        }
    }

    pub fn set_bind_port(&mut self, port: u16) {
        self.bind_port = port;
    }

    pub fn set_upload_limit(&mut self, limit: i64) {
        Upload::locked(&self.upload).set_limit(limit);
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    pub fn peer_id(&self) -> ID {
        self.peer_id
    }

    // Parses the metafile and registers a session for it, paused. Returns
    // the index all the other calls take.
    pub fn torrent_init<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, ClientError> {
        if self.torrents.len() >= MAX_TORRENTS {
            return Err(ClientError::TooManyTorrents);
        }
        let metainfo = MetaInfo::new(path)?;
        if self.torrents.iter().any(|t| t.metainfo.info_hash() == metainfo.info_hash()) {
            return Err(ClientError::DuplicateTorrent);
        }
        tracing::info!("opened torrent {}", metainfo.name());
        self.torrents.push(Torrent::new(metainfo, Arc::clone(&self.upload), self.peer_id));
        Ok(self.torrents.len() - 1)
    }

    pub fn metainfo(&self, t: usize) -> &MetaInfo {
        &self.torrents[t].metainfo
    }

    // Asks the tracker for seeder/leecher counts. May take tens of seconds;
    // meant to run before any session is started.
    pub async fn torrent_scrape(&self, t: usize) -> Result<(u64, u64), TrackerError> {
        let metainfo = &self.torrents[t].metainfo;
        tracker::scrape(&metainfo.announce, &metainfo.info_hash()).await
    }

    pub fn torrent_folder(&self, t: usize) -> PathBuf {
        self.torrents[t].folder()
    }

    pub fn torrent_set_folder(&self, t: usize, path: PathBuf) {
        self.torrents[t].set_folder(path);
    }

    // Launches the session worker; returns immediately.
    pub fn torrent_start(&mut self, t: usize) {
        let port = self.bind_port;
        self.torrents[t].start(port);
    }

    // Stops the session, waiting out its shutdown sequence (which includes
    // a best-effort stopped announce and the fast-resume write).
    pub async fn torrent_stop(&mut self, t: usize) {
        self.torrents[t].stop().await;
    }

    pub fn torrent_stat(&self, t: usize) -> TorrentStat {
        self.torrents[t].stat()
    }

    // Forgets a stopped torrent. Indices above it shift down by one.
    pub fn torrent_close(&mut self, t: usize) {
        debug_assert!(!self.torrents[t].is_running(), "closing a running torrent");
        self.torrents.remove(t);
    }

    // Total download and upload rates across all sessions, in KB/s.
    pub fn rates(&self) -> (f32, f32) {
        self.torrents.iter().fold((0.0, 0.0), |(down, up), t| {
            let (d, u) = t.rates();
            (down + d, up + u)
        })
    }

    pub fn close(self) {
        debug_assert!(
            self.torrents.iter().all(|t| !t.is_running()),
            "closing the client with running torrents"
        );
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

// "tr-" followed by 17 random alphanumerics. Simple, but unique enough.
fn generate_peer_id() -> ID {
    let mut id = *b"tr-00000000000000000";
    let mut rng = rand::thread_rng();
    for c in id.iter_mut().skip(3) {
        let r = rng.gen_range(0..36u8);
        *c = if r < 26 { b'a' + r } else { b'0' + r - 26 };
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;
    use serde_derive::Serialize;

    #[test]
    fn test_peer_id_shape() {
        for _ in 0..50 {
            let id = generate_peer_id();
            assert_eq!(&id[..3], b"tr-");
            assert!(id[3..].iter().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[derive(Serialize)]
    struct RawMeta {
        announce: String,
        info: crate::metainfo::Info,
    }

    fn write_torrent(dir: &std::path::Path, name: &str) -> PathBuf {
        let info = crate::metainfo::Info {
            name: serde_bytes::ByteBuf::from(name.as_bytes().to_vec()),
            pieces: serde_bytes::ByteBuf::from(vec![0u8; 20]),
            piece_length: 16_384,
            md5sum: None,
            length: Some(1000),
            files: None,
            private: None,
            root_hash: None,
        };
        let raw = RawMeta { announce: "http://t.example/announce".into(), info };
        let path = dir.join(format!("{}.torrent", name));
        std::fs::write(&path, serde_bencode::to_bytes(&raw).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_duplicate_torrent_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_torrent(dir.path(), "one");
        let mut client = Client::new();
        let t = client.torrent_init(&path).unwrap();
        assert_eq!(t, 0);
        assert!(matches!(client.torrent_init(&path), Err(ClientError::DuplicateTorrent)));
        assert_eq!(client.torrent_count(), 1);
    }

    #[test]
    fn test_torrent_table_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = Client::new();
        for i in 0..MAX_TORRENTS {
            let path = write_torrent(dir.path(), &format!("t{}", i));
            client.torrent_init(&path).unwrap();
        }
        let over = write_torrent(dir.path(), "straw");
        assert!(matches!(client.torrent_init(&over), Err(ClientError::TooManyTorrents)));
    }

    #[test]
    fn test_fresh_torrent_is_paused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_torrent(dir.path(), "idle");
        let mut client = Client::new();
        let t = client.torrent_init(&path).unwrap();
        let stat = client.torrent_stat(t);
        assert_eq!(stat.status, Status::Pause);
        assert_eq!(stat.progress, 0.0);
        assert_eq!(stat.peers_total, 0);
        client.torrent_close(t);
        assert_eq!(client.torrent_count(), 0);
        client.close();
    }
}
