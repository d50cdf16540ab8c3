use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use futures::FutureExt;
use tokio::net::TcpListener;
use tracing::Instrument;
use url::Url;
use crate::{
    block::BlockTable,
    metainfo::MetaInfo,
    p2p::{Peer, PeerError},
    stats::TorrentStat,
    storage::{resume, Storage, WriteOutcome},
    store::StoreInfo,
    tracker::{AnnounceCtx, Outcome, Tracker},
    upload::{SharedUpload, Upload},
    Bitfield, ID,
};

// Peer table size; also the numwant baseline.
pub const MAX_PEERS: usize = 60;

const TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {

    // Not running.
    Pause,

    // Start-up check of data already on disk.
    Check,

    Download,

    Seed,

    // The last announce failed; transfers continue regardless.
    TrackerError,
}

// State the peers, the storage and the tracker all work against. Lives
// under the one session mutex together with everything else in Inner.
pub(crate) struct Shared {

    pub info: StoreInfo,

    pub info_hash: ID,

    pub client_id: ID,

    pub blocks: BlockTable,

    // Verified pieces.
    pub bitfield: Bitfield,

    // Present while the session runs.
    pub storage: Option<Storage>,

    pub upload: SharedUpload,

    // Rolling cumulative byte counters; slot 9 is live, the rest shift
    // once a second.
    pub downloaded: [u64; 10],
    pub uploaded: [u64; 10],

    // Pieces verified during the current pass, flushed into have
    // broadcasts right after it.
    pub verified: Vec<usize>,

}

impl Shared {

    // Store a received block; a completed piece is verified on the spot and
    // queued for broadcast. Disk trouble frees the piece for re-request.
    pub fn write_block(&mut self, piece: usize, offset: usize, data: &[u8]) {
        let Some(storage) = self.storage.as_mut() else { return };
        match storage.write(piece, offset, data, &mut self.blocks, &mut self.bitfield) {
            Ok(WriteOutcome::Verified) => self.verified.push(piece),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("write failed for piece {}: {}", piece, e);
                self.blocks.reset_piece(self.info.piece_blocks(piece));
            }
        }
    }

    // Bytes still to download, as reported to the tracker.
    fn left(&self) -> u64 {
        let missing = (self.blocks.len() - self.blocks.have_count()) as u64;
        (missing * self.info.block_len as u64).min(self.info.total_len)
    }
}

struct Inner {

    shared: Shared,

    peers: Vec<Peer>,

    listener: Option<TcpListener>,

    tracker: Option<Tracker>,

    status: Status,

    error: Option<String>,

    destination: PathBuf,

    bind_port: u16,

    // Rolling tick timestamps, ms since epoch; slot 9 is live.
    dates: [u64; 10],

    epoch: Instant,

}

impl Inner {

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // One ~20 ms slice of work: a pass over every peer, per-second
    // bookkeeping when a second boundary passed, then one tracker step.
    fn tick(&mut self) {

        Upload::locked(&self.shared.upload).refill(Instant::now());

        if matches!(self.status, Status::Download | Status::TrackerError)
            && self.shared.blocks.have_count() == self.shared.blocks.len()
        {
            tracing::info!("download complete, seeding");
            self.status = Status::Seed;
            if let Some(tracker) = &mut self.tracker {
                tracker.downloads_completed();
            }
        }

        self.dates[9] = self.elapsed_ms();

        let mut i = 0;
        while i < self.peers.len() {
            if let Err(e) = self.peers[i].pulse(&mut self.shared) {
                tracing::debug!("dropping peer {}: {}", self.peers[i].addr, e);
                self.remove_peer(i);
                continue;
            }
            // A finished handshake may reveal someone already connected.
            if self.peers[i].is_connected() && self.is_duplicate_id(i) {
                tracing::debug!("dropping peer {}: {}", self.peers[i].addr, PeerError::DuplicateId);
                self.remove_peer(i);
                continue;
            }
            // Peers with nothing we want make room when the table is
            // nearly full.
            if self.peers.len() > MAX_PEERS - 5
                && self.peers[i].is_connected()
                && !self.peers[i].am_interested
            {
                tracing::debug!("dropping surplus peer {}", self.peers[i].addr);
                self.remove_peer(i);
                continue;
            }
            i += 1;
        }

        // Tell everyone about freshly verified pieces.
        let verified: Vec<usize> = self.shared.verified.drain(..).collect();
        for piece in verified {
            let mut i = 0;
            while i < self.peers.len() {
                if self.peers[i].is_connected() && self.peers[i].queue_have(piece).is_err() {
                    self.remove_peer(i);
                    continue;
                }
                i += 1;
            }
        }

        if self.dates[9] > self.dates[8] + 1000 {
            self.dates.copy_within(1.., 0);
            self.shared.downloaded.copy_within(1.., 0);
            self.shared.uploaded.copy_within(1.., 0);

            let mut i = 0;
            while i < self.peers.len() {
                match self.peers[i].health_check(&mut self.shared) {
                    Ok(()) => i += 1,
                    Err(e) => {
                        tracing::debug!("dropping peer {}: {}", self.peers[i].addr, e);
                        self.remove_peer(i);
                    }
                }
            }

            self.accept_inbound();

            // Rotate by one so the tail of the list isn't starved.
            if self.peers.len() > 1 {
                let peer = self.peers.remove(0);
                self.peers.push(peer);
            }
        }

        self.tracker_step();
    }

    fn accept_inbound(&mut self) {
        let Some(listener) = &self.listener else { return };
        while self.peers.len() < MAX_PEERS {
            match listener.accept().now_or_never() {
                Some(Ok((stream, addr))) => {
                    tracing::info!("inbound peer {}", addr);
                    self.peers.push(Peer::inbound(stream, addr, self.shared.info.num_pieces));
                }
                Some(Err(e)) => {
                    tracing::warn!("inbound connection error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    fn tracker_step(&mut self) {
        let Some(tracker) = &mut self.tracker else { return };
        let ctx = AnnounceCtx {
            uploaded: self.shared.uploaded[9],
            downloaded: self.shared.downloaded[9],
            left: self.shared.left(),
            num_want: MAX_PEERS.saturating_sub(self.peers.len()),
            port: self.bind_port,
        };
        match tracker.tick(&ctx) {
            Some(Outcome::Peers(addrs)) => {
                if self.status == Status::TrackerError {
                    self.status = if self.shared.blocks.have_count() == self.shared.blocks.len() {
                        Status::Seed
                    } else {
                        Status::Download
                    };
                }
                self.error = None;
                for addr in addrs {
                    self.try_add(addr);
                }
            }
            Some(Outcome::Failure(msg)) => {
                tracing::warn!("tracker error: {}", msg);
                self.status = Status::TrackerError;
                self.error = Some(msg);
            }
            None => {}
        }
    }

    // Offer an address from the tracker. Duplicates and overflow beyond the
    // peer table are silently ignored.
    fn try_add(&mut self, addr: SocketAddr) {
        if self.peers.iter().any(|p| p.addr == addr) {
            return;
        }
        if self.peers.len() >= MAX_PEERS {
            return;
        }
        tracing::debug!("new peer {}", addr);
        self.peers.push(Peer::outbound(addr, self.shared.info.num_pieces));
    }

    fn remove_peer(&mut self, i: usize) {
        self.peers[i].disconnect(&mut self.shared);
        self.peers.remove(i);
    }

    fn is_duplicate_id(&self, i: usize) -> bool {
        let Some(id) = self.peers[i].id else { return false };
        self.peers
            .iter()
            .enumerate()
            .any(|(j, p)| j != i && p.is_connected() && p.id == Some(id))
    }

    fn rate(&self, counters: &[u64; 10]) -> f32 {
        if self.dates[8] == self.dates[0] {
            return 0.0;
        }
        1000.0 / 1024.0 * (counters[8] - counters[0]) as f32
            / (self.dates[8] - self.dates[0]) as f32
    }

    fn stat(&self) -> TorrentStat {

        let num_blocks = self.shared.blocks.len();
        let have = self.shared.blocks.have_count();
        let rate_download = self.rate(&self.shared.downloaded);
        let rate_upload = self.rate(&self.shared.uploaded);

        let eta = if rate_download < 0.1 {
            -1
        } else {
            let remaining = (num_blocks - have) as f32 * self.shared.info.block_len as f32;
            let eta = (remaining / rate_download / 1024.0) as i64;
            if eta > 99 * 3600 + 59 * 60 + 59 { -1 } else { eta }
        };

        let mut peers_total = 0;
        let mut peers_uploading = 0;
        let mut peers_downloading = 0;
        for peer in &self.peers {
            if peer.is_connected() {
                peers_total += 1;
                if peer.is_uploading_to_us() {
                    peers_uploading += 1;
                }
                if peer.is_downloading_from_us() {
                    peers_downloading += 1;
                }
            }
        }

        // Availability squeezed into 120 buckets.
        let num_pieces = self.shared.info.num_pieces;
        let mut pieces = vec![0i8; 120];
        for (i, bucket) in pieces.iter_mut().enumerate() {
            let piece = i * num_pieces / 120;
            if self.shared.bitfield[piece] {
                *bucket = -1;
                continue;
            }
            for peer in &self.peers {
                if let Some(bf) = &peer.bitfield {
                    if bf[piece] {
                        *bucket += 1;
                    }
                }
            }
        }

        TorrentStat {
            status: self.status,
            error: self.error.clone(),
            progress: have as f32 / num_blocks as f32,
            rate_download,
            rate_upload,
            eta,
            peers_total,
            peers_uploading,
            peers_downloading,
            pieces,
            downloaded: self.shared.downloaded[9],
            uploaded: self.shared.uploaded[9],
        }
    }
}

// One torrent session: the locked inner state plus its worker task.
pub(crate) struct Torrent {

    pub metainfo: MetaInfo,

    inner: Arc<Mutex<Inner>>,

    stop: Arc<AtomicBool>,

    worker: Option<tokio::task::JoinHandle<()>>,

}

impl Torrent {

    pub fn new(metainfo: MetaInfo, upload: SharedUpload, client_id: ID) -> Self {
        let destination = PathBuf::from(".");
        let info = StoreInfo::new(&metainfo, destination.clone());
        let inner = Inner {
            shared: Shared {
                blocks: BlockTable::new(info.num_blocks),
                bitfield: Bitfield::repeat(false, info.num_pieces),
                info_hash: metainfo.info_hash(),
                client_id,
                info,
                storage: None,
                upload,
                downloaded: [0; 10],
                uploaded: [0; 10],
                verified: Vec::new(),
            },
            peers: Vec::new(),
            listener: None,
            tracker: None,
            status: Status::Pause,
            error: None,
            destination,
            bind_port: 0,
            dates: [0; 10],
            epoch: Instant::now(),
        };
        Self {
            metainfo,
            inner: Arc::new(Mutex::new(inner)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn folder(&self) -> PathBuf {
        self.lock().destination.clone()
    }

    pub fn set_folder(&self, path: PathBuf) {
        let mut inner = self.lock();
        inner.shared.info = StoreInfo::new(&self.metainfo, path.clone());
        inner.destination = path;
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stat(&self) -> TorrentStat {
        self.lock().stat()
    }

    pub fn rates(&self) -> (f32, f32) {
        let inner = self.lock();
        (inner.rate(&inner.shared.downloaded), inner.rate(&inner.shared.uploaded))
    }

    // Launches the worker; returns immediately.
    pub fn start(&mut self, bind_port: u16) {
        if self.worker.is_some() {
            tracing::warn!("torrent already started");
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        {
            let mut inner = self.lock();
            inner.status = Status::Check;
            inner.bind_port = bind_port;
            inner.epoch = Instant::now();
            inner.dates = [0; 10];
        }

        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.stop);
        let announce = self.metainfo.announce.clone();
        let hashes = self.metainfo.piece_hashes();
        let resume_path = resume::default_path(&self.metainfo.info_hash());
        let span = tracing::info_span!("torrent", name = %self.metainfo.name());
        self.worker = Some(tokio::spawn(
            run(inner, stop, announce, hashes, resume_path).instrument(span),
        ));
    }

    // Flags the worker down and waits for it to finish its shutdown
    // sequence (stopped announce, peer teardown, fast-resume write).
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = worker.await {
            tracing::error!("session worker panicked: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_inner(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

// The session worker: open storage, bind, then tick until told to stop.
async fn run(
    inner: Arc<Mutex<Inner>>,
    stop: Arc<AtomicBool>,
    announce: Url,
    hashes: Vec<ID>,
    resume_path: Option<PathBuf>,
) {

    {
        let mut guard = lock_inner(&inner);
        let guard = &mut *guard;
        let shared = &mut guard.shared;
        match Storage::open(
            shared.info.clone(),
            hashes,
            resume_path,
            &mut shared.blocks,
            &mut shared.bitfield,
        ) {
            Ok(storage) => shared.storage = Some(storage),
            Err(e) => {
                tracing::error!("could not open storage: {}", e);
                guard.error = Some(e.to_string());
                guard.status = Status::Pause;
                return;
            }
        }
        guard.status = Status::Download;
    }

    // No listener just means no inbound peers.
    let bind_port = lock_inner(&inner).bind_port;
    let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, bind_port)).await {
        Ok(listener) => {
            tracing::info!("listening on port {}", bind_port);
            Some(listener)
        }
        Err(e) => {
            tracing::warn!("could not bind port {}: {}", bind_port, e);
            None
        }
    };
    {
        let mut guard = lock_inner(&inner);
        guard.listener = listener;
        let (info_hash, client_id) = (guard.shared.info_hash, guard.shared.client_id);
        guard.tracker = Some(Tracker::new(announce, info_hash, client_id));
    }

    while !stop.load(Ordering::SeqCst) {
        let start = tokio::time::Instant::now();
        lock_inner(&inner).tick();
        tokio::time::sleep_until(start + TICK).await;
    }

    shutdown(&inner).await;
}

async fn shutdown(inner: &Arc<Mutex<Inner>>) {
    tracing::info!("session stopping");

    {
        let mut guard = lock_inner(inner);
        if let Some(tracker) = &mut guard.tracker {
            tracker.stopping();
        }
    }

    // Try to tell the tracker for three seconds, then give up.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        {
            let mut guard = lock_inner(inner);
            let pending = guard.tracker.as_ref().map(|t| t.stop_pending()).unwrap_or(false);
            if !pending || Instant::now() > deadline {
                break;
            }
            guard.tracker_step();
        }
        tokio::time::sleep(TICK).await;
    }

    let mut guard = lock_inner(inner);
    let guard = &mut *guard;
    guard.tracker = None;
    guard.listener = None;
    while !guard.peers.is_empty() {
        guard.remove_peer(0);
    }
    if let Some(storage) = guard.shared.storage.take() {
        if let Err(e) = storage.close(&guard.shared.blocks) {
            tracing::warn!("error closing storage: {}", e);
        }
    }
    guard.shared.downloaded = [0; 10];
    guard.shared.uploaded = [0; 10];
    guard.status = Status::Pause;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileInfo;

    fn test_inner() -> Inner {
        let info = StoreInfo {
            total_len: 4 * 16_384,
            piece_len: 16_384,
            last_piece_len: 16_384,
            num_pieces: 4,
            block_len: 16_384,
            num_blocks: 4,
            files: vec![FileInfo { path: "x".into(), length: 4 * 16_384, offset: 0 }],
            output_dir: "out".into(),
        };
        Inner {
            shared: Shared {
                blocks: BlockTable::new(info.num_blocks),
                bitfield: Bitfield::repeat(false, info.num_pieces),
                info,
                info_hash: [0x11; 20],
                client_id: [0x22; 20],
                storage: None,
                upload: Upload::shared(-1),
                downloaded: [0; 10],
                uploaded: [0; 10],
                verified: Vec::new(),
            },
            peers: Vec::new(),
            listener: None,
            tracker: None,
            status: Status::Download,
            error: None,
            destination: ".".into(),
            bind_port: 9090,
            dates: [0; 10],
            epoch: Instant::now(),
        }
    }

    #[test]
    fn test_rate_over_window() {
        let mut inner = test_inner();
        inner.dates = [0, 1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 8500];
        inner.shared.downloaded[8] = 8 * 1024 * 1024;
        inner.shared.downloaded[9] = 9 * 1024 * 1024;
        // 8 MiB over 8 seconds is 1024 KB/s.
        assert_eq!(inner.rate(&inner.shared.downloaded), 1024.0);
        // An empty window reads zero.
        inner.dates = [0; 10];
        assert_eq!(inner.rate(&inner.shared.downloaded), 0.0);
    }

    #[test]
    fn test_left_counts_missing_blocks() {
        let mut inner = test_inner();
        assert_eq!(inner.shared.left(), 4 * 16_384);
        inner.shared.blocks.mark_have(0);
        assert_eq!(inner.shared.left(), 3 * 16_384);
    }

    #[test]
    fn test_completion_flips_to_seed() {
        let mut inner = test_inner();
        for b in 0..4 {
            inner.shared.blocks.mark_have(b);
        }
        inner.tick();
        assert_eq!(inner.status, Status::Seed);
    }

    #[test]
    fn test_try_add_dedup_and_cap() {
        let mut inner = test_inner();
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        inner.try_add(addr);
        inner.try_add(addr);
        assert_eq!(inner.peers.len(), 1);

        for i in 0..MAX_PEERS {
            inner.try_add(format!("10.0.1.{}:6881", i).parse().unwrap());
        }
        // Overflow past the table size is silently ignored.
        assert_eq!(inner.peers.len(), MAX_PEERS);
    }

    #[tokio::test]
    async fn test_tracker_failure_surfaces_in_status() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = b"d14:failure reason6:deniede";
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(resp.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
            stream.shutdown().await.ok();
        });

        let mut inner = test_inner();
        let announce = Url::parse(&format!("http://{}/announce", addr)).unwrap();
        inner.tracker = Some(Tracker::new(announce, inner.shared.info_hash, inner.shared.client_id));

        for _ in 0..500 {
            inner.tick();
            if inner.status == Status::TrackerError {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(inner.status, Status::TrackerError);
        assert_eq!(inner.error.as_deref(), Some("denied"));
    }

    #[test]
    fn test_stat_histogram() {
        let mut inner = test_inner();
        inner.shared.bitfield.set(0, true);
        inner.shared.blocks.mark_have(0);
        let mut peer = Peer::outbound("10.0.0.2:6881".parse().unwrap(), 4);
        let mut bf = Bitfield::repeat(false, 4);
        bf.set(3, true);
        peer.bitfield = Some(bf);
        inner.peers.push(peer);

        let stat = inner.stat();
        assert_eq!(stat.pieces.len(), 120);
        // Buckets 0..30 cover piece 0, which we hold.
        assert_eq!(stat.pieces[0], -1);
        assert_eq!(stat.pieces[29], -1);
        // Piece 3 is held by one peer.
        assert_eq!(stat.pieces[119], 1);
        // Piece 1 by nobody.
        assert_eq!(stat.pieces[30], 0);
        assert_eq!(stat.progress, 0.25); // hmm blocks have none yet
    }
}
