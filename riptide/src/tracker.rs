use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use crate::ID;

pub type Result<T> = std::result::Result<T, TrackerError>;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("tracker does not support scrape")]
    ScrapeUnsupported,

    #[error("response error: {0}")]
    ResponseError(String),
}

// Session-side inputs to an announce, computed fresh at each attempt.
pub struct AnnounceCtx {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub num_want: usize,
    pub port: u16,
}

pub enum Outcome {

    // A well-formed response; the addresses go to the peer table.
    Peers(Vec<SocketAddr>),

    // HTTP-level failure or a "failure reason" from the tracker.
    Failure(String),
}

type ResponseFut = Pin<Box<dyn Future<Output = reqwest::Result<reqwest::Response>> + Send>>;
type BodyFut = Pin<Box<dyn Future<Output = reqwest::Result<bytes::Bytes>> + Send>>;

enum State {
    Idle,
    Connecting(ResponseFut),
    Receiving(BodyFut),
}

// Single-connection HTTP announce client, advanced one step per session
// tick. The request and body futures are polled with a no-op waker; the
// tick cadence is the wakeup.
pub struct Tracker {

    client: reqwest::Client,

    announce: Url,

    info_hash: ID,

    peer_id: ID,

    // Pending event flags; at most one event rides on each announce.
    started: bool,
    completed: bool,
    stopped: bool,

    // The completed event only ever goes out once.
    completed_sent: bool,

    state: State,

    interval: Duration,

    // Schedule anchor: when the last announce was started.
    date: Instant,

}

impl Tracker {

    pub fn new(announce: Url, info_hash: ID, peer_id: ID) -> Self {
        Self {
            client: reqwest::Client::new(),
            announce,
            info_hash,
            peer_id,
            started: true,
            completed: false,
            stopped: false,
            completed_sent: false,
            state: State::Idle,
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            // Backdated so the creation-time started event goes out at once.
            date: Instant::now()
                .checked_sub(DEFAULT_ANNOUNCE_INTERVAL)
                .unwrap_or_else(Instant::now),
        }
    }

    // The session went from downloading to seeding.
    pub fn downloads_completed(&mut self) {
        if !self.completed_sent {
            self.completed = true;
            self.completed_sent = true;
        }
    }

    // Shutdown begins; the session keeps ticking us briefly so the stopped
    // event can get out.
    pub fn stopping(&mut self) {
        self.stopped = true;
    }

    pub fn stop_pending(&self) -> bool {
        self.stopped
    }

    // One state-machine step. Returns an outcome when an announce finished,
    // one way or the other.
    pub fn tick(&mut self, ctx: &AnnounceCtx) -> Option<Outcome> {

        let now = Instant::now();

        if matches!(self.state, State::Idle) {
            let due = if self.pending_event().is_some() {
                now > self.date + Duration::from_secs(1)
            } else {
                now > self.date + self.interval
            };
            if due {
                self.date = now;
                let url = self.announce_url(ctx);
                tracing::debug!("announce url: {}", url);
                // Bounded at three announce intervals, then abandoned.
                let request = self.client.get(url).timeout(self.interval * 3).send();
                self.state = State::Connecting(Box::pin(request));
            }
            return None;
        }

        match std::mem::replace(&mut self.state, State::Idle) {

            State::Idle => None,

            State::Connecting(mut fut) => match poll_once(fut.as_mut()) {
                Poll::Pending => {
                    self.state = State::Connecting(fut);
                    None
                }
                Poll::Ready(Ok(resp)) => {
                    self.state = State::Receiving(Box::pin(resp.bytes()));
                    None
                }
                Poll::Ready(Err(e)) => {
                    tracing::warn!("announce failed: {}", e);
                    Some(Outcome::Failure(e.to_string()))
                }
            },

            State::Receiving(mut fut) => match poll_once(fut.as_mut()) {
                Poll::Pending => {
                    self.state = State::Receiving(fut);
                    None
                }
                Poll::Ready(Ok(body)) => {
                    // Whatever the answer says, the event rode on it.
                    self.clear_events();
                    Some(self.parse_response(&body))
                }
                Poll::Ready(Err(e)) => {
                    tracing::warn!("announce read failed: {}", e);
                    Some(Outcome::Failure(e.to_string()))
                }
            },
        }
    }

    fn pending_event(&self) -> Option<&'static str> {
        if self.started {
            Some("started")
        } else if self.completed {
            Some("completed")
        } else if self.stopped {
            Some("stopped")
        } else {
            None
        }
    }

    fn clear_events(&mut self) {
        self.started = false;
        self.completed = false;
        self.stopped = false;
    }

    fn announce_url(&self, ctx: &AnnounceCtx) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            self.announce,
            urlencoding::encode_binary(&self.info_hash),
            urlencoding::encode_binary(&self.peer_id),
            ctx.port,
            ctx.uploaded,
            ctx.downloaded,
            ctx.left,
            ctx.num_want,
        );
        if let Some(event) = self.pending_event() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    fn parse_response(&mut self, body: &[u8]) -> Outcome {
        let resp: AnnounceResponse = match serde_bencode::from_bytes(body) {
            Ok(resp) => resp,
            Err(e) => return Outcome::Failure(format!("no dictionary in answer: {}", e)),
        };
        if let Some(reason) = resp.failure_reason {
            return Outcome::Failure(reason);
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        if let Some(interval) = resp.interval {
            self.interval = Duration::from_secs(interval.max(60));
        }
        tracing::info!("tracker returned {} peers", resp.peers.len());
        Outcome::Peers(resp.peers)
    }
}

// One blocking scrape, only used before a session starts. May take up to
// ten seconds connecting and ten more reading.
pub async fn scrape(announce: &Url, info_hash: &ID) -> Result<(u64, u64)> {

    let base = scrape_url(announce).ok_or(TrackerError::ScrapeUnsupported)?;
    let url = format!("{}?info_hash={}", base, urlencoding::encode_binary(info_hash));
    tracing::debug!("scrape url: {}", url);

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(20))
        .build()?;
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(TrackerError::ResponseError(format!("scrape failed: {}", resp.status())));
    }
    let body = resp.bytes().await?;
    let scrape: ScrapeResponse = serde_bencode::from_bytes(&body)?;

    // Our own entry; a lone nameless entry serves as the fallback.
    let entry = scrape.files
        .iter()
        .find(|(hash, _)| hash.as_slice() == &info_hash[..])
        .map(|(_, counts)| counts)
        .or_else(|| scrape.files.values().next())
        .ok_or_else(|| TrackerError::ResponseError("scrape returned no files".into()))?;

    Ok((entry.complete, entry.incomplete))
}

// The scrape URL is the announce URL with the last path segment swapped,
// valid only when that segment starts with "announce".
fn scrape_url(announce: &Url) -> Option<Url> {
    let path = announce.path().to_owned();
    let (prefix, last) = path.rsplit_once('/')?;
    let tail = last.strip_prefix("announce")?;
    let mut url = announce.clone();
    url.set_path(&format!("{}/scrape{}", prefix, tail));
    Some(url)
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = futures::task::noop_waker_ref();
    let mut cx = Context::from_waker(waker);
    fut.poll(&mut cx)
}

#[derive(Deserialize, Debug, Default)]
struct AnnounceResponse {

    // If present no other key matters; a human-readable error message.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Like failure reason, but the response still gets processed.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds the client should wait between regular announces.
    interval: Option<u64>,

    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // Seeder / leecher counts.
    complete: Option<u64>,

    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_deserialize")]
    peers: Vec<SocketAddr>,
}

#[derive(Deserialize, Debug)]
struct ScrapeResponse {
    files: std::collections::BTreeMap<serde_bytes::ByteBuf, ScrapeCounts>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct ScrapeCounts {

    // Seeders.
    #[serde(default)]
    complete: u64,

    // Leechers.
    #[serde(default)]
    incomplete: u64,
}

// Trackers answer with either a list of {ip, port} dictionaries or, in
// compact form, a string of 6-byte records: 4 bytes IPv4, 2 bytes of
// big-endian port. Both are accepted whatever we asked for.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ))
            }

            Ok(peers)
        }

        fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(v.as_bytes())
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<Ipv4Addr>() {
                    Ok(ip) => peers.push(SocketAddr::new(IpAddr::V4(ip), peer.port)),
                    // Hostnames and IPv6 are not our problem.
                    Err(_) => continue,
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker(announce: &str) -> Tracker {
        Tracker::new(
            Url::parse(announce).unwrap(),
            [0xaa; 20],
            *b"tr-abcdefghijklmnopq",
        )
    }

    fn ctx() -> AnnounceCtx {
        AnnounceCtx { uploaded: 1, downloaded: 2, left: 3, num_want: 50, port: 9090 }
    }

    #[test]
    fn test_parse_response_binary() {
        let raw = hex_literal::hex!("64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565");
        let response: AnnounceResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_dictionary_model() {
        let body = b"d8:intervali1800e5:peersld2:ip7:1.2.3.44:porti6881eed2:ip8:nonsense4:porti1eeee";
        let response: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(response.peers, vec!["1.2.3.4:6881".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason() {
        let mut tracker = test_tracker("http://t.example/announce");
        match tracker.parse_response(b"d14:failure reason6:deniede") {
            Outcome::Failure(reason) => assert_eq!(reason, "denied"),
            Outcome::Peers(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_response_interval_adopted() {
        let mut tracker = test_tracker("http://t.example/announce");
        tracker.parse_response(b"d8:intervali900e5:peers0:e");
        assert_eq!(tracker.interval, Duration::from_secs(900));
        // Silly intervals are clamped.
        tracker.parse_response(b"d8:intervali1e5:peers0:e");
        assert_eq!(tracker.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_announce_url_fields() {
        let tracker = test_tracker("http://t.example:6969/announce");
        let url = tracker.announce_url(&ctx());
        assert!(url.starts_with("http://t.example:6969/announce?info_hash=%AA"));
        assert!(url.contains("&peer_id=tr-abcdefghijklmnopq"));
        assert!(url.contains("&port=9090"));
        assert!(url.contains("&uploaded=1&downloaded=2&left=3"));
        assert!(url.contains("&compact=1&numwant=50"));
        // A new tracker owes the started event.
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_one_event_at_a_time() {
        let mut tracker = test_tracker("http://t.example/announce");
        tracker.downloads_completed();
        tracker.stopping();
        // started wins, then completed, then stopped.
        assert_eq!(tracker.pending_event(), Some("started"));
        tracker.started = false;
        assert_eq!(tracker.pending_event(), Some("completed"));
        tracker.completed = false;
        assert_eq!(tracker.pending_event(), Some("stopped"));
        tracker.clear_events();
        assert_eq!(tracker.pending_event(), None);
        assert!(!tracker.stop_pending());
    }

    #[test]
    fn test_scrape_url_derivation() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(
            scrape_url(&url("http://t.example/announce")).unwrap().as_str(),
            "http://t.example/scrape"
        );
        assert_eq!(
            scrape_url(&url("http://t.example:8000/tr/announce.php")).unwrap().as_str(),
            "http://t.example:8000/tr/scrape.php"
        );
        assert!(scrape_url(&url("http://t.example/ann")).is_none());
    }

    #[tokio::test]
    async fn test_announce_loop_against_canned_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut req = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
                if req.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            // One compact peer: 1.2.3.4:6881.
            let body = b"d8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e";
            let mut resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            resp.extend_from_slice(body);
            stream.write_all(&resp).await.unwrap();
            stream.shutdown().await.ok();
            tx.send(String::from_utf8_lossy(&req).into_owned()).unwrap();
        });

        let mut tracker = test_tracker(&format!("http://{}/announce", addr));
        let ctx = ctx();

        let mut outcome = None;
        for _ in 0..500 {
            if let Some(o) = tracker.tick(&ctx) {
                outcome = Some(o);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match outcome.expect("announce never completed") {
            Outcome::Peers(peers) => assert_eq!(peers, vec!["1.2.3.4:6881".parse().unwrap()]),
            Outcome::Failure(e) => panic!("announce failed: {}", e),
        }

        let req = rx.await.unwrap();
        assert!(req.contains("info_hash=%AA%AA"));
        assert!(req.contains("event=started"));
        assert!(req.contains("numwant=50"));
        // The event rode out with the response.
        assert_eq!(tracker.pending_event(), None);
        assert!(matches!(tracker.state, State::Idle));
    }
}
