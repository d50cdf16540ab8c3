use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};
use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockInfo},
    picker,
    torrent::Shared,
    upload::Upload,
    Bitfield, BLOCK_SIZE, ID,
};
use super::{
    handshake::{Handshake, HandshakeCodec},
    message::{Message, MessageCodec},
    PeerError, Result,
    HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEP_ALIVE_INTERVAL, MAX_REQUESTS, STARVED_TIMEOUT,
};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {

    // Known address, no socket yet.
    Idle,

    // Socket being established, or our handshake still leaving.
    Connecting,

    // Waiting for the peer's handshake.
    Handshaking,

    Connected,
}

// One remote peer. All I/O is non-blocking and driven from the session
// tick; nothing here ever waits.
pub struct Peer {

    pub addr: SocketAddr,

    pub state: WireState,

    stream: Option<TcpStream>,

    connect: Option<ConnectFuture>,

    // Learned from the handshake.
    pub id: Option<ID>,

    // What the peer holds. Allocated lazily on the first bitfield or have.
    pub bitfield: Option<Bitfield>,

    // Requests we sent, in order; piece messages must answer the head.
    in_requests: Vec<BlockInfo>,

    // Requests the peer sent us, served in order.
    out_requests: Vec<BlockInfo>,

    read_buf: BytesMut,

    write_buf: BytesMut,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    // Any bytes from the peer refresh this.
    last_activity: Instant,

    last_keep_alive: Instant,

    // Last successful socket write.
    last_send: Instant,

    // An unchoked peer that turned out not to be worth the slot.
    out_slow: bool,

    handshake_sent: bool,

    // Set between the handshake and the first frame; only a bitfield is
    // legal there.
    first_frame: bool,

    pub in_total: u64,
    pub out_total: u64,

    codec: MessageCodec,

}

impl Peer {

    fn new(addr: SocketAddr, num_pieces: usize) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: WireState::Idle,
            stream: None,
            connect: None,
            id: None,
            bitfield: None,
            in_requests: Vec::with_capacity(MAX_REQUESTS),
            out_requests: Vec::with_capacity(MAX_REQUESTS),
            read_buf: BytesMut::with_capacity(1024),
            write_buf: BytesMut::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            last_activity: now,
            last_keep_alive: now,
            last_send: now,
            out_slow: false,
            handshake_sent: false,
            first_frame: false,
            in_total: 0,
            out_total: 0,
            codec: MessageCodec::new(num_pieces),
        }
    }

    // A peer we will dial, usually from a tracker response.
    pub fn outbound(addr: SocketAddr, num_pieces: usize) -> Self {
        Self::new(addr, num_pieces)
    }

    // A peer that dialled us on the listening socket.
    pub fn inbound(stream: TcpStream, addr: SocketAddr, num_pieces: usize) -> Self {
        let mut peer = Self::new(addr, num_pieces);
        peer.stream = Some(stream);
        peer.state = WireState::Connecting;
        peer
    }

    pub fn is_connected(&self) -> bool {
        self.state == WireState::Connected
    }

    // Actually getting blocks out of this peer.
    pub fn is_uploading_to_us(&self) -> bool {
        self.am_interested && !self.peer_choking && self.in_total > 0
    }

    // Actually sending blocks to this peer.
    pub fn is_downloading_from_us(&self) -> bool {
        self.peer_interested && !self.am_choking && self.out_total > 0
    }

    // One cooperative step: advance the connection, read and parse whatever
    // arrived, refill the serve pipeline, flush, update interest and top up
    // our own request queue. Any error means the peer gets dropped.
    pub fn pulse(&mut self, shared: &mut Shared) -> Result<()> {

        if self.state == WireState::Idle {
            tracing::trace!("connecting");
            self.connect = Some(Box::pin(TcpStream::connect(self.addr)));
            self.state = WireState::Connecting;
        }

        if self.state == WireState::Connecting && self.stream.is_none() {
            if let Some(connect) = &mut self.connect {
                match poll_once(connect.as_mut()) {
                    Poll::Ready(Ok(stream)) => {
                        self.connect = None;
                        self.stream = Some(stream);
                    }
                    Poll::Ready(Err(e)) => return Err(e.into()),
                    Poll::Pending => {}
                }
            }
        }

        if self.state == WireState::Connecting && self.stream.is_some() {
            if !self.handshake_sent {
                self.send_handshake(shared)?;
            }
            self.flush(shared)?;
            if self.write_buf.is_empty() {
                self.state = WireState::Handshaking;
            }
        }

        if matches!(self.state, WireState::Handshaking | WireState::Connected)
            && self.fill_read_buf()? > 0
        {
            self.parse(shared)?;
        }

        if self.state == WireState::Connected {
            self.serve(shared)?;
        }
        if self.stream.is_some() {
            self.flush(shared)?;
        }

        if self.state == WireState::Connected {
            let interesting = self
                .bitfield
                .as_ref()
                .map(|bf| picker::is_interesting(bf, &shared.bitfield))
                .unwrap_or(false);
            if interesting && !self.am_interested {
                self.am_interested = true;
                self.send(Message::Interested)?;
            } else if !interesting && self.am_interested {
                self.am_interested = false;
                self.send(Message::NotInterested)?;
            }

            if self.am_interested && !self.peer_choking {
                self.top_up(shared)?;
            }
        }

        Ok(())
    }

    // Once-a-second upkeep: timeouts, keep-alive and the choke policy.
    pub fn health_check(&mut self, shared: &mut Shared) -> Result<()> {

        let now = Instant::now();

        // A stuck handshake is forgotten well before the socket times out.
        if matches!(self.state, WireState::Connecting | WireState::Handshaking)
            && now.duration_since(self.last_activity) > HANDSHAKE_TIMEOUT
        {
            return Err(PeerError::Timeout);
        }
        if now.duration_since(self.last_activity) > IDLE_TIMEOUT {
            return Err(PeerError::Timeout);
        }
        // Supposed to be uploading to us, but nothing is arriving.
        if !self.in_requests.is_empty()
            && now.duration_since(self.last_activity) > STARVED_TIMEOUT
        {
            return Err(PeerError::Timeout);
        }

        if self.state == WireState::Connected {

            if now.duration_since(self.last_keep_alive) > KEEP_ALIVE_INTERVAL {
                self.send(Message::KeepAlive)?;
                self.last_keep_alive = now;
            }

            if !self.am_choking && !self.peer_interested {
                // They don't need us.
                self.send(Message::Choke)?;
                self.am_choking = true;
                self.out_requests.clear();
                Upload::locked(&shared.upload).choked();
            }
            if self.am_choking
                && self.peer_interested
                && !self.out_slow
                && Upload::locked(&shared.upload).can_unchoke()
            {
                self.send(Message::Unchoke)?;
                self.am_choking = false;
                Upload::locked(&shared.upload).unchoked();
            }
        }

        Ok(())
    }

    // Bookkeeping before the peer is dropped from the table: its in-flight
    // requests go back to the block table and its unchoke slot is returned.
    pub fn disconnect(&mut self, shared: &mut Shared) {
        for r in self.in_requests.drain(..) {
            shared.blocks.request_dec(shared.info.block_index(r.piece_idx, r.offset));
        }
        if !self.am_choking {
            Upload::locked(&shared.upload).choked();
            self.am_choking = true;
        }
    }

    pub fn queue_have(&mut self, piece: usize) -> Result<()> {
        self.send(Message::Have { idx: piece as u32 })
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        let mut codec = self.codec;
        codec.encode(msg, &mut self.write_buf)
    }

    fn send_handshake(&mut self, shared: &Shared) -> Result<()> {
        tracing::trace!("send: handshake");
        HandshakeCodec.encode(
            Handshake::new(shared.info_hash, shared.client_id),
            &mut self.write_buf,
        )?;
        self.handshake_sent = true;
        Ok(())
    }

    // Drains the socket into the read buffer. Returns how many bytes came in.
    fn fill_read_buf(&mut self) -> Result<usize> {
        let Some(stream) = &self.stream else { return Ok(0) };
        let mut total = 0;
        loop {
            self.read_buf.reserve(1024);
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => {
                    total += n;
                    self.in_total += n as u64;
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn parse(&mut self, shared: &mut Shared) -> Result<()> {

        if self.state == WireState::Handshaking {
            let handshake = match HandshakeCodec.decode(&mut self.read_buf) {
                Ok(Some(handshake)) => handshake,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if let Some(stream) = &self.stream {
                        let _ = stream.try_write(b"Nice try...\r\n");
                    }
                    return Err(e);
                }
            };

            if handshake.info_hash != shared.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }
            if handshake.peer_id == shared.client_id {
                // We are connected to ourselves.
                return Err(PeerError::SelfConnection);
            }
            tracing::debug!("handshake ok: {:?}", handshake);
            self.id = Some(handshake.peer_id);
            self.state = WireState::Connected;
            self.first_frame = true;
            // Introduce ourselves.
            self.send(Message::Bitfield(shared.bitfield.clone()))?;
        }

        if self.state != WireState::Connected {
            return Ok(());
        }

        loop {
            let msg = {
                let mut codec = self.codec;
                codec.decode(&mut self.read_buf)?
            };
            let Some(msg) = msg else { break };
            let first_frame = self.first_frame;
            self.first_frame = false;
            self.handle_msg(shared, msg, first_frame)?;
        }
        Ok(())
    }

    fn handle_msg(&mut self, shared: &mut Shared, msg: Message, first_frame: bool) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.peer_choking {
                    self.peer_choking = true;
                    // Hand the in-flight requests back for other peers.
                    for r in self.in_requests.drain(..) {
                        shared.blocks.request_dec(shared.info.block_index(r.piece_idx, r.offset));
                    }
                }
            },

            Message::Unchoke => self.peer_choking = false,

            Message::Interested => self.peer_interested = true,

            Message::NotInterested => self.peer_interested = false,

            Message::Have { idx } => {
                let idx = idx as usize;
                if idx >= shared.info.num_pieces {
                    tracing::debug!("have with invalid idx {}", idx);
                    return Err(PeerError::InvalidMessage);
                }
                self.bitfield
                    .get_or_insert_with(|| Bitfield::repeat(false, shared.info.num_pieces))
                    .set(idx, true);
            },

            // Only valid directly after the handshake.
            Message::Bitfield(bf) => {
                if !first_frame {
                    return Err(PeerError::UnexpectedBitfield);
                }
                tracing::debug!("peer has {}/{} pieces", bf.count_ones(), shared.info.num_pieces);
                self.bitfield = Some(bf);
            },

            Message::Request(r) => self.handle_request(shared, r)?,

            Message::Block(block) => self.handle_block(shared, block)?,

            Message::Cancel(r) => {
                if let Some(pos) = self.out_requests.iter().position(|have| *have == r) {
                    self.out_requests.remove(pos);
                }
            },
        }

        Ok(())
    }

    fn handle_request(&mut self, shared: &mut Shared, r: BlockInfo) -> Result<()> {
        if self.am_choking {
            // The choke hasn't reached them yet.
            return Ok(());
        }
        if r.piece_idx >= shared.info.num_pieces
            || r.len == 0
            || r.len > BLOCK_SIZE
            || r.offset + r.len > shared.info.piece_len(r.piece_idx)
        {
            tracing::debug!("invalid request: {:?}", r);
            return Err(PeerError::InvalidMessage);
        }
        if !shared.bitfield[r.piece_idx] {
            tracing::debug!("request for piece {} we don't have", r.piece_idx);
            return Ok(());
        }
        if self.out_requests.len() < MAX_REQUESTS {
            self.out_requests.push(r);
        } else {
            tracing::warn!("dropping request, queue full");
        }
        Ok(())
    }

    fn handle_block(&mut self, shared: &mut Shared, block: BlockData) -> Result<()> {

        // Replies must arrive in the order we asked.
        let Some(&head) = self.in_requests.first() else {
            tracing::debug!("piece message with nothing requested");
            return Err(PeerError::InvalidMessage);
        };
        if block.piece_idx != head.piece_idx || block.offset != head.offset {
            tracing::debug!("wrong block, expecting {:?}", head);
            return Err(PeerError::InvalidMessage);
        }
        if block.data.len() != head.len {
            tracing::debug!("wrong size, expecting {} bytes", head.len);
            return Err(PeerError::InvalidMessage);
        }
        self.in_requests.remove(0);

        let idx = shared.info.block_index(head.piece_idx, head.offset);
        if shared.blocks.is_have(idx) {
            // Raced another peer for it, too bad.
            tracing::trace!("duplicate block {:?}", head);
            return Ok(());
        }
        shared.blocks.mark_have(idx);
        shared.downloaded[9] += block.data.len() as u64;
        shared.write_block(head.piece_idx, head.offset, &block.data);
        Ok(())
    }

    // Turn queued requests into piece frames while the write buffer is
    // shallow enough.
    fn serve(&mut self, shared: &mut Shared) -> Result<()> {
        while self.write_buf.len() < shared.info.block_len / 2 && !self.out_requests.is_empty() {
            let r = self.out_requests.remove(0);
            let Some(storage) = shared.storage.as_mut() else { break };
            let mut data = vec![0; r.len];
            if let Err(e) = storage.read(r.piece_idx, r.offset, &mut data) {
                tracing::warn!("read failed for {:?}: {}", r, e);
                continue;
            }
            self.send(Message::Block(BlockData {
                piece_idx: r.piece_idx,
                offset: r.offset,
                data,
            }))?;
        }
        Ok(())
    }

    // Push pending bytes in small slices; backlogs beyond a trickle wait
    // for the shared upload allowance.
    fn flush(&mut self, shared: &mut Shared) -> Result<()> {
        while !self.write_buf.is_empty() {
            if self.write_buf.len() > 100 && !Upload::locked(&shared.upload).can_upload() {
                break;
            }
            let will_send = self.write_buf.len().min(1024);
            let Some(stream) = &self.stream else { break };
            match stream.try_write(&self.write_buf[..will_send]) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => {
                    self.write_buf.advance(n);
                    Upload::locked(&shared.upload).uploaded(n);
                    shared.uploaded[9] += n as u64;
                    self.out_total += n as u64;
                    self.last_send = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // Keep the pipeline at least half full while the peer lets us download.
    fn top_up(&mut self, shared: &mut Shared) -> Result<()> {
        while self.in_requests.len() < MAX_REQUESTS / 2 {
            let block = {
                let Some(bf) = &self.bitfield else { return Ok(()) };
                picker::choose_block(
                    bf,
                    &shared.bitfield,
                    &shared.blocks,
                    &shared.info,
                    &mut rand::thread_rng(),
                )
            };
            let Some(block) = block else { break };
            let info = shared.info.block_info(block);
            shared.blocks.request_inc(block);
            self.in_requests.push(info);
            self.send(Message::Request(info))?;
        }
        Ok(())
    }
}

fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = futures::task::noop_waker_ref();
    let mut cx = Context::from_waker(waker);
    fut.poll(&mut cx)
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("in_requests", &self.in_requests.len())
            .field("out_requests", &self.out_requests.len())
            .field("am_choking", &self.am_choking)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("peer_interested", &self.peer_interested)
            .finish()
    }
}
