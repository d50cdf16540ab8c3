use std::time::Duration;

mod handshake;
mod message;
mod peer;

pub use handshake::{Handshake, HandshakeCodec};
pub use message::{Message, MessageCodec};
pub use peer::{Peer, WireState};

pub type Result<T> = std::result::Result<T, PeerError>;

// In-flight request limit, each direction.
pub const MAX_REQUESTS: usize = 16;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

// A peer stuck in the handshake is forgotten long before the socket would
// time out on its own.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

// No bytes at all, not even a keep-alive.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

// Requests outstanding but nothing arriving.
pub const STARVED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("handshake from ourselves")]
    SelfConnection,

    #[error("peer id already connected")]
    DuplicateId,

    #[error("bitfield sent after introduction")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("connection timeout")]
    Timeout,
}
