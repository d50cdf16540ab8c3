mod metainfo;
mod store;
mod block;
mod storage;
mod picker;
mod p2p;
mod tracker;
mod torrent;
mod upload;
mod client;
mod stats;
mod de;

// Transfer unit, 16 KiB or the piece length if smaller.
const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;
type ID = [u8; 20];

pub use client::{Client, ClientError};
pub use metainfo::{File, Info, MetaInfo, MetaInfoError};
pub use stats::TorrentStat;
pub use store::FileInfo;
pub use torrent::Status;
pub use tracker::TrackerError;
