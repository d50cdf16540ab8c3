use std::{ops::Range, path::PathBuf};
use crate::{block::BlockInfo, metainfo::MetaInfo, BLOCK_SIZE};

// File information derived from metainfo.
#[derive(Debug, Clone)]
pub struct FileInfo {

    // Path relative to the torrent destination.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: usize,

    // Offset in bytes from start of torrent when viewed as a single array.
    pub offset: usize,

}

impl FileInfo {
    // Byte index range within the whole torrent.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }
}

// General torrent geometry: piece, block and file layout.
// Widely shared, cheap to clone.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, <= piece_len.
    pub last_piece_len: usize,

    pub num_pieces: usize,

    // Length of the transfer unit, 16 KiB unless pieces are smaller.
    pub block_len: usize,

    pub num_blocks: usize,

    // Files contained in torrent, in order, with cumulative offsets.
    pub files: Vec<FileInfo>,

    // Directory the torrent writes into.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let block_len = piece_len.min(BLOCK_SIZE);
        let num_blocks = ((total_len + block_len as u64 - 1) / block_len as u64) as usize;
        let files = metainfo.files();
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            block_len,
            num_blocks,
            files,
            output_dir,
        }
    }

    // Returns length of a piece given its index.
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn blocks_per_piece(&self) -> usize {
        self.piece_len / self.block_len
    }

    // Block indices covering a piece.
    pub fn piece_blocks(&self, piece: usize) -> Range<usize> {
        let start = piece * self.blocks_per_piece();
        let end = (start + self.blocks_per_piece()).min(self.num_blocks);
        start..end
    }

    pub fn block_len(&self, block: usize) -> usize {
        if block == self.num_blocks - 1 {
            let tail = (self.total_len % self.block_len as u64) as usize;
            if tail > 0 {
                return tail;
            }
        }
        self.block_len
    }

    // The (piece, offset, length) triple a block index maps onto.
    pub fn block_info(&self, block: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: block / self.blocks_per_piece(),
            offset: (block % self.blocks_per_piece()) * self.block_len,
            len: self.block_len(block),
        }
    }

    pub fn block_index(&self, piece: usize, offset: usize) -> usize {
        piece * self.blocks_per_piece() + offset / self.block_len
    }
}
