use std::{
    io,
    path::{Path, PathBuf},
};
use bytes::Buf;
use crate::{block::BlockTable, Bitfield, ID};

// Sidecar file letting a restart skip the hash scan. Layout:
//   u32 version (= 1)
//   u32 per file: mtime at save, low 31 bits
//   ceil(num_blocks / 8) bytes: block-have bitfield
//   u32 per slot: the piece held by that slot (0xFFFF_FFFF = none)
// All integers are little-endian. Any size, version or mtime mismatch
// invalidates the whole file and forces a scan.
pub const VERSION: u32 = 1;

const NO_PIECE: u32 = u32::MAX;

pub struct Resume {
    pub block_have: Bitfield,
    pub slot_piece: Vec<i32>,
}

pub fn default_path(info_hash: &ID) -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home)
        .join(".transmission")
        .join(format!("resume.{}", hex::encode(info_hash))))
}

fn expected_len(num_files: usize, num_blocks: usize, num_pieces: usize) -> usize {
    4 + 4 * num_files + (num_blocks + 7) / 8 + 4 * num_pieces
}

pub fn save(path: &Path, mtimes: &[u32], blocks: &BlockTable, slot_piece: &[i32]) -> io::Result<()> {

    let mut out = Vec::with_capacity(expected_len(mtimes.len(), blocks.len(), slot_piece.len()));
    out.extend_from_slice(&VERSION.to_le_bytes());
    for &m in mtimes {
        out.extend_from_slice(&m.to_le_bytes());
    }

    let mut have = Bitfield::repeat(false, blocks.len());
    for b in 0..blocks.len() {
        if blocks.is_have(b) {
            have.set(b, true);
        }
    }
    out.extend_from_slice(have.as_raw_slice());

    for &piece in slot_piece {
        let v = if piece < 0 { NO_PIECE } else { piece as u32 };
        out.extend_from_slice(&v.to_le_bytes());
    }

    if let Some(dir) = path.parent() {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        builder.create(dir)?;
    }
    std::fs::write(path, &out)
}

pub fn load(path: &Path, mtimes: &[u32], num_blocks: usize, num_pieces: usize) -> io::Result<Resume> {

    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let data = std::fs::read(path)?;
    if data.len() != expected_len(mtimes.len(), num_blocks, num_pieces) {
        return Err(invalid("wrong size for resume file"));
    }

    let mut buf = &data[..];
    if buf.get_u32_le() != VERSION {
        return Err(invalid("unsupported resume file version"));
    }
    for &expect in mtimes {
        if buf.get_u32_le() != expect {
            return Err(invalid("file mtimes don't match"));
        }
    }

    let bf_len = (num_blocks + 7) / 8;
    let mut block_have = Bitfield::from_vec(buf[..bf_len].to_vec());
    block_have.truncate(num_blocks);
    buf.advance(bf_len);

    let mut slot_piece = vec![-1i32; num_pieces];
    let mut seen = vec![false; num_pieces];
    for slot in slot_piece.iter_mut() {
        let v = buf.get_u32_le();
        if v == NO_PIECE {
            continue;
        }
        let piece = v as usize;
        if piece >= num_pieces || seen[piece] {
            return Err(invalid("corrupt slot table"));
        }
        seen[piece] = true;
        *slot = piece as i32;
    }

    Ok(Resume { block_have, slot_piece })
}
