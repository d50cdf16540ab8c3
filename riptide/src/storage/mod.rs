use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use sha1::{Digest, Sha1};
use crate::{block::BlockTable, store::StoreInfo, Bitfield, ID};

pub mod resume;
#[cfg(test)]
mod tests;

const EMPTY: i32 = -1;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("{0:?} is in the way, remove it")]
    Obstructed(PathBuf),

    #[error("range crosses a piece boundary")]
    CrossPiece,

    #[error("piece {0} has no slot")]
    NoSlot(usize),
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub enum WriteOutcome {

    // More blocks needed before the piece can be checked.
    Incomplete,

    // Piece complete and its hash matches; it is now in the bitfield.
    Verified,

    // Piece complete but corrupt. Its blocks were freed for re-request.
    HashMismatch,

}

// Maps the logical piece space onto a concatenated on-disk region of
// num_pieces piece-sized slots (the final one may be short). Pieces arrive
// in any order; each new piece takes the lowest free slot and a reorder pass
// keeps moving started pieces towards their identity positions.
pub struct Storage {

    info: StoreInfo,

    // One SHA-1 per piece, owned.
    hashes: Vec<ID>,

    // Open handles, parallel to info.files.
    files: Vec<fs::File>,

    // Position of pieces: EMPTY if not started, else the slot holding it.
    piece_slot: Vec<i32>,

    // Piece in each slot: EMPTY for an unused slot.
    slot_piece: Vec<i32>,

    // High-water mark of slots written to disk.
    slots_used: usize,

    resume_path: Option<PathBuf>,

}

impl Storage {

    // Creates missing directories and files, then recovers previous state,
    // preferring the fast-resume file over a full hash scan.
    pub fn open(
        info: StoreInfo,
        hashes: Vec<ID>,
        resume_path: Option<PathBuf>,
        blocks: &mut BlockTable,
        bitfield: &mut Bitfield,
    ) -> Result<Storage> {

        let files = create_files(&info)?;
        let num_pieces = info.num_pieces;
        let mut storage = Storage {
            info,
            hashes,
            files,
            piece_slot: vec![EMPTY; num_pieces],
            slot_piece: vec![EMPTY; num_pieces],
            slots_used: 0,
            resume_path,
        };

        if !storage.try_resume(blocks, bitfield) {
            storage.scan(blocks, bitfield)?;
        }
        Ok(storage)
    }

    // Reads a range that must lie within a single piece.
    pub fn read(&mut self, piece: usize, offset: usize, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() > self.info.piece_len(piece) {
            return Err(StorageError::CrossPiece);
        }
        let slot = match self.piece_slot[piece] {
            EMPTY => return Err(StorageError::NoSlot(piece)),
            s => s as usize,
        };
        self.read_bytes(slot * self.info.piece_len + offset, buf)
    }

    // Writes a range within a single piece, allocating a slot on first
    // contact. Once the block table reports the piece complete, the piece is
    // read back, hashed and either admitted to the bitfield or its blocks
    // are freed for another attempt.
    pub fn write(
        &mut self,
        piece: usize,
        offset: usize,
        data: &[u8],
        blocks: &mut BlockTable,
        bitfield: &mut Bitfield,
    ) -> Result<WriteOutcome> {

        if offset + data.len() > self.info.piece_len(piece) {
            return Err(StorageError::CrossPiece);
        }
        if self.piece_slot[piece] == EMPTY {
            self.assign_slot(piece)?;
            tracing::info!("piece {} starting in slot {}", piece, self.piece_slot[piece]);
        }

        let slot = self.piece_slot[piece] as usize;
        self.write_bytes(slot * self.info.piece_len + offset, data)?;

        if !blocks.complete_in(self.info.piece_blocks(piece)) {
            return Ok(WriteOutcome::Incomplete);
        }

        // All blocks are in, check the hash.
        let len = self.info.piece_len(piece);
        let mut buf = vec![0; len];
        self.read_bytes(slot * self.info.piece_len, &mut buf)?;
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: ID = hasher.finalize().into();

        if hash == self.hashes[piece] {
            tracing::info!("piece {} (slot {}): hash ok", piece, slot);
            bitfield.set(piece, true);
            Ok(WriteOutcome::Verified)
        } else {
            tracing::info!("piece {} (slot {}): hash failed", piece, slot);
            // The whole piece needs reloading. The slot stays claimed.
            blocks.reset_piece(self.info.piece_blocks(piece));
            Ok(WriteOutcome::HashMismatch)
        }
    }

    // Writes the fast-resume file and releases the descriptors.
    pub fn close(mut self, blocks: &BlockTable) -> Result<()> {
        self.trim_tail()?;
        if let Some(path) = self.resume_path.clone() {
            let mtimes = self.file_mtimes()?;
            resume::save(&path, &mtimes, blocks, &self.slot_piece)?;
            tracing::debug!("wrote fast resume file {:?}", path);
        }
        Ok(())
    }

    fn assign_slot(&mut self, piece: usize) -> Result<()> {
        // Lowest free slot below the high-water mark, else extend on disk.
        let slot = match (0..self.slots_used).find(|&s| self.slot_piece[s] == EMPTY) {
            Some(s) => s,
            None => {
                let s = self.slots_used;
                self.slots_used += 1;
                s
            }
        };
        self.piece_slot[piece] = slot as i32;
        self.slot_piece[slot] = piece as i32;
        self.reorder()
    }

    // Repeatedly move started pieces into their identity slots. A piece is
    // only moved into a slot that already exists on disk, and every move
    // strictly grows the set of identity-mapped slots, so this terminates.
    fn reorder(&mut self) -> Result<()> {
        loop {
            let mut moved = false;
            for piece in 0..self.info.num_pieces {
                let from = self.piece_slot[piece];
                if from == EMPTY || from as usize == piece || piece >= self.slots_used {
                    continue;
                }
                let from = from as usize;
                tracing::debug!("moving piece {} from slot {} to slot {}", piece, from, piece);
                if self.slot_piece[piece] == EMPTY {
                    self.move_slot(from, piece)?;
                } else {
                    self.swap_slots(from, piece)?;
                }
                moved = true;
            }
            if !moved {
                return Ok(());
            }
        }
    }

    fn move_slot(&mut self, from: usize, to: usize) -> Result<()> {
        let piece = self.slot_piece[from] as usize;
        let mut buf = vec![0; self.info.piece_len(piece)];
        self.read_slot_padded(from, &mut buf)?;
        self.write_bytes(to * self.info.piece_len, &buf)?;
        self.slot_piece[to] = piece as i32;
        self.slot_piece[from] = EMPTY;
        self.piece_slot[piece] = to as i32;
        Ok(())
    }

    // Slots carry the length of the piece they hold, so a swap involving the
    // short final slot moves exactly the right bytes either way.
    fn swap_slots(&mut self, s1: usize, s2: usize) -> Result<()> {
        let piece1 = self.slot_piece[s1] as usize;
        let piece2 = self.slot_piece[s2] as usize;
        let mut buf1 = vec![0; self.info.piece_len(piece1)];
        let mut buf2 = vec![0; self.info.piece_len(piece2)];
        self.read_slot_padded(s1, &mut buf1)?;
        self.read_slot_padded(s2, &mut buf2)?;
        self.write_bytes(s1 * self.info.piece_len, &buf2)?;
        self.write_bytes(s2 * self.info.piece_len, &buf1)?;
        self.slot_piece[s1] = piece2 as i32;
        self.slot_piece[s2] = piece1 as i32;
        self.piece_slot[piece1] = s2 as i32;
        self.piece_slot[piece2] = s1 as i32;
        Ok(())
    }

    // A slot holding a partial piece at the end of the file may not be fully
    // on disk yet. Whatever is missing reads as filler; those blocks haven't
    // been received and will be written over before the piece is checked.
    fn read_slot_padded(&mut self, slot: usize, buf: &mut [u8]) -> Result<()> {
        match self.read_bytes(slot * self.info.piece_len, buf) {
            Err(StorageError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            other => other,
        }
    }

    // Hash every readable slot and claim whichever piece it turns out to
    // hold. The final readable slot is additionally tried as the short tail
    // piece.
    fn scan(&mut self, blocks: &mut BlockTable, bitfield: &mut Bitfield) -> Result<()> {
        tracing::info!("checking existing pieces");

        self.slots_used = 0;
        let mut buf = vec![0; self.info.piece_len];
        for slot in 0..self.info.num_pieces {

            let len = self.info.piece_len(slot);
            if self.read_bytes(slot * self.info.piece_len, &mut buf[..len]).is_err() {
                // The files don't reach this far yet.
                break;
            }
            self.slots_used = slot + 1;

            let mut hasher = Sha1::new();
            hasher.update(&buf[..len]);
            let hash: ID = hasher.finalize().into();

            let mut claimed = None;
            for piece in 0..self.info.num_pieces - 1 {
                if self.piece_slot[piece] == EMPTY
                    && len == self.info.piece_len(piece)
                    && hash == self.hashes[piece]
                {
                    claimed = Some(piece);
                    break;
                }
            }

            // The slot may also hold the short tail piece.
            let tail = self.info.num_pieces - 1;
            if claimed.is_none() && self.piece_slot[tail] == EMPTY {
                let tail_len = self.info.last_piece_len;
                if tail_len <= len {
                    let mut hasher = Sha1::new();
                    hasher.update(&buf[..tail_len]);
                    let hash: ID = hasher.finalize().into();
                    if hash == self.hashes[tail] {
                        claimed = Some(tail);
                    }
                }
            }

            if let Some(piece) = claimed {
                tracing::debug!("found piece {} in slot {}", piece, slot);
                self.piece_slot[piece] = slot as i32;
                self.slot_piece[slot] = piece as i32;
                bitfield.set(piece, true);
                for b in self.info.piece_blocks(piece) {
                    blocks.mark_have(b);
                }
            }
        }

        tracing::info!("scan found {}/{} pieces", bitfield.count_ones(), self.info.num_pieces);
        Ok(())
    }

    fn try_resume(&mut self, blocks: &mut BlockTable, bitfield: &mut Bitfield) -> bool {

        let Some(path) = self.resume_path.clone() else { return false };
        let mtimes = match self.file_mtimes() {
            Ok(m) => m,
            Err(_) => return false,
        };
        let data = match resume::load(&path, &mtimes, blocks.len(), self.info.num_pieces) {
            Ok(d) => d,
            Err(e) => {
                tracing::info!("fast resume unavailable: {}", e);
                return false;
            }
        };

        self.slots_used = 0;
        for (slot, &piece) in data.slot_piece.iter().enumerate() {
            self.slot_piece[slot] = piece;
            if piece != EMPTY {
                self.piece_slot[piece as usize] = slot as i32;
                self.slots_used = slot + 1;
            }
        }
        for b in 0..blocks.len() {
            if data.block_have[b] {
                blocks.mark_have(b);
            }
        }
        // A piece counts as held only when every block is in and it has a slot.
        for piece in 0..self.info.num_pieces {
            if self.piece_slot[piece] != EMPTY
                && blocks.complete_in(self.info.piece_blocks(piece))
            {
                bitfield.set(piece, true);
            }
        }

        tracing::info!("fast resume successful, {} slots in use", self.slots_used);
        true
    }

    fn file_mtimes(&self) -> Result<Vec<u32>> {
        use std::os::unix::fs::MetadataExt;
        let mut mtimes = Vec::with_capacity(self.info.files.len());
        for f in &self.info.files {
            let path = self.info.output_dir.join(&f.path);
            let meta = fs::metadata(&path)?;
            if !meta.is_file() {
                return Err(StorageError::Obstructed(path));
            }
            mtimes.push((meta.mtime() & 0x7FFF_FFFF) as u32);
        }
        Ok(mtimes)
    }

    // A full piece parked in the short final slot extends the last file
    // beyond its nominal size. Once the occupant fits again, drop the
    // overhang.
    fn trim_tail(&mut self) -> Result<()> {
        let last_slot = self.info.num_pieces - 1;
        let occupant = self.slot_piece[last_slot];
        if occupant != EMPTY
            && self.info.piece_len(occupant as usize) > self.info.piece_len(last_slot)
        {
            return Ok(());
        }
        let idx = self.files.len() - 1;
        let nominal = self.info.files[idx].length as u64;
        if self.files[idx].metadata()?.len() > nominal {
            self.files[idx].set_len(nominal)?;
        }
        Ok(())
    }

    // Walks the file table from the file containing `offset`. Only the final
    // file may grow past its nominal length (see trim_tail).
    fn read_bytes(&mut self, mut offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        let mut idx = self.file_at(offset);
        while pos < buf.len() {
            if idx >= self.files.len() {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            let f = &self.info.files[idx];
            let in_file = offset - f.offset;
            let remaining = buf.len() - pos;
            let avail = if idx == self.files.len() - 1 {
                remaining
            } else {
                remaining.min(f.length - in_file)
            };
            if avail == 0 {
                idx += 1;
                continue;
            }
            let handle = &mut self.files[idx];
            handle.seek(SeekFrom::Start(in_file as u64))?;
            handle.read_exact(&mut buf[pos..pos + avail])?;
            pos += avail;
            offset += avail;
            idx += 1;
        }
        Ok(())
    }

    fn write_bytes(&mut self, mut offset: usize, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        let mut idx = self.file_at(offset);
        while pos < data.len() {
            if idx >= self.files.len() {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            let f = &self.info.files[idx];
            let in_file = offset - f.offset;
            let remaining = data.len() - pos;
            let avail = if idx == self.files.len() - 1 {
                remaining
            } else {
                remaining.min(f.length - in_file)
            };
            if avail == 0 {
                idx += 1;
                continue;
            }
            let handle = &mut self.files[idx];
            handle.seek(SeekFrom::Start(in_file as u64))?;
            handle.write_all(&data[pos..pos + avail])?;
            pos += avail;
            offset += avail;
            idx += 1;
        }
        Ok(())
    }

    fn file_at(&self, offset: usize) -> usize {
        self.info.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .unwrap_or(self.info.files.len() - 1)
    }
}

// Make sure existing nodes have the right types, create missing folders
// (0755) and files, and open everything read/write.
fn create_files(info: &StoreInfo) -> Result<Vec<fs::File>> {
    let mut files = Vec::with_capacity(info.files.len());
    for f in &info.files {
        let path = info.output_dir.join(&f.path);
        if let Some(dir) = path.parent() {
            create_dirs(dir)?;
        }
        if let Ok(meta) = fs::metadata(&path) {
            if !meta.is_file() {
                return Err(StorageError::Obstructed(path));
            }
        }
        tracing::debug!("opening {:?}", path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        files.push(handle);
    }
    Ok(files)
}

fn create_dirs(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StorageError::Obstructed(dir.to_path_buf())),
        Err(_) => {
            if let Some(parent) = dir.parent() {
                if !parent.as_os_str().is_empty() {
                    create_dirs(parent)?;
                }
            }
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o755);
            builder.create(dir)?;
            Ok(())
        }
    }
}
