use sha1::{Digest, Sha1};
use super::*;
use crate::{block::BlockTable, store::FileInfo, Bitfield};

fn sha(data: &[u8]) -> ID {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

struct Fixture {
    // Kept alive so the directory isn't removed under the storage.
    _dir: tempfile::TempDir,
    info: StoreInfo,
    hashes: Vec<ID>,
    pieces: Vec<Vec<u8>>,
    blocks: BlockTable,
    bitfield: Bitfield,
}

impl Fixture {
    fn open(&mut self, resume: Option<PathBuf>) -> Storage {
        Storage::open(
            self.info.clone(),
            self.hashes.clone(),
            resume,
            &mut self.blocks,
            &mut self.bitfield,
        )
        .unwrap()
    }

    fn reset_tables(&mut self) {
        self.blocks = BlockTable::new(self.info.num_blocks);
        self.bitfield = Bitfield::repeat(false, self.info.num_pieces);
    }

    // Marks every block of the piece received, then writes it whole.
    fn write_piece(&mut self, storage: &mut Storage, piece: usize) -> WriteOutcome {
        for b in self.info.piece_blocks(piece) {
            self.blocks.mark_have(b);
        }
        let data = self.pieces[piece].clone();
        storage
            .write(piece, 0, &data, &mut self.blocks, &mut self.bitfield)
            .unwrap()
    }

    fn expected_content(&self) -> Vec<u8> {
        self.pieces.concat()
    }
}

// 20 bytes in 8-byte pieces: two full pieces and a 4-byte tail.
fn small() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pieces = vec![vec![0x0au8; 8], vec![0x1bu8; 8], vec![0x2cu8; 4]];
    let hashes = pieces.iter().map(|p| sha(p)).collect();
    let info = StoreInfo {
        total_len: 20,
        piece_len: 8,
        last_piece_len: 4,
        num_pieces: 3,
        block_len: 8,
        num_blocks: 3,
        files: vec![FileInfo { path: "data.bin".into(), length: 20, offset: 0 }],
        output_dir: dir.path().to_path_buf(),
    };
    Fixture {
        blocks: BlockTable::new(info.num_blocks),
        bitfield: Bitfield::repeat(false, info.num_pieces),
        _dir: dir,
        info,
        hashes,
        pieces,
    }
}

// 48 KiB in 32 KiB pieces: piece 0 has two real blocks, piece 1 one.
fn blocky() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pieces = vec![vec![0x55u8; 32_768], vec![0x66u8; 16_384]];
    let hashes = pieces.iter().map(|p| sha(p)).collect();
    let info = StoreInfo {
        total_len: 49_152,
        piece_len: 32_768,
        last_piece_len: 16_384,
        num_pieces: 2,
        block_len: 16_384,
        num_blocks: 3,
        files: vec![FileInfo { path: "data.bin".into(), length: 49_152, offset: 0 }],
        output_dir: dir.path().to_path_buf(),
    };
    Fixture {
        blocks: BlockTable::new(info.num_blocks),
        bitfield: Bitfield::repeat(false, info.num_pieces),
        _dir: dir,
        info,
        hashes,
        pieces,
    }
}

fn data_path(fx: &Fixture) -> PathBuf {
    fx.info.output_dir.join("data.bin")
}

#[test]
fn test_disjoint_writes_complete() {
    // Two peers supplying {0, 2} and {1}: after three writes everything
    // is verified and the layout is already the identity.
    let mut fx = small();
    let mut storage = fx.open(None);

    assert!(matches!(fx.write_piece(&mut storage, 0), WriteOutcome::Verified));
    assert!(matches!(fx.write_piece(&mut storage, 2), WriteOutcome::Verified));
    assert!(matches!(fx.write_piece(&mut storage, 1), WriteOutcome::Verified));

    assert!(fx.bitfield.all());
    assert_eq!(storage.slots_used, 3);
    assert_eq!(storage.piece_slot, vec![0, 1, 2]);
    assert_eq!(storage.slot_piece, vec![0, 1, 2]);

    storage.close(&fx.blocks).unwrap();
    assert_eq!(std::fs::read(data_path(&fx)).unwrap(), fx.expected_content());
}

#[test]
fn test_out_of_order_reorder() {
    // Piece 2 lands first, then 0, then 1; the reorderer must converge on
    // the identity layout, temporarily parking full pieces in the short
    // final slot (which extends the file until close trims it).
    let mut fx = small();
    let mut storage = fx.open(None);

    fx.write_piece(&mut storage, 2);
    assert_eq!(storage.piece_slot[2], 0);
    fx.write_piece(&mut storage, 0);
    assert_eq!(storage.piece_slot[0], 0);
    fx.write_piece(&mut storage, 1);

    assert_eq!(storage.piece_slot, vec![0, 1, 2]);
    assert_eq!(storage.slot_piece, vec![0, 1, 2]);
    assert!(fx.bitfield.all());

    storage.close(&fx.blocks).unwrap();
    let content = std::fs::read(data_path(&fx)).unwrap();
    assert_eq!(content.len(), 20, "overhang must be trimmed on close");
    assert_eq!(content, fx.expected_content());
}

#[test]
fn test_identity_for_any_write_order() {
    let orders: [[usize; 3]; 4] = [[0, 1, 2], [1, 2, 0], [2, 1, 0], [1, 0, 2]];
    for order in orders {
        let mut fx = small();
        let mut storage = fx.open(None);
        for piece in order {
            fx.write_piece(&mut storage, piece);
        }
        assert_eq!(storage.piece_slot, vec![0, 1, 2], "order {:?}", order);
        storage.close(&fx.blocks).unwrap();
        assert_eq!(std::fs::read(data_path(&fx)).unwrap(), fx.expected_content());
    }
}

#[test]
fn test_hash_mismatch_frees_blocks() {
    let mut fx = blocky();
    let mut storage = fx.open(None);

    // First half of piece 0 arrives fine.
    fx.blocks.mark_have(0);
    let good = fx.pieces[0][..16_384].to_vec();
    let outcome = storage.write(0, 0, &good, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::Incomplete));

    // Second half arrives corrupt: the piece completes but fails the hash.
    fx.blocks.mark_have(1);
    let bad = vec![0xffu8; 16_384];
    let outcome = storage.write(0, 16_384, &bad, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::HashMismatch));
    assert!(fx.blocks.is_free(0));
    assert!(fx.blocks.is_free(1));
    assert!(!fx.bitfield[0]);
    // The slot stays claimed for the retry.
    assert_eq!(storage.piece_slot[0], 0);

    // The retry with correct bytes verifies.
    fx.blocks.mark_have(0);
    let first = fx.pieces[0][..16_384].to_vec();
    storage.write(0, 0, &first, &mut fx.blocks, &mut fx.bitfield).unwrap();
    fx.blocks.mark_have(1);
    let second = fx.pieces[0][16_384..].to_vec();
    let outcome = storage.write(0, 16_384, &second, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::Verified));
    assert!(fx.bitfield[0]);
}

#[test]
fn test_partial_piece_survives_reorder() {
    // A half-written piece parked at the end of the file gets relocated by
    // a later placement and must still complete and verify afterwards.
    let mut fx = blocky();
    let mut storage = fx.open(None);

    // The tail piece lands first and takes slot 0.
    assert!(matches!(fx.write_piece(&mut storage, 1), WriteOutcome::Verified));
    assert_eq!(storage.piece_slot[1], 0);

    // Half of piece 0 arrives; its placement swaps both pieces into their
    // identity slots even though piece 0's slot isn't fully on disk.
    fx.blocks.mark_have(0);
    let first = fx.pieces[0][..16_384].to_vec();
    let outcome = storage.write(0, 0, &first, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::Incomplete));
    assert_eq!(storage.piece_slot, vec![0, 1]);

    fx.blocks.mark_have(1);
    let second = fx.pieces[0][16_384..].to_vec();
    let outcome = storage.write(0, 16_384, &second, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::Verified));
    assert!(fx.bitfield.all());

    storage.close(&fx.blocks).unwrap();
    assert_eq!(std::fs::read(data_path(&fx)).unwrap(), fx.expected_content());
}

#[test]
fn test_incomplete_piece_is_not_checked() {
    let mut fx = blocky();
    let mut storage = fx.open(None);
    fx.blocks.mark_have(0);
    let data = fx.pieces[0][..16_384].to_vec();
    let outcome = storage.write(0, 0, &data, &mut fx.blocks, &mut fx.bitfield).unwrap();
    assert!(matches!(outcome, WriteOutcome::Incomplete));
    assert!(!fx.bitfield[0]);
}

#[test]
fn test_cross_piece_write_rejected() {
    let mut fx = small();
    let mut storage = fx.open(None);
    let err = storage.write(0, 4, &[0u8; 8], &mut fx.blocks, &mut fx.bitfield);
    assert!(matches!(err, Err(StorageError::CrossPiece)));
}

#[test]
fn test_scan_recovers_pieces() {
    let mut fx = small();
    let mut storage = fx.open(None);
    for piece in 0..3 {
        fx.write_piece(&mut storage, piece);
    }
    // Dropped without close: no resume file, the next open must scan.
    drop(storage);

    fx.reset_tables();
    let storage = fx.open(None);
    assert!(fx.bitfield.all());
    assert_eq!(fx.blocks.have_count(), 3);
    assert_eq!(storage.piece_slot, vec![0, 1, 2]);
    assert_eq!(storage.slots_used, 3);
}

#[test]
fn test_fast_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.test");

    let mut blocks = BlockTable::new(10);
    blocks.mark_have(0);
    blocks.mark_have(3);
    blocks.mark_have(9);
    let slot_piece = vec![2, -1, 0, 3];
    let mtimes = vec![123, 0x7fff_ffff];

    resume::save(&path, &mtimes, &blocks, &slot_piece).unwrap();
    let loaded = resume::load(&path, &mtimes, 10, 4).unwrap();

    assert_eq!(loaded.slot_piece, slot_piece);
    for b in 0..10 {
        assert_eq!(loaded.block_have[b], blocks.is_have(b), "block {}", b);
    }
}

#[test]
fn test_fast_resume_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.test");
    let blocks = BlockTable::new(4);
    resume::save(&path, &[1, 2], &blocks, &[-1, -1]).unwrap();

    // Wrong mtimes.
    assert!(resume::load(&path, &[1, 3], 4, 2).is_err());
    // Wrong dimensions change the expected size.
    assert!(resume::load(&path, &[1, 2], 4, 3).is_err());
    // Wrong version.
    let mut data = std::fs::read(&path).unwrap();
    data[0] = 0xee;
    std::fs::write(&path, &data).unwrap();
    assert!(resume::load(&path, &[1, 2], 4, 2).is_err());
    // A slot table naming the same piece twice is corrupt.
    let mut blocks2 = BlockTable::new(4);
    blocks2.mark_have(0);
    resume::save(&path, &[1, 2], &blocks2, &[1, 1]).unwrap();
    assert!(resume::load(&path, &[1, 2], 4, 2).is_err());
}

#[test]
fn test_resume_skips_scan() {
    let mut fx = small();
    let resume_path = fx.info.output_dir.join("resume.state");
    let mut storage = fx.open(Some(resume_path.clone()));
    for piece in 0..3 {
        fx.write_piece(&mut storage, piece);
    }
    storage.close(&fx.blocks).unwrap();

    // Corrupt the data but restore the mtime: a resumed open trusts the
    // sidecar and never looks at the bytes.
    let path = data_path(&fx);
    let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    use std::os::unix::fs::FileExt;
    file.write_all_at(&[0xde, 0xad], 0).unwrap();
    file.set_modified(mtime).unwrap();
    drop(file);

    fx.reset_tables();
    let storage = fx.open(Some(resume_path));
    assert!(fx.bitfield.all());
    assert_eq!(storage.piece_slot, vec![0, 1, 2]);
    assert_eq!(storage.slots_used, 3);
}

#[test]
fn test_resume_mtime_mismatch_falls_back_to_scan() {
    let mut fx = small();
    let resume_path = fx.info.output_dir.join("resume.state");
    let mut storage = fx.open(Some(resume_path.clone()));
    for piece in 0..3 {
        fx.write_piece(&mut storage, piece);
    }
    storage.close(&fx.blocks).unwrap();

    // Scribble over piece 1; the changed mtime invalidates the sidecar, so
    // the open rescans and only finds pieces 0 and 2.
    let path = data_path(&fx);
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    use std::os::unix::fs::FileExt;
    file.write_all_at(&[0xde, 0xad, 0xbe, 0xef], 8).unwrap();
    file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10)).unwrap();
    drop(file);

    fx.reset_tables();
    let storage = fx.open(Some(resume_path));
    assert!(fx.bitfield[0]);
    assert!(!fx.bitfield[1]);
    assert!(fx.bitfield[2]);
    assert_eq!(storage.piece_slot[1], EMPTY);
    assert_eq!(storage.slots_used, 3);
}

#[test]
fn test_multi_file_spanning_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let pieces = vec![vec![0x0au8; 8], vec![0x1bu8; 8], vec![0x2cu8; 4]];
    let hashes: Vec<ID> = pieces.iter().map(|p| sha(p)).collect();
    let info = StoreInfo {
        total_len: 20,
        piece_len: 8,
        last_piece_len: 4,
        num_pieces: 3,
        block_len: 8,
        num_blocks: 3,
        files: vec![
            FileInfo { path: "a.bin".into(), length: 12, offset: 0 },
            FileInfo { path: "sub/b.bin".into(), length: 8, offset: 12 },
        ],
        output_dir: dir.path().to_path_buf(),
    };
    let mut fx = Fixture {
        blocks: BlockTable::new(info.num_blocks),
        bitfield: Bitfield::repeat(false, info.num_pieces),
        _dir: dir,
        info,
        hashes,
        pieces,
    };

    let mut storage = fx.open(None);
    for piece in 0..3 {
        assert!(matches!(fx.write_piece(&mut storage, piece), WriteOutcome::Verified));
    }

    // Read back across the file boundary.
    let mut buf = vec![0u8; 8];
    storage.read(1, 0, &mut buf).unwrap();
    assert_eq!(buf, fx.pieces[1]);

    storage.close(&fx.blocks).unwrap();
    let all = fx.expected_content();
    assert_eq!(std::fs::read(fx.info.output_dir.join("a.bin")).unwrap(), all[..12]);
    assert_eq!(std::fs::read(fx.info.output_dir.join("sub/b.bin")).unwrap(), all[12..]);
}

#[test]
fn test_obstructed_path_refused() {
    let mut fx = small();
    std::fs::create_dir(data_path(&fx)).unwrap();
    let err = Storage::open(
        fx.info.clone(),
        fx.hashes.clone(),
        None,
        &mut fx.blocks,
        &mut fx.bitfield,
    );
    assert!(matches!(err, Err(StorageError::Obstructed(_))));
}
