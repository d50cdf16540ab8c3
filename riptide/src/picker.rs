use rand::Rng;
use crate::{block::BlockTable, store::StoreInfo, Bitfield};

// Returns true if the peer has at least one piece we haven't completed.
pub fn is_interesting(peer_bf: &Bitfield, own: &Bitfield) -> bool {
    peer_bf.iter().zip(own.iter()).any(|(theirs, ours)| *theirs && !*ours)
}

// Picks the next block to request from a peer.
//
// The goal is to finish pieces: among the pieces the peer has and we lack,
// prefer those missing the fewest free blocks, choosing uniformly from the
// tied pool, and request that piece's first free block. When nothing is
// free any more every wanted block is already in flight, so fall back to
// endgame: duplicate the request with the fewest outstanding askers.
pub fn choose_block<R: Rng>(
    peer_bf: &Bitfield,
    own: &Bitfield,
    blocks: &BlockTable,
    info: &StoreInfo,
    rng: &mut R,
) -> Option<usize> {

    let mut min_missing = usize::MAX;
    let mut pool = Vec::new();
    for piece in 0..info.num_pieces {
        if !peer_bf[piece] || own[piece] {
            continue;
        }
        let missing = blocks.missing_in(info.piece_blocks(piece));
        if missing == 0 {
            // Every block already requested or held.
            continue;
        }
        if missing < min_missing {
            min_missing = missing;
            pool.clear();
        }
        if missing <= min_missing {
            pool.push(piece);
        }
    }

    if !pool.is_empty() {
        let piece = pool[rng.gen_range(0..pool.len())];
        return info.piece_blocks(piece).find(|&b| blocks.is_free(b));
    }

    // Endgame: the least-requested block still outstanding, lowest index on
    // ties. Duplicate requests are intended; cancels are never sent.
    let mut best = None;
    let mut min_outstanding = i8::MAX;
    for b in 0..blocks.len() {
        let n = blocks.outstanding(b);
        if n > 0 && n < min_outstanding {
            min_outstanding = n;
            best = Some(b);
        }
    }
    best
}
