//! Piece bookkeeping shared by every peer session.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, OnceLock,
};

use bitvec::prelude::*;
use tracing::warn;

use crate::tcp_wire::Message;

/// Bitfield where index = piece, stored MSB-first the way the wire encodes
/// it: bit `i` lives in byte `i / 8` at bit `7 - (i % 8)`.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
pub type Reserved = BitArray<[u8; 8], Msb0>;

type OnPieceComplete = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct Bits {
    /// Pieces we have, verified on disk.
    have: Bitfield,
    /// Pieces currently assigned to a peer session for download. Split from
    /// `have` so a failed download releases the piece without ever touching
    /// the completion state.
    assigned: Bitfield,
}

/// Tracks which pieces are possessed, in flight or missing, and hands out
/// assignments to peer sessions. All operations are thread safe; the
/// completion callback runs outside the lock.
#[derive(Default)]
pub struct PieceMap {
    bits: Mutex<Bits>,
    /// Monotone count of verified pieces, distinguishes "assigned" from
    /// "have" for the completion predicate.
    completed: AtomicU64,
    on_piece_complete: OnceLock<OnPieceComplete>,
}

impl PieceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the map once the piece count is known. For .torrent files that
    /// is at startup, for magnet links after the metadata exchange.
    pub fn init(&self, piece_count: u64) {
        let mut bits = self.bits.lock().unwrap();
        bits.have = Bitfield::repeat(false, piece_count as usize);
        bits.assigned = Bitfield::repeat(false, piece_count as usize);
    }

    pub fn piece_count(&self) -> u64 {
        self.bits.lock().unwrap().have.len() as u64
    }

    /// Register the handler called whenever a piece completes, either from
    /// the resume scan or from a verified download. May be set once.
    pub fn set_on_piece_complete(&self, handler: OnPieceComplete) {
        let _ = self.on_piece_complete.set(handler);
    }

    pub fn has_piece(&self, piece_index: u64) -> bool {
        let bits = self.bits.lock().unwrap();
        let result = match bits.have.get(piece_index as usize) {
            Some(bit) => *bit,
            None => {
                warn!("has_piece called with out of range piece {piece_index}");
                false
            }
        };
        result
    }

    /// Mark a piece as present. Idempotent, the completion handler only
    /// fires when the bit was newly set.
    pub fn set_piece(&self, piece_index: u64) {
        self.mark_complete(piece_index, false);
    }

    /// A piece assigned to a peer arrived and passed its hash check.
    pub fn piece_success(&self, piece_index: u64) {
        self.mark_complete(piece_index, true);
    }

    fn mark_complete(&self, piece_index: u64, clear_assigned: bool) {
        let mut bits = self.bits.lock().unwrap();
        let index = piece_index as usize;
        if index >= bits.have.len() {
            warn!("piece {piece_index} is out of range, ignoring");
            return;
        }
        if clear_assigned {
            bits.assigned.set(index, false);
        }
        if bits.have[index] {
            return;
        }
        bits.have.set(index, true);
        self.completed.fetch_add(1, Ordering::Relaxed);
        drop(bits);

        if let Some(handler) = self.on_piece_complete.get() {
            handler(piece_index);
        }
    }

    /// Downloading the piece failed, clear the assignment so another peer
    /// may pick it.
    pub fn piece_failed(&self, piece_index: u64) {
        let mut bits = self.bits.lock().unwrap();
        let index = piece_index as usize;
        if index >= bits.assigned.len() {
            warn!("piece {piece_index} is out of range, ignoring");
            return;
        }
        bits.assigned.set(index, false);
    }

    /// Pick the first piece the peer has that we neither have nor have
    /// assigned, and mark it assigned. Lowest index wins.
    ///
    /// # Panics
    ///
    /// Both bitfields must be equally sized, a mismatch is a bug in the
    /// caller.
    pub fn assign_piece(&self, peer_bitfield: &Bitfield) -> Option<u64> {
        let mut bits = self.bits.lock().unwrap();
        assert_eq!(
            peer_bitfield.len(),
            bits.have.len(),
            "assign_piece called with non matching bitfields"
        );
        for index in peer_bitfield.iter_ones() {
            if !bits.have[index] && !bits.assigned[index] {
                bits.assigned.set(index, true);
                return Some(index as u64);
            }
        }
        None
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Snapshot of the pieces we have as a wire message.
    pub fn as_message(&self) -> Message {
        let bits = self.bits.lock().unwrap();
        Message::Bitfield(bits.have.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn assigns_first_matching_piece() {
        let pieces = PieceMap::new();
        pieces.init(8);

        // peer has pieces 0 and 1
        let peer = Bitfield::from_vec(vec![0b1100_0000]);

        assert_eq!(pieces.assign_piece(&peer), Some(0));
        assert_eq!(pieces.assign_piece(&peer), Some(1));
        assert_eq!(pieces.assign_piece(&peer), None);
    }

    #[test]
    fn no_piece_is_assigned_twice() {
        let pieces = PieceMap::new();
        pieces.init(16);

        let a = Bitfield::from_vec(vec![0xff, 0x00]);
        let b = Bitfield::from_vec(vec![0x0f, 0xf0]);

        let mut seen = Vec::new();
        loop {
            let next = pieces
                .assign_piece(&a)
                .or_else(|| pieces.assign_piece(&b));
            match next {
                Some(piece) => {
                    assert!(!seen.contains(&piece));
                    seen.push(piece);
                }
                None => break,
            }
        }
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn failed_piece_can_be_reassigned() {
        let pieces = PieceMap::new();
        pieces.init(8);
        let peer = Bitfield::from_vec(vec![0b1000_0000]);

        assert_eq!(pieces.assign_piece(&peer), Some(0));
        assert_eq!(pieces.assign_piece(&peer), None);

        pieces.piece_failed(0);
        assert_eq!(pieces.assign_piece(&peer), Some(0));
    }

    #[test]
    fn successful_piece_stays_done() {
        let pieces = PieceMap::new();
        pieces.init(8);
        let peer = Bitfield::from_vec(vec![0b1000_0000]);

        assert_eq!(pieces.assign_piece(&peer), Some(0));
        pieces.piece_success(0);

        assert!(pieces.has_piece(0));
        assert_eq!(pieces.completed_count(), 1);
        assert_eq!(pieces.assign_piece(&peer), None);
    }

    #[test]
    fn set_piece_is_idempotent() {
        let pieces = PieceMap::new();
        pieces.init(8);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        pieces.set_on_piece_complete(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        }));

        pieces.set_piece(3);
        pieces.set_piece(3);

        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(pieces.completed_count(), 1);
    }

    #[test]
    #[should_panic]
    fn mismatched_bitfield_sizes_are_a_bug() {
        let pieces = PieceMap::new();
        pieces.init(16);
        let peer = Bitfield::from_vec(vec![0xff]);
        pieces.assign_piece(&peer);
    }

    #[test]
    fn out_of_range_queries_are_harmless() {
        let pieces = PieceMap::new();
        pieces.init(4);
        assert!(!pieces.has_piece(10));
        pieces.set_piece(10);
        assert_eq!(pieces.completed_count(), 0);
    }

    #[test]
    fn concurrent_assignments_stay_unique() {
        let pieces = std::sync::Arc::new(PieceMap::new());
        pieces.init(256);
        let peer = Bitfield::from_vec(vec![0xff; 32]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pieces = pieces.clone();
            let peer = peer.clone();
            handles.push(std::thread::spawn(move || {
                let mut assigned = Vec::new();
                while let Some(piece) = pieces.assign_piece(&peer) {
                    assigned.push(piece);
                }
                assigned
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        let len = all.len();
        all.dedup();

        assert_eq!(len, 256);
        assert_eq!(all.len(), 256);
    }

    #[test]
    fn snapshot_message_has_wire_layout() {
        let pieces = PieceMap::new();
        pieces.init(10);
        pieces.set_piece(8);
        pieces.set_piece(9);

        match pieces.as_message() {
            Message::Bitfield(bitfield) => {
                assert_eq!(bitfield.into_vec(), vec![0x00, 0b1100_0000]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
