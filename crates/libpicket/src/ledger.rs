use std::collections::{HashMap, HashSet};

use libpicket_core::lengths::ValidPieceIndex;

use crate::piece::PieceDownload;
use crate::type_aliases::PeerHandle;

/// An in-flight piece and the peer primarily responsible for it.
#[derive(Debug)]
pub struct InflightPiece {
    pub owner: PeerHandle,
    pub download: PieceDownload,
}

/// Per-peer bookkeeping of in-flight allocations.
///
/// Outside endgame a piece lives in exactly one peer's list. Endgame
/// duplicate requests are recorded on the blocks themselves
/// (`Block::requested_by`); the `lingering` set remembers duplicate claims
/// that were cancelled outward but whose data may still cross the cancel on
/// the wire; exactly one such late arrival per claim is swallowed.
#[derive(Debug, Default)]
pub struct RequestLedger {
    per_peer: HashMap<PeerHandle, Vec<ValidPieceIndex>>,
    pieces: HashMap<ValidPieceIndex, InflightPiece>,
    lingering: HashMap<PeerHandle, HashSet<(ValidPieceIndex, u32)>>,
}

impl RequestLedger {
    pub fn is_inflight(&self, piece: ValidPieceIndex) -> bool {
        self.pieces.contains_key(&piece)
    }

    pub fn inflight_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn has_peer(&self, peer: PeerHandle) -> bool {
        self.per_peer.get(&peer).is_some_and(|v| !v.is_empty())
    }

    pub fn insert(&mut self, owner: PeerHandle, download: PieceDownload) {
        let index = download.index;
        self.per_peer.entry(owner).or_default().push(index);
        self.pieces.insert(index, InflightPiece { owner, download });
    }

    pub fn get_mut(&mut self, piece: ValidPieceIndex) -> Option<&mut InflightPiece> {
        self.pieces.get_mut(&piece)
    }

    pub fn get(&self, piece: ValidPieceIndex) -> Option<&InflightPiece> {
        self.pieces.get(&piece)
    }

    /// The pieces this peer is primary owner of, in reservation order.
    pub fn pieces_for_peer(&self, peer: PeerHandle) -> Vec<ValidPieceIndex> {
        self.per_peer.get(&peer).cloned().unwrap_or_default()
    }

    /// In-flight piece indices in ascending order (deterministic endgame
    /// scan order).
    pub fn inflight_sorted(&self) -> Vec<ValidPieceIndex> {
        let mut v: Vec<ValidPieceIndex> = self.pieces.keys().copied().collect();
        v.sort();
        v
    }

    pub fn remove_piece(&mut self, piece: ValidPieceIndex) -> Option<InflightPiece> {
        let entry = self.pieces.remove(&piece)?;
        if let Some(list) = self.per_peer.get_mut(&entry.owner) {
            list.retain(|p| *p != piece);
            if list.is_empty() {
                self.per_peer.remove(&entry.owner);
            }
        }
        Some(entry)
    }

    /// Removes and returns every piece primarily owned by `peer`.
    pub fn remove_peer_pieces(&mut self, peer: PeerHandle) -> Vec<InflightPiece> {
        let indices = self.per_peer.remove(&peer).unwrap_or_default();
        indices
            .into_iter()
            .filter_map(|idx| self.pieces.remove(&idx))
            .collect()
    }

    pub fn transfer_ownership(&mut self, piece: ValidPieceIndex, new_owner: PeerHandle) {
        if let Some(entry) = self.pieces.get_mut(&piece) {
            entry.owner = new_owner;
            self.per_peer.entry(new_owner).or_default().push(piece);
        }
    }

    pub fn add_lingering(&mut self, peer: PeerHandle, piece: ValidPieceIndex, offset: u32) {
        self.lingering
            .entry(peer)
            .or_default()
            .insert((piece, offset));
    }

    /// Consumes a lingering claim if one matches. Each claim is good for one
    /// late arrival (or one reject).
    pub fn take_lingering(&mut self, peer: PeerHandle, piece: ValidPieceIndex, offset: u32) -> bool {
        let Some(set) = self.lingering.get_mut(&peer) else {
            return false;
        };
        let took = set.remove(&(piece, offset));
        if set.is_empty() {
            self.lingering.remove(&peer);
        }
        took
    }

    pub fn remove_peer_lingering(&mut self, peer: PeerHandle) {
        self.lingering.remove(&peer);
    }
}
