use std::collections::HashSet;

use libpicket_core::lengths::{Lengths, ValidPieceIndex};
use tracing::{debug, trace, warn};

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::ledger::RequestLedger;
use crate::peers::Peer;
use crate::piece::{BlockRequest, PieceDownload};
use crate::priority::{PieceTiers, Priority};
use crate::stats::PeerCountersAtomic;
use crate::type_aliases::PeerHandle;

use std::sync::atomic::Ordering::Relaxed;

/// Cap on in-flight block requests per peer. The session layer is expected
/// to check `request_capacity` before asking for more; the picker enforces
/// the cap anyway.
pub const MAX_INFLIGHT_PER_PEER: u32 = 32;

/// Tag for the disk collaborator: which bytes the block the caller is
/// holding belongs to. The engine never owns payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    pub piece_index: ValidPieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// An outward cancel for a now-redundant duplicate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelCommand {
    pub peer: PeerHandle,
    pub request: BlockRequest,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Accepted {
        write: WriteCommand,
        /// Set when this block completed its piece; the caller must request
        /// hash verification and report back via `on_hash_result`.
        piece_completed: Option<ValidPieceIndex>,
        /// Endgame: requests to the same block from other peers that should
        /// now be cancelled on the wire.
        cancels: Vec<CancelCommand>,
    },
    /// A late duplicate crossed its cancel on the wire; dropped without a
    /// write.
    IgnoredDuplicate,
}

enum QueueEntry {
    /// Permanently useless (owned, not wanted, or bogus); prune it.
    Drop,
    /// Not usable right now (reserved elsewhere, or the peer has not
    /// announced it yet); keep it queued.
    Keep,
    Pickable(ValidPieceIndex),
}

/// The picker critical section: self bitfield (owned + reserved + awaiting
/// verification), the request ledger, and the priority view. `Swarm` wraps
/// this in a lock; nothing here blocks or suspends.
pub struct PickerState {
    lengths: Lengths,
    have: BitField,
    tiers: PieceTiers,
    ledger: RequestLedger,
    pending_hash: HashSet<ValidPieceIndex>,
    owned_pieces: u32,
}

impl PickerState {
    pub fn new(lengths: Lengths, tiers: PieceTiers, have: Option<BitField>) -> Result<Self> {
        let total = lengths.total_pieces() as usize;
        let have = match have {
            Some(h) => {
                if h.len() != total {
                    return Err(Error::LengthMismatch(h.len(), total));
                }
                h
            }
            None => BitField::new(total),
        };
        let owned_pieces = have.count_true() as u32;
        Ok(Self {
            lengths,
            have,
            tiers,
            ledger: RequestLedger::default(),
            pending_hash: HashSet::new(),
            owned_pieces,
        })
    }

    pub fn owned_pieces(&self) -> u32 {
        self.owned_pieces
    }

    pub fn is_finished(&self) -> bool {
        self.owned_pieces == self.lengths.total_pieces()
    }

    pub fn inflight_count(&self) -> usize {
        self.ledger.inflight_count()
    }

    pub fn have_raw_bytes(&self) -> &[u8] {
        self.have.raw_bytes()
    }

    pub fn tiers_mut(&mut self) -> &mut PieceTiers {
        &mut self.tiers
    }

    /// Duplicate requests are allowed once nothing is pickable anymore:
    /// every piece is owned, awaiting verification, or already in flight.
    pub fn endgame_active(&self) -> bool {
        self.have.all_true() && self.ledger.inflight_count() > 0
    }

    /// Decides the next block to request from this peer, if any.
    ///
    /// Selection order: existing pipeline, allowed-fast pieces (choke-exempt),
    /// choke gate, suggested pieces, then the general tier scan. In the
    /// general scan the candidate set is `(NOT self) AND peer`; the highest
    /// priority tier wins and ties break to the lowest piece index. Endgame
    /// duplication is the last resort.
    pub fn pick_block(&mut self, handle: PeerHandle, peer: &mut Peer) -> Result<Option<BlockRequest>> {
        let counters = peer.stats.counters.clone();
        if counters.outstanding_requests.load(Relaxed) >= MAX_INFLIGHT_PER_PEER {
            trace!(peer = handle, "request pipeline full");
            return Ok(None);
        }

        // Keep the existing pipeline full before deriving a new selection.
        for piece in self.ledger.pieces_for_peer(handle) {
            if let Some(entry) = self.ledger.get_mut(piece) {
                if let Some(block) = entry.download.first_unrequested_mut() {
                    block.requested_by.push(handle);
                    counters.outstanding_requests.fetch_add(1, Relaxed);
                    return Ok(Some(block.request_message()));
                }
            }
        }

        // Allowed-fast pieces may be requested regardless of choke state.
        if peer.fast_extension {
            if let Some(req) = self.consume_allowed_fast(handle, peer, &counters)? {
                return Ok(Some(req));
            }
        }

        if peer.peer_choking {
            return Ok(None);
        }

        if let Some(req) = self.consume_suggested(handle, peer, &counters)? {
            return Ok(Some(req));
        }

        if let Some(piece) = self.select_general(peer)? {
            return Ok(Some(self.reserve(handle, piece, &counters)?));
        }

        Ok(self.pick_endgame(handle, peer, &counters))
    }

    fn classify_queue_entry(&self, index: u32, peer: &Peer) -> QueueEntry {
        let Some(piece) = self.lengths.validate_piece_index(index) else {
            return QueueEntry::Drop;
        };
        if !peer.bitfield.get(index as usize).unwrap_or(false) {
            return QueueEntry::Keep;
        }
        if self.have.get(index as usize).unwrap_or(true) {
            return if self.ledger.is_inflight(piece) {
                QueueEntry::Keep
            } else {
                QueueEntry::Drop
            };
        }
        if self.tiers.piece_priority(piece) == Priority::DoNotDownload {
            return QueueEntry::Drop;
        }
        QueueEntry::Pickable(piece)
    }

    fn consume_allowed_fast(
        &mut self,
        handle: PeerHandle,
        peer: &mut Peer,
        counters: &PeerCountersAtomic,
    ) -> Result<Option<BlockRequest>> {
        for _ in 0..peer.allowed_fast.len() {
            let index = peer.allowed_fast.pop_front().unwrap();
            match self.classify_queue_entry(index, peer) {
                QueueEntry::Drop => trace!(peer = handle, piece = index, "pruned allowed-fast piece"),
                QueueEntry::Keep => peer.allowed_fast.push_back(index),
                QueueEntry::Pickable(piece) => {
                    debug!(peer = handle, piece = index, "requesting allowed-fast piece");
                    return Ok(Some(self.reserve(handle, piece, counters)?));
                }
            }
        }
        Ok(None)
    }

    fn consume_suggested(
        &mut self,
        handle: PeerHandle,
        peer: &mut Peer,
        counters: &PeerCountersAtomic,
    ) -> Result<Option<BlockRequest>> {
        for _ in 0..peer.suggested.len() {
            let index = peer.suggested.pop_front().unwrap();
            match self.classify_queue_entry(index, peer) {
                QueueEntry::Drop => trace!(peer = handle, piece = index, "pruned suggested piece"),
                QueueEntry::Keep => peer.suggested.push_back(index),
                QueueEntry::Pickable(piece) => {
                    debug!(peer = handle, piece = index, "requesting suggested piece");
                    return Ok(Some(self.reserve(handle, piece, counters)?));
                }
            }
        }
        Ok(None)
    }

    fn select_general(&self, peer: &Peer) -> Result<Option<ValidPieceIndex>> {
        let mut candidate = self.have.clone();
        candidate.not();
        candidate.and(&peer.bitfield)?;

        // Highest tier wins; within a tier the lowest index (candidates are
        // scanned ascending, so the first hit per tier is the lowest).
        let mut best: Option<(Priority, ValidPieceIndex)> = None;
        for index in candidate.iter_ones() {
            let Some(piece) = self.lengths.validate_piece_index(index as u32) else {
                continue;
            };
            let tier = self.tiers.piece_priority(piece);
            if tier == Priority::DoNotDownload {
                continue;
            }
            match best {
                Some((best_tier, _)) if tier <= best_tier => {}
                _ => best = Some((tier, piece)),
            }
            if matches!(best, Some((Priority::Immediate, _))) {
                break;
            }
        }
        Ok(best.map(|(_, piece)| piece))
    }

    fn reserve(
        &mut self,
        handle: PeerHandle,
        piece: ValidPieceIndex,
        counters: &PeerCountersAtomic,
    ) -> Result<BlockRequest> {
        if self.have.get(piece.get() as usize)? {
            return Err(Error::BugPieceAlreadyOwned(piece.get()));
        }
        let mut download = PieceDownload::new(piece, &self.lengths);
        download.blocks[0].requested_by.push(handle);
        let req = download.blocks[0].request_message();
        self.have.set(piece.get() as usize, true)?;
        self.ledger.insert(handle, download);
        counters.outstanding_requests.fetch_add(1, Relaxed);
        debug!(peer = handle, piece = piece.get(), "reserved piece");
        Ok(req)
    }

    fn pick_endgame(
        &mut self,
        handle: PeerHandle,
        peer: &Peer,
        counters: &PeerCountersAtomic,
    ) -> Option<BlockRequest> {
        if !self.endgame_active() {
            return None;
        }
        for piece in self.ledger.inflight_sorted() {
            if !peer.bitfield.get(piece.get() as usize).unwrap_or(false) {
                continue;
            }
            let Some(entry) = self.ledger.get_mut(piece) else {
                continue;
            };
            for block in entry.download.blocks.iter_mut() {
                if block.received || block.requested_by.contains(&handle) {
                    continue;
                }
                block.requested_by.push(handle);
                counters.outstanding_requests.fetch_add(1, Relaxed);
                debug!(
                    peer = handle,
                    piece = piece.get(),
                    offset = block.info.offset,
                    "endgame duplicate request"
                );
                return Some(block.request_message());
            }
        }
        None
    }

    /// Books an arriving block. The caller holds the payload; on `Accepted`
    /// it forwards the bytes to disk under the returned tag and sends out any
    /// cancels (decrementing those peers' outstanding counters).
    pub fn on_block_received(
        &mut self,
        handle: PeerHandle,
        peer: &Peer,
        piece_index: u32,
        begin: u32,
        length: u32,
    ) -> Result<ReceiveOutcome> {
        let counters = &peer.stats.counters;
        let piece = self
            .lengths
            .validate_piece_index(piece_index)
            .ok_or(Error::InvalidPieceIndex(piece_index))?;

        // A duplicate whose cancel we already sent; its outstanding slot was
        // given back when the cancel went out.
        if self.ledger.take_lingering(handle, piece, begin) {
            debug!(peer = handle, piece = piece_index, offset = begin, "late duplicate ignored");
            return Ok(ReceiveOutcome::IgnoredDuplicate);
        }

        let entry = self
            .ledger
            .get_mut(piece)
            .ok_or(Error::ReceivedUnrequestedBlock {
                piece: piece_index,
                offset: begin,
            })?;
        let block = entry
            .download
            .block_at_offset_mut(begin)
            .ok_or(Error::InvalidBlock {
                piece: piece_index,
                offset: begin,
            })?;
        if block.info.size != length {
            return Err(Error::BlockLengthMismatch {
                piece: piece_index,
                offset: begin,
                expected: block.info.size,
                got: length,
            });
        }

        let was_requester = match block.requested_by.iter().position(|h| *h == handle) {
            Some(pos) => {
                block.requested_by.remove(pos);
                true
            }
            None => false,
        };

        if block.received {
            return if was_requester {
                counters.outstanding_requests.fetch_sub(1, Relaxed);
                Ok(ReceiveOutcome::IgnoredDuplicate)
            } else {
                Err(Error::DuplicateBlock {
                    piece: piece_index,
                    offset: begin,
                })
            };
        }
        if !was_requester {
            return Err(Error::ReceivedUnrequestedBlock {
                piece: piece_index,
                offset: begin,
            });
        }

        block.received = true;
        let request = block.request_message();
        let cancels: Vec<CancelCommand> = block
            .requested_by
            .drain(..)
            .map(|other| CancelCommand {
                peer: other,
                request,
            })
            .collect();
        let completed = entry.download.is_complete();

        counters.outstanding_requests.fetch_sub(1, Relaxed);
        counters.fetched_bytes.fetch_add(length as u64, Relaxed);
        counters.fetched_blocks.fetch_add(1, Relaxed);

        for c in &cancels {
            self.ledger.add_lingering(c.peer, piece, begin);
        }

        let piece_completed = if completed {
            self.ledger.remove_piece(piece);
            self.pending_hash.insert(piece);
            counters.completed_pieces.fetch_add(1, Relaxed);
            debug!(piece = piece_index, "piece complete, awaiting verification");
            Some(piece)
        } else {
            None
        };

        Ok(ReceiveOutcome::Accepted {
            write: WriteCommand {
                piece_index: piece,
                offset: begin,
                length,
            },
            piece_completed,
            cancels,
        })
    }

    /// The peer turned down a request; the block becomes requestable again.
    pub fn on_reject_received(
        &mut self,
        handle: PeerHandle,
        peer: &Peer,
        piece_index: u32,
        begin: u32,
    ) -> Result<()> {
        let unknown = || Error::RejectedUnknownRequest {
            piece: piece_index,
            offset: begin,
        };
        let Some(piece) = self.lengths.validate_piece_index(piece_index) else {
            return Err(unknown());
        };

        // A reject for a cancelled duplicate just settles the claim.
        if self.ledger.take_lingering(handle, piece, begin) {
            return Ok(());
        }

        let entry = self.ledger.get_mut(piece).ok_or_else(unknown)?;
        let block = entry
            .download
            .block_at_offset_mut(begin)
            .ok_or_else(unknown)?;
        match block.requested_by.iter().position(|h| *h == handle) {
            Some(pos) => {
                block.requested_by.remove(pos);
                peer.stats.counters.outstanding_requests.fetch_sub(1, Relaxed);
                trace!(peer = handle, piece = piece_index, offset = begin, "request rejected");
                Ok(())
            }
            None => Err(unknown()),
        }
    }

    /// Releases everything the disconnecting peer was responsible for. Pieces
    /// with live duplicate requesters survive under a new owner; the rest
    /// lose their reservation and become pickable again.
    pub fn on_peer_removed(&mut self, handle: PeerHandle) -> Result<()> {
        self.ledger.remove_peer_lingering(handle);

        for piece in self.ledger.inflight_sorted() {
            if let Some(entry) = self.ledger.get_mut(piece) {
                if entry.owner == handle {
                    continue;
                }
                for b in entry.download.blocks.iter_mut() {
                    b.requested_by.retain(|h| *h != handle);
                }
            }
        }

        for mut entry in self.ledger.remove_peer_pieces(handle) {
            let piece = entry.download.index;
            for b in entry.download.blocks.iter_mut() {
                b.requested_by.retain(|h| *h != handle);
            }
            let new_owner = entry
                .download
                .blocks
                .iter()
                .flat_map(|b| b.requested_by.iter().copied())
                .min();
            match new_owner {
                Some(other) => {
                    debug!(piece = piece.get(), from = handle, to = other, "transferring ownership");
                    self.ledger.insert(other, entry.download);
                }
                None => {
                    debug!(piece = piece.get(), peer = handle, "releasing reservation");
                    self.have.set(piece.get() as usize, false)?;
                }
            }
        }
        Ok(())
    }

    /// The disk collaborator's verdict on a completed piece. Returns true
    /// when the whole torrent is now downloaded and verified.
    pub fn on_hash_result(&mut self, piece: ValidPieceIndex, passed: bool) -> Result<bool> {
        if !self.pending_hash.remove(&piece) {
            return Err(Error::BugUnexpectedHashResult(piece.get()));
        }
        if passed {
            self.owned_pieces += 1;
            debug!(piece = piece.get(), "piece verified");
            Ok(self.is_finished())
        } else {
            warn!(piece = piece.get(), "verification failed, requeueing");
            self.have.set(piece.get() as usize, false)?;
            Ok(false)
        }
    }

    /// Whether a piece is verified and owned, i.e. servable to a peer that
    /// requests it. Reserved and unverified pieces are not.
    pub fn is_piece_available(&self, piece: ValidPieceIndex) -> bool {
        self.have.get(piece.get() as usize).unwrap_or(false)
            && !self.ledger.is_inflight(piece)
            && !self.pending_hash.contains(&piece)
    }

    /// True while the peer offers something we lack, or while we still have
    /// a pipeline with it to drain.
    pub fn is_interesting(&self, handle: PeerHandle, peer: &Peer) -> Result<bool> {
        if self.ledger.has_peer(handle) {
            return Ok(true);
        }
        let mut candidate = self.have.clone();
        candidate.not();
        candidate.and(&peer.bitfield)?;
        Ok(!candidate.all_false())
    }
}
