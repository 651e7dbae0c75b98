use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use libpicket_core::lengths::Lengths;
use parking_lot::{Mutex, RwLock};

use crate::bitfield::BitField;
use crate::choker::{ChokeUpdate, Choker};
use crate::error::{Error, Result};
use crate::peers::{Peer, PeerStates};
use crate::picker::{MAX_INFLIGHT_PER_PEER, PickerState, ReceiveOutcome};
use crate::piece::BlockRequest;
use crate::priority::{FileInfo, PieceTiers, Priority};
use crate::stats::{PeerCounters, SwarmStatsSnapshot};
use crate::type_aliases::PeerHandle;

/// The engine facade: typed peer events in, typed commands out.
///
/// Picker state (self bitfield, ledger, tiers) forms one critical section
/// behind a single lock; the peer registry and its atomic counters live
/// outside it.
///
/// Lock order is always peer map first, then the picker lock. Don't hold
/// them in the other order anywhere or this deadlocks.
pub struct Swarm {
    lengths: Lengths,
    peers: PeerStates,
    locked: RwLock<PickerState>,
    choker: Mutex<Choker>,
}

impl Swarm {
    pub fn new(lengths: Lengths, files: Vec<FileInfo>) -> Result<Self> {
        Self::with_have(lengths, files, None)
    }

    /// Resume variant: `have` carries the already-verified pieces.
    pub fn with_have(
        lengths: Lengths,
        files: Vec<FileInfo>,
        have: Option<BitField>,
    ) -> Result<Self> {
        let tiers = PieceTiers::new(&lengths, files);
        Ok(Self {
            lengths,
            peers: PeerStates::default(),
            locked: RwLock::new(PickerState::new(lengths, tiers, have)?),
            choker: Mutex::new(Choker::new()),
        })
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    // --- peer lifecycle ---

    pub fn add_peer(&self, handle: PeerHandle, fast_extension: bool) -> Result<()> {
        self.peers.add(
            handle,
            Peer::new(self.lengths.total_pieces() as usize, fast_extension),
        )
    }

    /// Releases everything the peer was responsible for; its reserved pieces
    /// become pickable by others again.
    pub fn on_peer_removed(&self, handle: PeerHandle) -> Result<()> {
        if self.peers.remove(handle).is_none() {
            return Err(Error::BugPeerNotFound(handle));
        }
        self.locked.write().on_peer_removed(handle)?;
        self.choker.lock().remove_peer(handle);
        Ok(())
    }

    // --- wire events ---

    pub fn on_bitfield(&self, handle: PeerHandle, bytes: &[u8]) -> Result<()> {
        let bitfield = BitField::from_bytes(bytes, self.lengths.total_pieces() as usize)?;
        self.peers
            .with_peer_mut(handle, |p| p.bitfield = bitfield)
            .ok_or(Error::BugPeerNotFound(handle))
    }

    pub fn on_have(&self, handle: PeerHandle, index: u32) -> Result<()> {
        self.lengths
            .validate_piece_index(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        self.peers
            .with_peer_mut(handle, |p| p.bitfield.set(index as usize, true))
            .ok_or(Error::BugPeerNotFound(handle))?
    }

    pub fn on_peer_choking(&self, handle: PeerHandle, choking: bool) -> Result<()> {
        self.peers
            .with_peer_mut(handle, |p| p.peer_choking = choking)
            .ok_or(Error::BugPeerNotFound(handle))
    }

    pub fn on_peer_interested(&self, handle: PeerHandle, interested: bool) -> Result<()> {
        self.peers
            .with_peer_mut(handle, |p| p.peer_interested = interested)
            .ok_or(Error::BugPeerNotFound(handle))
    }

    pub fn on_suggest_piece(&self, handle: PeerHandle, index: u32) -> Result<()> {
        self.lengths
            .validate_piece_index(index)
            .ok_or(Error::InvalidPieceIndex(index))?;
        self.peers
            .with_peer_mut(handle, |p| {
                if !p.suggested.contains(&index) {
                    p.suggested.push_back(index);
                }
            })
            .ok_or(Error::BugPeerNotFound(handle))
    }

    pub fn on_allowed_fast(&self, handle: PeerHandle, indices: &[u32]) -> Result<()> {
        for index in indices {
            self.lengths
                .validate_piece_index(*index)
                .ok_or(Error::InvalidPieceIndex(*index))?;
        }
        self.peers
            .with_peer_mut(handle, |p| {
                for index in indices {
                    if !p.allowed_fast.contains(index) {
                        p.allowed_fast.push_back(*index);
                    }
                }
            })
            .ok_or(Error::BugPeerNotFound(handle))
    }

    /// The transport reports bytes it uploaded to the peer; feeds the
    /// seeding-side choker ranking.
    pub fn record_uploaded(&self, handle: PeerHandle, bytes: u64) -> Result<()> {
        self.peers
            .with_peer(handle, |p| {
                p.stats.counters.uploaded_bytes.fetch_add(bytes, Relaxed);
            })
            .ok_or(Error::BugPeerNotFound(handle))
    }

    // --- picker operations ---

    /// Remaining request pipeline room for this peer. Callers check this
    /// before pick-loops; readable without the picker lock.
    pub fn request_capacity(&self, handle: PeerHandle) -> Result<u32> {
        self.peers
            .with_peer(handle, |p| {
                MAX_INFLIGHT_PER_PEER
                    .saturating_sub(p.stats.counters.outstanding_requests.load(Relaxed))
            })
            .ok_or(Error::BugPeerNotFound(handle))
    }

    /// `Ok(None)` means there is nothing to request from this peer right now.
    pub fn pick_block(&self, handle: PeerHandle) -> Result<Option<BlockRequest>> {
        self.peers
            .with_peer_mut(handle, |p| self.locked.write().pick_block(handle, p))
            .ok_or(Error::BugPeerNotFound(handle))?
    }

    /// Books an arriving block the session layer holds the payload for. On
    /// `Accepted`, the caller forwards the bytes to the disk collaborator
    /// under the returned write tag and sends out any cancel messages.
    pub fn on_block_received(
        &self,
        handle: PeerHandle,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<ReceiveOutcome> {
        let outcome = self
            .peers
            .with_peer(handle, |p| {
                self.locked
                    .write()
                    .on_block_received(handle, p, piece_index, offset, length)
            })
            .ok_or(Error::BugPeerNotFound(handle))??;

        if let ReceiveOutcome::Accepted { cancels, .. } = &outcome {
            // cancelled duplicates get their pipeline slots back now
            for c in cancels {
                self.peers.with_peer(c.peer, |p| {
                    p.stats.counters.outstanding_requests.fetch_sub(1, Relaxed);
                });
            }
        }
        Ok(outcome)
    }

    pub fn on_reject_received(
        &self,
        handle: PeerHandle,
        piece_index: u32,
        offset: u32,
    ) -> Result<()> {
        self.peers
            .with_peer(handle, |p| {
                self.locked
                    .write()
                    .on_reject_received(handle, p, piece_index, offset)
            })
            .ok_or(Error::BugPeerNotFound(handle))?
    }

    /// Verdict from the disk collaborator for a completed piece. Returns
    /// true once the whole torrent is downloaded and verified.
    pub fn on_hash_result(&self, piece_index: u32, passed: bool) -> Result<bool> {
        let piece = self
            .lengths
            .validate_piece_index(piece_index)
            .ok_or(Error::InvalidPieceIndex(piece_index))?;
        self.locked.write().on_hash_result(piece, passed)
    }

    /// Recomputes whether we want data from this peer and caches the answer
    /// for the choker's fairness comparator. The session layer calls this to
    /// drive interested/not-interested wire messages.
    pub fn is_interesting(&self, handle: PeerHandle) -> Result<bool> {
        self.peers
            .with_peer_mut(handle, |p| {
                let interesting = self.locked.read().is_interesting(handle, p)?;
                p.am_interested = interesting;
                Ok(interesting)
            })
            .ok_or(Error::BugPeerNotFound(handle))?
    }

    pub fn is_finished(&self) -> bool {
        self.locked.read().is_finished()
    }

    /// Gate for inbound upload requests: only verified, owned pieces may be
    /// served. A request for anything else is the caller's cue to reject or
    /// drop the peer.
    pub fn is_piece_available(&self, piece_index: u32) -> Result<bool> {
        let piece = self
            .lengths
            .validate_piece_index(piece_index)
            .ok_or(Error::InvalidPieceIndex(piece_index))?;
        Ok(self.locked.read().is_piece_available(piece))
    }

    pub fn set_file_priority(&self, file_index: usize, priority: Priority) -> bool {
        self.locked.write().tiers_mut().set_file_priority(file_index, priority)
    }

    /// Wire-format copy of our own bitfield (owned + reserved pieces), for
    /// the session layer's bitfield message.
    pub fn have_bitfield_bytes(&self) -> Vec<u8> {
        self.locked.read().have_raw_bytes().to_vec()
    }

    // --- scheduling ---

    /// One reciprocation pass. The session layer owns the tick cadence and
    /// turns the returned sets into choke/unchoke messages.
    pub fn choker_tick(&self, now: Instant) -> ChokeUpdate {
        let seeding = self.is_finished();
        self.choker.lock().tick(&self.peers, seeding, now)
    }

    pub fn stats_snapshot(&self) -> SwarmStatsSnapshot {
        let mut peer_stats = HashMap::new();
        for handle in self.peers.handles() {
            if let Some(counters) = self.peers.with_peer(handle, |p| PeerCounters::from(&p.stats))
            {
                peer_stats.insert(handle.to_string(), counters);
            }
        }
        let g = self.locked.read();
        SwarmStatsSnapshot {
            total_pieces: self.lengths.total_pieces(),
            owned_pieces: g.owned_pieces(),
            inflight_pieces: g.inflight_count(),
            endgame: g.endgame_active(),
            peers: peer_stats,
        }
    }
}
