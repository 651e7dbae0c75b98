use std::collections::VecDeque;

use dashmap::DashMap;

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::stats::PeerStats;
use crate::type_aliases::PeerHandle;

/// Engine-side state of one connected peer. Connection lifecycle lives in the
/// session layer; an entry exists exactly while the peer is connected.
pub struct Peer {
    pub bitfield: BitField,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub fast_extension: bool,

    // Peer-owned queues, consumed (popped) by the picker rather than pruned
    // in place.
    pub allowed_fast: VecDeque<u32>,
    pub suggested: VecDeque<u32>,

    pub stats: PeerStats,
}

impl Peer {
    pub fn new(total_pieces: usize, fast_extension: bool) -> Self {
        Self {
            bitfield: BitField::new(total_pieces),
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            fast_extension,
            allowed_fast: VecDeque::new(),
            suggested: VecDeque::new(),
            stats: Default::default(),
        }
    }
}

#[derive(Default)]
pub struct PeerStates {
    states: DashMap<PeerHandle, Peer>,
}

impl PeerStates {
    pub fn add(&self, handle: PeerHandle, peer: Peer) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(handle) {
            Entry::Occupied(_) => Err(Error::BugPeerAlreadyRegistered(handle)),
            Entry::Vacant(vac) => {
                vac.insert(peer);
                Ok(())
            }
        }
    }

    pub fn remove(&self, handle: PeerHandle) -> Option<Peer> {
        self.states.remove(&handle).map(|(_, p)| p)
    }

    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.states.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn with_peer<R>(&self, handle: PeerHandle, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        self.states.get(&handle).map(|e| f(e.value()))
    }

    pub fn with_peer_mut<R>(
        &self,
        handle: PeerHandle,
        f: impl FnOnce(&mut Peer) -> R,
    ) -> Option<R> {
        self.states.get_mut(&handle).map(|mut e| f(e.value_mut()))
    }

    /// Snapshot of connected handles; iteration happens outside shard locks.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.states.iter().map(|e| *e.key()).collect()
    }
}
