//! Piece/block allocation engine and choke scheduler for a peer-to-peer
//! file distribution client.
//!
//! The engine owns no I/O: the session layer feeds it typed peer events
//! (bitfields, haves, choke state, arriving blocks) and gets back typed
//! commands (block requests, disk-write tags, cancels, choke/unchoke sets).
//! Wire codecs, connection management, discovery, hashing and disk access
//! all live with the caller.
//!
//! Entry point is [`swarm::Swarm`]; see `DESIGN.md` in the repository root
//! for the policy decisions.

pub mod bitfield;
pub mod choker;
pub mod error;
pub mod ledger;
pub mod peers;
pub mod picker;
pub mod piece;
pub mod priority;
pub mod stats;
pub mod swarm;
pub mod type_aliases;

pub use bitfield::BitField;
pub use choker::{ChokeUpdate, UNCHOKE_SLOTS};
pub use error::{Error, Result};
pub use picker::{CancelCommand, MAX_INFLIGHT_PER_PEER, ReceiveOutcome, WriteCommand};
pub use piece::BlockRequest;
pub use priority::{FileInfo, Priority};
pub use swarm::Swarm;
pub use type_aliases::PeerHandle;
