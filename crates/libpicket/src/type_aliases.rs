pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Opaque peer identity. The session layer assigns one per connection and
/// keys every event with it; the engine never sees addresses or sockets.
pub type PeerHandle = u32;
