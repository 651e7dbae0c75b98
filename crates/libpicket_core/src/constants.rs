/// Default request granularity. Everything in the swarm requests 16 KiB
/// blocks; only the last block of a piece may be shorter.
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;
