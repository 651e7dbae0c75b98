#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    // Protocol violations. Not recoverable locally: the caller is expected
    // to drop the offending peer's connection.
    #[error("peer sent block piece={piece} offset={offset} that was never requested")]
    ReceivedUnrequestedBlock { piece: u32, offset: u32 },
    #[error("peer sent block piece={piece} offset={offset} len={got}, requested len={expected}")]
    BlockLengthMismatch {
        piece: u32,
        offset: u32,
        expected: u32,
        got: u32,
    },
    #[error("peer sent already-received block piece={piece} offset={offset} again")]
    DuplicateBlock { piece: u32, offset: u32 },
    #[error("peer sent block piece={piece} offset={offset} that maps to no block")]
    InvalidBlock { piece: u32, offset: u32 },
    #[error("peer rejected request piece={piece} offset={offset} that is not outstanding")]
    RejectedUnknownRequest { piece: u32, offset: u32 },
    #[error("peer bitfield has {got} bytes, torrent needs {expected}")]
    BitfieldLengthMismatch { expected: usize, got: usize },
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),

    #[error("index {index} out of range for bitfield of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("bitfields have different lengths: {0} vs {1}")]
    LengthMismatch(usize, usize),

    // Invariant violations. These mean a programming error, not peer
    // misbehavior, and are surfaced instead of swallowed.
    #[error("bug: peer {0} not found")]
    BugPeerNotFound(u32),
    #[error("bug: peer {0} already registered")]
    BugPeerAlreadyRegistered(u32),
    #[error("bug: piece {0} is already owned")]
    BugPieceAlreadyOwned(u32),
    #[error("bug: hash result for piece {0} that is not awaiting verification")]
    BugUnexpectedHashResult(u32),
}

impl Error {
    /// True for errors caused by peer misbehavior on the wire; the session
    /// layer reacts by terminating that connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ReceivedUnrequestedBlock { .. }
                | Error::BlockLengthMismatch { .. }
                | Error::DuplicateBlock { .. }
                | Error::InvalidBlock { .. }
                | Error::RejectedUnknownRequest { .. }
                | Error::BitfieldLengthMismatch { .. }
                | Error::InvalidPieceIndex(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
