use libpicket_core::lengths::{BlockInfo, Lengths, ValidPieceIndex};

use crate::type_aliases::PeerHandle;

/// Outbound request descriptor, in wire terms. This is what the session layer
/// serializes into a `request` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// One block of an in-flight piece.
///
/// `requested_by` holds every peer the block is currently requested from: at
/// most one outside endgame, possibly several inside it. `received` implies
/// the block was requested at some point.
#[derive(Debug)]
pub struct Block {
    pub info: BlockInfo,
    pub requested_by: Vec<PeerHandle>,
    pub received: bool,
}

impl Block {
    fn new(info: BlockInfo) -> Self {
        Self {
            info,
            requested_by: Vec::new(),
            received: false,
        }
    }

    pub fn requested(&self) -> bool {
        !self.requested_by.is_empty()
    }

    pub fn request_message(&self) -> BlockRequest {
        BlockRequest {
            index: self.info.piece_index.get(),
            begin: self.info.offset,
            length: self.info.size,
        }
    }
}

/// The blocks of exactly one piece being downloaded. Owned by the request
/// ledger entry that created it. Completion only means "all blocks arrived";
/// whether the piece is valid is decided externally by hash verification.
#[derive(Debug)]
pub struct PieceDownload {
    pub index: ValidPieceIndex,
    pub blocks: Vec<Block>,
}

impl PieceDownload {
    pub fn new(index: ValidPieceIndex, lengths: &Lengths) -> Self {
        Self {
            index,
            blocks: lengths.iter_block_infos(index).map(Block::new).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.received)
    }

    pub fn first_unrequested_mut(&mut self) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| !b.received && !b.requested())
    }

    pub fn block_at_offset_mut(&mut self, offset: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.info.offset == offset)
    }

    pub fn received_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.received).count()
    }
}
