use libpicket_core::lengths::{Lengths, ValidPieceIndex};

/// File-level download weighting. Only ever biases which available piece the
/// picker selects; availability itself is priority-blind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize)]
pub enum Priority {
    DoNotDownload,
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// One file of the torrent, reduced to what the picker needs: its byte range
/// mapped to a piece range, and its priority.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub offset_in_torrent: u64,
    pub len: u64,
    pub piece_range: std::ops::Range<u32>,
    pub priority: Priority,
}

impl FileInfo {
    pub fn new(lengths: &Lengths, offset_in_torrent: u64, len: u64, priority: Priority) -> Self {
        Self {
            offset_in_torrent,
            len,
            piece_range: lengths.file_piece_range(offset_in_torrent, len),
            priority,
        }
    }
}

/// Per-piece priority view over the file list.
///
/// A piece's tier is the maximum priority of the files overlapping it, so a
/// boundary piece shared with a wanted file is still downloaded even when its
/// other file is `DoNotDownload`. With no files configured every piece is
/// `Normal`.
pub struct PieceTiers {
    files: Vec<FileInfo>,
    tiers: Vec<Priority>,
}

impl PieceTiers {
    pub fn new(lengths: &Lengths, files: Vec<FileInfo>) -> Self {
        let mut s = Self {
            files,
            tiers: Vec::new(),
        };
        s.rebuild(lengths.total_pieces() as usize);
        s
    }

    pub fn piece_priority(&self, index: ValidPieceIndex) -> Priority {
        self.tiers[index.get() as usize]
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Returns false if `file_index` does not exist.
    pub fn set_file_priority(&mut self, file_index: usize, priority: Priority) -> bool {
        let total = self.tiers.len();
        match self.files.get_mut(file_index) {
            Some(f) => f.priority = priority,
            None => return false,
        }
        self.rebuild(total);
        true
    }

    fn rebuild(&mut self, total_pieces: usize) {
        if self.files.is_empty() {
            self.tiers = vec![Priority::Normal; total_pieces];
            return;
        }
        self.tiers = vec![Priority::DoNotDownload; total_pieces];
        for f in &self.files {
            for piece_id in f.piece_range.clone() {
                let t = &mut self.tiers[piece_id as usize];
                *t = std::cmp::max(*t, f.priority);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        // 10 pieces of 32 KiB
        Lengths::new(327_680, 32_768, None).unwrap()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::DoNotDownload < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Immediate);
    }

    #[test]
    fn test_no_files_means_all_normal() {
        let l = make_lengths();
        let tiers = PieceTiers::new(&l, vec![]);
        for p in l.iter_piece_infos() {
            assert_eq!(tiers.piece_priority(p.piece_index), Priority::Normal);
        }
    }

    #[test]
    fn test_boundary_piece_takes_max_priority() {
        let l = make_lengths();
        // file A covers pieces 0..5 and half of piece 5, file B the rest
        let files = vec![
            FileInfo::new(&l, 0, 32_768 * 5 + 1000, Priority::DoNotDownload),
            FileInfo::new(&l, 32_768 * 5 + 1000, 327_680 - (32_768 * 5 + 1000), Priority::High),
        ];
        let tiers = PieceTiers::new(&l, files);

        let p = |i| l.validate_piece_index(i).unwrap();
        assert_eq!(tiers.piece_priority(p(0)), Priority::DoNotDownload);
        assert_eq!(tiers.piece_priority(p(4)), Priority::DoNotDownload);
        // shared boundary piece is wanted because file B needs it
        assert_eq!(tiers.piece_priority(p(5)), Priority::High);
        assert_eq!(tiers.piece_priority(p(9)), Priority::High);
    }

    #[test]
    fn test_set_file_priority_rebuilds() {
        let l = make_lengths();
        let files = vec![FileInfo::new(&l, 0, 327_680, Priority::Normal)];
        let mut tiers = PieceTiers::new(&l, files);

        let p0 = l.validate_piece_index(0).unwrap();
        assert_eq!(tiers.piece_priority(p0), Priority::Normal);

        assert!(tiers.set_file_priority(0, Priority::Immediate));
        assert_eq!(tiers.piece_priority(p0), Priority::Immediate);

        assert!(!tiers.set_file_priority(5, Priority::Low));
    }
}
