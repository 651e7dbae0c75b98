use crate::error::{Error, Result};
use crate::type_aliases::BF;

/// Possession bitmap over piece indices.
///
/// The length is fixed at creation for the lifetime of the torrent session;
/// binary operators only compose bitfields of equal length. There is no
/// internal locking; callers serialize access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: BF,
}

impl BitField {
    pub fn new(len: usize) -> Self {
        let mut bits = BF::from_vec(vec![0u8; len.div_ceil(8)]);
        bits.truncate(len);
        Self { bits }
    }

    /// Builds a bitfield from a wire-format byte string (Msb0, spare bits in
    /// the last byte ignored). The byte length must match the piece count
    /// exactly; anything else is a protocol violation.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(Error::BitfieldLengthMismatch {
                expected,
                got: bytes.len(),
            });
        }
        let mut bits = BF::from_vec(bytes.to_vec());
        bits.truncate(len);
        let mut bf = Self { bits };
        bf.mask_spare_bits();
        Ok(bf)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<bool> {
        self.bits
            .get(index)
            .map(|b| *b)
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.bits.len(),
            })
    }

    pub fn set(&mut self, index: usize, value: bool) -> Result<()> {
        if index >= self.bits.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.bits.len(),
            });
        }
        self.bits.set(index, value);
        Ok(())
    }

    pub fn and(&mut self, other: &BitField) -> Result<()> {
        self.check_same_len(other)?;
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a &= *b;
        }
        Ok(())
    }

    pub fn or(&mut self, other: &BitField) -> Result<()> {
        self.check_same_len(other)?;
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a |= *b;
        }
        Ok(())
    }

    pub fn not(&mut self) {
        for w in self.bits.as_raw_mut_slice().iter_mut() {
            *w = !*w;
        }
        self.mask_spare_bits();
    }

    /// First set bit in `[from, to)`, or None. The range must lie within the
    /// bitfield.
    pub fn first_true(&self, from: usize, to: usize) -> Result<Option<usize>> {
        self.check_range(from, to)?;
        Ok(self.bits[from..to].first_one().map(|i| i + from))
    }

    /// First clear bit in `[from, to)`, or None.
    pub fn first_false(&self, from: usize, to: usize) -> Result<Option<usize>> {
        self.check_range(from, to)?;
        Ok(self.bits[from..to].first_zero().map(|i| i + from))
    }

    pub fn all_true(&self) -> bool {
        self.bits.all()
    }

    pub fn all_false(&self) -> bool {
        self.bits.not_any()
    }

    pub fn count_true(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Wire-format view (spare bits zeroed), for serializing our own
    /// bitfield message.
    pub fn raw_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    fn check_same_len(&self, other: &BitField) -> Result<()> {
        if self.bits.len() != other.bits.len() {
            return Err(Error::LengthMismatch(self.bits.len(), other.bits.len()));
        }
        Ok(())
    }

    fn check_range(&self, from: usize, to: usize) -> Result<()> {
        if from > to || to > self.bits.len() {
            return Err(Error::IndexOutOfRange {
                index: to,
                len: self.bits.len(),
            });
        }
        Ok(())
    }

    // Storage bits past len must stay zero so raw_bytes() round-trips and
    // word-wise ops can't leak them back in.
    fn mask_spare_bits(&mut self) {
        let len = self.bits.len();
        let storage_bits = self.bits.as_raw_slice().len() * 8;
        if storage_bits == len {
            return;
        }
        let spare = storage_bits - len;
        let last = self.bits.as_raw_mut_slice().len() - 1;
        self.bits.as_raw_mut_slice()[last] &= 0xffu8 << spare;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algebra_round_trip() {
        let mut b = BitField::new(11);
        b.set(0, true).unwrap();
        b.set(7, true).unwrap();
        b.set(10, true).unwrap();

        let mut double_not = b.clone();
        double_not.not();
        double_not.not();
        assert_eq!(double_not, b);

        let mut self_and = b.clone();
        self_and.and(&b.clone()).unwrap();
        assert_eq!(self_and, b);

        let mut negated = b.clone();
        negated.not();
        let mut contradiction = b.clone();
        contradiction.and(&negated).unwrap();
        assert!(contradiction.all_false());
    }

    #[test]
    fn test_not_masks_spare_bits() {
        let mut b = BitField::new(10);
        b.not();
        assert!(b.all_true());
        assert_eq!(b.count_true(), 10);
        // spare bits of the last storage byte stay clear
        assert_eq!(b.raw_bytes(), &[0xff, 0b1100_0000]);
    }

    #[test]
    fn test_from_bytes() {
        let b = BitField::from_bytes(&[0b1010_0000, 0b0101_0000], 12).unwrap();
        assert!(b.get(0).unwrap());
        assert!(!b.get(1).unwrap());
        assert!(b.get(2).unwrap());
        assert!(b.get(9).unwrap());
        assert!(b.get(11).unwrap());
        assert_eq!(b.count_true(), 4);

        assert_eq!(
            BitField::from_bytes(&[0xff], 12),
            Err(Error::BitfieldLengthMismatch {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_from_bytes_ignores_spare_bits() {
        let b = BitField::from_bytes(&[0b0000_1111], 5).unwrap();
        assert_eq!(b.count_true(), 1);
        assert_eq!(b.raw_bytes(), &[0b0000_1000]);
    }

    #[test]
    fn test_out_of_range() {
        let mut b = BitField::new(8);
        assert!(matches!(b.get(8), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(b.set(9, true), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(
            b.first_true(0, 9),
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut a = BitField::new(8);
        let b = BitField::new(9);
        assert_eq!(a.and(&b), Err(Error::LengthMismatch(8, 9)));
        assert_eq!(a.or(&b), Err(Error::LengthMismatch(8, 9)));
    }

    #[test]
    fn test_first_true_false() {
        let mut b = BitField::new(16);
        b.set(3, true).unwrap();
        b.set(12, true).unwrap();

        assert_eq!(b.first_true(0, 16).unwrap(), Some(3));
        assert_eq!(b.first_true(4, 16).unwrap(), Some(12));
        assert_eq!(b.first_true(4, 12).unwrap(), None);
        assert_eq!(b.first_false(3, 16).unwrap(), Some(4));
    }

    #[test]
    fn test_counts() {
        let mut b = BitField::new(20);
        assert!(b.all_false());
        assert!(!b.all_true());
        for i in 0..20 {
            b.set(i, true).unwrap();
        }
        assert!(b.all_true());
        assert_eq!(b.count_true(), 20);
    }
}
