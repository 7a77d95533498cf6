//! Bounds-checked walking over 32-bit little-endian words
//!
//! All frame arithmetic goes through [`WordCursor`]; running off the end of a view
//! yields `None` rather than reading someone else's bytes.

pub const WORD_SIZE: usize = 4;

/// A `(base, length, cursor)` view over a run of 32-bit words.
#[derive(Clone, Copy, Debug)]
pub struct WordCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WordCursor<'a> {
    /// View the whole words in `bytes`; a trailing partial word is ignored.
    pub fn new(bytes: &'a [u8]) -> Self {
        let whole = bytes.len() - bytes.len() % WORD_SIZE;
        Self {
            bytes: &bytes[..whole],
            pos: 0,
        }
    }

    /// Length of the view in words
    pub fn len(&self) -> usize {
        self.bytes.len() / WORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Words consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn byte_position(&self) -> usize {
        self.pos * WORD_SIZE
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.pos
    }

    /// Word `i` counted from the current position
    pub fn peek_at(&self, i: usize) -> Option<u32> {
        let start = self.pos.checked_add(i)?.checked_mul(WORD_SIZE)?;
        let b = self.bytes.get(start..start + WORD_SIZE)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn peek(&self) -> Option<u32> {
        self.peek_at(0)
    }

    pub fn next_word(&mut self) -> Option<u32> {
        let w = self.peek()?;
        self.pos += 1;
        Some(w)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        if n > self.remaining() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// Split off the next `n` words as their own view and step past them.
    pub fn take(&mut self, n: usize) -> Option<WordCursor<'a>> {
        if n > self.remaining() {
            return None;
        }
        let start = self.pos * WORD_SIZE;
        self.pos += n;
        Some(WordCursor {
            bytes: &self.bytes[start..start + n * WORD_SIZE],
            pos: 0,
        })
    }

    /// The next `n` words as raw bytes, stepping past them.
    pub fn take_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        self.take(n).map(|c| c.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_reads_little_endian() {
        let bytes = words(&[0xA000_0004, 0xDEAD_BEEF]);
        let mut c = WordCursor::new(&bytes);
        assert_eq!(c.len(), 2);
        assert_eq!(c.next_word(), Some(0xA000_0004));
        assert_eq!(c.peek(), Some(0xDEAD_BEEF));
        assert_eq!(c.position(), 1);
        assert_eq!(c.byte_position(), 4);
    }

    #[test]
    fn test_partial_trailing_word_is_invisible() {
        let mut bytes = words(&[1, 2]);
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let mut c = WordCursor::new(&bytes);
        assert_eq!(c.len(), 2);
        c.skip(2).unwrap();
        assert_eq!(c.next_word(), None);
    }

    #[test]
    fn test_take_is_bounded() {
        let bytes = words(&[1, 2, 3, 4]);
        let mut c = WordCursor::new(&bytes);
        c.skip(1).unwrap();
        let mut sub = c.take(2).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.next_word(), Some(2));
        assert_eq!(sub.next_word(), Some(3));
        assert_eq!(sub.next_word(), None);
        assert_eq!(c.next_word(), Some(4));
        assert!(c.take(1).is_none());
        assert!(c.skip(1).is_none());
        assert_eq!(c.peek_at(usize::MAX), None);
    }
}
