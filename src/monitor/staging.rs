//! Read cursor over a peeked, backend-owned fragment.

/// Position inside the fragment a capture stream currently has peeked.
///
/// The fragment itself stays with the backend until it is discarded; the
/// monitor only remembers how much of it has been handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StagedChunk {
    len: usize,
    offset: usize,
}

impl StagedChunk {
    /// Stages a fragment of `len` bytes, starting at its beginning.
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len > 0, "staged fragments must not be empty");
        Self { len, offset: 0 }
    }

    /// Offset of the next unread byte.
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet handed out.
    pub(crate) fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Marks `n` more bytes as handed out.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.offset += n.min(self.remaining());
    }

    /// Returns `true` once every byte has been handed out.
    pub(crate) fn is_drained(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk() {
        let chunk = StagedChunk::new(10);
        assert_eq!(chunk.offset(), 0);
        assert_eq!(chunk.remaining(), 10);
        assert!(!chunk.is_drained());
    }

    #[test]
    fn test_advance_until_drained() {
        let mut chunk = StagedChunk::new(10);
        chunk.advance(4);
        assert_eq!(chunk.offset(), 4);
        assert_eq!(chunk.remaining(), 6);

        chunk.advance(6);
        assert!(chunk.is_drained());
        assert_eq!(chunk.offset(), 10);
    }
}
