use std::io::IoSlice;

use bytes::Bytes;

/// Upper bound on the slices handed to a single vectored write
const MAX_IO_SLICES: usize = 64;

/// One write submitted to a [`Connection`](super::Connection).
///
/// The request owns its buffers until the write completes and hands them back,
/// untouched, through [`ConnectionHandler::on_write`](crate::handler::ConnectionHandler::on_write).
/// Write progress is tracked separately, so a partially written request still
/// returns the original buffers.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    bufs: Vec<Bytes>,
    index: usize,
    offset: usize,
}

impl WriteRequest {
    pub fn new(buf: Bytes) -> Self {
        Self::vectored(vec![buf])
    }

    /// Two buffers written back to back, as one request.
    pub fn two(first: Bytes, second: Bytes) -> Self {
        Self::vectored(vec![first, second])
    }

    pub fn vectored(bufs: Vec<Bytes>) -> Self {
        let mut req = Self { bufs, index: 0, offset: 0 };
        req.skip_drained();
        req
    }

    #[inline]
    pub fn bufs(&self) -> &[Bytes] {
        &self.bufs
    }

    #[inline]
    pub fn into_bufs(self) -> Vec<Bytes> {
        self.bufs
    }

    pub fn total_len(&self) -> usize {
        self.bufs.iter().map(Bytes::len).sum()
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.bufs[self.index..].iter().map(Bytes::len).sum::<usize>() - self.offset
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.index < self.bufs.len()
    }

    pub(crate) fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity((self.bufs.len() - self.index).min(MAX_IO_SLICES));
        for (i, buf) in self.bufs[self.index..].iter().take(MAX_IO_SLICES).enumerate() {
            let start = if i == 0 { self.offset } else { 0 };
            slices.push(IoSlice::new(&buf[start..]));
        }
        slices
    }

    /// Records that `n` more bytes were written.
    pub(crate) fn advance(&mut self, mut n: usize) {
        while n > 0 && self.index < self.bufs.len() {
            let left = self.bufs[self.index].len() - self.offset;
            if n < left {
                self.offset += n;
                return;
            }
            n -= left;
            self.index += 1;
            self.offset = 0;
        }
        self.skip_drained();
    }

    fn skip_drained(&mut self) {
        while self.index < self.bufs.len() && self.bufs[self.index].len() == self.offset {
            self.index += 1;
            self.offset = 0;
        }
    }
}

impl From<Bytes> for WriteRequest {
    fn from(buf: Bytes) -> Self {
        Self::new(buf)
    }
}

impl From<Vec<Bytes>> for WriteRequest {
    fn from(bufs: Vec<Bytes>) -> Self {
        Self::vectored(bufs)
    }
}
