use crate::error::L1Error;

/// Literal closing tag that ends one controller batch on the wire.
pub const BATCH_END_MARKER: &[u8] = b"</Commands>";

/// Accumulates controller bytes until a complete batch is present.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_len,
        }
    }

    /// Append `bytes`; returns a complete batch once the closing marker has
    /// fully arrived.
    ///
    /// The returned frame runs up to and including the marker. Anything after
    /// it is kept as the start of the next batch.
    ///
    /// # Errors
    ///
    /// Returns `L1Error::FrameTooLarge` when the pending buffer grows past the
    /// configured limit without a marker; the buffer is discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, L1Error> {
        // only the tail that could still hold a split marker needs rescanning
        let scan_from = self.buf.len().saturating_sub(BATCH_END_MARKER.len() - 1);
        self.buf.extend_from_slice(bytes);

        if let Some(pos) = find(&self.buf[scan_from..], BATCH_END_MARKER) {
            let end = scan_from + pos + BATCH_END_MARKER.len();
            let frame: Vec<u8> = self.buf.drain(..end).collect();
            return Ok(Some(frame));
        }
        if self.buf.len() > self.max_len {
            self.buf.clear();
            return Err(L1Error::FrameTooLarge {
                limit: self.max_len,
            });
        }
        Ok(None)
    }

    /// Take a further complete batch already sitting in the buffer, if any.
    pub fn next_buffered(&mut self) -> Option<Vec<u8>> {
        let pos = find(&self.buf, BATCH_END_MARKER)?;
        let end = pos + BATCH_END_MARKER.len();
        Some(self.buf.drain(..end).collect())
    }

    /// Bytes received but not yet part of a complete batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial batch.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
