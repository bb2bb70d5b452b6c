//! Reassembly of one chunked file download.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("chunk [{offset}, {end}) exceeds expected size {expected} of session {session_id}")]
    OutOfBounds {
        session_id: u32,
        offset: u32,
        end: u64,
        expected: u32,
    },
    #[error("session {0} was cancelled")]
    Cancelled(u32),
    #[error("session {0} is not receiving")]
    NotReceiving(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct FileTransferSession {
    session_id: u32,
    expected_size: u32,
    buffer: Vec<u8>,
    /// Sorted, non-overlapping, non-adjacent half-open ranges
    received: Vec<(u32, u32)>,
    progress: u8,
    state: TransferState,
    crc: Option<u16>,
}

impl FileTransferSession {
    pub fn new(session_id: u32, expected_size: u32) -> Self {
        Self {
            session_id,
            expected_size,
            buffer: vec![0; expected_size as usize],
            received: Vec::new(),
            progress: 0,
            state: TransferState::Receiving,
            crc: None,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TransferState::Cancelled
    }

    pub fn crc(&self) -> Option<u16> {
        self.crc
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buffer
    }

    /// Copies `data` to `offset` and returns the progress to report.
    ///
    /// A chunk reaching past the expected size is rejected before anything
    /// is written and moves the session to `Failed`.
    pub fn write_chunk(&mut self, offset: u32, data: &[u8]) -> Result<u8, TransferError> {
        match self.state {
            TransferState::Receiving => {}
            TransferState::Cancelled => return Err(TransferError::Cancelled(self.session_id)),
            _ => return Err(TransferError::NotReceiving(self.session_id)),
        }

        let end = offset as u64 + data.len() as u64;
        if end > self.expected_size as u64 {
            self.state = TransferState::Failed;
            return Err(TransferError::OutOfBounds {
                session_id: self.session_id,
                offset,
                end,
                expected: self.expected_size,
            });
        }

        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        if !data.is_empty() {
            self.mark_received(offset, end as u32);
        }

        if self.expected_size > 0 {
            let expected = self.expected_size as u64;
            let pct = ((200 * end + expected) / (2 * expected)).min(100) as u8;
            self.progress = self.progress.max(pct);
        }
        Ok(self.progress)
    }

    fn mark_received(&mut self, start: u32, end: u32) {
        let mut merged_start = start;
        let mut merged_end = end;
        let mut kept = Vec::with_capacity(self.received.len() + 1);

        for &(s, e) in &self.received {
            if e < merged_start || s > merged_end {
                kept.push((s, e));
            } else {
                merged_start = merged_start.min(s);
                merged_end = merged_end.max(e);
            }
        }
        kept.push((merged_start, merged_end));
        kept.sort_unstable();
        self.received = kept;
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.iter().map(|(s, e)| (e - s) as u64).sum()
    }

    pub fn is_fully_covered(&self) -> bool {
        self.expected_size == 0 || self.received == [(0, self.expected_size)]
    }

    /// Seals the session. Coverage gaps are left to the caller to judge.
    pub fn finalize(&mut self, crc: u16) -> Result<(), TransferError> {
        match self.state {
            TransferState::Receiving | TransferState::Completed => {
                self.state = TransferState::Completed;
                self.progress = 100;
                self.crc = Some(crc);
                Ok(())
            }
            TransferState::Cancelled => Err(TransferError::Cancelled(self.session_id)),
            TransferState::Failed => Err(TransferError::NotReceiving(self.session_id)),
        }
    }

    /// Drops the buffer; later chunks are refused.
    pub fn cancel(&mut self) {
        self.state = TransferState::Cancelled;
        self.buffer = Vec::new();
        self.received.clear();
    }

    /// Drops the buffer after a failure.
    pub fn discard(&mut self) {
        self.buffer = Vec::new();
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    /// Every ordering of `0..n`, by Heap's algorithm.
    fn permutations(n: usize) -> Vec<Vec<usize>> {
        fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            heap(k - 1, items, out);
            for i in 0..k - 1 {
                let j = if k % 2 == 0 { i } else { 0 };
                items.swap(j, k - 1);
                heap(k - 1, items, out);
            }
        }
        let mut out = Vec::new();
        heap(n, &mut (0..n).collect(), &mut out);
        out
    }

    #[test]
    fn any_chunk_order_reassembles_the_file() {
        let original = source(20);
        let chunks = [(0usize, 6usize), (6, 11), (11, 12), (12, 20)];
        let orders = permutations(chunks.len());
        let distinct: std::collections::HashSet<_> = orders.iter().collect();
        assert_eq!(distinct.len(), 24);

        for order in orders {
            let mut session = FileTransferSession::new(9, 20);
            for idx in order {
                let (s, e) = chunks[idx];
                assert!(!session.is_fully_covered());
                session.write_chunk(s as u32, &original[s..e]).unwrap();
            }
            assert!(session.is_fully_covered());
            assert_eq!(session.received_bytes(), 20);
            assert_eq!(session.data(), original.as_slice());
        }
    }

    #[test]
    fn retransmitted_overlapping_chunks_are_idempotent() {
        let original = source(10);
        let mut session = FileTransferSession::new(1, 10);
        session.write_chunk(2, &original[2..8]).unwrap();
        session.write_chunk(0, &original[0..4]).unwrap();
        session.write_chunk(2, &original[2..8]).unwrap();
        assert!(!session.is_fully_covered());
        session.write_chunk(7, &original[7..10]).unwrap();

        assert!(session.is_fully_covered());
        assert_eq!(session.data(), original.as_slice());
    }

    #[test]
    fn out_of_bounds_chunk_fails_session_without_touching_buffer() {
        let mut session = FileTransferSession::new(5, 8);
        session.write_chunk(0, &[1, 2, 3, 4]).unwrap();

        let err = session.write_chunk(6, &[9, 9, 9]).unwrap_err();
        assert_eq!(
            err,
            TransferError::OutOfBounds {
                session_id: 5,
                offset: 6,
                end: 9,
                expected: 8
            }
        );
        assert_eq!(session.state(), TransferState::Failed);
        assert_eq!(session.data(), &[1, 2, 3, 4, 0, 0, 0, 0]);

        // Nothing more is accepted once failed
        assert_eq!(
            session.write_chunk(4, &[5]),
            Err(TransferError::NotReceiving(5))
        );
    }

    #[test]
    fn offset_overflow_is_out_of_bounds() {
        let mut session = FileTransferSession::new(5, 8);
        assert!(matches!(
            session.write_chunk(u32::MAX, &[1]),
            Err(TransferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut session = FileTransferSession::new(42, 1000);
        assert_eq!(session.write_chunk(500, &[0; 500]).unwrap(), 100);
        assert_eq!(session.write_chunk(0, &[0; 500]).unwrap(), 100);

        let mut session = FileTransferSession::new(43, 3);
        assert_eq!(session.write_chunk(0, &[0]).unwrap(), 33);
        assert_eq!(session.write_chunk(1, &[0]).unwrap(), 67);
    }

    #[test]
    fn empty_file_is_trivially_covered() {
        let mut session = FileTransferSession::new(7, 0);
        assert!(session.is_fully_covered());
        assert_eq!(session.write_chunk(0, &[]).unwrap(), 0);
        assert!(session.write_chunk(0, &[1]).is_err());

        let mut session = FileTransferSession::new(7, 0);
        session.finalize(0).unwrap();
        assert_eq!(session.progress(), 100);
        assert!(session.data().is_empty());
    }

    #[test]
    fn cancelled_session_refuses_chunks_and_finalize() {
        let mut session = FileTransferSession::new(3, 4);
        session.write_chunk(0, &[1, 2]).unwrap();
        session.cancel();

        assert!(session.is_cancelled());
        assert!(session.data().is_empty());
        assert_eq!(session.write_chunk(2, &[3, 4]), Err(TransferError::Cancelled(3)));
        assert_eq!(session.finalize(0), Err(TransferError::Cancelled(3)));
    }

    #[test]
    fn finalize_forces_full_progress_and_keeps_buffer() {
        let mut session = FileTransferSession::new(3, 4);
        session.write_chunk(0, &[1, 2, 3, 4]).unwrap();
        session.finalize(0xBEEF).unwrap();

        assert!(session.is_complete());
        assert_eq!(session.progress(), 100);
        assert_eq!(session.crc(), Some(0xBEEF));
        assert_eq!(session.into_data(), vec![1, 2, 3, 4]);
    }
}
