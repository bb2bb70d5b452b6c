//! File Transfer Module
//!
//! Tracks the recorder's file catalog and at most one active download.
//! Everything here is driven by decoded responses; the caller owns the
//! write path.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::models::{EngineEvent, FileDescriptor, MessageSeverity, StatusMessage};
use crate::domain::transfer::{FileTransferSession, TransferError};
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::responses::{FileChunk, FileListPage};

/// Requested byte range awaiting the device's acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    start: u32,
    end: u32,
}

#[derive(Default)]
struct TransferState {
    catalog: Vec<FileDescriptor>,
    pending: HashMap<u32, PendingRequest>,
    active: Option<FileTransferSession>,
    completed: Option<FileTransferSession>,
}

pub struct FileTransferEngine {
    state: Mutex<TransferState>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl FileTransferEngine {
    pub fn new(event_sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(TransferState::default()),
            event_sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a download request and build the command for it. The session
    /// itself is created when the device acknowledges.
    pub fn request_file(&self, session_id: u32, start: u32, end: u32) -> Command {
        info!("Requesting file {} [{}, {})", session_id, start, end);
        self.lock()
            .pending
            .insert(session_id, PendingRequest { start, end });
        Command::SyncFile {
            session_id,
            start,
            end,
            no_header: false,
        }
    }

    /// A zero status opens the session, superseding the active one. Any
    /// other status fails only the request it answers.
    pub fn handle_sync_ack(&self, session_id: u32, status: u8) {
        let mut state = self.lock();
        let pending = state.pending.remove(&session_id);

        if status != 0 {
            drop(state);
            error!("Sync of {} rejected with status {}", session_id, status);
            self.emit(EngineEvent::TransferFailed {
                session_id,
                reason: format!("device rejected sync (status {})", status),
            });
            self.send_log(
                &format!("Recorder refused to send {} (status {})", session_id, status),
                MessageSeverity::Error,
            );
            return;
        }

        let expected = match state.catalog.iter().find(|f| f.session_id == session_id) {
            Some(file) => file.file_size,
            None => match pending {
                Some(p) => {
                    debug!("File {} not catalogued, sizing from requested range", session_id);
                    p.end.saturating_sub(p.start)
                }
                None => {
                    warn!("Unexpected sync acknowledgment for {}", session_id);
                    0
                }
            },
        };

        if let Some(previous) = state.active.take() {
            if !previous.is_complete() && !previous.is_cancelled() {
                warn!(
                    "Transfer {} superseded by {}",
                    previous.session_id(),
                    session_id
                );
            }
        }
        state.active = Some(FileTransferSession::new(session_id, expected));
        drop(state);

        info!("Transfer {} started, expecting {} bytes", session_id, expected);
        self.emit(EngineEvent::TransferStarted {
            session_id,
            expected_size: expected,
        });
    }

    pub fn handle_chunk(&self, chunk: FileChunk) {
        if chunk.data.len() < chunk.declared_size as usize {
            warn!(
                "Chunk for {} at {} truncated: {} of {} bytes",
                chunk.session_id,
                chunk.offset,
                chunk.data.len(),
                chunk.declared_size
            );
        }

        let mut state = self.lock();
        let Some(session) = state
            .active
            .as_mut()
            .filter(|s| s.session_id() == chunk.session_id)
        else {
            warn!(
                "Dropping chunk for inactive session {} (offset {})",
                chunk.session_id, chunk.offset
            );
            return;
        };

        let before = session.progress();
        match session.write_chunk(chunk.offset, &chunk.data) {
            Ok(progress) => {
                drop(state);
                if progress > before {
                    self.emit(EngineEvent::TransferProgress {
                        session_id: chunk.session_id,
                        progress,
                    });
                }
            }
            Err(TransferError::Cancelled(id)) => {
                debug!("Dropping chunk for cancelled session {}", id);
            }
            Err(TransferError::NotReceiving(id)) => {
                debug!("Dropping chunk for finished session {}", id);
            }
            Err(e @ TransferError::OutOfBounds { .. }) => {
                error!("{}", e);
                if let Some(mut failed) = state.active.take() {
                    failed.discard();
                }
                drop(state);
                self.emit(EngineEvent::TransferFailed {
                    session_id: chunk.session_id,
                    reason: e.to_string(),
                });
                self.send_log(
                    &format!("Download of {} aborted: {}", chunk.session_id, e),
                    MessageSeverity::Error,
                );
            }
        }
    }

    pub fn handle_sync_end(&self, session_id: u32, crc: u16) {
        let mut state = self.lock();
        let is_active = state
            .active
            .as_ref()
            .is_some_and(|s| s.session_id() == session_id);
        if !is_active {
            warn!("Sync end for inactive session {}", session_id);
            return;
        }
        let Some(mut session) = state.active.take() else {
            return;
        };

        if let Err(e) = session.finalize(crc) {
            debug!("Sync end ignored: {}", e);
            state.active = Some(session);
            return;
        }
        if !session.is_fully_covered() {
            warn!(
                "Transfer {} finished with gaps ({} of {} bytes received)",
                session_id,
                session.received_bytes(),
                session.expected_size()
            );
        }

        let size = session.expected_size();
        state.completed = Some(session);
        drop(state);

        info!("Transfer {} complete ({} bytes, crc {:#06x})", session_id, size, crc);
        self.emit(EngineEvent::TransferProgress {
            session_id,
            progress: 100,
        });
        self.emit(EngineEvent::TransferCompleted {
            session_id,
            size,
            crc,
        });
        self.send_log(
            &format!("Downloaded recording {}", session_id),
            MessageSeverity::Success,
        );
    }

    /// Device acknowledged a stop: drop whatever was in flight.
    pub fn handle_stop_sync(&self) {
        let mut state = self.lock();
        state.pending.clear();
        let Some(mut session) = state.active.take() else {
            debug!("Stop sync with no active transfer");
            return;
        };
        drop(state);

        if !session.is_cancelled() {
            session.cancel();
            self.emit(EngineEvent::TransferCancelled {
                session_id: session.session_id(),
            });
        }
        info!("Transfer {} stopped", session.session_id());
    }

    /// Cancel locally ahead of the device's acknowledgment. The session stays
    /// registered so stray chunks are recognised and dropped. Returns whether
    /// anything was in flight.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        let had_pending = !state.pending.is_empty();
        state.pending.clear();
        let cancelled = match state.active.as_mut() {
            Some(session) if !session.is_complete() && !session.is_cancelled() => {
                session.cancel();
                Some(session.session_id())
            }
            _ => None,
        };
        drop(state);

        if let Some(session_id) = cancelled {
            info!("Transfer {} cancelled", session_id);
            self.emit(EngineEvent::TransferCancelled { session_id });
        }
        had_pending || cancelled.is_some()
    }

    /// A page starting at index 0 replaces the catalog; later pages append.
    pub fn handle_file_list(&self, page: FileListPage) {
        let mut state = self.lock();
        if page.start == 0 {
            state.catalog.clear();
        }
        for item in page.items {
            match state
                .catalog
                .iter_mut()
                .find(|f| f.session_id == item.session_id)
            {
                Some(existing) => *existing = item,
                None => state.catalog.push(item),
            }
        }
        let files = state.catalog.clone();
        drop(state);

        debug!(
            "File list page at {}: {} of {} files known",
            page.start,
            files.len(),
            page.total
        );
        self.emit(EngineEvent::FilesUpdated(files));
    }

    pub fn handle_delete_confirm(&self, session_id: u32) {
        let mut state = self.lock();
        let before = state.catalog.len();
        state.catalog.retain(|f| f.session_id != session_id);
        let removed = state.catalog.len() != before;
        let files = state.catalog.clone();
        drop(state);

        if removed {
            info!("Recording {} deleted", session_id);
        } else {
            debug!("Delete confirmed for unknown recording {}", session_id);
        }
        self.emit(EngineEvent::FilesUpdated(files));
    }

    /// Forget all transfer state after the link goes away.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.catalog.clear();
        let interrupted = state
            .active
            .take()
            .filter(|s| !s.is_complete() && !s.is_cancelled())
            .map(|s| s.session_id());
        drop(state);

        if let Some(session_id) = interrupted {
            warn!("Transfer {} interrupted by disconnect", session_id);
            self.emit(EngineEvent::TransferFailed {
                session_id,
                reason: "connection lost".to_string(),
            });
        }
    }

    pub fn files(&self) -> Vec<FileDescriptor> {
        self.lock().catalog.clone()
    }

    /// Session id and progress of the download in flight.
    pub fn active_progress(&self) -> Option<(u32, u8)> {
        self.lock()
            .active
            .as_ref()
            .filter(|s| !s.is_cancelled())
            .map(|s| (s.session_id(), s.progress()))
    }

    pub fn completed_file(&self, session_id: u32) -> Option<Vec<u8>> {
        self.lock()
            .completed
            .as_ref()
            .filter(|s| s.session_id() == session_id)
            .map(|s| s.data().to_vec())
    }

    pub fn take_completed(&self) -> Option<(u32, Vec<u8>)> {
        self.lock()
            .completed
            .take()
            .map(|s| (s.session_id(), s.into_data()))
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(EngineEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (FileTransferEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FileTransferEngine::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn chunk(session_id: u32, offset: u32, data: Vec<u8>) -> FileChunk {
        FileChunk {
            session_id,
            offset,
            declared_size: data.len() as u16,
            data,
        }
    }

    fn page(start: u16, total: u16, ids: &[(u32, u32)]) -> FileListPage {
        FileListPage {
            uid: 0,
            total,
            start,
            items: ids
                .iter()
                .map(|&(session_id, file_size)| FileDescriptor {
                    session_id,
                    file_size,
                    attr: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn ack_sizes_session_from_catalog() {
        let (engine, mut rx) = engine();
        engine.handle_file_list(page(0, 1, &[(42, 1000)]));
        let _ = drain(&mut rx);

        let cmd = engine.request_file(42, 0, 0);
        assert_eq!(
            cmd,
            Command::SyncFile {
                session_id: 42,
                start: 0,
                end: 0,
                no_header: false
            }
        );
        engine.handle_sync_ack(42, 0);

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::TransferStarted {
                session_id: 42,
                expected_size: 1000
            }]
        ));
        assert_eq!(engine.active_progress(), Some((42, 0)));
    }

    #[test]
    fn ack_falls_back_to_requested_range() {
        let (engine, mut rx) = engine();
        engine.request_file(7, 100, 350);
        engine.handle_sync_ack(7, 0);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::TransferStarted {
                session_id: 7,
                expected_size: 250
            }]
        ));
    }

    #[test]
    fn reverse_order_chunks_complete_the_file() {
        let (engine, mut rx) = engine();
        let original: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        engine.request_file(42, 0, 1000);
        engine.handle_sync_ack(42, 0);

        engine.handle_chunk(chunk(42, 500, original[500..].to_vec()));
        engine.handle_chunk(chunk(42, 0, original[..500].to_vec()));
        engine.handle_sync_end(42, 0x1234);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TransferCompleted {
                session_id: 42,
                size: 1000,
                crc: 0x1234
            }
        )));
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::TransferProgress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));

        assert_eq!(engine.completed_file(42), Some(original.clone()));
        assert_eq!(engine.active_progress(), None);
        assert_eq!(engine.take_completed(), Some((42, original)));
        assert_eq!(engine.take_completed(), None);
    }

    #[test]
    fn chunk_without_session_is_dropped() {
        let (engine, mut rx) = engine();
        engine.handle_chunk(chunk(99, 0, vec![1, 2, 3]));
        assert!(drain(&mut rx).is_empty());

        engine.request_file(5, 0, 10);
        engine.handle_sync_ack(5, 0);
        let _ = drain(&mut rx);
        engine.handle_chunk(chunk(99, 0, vec![1, 2, 3]));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.active_progress(), Some((5, 0)));
    }

    #[test]
    fn out_of_bounds_chunk_aborts_only_the_transfer() {
        let (engine, mut rx) = engine();
        engine.request_file(3, 0, 10);
        engine.handle_sync_ack(3, 0);
        engine.handle_chunk(chunk(3, 0, vec![0; 4]));
        let _ = drain(&mut rx);

        engine.handle_chunk(chunk(3, 8, vec![0; 4]));

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(EngineEvent::TransferFailed { session_id: 3, .. })
        ));
        assert!(matches!(
            events.get(1),
            Some(EngineEvent::LogMessage(StatusMessage {
                severity: MessageSeverity::Error,
                ..
            }))
        ));
        assert_eq!(engine.active_progress(), None);

        // Later chunks for the failed session go nowhere
        engine.handle_chunk(chunk(3, 4, vec![0; 4]));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn local_cancel_filters_stray_chunks_until_stop_ack() {
        let (engine, mut rx) = engine();
        engine.request_file(11, 0, 100);
        engine.handle_sync_ack(11, 0);
        engine.handle_chunk(chunk(11, 0, vec![1; 40]));
        let _ = drain(&mut rx);

        assert!(engine.cancel());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::TransferCancelled { session_id: 11 }]
        ));

        engine.handle_chunk(chunk(11, 40, vec![1; 40]));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.active_progress(), None);

        engine.handle_stop_sync();
        assert!(drain(&mut rx).is_empty());
        engine.handle_sync_end(11, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.completed_file(11), None);
    }

    #[test]
    fn device_initiated_stop_discards_transfer() {
        let (engine, mut rx) = engine();
        engine.request_file(12, 0, 10);
        engine.handle_sync_ack(12, 0);
        engine.handle_chunk(chunk(12, 0, vec![1; 5]));
        let _ = drain(&mut rx);

        engine.handle_stop_sync();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::TransferCancelled { session_id: 12 }]
        ));
        engine.handle_chunk(chunk(12, 5, vec![1; 5]));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn new_ack_supersedes_previous_session() {
        let (engine, mut rx) = engine();
        engine.request_file(1, 0, 10);
        engine.handle_sync_ack(1, 0);
        engine.handle_chunk(chunk(1, 0, vec![1; 5]));
        engine.request_file(2, 0, 10);
        engine.handle_sync_ack(2, 0);
        let _ = drain(&mut rx);

        engine.handle_chunk(chunk(1, 5, vec![1; 5]));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.active_progress(), Some((2, 0)));
    }

    #[test]
    fn rejected_ack_leaves_active_download_running() {
        let (engine, mut rx) = engine();
        let original: Vec<u8> = (0..100u8).collect();
        engine.request_file(1, 0, 100);
        engine.handle_sync_ack(1, 0);
        engine.handle_chunk(chunk(1, 0, original[..50].to_vec()));
        let _ = drain(&mut rx);

        engine.request_file(2, 0, 100);
        engine.handle_sync_ack(2, 1);

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(EngineEvent::TransferFailed { session_id: 2, .. })
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::TransferStarted { .. })));
        assert_eq!(engine.active_progress(), Some((1, 50)));

        engine.handle_chunk(chunk(1, 50, original[50..].to_vec()));
        engine.handle_sync_end(1, 0);
        assert_eq!(engine.completed_file(1), Some(original));
    }

    #[test]
    fn overlapping_requests_keep_their_own_ranges() {
        let (engine, mut rx) = engine();
        engine.request_file(10, 0, 300);
        engine.request_file(11, 100, 150);

        engine.handle_sync_ack(10, 0);
        engine.handle_chunk(chunk(10, 0, vec![7; 300]));
        engine.handle_sync_end(10, 0);

        engine.handle_sync_ack(11, 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TransferStarted {
                session_id: 10,
                expected_size: 300
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::TransferStarted {
                session_id: 11,
                expected_size: 50
            }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::TransferFailed { .. })));
        assert_eq!(engine.completed_file(10), Some(vec![7; 300]));
    }

    #[test]
    fn file_list_pages_replace_then_append() {
        let (engine, _rx) = engine();
        engine.handle_file_list(page(0, 2, &[(1, 10), (2, 20)]));
        engine.handle_file_list(page(0, 9, &[(3, 30)]));
        engine.handle_file_list(page(7, 9, &[(4, 40), (3, 31)]));

        let files = engine.files();
        let ids: Vec<u32> = files.iter().map(|f| f.session_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(files[0].file_size, 31);
    }

    #[test]
    fn delete_confirm_removes_descriptor() {
        let (engine, mut rx) = engine();
        engine.handle_file_list(page(0, 2, &[(1, 10), (2, 20)]));
        let _ = drain(&mut rx);

        engine.handle_delete_confirm(1);
        engine.handle_delete_confirm(1);
        assert_eq!(engine.files().len(), 1);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn reset_fails_transfer_in_flight() {
        let (engine, mut rx) = engine();
        engine.handle_file_list(page(0, 1, &[(1, 10)]));
        engine.request_file(1, 0, 10);
        engine.handle_sync_ack(1, 0);
        let _ = drain(&mut rx);

        engine.reset();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::TransferFailed { session_id: 1, .. }]
        ));
        assert!(engine.files().is_empty());
        assert!(!engine.cancel());
    }
}
