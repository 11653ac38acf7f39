//! Puffer für ICE Candidates, die vor der Remote Description eintreffen

use super::transport::{MediaTransport, TransportError};
use crate::signaling::IceCandidate;
use std::collections::{HashMap, VecDeque};

/// FIFO-Puffer für ICE Candidates.
///
/// Dedupliziert nicht; doppelte Candidates sind Sache des Transports.
#[derive(Debug, Clone, Default)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Hängt alle Candidates aus `other` in ihrer Reihenfolge an
    pub fn append(&mut self, other: &mut IceCandidateBuffer) {
        self.queue.append(&mut other.queue);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Wendet alle gepufferten Candidates in Ankunftsreihenfolge an und leert
    /// den Puffer.
    ///
    /// Ein einzelner fehlerhafter Candidate bricht das Leeren nicht ab; die
    /// Fehler werden gesammelt zurückgegeben. Ein leerer Puffer ist ein No-op.
    pub async fn drain_into(
        &mut self,
        transport: &dyn MediaTransport,
    ) -> Vec<(IceCandidate, TransportError)> {
        let mut failures = Vec::new();
        while let Some(candidate) = self.queue.pop_front() {
            if let Err(e) = transport.add_ice_candidate(candidate.clone()).await {
                failures.push((candidate, e));
            }
        }
        failures
    }
}

// ============================================================================
// ORPHAN CANDIDATES
// ============================================================================

/// Candidates von Absendern, mit denen noch keine Session besteht.
///
/// Begrenzt auf `max_senders` Absender mit je `max_per_sender` Candidates.
/// Bei Überlauf fällt der älteste Absender bzw. der älteste Candidate weg.
#[derive(Debug)]
pub struct OrphanCandidates {
    buffers: HashMap<String, IceCandidateBuffer>,
    /// Absender in Reihenfolge ihres ersten Candidates
    order: VecDeque<String>,
    max_senders: usize,
    max_per_sender: usize,
}

impl OrphanCandidates {
    pub const DEFAULT_MAX_SENDERS: usize = 8;
    pub const DEFAULT_MAX_PER_SENDER: usize = 32;

    pub fn new(max_senders: usize, max_per_sender: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            order: VecDeque::new(),
            max_senders: max_senders.max(1),
            max_per_sender: max_per_sender.max(1),
        }
    }

    pub fn enqueue(&mut self, from: &str, candidate: IceCandidate) {
        if !self.buffers.contains_key(from) {
            if self.order.len() >= self.max_senders {
                if let Some(oldest) = self.order.pop_front() {
                    self.buffers.remove(&oldest);
                    tracing::debug!("Dropped buffered ICE candidates of '{}'", oldest);
                }
            }
            self.order.push_back(from.to_string());
        }

        let buffer = self.buffers.entry(from.to_string()).or_default();
        if buffer.len() >= self.max_per_sender {
            buffer.queue.pop_front();
            tracing::debug!("ICE candidate buffer of '{}' full, dropped oldest", from);
        }
        buffer.enqueue(candidate);
    }

    /// Entnimmt die Candidates von `from` für eine neue Session
    pub fn take(&mut self, from: &str) -> Option<IceCandidateBuffer> {
        let buffer = self.buffers.remove(from)?;
        self.order.retain(|sender| sender != from);
        Some(buffer)
    }

    /// Verwirft die Candidates von `from`; `true`, falls welche gepuffert waren
    pub fn discard(&mut self, from: &str) -> bool {
        self.take(from).is_some()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.order.clear();
    }

    pub fn senders(&self) -> usize {
        self.buffers.len()
    }

    pub fn pending_for(&self, from: &str) -> usize {
        self.buffers.get(from).map_or(0, IceCandidateBuffer::len)
    }
}

impl Default for OrphanCandidates {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SENDERS, Self::DEFAULT_MAX_PER_SENDER)
    }
}

// ============================================================================
// TESTS
// ============================================================================
