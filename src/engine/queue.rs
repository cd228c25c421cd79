//! Serialized intake queue.
//!
//! Holds received proposals waiting for a decision. The head is the proposal
//! being processed; only one is in flight at a time.

use std::collections::VecDeque;

use crate::types::ProposalId;

/// What `enqueue` did with a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Already queued; nothing changed.
    Duplicate,
    /// Queue was empty and idle; the dispatcher should start right away.
    StartNow,
    /// Waiting behind other proposals.
    Queued,
}

#[derive(Debug, Clone, Default)]
pub struct OfferQueue {
    entries: VecDeque<ProposalId>,
    processing: bool,
}

impl OfferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, id: ProposalId) -> EnqueueOutcome {
        if self.entries.contains(&id) {
            return EnqueueOutcome::Duplicate;
        }
        self.entries.push_back(id);
        if self.entries.len() == 1 && !self.processing {
            EnqueueOutcome::StartNow
        } else {
            EnqueueOutcome::Queued
        }
    }

    /// Claim the head for processing. `None` when empty or already busy.
    pub fn begin_next(&mut self) -> Option<ProposalId> {
        if self.processing {
            return None;
        }
        let head = self.entries.front().cloned()?;
        self.processing = true;
        Some(head)
    }

    /// Move the in-flight head to the tail after a transient failure.
    /// Returns `false` if it was the only entry, in which case it is dropped.
    pub fn requeue_to_tail(&mut self, id: &ProposalId) -> bool {
        self.processing = false;
        let Some(pos) = self.entries.iter().position(|e| e == id) else {
            return false;
        };
        if self.entries.len() == 1 {
            self.entries.remove(pos);
            return false;
        }
        if let Some(entry) = self.entries.remove(pos) {
            self.entries.push_back(entry);
        }
        true
    }

    /// Dequeue a finished proposal.
    pub fn finish(&mut self, id: &ProposalId) {
        self.processing = false;
        if let Some(pos) = self.entries.iter().position(|e| e == id) {
            self.entries.remove(pos);
        }
    }

    pub fn contains(&self, id: &ProposalId) -> bool {
        self.entries.contains(id)
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ProposalId> {
        self.entries.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
