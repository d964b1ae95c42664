//! Per-session fan-in buffer for inbound round sub-messages.
//!
//! Owned by the session entry and only touched under the session's mutex.
//! Deposits are idempotent on (round, source): a second deposit from the
//! same source is dropped, and sources outside the expected set are ignored
//! entirely.

use std::collections::BTreeMap;
use tss_types::ParticipantId;

/// What happened to a deposit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deposit {
    Stored,
    /// Same source already deposited for this round; dropped silently.
    Duplicate,
    /// Source is not in the expected set for this round; ignored.
    Unexpected,
}

#[derive(Debug, Default)]
pub struct RoundBuffer {
    rounds: BTreeMap<u16, BTreeMap<ParticipantId, String>>,
}

impl RoundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(
        &mut self,
        round: u16,
        from: ParticipantId,
        payload: String,
        expected: &[ParticipantId],
    ) -> Deposit {
        if !expected.contains(&from) {
            return Deposit::Unexpected;
        }
        let entries = self.rounds.entry(round).or_default();
        if entries.contains_key(&from) {
            return Deposit::Duplicate;
        }
        entries.insert(from, payload);
        Deposit::Stored
    }

    /// True once every expected source has deposited for `round`.
    pub fn is_complete(&self, round: u16, expected: &[ParticipantId]) -> bool {
        match self.rounds.get(&round) {
            Some(entries) => expected.iter().all(|id| entries.contains_key(id)),
            None => expected.is_empty(),
        }
    }

    /// Remove and return the round's sub-messages ordered by source id.
    pub fn drain(&mut self, round: u16) -> Vec<(ParticipantId, String)> {
        self.rounds
            .remove(&round)
            .map(|entries| entries.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop everything (session reached a terminal state).
    pub fn discard(&mut self) {
        self.rounds.clear();
    }
}
