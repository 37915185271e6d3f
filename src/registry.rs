//! Active rounds and bounded history, keyed by game kind

use crate::engine::RoundHandle;
use crate::errors::{EngineError, EngineResult};
use crate::games::types::GameKind;
use crate::round::RoundView;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

pub struct RoundRegistry {
    active: DashMap<GameKind, RoundHandle>,
    /// Finished rounds, newest first
    history: DashMap<GameKind, VecDeque<RoundView>>,
    history_limit: usize,
}

impl RoundRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            active: DashMap::new(),
            history: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Installs `handle` as the active round of its kind.
    ///
    /// Fails while another round of the same kind is unfinished; a finished one
    /// is moved to history first.
    pub fn activate(&self, handle: RoundHandle) -> EngineResult<()> {
        let kind = handle.kind();
        let retired = match self.active.entry(kind) {
            Entry::Occupied(mut existing) => {
                let current = existing.get().snapshot();
                if !current.is_finished() {
                    return Err(EngineError::RoundAlreadyActive {
                        kind,
                        round_id: current.round_id,
                    });
                }
                existing.insert(handle);
                Some(current)
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                None
            }
        };

        if let Some(view) = retired {
            self.push_history(view);
        }
        Ok(())
    }

    fn push_history(&self, view: RoundView) {
        debug!(kind = %view.kind, round_id = view.round_id, phase = %view.phase, "round retired");
        let mut rounds = self.history.entry(view.kind).or_default();
        rounds.push_front(view);
        rounds.truncate(self.history_limit);
    }

    /// Moves the active round of `kind` to history if it is finished
    pub fn retire_finished(&self, kind: GameKind) -> Option<RoundView> {
        let (_, handle) = self
            .active
            .remove_if(&kind, |_, handle| handle.snapshot().is_finished())?;
        let view = handle.snapshot();
        self.push_history(view.clone());
        Some(view)
    }

    pub fn active_round(&self, kind: GameKind) -> Option<RoundView> {
        self.active.get(&kind).map(|h| h.snapshot())
    }

    /// Handle of the active round, if it has the given id
    pub fn handle(&self, kind: GameKind, round_id: u64) -> Option<RoundHandle> {
        self.active
            .get(&kind)
            .filter(|h| h.round_id() == round_id)
            .map(|h| h.clone())
    }

    /// Terminal rounds of `kind`, newest first
    pub fn history(&self, kind: GameKind, limit: usize) -> Vec<RoundView> {
        self.history
            .get(&kind)
            .map(|rounds| rounds.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Looks a round up among the active one and the retained history
    pub fn find(&self, kind: GameKind, round_id: u64) -> Option<RoundView> {
        if let Some(handle) = self.handle(kind, round_id) {
            return Some(handle.snapshot());
        }
        self.history.get(&kind).and_then(|rounds| {
            rounds
                .iter()
                .find(|view| view.round_id == round_id)
                .cloned()
        })
    }
}
