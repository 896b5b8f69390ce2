use super::Stage;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Init,
    IntervalsComputed,
    Running(Stage),
    Done,
    Failed(Stage),
}

/// Per-run lifecycle: `Init → IntervalsComputed → Running(..)* → Done`, or
/// `Failed(stage)` from whichever stage could not complete.
#[derive(Debug)]
pub struct StateMachine {
    current: WorkflowState,
    history: Vec<WorkflowState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: WorkflowState::Init,
            history: vec![WorkflowState::Init],
        }
    }

    pub fn current(&self) -> WorkflowState {
        self.current
    }

    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    pub fn can_advance(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (self.current, next) {
            (Init, IntervalsComputed) => true,
            (IntervalsComputed, Running(_) | Done) => true,
            // stages only move forward in dependency order
            (Running(a), Running(b)) => b > a,
            (Running(_), Done) => true,
            (Running(a), Failed(b)) => a == b,
            _ => false,
        }
    }

    /// Moves to `next` if the transition is legal. Illegal transitions are
    /// logged and leave the state untouched.
    pub fn advance(&mut self, next: WorkflowState) -> bool {
        if !self.can_advance(next) {
            warn!(from = ?self.current, to = ?next, "Illegal workflow transition ignored");
            return false;
        }
        debug!(from = ?self.current, to = ?next, "workflow transition");
        self.current = next;
        self.history.push(next);
        true
    }

    /// Marks the running stage as failed. No-op outside a stage.
    pub fn fail(&mut self) -> Option<Stage> {
        match self.current {
            WorkflowState::Running(stage) => {
                self.advance(WorkflowState::Failed(stage));
                Some(stage)
            }
            _ => None,
        }
    }
}
