//! Trace events for auditing executed DDL.
//!
//! The engine reports every step it attempts to a [`TraceListener`],
//! synchronously and in execution order, before the run commits or rolls
//! back.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::step::StepKind;

/// Result of one attempted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    /// Every statement of the step succeeded.
    Success,
    /// A statement failed and the run is being rolled back.
    Error,
    /// The step was planned during a dry run and not executed.
    Planned,
}

/// Record of one attempted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    /// Kind of step.
    pub step_kind: StepKind,
    /// Table the step applies to.
    pub table_name: String,
    /// Statements executed, the failing one included. For planned steps,
    /// the statements that would run.
    pub statements: Vec<String>,
    /// Whether the step succeeded.
    pub outcome: StepOutcome,
    /// Description of the failure, if any.
    pub error_detail: Option<String>,
}

impl TraceEvent {
    /// Returns true if the step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

/// Receives trace events.
pub trait TraceListener: Send + Sync {
    /// Called once per attempted step.
    fn on_step(&self, event: &TraceEvent);
}

impl<F> TraceListener for F
where
    F: Fn(&TraceEvent) + Send + Sync,
{
    fn on_step(&self, event: &TraceEvent) {
        self(event);
    }
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl TraceListener for NoopListener {
    fn on_step(&self, _event: &TraceEvent) {}
}

/// Listener that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl TraceListener for TracingListener {
    fn on_step(&self, event: &TraceEvent) {
        match event.outcome {
            StepOutcome::Success => info!(
                kind = %event.step_kind,
                table = %event.table_name,
                statements = event.statements.len(),
                "Step applied"
            ),
            StepOutcome::Planned => info!(
                kind = %event.step_kind,
                table = %event.table_name,
                statements = event.statements.len(),
                "Step planned"
            ),
            StepOutcome::Error => warn!(
                kind = %event.step_kind,
                table = %event.table_name,
                error = event.error_detail.as_deref().unwrap_or_default(),
                "Step failed"
            ),
        }
    }
}

/// Listener that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryListener {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryListener {
    /// Creates an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceListener for MemoryListener {
    fn on_step(&self, event: &TraceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(outcome: StepOutcome) -> TraceEvent {
        TraceEvent {
            step_kind: StepKind::CreateTable,
            table_name: "users".into(),
            statements: vec!["CREATE TABLE \"users\" (\"id\" INTEGER)".into()],
            outcome,
            error_detail: None,
        }
    }

    #[test]
    fn test_memory_listener_keeps_order() {
        let listener = MemoryListener::new();
        listener.on_step(&event(StepOutcome::Success));
        listener.on_step(&event(StepOutcome::Error));

        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_success());
        assert!(!events[1].is_success());
    }

    #[test]
    fn test_closure_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = move |_: &TraceEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        };
        listener.on_step(&event(StepOutcome::Success));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(StepOutcome::Success)).unwrap();
        assert_eq!(json["step_kind"], "CreateTable");
        assert_eq!(json["outcome"], "Success");
    }
}
