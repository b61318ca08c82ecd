//! Event types for run progress

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Which half of a unit's lifecycle an event refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Execute,
    Verify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Verify => "verify",
        }
    }
}

/// All possible events during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A step, batch or fan-out began one half of its lifecycle
    #[serde(rename = "step.started")]
    StepStarted { step: String, stage: Stage },

    /// A step, batch or fan-out finished one half of its lifecycle
    #[serde(rename = "step.finished")]
    StepFinished {
        step: String,
        stage: Stage,
        /// Exceptions recorded so far by the unit
        exceptions: usize,
    },

    /// One target of a fan-out was processed
    #[serde(rename = "target.finished")]
    TargetFinished {
        action: String,
        target: String,
        stage: Stage,
        success: bool,
        error: Option<String>,
    },

    /// A child was not dispatched because the run was cancelled
    #[serde(rename = "step.skipped")]
    StepSkipped {
        parent: String,
        step: String,
        reason: String,
    },

    /// A completion monitor finished one poll
    #[serde(rename = "monitor.polled")]
    MonitorPolled {
        monitor: String,
        pending: usize,
        succeeded: usize,
        failed: usize,
    },

    /// A completion monitor reached a terminal state
    #[serde(rename = "monitor.resolved")]
    MonitorResolved {
        monitor: String,
        state: String,
        elapsed_ms: u64,
    },

    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Name of the step or monitor this event is about, if any
    pub fn subject(&self) -> Option<&str> {
        match self {
            Event::StepStarted { step, .. } => Some(step),
            Event::StepFinished { step, .. } => Some(step),
            Event::TargetFinished { action, .. } => Some(action),
            Event::StepSkipped { step, .. } => Some(step),
            Event::MonitorPolled { monitor, .. } => Some(monitor),
            Event::MonitorResolved { monitor, .. } => Some(monitor),
            Event::Error { .. } => None,
        }
    }
}
