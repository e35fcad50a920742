//! Side-channel progress reporting.
//!
//! Tool, plan and orchestration events do not touch the tree; they are
//! forwarded to a host-provided [`ProgressSink`]. Every method defaults to
//! a no-op so hosts implement only what they display.

use serde_json::Value;

use crate::protocol::{OrchestrationEvent, OrchestrationKind, Plan, StreamEvent, ToolProgress};

pub trait ProgressSink: Send {
    fn set_tool_progress(&mut self, _progress: &ToolProgress) {}

    fn set_plan_created(&mut self, _plan: &Plan) {}

    fn set_level_started(&mut self, _event: &OrchestrationEvent) {}

    fn set_step_started(&mut self, _event: &OrchestrationEvent) {}

    fn set_subtask_started(&mut self, _event: &OrchestrationEvent) {}

    fn set_step_done(&mut self, _event: &OrchestrationEvent) {}

    fn set_subtask_done(&mut self, _event: &OrchestrationEvent) {}

    fn set_level_completed(&mut self, _event: &OrchestrationEvent) {}

    fn set_orchestration_done(&mut self, _event: &OrchestrationEvent) {}

    fn set_document_index(&mut self, _component: &Value) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Route a progress event to the sink. Returns `false` for events that are
/// not progress events.
pub fn forward(sink: &mut dyn ProgressSink, event: &StreamEvent) -> bool {
    match event {
        StreamEvent::ToolProgress(progress) => sink.set_tool_progress(progress),
        StreamEvent::PlanCreated(plan) => sink.set_plan_created(plan),
        StreamEvent::DocumentIndex(component) => sink.set_document_index(component),
        StreamEvent::Orchestration(ev) => match ev.kind {
            OrchestrationKind::LevelStarted => sink.set_level_started(ev),
            OrchestrationKind::StepStarted => sink.set_step_started(ev),
            OrchestrationKind::SubtaskStarted => sink.set_subtask_started(ev),
            OrchestrationKind::StepDone => sink.set_step_done(ev),
            OrchestrationKind::SubtaskDone => sink.set_subtask_done(ev),
            OrchestrationKind::LevelCompleted => sink.set_level_completed(ev),
            OrchestrationKind::OrchestrationDone => sink.set_orchestration_done(ev),
        },
        _ => return false,
    }
    true
}
