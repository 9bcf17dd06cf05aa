//! Turn runner: pure navigation over a compiled plan.
//!
//! Position mutation lives here so the orchestrator never touches indices
//! directly. Every function tolerates out-of-range positions: past-the-end
//! resolves to the end of the lesson, never a panic.

use crate::plan::{LessonPlan, Step, StepType};
use crate::session::SessionState;

/// What the engine should do when it lands on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    /// Metadata or unrecognized step: advance without output.
    Skip,
    /// Presentable content: narrate it.
    Explain,
    /// Question step: enter the ask flow.
    Ask,
    /// Past the last step: close the lesson.
    End,
}

/// Maps the current step (or absence of one) to an action. Pure on the
/// step type.
pub fn decide_action(step: Option<&Step>) -> EngineAction {
    match step.map(|s| s.step_type) {
        None => EngineAction::End,
        Some(StepType::Ask) => EngineAction::Ask,
        Some(StepType::Content)
        | Some(StepType::Narration)
        | Some(StepType::Case)
        | Some(StepType::ReflectionAreas) => EngineAction::Explain,
        Some(_) => EngineAction::Skip,
    }
}

pub fn current_step<'a>(plan: &'a LessonPlan, state: &SessionState) -> Option<&'a Step> {
    plan.step(state.step_idx)
}

/// Advances one step, resyncing the moment index and the done flag.
pub fn next(plan: &LessonPlan, state: &mut SessionState) {
    let target = state.step_idx.saturating_add(1);
    advance_to(plan, state, target);
}

/// Jumps to `target`, clamped to the plan. Past-the-end marks the session
/// done and parks the position at the end.
pub fn advance_to(plan: &LessonPlan, state: &mut SessionState, target: usize) {
    if target >= plan.len() {
        state.step_idx = plan.len();
        state.moment_idx = plan.moments.len().saturating_sub(1);
        state.done = true;
        return;
    }
    state.step_idx = target;
    if let Some(step) = plan.step(target) {
        state.moment_idx = step.moment_index;
    }
    state.done = false;
}

/// The content cycle owning `step_idx`, if any. A content step owns its own
/// cycle; an ask step belongs to the cycle listing it.
pub fn cycle_index_for_step(plan: &LessonPlan, step_idx: usize) -> Option<usize> {
    plan.content_cycles.iter().position(|c| {
        c.content_step_index == Some(step_idx) || c.ask_step_indices.contains(&step_idx)
    })
}

/// Next ask after `step_idx` inside the same cycle. From the cycle's
/// content step this is the cycle's first ask.
pub fn next_ask_in_same_cycle(plan: &LessonPlan, step_idx: usize) -> Option<usize> {
    let cycle = &plan.content_cycles[cycle_index_for_step(plan, step_idx)?];
    cycle
        .ask_step_indices
        .iter()
        .copied()
        .find(|&i| i > step_idx)
}

/// First ask of the cycle after the one owning `step_idx`.
pub fn first_ask_of_next_cycle(plan: &LessonPlan, step_idx: usize) -> Option<usize> {
    let ci = cycle_index_for_step(plan, step_idx)?;
    plan.content_cycles
        .iter()
        .skip(ci + 1)
        .find_map(|c| c.ask_step_indices.first().copied())
}

/// Looks forward from `from` for an ask to chain as a follow-up question,
/// crossing only skippable metadata steps. Stops at the first presentable
/// step: a follow-up never jumps over content the student has not seen.
pub fn pending_ask_at_or_after(plan: &LessonPlan, from: usize) -> Option<usize> {
    for i in from..plan.len() {
        match decide_action(plan.step(i)) {
            EngineAction::Ask => return Some(i),
            EngineAction::Skip => continue,
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{compile_plan, TimelineFile};
    use crate::session::SessionState;

    fn plan() -> LessonPlan {
        let timeline: TimelineFile = serde_json::from_str(
            r#"{ "moments": [
              { "title": "Adquisición", "steps": [
                { "type": "CONTENT", "title": "El extintor", "body": ["Apaga fuegos incipientes."] },
                { "type": "KEY_POINTS", "items": ["extintor"] },
                { "type": "ASK", "code": "A1", "question": "¿Qué es?" },
                { "type": "ASK", "code": "A2", "question": "¿Cuándo se usa?" }
              ] },
              { "title": "Aplicación", "steps": [
                { "type": "CONTENT", "title": "Tipos" },
                { "type": "ASK", "code": "B1", "question": "¿Qué tipos hay?" }
              ] }
            ] }"#,
        )
        .unwrap();
        compile_plan(timeline)
    }

    fn state() -> SessionState {
        SessionState::new("lesson.json", 100.0, false)
    }

    #[test]
    fn decide_action_by_step_type() {
        let plan = plan();
        assert_eq!(decide_action(plan.step(0)), EngineAction::Explain);
        assert_eq!(decide_action(plan.step(1)), EngineAction::Skip);
        assert_eq!(decide_action(plan.step(2)), EngineAction::Ask);
        assert_eq!(decide_action(None), EngineAction::End);
    }

    #[test]
    fn next_increases_or_finishes() {
        let plan = plan();
        let mut s = state();
        let mut prev = s.step_idx;
        for _ in 0..plan.len() + 2 {
            next(&plan, &mut s);
            if s.done {
                break;
            }
            assert!(s.step_idx > prev);
            prev = s.step_idx;
        }
        assert!(s.done);
        next(&plan, &mut s);
        assert!(s.done, "advancing past the end stays done");
    }

    #[test]
    fn advance_to_resyncs_moment() {
        let plan = plan();
        let mut s = state();
        advance_to(&plan, &mut s, 5);
        assert_eq!(s.moment_idx, 1);
        assert!(!s.done);

        advance_to(&plan, &mut s, 99);
        assert!(s.done);
        assert_eq!(s.step_idx, plan.len());
        assert_eq!(s.moment_idx, 1);
    }

    #[test]
    fn cycle_navigation() {
        let plan = plan();
        assert_eq!(cycle_index_for_step(&plan, 0), Some(0));
        assert_eq!(cycle_index_for_step(&plan, 3), Some(0));
        assert_eq!(cycle_index_for_step(&plan, 5), Some(1));
        assert_eq!(cycle_index_for_step(&plan, 1), None);

        assert_eq!(next_ask_in_same_cycle(&plan, 2), Some(3));
        assert_eq!(next_ask_in_same_cycle(&plan, 3), None);
        assert_eq!(next_ask_in_same_cycle(&plan, 0), Some(2), "content falls to first ask");

        assert_eq!(first_ask_of_next_cycle(&plan, 2), Some(5));
        assert_eq!(first_ask_of_next_cycle(&plan, 5), None);
    }

    #[test]
    fn pending_ask_crosses_metadata_only() {
        let plan = plan();
        assert_eq!(pending_ask_at_or_after(&plan, 1), Some(2));
        assert_eq!(pending_ask_at_or_after(&plan, 4), None, "stops at content");
        assert_eq!(pending_ask_at_or_after(&plan, 6), None);
    }
}
