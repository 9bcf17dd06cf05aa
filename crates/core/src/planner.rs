//! Adaptive planner.
//!
//! Inspects the latest exchange and may override the scripted flow with a
//! single [`AdaptCommand`]. Commands are data, not effects: the orchestrator
//! validates and applies them, and an invalid command is an identity.

use crate::budget::ESCALATION_RESERVE_CENTS;
use crate::classify::{normalize, tokenize};
use crate::plan::{LessonPlan, StepType};
use crate::runner;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};

pub const MAX_ESCALATIONS_PER_SESSION: u32 = 5;

const ON_TOPIC_RATIO: f64 = 0.3;
const VAGUE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptOp {
    Reask,
    Hint,
    Goto,
    Repeat,
    InsertMicro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptReason {
    SemLow,
    ThinkerEscalation,
    OffTopic,
    BudgetLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptCommand {
    pub op: AdaptOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ask_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AdaptReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AdaptCommand {
    fn hint(reason: AdaptReason) -> Self {
        Self {
            op: AdaptOp::Hint,
            target_ask_code: None,
            reason: Some(reason),
            note: None,
        }
    }

    fn reask(reason: AdaptReason) -> Self {
        Self {
            op: AdaptOp::Reask,
            target_ask_code: None,
            reason: Some(reason),
            note: None,
        }
    }

    fn goto(code: String, reason: AdaptReason) -> Self {
        Self {
            op: AdaptOp::Goto,
            target_ask_code: Some(code),
            reason: Some(reason),
            note: None,
        }
    }
}

/// One recent exchange, newest last.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub step_idx: usize,
    pub action: String,
    pub response: Option<String>,
}

pub struct PlanningContext<'a> {
    pub plan: &'a LessonPlan,
    pub state: &'a SessionState,
    pub short_history: &'a [HistoryEntry],
    pub budget_cents_left: f64,
    pub escalations_used: u32,
}

/// How far the latest response strays from the step objective, measured by
/// overlap with the objective's content words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicDeviation {
    OnTopic,
    Vague,
    OffTopic,
}

pub fn detect_topic_deviation(response: &str, objective: &str) -> TopicDeviation {
    let objective_words: Vec<String> = tokenize(objective)
        .into_iter()
        .filter(|w| w.len() > 3)
        .collect();
    if objective_words.is_empty() {
        return TopicDeviation::OnTopic;
    }
    let response_norm = normalize(response);
    let hits = objective_words
        .iter()
        .filter(|w| response_norm.contains(w.as_str()))
        .count();
    let ratio = hits as f64 / objective_words.len() as f64;
    if ratio >= ON_TOPIC_RATIO {
        TopicDeviation::OnTopic
    } else if ratio >= VAGUE_RATIO {
        TopicDeviation::Vague
    } else {
        TopicDeviation::OffTopic
    }
}

fn can_escalate(ctx: &PlanningContext) -> bool {
    ctx.budget_cents_left > ESCALATION_RESERVE_CENTS
        && ctx.escalations_used < MAX_ESCALATIONS_PER_SESSION
}

/// Decides whether to override the scripted flow this turn.
///
/// Priority: the budget gate first (below the reserve every adaptation is a
/// cheap hint), then topic deviation on the latest response at an ask step:
/// off-topic jumps or reasks, vague always reasks with `SEM_LOW`. Returns
/// `None` only for an on-topic answer, when the script should simply
/// continue.
pub fn plan_adaptation(ctx: &PlanningContext) -> Option<AdaptCommand> {
    let step = runner::current_step(ctx.plan, ctx.state)?;
    if step.step_type != StepType::Ask {
        return None;
    }
    let last = ctx.short_history.last()?;
    let response = last.response.as_deref()?.trim();
    if response.is_empty() {
        return None;
    }

    if !can_escalate(ctx) {
        return Some(AdaptCommand::hint(AdaptReason::BudgetLimit));
    }

    let objective = step
        .data
        .objective
        .clone()
        .or_else(|| step.data.question.clone())
        .unwrap_or_default();
    match detect_topic_deviation(response, &objective) {
        TopicDeviation::OffTopic => {
            let next_ask = runner::next_ask_in_same_cycle(ctx.plan, ctx.state.step_idx)
                .and_then(|i| ctx.plan.step(i))
                .and_then(|s| s.code.clone());
            match next_ask {
                Some(code) => Some(AdaptCommand::goto(code, AdaptReason::OffTopic)),
                None => Some(AdaptCommand::reask(AdaptReason::OffTopic)),
            }
        }
        TopicDeviation::Vague => Some(AdaptCommand::reask(AdaptReason::SemLow)),
        TopicDeviation::OnTopic => None,
    }
}

/// A command is applicable when its target resolves. `goto` needs a known
/// ask code; `insert_micro` must land inside an existing cycle.
pub fn validate_adapt_command(cmd: &AdaptCommand, plan: &LessonPlan, state: &SessionState) -> bool {
    match cmd.op {
        AdaptOp::Goto => cmd
            .target_ask_code
            .as_deref()
            .and_then(|code| plan.index_of_code(code))
            .is_some(),
        AdaptOp::InsertMicro => runner::cycle_index_for_step(plan, state.step_idx).is_some(),
        AdaptOp::Reask | AdaptOp::Hint | AdaptOp::Repeat => true,
    }
}

/// Applies a command to a copy of the state. Total: an invalid command
/// returns the input unchanged. Only `goto` moves the position; the other
/// ops shape the response, not the cursor.
pub fn apply_adapt_command(
    cmd: &AdaptCommand,
    plan: &LessonPlan,
    state: &SessionState,
) -> SessionState {
    let mut out = state.clone();
    if !validate_adapt_command(cmd, plan, state) {
        return out;
    }
    if cmd.op == AdaptOp::Goto {
        if let Some(target) = cmd
            .target_ask_code
            .as_deref()
            .and_then(|code| plan.index_of_code(code))
        {
            runner::advance_to(plan, &mut out, target);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{compile_plan, TimelineFile};
    use crate::session::SessionState;

    fn plan() -> LessonPlan {
        let timeline: TimelineFile = serde_json::from_str(
            r#"{ "moments": [ { "title": "Adquisición", "steps": [
              { "type": "CONTENT", "title": "Extintores", "body": ["PQS y CO2 apagan fuegos."] },
              { "type": "ASK", "code": "A1", "question": "¿Qué apaga un extintor?",
                "objective": "reconocer que el extintor apaga fuegos incipientes" },
              { "type": "ASK", "code": "A2", "question": "¿Qué tipos conoces?" }
            ] } ] }"#,
        )
        .unwrap();
        compile_plan(timeline)
    }

    fn at_ask(budget: f64) -> SessionState {
        let mut s = SessionState::new("lesson.json", budget, true);
        s.step_idx = 1;
        s
    }

    fn history(response: &str) -> Vec<HistoryEntry> {
        vec![HistoryEntry {
            step_idx: 1,
            action: "ask".to_string(),
            response: Some(response.to_string()),
        }]
    }

    fn ctx<'a>(
        plan: &'a LessonPlan,
        state: &'a SessionState,
        history: &'a [HistoryEntry],
    ) -> PlanningContext<'a> {
        PlanningContext {
            plan,
            state,
            short_history: history,
            budget_cents_left: state.budget_cents_left,
            escalations_used: state.escalations_used,
        }
    }

    #[test]
    fn budget_gate_beats_everything() {
        let plan = plan();
        let state = at_ask(0.0);
        let h = history("hablemos del partido de ayer");
        let cmd = plan_adaptation(&ctx(&plan, &state, &h)).unwrap();
        assert_eq!(cmd.op, AdaptOp::Hint);
        assert_eq!(cmd.reason, Some(AdaptReason::BudgetLimit));
    }

    #[test]
    fn reserve_floor_counts_as_exhausted() {
        let plan = plan();
        let state = at_ask(10.0);
        let h = history("el extintor apaga fuegos incipientes");
        let cmd = plan_adaptation(&ctx(&plan, &state, &h)).unwrap();
        assert_eq!(cmd.reason, Some(AdaptReason::BudgetLimit));
    }

    #[test]
    fn escalation_cap_triggers_budget_limit() {
        let plan = plan();
        let mut state = at_ask(100.0);
        state.escalations_used = MAX_ESCALATIONS_PER_SESSION;
        let h = history("respuesta cualquiera sobre extintores");
        let cmd = plan_adaptation(&ctx(&plan, &state, &h)).unwrap();
        assert_eq!(cmd.reason, Some(AdaptReason::BudgetLimit));
    }

    #[test]
    fn off_topic_goes_to_next_ask_in_cycle() {
        let plan = plan();
        let state = at_ask(100.0);
        let h = history("ayer fui al cine con mi familia");
        let cmd = plan_adaptation(&ctx(&plan, &state, &h)).unwrap();
        assert_eq!(cmd.op, AdaptOp::Goto);
        assert_eq!(cmd.target_ask_code.as_deref(), Some("A2"));
        assert_eq!(cmd.reason, Some(AdaptReason::OffTopic));
    }

    #[test]
    fn vague_overlap_always_reasks_with_sem_low() {
        let plan = plan();
        let state = at_ask(100.0);
        // 1 of 5 objective keywords: inside the vague band, yet carrying
        // enough content words to read as a real answer.
        let h = history("el extintor se usa en la cocina de mi casa");
        assert_eq!(
            detect_topic_deviation(
                "el extintor se usa en la cocina de mi casa",
                "reconocer que el extintor apaga fuegos incipientes"
            ),
            TopicDeviation::Vague
        );
        let cmd = plan_adaptation(&ctx(&plan, &state, &h)).unwrap();
        assert_eq!(cmd.op, AdaptOp::Reask);
        assert_eq!(cmd.reason, Some(AdaptReason::SemLow));
    }

    #[test]
    fn on_topic_returns_none() {
        let plan = plan();
        let state = at_ask(100.0);
        let h = history("el extintor apaga fuegos incipientes");
        assert_eq!(plan_adaptation(&ctx(&plan, &state, &h)), None);
    }

    #[test]
    fn not_at_ask_returns_none() {
        let plan = plan();
        let mut state = at_ask(100.0);
        state.step_idx = 0;
        let h = history("lo que sea");
        assert_eq!(plan_adaptation(&ctx(&plan, &state, &h)), None);
    }

    #[test]
    fn invalid_goto_is_identity() {
        let plan = plan();
        let state = at_ask(100.0);
        let cmd = AdaptCommand::goto("NOPE".to_string(), AdaptReason::OffTopic);
        assert!(!validate_adapt_command(&cmd, &plan, &state));
        assert_eq!(apply_adapt_command(&cmd, &plan, &state), state);
    }

    #[test]
    fn goto_moves_position_and_resyncs() {
        let plan = plan();
        let state = at_ask(100.0);
        let cmd = AdaptCommand::goto("A2".to_string(), AdaptReason::OffTopic);
        let out = apply_adapt_command(&cmd, &plan, &state);
        assert_eq!(out.step_idx, 2);
        assert!(!out.done);
    }

    #[test]
    fn non_goto_ops_leave_position_alone() {
        let plan = plan();
        let state = at_ask(100.0);
        for cmd in [
            AdaptCommand::reask(AdaptReason::SemLow),
            AdaptCommand::hint(AdaptReason::BudgetLimit),
            AdaptCommand {
                op: AdaptOp::InsertMicro,
                target_ask_code: None,
                reason: None,
                note: Some("micro".to_string()),
            },
        ] {
            let out = apply_adapt_command(&cmd, &plan, &state);
            assert_eq!(out.step_idx, state.step_idx);
        }
    }

    #[test]
    fn adapt_command_wire_format() {
        let cmd = AdaptCommand::goto("A2".to_string(), AdaptReason::OffTopic);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "goto");
        assert_eq!(json["target_ask_code"], "A2");
        assert_eq!(json["reason"], "OFF_TOPIC");
    }
}
