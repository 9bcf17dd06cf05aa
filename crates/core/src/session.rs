//! Durable per-session tutoring state.
//!
//! Everything the engine needs to resume a dialogue lives here and is
//! serializable to JSON, so a store can persist it between turns and a
//! client snapshot can rehydrate a freshly created session.

use crate::consult::DiversionKind;
use crate::policy::TransitionAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Where the student is in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPosition {
    pub moment_idx: usize,
    pub step_idx: usize,
}

/// An open consult detour. `paused_at` is captured once, when the detour
/// opens, and is restored verbatim on resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultCtx {
    pub turns: u32,
    pub paused_at: PlanPosition,
}

/// Audit entry for a detour, appended when a consult context opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversionEvent {
    pub origin: PlanPosition,
    pub kind: DiversionKind,
    pub query: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub plan_url: String,
    pub moment_idx: usize,
    pub step_idx: usize,
    pub done: bool,
    #[serde(default)]
    pub attempts_by_ask_code: HashMap<String, u32>,
    #[serde(default)]
    pub no_se_count_by_ask_code: HashMap<String, u32>,
    #[serde(default)]
    pub hints_by_ask_code: HashMap<String, u32>,
    #[serde(default)]
    pub last_action_by_ask_code: HashMap<String, TransitionAction>,
    #[serde(default)]
    pub last_answer_by_ask_code: HashMap<String, String>,
    #[serde(default)]
    pub answered_ask_codes: BTreeSet<String>,
    #[serde(default)]
    pub partially_answered_ask_codes: BTreeSet<String>,
    #[serde(default)]
    pub consult_ctx: Option<ConsultCtx>,
    #[serde(default)]
    pub diversion_stack: Vec<DiversionEvent>,
    pub budget_cents_left: f64,
    #[serde(default)]
    pub escalations_used: u32,
    #[serde(default)]
    pub adaptive_mode: bool,
    #[serde(default)]
    pub just_asked_follow_up: bool,
}

/// Client-supplied progress snapshot. Merging is forward-only: indices never
/// regress and counters only grow, so a stale snapshot can never undo
/// progress the server already recorded.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientRehydration {
    pub moment_idx: Option<usize>,
    pub step_idx: Option<usize>,
    pub attempts_by_ask_code: HashMap<String, u32>,
    pub no_se_count_by_ask_code: HashMap<String, u32>,
    pub last_action_by_ask_code: HashMap<String, TransitionAction>,
    pub last_answer_by_ask_code: HashMap<String, String>,
    pub just_asked_follow_up: Option<bool>,
    pub done: Option<bool>,
}

impl SessionState {
    pub fn new(plan_url: impl Into<String>, budget_cents: f64, adaptive_mode: bool) -> Self {
        Self {
            plan_url: plan_url.into(),
            moment_idx: 0,
            step_idx: 0,
            done: false,
            attempts_by_ask_code: HashMap::new(),
            no_se_count_by_ask_code: HashMap::new(),
            hints_by_ask_code: HashMap::new(),
            last_action_by_ask_code: HashMap::new(),
            last_answer_by_ask_code: HashMap::new(),
            answered_ask_codes: BTreeSet::new(),
            partially_answered_ask_codes: BTreeSet::new(),
            consult_ctx: None,
            diversion_stack: Vec::new(),
            budget_cents_left: budget_cents,
            escalations_used: 0,
            adaptive_mode,
            just_asked_follow_up: false,
        }
    }

    pub fn position(&self) -> PlanPosition {
        PlanPosition {
            moment_idx: self.moment_idx,
            step_idx: self.step_idx,
        }
    }

    pub fn attempts(&self, code: &str) -> u32 {
        self.attempts_by_ask_code.get(code).copied().unwrap_or(0)
    }

    pub fn no_se_count(&self, code: &str) -> u32 {
        self.no_se_count_by_ask_code
            .get(code)
            .copied()
            .unwrap_or(0)
    }

    pub fn hints_used(&self, code: &str) -> u32 {
        self.hints_by_ask_code.get(code).copied().unwrap_or(0)
    }

    pub fn last_action(&self, code: &str) -> TransitionAction {
        self.last_action_by_ask_code
            .get(code)
            .copied()
            .unwrap_or(TransitionAction::Ask)
    }

    pub fn record_attempt(&mut self, code: &str) {
        *self
            .attempts_by_ask_code
            .entry(code.to_string())
            .or_insert(0) += 1;
    }

    /// A detected "don't know" moves both counters.
    pub fn record_no_se(&mut self, code: &str) {
        *self
            .no_se_count_by_ask_code
            .entry(code.to_string())
            .or_insert(0) += 1;
    }

    pub fn reset_no_se(&mut self, code: &str) {
        self.no_se_count_by_ask_code.remove(code);
    }

    /// Increments the hint counter at most once per turn: `charged` is the
    /// turn-local guard, flipped on first use.
    pub fn register_hint(&mut self, code: &str, charged: &mut bool) {
        if *charged {
            return;
        }
        *self.hints_by_ask_code.entry(code.to_string()).or_insert(0) += 1;
        *charged = true;
    }

    pub fn mark_answered(&mut self, code: &str) {
        self.partially_answered_ask_codes.remove(code);
        self.answered_ask_codes.insert(code.to_string());
    }

    /// Partial credit never downgrades a fully answered question.
    pub fn mark_partially_answered(&mut self, code: &str) {
        if !self.answered_ask_codes.contains(code) {
            self.partially_answered_ask_codes.insert(code.to_string());
        }
    }

    /// Merges a client snapshot. Indices only move forward; counter maps
    /// take the per-key maximum; the echo-suppression flag and `done` are
    /// taken only when the snapshot is ahead.
    pub fn rehydrate(&mut self, snap: &ClientRehydration) {
        if let Some(step_idx) = snap.step_idx {
            if step_idx > self.step_idx {
                self.step_idx = step_idx;
                if let Some(moment_idx) = snap.moment_idx {
                    self.moment_idx = self.moment_idx.max(moment_idx);
                }
                if let Some(flag) = snap.just_asked_follow_up {
                    self.just_asked_follow_up = flag;
                }
                if let Some(done) = snap.done {
                    self.done = self.done || done;
                }
            }
        }
        for (code, n) in &snap.attempts_by_ask_code {
            let slot = self
                .attempts_by_ask_code
                .entry(code.clone())
                .or_insert(0);
            *slot = (*slot).max(*n);
        }
        for (code, n) in &snap.no_se_count_by_ask_code {
            let slot = self
                .no_se_count_by_ask_code
                .entry(code.clone())
                .or_insert(0);
            *slot = (*slot).max(*n);
        }
        for (code, action) in &snap.last_action_by_ask_code {
            self.last_action_by_ask_code
                .entry(code.clone())
                .or_insert(*action);
        }
        for (code, answer) in &snap.last_answer_by_ask_code {
            self.last_answer_by_ask_code
                .entry(code.clone())
                .or_insert_with(|| answer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("lesson.json", 100.0, false)
    }

    #[test]
    fn counters_start_at_zero_and_grow() {
        let mut s = state();
        assert_eq!(s.attempts("A1"), 0);
        s.record_attempt("A1");
        s.record_attempt("A1");
        s.record_no_se("A1");
        assert_eq!(s.attempts("A1"), 2);
        assert_eq!(s.no_se_count("A1"), 1);
    }

    #[test]
    fn hint_charges_once_per_turn() {
        let mut s = state();
        let mut charged = false;
        s.register_hint("A1", &mut charged);
        s.register_hint("A1", &mut charged);
        assert_eq!(s.hints_used("A1"), 1);

        let mut charged = false;
        s.register_hint("A1", &mut charged);
        assert_eq!(s.hints_used("A1"), 2);
    }

    #[test]
    fn partial_never_downgrades_answered() {
        let mut s = state();
        s.mark_partially_answered("A1");
        assert!(s.partially_answered_ask_codes.contains("A1"));
        s.mark_answered("A1");
        s.mark_partially_answered("A1");
        assert!(s.answered_ask_codes.contains("A1"));
        assert!(!s.partially_answered_ask_codes.contains("A1"));
    }

    #[test]
    fn rehydrate_moves_forward_only() {
        let mut s = state();
        s.step_idx = 5;
        s.moment_idx = 1;

        let stale = ClientRehydration {
            step_idx: Some(2),
            moment_idx: Some(0),
            ..Default::default()
        };
        s.rehydrate(&stale);
        assert_eq!(s.step_idx, 5);
        assert_eq!(s.moment_idx, 1);

        let ahead = ClientRehydration {
            step_idx: Some(9),
            moment_idx: Some(2),
            done: Some(false),
            ..Default::default()
        };
        s.rehydrate(&ahead);
        assert_eq!(s.step_idx, 9);
        assert_eq!(s.moment_idx, 2);
    }

    #[test]
    fn rehydrate_merges_counters_by_max() {
        let mut s = state();
        s.attempts_by_ask_code.insert("A1".into(), 3);
        let snap = ClientRehydration {
            attempts_by_ask_code: HashMap::from([("A1".into(), 1), ("A2".into(), 2)]),
            ..Default::default()
        };
        s.rehydrate(&snap);
        assert_eq!(s.attempts("A1"), 3);
        assert_eq!(s.attempts("A2"), 2);
    }

    #[test]
    fn round_trips_through_json() {
        let mut s = state();
        s.record_attempt("A1");
        s.mark_answered("A1");
        let json = serde_json::to_string(&s).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
