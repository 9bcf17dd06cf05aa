//! Hint, attempt and force-advance policy.
//!
//! Decides the next tutoring sub-action for a question the student has not
//! yet answered, and whether the engine may force progression past it.

use crate::classify::ClassKind;
use serde::{Deserialize, Serialize};

/// Per-question sub-action ladder. `Ok` marks an accepted answer; the rest
/// escalate support: hint → simplified restatement → two-option choice →
/// plain explanation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    #[default]
    Ask,
    Hint,
    AskSimple,
    AskOptions,
    Explain,
    Ok,
}

/// Pedagogical moment kinds, mapped from moment titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MomentKind {
    Saludo,
    Conexion,
    Adquisicion,
    Aplicacion,
    Discusion,
    Reflexion,
    Otro,
}

/// Classifies a moment by its (Spanish) title. Accent- and case-insensitive.
pub fn map_moment_kind(title: Option<&str>) -> MomentKind {
    let t = fold(title.unwrap_or_default());
    if t.contains("saludo") || t.contains("bienvenid") {
        MomentKind::Saludo
    } else if t.contains("conexion") {
        MomentKind::Conexion
    } else if t.contains("adquisicion") {
        MomentKind::Adquisicion
    } else if t.contains("aplicacion") {
        MomentKind::Aplicacion
    } else if t.contains("discusion") {
        MomentKind::Discusion
    } else if t.contains("reflexion") {
        MomentKind::Reflexion
    } else {
        MomentKind::Otro
    }
}

fn fold(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Optional course-configured thresholds, keyed on the don't-know count.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationConfig {
    pub no_se_to_hint: Option<u32>,
    pub hint_to_ask_simple: Option<u32>,
    pub ask_simple_to_options: Option<u32>,
    pub hard_stop_to_explain: Option<u32>,
}

/// Force-advance gating: how many attempts or consecutive don't-knows allow
/// the engine to move on, and in which moments moving on is allowed at all.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancePolicy {
    pub max_attempts_before_force: u32,
    pub force_no_se_threshold: u32,
    pub allow_forced_on: Vec<MomentKind>,
    pub escalation: Option<EscalationConfig>,
}

impl Default for AdvancePolicy {
    fn default() -> Self {
        Self {
            max_attempts_before_force: 3,
            force_no_se_threshold: 3,
            allow_forced_on: vec![MomentKind::Conexion],
            escalation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    AttemptsExhausted,
    NoSeStreak,
}

/// Whether this turn may force progression past the current question.
/// Requires an allowed moment kind AND one of the two ceilings.
pub fn decide_force_advance(
    attempts: u32,
    no_se_count: u32,
    moment_kind: MomentKind,
    policy: &AdvancePolicy,
) -> Option<ForceReason> {
    if !policy.allow_forced_on.contains(&moment_kind) {
        return None;
    }
    if attempts >= policy.max_attempts_before_force {
        return Some(ForceReason::AttemptsExhausted);
    }
    if no_se_count >= policy.force_no_se_threshold {
        return Some(ForceReason::NoSeStreak);
    }
    None
}

pub struct NextActionDecision {
    pub action: TransitionAction,
    pub reset_no_se: bool,
}

/// Resolves the next sub-action. An accepted answer short-circuits to `Ok`
/// and resets the don't-know streak. Otherwise config thresholds on the
/// don't-know count win; without config, the ladder climbs one rung from
/// the last action taken on this question.
pub fn decide_next_action(
    last_action: TransitionAction,
    class_kind: Option<ClassKind>,
    no_se_count: u32,
    config: Option<&EscalationConfig>,
) -> NextActionDecision {
    if class_kind == Some(ClassKind::Accept) {
        return NextActionDecision {
            action: TransitionAction::Ok,
            reset_no_se: true,
        };
    }

    if let Some(cfg) = config {
        let hit = |threshold: Option<u32>| threshold.is_some_and(|t| no_se_count >= t);
        let action = if hit(cfg.hard_stop_to_explain) {
            TransitionAction::Explain
        } else if hit(cfg.ask_simple_to_options) {
            TransitionAction::AskOptions
        } else if hit(cfg.hint_to_ask_simple) {
            TransitionAction::AskSimple
        } else if hit(cfg.no_se_to_hint) {
            TransitionAction::Hint
        } else {
            climb(last_action)
        };
        return NextActionDecision {
            action,
            reset_no_se: false,
        };
    }

    NextActionDecision {
        action: climb(last_action),
        reset_no_se: false,
    }
}

fn climb(last: TransitionAction) -> TransitionAction {
    match last {
        TransitionAction::Ask | TransitionAction::Ok => TransitionAction::Hint,
        TransitionAction::Hint => TransitionAction::AskSimple,
        TransitionAction::AskSimple => TransitionAction::AskOptions,
        TransitionAction::AskOptions | TransitionAction::Explain => TransitionAction::Explain,
    }
}

/// A don't-know on top of an existing don't-know jumps straight to the
/// two-option sub-action.
pub fn options_due(is_no_se: bool, no_se_count: u32) -> bool {
    is_no_se && no_se_count >= 2
}

/// Exactly two candidates for the options sub-action, preferring what the
/// student is still missing.
pub fn options_pair(missing: &[String], expected: &[String]) -> Vec<String> {
    let mut out: Vec<String> = missing.iter().take(2).cloned().collect();
    for term in expected {
        if out.len() >= 2 {
            break;
        }
        if !out.contains(term) {
            out.push(term.clone());
        }
    }
    out
}

/// Word caps by hint severity: later hints may say more.
pub const HINT_WORD_LIMITS: [u32; 3] = [18, 35, 60];

pub fn hint_word_limit(hints_already_given: u32) -> u32 {
    let idx = (hints_already_given as usize).min(HINT_WORD_LIMITS.len() - 1);
    HINT_WORD_LIMITS[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moment_kind_from_title() {
        assert_eq!(map_moment_kind(Some("Momento de Conexión")), MomentKind::Conexion);
        assert_eq!(map_moment_kind(Some("ADQUISICIÓN")), MomentKind::Adquisicion);
        assert_eq!(map_moment_kind(Some("Saludo inicial")), MomentKind::Saludo);
        assert_eq!(map_moment_kind(Some("Cierre")), MomentKind::Otro);
        assert_eq!(map_moment_kind(None), MomentKind::Otro);
    }

    #[test]
    fn ladder_climbs_one_rung() {
        let d = decide_next_action(TransitionAction::Ask, Some(ClassKind::Hint), 0, None);
        assert_eq!(d.action, TransitionAction::Hint);
        let d = decide_next_action(TransitionAction::Hint, Some(ClassKind::Hint), 0, None);
        assert_eq!(d.action, TransitionAction::AskSimple);
        let d = decide_next_action(TransitionAction::AskSimple, Some(ClassKind::Partial), 0, None);
        assert_eq!(d.action, TransitionAction::AskOptions);
        let d = decide_next_action(TransitionAction::AskOptions, Some(ClassKind::Hint), 0, None);
        assert_eq!(d.action, TransitionAction::Explain);
        let d = decide_next_action(TransitionAction::Explain, Some(ClassKind::Hint), 0, None);
        assert_eq!(d.action, TransitionAction::Explain, "explain is terminal");
    }

    #[test]
    fn accept_short_circuits_and_resets_streak() {
        let d = decide_next_action(TransitionAction::AskOptions, Some(ClassKind::Accept), 3, None);
        assert_eq!(d.action, TransitionAction::Ok);
        assert!(d.reset_no_se);
    }

    #[test]
    fn config_thresholds_win_over_ladder() {
        let cfg = EscalationConfig {
            no_se_to_hint: Some(1),
            hint_to_ask_simple: Some(2),
            ask_simple_to_options: Some(3),
            hard_stop_to_explain: Some(4),
        };
        let d = decide_next_action(TransitionAction::Ask, Some(ClassKind::Hint), 3, Some(&cfg));
        assert_eq!(d.action, TransitionAction::AskOptions);
        let d = decide_next_action(TransitionAction::Ask, Some(ClassKind::Hint), 4, Some(&cfg));
        assert_eq!(d.action, TransitionAction::Explain);
    }

    #[test]
    fn force_advance_requires_allowed_moment() {
        let policy = AdvancePolicy::default();
        assert_eq!(
            decide_force_advance(5, 5, MomentKind::Adquisicion, &policy),
            None
        );
        assert_eq!(
            decide_force_advance(5, 0, MomentKind::Saludo, &policy),
            None,
            "greeting never force-advances"
        );
        assert_eq!(
            decide_force_advance(3, 0, MomentKind::Conexion, &policy),
            Some(ForceReason::AttemptsExhausted)
        );
        assert_eq!(
            decide_force_advance(1, 3, MomentKind::Conexion, &policy),
            Some(ForceReason::NoSeStreak)
        );
        assert_eq!(decide_force_advance(2, 2, MomentKind::Conexion, &policy), None);
    }

    #[test]
    fn second_dont_know_forces_options() {
        assert!(!options_due(true, 1));
        assert!(options_due(true, 2));
        assert!(!options_due(false, 2));
    }

    #[test]
    fn options_pair_prefers_missing() {
        let missing = vec!["pqs".to_string()];
        let expected = vec!["pqs".to_string(), "co2".to_string(), "agua".to_string()];
        assert_eq!(options_pair(&missing, &expected), vec!["pqs", "co2"]);
        assert_eq!(options_pair(&[], &expected), vec!["pqs", "co2"]);
    }

    #[test]
    fn hint_limits_escalate() {
        assert_eq!(hint_word_limit(0), 18);
        assert_eq!(hint_word_limit(1), 35);
        assert_eq!(hint_word_limit(2), 60);
        assert_eq!(hint_word_limit(9), 60);
    }
}
