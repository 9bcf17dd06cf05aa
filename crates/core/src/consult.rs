//! Diversion detection and the consult detour.
//!
//! Students drift: they greet, ask who the tutor is, ask about the platform,
//! or raise a real question about the material. Detection is deterministic
//! and mutually exclusive; anything beyond a greeting or identity query
//! opens a consult context that pauses the lesson and later restores it at
//! the exact paused position.

use crate::classify::normalize;
use crate::plan::LessonPlan;
use crate::runner;
use crate::session::{ConsultCtx, DiversionEvent, SessionState};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Detour auto-closes after this many consult turns.
pub const DEFAULT_MAX_CONSULT_TURNS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiversionKind {
    Greeting,
    PersonalQuery,
    PlatformQuery,
    ExplicitQuestion,
    ImplicitQuestion,
}

impl DiversionKind {
    /// Greetings and identity queries are answered inline; the rest pause
    /// the lesson.
    pub fn opens_consult(self) -> bool {
        !matches!(self, DiversionKind::Greeting | DiversionKind::PersonalQuery)
    }
}

const GREETINGS: &[&str] = &["hola", "buenas", "buenos dias", "buenas tardes", "buenas noches", "hey"];

const PERSONAL_PHRASES: &[&str] = &[
    "quien eres",
    "como te llamas",
    "cual es tu nombre",
    "tu nombre",
    "eres un robot",
    "eres una maquina",
    "eres una ia",
    "eres real",
];

const PLATFORM_PHRASES: &[&str] = &[
    "la plataforma",
    "el curso",
    "el certificado",
    "mi certificado",
    "como funciona esto",
    "donde veo",
    "cuanto dura",
    "la leccion anterior",
];

const ASK_INTENT_PHRASES: &[&str] = &[
    "tengo una pregunta",
    "tengo una duda",
    "puedo preguntar",
    "puedo hacer una pregunta",
    "quisiera preguntar",
    "quiero preguntar",
    "una consulta",
    "no entiendo",
    "no me queda claro",
    "me puedes explicar",
    "puedes explicarme",
    "explicame",
];

const RESUME_AFFIRMATIVES: &[&str] = &[
    "si",
    "sii",
    "listo",
    "lista",
    "ok",
    "okay",
    "dale",
    "vale",
    "claro",
    "continuemos",
    "sigamos",
    "seguimos",
    "si continuemos",
    "si sigamos",
    "ya entendi",
    "entendido",
];

/// Classifies the input as a diversion, if it is one. Checks run in
/// priority order so exactly one kind wins.
pub fn detect_diversion(input: &str) -> Option<DiversionKind> {
    let n = normalize(input);
    if n.is_empty() {
        return None;
    }
    let word_count = n.split_whitespace().count();
    let is_question = input.trim_end().ends_with('?');

    if !is_question && word_count <= 4 && GREETINGS.iter().any(|g| n == *g || n.starts_with(&format!("{g} "))) {
        return Some(DiversionKind::Greeting);
    }
    if PERSONAL_PHRASES.iter().any(|p| n.contains(p)) {
        return Some(DiversionKind::PersonalQuery);
    }
    if PLATFORM_PHRASES.iter().any(|p| n.contains(p)) {
        return Some(DiversionKind::PlatformQuery);
    }
    if ASK_INTENT_PHRASES.iter().any(|p| n.contains(p)) {
        return Some(DiversionKind::ImplicitQuestion);
    }
    if is_question {
        return Some(DiversionKind::ExplicitQuestion);
    }
    None
}

pub fn is_affirmative_to_resume(input: &str) -> bool {
    RESUME_AFFIRMATIVES.contains(&normalize(input).as_str())
}

/// Opens a consult context at the current position, or bumps the turn
/// counter of the one already open (a nested diversion never re-snapshots
/// the paused position). Opening also logs the diversion.
pub fn open_or_continue(state: &mut SessionState, kind: DiversionKind, query: &str) {
    match state.consult_ctx.as_mut() {
        Some(ctx) => ctx.turns += 1,
        None => {
            let origin = state.position();
            state.consult_ctx = Some(ConsultCtx {
                turns: 1,
                paused_at: origin,
            });
            state.diversion_stack.push(DiversionEvent {
                origin,
                kind,
                query: query.to_string(),
                at: Utc::now(),
            });
        }
    }
}

/// Whether the open detour should close this turn: the student signalled
/// readiness or the turn cap is spent.
pub fn should_resume(ctx: &ConsultCtx, input: &str, max_turns: u32) -> bool {
    is_affirmative_to_resume(input) || ctx.turns >= max_turns
}

/// Closes the detour and restores the paused position. Returns the question
/// text pending at that position, when it is an ask step.
pub fn resume(plan: &LessonPlan, state: &mut SessionState) -> Option<String> {
    let ctx = state.consult_ctx.take()?;
    runner::advance_to(plan, state, ctx.paused_at.step_idx);
    state.moment_idx = ctx.paused_at.moment_idx;
    runner::current_step(plan, state)
        .and_then(|s| s.data.question.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{compile_plan, TimelineFile};

    fn plan() -> LessonPlan {
        let timeline: TimelineFile = serde_json::from_str(
            r#"{ "moments": [ { "title": "Adquisición", "steps": [
              { "type": "CONTENT", "title": "Extintores" },
              { "type": "ASK", "code": "A1", "question": "¿Qué es un extintor?" }
            ] } ] }"#,
        )
        .unwrap();
        compile_plan(timeline)
    }

    #[test]
    fn detection_priority_and_kinds() {
        assert_eq!(detect_diversion("hola"), Some(DiversionKind::Greeting));
        assert_eq!(detect_diversion("Buenas tardes profe"), Some(DiversionKind::Greeting));
        assert_eq!(detect_diversion("¿quién eres tú?"), Some(DiversionKind::PersonalQuery));
        assert_eq!(
            detect_diversion("¿dónde veo mi certificado?"),
            Some(DiversionKind::PlatformQuery)
        );
        assert_eq!(
            detect_diversion("tengo una duda sobre los extintores"),
            Some(DiversionKind::ImplicitQuestion)
        );
        assert_eq!(
            detect_diversion("¿el CO2 sirve para madera?"),
            Some(DiversionKind::ExplicitQuestion)
        );
        assert_eq!(detect_diversion("el extintor apaga fuegos"), None);
        assert_eq!(detect_diversion(""), None);
    }

    #[test]
    fn greeting_with_question_mark_is_not_a_greeting() {
        assert_eq!(
            detect_diversion("hola, ¿el curso tiene examen?"),
            Some(DiversionKind::PlatformQuery)
        );
    }

    #[test]
    fn greeting_and_personal_stay_inline() {
        assert!(!DiversionKind::Greeting.opens_consult());
        assert!(!DiversionKind::PersonalQuery.opens_consult());
        assert!(DiversionKind::ExplicitQuestion.opens_consult());
        assert!(DiversionKind::ImplicitQuestion.opens_consult());
        assert!(DiversionKind::PlatformQuery.opens_consult());
    }

    #[test]
    fn open_snapshots_once_and_logs() {
        let mut state = SessionState::new("lesson.json", 100.0, false);
        state.step_idx = 1;
        state.moment_idx = 0;

        open_or_continue(&mut state, DiversionKind::ExplicitQuestion, "¿sirve el CO2?");
        let ctx = state.consult_ctx.clone().unwrap();
        assert_eq!(ctx.turns, 1);
        assert_eq!(ctx.paused_at.step_idx, 1);
        assert_eq!(state.diversion_stack.len(), 1);

        // nested diversion continues, never re-snapshots
        state.step_idx = 0;
        open_or_continue(&mut state, DiversionKind::ImplicitQuestion, "otra duda");
        let ctx = state.consult_ctx.clone().unwrap();
        assert_eq!(ctx.turns, 2);
        assert_eq!(ctx.paused_at.step_idx, 1);
        assert_eq!(state.diversion_stack.len(), 1);
    }

    #[test]
    fn resume_restores_exact_position_and_question() {
        let plan = plan();
        let mut state = SessionState::new("lesson.json", 100.0, false);
        state.step_idx = 1;
        open_or_continue(&mut state, DiversionKind::ExplicitQuestion, "duda");
        state.step_idx = 0;

        let pending = resume(&plan, &mut state);
        assert_eq!(state.step_idx, 1);
        assert!(state.consult_ctx.is_none());
        assert_eq!(pending.as_deref(), Some("¿Qué es un extintor?"));
    }

    #[test]
    fn should_resume_on_affirmative_or_cap() {
        let ctx = ConsultCtx {
            turns: 1,
            paused_at: crate::session::PlanPosition {
                moment_idx: 0,
                step_idx: 1,
            },
        };
        assert!(should_resume(&ctx, "listo", DEFAULT_MAX_CONSULT_TURNS));
        assert!(should_resume(&ctx, "sí", DEFAULT_MAX_CONSULT_TURNS));
        assert!(!should_resume(&ctx, "¿y el agua?", DEFAULT_MAX_CONSULT_TURNS));
        let spent = ConsultCtx { turns: 3, ..ctx };
        assert!(should_resume(&spent, "¿y el agua?", DEFAULT_MAX_CONSULT_TURNS));
    }
}
