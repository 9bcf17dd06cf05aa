//! Turn Orchestrator
//!
//! Runs one student turn end to end: lock the session, rehydrate state,
//! short-circuit diversions, sweep the plan (skip → explain → ask → end),
//! let the adaptive planner override the script, resolve the escalation
//! ladder, and persist best-effort. Collaborator failures never fail a
//! turn; each generated message has a deterministic fallback.

use crate::models::TurnRequest;
use crate::state::AppState;
use crate::store::{SessionStore, TranscriptEntry};
use anyhow::Result;
use chrono::Utc;
use mentor_core::budget::{BudgetManager, BudgetMetrics, CostTier};
use mentor_core::classify::{self, AnswerClassifier, ClassKind, KeywordClassifier};
use mentor_core::consult::{self, DiversionKind};
use mentor_core::generate::{self, GenerationReply, GenerationRequest, LanguageGenerator, TutorAction};
use mentor_core::plan::LessonPlan;
use mentor_core::planner::{self, AdaptOp, AdaptReason, HistoryEntry, PlanningContext};
use mentor_core::policy::{self, TransitionAction, HINT_WORD_LIMITS};
use mentor_core::runner::{self, EngineAction};
use mentor_core::session::SessionState;
use tracing::{debug, info, warn};

/// Bound on consecutive silent skips in one turn, against malformed plans.
pub const MAX_SKIPS_PER_TURN: usize = 20;
/// Transcript entries fed back into generation prompts.
const RECENT_HISTORY_LIMIT: usize = 4;

pub const MAX_HINTS: u32 = HINT_WORD_LIMITS.len() as u32;

pub struct TurnOutcome {
    pub message: String,
    pub follow_up: String,
    pub assessment: Option<ClassKind>,
    pub step_code: Option<String>,
    pub moment_idx: usize,
    pub hints_used: u32,
    pub budget_metrics: Option<BudgetMetrics>,
    pub state: SessionState,
}

struct Draft {
    message: String,
    follow_up: String,
    assessment: Option<ClassKind>,
    step_code: Option<String>,
}

impl Draft {
    fn silent(step_code: Option<String>) -> Self {
        Self {
            message: String::new(),
            follow_up: String::new(),
            assessment: None,
            step_code,
        }
    }
}

pub async fn run_turn(app: &AppState, req: &TurnRequest) -> Result<TurnOutcome> {
    let lock = app.session_lock(&req.session_key).await;
    let _guard = lock.lock().await;
    let key = req.session_key.as_str();
    debug!(session_key = %key, "engine.turn.start");

    if req.reset {
        if let Err(err) = app.store.delete(key).await {
            warn!(session_key = %key, error = ?err, "reset: failed to delete session");
        }
        if let Err(err) = app.store.clear_transcript(key).await {
            warn!(session_key = %key, error = ?err, "reset: failed to clear transcript");
        }
    }

    let stored = match app.store.get(key).await {
        Ok(s) => s,
        Err(err) => {
            warn!(session_key = %key, error = ?err, "store read failed, starting fresh");
            None
        }
    };
    let mut state = stored.unwrap_or_else(|| {
        let plan_url = req
            .plan_url
            .clone()
            .unwrap_or_else(|| app.config.default_plan_url.clone());
        SessionState::new(
            plan_url,
            app.config.budget_cents,
            req.adaptive_mode.unwrap_or(false),
        )
    });
    if let Some(adaptive) = req.adaptive_mode {
        state.adaptive_mode = adaptive;
    }
    if let Some(snapshot) = req.client_state.clone() {
        state.rehydrate(&snapshot.into());
    }

    // A plan that cannot load is the one failure a turn surfaces.
    let plan = app.plan(&state.plan_url).await?;
    let mut budget = BudgetManager::from_cents(state.budget_cents_left);
    let input = req.user_input.trim().to_string();

    if !input.is_empty() {
        if let Some(draft) = handle_diversion(app, &plan, &mut state, &mut budget, key, &input).await
        {
            return Ok(finish(app, key, &input, state, budget, draft).await);
        }
    }

    let mut hint_charged = false;
    let mut draft: Option<Draft> = None;
    let mut safety = 0usize;
    while draft.is_none() && safety < MAX_SKIPS_PER_TURN {
        safety += 1;
        match runner::decide_action(runner::current_step(&plan, &state)) {
            EngineAction::Skip => runner::next(&plan, &mut state),
            EngineAction::Explain => {
                draft = Some(explain_turn(app, &plan, &mut state, &mut budget, key).await);
            }
            EngineAction::Ask => {
                draft = Some(
                    ask_turn(
                        app,
                        &plan,
                        &mut state,
                        &mut budget,
                        &mut hint_charged,
                        key,
                        &input,
                    )
                    .await,
                );
            }
            EngineAction::End => {
                let request = GenerationRequest::new(TutorAction::End);
                let reply = call_generator(
                    app,
                    &mut budget,
                    &request,
                    "¡Llegamos al final de la lección! Buen trabajo.",
                )
                .await;
                draft = Some(Draft {
                    message: reply.message,
                    follow_up: String::new(),
                    assessment: None,
                    step_code: None,
                });
            }
        }
    }
    let draft = draft.unwrap_or_else(|| Draft {
        message: "Sigamos con la lección.".to_string(),
        follow_up: String::new(),
        assessment: None,
        step_code: None,
    });

    Ok(finish(app, key, &input, state, budget, draft).await)
}

/// Calls the generator with a deterministic fallback. Records cheap-tier
/// usage with actual token counts when the backend reports them; a drained
/// budget skips the call entirely.
async fn call_generator(
    app: &AppState,
    budget: &mut BudgetManager,
    request: &GenerationRequest,
    fallback: &str,
) -> GenerationReply {
    if !budget.can_use_tier(CostTier::Cheap) {
        return GenerationReply {
            message: fallback.to_string(),
            follow_up: None,
            units: None,
        };
    }
    match app.generator.generate(request).await {
        Ok(mut reply) => {
            budget.record_usage(CostTier::Cheap, reply.units);
            if reply.message.trim().is_empty() {
                reply.message = fallback.to_string();
            }
            reply
        }
        Err(err) => {
            warn!(error = ?err, action = ?request.action, "generator failed, using fallback");
            GenerationReply {
                message: fallback.to_string(),
                follow_up: None,
                units: None,
            }
        }
    }
}

async fn recent_history(app: &AppState, key: &str) -> Vec<String> {
    match app.store.recent_transcript(key, RECENT_HISTORY_LIMIT).await {
        Ok(entries) => entries.iter().map(TranscriptEntry::summary).collect(),
        Err(err) => {
            warn!(session_key = %key, error = ?err, "transcript read failed");
            Vec::new()
        }
    }
}

fn join_nonempty(parts: [String; 2]) -> String {
    let filtered: Vec<String> = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
    filtered.join(" ")
}

/// Consult continuation / diversion detection. Returns a draft when the
/// turn is consumed by the detour path.
async fn handle_diversion(
    app: &AppState,
    plan: &LessonPlan,
    state: &mut SessionState,
    budget: &mut BudgetManager,
    key: &str,
    input: &str,
) -> Option<Draft> {
    if state.consult_ctx.is_some() {
        let resume_now = {
            let ctx = state.consult_ctx.as_mut()?;
            ctx.turns += 1;
            consult::should_resume(ctx, input, app.config.max_consult_turns)
        };
        if resume_now {
            let pending = consult::resume(plan, state);
            debug!(session_key = %key, step_idx = state.step_idx, "consult.resume");
            let mut request = GenerationRequest::new(TutorAction::Advance);
            request.user_input = Some(input.to_string());
            request.question_text = pending.clone();
            let reply =
                call_generator(app, budget, &request, "Perfecto, retomemos donde quedamos.").await;
            let follow_up = pending.unwrap_or_default();
            state.just_asked_follow_up = !follow_up.is_empty();
            return Some(Draft {
                message: reply.message,
                follow_up,
                assessment: None,
                step_code: runner::current_step(plan, state).map(|s| s.ask_code()),
            });
        }
        let mut request = GenerationRequest::new(TutorAction::Consult);
        request.user_input = Some(input.to_string());
        request.recent_history = recent_history(app, key).await;
        let reply = call_generator(
            app,
            budget,
            &request,
            "Buena pregunta. Lo vemos brevemente y retomamos la lección.",
        )
        .await;
        let follow_up = reply
            .follow_up
            .unwrap_or_else(|| "¿Listo para continuar?".to_string());
        return Some(Draft {
            message: reply.message,
            follow_up,
            assessment: None,
            step_code: None,
        });
    }

    let kind = consult::detect_diversion(input)?;
    debug!(session_key = %key, kind = ?kind, "diversion.detected");
    if !kind.opens_consult() {
        let message = match kind {
            DiversionKind::Greeting => "¡Hola! Qué gusto. Sigamos con la lección.".to_string(),
            _ => "Puedes llamarme Sofía, tu tutora en este curso. ¿Seguimos?".to_string(),
        };
        let follow_up = runner::current_step(plan, state)
            .and_then(|s| s.data.question.clone())
            .unwrap_or_default();
        state.just_asked_follow_up = !follow_up.is_empty();
        return Some(Draft {
            message,
            follow_up,
            assessment: None,
            step_code: runner::current_step(plan, state).map(|s| s.ask_code()),
        });
    }

    consult::open_or_continue(state, kind, input);
    let mut request = GenerationRequest::new(TutorAction::Consult);
    request.user_input = Some(input.to_string());
    request.recent_history = recent_history(app, key).await;
    let reply = call_generator(
        app,
        budget,
        &request,
        "Buena pregunta. Lo vemos brevemente y retomamos la lección.",
    )
    .await;
    let follow_up = reply
        .follow_up
        .unwrap_or_else(|| "¿Listo para continuar?".to_string());
    Some(Draft {
        message: reply.message,
        follow_up,
        assessment: None,
        step_code: None,
    })
}

/// Narrates the current content step, then chains the next pending question
/// (crossing metadata only) as the follow-up.
async fn explain_turn(
    app: &AppState,
    plan: &LessonPlan,
    state: &mut SessionState,
    budget: &mut BudgetManager,
    key: &str,
) -> Draft {
    let (body, moment_title) = {
        let step = runner::current_step(plan, state);
        (
            step.map(|s| s.data.narration_parts()).unwrap_or_default(),
            step.and_then(|s| plan.moment_title(s.moment_index))
                .map(str::to_string),
        )
    };
    let mut request = GenerationRequest::new(TutorAction::Explain);
    request.content_body = body.clone();
    request.moment_title = moment_title;
    request.recent_history = recent_history(app, key).await;
    let fallback = if body.is_empty() {
        "Continuemos con la lección.".to_string()
    } else {
        body.join(" ")
    };
    let reply = call_generator(app, budget, &request, &fallback).await;

    runner::next(plan, state);
    let mut follow_up = String::new();
    let mut step_code = None;
    if let Some(ask_idx) = runner::pending_ask_at_or_after(plan, state.step_idx) {
        runner::advance_to(plan, state, ask_idx);
        if let Some(step) = plan.step(ask_idx) {
            follow_up = step.data.question.clone().unwrap_or_default();
            step_code = Some(step.ask_code());
        }
        state.just_asked_follow_up = !follow_up.is_empty();
    }
    Draft {
        message: reply.message,
        follow_up,
        assessment: None,
        step_code,
    }
}

/// After an answered question: drain metadata and produce the next beat
/// (question, narration, or the close). Returns (message, follow_up).
async fn compose_next(
    app: &AppState,
    plan: &LessonPlan,
    state: &mut SessionState,
    budget: &mut BudgetManager,
    key: &str,
) -> (String, String) {
    let mut safety = 0usize;
    while runner::decide_action(runner::current_step(plan, state)) == EngineAction::Skip
        && safety < MAX_SKIPS_PER_TURN
    {
        runner::next(plan, state);
        safety += 1;
    }
    match runner::decide_action(runner::current_step(plan, state)) {
        EngineAction::Ask => {
            let question = runner::current_step(plan, state)
                .and_then(|s| s.data.question.clone())
                .unwrap_or_default();
            state.just_asked_follow_up = !question.is_empty();
            (String::new(), question)
        }
        EngineAction::Explain => {
            let draft = explain_turn(app, plan, state, budget, key).await;
            (draft.message, draft.follow_up)
        }
        EngineAction::End => {
            let request = GenerationRequest::new(TutorAction::End);
            let reply = call_generator(
                app,
                budget,
                &request,
                "¡Llegamos al final de la lección! Buen trabajo.",
            )
            .await;
            (reply.message, String::new())
        }
        EngineAction::Skip => (String::new(), String::new()),
    }
}

/// The ask flow: bookkeeping, planner override, classification, accept /
/// force-advance / escalation ladder.
async fn ask_turn(
    app: &AppState,
    plan: &LessonPlan,
    state: &mut SessionState,
    budget: &mut BudgetManager,
    hint_charged: &mut bool,
    key: &str,
    input: &str,
) -> Draft {
    let step = match runner::current_step(plan, state) {
        Some(s) => s.clone(),
        None => return Draft::silent(None),
    };
    let question = step.data.question.clone().unwrap_or_default();
    let code = step.ask_code();
    let moment_title = plan.moment_title(step.moment_index).map(str::to_string);
    let moment_kind = policy::map_moment_kind(moment_title.as_deref());
    let expected = classify::expected_terms(plan, &step);

    if input.is_empty() {
        // Echo suppression: the question went out with the previous turn.
        if state.just_asked_follow_up {
            state.just_asked_follow_up = false;
            return Draft::silent(Some(code));
        }
        let mut request = GenerationRequest::new(TutorAction::Ask);
        request.question_text = Some(question.clone());
        request.moment_title = moment_title;
        request.recent_history = recent_history(app, key).await;
        let reply = call_generator(app, budget, &request, &question).await;
        return Draft {
            message: reply.message,
            follow_up: String::new(),
            assessment: None,
            step_code: Some(code),
        };
    }
    state.just_asked_follow_up = false;

    let dont_know = classify::is_no_se(input);
    state.record_attempt(&code);
    if dont_know {
        state.record_no_se(&code);
    }

    if state.adaptive_mode {
        let history = [HistoryEntry {
            step_idx: state.step_idx,
            action: "ask".to_string(),
            response: Some(input.to_string()),
        }];
        let ctx = PlanningContext {
            plan,
            state,
            short_history: &history,
            budget_cents_left: budget.cents_left(),
            escalations_used: state.escalations_used,
        };
        if let Some(cmd) = planner::plan_adaptation(&ctx) {
            info!(session_key = %key, op = ?cmd.op, reason = ?cmd.reason, "adaptation.planned");
            match (cmd.op, cmd.reason) {
                (AdaptOp::Hint, Some(AdaptReason::BudgetLimit)) => {
                    // Below the reserve everything stays deterministic.
                    state.register_hint(&code, hint_charged);
                    let limit = policy::hint_word_limit(state.hints_used(&code).saturating_sub(1));
                    let pool = if expected.is_empty() {
                        step.data.acceptable_answers.clone()
                    } else {
                        expected.clone()
                    };
                    state
                        .last_action_by_ask_code
                        .insert(code.clone(), TransitionAction::Hint);
                    state
                        .last_answer_by_ask_code
                        .insert(code.clone(), input.to_string());
                    state.just_asked_follow_up = !question.is_empty();
                    return Draft {
                        message: generate::hint_line(&pool, limit),
                        follow_up: question,
                        assessment: None,
                        step_code: Some(code),
                    };
                }
                (AdaptOp::Goto, _) if planner::validate_adapt_command(&cmd, plan, state) => {
                    *state = planner::apply_adapt_command(&cmd, plan, state);
                    state
                        .last_answer_by_ask_code
                        .insert(code.clone(), input.to_string());
                    let new_step = runner::current_step(plan, state).cloned();
                    let new_question = new_step
                        .as_ref()
                        .and_then(|s| s.data.question.clone())
                        .unwrap_or_default();
                    let mut request = GenerationRequest::new(TutorAction::Reask);
                    request.question_text = Some(new_question.clone());
                    request.user_input = Some(input.to_string());
                    let reply = call_generator(
                        app,
                        budget,
                        &request,
                        "Volvamos al tema de la lección.",
                    )
                    .await;
                    state.just_asked_follow_up = !new_question.is_empty();
                    return Draft {
                        message: reply.message,
                        follow_up: new_question,
                        assessment: None,
                        step_code: new_step.map(|s| s.ask_code()),
                    };
                }
                (AdaptOp::Reask, _) => {
                    state
                        .last_action_by_ask_code
                        .insert(code.clone(), TransitionAction::Ask);
                    state
                        .last_answer_by_ask_code
                        .insert(code.clone(), input.to_string());
                    let mut request = GenerationRequest::new(TutorAction::Reask);
                    request.question_text = Some(question.clone());
                    request.user_input = Some(input.to_string());
                    let reply = call_generator(app, budget, &request, &question).await;
                    return Draft {
                        message: reply.message,
                        follow_up: String::new(),
                        assessment: None,
                        step_code: Some(code),
                    };
                }
                // repeat / insert_micro shape nothing at this seam
                _ => {}
            }
        }
    }
    state
        .last_answer_by_ask_code
        .insert(code.clone(), input.to_string());

    let ask_policy = classify::policy_for_step(&step, state.attempts(&code).saturating_sub(1));
    let cls = match app
        .classifier
        .classify(input, &step, &ask_policy, &expected)
        .await
    {
        Ok(c) => {
            budget.record_usage(CostTier::Embed, None);
            c
        }
        Err(err) => {
            warn!(session_key = %key, error = ?err, "classifier failed, using keyword fallback");
            KeywordClassifier::default().classify_turn(
                input,
                &ask_policy,
                &step.data.acceptable_answers,
                &expected,
            )
        }
    };

    if cls.kind == ClassKind::Accept {
        state.mark_answered(&code);
        state.reset_no_se(&code);
        state
            .last_action_by_ask_code
            .insert(code.clone(), TransitionAction::Ok);
        let feedback = generate::deterministic_feedback(&cls, state.hints_used(&code));
        runner::next(plan, state);
        let (next_message, follow_up) = compose_next(app, plan, state, budget, key).await;
        return Draft {
            message: join_nonempty([feedback, next_message]),
            follow_up,
            assessment: Some(ClassKind::Accept),
            step_code: Some(code),
        };
    }
    if cls.kind == ClassKind::Partial {
        state.mark_partially_answered(&code);
    }

    if let Some(reason) = policy::decide_force_advance(
        state.attempts(&code),
        state.no_se_count(&code),
        moment_kind,
        &app.advance_policy,
    ) {
        info!(session_key = %key, reason = ?reason, step_idx = state.step_idx, "force.advance");
        let target = runner::next_ask_in_same_cycle(plan, state.step_idx)
            .or_else(|| runner::first_ask_of_next_cycle(plan, state.step_idx));
        let mut request = GenerationRequest::new(TutorAction::Advance);
        request.user_input = Some(input.to_string());
        request.question_text = Some(question.clone());
        let reply =
            call_generator(app, budget, &request, "No pasa nada, sigamos avanzando.").await;
        match target {
            Some(t) => {
                runner::advance_to(plan, state, t);
                let next_question = plan
                    .step(t)
                    .and_then(|s| s.data.question.clone())
                    .unwrap_or_default();
                state.just_asked_follow_up = !next_question.is_empty();
                return Draft {
                    message: reply.message,
                    follow_up: next_question,
                    assessment: Some(cls.kind),
                    step_code: Some(code),
                };
            }
            None => {
                runner::next(plan, state);
                let (next_message, follow_up) =
                    compose_next(app, plan, state, budget, key).await;
                return Draft {
                    message: join_nonempty([reply.message, next_message]),
                    follow_up,
                    assessment: Some(cls.kind),
                    step_code: Some(code),
                };
            }
        }
    }

    let decision = policy::decide_next_action(
        state.last_action(&code),
        Some(cls.kind),
        state.no_se_count(&code),
        app.advance_policy.escalation.as_ref(),
    );
    let mut next_action = decision.action;
    if policy::options_due(dont_know, state.no_se_count(&code)) {
        next_action = TransitionAction::AskOptions;
    }
    state
        .last_action_by_ask_code
        .insert(code.clone(), next_action);

    let feedback = generate::deterministic_feedback(&cls, state.hints_used(&code));
    match next_action {
        TransitionAction::Hint => {
            state.register_hint(&code, hint_charged);
            let limit = policy::hint_word_limit(state.hints_used(&code).saturating_sub(1));
            let mut request = GenerationRequest::new(TutorAction::Hint);
            request.question_text = Some(question.clone());
            request.user_input = Some(input.to_string());
            request.matched = cls.matched.clone();
            request.missing = cls.missing.clone();
            request.word_limit = Some(limit);
            let pool = if cls.missing.is_empty() {
                expected.clone()
            } else {
                cls.missing.clone()
            };
            let fallback = generate::hint_line(&pool, limit);
            let reply = call_generator(app, budget, &request, &fallback).await;
            let follow_up = reply.follow_up.unwrap_or_else(|| question.clone());
            state.just_asked_follow_up = !follow_up.is_empty();
            Draft {
                message: join_nonempty([feedback, reply.message]),
                follow_up,
                assessment: Some(cls.kind),
                step_code: Some(code),
            }
        }
        TransitionAction::AskSimple => {
            let mut request = GenerationRequest::new(TutorAction::AskSimple);
            request.question_text = Some(question.clone());
            request.user_input = Some(input.to_string());
            request.missing = cls.missing.clone();
            let fallback = format!("Dicho más simple: {question}");
            let reply = call_generator(app, budget, &request, &fallback).await;
            Draft {
                message: join_nonempty([feedback, reply.message]),
                follow_up: String::new(),
                assessment: Some(cls.kind),
                step_code: Some(code),
            }
        }
        TransitionAction::AskOptions => {
            let pair = policy::options_pair(&cls.missing, &expected);
            let mut request = GenerationRequest::new(TutorAction::AskOptions);
            request.question_text = Some(question.clone());
            request.options = pair.clone();
            let fallback = match pair.as_slice() {
                [a, b] => format!("¿Cuál corresponde mejor: \"{a}\" o \"{b}\"?"),
                [a] => format!("¿Tiene que ver con \"{a}\"?"),
                _ => question.clone(),
            };
            let reply = call_generator(app, budget, &request, &fallback).await;
            Draft {
                message: join_nonempty([feedback, reply.message]),
                follow_up: String::new(),
                assessment: Some(cls.kind),
                step_code: Some(code),
            }
        }
        TransitionAction::Explain => {
            // The ladder's last rung: re-present the cycle's content.
            let body = runner::cycle_index_for_step(plan, state.step_idx)
                .and_then(|ci| plan.content_cycles[ci].content_step_index)
                .and_then(|i| plan.step(i))
                .map(|s| s.data.narration_parts())
                .unwrap_or_default();
            let mut request = GenerationRequest::new(TutorAction::Explain);
            request.content_body = body.clone();
            request.question_text = Some(question.clone());
            let fallback = if body.is_empty() {
                question.clone()
            } else {
                body.join(" ")
            };
            let reply = call_generator(app, budget, &request, &fallback).await;
            state.just_asked_follow_up = !question.is_empty();
            Draft {
                message: join_nonempty([feedback, reply.message]),
                follow_up: question,
                assessment: Some(cls.kind),
                step_code: Some(code),
            }
        }
        TransitionAction::Ask | TransitionAction::Ok => {
            let mut request = GenerationRequest::new(TutorAction::Reask);
            request.question_text = Some(question.clone());
            request.user_input = Some(input.to_string());
            let reply = call_generator(app, budget, &request, &question).await;
            Draft {
                message: join_nonempty([feedback, reply.message]),
                follow_up: String::new(),
                assessment: Some(cls.kind),
                step_code: Some(code),
            }
        }
    }
}

async fn finish(
    app: &AppState,
    key: &str,
    input: &str,
    mut state: SessionState,
    budget: BudgetManager,
    draft: Draft,
) -> TurnOutcome {
    state.budget_cents_left = budget.cents_left();
    if let Err(err) = app.store.set(key, &state).await {
        warn!(session_key = %key, error = ?err, "failed to persist session state");
    }
    if !draft.message.is_empty() || !draft.follow_up.is_empty() {
        let entry = TranscriptEntry {
            at: Utc::now(),
            step_idx: state.step_idx,
            moment_idx: state.moment_idx,
            user_input: input.to_string(),
            message: draft.message.clone(),
            follow_up: draft.follow_up.clone(),
        };
        if let Err(err) = app.store.append_transcript(key, &entry).await {
            warn!(session_key = %key, error = ?err, "failed to append transcript");
        }
    }
    debug!(
        session_key = %key,
        step_idx = state.step_idx,
        done = state.done,
        budget_cents_left = state.budget_cents_left,
        "engine.turn.end"
    );
    let hints_used = draft
        .step_code
        .as_deref()
        .map(|c| state.hints_used(c))
        .unwrap_or(0);
    TurnOutcome {
        message: draft.message,
        follow_up: draft.follow_up,
        assessment: draft.assessment,
        step_code: draft.step_code,
        moment_idx: state.moment_idx,
        hints_used,
        budget_metrics: state.adaptive_mode.then(|| budget.metrics()),
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Provider, StoreBackend};
    use crate::models::ClientStateSnapshot;
    use crate::store::MemoryStore;
    use mentor_core::generate::OfflineGenerator;
    use mentor_core::plan::{compile_plan, TimelineFile};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::Level;

    const PLAN_URL: &str = "test-lesson.json";

    // Step layout: 0=ASK C1, 1=ASK C2 (Conexión, headless cycle),
    // 2=CONTENT, 3=KEY_POINTS, 4=ASK A1, 5=ASK A2 (Adquisición).
    fn plan() -> LessonPlan {
        let timeline: TimelineFile = serde_json::from_str(
            r#"{ "moments": [
              { "title": "Momento de Conexión", "steps": [
                { "type": "ASK", "code": "C1", "question": "¿Qué sabes de los extintores?",
                  "acceptable_answers": ["bien", "apagar"] },
                { "type": "ASK", "code": "C2", "question": "¿Dónde has visto un extintor?",
                  "acceptable_answers": ["taller"] }
              ] },
              { "title": "Adquisición", "steps": [
                { "type": "CONTENT", "title": "El extintor",
                  "body": ["El extintor PQS apaga fuegos incipientes."] },
                { "type": "KEY_POINTS", "items": ["extintor", "fuego incipiente"] },
                { "type": "ASK", "code": "A1", "question": "¿Para qué sirve un extintor?",
                  "acceptable_answers": ["apagar fuego"],
                  "objective": "reconocer que el extintor sirve para apagar fuegos incipientes" },
                { "type": "ASK", "code": "A2", "question": "¿Qué tipos de extintor conoces?",
                  "acceptable_answers": ["pqs", "co2"], "question_type": "listado" }
              ] }
            ] }"#,
        )
        .unwrap();
        compile_plan(timeline)
    }

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            provider: Provider::Offline,
            openai_api_key: None,
            gemini_api_key: None,
            chat_model: "test-model".to_string(),
            plan_base_dir: PathBuf::from("."),
            default_plan_url: PLAN_URL.to_string(),
            budget_cents: 100.0,
            max_consult_turns: 3,
            log_level: Level::INFO,
        }
    }

    async fn app() -> AppState {
        let state = AppState::new(
            Arc::new(MemoryStore::default()),
            Arc::new(OfflineGenerator),
            Arc::new(KeywordClassifier::default()),
            Arc::new(test_config()),
        );
        state.insert_plan(PLAN_URL, plan()).await;
        state
    }

    fn turn(key: &str, input: &str) -> TurnRequest {
        TurnRequest {
            session_key: key.to_string(),
            user_input: input.to_string(),
            plan_url: None,
            reset: false,
            client_state: None,
            adaptive_mode: None,
        }
    }

    async fn seed(app: &AppState, key: &str, step_idx: usize, moment_idx: usize) -> SessionState {
        let mut s = SessionState::new(PLAN_URL, 100.0, false);
        s.step_idx = step_idx;
        s.moment_idx = moment_idx;
        app.store.set(key, &s).await.unwrap();
        s
    }

    #[tokio::test]
    async fn first_turn_emits_opening_question() {
        let app = app().await;
        let out = run_turn(&app, &turn("s1", "")).await.unwrap();
        assert_eq!(out.message, "¿Qué sabes de los extintores?");
        assert_eq!(out.follow_up, "");
        assert_eq!(out.state.step_idx, 0);
        assert_eq!(out.step_code.as_deref(), Some("C1"));
        assert!(out.budget_metrics.is_none(), "non-adaptive hides metrics");
    }

    #[tokio::test]
    async fn accept_advances_and_chains_next_question() {
        let app = app().await;
        run_turn(&app, &turn("s2", "")).await.unwrap();
        let out = run_turn(&app, &turn("s2", "muy bien, con ganas de aprender"))
            .await
            .unwrap();
        assert_eq!(out.assessment, Some(ClassKind::Accept));
        assert!(out.message.starts_with("Bien: mencionaste"));
        assert_eq!(out.follow_up, "¿Dónde has visto un extintor?");
        assert_eq!(out.state.step_idx, 1);
        assert!(out.state.answered_ask_codes.contains("C1"));
        assert!(out.state.just_asked_follow_up);
    }

    #[tokio::test]
    async fn empty_input_after_follow_up_stays_silent() {
        let app = app().await;
        run_turn(&app, &turn("s3", "")).await.unwrap();
        run_turn(&app, &turn("s3", "muy bien")).await.unwrap();
        let out = run_turn(&app, &turn("s3", "")).await.unwrap();
        assert_eq!(out.message, "");
        assert_eq!(out.follow_up, "");
        assert!(!out.state.just_asked_follow_up);
    }

    #[tokio::test]
    async fn accept_on_last_ask_narrates_next_content() {
        let app = app().await;
        seed(&app, "s4", 1, 0).await;
        let out = run_turn(&app, &turn("s4", "en el taller de mi trabajo"))
            .await
            .unwrap();
        assert_eq!(out.assessment, Some(ClassKind::Accept));
        assert!(out.message.contains("El extintor PQS apaga fuegos incipientes."));
        assert_eq!(out.follow_up, "¿Para qué sirve un extintor?");
        assert_eq!(out.state.step_idx, 4);
        assert_eq!(out.state.moment_idx, 1);
    }

    #[tokio::test]
    async fn dont_know_hints_once_then_options() {
        let app = app().await;
        seed(&app, "s5", 4, 1).await;

        let out = run_turn(&app, &turn("s5", "no sé")).await.unwrap();
        assert_eq!(out.assessment, Some(ClassKind::Hint));
        assert_eq!(out.hints_used, 1, "at most one hint per turn");
        assert_eq!(out.state.no_se_count("A1"), 1);
        assert_eq!(out.state.attempts("A1"), 1);
        assert_eq!(out.follow_up, "¿Para qué sirve un extintor?");
        assert!(out.message.contains("Pista"));

        let out = run_turn(&app, &turn("s5", "no se")).await.unwrap();
        assert_eq!(out.state.no_se_count("A1"), 2);
        assert_eq!(
            out.state.last_action("A1"),
            TransitionAction::AskOptions,
            "second consecutive don't-know offers options"
        );
        assert!(out.message.contains("¿Cuál corresponde mejor"));
        assert_eq!(out.hints_used, 1, "options turn charges no hint");
        assert_eq!(out.state.step_idx, 4, "position unchanged");
    }

    #[tokio::test]
    async fn force_advance_only_in_allowed_moment() {
        let app = app().await;

        // Conexión: third attempt forces progression to the next ask.
        let mut s = seed(&app, "s6", 0, 0).await;
        s.attempts_by_ask_code.insert("C1".to_string(), 2);
        app.store.set("s6", &s).await.unwrap();
        let out = run_turn(&app, &turn("s6", "quién sabe")).await.unwrap();
        assert_eq!(out.state.attempts("C1"), 3);
        assert_eq!(out.state.step_idx, 1);
        assert_eq!(out.follow_up, "¿Dónde has visto un extintor?");

        // Adquisición: same counters never force.
        let mut s = seed(&app, "s7", 4, 1).await;
        s.attempts_by_ask_code.insert("A1".to_string(), 5);
        s.no_se_count_by_ask_code.insert("A1".to_string(), 5);
        app.store.set("s7", &s).await.unwrap();
        let out = run_turn(&app, &turn("s7", "una manguera")).await.unwrap();
        assert_eq!(out.state.step_idx, 4, "no force outside the allowed set");
    }

    #[tokio::test]
    async fn zero_budget_adaptive_always_deterministic_hint() {
        let app = app().await;
        let mut s = SessionState::new(PLAN_URL, 0.0, true);
        s.step_idx = 4;
        s.moment_idx = 1;
        app.store.set("s8", &s).await.unwrap();

        let out = run_turn(&app, &turn("s8", "el extintor sirve para apagar fuegos"))
            .await
            .unwrap();
        assert!(out.message.starts_with("Pista"), "on-topic answer still gets the budget hint");
        assert_eq!(out.assessment, None, "no classifier call below the reserve");
        assert_eq!(out.state.step_idx, 4);
        assert_eq!(out.state.hints_used("A1"), 1);
        let metrics = out.budget_metrics.expect("adaptive exposes metrics");
        assert_eq!(metrics.budget_cents_left, 0.0);
        assert!(!metrics.can_escalate);
    }

    #[tokio::test]
    async fn off_topic_adaptive_jumps_to_next_ask_in_cycle() {
        let app = app().await;
        let mut s = SessionState::new(PLAN_URL, 100.0, true);
        s.step_idx = 4;
        s.moment_idx = 1;
        app.store.set("s9", &s).await.unwrap();

        let out = run_turn(&app, &turn("s9", "ayer vi una película muy buena"))
            .await
            .unwrap();
        assert_eq!(out.state.step_idx, 5);
        assert_eq!(out.step_code.as_deref(), Some("A2"));
        assert_eq!(out.follow_up, "¿Qué tipos de extintor conoces?");
    }

    #[tokio::test]
    async fn diversion_round_trip_restores_position() {
        let app = app().await;
        seed(&app, "s10", 4, 1).await;

        let out = run_turn(&app, &turn("s10", "¿puedo hacer una pregunta sobre el humo?"))
            .await
            .unwrap();
        let ctx = out.state.consult_ctx.clone().expect("consult opened");
        assert_eq!(ctx.paused_at.step_idx, 4);
        assert_eq!(out.state.diversion_stack.len(), 1);
        assert!(out.message.contains("Buena pregunta"));

        let out = run_turn(&app, &turn("s10", "listo")).await.unwrap();
        assert!(out.state.consult_ctx.is_none());
        assert_eq!(out.state.step_idx, 4);
        assert_eq!(out.follow_up, "¿Para qué sirve un extintor?");
    }

    #[tokio::test]
    async fn consult_auto_closes_after_max_turns() {
        let app = app().await;
        seed(&app, "s11", 4, 1).await;

        run_turn(&app, &turn("s11", "tengo una duda sobre el humo"))
            .await
            .unwrap();
        run_turn(&app, &turn("s11", "¿y el humo negro es peor?"))
            .await
            .unwrap();
        let out = run_turn(&app, &turn("s11", "¿y el humo blanco?")).await.unwrap();
        assert!(out.state.consult_ctx.is_none(), "cap closes the detour");
        assert_eq!(out.state.step_idx, 4);
        assert_eq!(out.follow_up, "¿Para qué sirve un extintor?");
    }

    #[tokio::test]
    async fn greeting_answered_inline() {
        let app = app().await;
        seed(&app, "s12", 4, 1).await;
        let out = run_turn(&app, &turn("s12", "hola")).await.unwrap();
        assert!(out.state.consult_ctx.is_none());
        assert!(out.state.diversion_stack.is_empty());
        assert_eq!(out.follow_up, "¿Para qué sirve un extintor?");
    }

    #[tokio::test]
    async fn reset_starts_over() {
        let app = app().await;
        seed(&app, "s13", 4, 1).await;
        let mut req = turn("s13", "");
        req.reset = true;
        let out = run_turn(&app, &req).await.unwrap();
        assert_eq!(out.state.step_idx, 0);
        assert_eq!(out.message, "¿Qué sabes de los extintores?");
    }

    #[tokio::test]
    async fn client_snapshot_never_regresses() {
        let app = app().await;
        seed(&app, "s14", 4, 1).await;
        let mut req = turn("s14", "");
        req.client_state = Some(ClientStateSnapshot {
            step_idx: Some(1),
            moment_idx: Some(0),
            ..Default::default()
        });
        let out = run_turn(&app, &req).await.unwrap();
        assert_eq!(out.state.step_idx, 4);

        let mut req = turn("s15", "");
        req.client_state = Some(ClientStateSnapshot {
            step_idx: Some(4),
            moment_idx: Some(1),
            ..Default::default()
        });
        let out = run_turn(&app, &req).await.unwrap();
        assert_eq!(out.state.step_idx, 4, "fresh session fast-forwards");
        assert_eq!(out.message, "¿Para qué sirve un extintor?");
    }

    #[tokio::test]
    async fn lesson_end_marks_done() {
        let app = app().await;
        seed(&app, "s16", 5, 1).await;
        let out = run_turn(&app, &turn("s16", "pqs y también co2")).await.unwrap();
        assert_eq!(out.assessment, Some(ClassKind::Accept));
        assert!(out.state.done);
        assert!(out.message.contains("final"));
    }

    #[tokio::test]
    async fn idle_session_locks_are_evicted() {
        let app = app().await;
        for n in 0..5 {
            run_turn(&app, &turn(&format!("lk{n}"), "")).await.unwrap();
        }
        let held = app.session_lock("lk-live").await;
        assert_eq!(
            app.session_lock_count().await,
            1,
            "only the lock still held survives a fetch"
        );
        drop(held);
    }

    #[tokio::test]
    async fn budget_writes_back_to_state() {
        let app = app().await;
        run_turn(&app, &turn("s17", "")).await.unwrap();
        let stored = app.store.get("s17").await.unwrap().unwrap();
        assert!(stored.budget_cents_left < 100.0, "generator usage debits the budget");
        assert!(stored.budget_cents_left >= 0.0);
    }
}
