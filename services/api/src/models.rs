//! API Models
//!
//! Wire-level request and response types for the turn endpoint and session
//! management, with `utoipa` schemas for the OpenAPI document. The wire
//! format is camelCase; internal state stays snake_case.

use mentor_core::budget::BudgetMetrics;
use mentor_core::classify::ClassKind;
use mentor_core::policy::TransitionAction;
use mentor_core::session::ClientRehydration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// One student turn.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[schema(example = "user-42:lesson02")]
    pub session_key: String,
    #[serde(default)]
    #[schema(example = "el extintor apaga fuegos incipientes")]
    pub user_input: String,
    /// Overrides the configured default lesson on session creation.
    pub plan_url: Option<String>,
    /// Discards any stored session under this key before running the turn.
    #[serde(default)]
    pub reset: bool,
    /// Optional client-side progress snapshot; merged forward-only.
    pub client_state: Option<ClientStateSnapshot>,
    /// Turns the adaptive planner on or off for this session.
    pub adaptive_mode: Option<bool>,
}

/// Progress snapshot a client may replay after losing its session cookie.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientStateSnapshot {
    pub moment_idx: Option<usize>,
    pub step_idx: Option<usize>,
    #[schema(value_type = Object)]
    pub attempts_by_ask_code: HashMap<String, u32>,
    #[schema(value_type = Object)]
    pub no_se_count_by_ask_code: HashMap<String, u32>,
    #[schema(value_type = Object)]
    pub last_action_by_ask_code: HashMap<String, TransitionAction>,
    #[schema(value_type = Object)]
    pub last_answer_by_ask_code: HashMap<String, String>,
    pub just_asked_follow_up: Option<bool>,
    pub done: Option<bool>,
}

impl From<ClientStateSnapshot> for ClientRehydration {
    fn from(snap: ClientStateSnapshot) -> Self {
        ClientRehydration {
            moment_idx: snap.moment_idx,
            step_idx: snap.step_idx,
            attempts_by_ask_code: snap.attempts_by_ask_code,
            no_se_count_by_ask_code: snap.no_se_count_by_ask_code,
            last_action_by_ask_code: snap.last_action_by_ask_code,
            last_answer_by_ask_code: snap.last_answer_by_ask_code,
            just_asked_follow_up: snap.just_asked_follow_up,
            done: snap.done,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub message: String,
    /// Question re-emitted alongside the message, empty when none.
    pub follow_up: String,
    /// Classification of the student's answer, when one was evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "PARTIAL")]
    pub assessment: Option<ClassKind>,
    pub state: TurnStateDto,
    pub step_code: Option<String>,
    pub moment_idx: usize,
    /// Present only when the session runs in adaptive mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub budget_metrics: Option<BudgetMetrics>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnStateDto {
    pub step_idx: usize,
    pub done: bool,
    pub hints_used: u32,
    pub max_hints: u32,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_request_decodes_camel_case() {
        let req: TurnRequest = serde_json::from_str(
            r#"{
              "sessionKey": "u1:l2",
              "userInput": "no sé",
              "reset": true,
              "adaptiveMode": true,
              "clientState": { "stepIdx": 4, "attemptsByAskCode": { "A1": 2 } }
            }"#,
        )
        .unwrap();
        assert_eq!(req.session_key, "u1:l2");
        assert_eq!(req.user_input, "no sé");
        assert!(req.reset);
        assert_eq!(req.adaptive_mode, Some(true));
        let snap = req.client_state.unwrap();
        assert_eq!(snap.step_idx, Some(4));
        assert_eq!(snap.attempts_by_ask_code.get("A1"), Some(&2));
    }

    #[test]
    fn turn_request_defaults() {
        let req: TurnRequest = serde_json::from_str(r#"{ "sessionKey": "u1:l2" }"#).unwrap();
        assert_eq!(req.user_input, "");
        assert!(!req.reset);
        assert!(req.plan_url.is_none());
        assert!(req.client_state.is_none());
    }

    #[test]
    fn turn_response_serializes_camel_case() {
        let resp = TurnResponse {
            message: "Bien".to_string(),
            follow_up: String::new(),
            assessment: Some(ClassKind::Accept),
            state: TurnStateDto {
                step_idx: 3,
                done: false,
                hints_used: 1,
                max_hints: 3,
            },
            step_code: Some("A1".to_string()),
            moment_idx: 0,
            budget_metrics: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["followUp"], "");
        assert_eq!(json["assessment"], "ACCEPT");
        assert_eq!(json["state"]["stepIdx"], 3);
        assert_eq!(json["stepCode"], "A1");
        assert!(json.get("budgetMetrics").is_none());
    }
}
