//! mentor-core: turn-decision and adaptive-planning engine for a
//! turn-based AI tutoring dialogue.
//!
//! Pure decisions live here; language generation, semantic classification
//! and persistence are collaborators behind traits so the HTTP shell can
//! wire real or deterministic implementations.

pub mod budget;
pub mod classify;
pub mod consult;
pub mod generate;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod runner;
pub mod session;

pub use budget::{BudgetManager, BudgetMetrics, CostTier};
pub use classify::{AnswerClassifier, ClassKind, Classification, KeywordClassifier};
pub use generate::{GenerationReply, GenerationRequest, LanguageGenerator, TutorAction};
pub use plan::{LessonPlan, Step, StepType};
pub use planner::{AdaptCommand, AdaptOp, AdaptReason};
pub use policy::{AdvancePolicy, MomentKind, TransitionAction};
pub use session::SessionState;
