//! Compiled Lesson Plan Model
//!
//! A lesson arrives as a timeline JSON file produced by an external authoring
//! pipeline. This module decodes it and compiles it into an immutable
//! [`LessonPlan`]: a flat, ordered list of steps plus derived indexes
//! (content cycles and the ask catalog) that the runner and planner navigate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The kind of a single plan step.
///
/// `Ask` steps carry a question; `Content`/`Narration`/`Case`/
/// `ReflectionAreas` are presented to the student; the remaining kinds are
/// metadata consumed during compilation and skipped at runtime, as is any
/// type this engine does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Ask,
    Content,
    Narration,
    Case,
    ReflectionAreas,
    KeyContent,
    KeyPoints,
    KeyElements,
    Topics,
    ExpectedLearning,
    #[serde(other)]
    Other,
}

/// The payload of a step. Fields are sparse: question steps fill the
/// question-related fields, content steps fill title/body/text/items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepData {
    pub title: Option<String>,
    pub text: Option<String>,
    pub body: Vec<String>,
    pub items: Vec<String>,
    pub question: Option<String>,
    pub acceptable_answers: Vec<String>,
    pub expected: Vec<String>,
    pub objective: Option<String>,
    pub question_type: Option<String>,
}

impl StepData {
    /// Everything presentable in this step, in display order.
    pub fn narration_parts(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(t) = &self.title {
            parts.push(t.clone());
        }
        parts.extend(self.body.iter().cloned());
        if let Some(t) = &self.text {
            parts.push(t.clone());
        }
        parts.extend(self.items.iter().cloned());
        parts.retain(|p| !p.trim().is_empty());
        parts
    }
}

/// One unit of the compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub moment_index: usize,
    pub step_index: usize,
    pub code: Option<String>,
    pub order: Option<i64>,
    pub step_type: StepType,
    pub data: StepData,
}

impl Step {
    /// Stable identifier used to key per-question counters. Ask steps
    /// without an authored code fall back to a question-derived key.
    pub fn ask_code(&self) -> String {
        if let Some(code) = &self.code {
            return code.clone();
        }
        let q = self.data.question.as_deref().unwrap_or_default();
        let prefix: String = q.chars().take(50).collect();
        format!("Q:{prefix}")
    }
}

/// A pedagogical moment: a titled phase of the lesson grouping several steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub title: String,
    pub code: Option<String>,
    pub order: Option<i64>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanMeta {
    pub lesson_name: Option<String>,
    pub course_id: Option<String>,
}

/// One content presentation paired with the question steps that depend on
/// it. Ask steps appearing before any content form a headless cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCycle {
    pub content_step_index: Option<usize>,
    pub ask_step_indices: Vec<usize>,
}

/// Catalog entry for a question step, for quick lookup by code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskCatalogEntry {
    pub global_index: usize,
    pub moment_index: usize,
    pub step_index: usize,
    pub code: Option<String>,
    pub question: String,
    pub acceptable: Vec<String>,
}

/// The immutable compiled lesson. Created once by [`compile_plan`] and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub meta: PlanMeta,
    pub moments: Vec<Moment>,
    pub all_steps: Vec<Step>,
    pub content_cycles: Vec<ContentCycle>,
    pub ask_catalog: Vec<AskCatalogEntry>,
}

impl LessonPlan {
    pub fn len(&self) -> usize {
        self.all_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.all_steps.get(index)
    }

    pub fn moment_title(&self, moment_index: usize) -> Option<&str> {
        self.moments.get(moment_index).map(|m| m.title.as_str())
    }

    /// Resolves a step code to its global index.
    pub fn index_of_code(&self, code: &str) -> Option<usize> {
        self.all_steps
            .iter()
            .position(|s| s.code.as_deref() == Some(code))
    }
}

// --- Timeline decoding ---

#[derive(Debug, Deserialize)]
pub struct TimelineFile {
    #[serde(default)]
    pub meta: PlanMeta,
    #[serde(default)]
    pub moments: Vec<TimelineMoment>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineMoment {
    #[serde(default)]
    pub title: String,
    pub code: Option<String>,
    pub order: Option<i64>,
    #[serde(default)]
    pub steps: Vec<TimelineEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineEntry {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub code: Option<String>,
    pub order: Option<i64>,
    #[serde(flatten)]
    pub data: StepData,
}

/// Compiles a decoded timeline into a [`LessonPlan`].
///
/// Steps are ordered by their authored `order` within each moment. Content
/// cycles are derived by proximity: each CONTENT step opens a cycle and the
/// ASK steps that follow it (up to the next CONTENT) belong to it, so every
/// ask index lands in exactly one cycle.
pub fn compile_plan(timeline: TimelineFile) -> LessonPlan {
    let moments: Vec<Moment> = timeline
        .moments
        .into_iter()
        .enumerate()
        .map(|(mi, m)| {
            let mut entries = m.steps;
            entries.sort_by_key(|s| s.order.unwrap_or(0));
            let steps = entries
                .into_iter()
                .enumerate()
                .map(|(si, e)| Step {
                    moment_index: mi,
                    step_index: si,
                    code: e.code,
                    order: e.order,
                    step_type: e.step_type,
                    data: e.data,
                })
                .collect();
            Moment {
                title: m.title,
                code: m.code,
                order: m.order,
                steps,
            }
        })
        .collect();

    let all_steps: Vec<Step> = moments.iter().flat_map(|m| m.steps.clone()).collect();

    let mut content_cycles: Vec<ContentCycle> = Vec::new();
    let mut current: Option<ContentCycle> = None;
    for (i, step) in all_steps.iter().enumerate() {
        match step.step_type {
            StepType::Content => {
                if let Some(cycle) = current.take() {
                    content_cycles.push(cycle);
                }
                current = Some(ContentCycle {
                    content_step_index: Some(i),
                    ask_step_indices: Vec::new(),
                });
            }
            StepType::Ask => {
                let cycle = current.get_or_insert(ContentCycle {
                    content_step_index: None,
                    ask_step_indices: Vec::new(),
                });
                cycle.ask_step_indices.push(i);
            }
            _ => {}
        }
    }
    if let Some(cycle) = current.take() {
        content_cycles.push(cycle);
    }

    let ask_catalog = all_steps
        .iter()
        .enumerate()
        .filter_map(|(idx, s)| {
            let question = s.data.question.clone()?;
            if question.is_empty() {
                return None;
            }
            Some(AskCatalogEntry {
                global_index: idx,
                moment_index: s.moment_index,
                step_index: s.step_index,
                code: s.code.clone(),
                question,
                acceptable: s.data.acceptable_answers.clone(),
            })
        })
        .collect();

    LessonPlan {
        meta: timeline.meta,
        moments,
        all_steps,
        content_cycles,
        ask_catalog,
    }
}

/// Loads a timeline by URL (http/https) or by path relative to `base_dir`,
/// then compiles it. Results are pure for a given URL, so callers cache the
/// compiled plan keyed by URL.
pub async fn load_and_compile(url: &str, base_dir: &Path) -> Result<LessonPlan> {
    let timeline: TimelineFile = if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("fetching plan from '{url}'"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding plan from '{url}'"))?
    } else {
        let path = base_dir.join(url.trim_start_matches('/'));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading plan file '{}'", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("decoding plan file '{}'", path.display()))?
    };
    Ok(compile_plan(timeline))
}
