//! Answer classification.
//!
//! The semantic contract is the [`AnswerClassifier`] trait; the engine ships
//! one deterministic implementation built on Spanish text normalization,
//! keyword matching and fuzzy token comparison. It is cheap enough to run on
//! every turn and doubles as the fallback when a richer classifier fails.

use crate::plan::{LessonPlan, Step, StepType};
use anyhow::Result;
use async_trait::async_trait;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};

const MAX_EXPECTED_TERMS: usize = 40;
const MIN_FUZZY_TOKEN_LEN: usize = 4;

/// Outcome classes for a student answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassKind {
    Accept,
    Partial,
    Hint,
    Refocus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ClassKind,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub reason: String,
    pub similarity: Option<f32>,
}

/// Question taxonomy driving the acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Conceptual,
    Listado,
    Aplicacion,
    Identificacion,
    Experiencial,
    Metacognitiva,
    Reflexiva,
}

impl QuestionType {
    pub fn from_raw(raw: Option<&str>) -> Self {
        let r = normalize(raw.unwrap_or_default());
        if r.contains("lista") {
            QuestionType::Listado
        } else if r.contains("aplica") {
            QuestionType::Aplicacion
        } else if r.contains("identifica") {
            QuestionType::Identificacion
        } else if r.contains("experien") {
            QuestionType::Experiencial
        } else if r.contains("metacogn") || r.contains("abierta") {
            QuestionType::Metacognitiva
        } else if r.contains("reflexi") {
            QuestionType::Reflexiva
        } else {
            QuestionType::Conceptual
        }
    }
}

/// Resolved acceptance policy for one ask step.
#[derive(Debug, Clone, PartialEq)]
pub struct AskPolicy {
    pub question_type: QuestionType,
    /// How many acceptable answers must match to accept.
    pub threshold_k: usize,
    /// Application questions also need a justification connector.
    pub requires_justification: bool,
}

/// Derives the policy for a step. List questions get a lenient first
/// attempt (one item is enough) and ask for two afterwards.
pub fn policy_for_step(step: &Step, attempts_so_far: u32) -> AskPolicy {
    let question_type = QuestionType::from_raw(step.data.question_type.as_deref());
    let threshold_k = match question_type {
        QuestionType::Listado => {
            if attempts_so_far == 0 {
                1
            } else {
                2
            }
        }
        _ => 1,
    };
    AskPolicy {
        question_type,
        threshold_k,
        requires_justification: question_type == QuestionType::Aplicacion,
    }
}

/// Lowercases, folds Spanish accents, collapses exaggerated letter repeats
/// ("siiii" → "sii") and strips everything but letters, digits and spaces.
pub fn normalize(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for c in input.to_lowercase().chars() {
        let c = match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        };
        if c.is_alphanumeric() {
            folded.push(c);
        } else {
            folded.push(' ');
        }
    }
    let mut collapsed = String::with_capacity(folded.len());
    let mut streak = 0u32;
    let mut prev: Option<char> = None;
    for c in folded.chars() {
        if Some(c) == prev {
            streak += 1;
        } else {
            streak = 1;
            prev = Some(c);
        }
        if streak <= 2 {
            collapsed.push(c);
        }
    }
    collapsed.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokenize(input: &str) -> Vec<String> {
    normalize(input)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

const STOPWORDS: &[&str] = &[
    "el", "la", "los", "las", "un", "una", "unos", "unas", "de", "del", "al", "a", "en", "y",
    "o", "u", "que", "se", "es", "son", "con", "por", "para", "su", "sus", "lo", "le", "les",
    "mi", "mis", "tu", "tus", "me", "te", "si", "no", "mas", "muy", "ya", "hay", "como",
    "cuando", "donde", "este", "esta", "esto", "estos", "estas", "ese", "esa", "eso", "pero",
    "tambien", "porque", "entre", "sobre", "ser", "estar", "fue", "era", "han", "ha", "he",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

fn content_tokens(input: &str) -> Vec<String> {
    tokenize(input)
        .into_iter()
        .filter(|t| t.len() > 2 && !is_stopword(t))
        .collect()
}

/// Keyword pool from free text: content tokens, deduplicated in order,
/// capped so prompts stay small.
pub fn extract_keywords<I, S>(texts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for text in texts {
        for token in content_tokens(text.as_ref()) {
            if !out.contains(&token) {
                out.push(token);
                if out.len() >= MAX_EXPECTED_TERMS {
                    return out;
                }
            }
        }
    }
    out
}

/// Keyword pool an answer at `step` is expected to draw from: the authored
/// `expected` list plus terms from content already shown in the same moment.
pub fn expected_terms(plan: &LessonPlan, step: &Step) -> Vec<String> {
    let mut texts: Vec<String> = step.data.expected.clone();
    if let Some(moment) = plan.moments.get(step.moment_index) {
        for prior in moment.steps.iter().take(step.step_index) {
            match prior.step_type {
                StepType::Content
                | StepType::Narration
                | StepType::Case
                | StepType::KeyContent
                | StepType::KeyPoints
                | StepType::KeyElements => {
                    texts.extend(prior.data.narration_parts());
                }
                _ => {}
            }
        }
    }
    extract_keywords(texts)
}

/// "No sé" and its many spellings, plus empty or punctuation-only input.
pub fn is_no_se(input: &str) -> bool {
    let n = normalize(input);
    if n.is_empty() {
        return true;
    }
    const EXACT: &[&str] = &[
        "no",
        "no se",
        "no lo se",
        "no se bien",
        "no sabria",
        "no lo sabria",
        "no sabo",
        "no estoy seguro",
        "no estoy segura",
        "ni idea",
        "ns",
        "nose",
        "mm",
        "mmm",
        "quien sabe",
    ];
    EXACT.contains(&n.as_str())
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.iter().filter(|t| b.contains(t)).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

/// Detects answers with no usable signal: too few content words, an echo of
/// the question, or a near-repeat of the previous answer.
pub fn is_vague_answer(input: &str, question: Option<&str>, last_answer: Option<&str>) -> bool {
    let tokens = content_tokens(input);
    if tokens.len() < 2 {
        return true;
    }
    if let Some(q) = question {
        if jaccard(&tokens, &content_tokens(q)) >= 0.7 {
            return true;
        }
    }
    if let Some(prev) = last_answer {
        if jaccard(&tokens, &content_tokens(prev)) >= 0.8 {
            return true;
        }
    }
    false
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Classifies answers without a model call: keyword containment plus fuzzy
/// token matching (one edit of tolerance, and subsequence matching so
/// inflections like "extintores"/"extintor" still hit).
pub struct KeywordClassifier {
    matcher: SkimMatcherV2,
    max_edit_distance: usize,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            matcher: SkimMatcherV2::default(),
            max_edit_distance: 1,
        }
    }
}

impl KeywordClassifier {
    fn tokens_match(&self, user_token: &str, target_token: &str) -> bool {
        if user_token == target_token {
            return true;
        }
        if user_token.len() < MIN_FUZZY_TOKEN_LEN || target_token.len() < MIN_FUZZY_TOKEN_LEN {
            return false;
        }
        if levenshtein(user_token, target_token) <= self.max_edit_distance {
            return true;
        }
        self.matcher.fuzzy_match(user_token, target_token).is_some()
    }

    fn phrase_matches(&self, user_norm: &str, user_tokens: &[String], phrase: &str) -> bool {
        let phrase_norm = normalize(phrase);
        if phrase_norm.is_empty() {
            return false;
        }
        if user_norm.contains(&phrase_norm) {
            return true;
        }
        let phrase_tokens = content_tokens(&phrase_norm);
        if phrase_tokens.is_empty() {
            return false;
        }
        phrase_tokens
            .iter()
            .all(|pt| user_tokens.iter().any(|ut| self.tokens_match(ut, pt)))
    }

    /// Splits `targets` into (matched, missing) against the user's answer.
    pub fn matched_missing(&self, input: &str, targets: &[String]) -> (Vec<String>, Vec<String>) {
        let user_norm = normalize(input);
        let user_tokens = tokenize(&user_norm);
        let mut matched = Vec::new();
        let mut missing = Vec::new();
        for target in targets {
            if self.phrase_matches(&user_norm, &user_tokens, target) {
                matched.push(target.clone());
            } else {
                missing.push(target.clone());
            }
        }
        (matched, missing)
    }

    /// The full deterministic pass: don't-know gate, keyword matching
    /// against acceptable answers (expected terms when none are authored),
    /// threshold from the ask policy, justification check for application
    /// questions.
    pub fn classify_turn(
        &self,
        input: &str,
        policy: &AskPolicy,
        acceptable: &[String],
        expected: &[String],
    ) -> Classification {
        if is_no_se(input) {
            let missing = if acceptable.is_empty() {
                expected.iter().take(3).cloned().collect()
            } else {
                acceptable.iter().take(3).cloned().collect()
            };
            return Classification {
                kind: ClassKind::Hint,
                matched: Vec::new(),
                missing,
                reason: "dont_know".to_string(),
                similarity: Some(0.0),
            };
        }

        let targets: &[String] = if acceptable.is_empty() { expected } else { acceptable };
        let (matched, missing) = self.matched_missing(input, targets);
        let similarity = if targets.is_empty() {
            None
        } else {
            Some(matched.len() as f32 / targets.len() as f32)
        };

        if matched.len() >= policy.threshold_k.max(1) {
            if policy.requires_justification && !has_justification(input) {
                return Classification {
                    kind: ClassKind::Partial,
                    matched,
                    missing,
                    reason: "missing_justification".to_string(),
                    similarity,
                };
            }
            return Classification {
                kind: ClassKind::Accept,
                matched,
                missing,
                reason: "keywords_matched".to_string(),
                similarity,
            };
        }
        if !matched.is_empty() {
            return Classification {
                kind: ClassKind::Partial,
                matched,
                missing,
                reason: "below_threshold".to_string(),
                similarity,
            };
        }
        Classification {
            kind: ClassKind::Hint,
            matched,
            missing,
            reason: "no_keywords".to_string(),
            similarity,
        }
    }
}

fn has_justification(input: &str) -> bool {
    let n = format!(" {} ", normalize(input));
    [" porque ", " para ", " ya que ", " asi "]
        .iter()
        .any(|m| n.contains(m))
}

/// Semantic classification contract. The deterministic classifier above is
/// the shipped implementation; richer (embedding-backed) classifiers plug
/// in here.
#[async_trait]
pub trait AnswerClassifier: Send + Sync {
    async fn classify(
        &self,
        input: &str,
        step: &Step,
        policy: &AskPolicy,
        expected: &[String],
    ) -> Result<Classification>;
}

#[async_trait]
impl AnswerClassifier for KeywordClassifier {
    async fn classify(
        &self,
        input: &str,
        step: &Step,
        policy: &AskPolicy,
        expected: &[String],
    ) -> Result<Classification> {
        Ok(self.classify_turn(input, policy, &step.data.acceptable_answers, expected))
    }
}
