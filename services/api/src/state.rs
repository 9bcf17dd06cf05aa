//! Shared Application State
//!
//! `AppState` holds the injected collaborators (store, generator,
//! classifier), the per-URL compiled plan cache and the per-session lock
//! map that serializes turns on the same key.

use crate::config::Config;
use crate::store::SessionStore;
use anyhow::Result;
use mentor_core::classify::AnswerClassifier;
use mentor_core::generate::LanguageGenerator;
use mentor_core::plan::{self, LessonPlan};
use mentor_core::policy::AdvancePolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub generator: Arc<dyn LanguageGenerator>,
    pub classifier: Arc<dyn AnswerClassifier>,
    pub advance_policy: AdvancePolicy,
    pub config: Arc<Config>,
    plans: RwLock<HashMap<String, Arc<LessonPlan>>>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn LanguageGenerator>,
        classifier: Arc<dyn AnswerClassifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            generator,
            classifier,
            advance_policy: AdvancePolicy::default(),
            config,
            plans: RwLock::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled plan for `url`, loading and caching it on first use.
    pub async fn plan(&self, url: &str) -> Result<Arc<LessonPlan>> {
        if let Some(plan) = self.plans.read().await.get(url) {
            return Ok(plan.clone());
        }
        let compiled = Arc::new(plan::load_and_compile(url, &self.config.plan_base_dir).await?);
        self.plans
            .write()
            .await
            .insert(url.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Registers an already-compiled plan under `url`, bypassing the
    /// loader. Used for bundled lessons and in tests.
    pub async fn insert_plan(&self, url: &str, plan: LessonPlan) {
        self.plans
            .write()
            .await
            .insert(url.to_string(), Arc::new(plan));
    }

    /// The mutex serializing turns for one session key. Held across the
    /// whole turn by the orchestrator. Entries no turn holds anymore are
    /// evicted on fetch, so the map does not grow with dead sessions.
    pub async fn session_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) async fn session_lock_count(&self) -> usize {
        self.session_locks.lock().await.len()
    }
}
