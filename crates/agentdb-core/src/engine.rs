//! Sync engine facade.
//!
//! Agent automation calls [`SyncFacade::trigger_sync`] after finishing a
//! workflow step. The facade derives the flow token, screens the payload,
//! appends one event to the shared store and fires any matching sync rules
//! in the same transaction. It never fails its caller: a
//! disabled engine is [`SyncOutcome::Disabled`], and every error or panic
//! below this boundary becomes [`SyncOutcome::Failed`].
//!
//! ```text
//! SyncFacade ──► EngineCache[store path] ──► ComplianceLayer ──► StoreSink ──► EventStore
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::flow_token::{self, FlowToken};
use crate::git::{WorktreeContext, WorktreeProbe};
use crate::locator;
use crate::rules::{self, ExecutionId, Trigger};
use crate::screener::{PatternScreener, Screener};
use crate::store::{EventCategory, EventId, EventStore, SyncEvent};

// ---------------------------------------------------------------------------
// ActionRecord / ActionSink
// ---------------------------------------------------------------------------

/// One completed workflow step, ready to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub actor: String,
    pub action: String,
    pub state: Value,
    pub context: SyncContext,
    pub flow_token: String,
    /// Sandbox root for derived checkouts; `None` for the primary.
    pub sandbox: Option<PathBuf>,
}

impl ActionRecord {
    pub fn category(&self) -> EventCategory {
        self.context
            .category
            .unwrap_or_else(|| EventCategory::infer(&self.action))
    }

    /// SHA-256 over `actor:action:flow_token:<payload JSON>`. Object keys
    /// serialise sorted, so equal payloads hash equally.
    pub fn provenance_hash(&self) -> Result<String> {
        let payload = serde_json::to_string(&self.state)?;
        let material = format!(
            "{}:{}:{}:{}",
            self.actor, self.action, self.flow_token, payload
        );
        Ok(hex::encode(Sha256::digest(material.as_bytes())))
    }

    pub fn to_event(&self) -> Result<SyncEvent> {
        let mut metadata = json!({
            "state": self.state,
            "context": serde_json::to_value(&self.context)?,
        });
        if let Some(issue) = flow_token::extract_correlated_number(&self.flow_token) {
            metadata["correlated_issue"] = json!(issue);
        }
        Ok(
            SyncEvent::new(self.actor.clone(), self.category(), self.action.clone())
                .with_worktree_path(self.sandbox.clone())
                .with_flow_token(Some(self.flow_token.clone()))
                .with_locations(
                    self.context.source.clone().unwrap_or_default(),
                    self.context.target.clone().unwrap_or_default(),
                )
                .with_phi_flagged(self.context.phi_detected.unwrap_or(false))
                .with_provenance_hash(Some(self.provenance_hash()?))
                .with_idempotency_key(self.context.idempotency_key.clone())
                .with_metadata(metadata),
        )
    }
}

/// What one recorded action produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReceipt {
    pub event: EventId,
    /// Rule executions fired by this action; empty when no rule matched.
    pub executions: Vec<ExecutionId>,
}

pub trait ActionSink: Send + Sync {
    fn on_action_complete(&self, record: &ActionRecord) -> Result<SyncReceipt>;
}

impl<T: ActionSink + ?Sized> ActionSink for Box<T> {
    fn on_action_complete(&self, record: &ActionRecord) -> Result<SyncReceipt> {
        (**self).on_action_complete(record)
    }
}

impl<T: ActionSink + ?Sized> ActionSink for Arc<T> {
    fn on_action_complete(&self, record: &ActionRecord) -> Result<SyncReceipt> {
        (**self).on_action_complete(record)
    }
}

/// Appends each record as one event and fires the rules it matches, inside
/// one write transaction.
pub struct StoreSink {
    store: Mutex<EventStore>,
}

impl StoreSink {
    pub fn new(store: EventStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

impl ActionSink for StoreSink {
    fn on_action_complete(&self, record: &ActionRecord) -> Result<SyncReceipt> {
        let event = record.to_event()?;
        let store = self
            .store
            .lock()
            .map_err(|_| SyncError::Sink("store connection lock poisoned".into()))?;

        let tx = store.immediate_transaction()?;
        let id = store.append(&event)?;
        let executions = rules::fire_matching(
            &store,
            &Trigger {
                event: &id,
                actor: &record.actor,
                action: &record.action,
                flow_token: &record.flow_token,
                state: &record.state,
                phi_involved: record.context.phi_detected.unwrap_or(false),
                justification: record.context.phi_justification.as_deref(),
            },
        )?;
        tx.commit()?;

        Ok(SyncReceipt {
            event: id,
            executions,
        })
    }
}

// ---------------------------------------------------------------------------
// ComplianceLayer
// ---------------------------------------------------------------------------

/// Screens each record before delegating. Flagged records carry
/// `phi_detected` and `phi_justification` in their context. A flagged record
/// whose caller gave no justification source of its own is still delegated,
/// then logged as a violation.
pub struct ComplianceLayer<S> {
    inner: S,
    screener: Arc<dyn Screener>,
}

impl<S: ActionSink> ComplianceLayer<S> {
    pub fn new(inner: S, screener: Arc<dyn Screener>) -> Self {
        Self { inner, screener }
    }
}

impl<S: ActionSink> ActionSink for ComplianceLayer<S> {
    fn on_action_complete(&self, record: &ActionRecord) -> Result<SyncReceipt> {
        let explicit = record.context.has_explicit_justification();
        let result =
            self.screener
                .screen(&record.state, &record.context, &record.actor, &record.action)?;
        if !result.flagged {
            return self.inner.on_action_complete(record);
        }

        let mut flagged = record.clone();
        flagged.context.phi_detected = Some(true);
        flagged.context.phi_justification = result.justification.clone();
        let receipt = self.inner.on_action_complete(&flagged)?;

        if !explicit {
            tracing::error!(
                actor = %record.actor,
                action = %record.action,
                flow_token = %record.flow_token,
                justification = result.justification.as_deref().unwrap_or_default(),
                "COMPLIANCE VIOLATION: sensitive content recorded without explicit justification"
            );
        }
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// SinkFactory
// ---------------------------------------------------------------------------

pub trait SinkFactory: Send + Sync {
    fn open(&self, store_path: &Path) -> Result<Box<dyn ActionSink>>;
}

/// Opens the SQLite store and makes sure its schema exists.
pub struct SqliteSinkFactory {
    busy_timeout: Duration,
}

impl SqliteSinkFactory {
    pub fn new(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }
}

impl SinkFactory for SqliteSinkFactory {
    fn open(&self, store_path: &Path) -> Result<Box<dyn ActionSink>> {
        let store = EventStore::open(store_path, self.busy_timeout)?;
        store.initialize_schema()?;
        Ok(Box::new(StoreSink::new(store)))
    }
}

// ---------------------------------------------------------------------------
// EngineCache
// ---------------------------------------------------------------------------

/// One engine per store path for the life of the owning facade. Failed
/// constructions are not remembered.
#[derive(Default)]
pub struct EngineCache {
    engines: Mutex<HashMap<PathBuf, Arc<dyn ActionSink>>>,
}

impl EngineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_try_init<F>(&self, path: &Path, init: F) -> Result<Arc<dyn ActionSink>>
    where
        F: FnOnce() -> Result<Arc<dyn ActionSink>>,
    {
        let mut engines = self
            .engines
            .lock()
            .map_err(|_| SyncError::Sink("engine cache lock poisoned".into()))?;
        if let Some(engine) = engines.get(path) {
            tracing::debug!(store = %path.display(), "reusing cached sync engine");
            return Ok(Arc::clone(engine));
        }
        let engine = init()?;
        engines.insert(path.to_path_buf(), Arc::clone(&engine));
        tracing::debug!(store = %path.display(), "sync engine ready");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// SyncFacade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SyncOutcome {
    Disabled,
    Recorded(SyncReceipt),
    Failed(String),
}

impl SyncOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, SyncOutcome::Recorded(_))
    }
}

/// Where a dispatch is recorded.
struct Target {
    store_path: PathBuf,
    sandbox: Option<PathBuf>,
    flow_token: String,
}

pub struct SyncFacade {
    config: SyncConfig,
    probe: Arc<dyn WorktreeProbe>,
    cwd: PathBuf,
    factory: Box<dyn SinkFactory>,
    screener: Option<Arc<dyn Screener>>,
    cache: EngineCache,
    /// Fallback token drawn on first use when the context yields no stable
    /// one; every later dispatch from this facade reuses it.
    ad_hoc: OnceLock<FlowToken>,
}

impl SyncFacade {
    pub fn new(config: SyncConfig, probe: Arc<dyn WorktreeProbe>, cwd: impl Into<PathBuf>) -> Self {
        let factory = SqliteSinkFactory::new(Duration::from_millis(config.busy_timeout_ms));
        Self {
            config,
            probe,
            cwd: cwd.into(),
            factory: Box::new(factory),
            screener: None,
            cache: EngineCache::new(),
            ad_hoc: OnceLock::new(),
        }
    }

    pub fn with_factory(mut self, factory: Box<dyn SinkFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_screener(mut self, screener: Arc<dyn Screener>) -> Self {
        self.screener = Some(screener);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    /// Record a completed step. Never panics or returns an error.
    pub fn dispatch(
        &self,
        actor: &str,
        action: &str,
        state: Value,
        context: SyncContext,
    ) -> SyncOutcome {
        if !self.config.enabled {
            tracing::debug!(actor, action, "sync engine disabled; skipping");
            return SyncOutcome::Disabled;
        }
        match catch_unwind(AssertUnwindSafe(|| {
            self.dispatch_enabled(actor, action, state, context)
        })) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(actor, action, reason = %reason, "sync panicked");
                SyncOutcome::Failed(format!("panic: {reason}"))
            }
        }
    }

    /// `true` only when the event was recorded.
    pub fn trigger_sync(
        &self,
        actor: &str,
        action: &str,
        state: Value,
        context: SyncContext,
    ) -> bool {
        self.dispatch(actor, action, state, context).is_recorded()
    }

    fn dispatch_enabled(
        &self,
        actor: &str,
        action: &str,
        state: Value,
        mut context: SyncContext,
    ) -> SyncOutcome {
        let target = match self.resolve_target(&context) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(actor, action, error = %e, "sync failed: cannot resolve store");
                return SyncOutcome::Failed(e.to_string());
            }
        };
        context.flow_token = Some(target.flow_token.clone());
        if context.issue_number.is_none() {
            context.issue_number = flow_token::extract_correlated_number(&target.flow_token);
        }

        let record = ActionRecord {
            actor: actor.to_string(),
            action: action.to_string(),
            state,
            context,
            flow_token: target.flow_token.clone(),
            sandbox: target.sandbox.clone(),
        };

        let result = self
            .cache
            .get_or_try_init(&target.store_path, || self.build_engine(&target.store_path))
            .and_then(|engine| engine.on_action_complete(&record));

        match result {
            Ok(receipt) => {
                tracing::info!(
                    store = %target.store_path.display(),
                    flow_token = %target.flow_token,
                    actor,
                    action,
                    rules_fired = receipt.executions.len(),
                    "sync recorded"
                );
                SyncOutcome::Recorded(receipt)
            }
            Err(e) => {
                tracing::error!(
                    store = %target.store_path.display(),
                    flow_token = %target.flow_token,
                    actor,
                    action,
                    error = %e,
                    "sync failed"
                );
                SyncOutcome::Failed(e.to_string())
            }
        }
    }

    fn resolve_target(&self, context: &SyncContext) -> Result<Target> {
        let ctx = match self.probe.context(&self.cwd) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::debug!(cwd = %self.cwd.display(), error = %e, "no worktree context; using cwd");
                WorktreeContext::fallback(&self.cwd)?
            }
        };

        let store_path = match &self.config.store_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.cwd.join(p),
            None => locator::resolve_canonical_store_path(&ctx),
        };

        let flow_token = match &context.flow_token {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => flow_token::derive_stable_token(&ctx.root, ctx.branch.as_deref(), &self.config.tokens)
                .unwrap_or_else(|| self.ad_hoc.get_or_init(flow_token::ad_hoc_token).clone())
                .value,
        };

        Ok(Target {
            store_path,
            sandbox: ctx.sandbox_path().map(Path::to_path_buf),
            flow_token,
        })
    }

    fn build_engine(&self, store_path: &Path) -> Result<Arc<dyn ActionSink>> {
        let screener: Arc<dyn Screener> = match &self.screener {
            Some(s) => Arc::clone(s),
            None => Arc::new(PatternScreener::new()?),
        };
        let sink = self.factory.open(store_path)?;
        Ok(Arc::new(ComplianceLayer::new(sink, screener)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::fixture::*;
    use crate::git::GitLayout;
    use crate::paths;
    use crate::rules::SyncRule;
    use crate::screener::ScreenResult;
    use crate::store::Correlation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Layout {
        _dir: TempDir,
        primary: PathBuf,
        sandbox: PathBuf,
    }

    fn layout() -> Layout {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let sandbox = add_worktree(
            &primary,
            &dir.path().join("proj_feature_20250101T000000Z_foo"),
            "feature/20250101T000000Z_foo",
        );
        locator::ensure_alias(&sandbox, &primary);
        Layout {
            _dir: dir,
            primary,
            sandbox,
        }
    }

    fn enabled() -> SyncConfig {
        SyncConfig {
            enabled: true,
            ..SyncConfig::default()
        }
    }

    fn facade(cwd: &Path) -> SyncFacade {
        SyncFacade::new(enabled(), Arc::new(GitLayout), cwd)
    }

    fn open_primary_store(primary: &Path) -> EventStore {
        EventStore::open_existing(&paths::store_path(primary), Duration::from_secs(5)).unwrap()
    }

    struct FailingScreener;

    impl Screener for FailingScreener {
        fn screen(&self, _: &Value, _: &SyncContext, _: &str, _: &str) -> Result<ScreenResult> {
            Err(SyncError::Screening("injected".into()))
        }
    }

    struct PanickingScreener;

    impl Screener for PanickingScreener {
        fn screen(&self, _: &Value, _: &SyncContext, _: &str, _: &str) -> Result<ScreenResult> {
            panic!("screener exploded")
        }
    }

    struct FailingSink;

    impl ActionSink for FailingSink {
        fn on_action_complete(&self, _: &ActionRecord) -> Result<SyncReceipt> {
            Err(SyncError::Sink("append refused".into()))
        }
    }

    /// Fails the first `failures` opens, then delegates to SQLite.
    struct FlakyFactory {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    impl SinkFactory for FlakyFactory {
        fn open(&self, store_path: &Path) -> Result<Box<dyn ActionSink>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SyncError::StoreUnavailable {
                    path: store_path.to_path_buf(),
                    reason: "injected".into(),
                });
            }
            SqliteSinkFactory::new(Duration::from_secs(5)).open(store_path)
        }
    }

    struct SinkOnlyFactory;

    impl SinkFactory for SinkOnlyFactory {
        fn open(&self, _: &Path) -> Result<Box<dyn ActionSink>> {
            Ok(Box::new(FailingSink))
        }
    }

    #[test]
    fn disabled_is_a_quiet_no_op() {
        let l = layout();
        let f = SyncFacade::new(SyncConfig::default(), Arc::new(GitLayout), &l.sandbox);
        assert_eq!(
            f.dispatch("agent", "phase_1_specify", json!({}), SyncContext::default()),
            SyncOutcome::Disabled
        );
        assert!(!f.trigger_sync("agent", "phase_1_specify", json!({}), SyncContext::default()));
        assert!(f.cache().is_empty());
        let store = paths::store_path(&l.primary);
        assert_eq!(std::fs::metadata(store).unwrap().len(), 0);
    }

    #[test]
    fn sandbox_event_lands_in_primary_store() {
        let l = layout();
        let f = facade(&l.sandbox);
        assert!(f.trigger_sync(
            "spec_agent",
            "phase_1_specify",
            json!({"spec": "specs/foo/spec.md"}),
            SyncContext {
                source: Some("planning/foo".into()),
                ..SyncContext::default()
            },
        ));

        let store = open_primary_store(&l.primary);
        let event = store
            .query_latest(&Correlation::FlowToken("feature/20250101T000000Z_foo".into()))
            .unwrap()
            .unwrap();
        assert_eq!(event.agent_id, "spec_agent");
        assert_eq!(event.pattern, "phase_1_specify");
        assert_eq!(event.sync_type, EventCategory::WorkflowTransition);
        assert_eq!(event.source_location, "planning/foo");
        assert_eq!(event.worktree_path, Some(l.sandbox.canonicalize().unwrap()));
        assert!(event.provenance_hash.is_some());
        assert_eq!(event.metadata["state"]["spec"], "specs/foo/spec.md");
        assert_eq!(
            event.metadata["context"]["flow_token"],
            "feature/20250101T000000Z_foo"
        );
    }

    #[test]
    fn primary_events_have_no_sandbox_path() {
        let l = layout();
        let f = facade(&l.primary);
        assert!(f.trigger_sync("gate", "quality_gate_passed", json!({}), SyncContext::default()));
        let store = open_primary_store(&l.primary);
        let event = store.query_latest(&Correlation::Primary).unwrap().unwrap();
        assert_eq!(event.sync_type, EventCategory::QualityGate);
        assert!(event.worktree_path.is_none());
    }

    #[test]
    fn retried_delivery_with_same_key_is_recorded_once() {
        let l = layout();
        let f = facade(&l.sandbox);
        let ctx = SyncContext {
            idempotency_key: Some("plan-delivery-7".into()),
            ..SyncContext::default()
        };
        let a = f.dispatch("agent", "phase_2_plan", json!({"k": 1}), ctx.clone());
        let b = f.dispatch("agent", "phase_2_plan", json!({"k": 1}), ctx);
        assert!(a.is_recorded());
        assert_eq!(a, b);
        assert_eq!(open_primary_store(&l.primary).count().unwrap(), 1);
        assert_eq!(f.cache().len(), 1);
    }

    #[test]
    fn gate_that_passes_again_after_failing_is_latest() {
        let l = layout();
        let f = facade(&l.sandbox);
        let token = "feature/20250101T000000Z_foo";
        let gate = json!({"coverage": 91});
        assert!(f.trigger_sync("qa", "quality_gate_passed", gate.clone(), SyncContext::default()));
        assert!(f.trigger_sync("qa", "quality_gate_failed", json!({"coverage": 60}), SyncContext::default()));
        assert!(f.trigger_sync("qa", "quality_gate_passed", gate, SyncContext::default()));

        let store = open_primary_store(&l.primary);
        assert_eq!(store.count().unwrap(), 3);
        let latest = store
            .query_latest(&Correlation::FlowToken(token.into()))
            .unwrap()
            .unwrap();
        assert_eq!(latest.pattern, "quality_gate_passed");
    }

    #[test]
    fn ad_hoc_token_is_stable_within_one_facade() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let f = facade(&primary);
        assert!(f.trigger_sync("a", "phase_1_specify", json!({"n": 1}), SyncContext::default()));
        assert!(f.trigger_sync("a", "phase_2_plan", json!({"n": 2}), SyncContext::default()));

        let events = open_primary_store(&primary).query_recent(2).unwrap();
        assert_eq!(events.len(), 2);
        let first = events[0].flow_token.clone().unwrap();
        assert!(!first.is_empty());
        assert_eq!(events[1].flow_token.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn token_issue_number_justifies_flagged_payload() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("proj");
        std::fs::create_dir_all(&primary).unwrap();
        init_primary(&primary, "main");
        let sandbox = add_worktree(
            &primary,
            &dir.path().join("proj_feature_issue-42-login"),
            "feature/issue-42-login",
        );
        locator::ensure_alias(&sandbox, &primary);

        let f = facade(&sandbox);
        assert!(f.trigger_sync("etl", "phase_4_implement", json!({"patient_id": "p1"}), SyncContext::default()));

        let event = open_primary_store(&primary).query_flagged(1).unwrap().pop().unwrap();
        assert_eq!(event.metadata["context"]["issue_number"], 42);
        assert_eq!(
            event.metadata["context"]["phi_justification"],
            "Development work for issue #42"
        );
    }

    #[test]
    fn matching_rule_fires_with_the_event() {
        let l = layout();
        let store = EventStore::open(&paths::store_path(&l.primary), Duration::from_secs(5)).unwrap();
        store.initialize_schema().unwrap();
        store
            .upsert_rule(
                &SyncRule::new("plan-to-tasks", ("planner", "phase_2_plan"), ("tasker", "phase_3_tasks"))
                    .with_params(json!({"plan": "${trigger_state.plan}"})),
            )
            .unwrap();

        let f = facade(&l.sandbox);
        let outcome = f.dispatch("planner", "phase_2_plan", json!({"plan": "specs/foo/plan.md"}), SyncContext::default());
        let SyncOutcome::Recorded(receipt) = outcome else {
            panic!("expected a recorded outcome");
        };
        assert_eq!(receipt.executions.len(), 1);

        let executions = store.query_executions(5).unwrap();
        assert_eq!(executions[0].execution_id, receipt.executions[0]);
        assert_eq!(executions[0].event_id, receipt.event);
        assert_eq!(executions[0].flow_token, "feature/20250101T000000Z_foo");
        assert_eq!(executions[0].resolved_params, json!({"plan": "specs/foo/plan.md"}));

        let unrelated = f.dispatch("planner", "phase_1_specify", json!({}), SyncContext::default());
        let SyncOutcome::Recorded(receipt) = unrelated else {
            panic!("expected a recorded outcome");
        };
        assert!(receipt.executions.is_empty());
    }

    #[test]
    fn flagged_payload_carries_explicit_justification() {
        let l = layout();
        let f = facade(&l.sandbox);
        let ctx = SyncContext {
            phi_justification: Some("IRB #12345".into()),
            ..SyncContext::default()
        };
        assert!(f.trigger_sync("etl", "phase_4_implement", json!({"patient_id": "p1"}), ctx));

        let store = open_primary_store(&l.primary);
        let event = store.query_flagged(1).unwrap().pop().unwrap();
        assert!(event.phi_flagged);
        assert_eq!(event.metadata["context"]["phi_justification"], "IRB #12345");
        assert_eq!(event.metadata["context"]["phi_detected"], true);
    }

    #[test]
    fn unjustified_flagged_payload_is_still_recorded() {
        let l = layout();
        let f = facade(&l.sandbox);
        assert!(f.trigger_sync(
            "etl",
            "phase_4_implement",
            json!({"notes": "123-45-6789"}),
            SyncContext::default()
        ));
        let store = open_primary_store(&l.primary);
        let event = store.query_flagged(1).unwrap().pop().unwrap();
        let justification = event.metadata["context"]["phi_justification"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(justification.contains("etl"));
        assert!(justification.contains("phase_4_implement"));
    }

    #[test]
    fn screener_error_becomes_failed() {
        let l = layout();
        let f = facade(&l.sandbox).with_screener(Arc::new(FailingScreener));
        assert!(matches!(
            f.dispatch("a", "phase_1_specify", json!({}), SyncContext::default()),
            SyncOutcome::Failed(_)
        ));
    }

    #[test]
    fn screener_panic_becomes_failed() {
        let l = layout();
        let f = facade(&l.sandbox).with_screener(Arc::new(PanickingScreener));
        let outcome = f.dispatch("a", "phase_1_specify", json!({}), SyncContext::default());
        assert_eq!(
            outcome,
            SyncOutcome::Failed("panic: screener exploded".into())
        );
        assert!(!f.trigger_sync("a", "phase_1_specify", json!({}), SyncContext::default()));
    }

    #[test]
    fn append_error_becomes_failed() {
        let l = layout();
        let f = facade(&l.sandbox).with_factory(Box::new(SinkOnlyFactory));
        assert!(!f.trigger_sync("a", "phase_1_specify", json!({}), SyncContext::default()));
    }

    #[test]
    fn failed_construction_is_retried_then_cached() {
        let l = layout();
        let calls = Arc::new(AtomicUsize::new(0));
        let f = facade(&l.sandbox).with_factory(Box::new(FlakyFactory {
            failures: 1,
            calls: Arc::clone(&calls),
        }));

        assert!(!f.trigger_sync("a", "phase_1_specify", json!({"n": 1}), SyncContext::default()));
        assert!(f.cache().is_empty());
        assert!(f.trigger_sync("a", "phase_1_specify", json!({"n": 2}), SyncContext::default()));
        assert!(f.trigger_sync("a", "phase_2_plan", json!({"n": 3}), SyncContext::default()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.cache().len(), 1);
    }

    #[test]
    fn unreachable_store_becomes_failed() {
        let l = layout();
        let config = SyncConfig {
            enabled: true,
            // A directory cannot be opened as a database file.
            store_path: Some(l.primary.clone()),
            ..SyncConfig::default()
        };
        let f = SyncFacade::new(config, Arc::new(GitLayout), &l.sandbox);
        assert!(matches!(
            f.dispatch("a", "phase_1_specify", json!({}), SyncContext::default()),
            SyncOutcome::Failed(_)
        ));
    }

    #[test]
    fn issue_in_token_enriches_metadata() {
        let record = ActionRecord {
            actor: "a".into(),
            action: "phase_1_specify".into(),
            state: json!({}),
            context: SyncContext::default(),
            flow_token: "feature/issue-42-login".into(),
            sandbox: None,
        };
        assert_eq!(record.to_event().unwrap().metadata["correlated_issue"], 42);

        let plain = ActionRecord {
            flow_token: "feature/x".into(),
            ..record
        };
        assert!(plain.to_event().unwrap().metadata.get("correlated_issue").is_none());
    }

    #[test]
    fn provenance_depends_on_payload() {
        let base = ActionRecord {
            actor: "a".into(),
            action: "phase_1_specify".into(),
            state: json!({"b": 1, "a": 2}),
            context: SyncContext::default(),
            flow_token: "feature/x".into(),
            sandbox: None,
        };
        let same = ActionRecord {
            state: json!({"a": 2, "b": 1}),
            ..base.clone()
        };
        let other = ActionRecord {
            state: json!({"a": 3}),
            ..base.clone()
        };
        assert_eq!(base.provenance_hash().unwrap(), same.provenance_hash().unwrap());
        assert_ne!(base.provenance_hash().unwrap(), other.provenance_hash().unwrap());
    }
}
