//! Event-stream boundary and engine facade for the state kernel.
//!
//! A timeline is one evaluation session: an ordered sequence of conversation
//! turns, state writes, supersessions, and queries, applied to a single
//! [`StateEngine`] that owns the fact store, working set, and environment for
//! that timeline. Events arrive as a closed tagged union, so dispatch is an
//! exhaustive match rather than duck-typed branching.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use state_kernel_core::{
    assemble_context, ConstraintKind, ContextQuery, Environment, FactKey, FactStore, IdentityRole,
    Scope, ScopeId, TimelineId, WorkingSetItem, WriteRequest,
};
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Display form used when a turn is folded into the working set.
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

const HYPOTHETICAL_PHRASES: &[&str] = &[
    "what if",
    "hypothetically",
    "suppose",
    "imagine",
    "let's say",
    "in theory",
    "potentially",
];

const DRAFT_PHRASES: &[&str] =
    &["draft", "preliminary", "not final", "pending", "proposal", "tentative"];

const TASK_PHRASES: &[&str] = &["for this task", "for this project", "just for this", "only for"];

const UNKNOWN_PHRASES: &[&str] = &["need info", "don't know", "not sure", "find out"];

/// Scope a conversation turn carries into the working set, inferred from its
/// phrasing. Fact scope is always explicit on the write event; this inference
/// only labels chatter.
#[must_use]
pub fn infer_turn_scope(text: &str) -> Scope {
    let lower = text.to_lowercase();
    if HYPOTHETICAL_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Scope::Hypothetical;
    }
    if DRAFT_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Scope::Draft;
    }
    if TASK_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Scope::Task;
    }
    Scope::Global
}

fn is_open_question(text: &str) -> bool {
    if text.contains('?') {
        return true;
    }
    let lower = text.to_lowercase();
    UNKNOWN_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// One entry in a timeline's event stream.
///
/// `ConversationTurn` is informational: it lands in the working set and never
/// mutates structured state. `StateWrite` and `Supersession` go through the
/// supersession resolver; the only difference is the explicit `supersedes`
/// edge. `Query` triggers context assembly and mutates nothing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ConversationTurn {
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        speaker: Speaker,
        text: String,
    },
    StateWrite {
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        key: FactKey,
        value: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        scope: Option<Scope>,
        #[serde(default)]
        scope_id: Option<ScopeId>,
        #[serde(default)]
        depends_on: Vec<FactKey>,
        #[serde(default)]
        constraint_kind: Option<ConstraintKind>,
    },
    Supersession {
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        key: FactKey,
        value: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        scope: Option<Scope>,
        #[serde(default)]
        scope_id: Option<ScopeId>,
        supersedes: FactKey,
    },
    Query {
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
        text: String,
        #[serde(default)]
        scope_id: Option<ScopeId>,
        #[serde(default)]
        budget: Option<usize>,
        #[serde(default)]
        ground_truth: Option<GroundTruth>,
    },
}

impl Event {
    #[must_use]
    pub fn ts(&self) -> OffsetDateTime {
        match self {
            Self::ConversationTurn { ts, .. }
            | Self::StateWrite { ts, .. }
            | Self::Supersession { ts, .. }
            | Self::Query { ts, .. } => *ts,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Procurement,
    Sales,
    Project,
    Hr,
    Support,
}

impl Domain {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Procurement => "procurement",
            Self::Sales => "sales",
            Self::Project => "project",
            Self::Hr => "hr",
            Self::Support => "support",
        }
    }
}

/// Benchmark track a timeline exercises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Supersession,
    CommitmentDurability,
    InterruptionResumption,
    ScopePermission,
    EnvironmentalFreshness,
    HallucinationResistance,
    ScopeLeak,
    Causality,
    RepairPropagation,
    BrutalRealistic,
}

impl Track {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supersession => "supersession",
            Self::CommitmentDurability => "commitment_durability",
            Self::InterruptionResumption => "interruption_resumption",
            Self::ScopePermission => "scope_permission",
            Self::EnvironmentalFreshness => "environmental_freshness",
            Self::HallucinationResistance => "hallucination_resistance",
            Self::ScopeLeak => "scope_leak",
            Self::Causality => "causality",
            Self::RepairPropagation => "repair_propagation",
            Self::BrutalRealistic => "brutal_realistic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub id: String,
    pub role: String,
    pub org: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actors {
    pub user: Actor,
    #[serde(default = "default_assistant_role")]
    pub assistant_role: String,
}

fn default_assistant_role() -> String {
    "AI_Employee".to_string()
}

/// Scoring contract attached to a query. The engine never reads this; it is
/// carried so a downstream judge can check the answer against it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroundTruth {
    pub decision: String,
    #[serde(default)]
    pub must_mention: Vec<String>,
    #[serde(default)]
    pub must_not_mention: Vec<String>,
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

fn default_allowed_sources() -> Vec<String> {
    vec!["persistent_facts".to_string(), "environment".to_string()]
}

/// A fact present before the first event of a timeline.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InitialFact {
    pub key: FactKey,
    pub value: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub scope_id: Option<ScopeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InitialState {
    pub identity: IdentityRole,
    #[serde(default)]
    pub facts: Vec<InitialFact>,
    #[serde(default)]
    pub working_set: Vec<WorkingSetItem>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// One complete test case: initial state plus an ordered event stream.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Timeline {
    pub id: String,
    pub domain: Domain,
    pub track: Track,
    pub actors: Actors,
    pub initial_state: InitialState,
    pub events: Vec<Event>,
}

impl Timeline {
    pub fn queries(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(|event| matches!(event, Event::Query { .. }))
    }

    pub fn supersessions(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(|event| matches!(event, Event::Supersession { .. }))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineConfig {
    /// Working-set entries kept; older turns fall off the front.
    pub working_set_size: usize,
    /// Context budget applied when a query does not carry its own.
    pub default_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { working_set_size: 10, default_budget: 8_000 }
    }
}

/// An open question surfaced in conversation, kept so assembly can tell the
/// downstream model what was never provided.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct KnownUnknown {
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub noted_at: OffsetDateTime,
}

/// The rendered context for one query plus assembly diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextSnapshot {
    pub snapshot_id: String,
    pub rendered: String,
    pub included_facts: Vec<FactKey>,
    pub dropped_facts: Vec<FactKey>,
    pub dropped_working_set: usize,
    pub budget: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

fn compute_snapshot_id(
    timeline_id: TimelineId,
    text: &str,
    as_of: OffsetDateTime,
    scope_id: Option<&ScopeId>,
    store: &FactStore,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timeline_id.to_string().as_bytes());
    hasher.update(text.as_bytes());
    hasher.update(as_of.unix_timestamp().to_string().as_bytes());
    if let Some(scope) = scope_id {
        hasher.update(scope.as_str().as_bytes());
    }

    let mut census = store
        .all()
        .map(|fact| format!("{}:{}", fact.key, u8::from(fact.is_valid)))
        .collect::<Vec<_>>();
    census.sort_unstable();
    for entry in census {
        hasher.update(entry.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("ctx_{}", &digest_hex[..16])
}

/// One timeline's engine: exclusive owner of that timeline's fact store,
/// working set, and environment. Confine an instance to one timeline for its
/// whole lifetime; independent timelines get independent engines.
#[derive(Debug, Clone)]
pub struct StateEngine {
    timeline_id: TimelineId,
    config: EngineConfig,
    identity: IdentityRole,
    environment: Environment,
    initial_identity: IdentityRole,
    initial_environment: Environment,
    store: FactStore,
    working_set: Vec<WorkingSetItem>,
    known_unknowns: Vec<KnownUnknown>,
    turn_counter: u64,
}

impl StateEngine {
    #[must_use]
    pub fn new(identity: IdentityRole, environment: Environment) -> Self {
        Self::with_config(identity, environment, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(
        identity: IdentityRole,
        environment: Environment,
        config: EngineConfig,
    ) -> Self {
        Self {
            timeline_id: TimelineId::new(),
            config,
            identity: identity.clone(),
            environment: environment.clone(),
            initial_identity: identity,
            initial_environment: environment,
            store: FactStore::new(),
            working_set: Vec::new(),
            known_unknowns: Vec::new(),
            turn_counter: 0,
        }
    }

    /// Build an engine preloaded with a timeline's initial state. The clock
    /// starts at the latest seed timestamp and advances as events arrive.
    ///
    /// # Errors
    /// Returns an error when a seeded fact is rejected by the store, e.g. a
    /// duplicated key.
    pub fn from_initial_state(initial: &InitialState, config: EngineConfig) -> Result<Self> {
        let start = initial
            .facts
            .iter()
            .map(|fact| fact.ts)
            .chain(initial.working_set.iter().map(|item| item.created_at))
            .max()
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        let mut environment = Environment::new(start);
        for (key, value) in &initial.environment {
            environment.apply(key, value, start, None);
        }

        let mut engine = Self::with_config(initial.identity.clone(), environment, config);
        for fact in &initial.facts {
            let mut request = WriteRequest::new(
                fact.key.clone(),
                fact.value.clone(),
                fact.source.clone(),
                fact.ts,
            );
            if let Some(scope) = fact.scope {
                request = request.scoped(scope, fact.scope_id.clone());
            }
            engine
                .store
                .write(request)
                .with_context(|| format!("seed fact `{}` rejected", fact.key))?;
        }
        engine.working_set.extend(initial.working_set.iter().cloned());
        engine.trim_working_set();
        Ok(engine)
    }

    #[must_use]
    pub fn timeline_id(&self) -> TimelineId {
        self.timeline_id
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityRole {
        &self.identity
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Read-only view of the fact graph for inspection tooling.
    #[must_use]
    pub fn facts(&self) -> &FactStore {
        &self.store
    }

    #[must_use]
    pub fn working_set(&self) -> &[WorkingSetItem] {
        &self.working_set
    }

    #[must_use]
    pub fn known_unknowns(&self) -> &[KnownUnknown] {
        &self.known_unknowns
    }

    /// Apply one event in arrival order. Mutating events return `Ok(None)`;
    /// a query returns the assembled snapshot. Errors mean the upstream
    /// producer broke the event contract; nothing is retried.
    ///
    /// # Errors
    /// Returns an error for key reuse with a conflicting value, references to
    /// unknown facts or supersede targets, and dependency edges that would
    /// close a cycle.
    pub fn process(&mut self, event: &Event) -> Result<Option<ContextSnapshot>> {
        let ts = event.ts();
        if ts > self.environment.current_time {
            self.environment.current_time = ts;
        }

        match event {
            Event::ConversationTurn { ts, speaker, text } => {
                self.record_turn(*ts, *speaker, text);
                Ok(None)
            }
            Event::StateWrite {
                ts,
                key,
                value,
                source,
                scope,
                scope_id,
                depends_on,
                constraint_kind,
            } => {
                let mut request = WriteRequest::new(
                    key.clone(),
                    value.clone(),
                    source.clone().unwrap_or_else(|| "decision".to_string()),
                    *ts,
                )
                .scoped(scope.unwrap_or(Scope::Global), scope_id.clone())
                .derived_from(depends_on.clone());
                request.constraint_kind = *constraint_kind;

                match self.store.write(request) {
                    Ok(()) => {
                        debug!(key = %key, scope = ?scope, "persistent fact written");
                        Ok(None)
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "state write rejected");
                        Err(err).with_context(|| format!("state write for `{key}` rejected"))
                    }
                }
            }
            Event::Supersession { ts, key, value, source, scope, scope_id, supersedes } => {
                let request = WriteRequest::new(
                    key.clone(),
                    value.clone(),
                    source.clone().unwrap_or_else(|| "decision".to_string()),
                    *ts,
                )
                .scoped(scope.unwrap_or(Scope::Global), scope_id.clone())
                .superseding(supersedes.clone());

                match self.store.write(request) {
                    Ok(()) => {
                        debug!(key = %key, supersedes = %supersedes, "fact superseded");
                        Ok(None)
                    }
                    Err(err) => {
                        warn!(key = %key, supersedes = %supersedes, error = %err, "supersession rejected");
                        Err(err).with_context(|| format!("supersession of `{supersedes}` rejected"))
                    }
                }
            }
            Event::Query { text, scope_id, budget, .. } => {
                Ok(Some(self.build_context(text, scope_id.as_ref(), *budget)))
            }
        }
    }

    fn record_turn(&mut self, ts: OffsetDateTime, speaker: Speaker, text: &str) {
        let scope = infer_turn_scope(text);
        self.turn_counter += 1;
        self.working_set.push(WorkingSetItem {
            key: format!("turn-{}", self.turn_counter),
            content: format!("{}: {text}", speaker.title()),
            created_at: ts,
            expires_at: None,
            scope,
        });
        self.trim_working_set();

        if is_open_question(text) {
            match self.known_unknowns.iter_mut().find(|unknown| unknown.text == text) {
                Some(existing) => existing.noted_at = ts,
                None => {
                    self.known_unknowns.push(KnownUnknown { text: text.to_string(), noted_at: ts });
                }
            }
        }
        debug!(scope = scope.as_str(), speaker = speaker.as_str(), "turn recorded");
    }

    fn trim_working_set(&mut self) {
        if self.working_set.len() > self.config.working_set_size {
            let excess = self.working_set.len() - self.config.working_set_size;
            self.working_set.drain(..excess);
        }
    }

    /// Assemble the context for a query against current state. Pure read.
    #[must_use]
    pub fn build_context(
        &self,
        text: &str,
        scope_id: Option<&ScopeId>,
        budget: Option<usize>,
    ) -> ContextSnapshot {
        let budget = budget.unwrap_or(self.config.default_budget);
        let mut query = ContextQuery::new(text, budget);
        if let Some(scope) = scope_id {
            query = query.scoped(scope.clone());
        }

        let mut unknowns: Vec<&KnownUnknown> = self.known_unknowns.iter().collect();
        unknowns.sort_by(|lhs, rhs| {
            rhs.noted_at.cmp(&lhs.noted_at).then_with(|| lhs.text.cmp(&rhs.text))
        });
        let unknown_lines: Vec<String> =
            unknowns.into_iter().map(|unknown| unknown.text.clone()).collect();

        let assembled = assemble_context(
            &self.store,
            &self.identity,
            &self.environment,
            &self.working_set,
            &unknown_lines,
            &query,
        );
        let snapshot_id = compute_snapshot_id(
            self.timeline_id,
            text,
            self.environment.current_time,
            scope_id,
            &self.store,
        );
        debug!(
            snapshot = %snapshot_id,
            included = assembled.included_facts.len(),
            dropped = assembled.dropped_facts.len(),
            "context assembled"
        );

        ContextSnapshot {
            snapshot_id,
            rendered: assembled.rendered,
            included_facts: assembled.included_facts,
            dropped_facts: assembled.dropped_facts,
            dropped_working_set: assembled.dropped_working_set,
            budget,
            as_of: self.environment.current_time,
        }
    }

    /// Owning-collaborator write path for environmental signals. Stale
    /// updates for a key are ignored; the signal map stays bounded.
    pub fn update_environment(
        &mut self,
        key: &str,
        value: &str,
        observed_at: OffsetDateTime,
        supersedes: Option<&str>,
    ) {
        if observed_at > self.environment.current_time {
            self.environment.current_time = observed_at;
        }
        self.environment.apply(key, value, observed_at, supersedes);
        debug!(signal = key, "environment updated");
    }

    /// Drop every state layer and start a fresh timeline with the identity
    /// and environment this engine was constructed with.
    pub fn reset(&mut self) {
        self.timeline_id = TimelineId::new();
        self.store = FactStore::new();
        self.working_set.clear();
        self.known_unknowns.clear();
        self.turn_counter = 0;
        self.identity = self.initial_identity.clone();
        self.environment = self.initial_environment.clone();
        debug!(timeline = %self.timeline_id, "engine reset");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use state_kernel_core::{AuthorityLevel, KernelError};
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn at(offset_seconds: i64) -> OffsetDateTime {
        fixture_time() + Duration::seconds(offset_seconds)
    }

    fn manager_identity() -> IdentityRole {
        IdentityRole {
            user_name: "Dana Whitfield".to_string(),
            authority: AuthorityLevel::Manager,
            department: Some("Procurement".to_string()),
            organization: Some("Northwind".to_string()),
            communication_style: None,
            permissions: BTreeSet::new(),
        }
    }

    fn test_engine() -> StateEngine {
        StateEngine::new(manager_identity(), Environment::new(fixture_time()))
    }

    fn write_event(offset: i64, key: &str, value: &str) -> Event {
        Event::StateWrite {
            ts: at(offset),
            key: FactKey::from(key),
            value: value.to_string(),
            source: None,
            scope: None,
            scope_id: None,
            depends_on: Vec::new(),
            constraint_kind: None,
        }
    }

    fn supersede_event(offset: i64, key: &str, value: &str, target: &str) -> Event {
        Event::Supersession {
            ts: at(offset),
            key: FactKey::from(key),
            value: value.to_string(),
            source: None,
            scope: None,
            scope_id: None,
            supersedes: FactKey::from(target),
        }
    }

    fn query_event(offset: i64, text: &str) -> Event {
        Event::Query {
            ts: at(offset),
            text: text.to_string(),
            scope_id: None,
            budget: None,
            ground_truth: None,
        }
    }

    fn turn_event(offset: i64, speaker: Speaker, text: &str) -> Event {
        Event::ConversationTurn { ts: at(offset), speaker, text: text.to_string() }
    }

    fn apply(engine: &mut StateEngine, events: &[Event]) -> Result<Vec<ContextSnapshot>> {
        let mut snapshots = Vec::new();
        for event in events {
            if let Some(snapshot) = engine.process(event)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    // Test IDs: TENG-001
    #[test]
    fn writes_mutate_and_queries_snapshot() -> Result<()> {
        let mut engine = test_engine();
        let outcome = engine.process(&write_event(0, "vendor", "Acme selected"))?;
        assert!(outcome.is_none());

        let snapshot = match engine.process(&query_event(10, "which vendor"))? {
            Some(snapshot) => snapshot,
            None => panic!("query should produce a snapshot"),
        };
        assert!(snapshot.rendered.contains("Acme selected"));
        assert!(snapshot.rendered.contains("Dana Whitfield"));
        assert_eq!(snapshot.included_facts, vec![FactKey::from("vendor")]);
        assert_eq!(engine.facts().len(), 1);
        Ok(())
    }

    // Test IDs: TENG-002
    #[test]
    fn superseded_value_never_reaches_the_context() -> Result<()> {
        let mut engine = test_engine();
        let snapshots = apply(
            &mut engine,
            &[
                write_event(0, "status_v1", "approved"),
                supersede_event(10, "status_v2", "cancelled", "status_v1"),
                query_event(20, "order status"),
            ],
        )?;

        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].rendered.contains("cancelled"));
        assert!(!snapshots[0].rendered.contains("approved"));
        Ok(())
    }

    // Test IDs: TENG-003
    #[test]
    fn repetition_never_outranks_supersession() -> Result<()> {
        fn context_after_restatements(count: i64) -> Result<String> {
            let mut engine = test_engine();
            for offset in 0..count {
                engine.process(&write_event(offset, "ship_addr", "123 Main St"))?;
            }
            engine.process(&supersede_event(50, "ship_addr_v2", "456 Oak Ave", "ship_addr"))?;
            Ok(engine.build_context("shipping address", None, None).rendered)
        }

        let baseline = context_after_restatements(1)?;
        for count in [1, 3, 10] {
            let rendered = context_after_restatements(count)?;
            assert!(rendered.contains("456 Oak Ave"), "count {count}");
            assert!(!rendered.contains("123 Main St"), "count {count}");
            assert_eq!(rendered, baseline, "count {count}");
        }
        Ok(())
    }

    // Test IDs: TENG-004
    #[test]
    fn hypothetical_writes_stay_out_of_global_context() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&write_event(0, "budget", "Budget is $40k"))?;
        engine.process(&Event::StateWrite {
            ts: at(5),
            key: FactKey::from("whatif_budget"),
            value: "Budget doubled to $80k".to_string(),
            source: None,
            scope: Some(Scope::Hypothetical),
            scope_id: Some(ScopeId::from("task-3")),
            depends_on: Vec::new(),
            constraint_kind: None,
        })?;

        let snapshot = engine.build_context("what is the budget", None, None);
        assert!(snapshot.rendered.contains("$40k"));
        assert!(!snapshot.rendered.contains("$80k"));

        let fact = match engine.facts().get(&FactKey::from("whatif_budget")) {
            Some(fact) => fact,
            None => panic!("hypothetical fact should be stored"),
        };
        assert!(fact.is_valid);
        Ok(())
    }

    // Test IDs: TENG-005
    #[test]
    fn turns_land_in_the_working_set_with_inferred_scope() -> Result<()> {
        let mut engine = test_engine();
        apply(
            &mut engine,
            &[
                turn_event(0, Speaker::User, "The vendor order ships Friday"),
                turn_event(1, Speaker::User, "What if we doubled the vendor order"),
                turn_event(2, Speaker::Assistant, "This is a draft reply to the vendor"),
            ],
        )?;

        let scopes: Vec<Scope> = engine.working_set().iter().map(|item| item.scope).collect();
        assert_eq!(scopes, vec![Scope::Global, Scope::Hypothetical, Scope::Draft]);

        let snapshot = engine.build_context("vendor order", None, None);
        assert!(snapshot.rendered.contains("User: The vendor order ships Friday"));
        assert!(snapshot
            .rendered
            .contains("[HYPOTHETICAL] User: What if we doubled the vendor order"));
        assert!(snapshot
            .rendered
            .contains("[DRAFT] Assistant: This is a draft reply to the vendor"));
        Ok(())
    }

    // Test IDs: TENG-006
    #[test]
    fn working_set_is_bounded_oldest_first() -> Result<()> {
        let config = EngineConfig { working_set_size: 3, ..EngineConfig::default() };
        let mut engine = StateEngine::with_config(
            manager_identity(),
            Environment::new(fixture_time()),
            config,
        );
        for offset in 0..5 {
            engine.process(&turn_event(offset, Speaker::User, &format!("note {offset}")))?;
        }

        let contents: Vec<&str> =
            engine.working_set().iter().map(|item| item.content.as_str()).collect();
        assert_eq!(contents, vec!["User: note 2", "User: note 3", "User: note 4"]);
        Ok(())
    }

    // Test IDs: TENG-007
    #[test]
    fn open_questions_are_tracked_as_known_unknowns() -> Result<()> {
        let mut engine = test_engine();
        apply(
            &mut engine,
            &[
                turn_event(0, Speaker::User, "Do we know the vendor lead time?"),
                turn_event(1, Speaker::Assistant, "Not sure, I need to find out the lead time"),
                turn_event(2, Speaker::User, "The order total is $12k"),
            ],
        )?;

        assert_eq!(engine.known_unknowns().len(), 2);
        let snapshot = engine.build_context("vendor lead time", None, None);
        assert!(snapshot.rendered.contains("## Known Unknowns"));
        assert!(snapshot.rendered.contains("- Do we know the vendor lead time?"));
        Ok(())
    }

    // Test IDs: TENG-008
    #[test]
    fn malformed_streams_surface_kernel_errors() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&write_event(0, "vendor", "Acme selected"))?;

        let err = match engine.process(&write_event(5, "vendor", "Globex selected")) {
            Ok(_) => panic!("conflicting key reuse should fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::DuplicateKey(FactKey::from("vendor")))
        );

        let err = match engine.process(&supersede_event(10, "late", "value", "missing")) {
            Ok(_) => panic!("unknown supersede target should fail"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::UnknownSupersedeTarget(FactKey::from("missing")))
        );
        Ok(())
    }

    // Test IDs: TENG-009
    #[test]
    fn dependents_of_a_superseded_fact_render_flagged() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&Event::StateWrite {
            ts: at(0),
            key: FactKey::from("base_cost"),
            value: "Base cost is $10k".to_string(),
            source: Some("finance_system".to_string()),
            scope: None,
            scope_id: None,
            depends_on: Vec::new(),
            constraint_kind: None,
        })?;
        engine.process(&Event::StateWrite {
            ts: at(5),
            key: FactKey::from("quote"),
            value: "Quote priced from base cost".to_string(),
            source: None,
            scope: None,
            scope_id: None,
            depends_on: vec![FactKey::from("base_cost")],
            constraint_kind: None,
        })?;
        engine.process(&Event::Supersession {
            ts: at(10),
            key: FactKey::from("base_cost_v2"),
            value: "Base cost is $14k".to_string(),
            source: Some("finance_system".to_string()),
            scope: None,
            scope_id: None,
            supersedes: FactKey::from("base_cost"),
        })?;

        let snapshot = engine.build_context("quote", None, None);
        assert!(snapshot.rendered.contains("Quote priced from base cost (needs review)"));
        assert!(snapshot.rendered.contains("$14k"));
        assert!(!snapshot.rendered.contains("$10k"));
        Ok(())
    }

    // Test IDs: TENG-010
    #[test]
    fn reset_drops_state_and_renames_the_timeline() -> Result<()> {
        let mut engine = test_engine();
        apply(
            &mut engine,
            &[
                write_event(0, "vendor", "Acme selected"),
                turn_event(1, Speaker::User, "Is the vendor confirmed?"),
            ],
        )?;
        let before = engine.timeline_id();

        engine.reset();
        assert_ne!(engine.timeline_id(), before);
        assert!(engine.facts().is_empty());
        assert!(engine.working_set().is_empty());
        assert!(engine.known_unknowns().is_empty());
        assert_eq!(engine.identity(), &manager_identity());
        assert_eq!(engine.environment().current_time, fixture_time());
        Ok(())
    }

    // Test IDs: TENG-011
    #[test]
    fn environment_updates_respect_freshness() {
        let mut engine = test_engine();
        engine.update_environment("vendor_portal", "degraded", at(10), None);
        engine.update_environment("vendor_portal", "healthy", at(5), None);

        let signal = match engine.environment().signal("vendor_portal") {
            Some(signal) => signal,
            None => panic!("signal should exist"),
        };
        assert_eq!(signal.value, "degraded");

        let snapshot = engine.build_context("portal status", None, None);
        assert!(snapshot.rendered.contains("- vendor_portal: degraded"));
    }

    // Test IDs: TENG-012
    #[test]
    fn snapshot_ids_are_deterministic_per_state_and_query() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&write_event(0, "vendor", "Acme selected"))?;

        let first = engine.build_context("which vendor", None, None);
        let second = engine.build_context("which vendor", None, None);
        assert_eq!(first.snapshot_id, second.snapshot_id);

        let other_query = engine.build_context("what budget", None, None);
        assert_ne!(first.snapshot_id, other_query.snapshot_id);

        engine.process(&supersede_event(10, "vendor_v2", "Globex selected", "vendor"))?;
        let after_write = engine.build_context("which vendor", None, None);
        assert_ne!(first.snapshot_id, after_write.snapshot_id);
        Ok(())
    }

    // Test IDs: TENG-013
    #[test]
    fn query_budget_overrides_the_configured_default() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&write_event(0, "vendor", "Acme selected"))?;

        let snapshot = match engine.process(&Event::Query {
            ts: at(10),
            text: "which vendor".to_string(),
            scope_id: None,
            budget: Some(120),
            ground_truth: None,
        })? {
            Some(snapshot) => snapshot,
            None => panic!("query should produce a snapshot"),
        };
        assert_eq!(snapshot.budget, 120);
        // A 120-char budget forces the fact entry out; the identity and
        // environment floor is kept even when it alone exceeds the budget.
        assert_eq!(snapshot.dropped_facts, vec![FactKey::from("vendor")]);
        assert!(!snapshot.rendered.contains("Acme selected"));

        let defaulted = engine.build_context("which vendor", None, None);
        assert_eq!(defaulted.budget, EngineConfig::default().default_budget);
        assert!(defaulted.rendered.contains("Acme selected"));
        Ok(())
    }

    // Test IDs: TENG-014
    #[test]
    fn task_scoped_facts_need_a_matching_query_scope() -> Result<()> {
        let mut engine = test_engine();
        engine.process(&Event::StateWrite {
            ts: at(0),
            key: FactKey::from("task_note"),
            value: "Rush shipping only for this task".to_string(),
            source: None,
            scope: Some(Scope::Task),
            scope_id: Some(ScopeId::from("task-7")),
            depends_on: Vec::new(),
            constraint_kind: None,
        })?;

        let task7 = ScopeId::from("task-7");
        let matched = engine.build_context("shipping", Some(&task7), None);
        assert!(matched.rendered.contains("Rush shipping"));

        let unmatched = engine.build_context("shipping", None, None);
        assert!(!unmatched.rendered.contains("Rush shipping"));
        Ok(())
    }

    // Test IDs: TENG-015
    #[test]
    fn seeded_engines_start_from_the_initial_state() -> Result<()> {
        let initial = InitialState {
            identity: manager_identity(),
            facts: vec![
                InitialFact {
                    key: FactKey::from("expense_policy"),
                    value: "Expenses above $500 require approval".to_string(),
                    source: "policy".to_string(),
                    ts: at(0),
                    scope: None,
                    scope_id: None,
                },
                InitialFact {
                    key: FactKey::from("vendor"),
                    value: "Acme selected".to_string(),
                    source: "decision".to_string(),
                    ts: at(5),
                    scope: None,
                    scope_id: None,
                },
            ],
            working_set: vec![WorkingSetItem {
                key: "turn-0".to_string(),
                content: "User: revisit the expense question".to_string(),
                created_at: at(5),
                expires_at: None,
                scope: Scope::Global,
            }],
            environment: BTreeMap::from([("now".to_string(), "Friday 09:00".to_string())]),
        };

        let engine = StateEngine::from_initial_state(&initial, EngineConfig::default())?;
        assert_eq!(engine.facts().len(), 2);
        assert_eq!(engine.environment().current_time, at(5));

        let snapshot = engine.build_context("expense approval", None, None);
        assert!(snapshot.rendered.contains("Expenses above $500 require approval"));
        assert!(snapshot.rendered.contains("User: revisit the expense question"));
        assert!(snapshot.rendered.contains("- now: Friday 09:00"));
        Ok(())
    }

    // Test IDs: TENG-016
    #[test]
    fn engines_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<StateEngine>();
    }

    // Test IDs: TSCHEMA-001
    #[test]
    fn timeline_round_trips_through_json() -> Result<()> {
        let timeline = Timeline {
            id: "S1-000123".to_string(),
            domain: Domain::Procurement,
            track: Track::Supersession,
            actors: Actors {
                user: Actor {
                    id: "u-1".to_string(),
                    role: "Manager".to_string(),
                    org: "northwind".to_string(),
                },
                assistant_role: default_assistant_role(),
            },
            initial_state: InitialState {
                identity: manager_identity(),
                facts: Vec::new(),
                working_set: Vec::new(),
                environment: BTreeMap::new(),
            },
            events: vec![
                turn_event(0, Speaker::User, "Let's pick a vendor"),
                write_event(1, "vendor", "Acme selected"),
                supersede_event(2, "vendor_v2", "Globex selected", "vendor"),
                Event::Query {
                    ts: at(3),
                    text: "which vendor".to_string(),
                    scope_id: None,
                    budget: Some(4_000),
                    ground_truth: Some(GroundTruth {
                        decision: "Globex".to_string(),
                        must_mention: vec!["Globex".to_string()],
                        must_not_mention: vec!["Acme".to_string()],
                        allowed_sources: default_allowed_sources(),
                        reasoning: None,
                    }),
                },
            ],
        };

        let encoded = serde_json::to_string(&timeline)?;
        assert!(encoded.contains("\"type\":\"conversation_turn\""));
        assert!(encoded.contains("\"type\":\"state_write\""));
        assert!(encoded.contains("\"type\":\"supersession\""));
        assert!(encoded.contains("\"type\":\"query\""));

        let decoded: Timeline = serde_json::from_str(&encoded)?;
        assert_eq!(decoded, timeline);
        assert_eq!(decoded.queries().count(), 1);
        assert_eq!(decoded.supersessions().count(), 1);
        Ok(())
    }

    // Test IDs: TSCHEMA-002
    #[test]
    fn sparse_event_json_fills_defaults() -> Result<()> {
        let raw = r#"{"type":"query","ts":"2024-03-01T09:00:00Z","text":"order status?"}"#;
        let event: Event = serde_json::from_str(raw)?;
        match event {
            Event::Query { text, scope_id, budget, ground_truth, .. } => {
                assert_eq!(text, "order status?");
                assert!(scope_id.is_none());
                assert!(budget.is_none());
                assert!(ground_truth.is_none());
            }
            other => panic!("expected a query event, got {other:?}"),
        }

        let raw = r#"{"type":"state_write","ts":"2024-03-01T09:00:00Z","key":"vendor","value":"Acme selected"}"#;
        let event: Event = serde_json::from_str(raw)?;
        match event {
            Event::StateWrite { key, source, scope, depends_on, .. } => {
                assert_eq!(key, FactKey::from("vendor"));
                assert!(source.is_none());
                assert!(scope.is_none());
                assert!(depends_on.is_empty());
            }
            other => panic!("expected a state write event, got {other:?}"),
        }
        Ok(())
    }

    // Test IDs: TSCHEMA-003
    #[test]
    fn ground_truth_defaults_allowed_sources() -> Result<()> {
        let raw = r#"{"decision":"no"}"#;
        let truth: GroundTruth = serde_json::from_str(raw)?;
        assert_eq!(truth.decision, "no");
        assert_eq!(truth.allowed_sources, vec!["persistent_facts", "environment"]);
        assert!(truth.must_mention.is_empty());
        assert!(truth.must_not_mention.is_empty());
        Ok(())
    }

    // Test IDs: TSCHEMA-004
    #[test]
    fn turn_scope_inference_matches_the_phrase_tables() {
        assert_eq!(infer_turn_scope("What if we doubled the order?"), Scope::Hypothetical);
        assert_eq!(infer_turn_scope("Hypothetically, could we ship early?"), Scope::Hypothetical);
        assert_eq!(infer_turn_scope("Here is a draft of the reply"), Scope::Draft);
        assert_eq!(infer_turn_scope("This proposal is tentative"), Scope::Draft);
        assert_eq!(infer_turn_scope("Use rush shipping just for this task"), Scope::Task);
        assert_eq!(infer_turn_scope("The vendor confirmed the order"), Scope::Global);
    }
}
