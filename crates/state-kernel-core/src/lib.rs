use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("duplicate fact key: {0}")]
    DuplicateKey(FactKey),
    #[error("unknown fact: {0}")]
    UnknownFact(FactKey),
    #[error("unknown supersede target: {0}")]
    UnknownSupersedeTarget(FactKey),
    #[error("dependency edge {parent} -> {child} would create a cycle")]
    CycleDetected { parent: FactKey, child: FactKey },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FactKey(pub String);

impl FactKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FactKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FactKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeId(pub String);

impl ScopeId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies one engine lifetime. Regenerated whenever a timeline is reset,
/// so diagnostics from different timelines never alias.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimelineId(pub Ulid);

impl TimelineId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TimelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TimelineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authority ladder for the querying identity. Variant order is the
/// comparison order: `guest < employee < manager < admin < policy`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    Guest,
    Employee,
    Manager,
    Admin,
    Policy,
}

impl AuthorityLevel {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Guest => 1,
            Self::Employee => 2,
            Self::Manager => 3,
            Self::Admin => 4,
            Self::Policy => 5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Admin => "admin",
            Self::Policy => "policy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "guest" => Some(Self::Guest),
            "employee" => Some(Self::Employee),
            "manager" => Some(Self::Manager),
            "admin" => Some(Self::Admin),
            "policy" => Some(Self::Policy),
            _ => None,
        }
    }
}

/// Blast radius of a fact: where it counts as true.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Task,
    Hypothetical,
    Draft,
    Session,
}

impl Scope {
    /// Hypothetical and draft facts never participate in a global-truth read.
    #[must_use]
    pub fn is_speculative(self) -> bool {
        matches!(self, Self::Hypothetical | Self::Draft)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Task => "task",
            Self::Hypothetical => "hypothetical",
            Self::Draft => "draft",
            Self::Session => "session",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(Self::Global),
            "task" => Some(Self::Task),
            "hypothetical" => Some(Self::Hypothetical),
            "draft" => Some(Self::Draft),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

const ORGANIZATIONAL_SOURCES: &[&str] = &[
    "policy",
    "finance_system",
    "hr_system",
    "calendar_system",
    "inventory_system",
    "crm_system",
    "erp_system",
    "document",
    "sharepoint",
    "confluence",
    "database",
];

const CAPABILITY_SOURCES: &[&str] = &["observation", "pattern", "heuristic", "strategy"];

/// Tri-partite memory classification, derived from a fact's source.
/// Descriptive metadata for presentation and the authority gate; it never
/// decides validity on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    User,
    Capability,
    Organizational,
}

impl MemoryClass {
    #[must_use]
    pub fn classify(source: &str) -> Self {
        if ORGANIZATIONAL_SOURCES.contains(&source) {
            return Self::Organizational;
        }
        if CAPABILITY_SOURCES.contains(&source) {
            return Self::Capability;
        }
        Self::User
    }

    /// Minimum authority a reading identity needs before facts of this class
    /// become visible.
    #[must_use]
    pub fn minimum_authority(self) -> AuthorityLevel {
        match self {
            Self::Organizational => AuthorityLevel::Employee,
            Self::User | Self::Capability => AuthorityLevel::Guest,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Capability => "capability",
            Self::Organizational => "organizational",
        }
    }

    /// Compact label used in rendered context entries.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "usr",
            Self::Capability => "cap",
            Self::Organizational => "org",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "capability" => Some(Self::Capability),
            "organizational" => Some(Self::Organizational),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Budget,
    Deadline,
    Capacity,
    Policy,
}

impl ConstraintKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Deadline => "deadline",
            Self::Capacity => "capacity",
            Self::Policy => "policy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "budget" => Some(Self::Budget),
            "deadline" => Some(Self::Deadline),
            "capacity" => Some(Self::Capacity),
            "policy" => Some(Self::Policy),
            _ => None,
        }
    }

    /// Keyword-table inference over the fact value.
    #[must_use]
    pub fn infer(value: &str) -> Option<Self> {
        let lower = value.to_lowercase();
        if ["budget", "$", "cost", "price", "spend"].iter().any(|kw| lower.contains(kw)) {
            return Some(Self::Budget);
        }
        if ["deadline", "due", "by", "before", "until"].iter().any(|kw| lower.contains(kw)) {
            return Some(Self::Deadline);
        }
        if ["capacity", "available", "team", "resource", "hours"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            return Some(Self::Capacity);
        }
        if ["policy", "require", "must", "approval", "authority"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            return Some(Self::Policy);
        }
        None
    }
}

const CASUAL_MARKERS: &[&str] = &[
    "INVALIDATED",
    "CORRECTION",
    "delayed",
    "changed",
    "let's go with",
    "just fyi",
    "btw",
    "hold on",
    "wait",
    "best we can do",
    "fine,",
    "bad news",
    "good news",
];

const FORMAL_INDICATORS: &[&str] = &[
    "must",
    "require",
    "policy",
    "limit is",
    "maximum is",
    "minimum is",
    "cannot exceed",
    "not allowed",
    "prohibited",
    "mandatory",
    "approval required",
    "needs approval",
    "authority to",
];

/// Whether a fact value reads as a formal constraint rather than a casual
/// mention or a correction. Policy-sourced facts always count.
#[must_use]
pub fn is_formal_constraint(value: &str, source: &str) -> bool {
    if CASUAL_MARKERS.iter().any(|marker| value.contains(marker)) {
        return false;
    }

    let lower = value.to_lowercase();
    let has_formal = FORMAL_INDICATORS.iter().any(|indicator| lower.contains(indicator));

    if source == "policy" {
        return true;
    }
    has_formal
}

/// Layer 1: who is asking. Created once per session and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityRole {
    pub user_name: String,
    pub authority: AuthorityLevel,
    pub department: Option<String>,
    pub organization: Option<String>,
    pub communication_style: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Default for IdentityRole {
    fn default() -> Self {
        Self {
            user_name: "anonymous".to_string(),
            authority: AuthorityLevel::Guest,
            department: None,
            organization: None,
            communication_style: None,
            permissions: BTreeSet::new(),
        }
    }
}

/// Layer 2: a single persistent fact with supersession, scope, dependency,
/// and constraint metadata.
///
/// `reaffirmations` counts identical re-writes of the same key. It is
/// recorded so callers can audit repetition, and deliberately never consulted
/// by `resolve_current` or any read path: restating a fact does not make it
/// true again.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistentFact {
    pub key: FactKey,
    pub value: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_valid: bool,
    pub superseded_by: Option<FactKey>,
    pub supersedes: Option<FactKey>,
    pub memory_class: MemoryClass,
    pub scope: Scope,
    pub scope_id: Option<ScopeId>,
    #[serde(default)]
    pub depends_on: BTreeSet<FactKey>,
    #[serde(default)]
    pub derived_facts: BTreeSet<FactKey>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub is_constraint: bool,
    pub constraint_kind: Option<ConstraintKind>,
    #[serde(default)]
    pub reaffirmations: u32,
}

/// Layer 3: an ephemeral working-set entry. No supersession; items are
/// overwritten or dropped, never invalidated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkingSetItem {
    pub key: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub scope: Scope,
}

impl WorkingSetItem {
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentSignal {
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

/// Signals beyond this count evict the stalest entry.
pub const ENVIRONMENT_SIGNAL_CAP: usize = 5;

/// Layer 4: read-only external state. The engine renders it; the owning
/// collaborator updates it through [`Environment::apply`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Environment {
    #[serde(with = "time::serde::rfc3339")]
    pub current_time: OffsetDateTime,
    pub timezone: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    signals: BTreeMap<String, EnvironmentSignal>,
}

impl Environment {
    #[must_use]
    pub fn new(current_time: OffsetDateTime) -> Self {
        Self { current_time, timezone: None, location: None, signals: BTreeMap::new() }
    }

    /// Record an external signal, respecting freshness: an update older than
    /// the stored observation for the same key is ignored. Naming a
    /// `supersedes` key removes that entry first. The signal map stays
    /// bounded at [`ENVIRONMENT_SIGNAL_CAP`].
    pub fn apply(
        &mut self,
        key: &str,
        value: &str,
        observed_at: OffsetDateTime,
        supersedes: Option<&str>,
    ) {
        if let Some(replaced) = supersedes {
            self.signals.remove(replaced);
        }

        if let Some(existing) = self.signals.get(key) {
            if existing.observed_at > observed_at {
                return;
            }
        }
        self.signals
            .insert(key.to_string(), EnvironmentSignal { value: value.to_string(), observed_at });

        while self.signals.len() > ENVIRONMENT_SIGNAL_CAP {
            let stalest = self
                .signals
                .iter()
                .filter(|(candidate, _)| candidate.as_str() != key)
                .min_by(|(key_a, sig_a), (key_b, sig_b)| {
                    sig_a.observed_at.cmp(&sig_b.observed_at).then_with(|| key_a.cmp(key_b))
                })
                .map(|(candidate, _)| candidate.clone());
            match stalest {
                Some(candidate) => self.signals.remove(&candidate),
                None => break,
            };
        }
    }

    #[must_use]
    pub fn signal(&self, key: &str) -> Option<&EnvironmentSignal> {
        self.signals.get(key)
    }

    /// Signals ordered freshest first, key ascending on ties.
    #[must_use]
    pub fn signals_by_freshness(&self) -> Vec<(&str, &EnvironmentSignal)> {
        let mut entries: Vec<(&str, &EnvironmentSignal)> =
            self.signals.iter().map(|(key, signal)| (key.as_str(), signal)).collect();
        entries.sort_by(|(key_a, sig_a), (key_b, sig_b)| {
            sig_b.observed_at.cmp(&sig_a.observed_at).then_with(|| key_a.cmp(key_b))
        });
        entries
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }
}

/// One write against the supersession resolver.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteRequest {
    pub key: FactKey,
    pub value: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub scope: Scope,
    pub scope_id: Option<ScopeId>,
    pub supersedes: Option<FactKey>,
    #[serde(default)]
    pub depends_on: Vec<FactKey>,
    pub constraint_kind: Option<ConstraintKind>,
}

impl WriteRequest {
    #[must_use]
    pub fn new(
        key: impl Into<FactKey>,
        value: impl Into<String>,
        source: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: source.into(),
            created_at,
            scope: Scope::Global,
            scope_id: None,
            supersedes: None,
            depends_on: Vec::new(),
            constraint_kind: None,
        }
    }

    #[must_use]
    pub fn scoped(mut self, scope: Scope, scope_id: Option<ScopeId>) -> Self {
        self.scope = scope;
        self.scope_id = scope_id;
        self
    }

    #[must_use]
    pub fn superseding(mut self, target: impl Into<FactKey>) -> Self {
        self.supersedes = Some(target.into());
        self
    }

    #[must_use]
    pub fn derived_from(mut self, parents: Vec<FactKey>) -> Self {
        self.depends_on = parents;
        self
    }
}

impl From<String> for FactKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// All persistent facts for one timeline, in insertion order, plus the
/// supersession and derivation graphs over them. One store per engine
/// instance; nothing is shared across timelines.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FactStore {
    facts: BTreeMap<FactKey, PersistentFact>,
    insertion_order: Vec<FactKey>,
}

impl FactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed fact.
    ///
    /// # Errors
    /// Returns [`KernelError::DuplicateKey`] when the key already exists;
    /// keys are never reused.
    pub fn create(&mut self, fact: PersistentFact) -> Result<(), KernelError> {
        if self.facts.contains_key(&fact.key) {
            return Err(KernelError::DuplicateKey(fact.key.clone()));
        }
        self.insertion_order.push(fact.key.clone());
        self.facts.insert(fact.key.clone(), fact);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &FactKey) -> Option<&PersistentFact> {
        self.facts.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &FactKey) -> bool {
        self.facts.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Every fact ever written, in insertion order. Diagnostic surface only;
    /// the context assembler never reads this.
    pub fn all(&self) -> impl Iterator<Item = &PersistentFact> + '_ {
        self.insertion_order.iter().filter_map(|key| self.facts.get(key))
    }

    /// The global-decision subsequence: valid facts whose scope is not
    /// hypothetical or draft.
    pub fn valid(&self) -> impl Iterator<Item = &PersistentFact> + '_ {
        self.all().filter(|fact| fact.is_valid && !fact.scope.is_speculative())
    }

    /// Hypothetical/draft content for a collaborator that explicitly asks
    /// for what-if material. `scope_id = None` returns every speculative
    /// fact regardless of its scope identifier.
    pub fn drafts<'a>(
        &'a self,
        scope_id: Option<&'a ScopeId>,
    ) -> impl Iterator<Item = &'a PersistentFact> + 'a {
        self.all().filter(move |fact| {
            fact.scope.is_speculative()
                && match scope_id {
                    Some(wanted) => fact.scope_id.as_ref() == Some(wanted),
                    None => true,
                }
        })
    }

    /// Apply one write through the supersession resolver.
    ///
    /// A write that re-states an existing key with the identical value is a
    /// re-affirmation: the mention counter is bumped and nothing else moves,
    /// in particular a superseded fact is not resurrected. A write that
    /// re-uses a key with a different value is a malformed stream.
    ///
    /// # Errors
    /// Returns [`KernelError::DuplicateKey`] on conflicting key reuse,
    /// [`KernelError::UnknownSupersedeTarget`] when the supersede target is
    /// absent, [`KernelError::UnknownFact`] when a declared dependency is
    /// absent, and [`KernelError::CycleDetected`] for self-supersession or a
    /// dependency edge that would close a cycle.
    pub fn write(&mut self, request: WriteRequest) -> Result<(), KernelError> {
        let WriteRequest {
            key,
            value,
            source,
            created_at,
            scope,
            scope_id,
            supersedes,
            depends_on,
            constraint_kind,
        } = request;

        if let Some(existing) = self.facts.get_mut(&key) {
            if supersedes.is_none() && existing.value == value {
                existing.reaffirmations = existing.reaffirmations.saturating_add(1);
                return Ok(());
            }
            return Err(KernelError::DuplicateKey(key));
        }

        if let Some(target) = &supersedes {
            if *target == key {
                return Err(KernelError::CycleDetected { parent: key.clone(), child: key });
            }
            if !self.facts.contains_key(target) {
                return Err(KernelError::UnknownSupersedeTarget(target.clone()));
            }
        }
        for parent in &depends_on {
            if *parent == key {
                return Err(KernelError::CycleDetected { parent: parent.clone(), child: key });
            }
            if !self.facts.contains_key(parent) {
                return Err(KernelError::UnknownFact(parent.clone()));
            }
        }

        // A replacement inherits the class of what it replaces; fresh facts
        // classify from their source.
        let memory_class = supersedes
            .as_ref()
            .and_then(|target| self.facts.get(target))
            .map_or_else(|| MemoryClass::classify(&source), |target| target.memory_class);

        let is_constraint = constraint_kind.is_some() || is_formal_constraint(&value, &source);
        let constraint_kind = constraint_kind.or_else(|| ConstraintKind::infer(&value));

        let fact = PersistentFact {
            key: key.clone(),
            value,
            source,
            created_at,
            is_valid: true,
            superseded_by: None,
            supersedes: supersedes.clone(),
            memory_class,
            scope,
            scope_id,
            depends_on: BTreeSet::new(),
            derived_facts: BTreeSet::new(),
            needs_review: false,
            is_constraint,
            constraint_kind,
            reaffirmations: 0,
        };
        self.create(fact)?;

        if let Some(target) = supersedes {
            if let Some(old) = self.facts.get_mut(&target) {
                old.is_valid = false;
                old.superseded_by = Some(key.clone());
            }
            self.mark_invalidated(&target);
        }

        for parent in depends_on {
            self.link(&key, &parent)?;
        }
        Ok(())
    }

    /// Retract a fact with no replacement: `is_valid` drops, no successor is
    /// linked, dependents are flagged for review.
    ///
    /// # Errors
    /// Returns [`KernelError::UnknownFact`] when the key is absent.
    pub fn retract(&mut self, key: &FactKey) -> Result<(), KernelError> {
        match self.facts.get_mut(key) {
            Some(fact) => {
                fact.is_valid = false;
                fact.superseded_by = None;
            }
            None => return Err(KernelError::UnknownFact(key.clone())),
        }
        self.mark_invalidated(key);
        Ok(())
    }

    /// Follow `superseded_by` links until a valid fact or chain exhaustion.
    /// Resolution is driven purely by the explicit chain; write frequency and
    /// re-affirmation counts never participate.
    #[must_use]
    pub fn resolve_current<'a>(&'a self, key: &'a FactKey) -> Option<&'a PersistentFact> {
        let mut visited: BTreeSet<&FactKey> = BTreeSet::new();
        let mut cursor = key;
        loop {
            // Chains are acyclic by construction; the visited set is the
            // defense-in-depth bound.
            if !visited.insert(cursor) {
                return None;
            }
            let fact = self.facts.get(cursor)?;
            if fact.is_valid {
                return Some(fact);
            }
            match &fact.superseded_by {
                Some(next) => cursor = next,
                None => return None,
            }
        }
    }

    /// Add a derivation edge: `child` was derived from `parent`. Both edge
    /// sets are kept as mutual inverses.
    ///
    /// # Errors
    /// Returns [`KernelError::UnknownFact`] when either key is absent and
    /// [`KernelError::CycleDetected`] when the edge would break the DAG
    /// invariant; a rejected link mutates nothing.
    pub fn link(&mut self, child: &FactKey, parent: &FactKey) -> Result<(), KernelError> {
        if !self.facts.contains_key(child) {
            return Err(KernelError::UnknownFact(child.clone()));
        }
        if !self.facts.contains_key(parent) {
            return Err(KernelError::UnknownFact(parent.clone()));
        }
        if child == parent || self.reachable(child, parent) {
            return Err(KernelError::CycleDetected {
                parent: parent.clone(),
                child: child.clone(),
            });
        }

        if let Some(fact) = self.facts.get_mut(parent) {
            fact.derived_facts.insert(child.clone());
        }
        if let Some(fact) = self.facts.get_mut(child) {
            fact.depends_on.insert(parent.clone());
        }
        Ok(())
    }

    fn reachable(&self, from: &FactKey, to: &FactKey) -> bool {
        let mut visited: BTreeSet<&FactKey> = BTreeSet::new();
        let mut queue: VecDeque<&FactKey> = VecDeque::new();
        queue.push_back(from);
        while let Some(key) = queue.pop_front() {
            if key == to {
                return true;
            }
            if !visited.insert(key) {
                continue;
            }
            if let Some(fact) = self.facts.get(key) {
                queue.extend(fact.derived_facts.iter());
            }
        }
        false
    }

    /// Flag every fact transitively derived from `key` as needing review.
    /// Validity flags are untouched; a flagged fact still counts as valid
    /// until its own chain says otherwise. Idempotent, and bounded by the
    /// visited set even over shared subgraphs.
    pub fn mark_invalidated(&mut self, key: &FactKey) {
        let mut visited: BTreeSet<FactKey> = BTreeSet::new();
        visited.insert(key.clone());
        let mut queue: Vec<FactKey> = self
            .facts
            .get(key)
            .map(|fact| fact.derived_facts.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(next) = queue.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }
            if let Some(fact) = self.facts.get_mut(&next) {
                fact.needs_review = true;
                queue.extend(fact.derived_facts.iter().cloned());
            }
        }
    }
}

/// Scope and authority gate for one fact against one reading identity.
///
/// Global facts pass on authority alone; session/task facts additionally
/// require a matching scope identifier; hypothetical/draft facts never pass
/// and are reachable only through [`FactStore::drafts`].
#[must_use]
pub fn fact_visible(
    fact: &PersistentFact,
    identity: &IdentityRole,
    query_scope_id: Option<&ScopeId>,
) -> bool {
    if identity.authority.rank() < fact.memory_class.minimum_authority().rank() {
        return false;
    }

    match fact.scope {
        Scope::Global => true,
        Scope::Task | Scope::Session => match (&fact.scope_id, query_scope_id) {
            (Some(fact_scope), Some(wanted)) => fact_scope == wanted,
            _ => false,
        },
        Scope::Hypothetical | Scope::Draft => false,
    }
}

fn normalize_terms(value: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized.len() >= 2 {
            terms.insert(normalized);
        }
    }
    terms
}

fn format_timestamp(ts: OffsetDateTime) -> String {
    match ts.format(&Rfc3339) {
        Ok(rendered) => rendered,
        Err(_) => ts.unix_timestamp().to_string(),
    }
}

/// A context request. `budget` bounds the rendered output in characters.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextQuery {
    pub text: String,
    pub scope_id: Option<ScopeId>,
    pub budget: usize,
}

impl ContextQuery {
    #[must_use]
    pub fn new(text: impl Into<String>, budget: usize) -> Self {
        Self { text: text.into(), scope_id: None, budget }
    }

    #[must_use]
    pub fn scoped(mut self, scope_id: ScopeId) -> Self {
        self.scope_id = Some(scope_id);
        self
    }
}

/// The assembled context plus truncation diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssembledContext {
    pub rendered: String,
    pub included_facts: Vec<FactKey>,
    pub dropped_facts: Vec<FactKey>,
    pub dropped_working_set: usize,
    pub budget: usize,
}

fn identity_lines(identity: &IdentityRole) -> Vec<String> {
    let mut lines = vec![
        format!("User: {}", identity.user_name),
        format!("Role: {}", identity.authority.as_str()),
    ];
    if let Some(department) = &identity.department {
        lines.push(format!("Department: {department}"));
    }
    if let Some(organization) = &identity.organization {
        lines.push(format!("Organization: {organization}"));
    }
    lines
}

fn environment_lines(environment: &Environment) -> Vec<String> {
    let mut lines = vec![format!("- now: {}", format_timestamp(environment.current_time))];
    if let Some(timezone) = &environment.timezone {
        lines.push(format!("- timezone: {timezone}"));
    }
    if let Some(location) = &environment.location {
        lines.push(format!("- location: {location}"));
    }
    for (key, signal) in environment.signals_by_freshness() {
        lines.push(format!("- {key}: {}", signal.value));
    }
    lines
}

fn fact_line(fact: &PersistentFact) -> String {
    let mut line = format!("- [{}]", fact.memory_class.label());
    if fact.is_constraint {
        let kind = fact.constraint_kind.map_or("general", ConstraintKind::as_str);
        line.push_str(&format!(" [constraint:{kind}]"));
    }
    line.push(' ');
    line.push_str(&fact.value);
    if fact.needs_review {
        line.push_str(" (needs review)");
    }
    line
}

fn render_sections(sections: &[(&str, &[String])]) -> String {
    let mut blocks = Vec::new();
    for (title, lines) in sections {
        if lines.is_empty() {
            continue;
        }
        blocks.push(format!("## {title}\n{}", lines.join("\n")));
    }
    blocks.join("\n\n")
}

/// Compose the four layers into one bounded context string. Pure read: no
/// state is mutated. Section order is fixed (identity, environment, facts,
/// working set, known unknowns) and the budget is enforced by dropping
/// whole entries, oldest facts first, then oldest working-set lines, then
/// known unknowns and the superseded overview. Identity and environment
/// always survive. Degrades to empty sections rather than failing.
#[must_use]
pub fn assemble_context(
    store: &FactStore,
    identity: &IdentityRole,
    environment: &Environment,
    working_set: &[WorkingSetItem],
    known_unknowns: &[String],
    query: &ContextQuery,
) -> AssembledContext {
    let identity_block = identity_lines(identity);
    let environment_block = environment_lines(environment);

    // Facts: valid, visible, timestamp ascending with key as the tie-break.
    // Ranking by relevance is an external optimization, not this core.
    let mut visible: Vec<&PersistentFact> = store
        .valid()
        .filter(|fact| fact_visible(fact, identity, query.scope_id.as_ref()))
        .collect();
    visible.sort_by(|lhs, rhs| {
        lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.key.cmp(&rhs.key))
    });
    let mut fact_entries: Vec<(FactKey, String)> =
        visible.iter().map(|fact| (fact.key.clone(), fact_line(fact))).collect();

    // Superseded facts are listed by key only; their values must never
    // re-enter the context.
    let mut superseded: Vec<String> = store
        .all()
        .filter(|fact| !fact.is_valid)
        .map(|fact| format!("- {}", fact.key))
        .collect();
    superseded.sort();

    let query_terms = normalize_terms(&query.text);
    let mut working_lines: Vec<String> = working_set
        .iter()
        .filter(|item| !item.is_expired(environment.current_time))
        .filter(|item| {
            let item_terms = normalize_terms(&item.content);
            query_terms.iter().any(|term| item_terms.contains(term))
        })
        .map(|item| match item.scope {
            Scope::Hypothetical => format!("[HYPOTHETICAL] {}", item.content),
            Scope::Draft => format!("[DRAFT] {}", item.content),
            _ => item.content.clone(),
        })
        .collect();

    let mut unknown_lines: Vec<String> =
        known_unknowns.iter().map(|entry| format!("- {entry}")).collect();

    let mut dropped_facts: Vec<FactKey> = Vec::new();
    let mut dropped_working_set = 0_usize;

    let rendered = loop {
        let fact_lines: Vec<String> =
            fact_entries.iter().map(|(_, line)| line.clone()).collect();
        let rendered = render_sections(&[
            ("Identity", &identity_block),
            ("Environment", &environment_block),
            ("Current Facts", &fact_lines),
            ("Superseded", &superseded),
            ("Working Set", &working_lines),
            ("Known Unknowns", &unknown_lines),
        ]);

        if rendered.chars().count() <= query.budget {
            break rendered;
        }
        if !fact_entries.is_empty() {
            let (key, _) = fact_entries.remove(0);
            dropped_facts.push(key);
            continue;
        }
        if !working_lines.is_empty() {
            working_lines.remove(0);
            dropped_working_set += 1;
            continue;
        }
        if !unknown_lines.is_empty() {
            unknown_lines.remove(0);
            continue;
        }
        if !superseded.is_empty() {
            superseded.remove(0);
            continue;
        }
        // Identity and environment are never dropped, even over budget.
        break rendered;
    };

    AssembledContext {
        rendered,
        included_facts: fact_entries.into_iter().map(|(key, _)| key).collect(),
        dropped_facts,
        dropped_working_set,
        budget: query.budget,
    }
}
