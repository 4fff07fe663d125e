//! `mneme-types` – shared vocabulary for the mneme workspace.
//!
//! Everything in here is plain data: record identifiers, the closed set of
//! record kinds and the partitions they live in, the open metadata map with
//! its well-known keys, and the [`InputValidator`] seam that lets the memory
//! layer consult a security middleware without depending on it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Partition
// ─────────────────────────────────────────────────────────────────────────────

/// Sub-collection a record lives in, selected by its [`RecordKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Observation,
    Action,
    Workflow,
}

impl Partition {
    /// Every partition, in lock-acquisition order.
    pub const ALL: [Partition; 3] =
        [Partition::Observation, Partition::Action, Partition::Workflow];

    /// Prefix used in [`MemoryId`]s of records stored in this partition.
    pub fn prefix(self) -> &'static str {
        match self {
            Partition::Observation => "obs",
            Partition::Action => "act",
            Partition::Workflow => "wf",
        }
    }

    /// Name of the backing table.
    pub fn table(self) -> &'static str {
        match self {
            Partition::Observation => "observations",
            Partition::Action => "actions",
            Partition::Workflow => "workflows",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Partition::ALL.into_iter().find(|p| p.prefix() == prefix)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Partition {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "obs" | "observation" | "observations" => Ok(Partition::Observation),
            "act" | "action" | "actions" => Ok(Partition::Action),
            "wf" | "workflow" | "workflows" => Ok(Partition::Workflow),
            other => Err(IdError::UnknownPartition(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryId
// ─────────────────────────────────────────────────────────────────────────────

/// Errors produced while parsing identifiers and partition names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("malformed memory id: {0}")]
    Malformed(String),
    #[error("unknown partition: {0}")]
    UnknownPartition(String),
}

/// Last timestamp handed out by [`MemoryId::generate`], so ids created later
/// in this process always sort later even within the same microsecond.
static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

fn next_micros() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Globally unique record identifier: `{prefix}_{micros:016}_{suffix}`.
///
/// The zero-padded microsecond timestamp makes ids of the same partition sort
/// lexicographically by creation time. Ordering across partitions compares
/// the timestamp first.
///
/// ```rust
/// use mneme_types::{MemoryId, Partition};
///
/// let a = MemoryId::generate(Partition::Observation);
/// let b = MemoryId::generate(Partition::Observation);
/// assert!(a.as_str().starts_with("obs_"));
/// assert!(a < b);
/// assert_eq!(b.partition(), Some(Partition::Observation));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryId {
    raw: String,
    micros: i64,
    partition: Option<Partition>,
}

impl MemoryId {
    const SENTINEL: &'static str = "disabled";

    /// Fresh id for a record created now.
    pub fn generate(partition: Partition) -> Self {
        Self::with_micros(partition, next_micros())
    }

    /// Id carrying an explicit creation time. Used when importing records
    /// and by tests that need aged data.
    pub fn generate_at(partition: Partition, at: DateTime<Utc>) -> Self {
        Self::with_micros(partition, at.timestamp_micros())
    }

    fn with_micros(partition: Partition, micros: i64) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            raw: format!("{}_{:016}_{}", partition.prefix(), micros, &suffix[..8]),
            micros,
            partition: Some(partition),
        }
    }

    /// Placeholder returned by a disabled memory manager.
    pub fn disabled() -> Self {
        Self {
            raw: Self::SENTINEL.to_string(),
            micros: 0,
            partition: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.partition.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Partition encoded in the prefix; `None` only for the disabled sentinel.
    pub fn partition(&self) -> Option<Partition> {
        self.partition
    }

    /// Creation time in microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> i64 {
        self.micros
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for MemoryId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::SENTINEL {
            return Ok(Self::disabled());
        }
        let mut parts = s.splitn(3, '_');
        let (Some(prefix), Some(micros), Some(suffix)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::Malformed(s.to_string()));
        };
        let partition = Partition::from_prefix(prefix)
            .ok_or_else(|| IdError::UnknownPartition(prefix.to_string()))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| IdError::Malformed(s.to_string()))?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::Malformed(s.to_string()));
        }
        Ok(Self {
            raw: s.to_string(),
            micros,
            partition: Some(partition),
        })
    }
}

impl TryFrom<String> for MemoryId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryId> for String {
    fn from(id: MemoryId) -> Self {
        id.raw
    }
}

impl PartialOrd for MemoryId {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryId {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.micros
            .cmp(&other.micros)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actions and record kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Action type of the narrow re-analysis performed by a cautious step.
pub const REANALYZE: &str = "reanalyze";
/// Action type used to replay a stored workflow.
pub const REPLAY_WORKFLOW: &str = "replay_workflow";

/// An operation the decision loop can hand to an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// e.g. `"click"`, `"type_text"`, `"replay_workflow"`
    pub action_type: String,
    /// What the action is aimed at (element label, URL, workflow name...).
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            target: None,
            params: empty_params(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.params.is_object() {
            self.params = empty_params();
        }
        if let Value::Object(map) = &mut self.params {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Identity used to count repeated failures: action type plus target.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.action_type, self.target.as_deref().unwrap_or(""))
    }

    pub fn is_information_gathering(&self) -> bool {
        self.action_type == REANALYZE
    }
}

impl fmt::Display for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "{}({t})", self.action_type),
            None => f.write_str(&self.action_type),
        }
    }
}

/// One step of a recorded workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step: u32,
    pub action: String,
    /// `"success"`, `"failed"`, `"skipped"` ...
    pub status: String,
}

impl WorkflowStep {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

/// The closed set of record kinds. The variant selects the partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    /// A perceived state plus its interpretation.
    Observation {
        #[serde(default)]
        interpretation: Option<String>,
        /// Which analysis provider produced the interpretation.
        #[serde(default)]
        provider: Option<String>,
        #[serde(default)]
        screen_text: Option<String>,
    },
    /// An attempted operation and its outcome.
    Action { action: ActionSpec, success: bool },
    /// A named multi-step sequence with aggregate success metrics.
    Workflow {
        name: String,
        steps: Vec<WorkflowStep>,
        success: bool,
        #[serde(default)]
        duration_secs: f64,
    },
}

impl RecordKind {
    /// Bare observation with no interpretation attached.
    pub fn observation() -> Self {
        RecordKind::Observation {
            interpretation: None,
            provider: None,
            screen_text: None,
        }
    }

    pub fn partition(&self) -> Partition {
        match self {
            RecordKind::Observation { .. } => Partition::Observation,
            RecordKind::Action { .. } => Partition::Action,
            RecordKind::Workflow { .. } => Partition::Workflow,
        }
    }

    /// Outcome flag of actions and workflows; observations carry none.
    pub fn success(&self) -> Option<bool> {
        match self {
            RecordKind::Observation { .. } => None,
            RecordKind::Action { success, .. } | RecordKind::Workflow { success, .. } => {
                Some(*success)
            }
        }
    }

    /// Fraction of workflow steps that succeeded. `None` for other kinds or
    /// empty workflows.
    pub fn success_ratio(&self) -> Option<f64> {
        match self {
            RecordKind::Workflow { steps, .. } if !steps.is_empty() => {
                let ok = steps.iter().filter(|s| s.succeeded()).count();
                Some(ok as f64 / steps.len() as f64)
            }
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Well-known metadata keys. Anything else is accepted untyped.
pub mod keys {
    pub const CREATED_AT: &str = "created_at";
    pub const SESSION_ID: &str = "session_id";
    pub const SOURCE: &str = "source";
    pub const PINNED: &str = "pinned";
    pub const SUCCESS: &str = "success";
    pub const STRATEGY: &str = "strategy";
    pub const CONFIDENCE: &str = "confidence";
    pub const GOAL: &str = "goal";
    pub const TAGS: &str = "tags";

    /// Keys whose value may be replaced by a later patch.
    pub const MUTABLE: &[&str] = &[PINNED, TAGS];
}

/// Errors raised when metadata violates the well-known key schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key `{key}` must be {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("metadata key `{key}` out of range: {detail}")]
    OutOfRange { key: String, detail: String },
    #[error("metadata key `{0}` is immutable once set")]
    Immutable(String),
}

/// How a record came to exist; drives quota importance ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Explicitly created by a user or operator.
    Manual,
    /// Captured automatically by a loop or background process.
    Auto,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Auto => "auto",
        }
    }
}

/// Open key/value map attached to every record.
///
/// ```rust
/// use mneme_types::{Metadata, keys};
///
/// let mut meta = Metadata::new().with(keys::SUCCESS, true);
/// assert_eq!(meta.success(), Some(true));
/// assert!(!meta.is_pinned());
///
/// // Patches may add keys and flip mutable ones.
/// meta.merge(Metadata::new().with(keys::PINNED, true)).unwrap();
/// assert!(meta.is_pinned());
///
/// // Immutable keys cannot be rewritten.
/// assert!(meta.merge(Metadata::new().with(keys::SUCCESS, false)).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Insert only when the key is absent.
    pub fn insert_default(&mut self, key: &str, value: impl Into<Value>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        self.get(keys::PINNED).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn success(&self) -> Option<bool> {
        self.get(keys::SUCCESS).and_then(Value::as_bool)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.get(keys::CONFIDENCE).and_then(Value::as_f64)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get(keys::SESSION_ID).and_then(Value::as_str)
    }

    /// Absent or unrecognised sources count as [`Source::Auto`].
    pub fn source(&self) -> Source {
        match self.get(keys::SOURCE).and_then(Value::as_str) {
            Some("manual") => Source::Manual,
            _ => Source::Auto,
        }
    }

    /// `true` when every pair in `filter` is present here with an equal value.
    pub fn matches(&self, filter: &Metadata) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Enforce the types of well-known keys.
    pub fn validate(&self) -> Result<(), MetadataError> {
        for (key, value) in &self.0 {
            match key.as_str() {
                keys::PINNED | keys::SUCCESS => expect_type(key, value.is_boolean(), "a boolean")?,
                keys::SESSION_ID | keys::STRATEGY | keys::GOAL => {
                    expect_type(key, value.is_string(), "a string")?
                }
                keys::CREATED_AT => {
                    let ok = value
                        .as_str()
                        .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok());
                    expect_type(key, ok, "an RFC 3339 timestamp")?
                }
                keys::SOURCE => {
                    let ok = matches!(value.as_str(), Some("manual") | Some("auto"));
                    expect_type(key, ok, "\"manual\" or \"auto\"")?
                }
                keys::TAGS => {
                    let ok = value
                        .as_array()
                        .is_some_and(|items| items.iter().all(Value::is_string));
                    expect_type(key, ok, "an array of strings")?
                }
                keys::CONFIDENCE => {
                    let Some(c) = value.as_f64() else {
                        return Err(MetadataError::WrongType {
                            key: key.clone(),
                            expected: "a number",
                        });
                    };
                    if !(0.0..=1.0).contains(&c) {
                        return Err(MetadataError::OutOfRange {
                            key: key.clone(),
                            detail: format!("{c} not in [0, 1]"),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Apply an additive patch. New keys are added; existing keys may only be
    /// replaced when listed in [`keys::MUTABLE`] or when the value is unchanged.
    /// On error nothing is applied.
    pub fn merge(&mut self, patch: Metadata) -> Result<(), MetadataError> {
        patch.validate()?;
        for (key, value) in &patch.0 {
            if let Some(existing) = self.0.get(key) {
                if existing != value && !keys::MUTABLE.contains(&key.as_str()) {
                    return Err(MetadataError::Immutable(key.clone()));
                }
            }
        }
        self.0.extend(patch.0);
        Ok(())
    }
}

fn expect_type(key: &str, ok: bool, expected: &'static str) -> Result<(), MetadataError> {
    if ok {
        Ok(())
    } else {
        Err(MetadataError::WrongType {
            key: key.to_string(),
            expected,
        })
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryRecord
// ─────────────────────────────────────────────────────────────────────────────

/// The atomic unit of memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub kind: RecordKind,
    /// Text the embedding was derived from. Never changes after creation.
    pub content: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl MemoryRecord {
    /// Build a record with a fresh id in the partition matching `kind`.
    pub fn new(
        kind: RecordKind,
        content: impl Into<String>,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: MemoryId::generate(kind.partition()),
            kind,
            content: content.into(),
            vector,
            metadata,
        }
    }

    pub fn partition(&self) -> Partition {
        self.kind.partition()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }

    pub fn is_pinned(&self) -> bool {
        self.metadata.is_pinned()
    }

    /// Success flag from metadata, falling back to the kind's own outcome.
    pub fn success(&self) -> Option<bool> {
        self.metadata.success().or_else(|| self.kind.success())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input validation seam
// ─────────────────────────────────────────────────────────────────────────────

/// Which rule set an input is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    General,
    Command,
    Path,
    Url,
    Sql,
    Html,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputKind::General => "general",
            InputKind::Command => "command",
            InputKind::Path => "path",
            InputKind::Url => "url",
            InputKind::Sql => "sql",
            InputKind::Html => "html",
        };
        f.write_str(s)
    }
}

/// Outcome of a validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Security middleware consulted before content is stored or an action runs.
///
/// Implementations are expected to record their own rejections (audit log);
/// callers only act on the [`Verdict`].
pub trait InputValidator: Send + Sync {
    fn validate(&self, input: &str, kind: InputKind) -> Verdict;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
