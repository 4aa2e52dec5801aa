//! Policy document ("business logic"), declarative validation, and immutable snapshots.
//!
//! The document mirrors the YAML policy file. Validation runs in three passes and
//! reports every violation it finds, never just the first:
//!
//! 1. schema pass over the raw YAML tree: required fields present, enum strings known;
//! 2. typed parse (`serde_yaml`); type mismatches surface as [`ConfigError::Parse`];
//! 3. range pass over [`RANGES`] plus cross-field rules.
//!
//! A [`PolicySnapshot`] can only be built from a document that passed all three.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use sha2::{Digest, Sha256};

use crate::{ConfigError, Violation};

/// Deployment environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const NAMES: &'static [&'static str] = &["development", "staging", "production"];
}

/// Selection algorithm. Only Gumbel-Top-k is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    GumbelTopK,
}

impl SelectionMethod {
    pub const NAMES: &'static [&'static str] = &["gumbel_top_k"];
}

/// How the per-slot RNG seed is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    /// `hash(global_seed, window_id, slot_start)`.
    WindowSlot,
    /// `global_seed` only; every slot sees the same noise. Useful for replays.
    Fixed,
}

impl SeedStrategy {
    pub const NAMES: &'static [&'static str] = &["window_slot", "fixed"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knobs {
    pub boost_bucket: String,
    pub music_mood_focus: Vec<String>,
    pub interstitials_ratio: f64,
    /// Additive bias applied to every candidate score before temperature scaling.
    pub plan_selection_bias: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scheduling {
    pub slot_duration_minutes: u32,
    pub global_seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub method: SelectionMethod,
    pub temperature: f64,
    pub top_k: usize,
    pub seed_strategy: SeedStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub primary: Vec<String>,
    pub secondary: Vec<String>,
}

/// Policy knobs the autopilot is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Knob {
    Temperature,
    Epsilon,
    PlanSelectionBias,
    InterstitialsRatio,
}

impl Knob {
    pub const NAMES: &'static [&'static str] =
        &["temperature", "epsilon", "plan_selection_bias", "interstitials_ratio"];

    /// Dotted field name, as used in [`RANGES`] and violation reports.
    pub fn field(self) -> &'static str {
        match self {
            Knob::Temperature => "selection.temperature",
            Knob::Epsilon => "exploration.epsilon",
            Knob::PlanSelectionBias => "knobs.plan_selection_bias",
            Knob::InterstitialsRatio => "knobs.interstitials_ratio",
        }
    }

    /// Static valid range of this knob.
    pub fn range(self) -> FieldRange {
        range_of(self.field()).unwrap_or(FieldRange::new("", f64::NEG_INFINITY, f64::INFINITY))
    }

    pub fn get(self, doc: &PolicyDocument) -> f64 {
        match self {
            Knob::Temperature => doc.selection.temperature,
            Knob::Epsilon => doc.exploration.epsilon,
            Knob::PlanSelectionBias => doc.knobs.plan_selection_bias,
            Knob::InterstitialsRatio => doc.knobs.interstitials_ratio,
        }
    }

    pub fn set(self, doc: &mut PolicyDocument, value: f64) {
        match self {
            Knob::Temperature => doc.selection.temperature = value,
            Knob::Epsilon => doc.exploration.epsilon = value,
            Knob::PlanSelectionBias => doc.knobs.plan_selection_bias = value,
            Knob::InterstitialsRatio => doc.knobs.interstitials_ratio = value,
        }
    }
}

/// Comparison applied by a [`FeedbackRule`] to a rolling metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Below,
    Above,
}

impl Comparator {
    pub const NAMES: &'static [&'static str] = &["below", "above"];

    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Below => value < threshold,
            Comparator::Above => value > threshold,
        }
    }
}

/// Declarative autopilot rule: when `metric` is `comparator` `threshold`, move `knob` by `delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRule {
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub knob: Knob,
    pub delta: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_rules() -> Vec<FeedbackRule> {
    vec![
        FeedbackRule {
            metric: "diversity".to_string(),
            comparator: Comparator::Below,
            threshold: 0.3,
            knob: Knob::Temperature,
            delta: 0.02,
            reason: "selection diversity below target, explore more".to_string(),
        },
        FeedbackRule {
            metric: "retention".to_string(),
            comparator: Comparator::Below,
            threshold: 0.5,
            knob: Knob::Temperature,
            delta: -0.02,
            reason: "retention below target, exploit more".to_string(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotPolicy {
    pub enabled: bool,
    /// Upper bound on the summed absolute change of any one knob per UTC day.
    pub max_daily_variation: f64,
    /// Minimum spacing between two applied adjustments.
    pub cadence_hours: f64,
    pub rules: Vec<FeedbackRule>,
}

impl Default for AutopilotPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_daily_variation: 0.05,
            cadence_hours: 4.0,
            rules: default_rules(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Failure ratio in the rolling window at or above which the breaker opens.
    pub failure_threshold: f64,
    pub window_size: usize,
    /// Attempts the window must hold before the ratio is evaluated.
    pub min_calls: usize,
    /// Hard per-call deadline.
    pub timeout_seconds: f64,
    pub recovery_timeout_seconds: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.2,
            window_size: 50,
            min_calls: 3,
            timeout_seconds: 3.0,
            recovery_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryPolicy {
    pub enabled: bool,
    pub max_budget_eur_per_hour: f64,
    /// Estimated cost charged against the budget for each attempted call.
    pub cost_per_call_eur: f64,
    /// Minimum self-reported confidence for a suggestion to be applied.
    pub confidence_threshold: f64,
    pub circuit_breaker: BreakerPolicy,
}

impl Default for AdvisoryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_budget_eur_per_hour: 1.0,
            cost_per_call_eur: 0.01,
            confidence_threshold: 0.7,
            circuit_breaker: BreakerPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketPolicy {
    pub capacity: f64,
    pub refill_rate_per_hour: f64,
}

impl Default for TokenBucketPolicy {
    fn default() -> Self {
        Self {
            capacity: 3.0,
            refill_rate_per_hour: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorPolicy {
    pub enabled: bool,
    pub confidence_threshold: f64,
    /// Maximum number of positions any candidate may move when the curator intervenes.
    pub max_displacement: usize,
    pub tag_repeat_threshold: usize,
    pub clustering_threshold: f64,
    pub duration_band_seconds: u32,
    pub token_bucket: TokenBucketPolicy,
}

impl Default for CuratorPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.67,
            max_displacement: 4,
            tag_repeat_threshold: 3,
            clustering_threshold: 0.6,
            duration_band_seconds: 60,
            token_bucket: TokenBucketPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyBounds {
    pub min_temperature: f64,
    pub max_temperature: f64,
    /// Minimum variance of decision scores before the curator flags low diversity.
    pub min_diversity: f64,
    pub max_interventions_per_hour: f64,
}

impl Default for SafetyBounds {
    fn default() -> Self {
        Self {
            min_temperature: 0.1,
            max_temperature: 2.0,
            min_diversity: 0.05,
            max_interventions_per_hour: 6.0,
        }
    }
}

/// The full policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub policy_version: String,
    pub env: Environment,
    pub knobs: Knobs,
    pub scheduling: Scheduling,
    pub selection: SelectionPolicy,
    pub exploration: Exploration,
    pub kpis: Kpis,
    #[serde(default)]
    pub autopilot: AutopilotPolicy,
    #[serde(default)]
    pub llm_integration: AdvisoryPolicy,
    #[serde(default)]
    pub curator_vigilante: CuratorPolicy,
    #[serde(default)]
    pub safety: SafetyBounds,
}

impl PolicyDocument {
    /// Parse and fully validate a YAML policy.
    ///
    /// When the tree has structural problems (missing fields, wrong types, unknown enum
    /// values), they are reported together with every range and pattern violation found
    /// among the values that are present. Only YAML syntax errors surface as
    /// [`ConfigError::Parse`].
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let tree: Value = serde_yaml::from_str(text)?;
        let structural = check_schema(&tree);
        let values = check_raw_values(&tree);
        if !structural.is_empty() {
            let mut all = structural;
            all.extend(values);
            return Err(ConfigError::Invalid(all));
        }
        let doc: PolicyDocument = match serde_yaml::from_value(tree) {
            Ok(doc) => doc,
            Err(_) if !values.is_empty() => return Err(ConfigError::Invalid(values)),
            Err(e) => return Err(e.into()),
        };
        validate(&doc).map_err(ConfigError::Invalid)?;
        Ok(doc)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Hex SHA-256 over the canonical JSON encoding, domain-separated.
    pub fn content_hash(&self) -> Result<String, ConfigError> {
        let canonical =
            serde_json::to_vec(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(b"slotmux_policy_v1:");
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// Declarative rules
// ---------------------------------------------------------------------------

/// Inclusive static range for one numeric field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRange {
    pub field: &'static str,
    pub min: f64,
    pub max: f64,
}

impl FieldRange {
    pub const fn new(field: &'static str, min: f64, max: f64) -> Self {
        Self { field, min, max }
    }

    /// `false` for non-finite values.
    pub fn contains(&self, v: f64) -> bool {
        v.is_finite() && v >= self.min && v <= self.max
    }
}

/// Every numeric field of the policy and its valid range.
pub const RANGES: &[FieldRange] = &[
    FieldRange::new("selection.temperature", 0.1, 2.0),
    FieldRange::new("selection.top_k", 5.0, 50.0),
    FieldRange::new("exploration.epsilon", 0.0, 0.5),
    FieldRange::new("knobs.plan_selection_bias", -0.2, 0.2),
    FieldRange::new("knobs.interstitials_ratio", 0.0, 1.0),
    FieldRange::new("scheduling.slot_duration_minutes", 1.0, 1440.0),
    FieldRange::new("autopilot.max_daily_variation", 0.0, 0.2),
    FieldRange::new("autopilot.cadence_hours", 0.0, 168.0),
    FieldRange::new("llm_integration.max_budget_eur_per_hour", 0.0, 1000.0),
    FieldRange::new("llm_integration.cost_per_call_eur", 0.0, 100.0),
    FieldRange::new("llm_integration.confidence_threshold", 0.0, 1.0),
    FieldRange::new("llm_integration.circuit_breaker.failure_threshold", 0.01, 1.0),
    FieldRange::new("llm_integration.circuit_breaker.window_size", 1.0, 1000.0),
    FieldRange::new("llm_integration.circuit_breaker.min_calls", 1.0, 1000.0),
    FieldRange::new("llm_integration.circuit_breaker.timeout_seconds", 0.1, 60.0),
    FieldRange::new("llm_integration.circuit_breaker.recovery_timeout_seconds", 1.0, 86_400.0),
    FieldRange::new("curator_vigilante.confidence_threshold", 0.0, 1.0),
    FieldRange::new("curator_vigilante.max_displacement", 0.0, 50.0),
    FieldRange::new("curator_vigilante.tag_repeat_threshold", 2.0, 50.0),
    FieldRange::new("curator_vigilante.clustering_threshold", 0.0, 1.0),
    FieldRange::new("curator_vigilante.duration_band_seconds", 1.0, 3600.0),
    FieldRange::new("curator_vigilante.token_bucket.capacity", 1.0, 1000.0),
    FieldRange::new("curator_vigilante.token_bucket.refill_rate_per_hour", 0.0, 1000.0),
    FieldRange::new("safety.min_temperature", 0.1, 2.0),
    FieldRange::new("safety.max_temperature", 0.1, 2.0),
    FieldRange::new("safety.min_diversity", 0.0, 10.0),
    FieldRange::new("safety.max_interventions_per_hour", 0.0, 1000.0),
];

/// Production autopilot must not move any knob by more than this per day.
pub const PRODUCTION_MAX_DAILY_VARIATION: f64 = 0.05;

/// Largest single step an autopilot rule may declare.
pub const MAX_RULE_DELTA: f64 = 0.5;

pub fn range_of(field: &str) -> Option<FieldRange> {
    RANGES.iter().copied().find(|r| r.field == field)
}

fn field_value(doc: &PolicyDocument, field: &str) -> Option<f64> {
    let cb = &doc.llm_integration.circuit_breaker;
    let cur = &doc.curator_vigilante;
    let v = match field {
        "selection.temperature" => doc.selection.temperature,
        "selection.top_k" => doc.selection.top_k as f64,
        "exploration.epsilon" => doc.exploration.epsilon,
        "knobs.plan_selection_bias" => doc.knobs.plan_selection_bias,
        "knobs.interstitials_ratio" => doc.knobs.interstitials_ratio,
        "scheduling.slot_duration_minutes" => f64::from(doc.scheduling.slot_duration_minutes),
        "autopilot.max_daily_variation" => doc.autopilot.max_daily_variation,
        "autopilot.cadence_hours" => doc.autopilot.cadence_hours,
        "llm_integration.max_budget_eur_per_hour" => doc.llm_integration.max_budget_eur_per_hour,
        "llm_integration.cost_per_call_eur" => doc.llm_integration.cost_per_call_eur,
        "llm_integration.confidence_threshold" => doc.llm_integration.confidence_threshold,
        "llm_integration.circuit_breaker.failure_threshold" => cb.failure_threshold,
        "llm_integration.circuit_breaker.window_size" => cb.window_size as f64,
        "llm_integration.circuit_breaker.min_calls" => cb.min_calls as f64,
        "llm_integration.circuit_breaker.timeout_seconds" => cb.timeout_seconds,
        "llm_integration.circuit_breaker.recovery_timeout_seconds" => {
            cb.recovery_timeout_seconds as f64
        }
        "curator_vigilante.confidence_threshold" => cur.confidence_threshold,
        "curator_vigilante.max_displacement" => cur.max_displacement as f64,
        "curator_vigilante.tag_repeat_threshold" => cur.tag_repeat_threshold as f64,
        "curator_vigilante.clustering_threshold" => cur.clustering_threshold,
        "curator_vigilante.duration_band_seconds" => f64::from(cur.duration_band_seconds),
        "curator_vigilante.token_bucket.capacity" => cur.token_bucket.capacity,
        "curator_vigilante.token_bucket.refill_rate_per_hour" => {
            cur.token_bucket.refill_rate_per_hour
        }
        "safety.min_temperature" => doc.safety.min_temperature,
        "safety.max_temperature" => doc.safety.max_temperature,
        "safety.min_diversity" => doc.safety.min_diversity,
        "safety.max_interventions_per_hour" => doc.safety.max_interventions_per_hour,
        _ => return None,
    };
    Some(v)
}

/// Shape a value in the raw policy tree must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Text,
    TextList,
    Number,
    /// Non-negative integer.
    Count,
    Flag,
    Section,
    List,
}

impl Shape {
    fn accepts(self, v: &Value) -> bool {
        match self {
            Shape::Text => v.is_string(),
            Shape::TextList => v
                .as_sequence()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Shape::Number => v.is_number(),
            Shape::Count => v.as_u64().is_some(),
            Shape::Flag => v.is_bool(),
            Shape::Section => v.is_mapping(),
            Shape::List => v.is_sequence(),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            Shape::Text => "a string",
            Shape::TextList => "a list of strings",
            Shape::Number => "a number",
            Shape::Count => "a non-negative integer",
            Shape::Flag => "true or false",
            Shape::Section => "a mapping",
            Shape::List => "a list",
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Every known path of the policy tree: `(path, shape, required)`.
const FIELDS: &[(&str, Shape, bool)] = &[
    ("policy_version", Shape::Text, true),
    ("env", Shape::Text, true),
    ("knobs", Shape::Section, false),
    ("knobs.boost_bucket", Shape::Text, true),
    ("knobs.music_mood_focus", Shape::TextList, true),
    ("knobs.interstitials_ratio", Shape::Number, true),
    ("knobs.plan_selection_bias", Shape::Number, true),
    ("scheduling", Shape::Section, false),
    ("scheduling.slot_duration_minutes", Shape::Count, true),
    ("scheduling.global_seed", Shape::Count, true),
    ("selection", Shape::Section, false),
    ("selection.method", Shape::Text, true),
    ("selection.temperature", Shape::Number, true),
    ("selection.top_k", Shape::Count, true),
    ("selection.seed_strategy", Shape::Text, true),
    ("exploration", Shape::Section, false),
    ("exploration.epsilon", Shape::Number, true),
    ("kpis", Shape::Section, false),
    ("kpis.primary", Shape::TextList, true),
    ("kpis.secondary", Shape::TextList, true),
    ("autopilot", Shape::Section, false),
    ("autopilot.enabled", Shape::Flag, false),
    ("autopilot.max_daily_variation", Shape::Number, false),
    ("autopilot.cadence_hours", Shape::Number, false),
    ("autopilot.rules", Shape::List, false),
    ("llm_integration", Shape::Section, false),
    ("llm_integration.enabled", Shape::Flag, false),
    ("llm_integration.max_budget_eur_per_hour", Shape::Number, false),
    ("llm_integration.cost_per_call_eur", Shape::Number, false),
    ("llm_integration.confidence_threshold", Shape::Number, false),
    ("llm_integration.circuit_breaker", Shape::Section, false),
    ("llm_integration.circuit_breaker.failure_threshold", Shape::Number, false),
    ("llm_integration.circuit_breaker.window_size", Shape::Count, false),
    ("llm_integration.circuit_breaker.min_calls", Shape::Count, false),
    ("llm_integration.circuit_breaker.timeout_seconds", Shape::Number, false),
    ("llm_integration.circuit_breaker.recovery_timeout_seconds", Shape::Count, false),
    ("curator_vigilante", Shape::Section, false),
    ("curator_vigilante.enabled", Shape::Flag, false),
    ("curator_vigilante.confidence_threshold", Shape::Number, false),
    ("curator_vigilante.max_displacement", Shape::Count, false),
    ("curator_vigilante.tag_repeat_threshold", Shape::Count, false),
    ("curator_vigilante.clustering_threshold", Shape::Number, false),
    ("curator_vigilante.duration_band_seconds", Shape::Count, false),
    ("curator_vigilante.token_bucket", Shape::Section, false),
    ("curator_vigilante.token_bucket.capacity", Shape::Number, false),
    ("curator_vigilante.token_bucket.refill_rate_per_hour", Shape::Number, false),
    ("safety", Shape::Section, false),
    ("safety.min_temperature", Shape::Number, false),
    ("safety.max_temperature", Shape::Number, false),
    ("safety.min_diversity", Shape::Number, false),
    ("safety.max_interventions_per_hour", Shape::Number, false),
];

/// Fields of one `autopilot.rules` entry.
const RULE_FIELDS: &[(&str, Shape, bool)] = &[
    ("metric", Shape::Text, true),
    ("comparator", Shape::Text, true),
    ("threshold", Shape::Number, true),
    ("knob", Shape::Text, true),
    ("delta", Shape::Number, true),
    ("reason", Shape::Text, false),
];

/// Enum-valued paths and their allowed spellings.
const ENUMS: &[(&str, &[&str])] = &[
    ("env", Environment::NAMES),
    ("selection.method", SelectionMethod::NAMES),
    ("selection.seed_strategy", SeedStrategy::NAMES),
];

fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(tree, |node, key| node.get(key))
}

fn check_shape(
    out: &mut Vec<Violation>,
    field: &str,
    value: Option<&Value>,
    shape: Shape,
    required: bool,
) {
    match value {
        None | Some(Value::Null) if required => {
            out.push(Violation::new(field, "required field is missing"));
        }
        None => {}
        Some(v) if !shape.accepts(v) => out.push(Violation::new(
            field,
            format!("expected {}, got {}", shape.expected(), kind_of(v)),
        )),
        Some(_) => {}
    }
}

fn check_enum(out: &mut Vec<Violation>, field: &str, value: Option<&Value>, allowed: &[&str]) {
    if let Some(Value::String(s)) = value {
        if !allowed.contains(&s.as_str()) {
            out.push(Violation::new(
                field,
                format!("unknown value {s:?}, expected one of {allowed:?}"),
            ));
        }
    }
}

/// Structural pass over the raw tree: every missing required field, every value of the
/// wrong type and every unknown enum spelling.
pub fn check_schema(tree: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    if !tree.is_mapping() {
        out.push(Violation::new("<root>", "policy must be a mapping"));
        return out;
    }
    for &(path, shape, required) in FIELDS {
        check_shape(&mut out, path, lookup(tree, path), shape, required);
    }
    for (path, allowed) in ENUMS {
        check_enum(&mut out, path, lookup(tree, path), allowed);
    }
    let rules = lookup(tree, "autopilot.rules").and_then(Value::as_sequence);
    for (i, rule) in rules.into_iter().flatten().enumerate() {
        let prefix = format!("autopilot.rules[{i}]");
        if !rule.is_mapping() {
            out.push(Violation::new(
                prefix,
                format!("expected a mapping, got {}", kind_of(rule)),
            ));
            continue;
        }
        for &(key, shape, required) in RULE_FIELDS {
            check_shape(&mut out, &format!("{prefix}.{key}"), rule.get(key), shape, required);
        }
        check_enum(
            &mut out,
            &format!("{prefix}.comparator"),
            rule.get("comparator"),
            Comparator::NAMES,
        );
        check_enum(&mut out, &format!("{prefix}.knob"), rule.get("knob"), Knob::NAMES);
    }
    out
}

/// Range and pattern checks on whatever values are present in the raw tree.
///
/// Runs alongside [`check_schema`] so a document with structural problems still reports
/// its out-of-range values. Cross-field rules need a typed document and are left to
/// [`validate`].
pub fn check_raw_values(tree: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    if let Some(Value::String(v)) = lookup(tree, "policy_version") {
        if !valid_policy_version(v) {
            out.push(version_violation(v));
        }
    }
    for r in RANGES {
        if let Some(v) = lookup(tree, r.field).and_then(Value::as_f64) {
            if !r.contains(v) {
                out.push(range_violation(r, v));
            }
        }
    }
    out
}

fn version_violation(v: &str) -> Violation {
    Violation::new("policy_version", format!("must match YYYY.MM, got {v:?}"))
}

fn range_violation(r: &FieldRange, v: f64) -> Violation {
    Violation::new(r.field, format!("must be in [{}, {}], got {v}", r.min, r.max))
}

fn valid_policy_version(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 7 || b[4] != b'.' {
        return false;
    }
    if !b[..4].iter().chain(&b[5..]).all(u8::is_ascii_digit) {
        return false;
    }
    let month = (b[5] - b'0') * 10 + (b[6] - b'0');
    (1..=12).contains(&month)
}

/// Range, pattern and cross-field validation of a typed document.
///
/// Returns every violation found.
pub fn validate(doc: &PolicyDocument) -> Result<(), Vec<Violation>> {
    let mut out = Vec::new();

    if !valid_policy_version(&doc.policy_version) {
        out.push(version_violation(&doc.policy_version));
    }

    for r in RANGES {
        if let Some(v) = field_value(doc, r.field) {
            if !r.contains(v) {
                out.push(range_violation(r, v));
            }
        }
    }

    if doc.kpis.primary.is_empty() {
        out.push(Violation::new("kpis.primary", "must list at least one KPI"));
    }

    // Cross-field rules.
    if doc.env == Environment::Production
        && doc.autopilot.enabled
        && doc.autopilot.max_daily_variation > PRODUCTION_MAX_DAILY_VARIATION
    {
        out.push(Violation::new(
            "autopilot.max_daily_variation",
            format!(
                "must be <= {PRODUCTION_MAX_DAILY_VARIATION} in production with autopilot enabled, got {}",
                doc.autopilot.max_daily_variation
            ),
        ));
    }
    let s = &doc.safety;
    if s.min_temperature > s.max_temperature {
        out.push(Violation::new(
            "safety.min_temperature",
            format!(
                "must be <= safety.max_temperature ({}), got {}",
                s.max_temperature, s.min_temperature
            ),
        ));
    }
    let t = doc.selection.temperature;
    if t.is_finite() && (t < s.min_temperature || t > s.max_temperature) {
        out.push(Violation::new(
            "selection.temperature",
            format!(
                "must be within safety bounds [{}, {}], got {t}",
                s.min_temperature, s.max_temperature
            ),
        ));
    }
    let bucket = &doc.curator_vigilante.token_bucket;
    if bucket.refill_rate_per_hour > s.max_interventions_per_hour {
        out.push(Violation::new(
            "curator_vigilante.token_bucket.refill_rate_per_hour",
            format!(
                "must be <= safety.max_interventions_per_hour ({}), got {}",
                s.max_interventions_per_hour, bucket.refill_rate_per_hour
            ),
        ));
    }
    let cb = &doc.llm_integration.circuit_breaker;
    if cb.min_calls > cb.window_size {
        out.push(Violation::new(
            "llm_integration.circuit_breaker.min_calls",
            format!("must be <= window_size ({}), got {}", cb.window_size, cb.min_calls),
        ));
    }

    for (i, rule) in doc.autopilot.rules.iter().enumerate() {
        let field = format!("autopilot.rules[{i}]");
        if rule.metric.trim().is_empty() {
            out.push(Violation::new(format!("{field}.metric"), "must not be empty"));
        }
        if !rule.threshold.is_finite() {
            out.push(Violation::new(format!("{field}.threshold"), "must be finite"));
        }
        if !rule.delta.is_finite() || rule.delta == 0.0 || rule.delta.abs() > MAX_RULE_DELTA {
            out.push(Violation::new(
                format!("{field}.delta"),
                format!("must be finite, non-zero and within +/-{MAX_RULE_DELTA}, got {}", rule.delta),
            ));
        }
    }

    if out.is_empty() {
        Ok(())
    } else {
        Err(out)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable, validated view of one policy revision.
///
/// Built only through [`PolicySnapshot::new`], which validates first; a snapshot with an
/// out-of-range knob cannot exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySnapshot {
    revision: u64,
    content_hash: String,
    published_at: DateTime<Utc>,
    document: PolicyDocument,
}

impl PolicySnapshot {
    /// Validate `document` and wrap it. `revision` is assigned by the store; standalone
    /// snapshots (tests, dry runs) use `0`.
    pub fn new(
        document: PolicyDocument,
        revision: u64,
        published_at: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        validate(&document).map_err(ConfigError::Invalid)?;
        let content_hash = document.content_hash()?;
        Ok(Self {
            revision,
            content_hash,
            published_at,
            document,
        })
    }

    pub fn from_yaml(text: &str, published_at: DateTime<Utc>) -> Result<Self, ConfigError> {
        Self::new(PolicyDocument::from_yaml(text)?, 0, published_at)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    pub fn version(&self) -> &str {
        &self.document.policy_version
    }

    pub fn env(&self) -> Environment {
        self.document.env
    }

    pub fn bias(&self) -> f64 {
        self.document.knobs.plan_selection_bias
    }

    pub fn temperature(&self) -> f64 {
        self.document.selection.temperature
    }

    pub fn top_k(&self) -> usize {
        self.document.selection.top_k
    }

    pub fn epsilon(&self) -> f64 {
        self.document.exploration.epsilon
    }

    pub fn seed_strategy(&self) -> SeedStrategy {
        self.document.selection.seed_strategy
    }

    pub fn slot_duration_minutes(&self) -> u32 {
        self.document.scheduling.slot_duration_minutes
    }

    pub fn global_seed(&self) -> u64 {
        self.document.scheduling.global_seed
    }

    pub fn advisory(&self) -> &AdvisoryPolicy {
        &self.document.llm_integration
    }

    pub fn curator(&self) -> &CuratorPolicy {
        &self.document.curator_vigilante
    }

    pub fn autopilot(&self) -> &AutopilotPolicy {
        &self.document.autopilot
    }

    pub fn safety(&self) -> &SafetyBounds {
        &self.document.safety
    }
}
