//! Rule definitions: parsing, validation, and the active rule set.
//!
//! A rule file is deserialised into a loose [`RawRule`] where every field is
//! optional, then validated into an immutable [`RuleDefinition`]. Validation
//! reports the first problem it finds as a single [`RuleValidationError`], so
//! one malformed file yields exactly one error and never a silently defaulted
//! threshold.

pub mod duration;
pub mod loader;
pub mod store;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use self::duration::DurationSpec;
use crate::error::RuleValidationError;

pub use self::store::RuleStore;

/// Largest page of documents a single rule query may request.
pub const MAX_HITS_LIMIT: usize = 10_000;

const DEFAULT_MAX_HITS: usize = 500;
const DEFAULT_TIMESTAMP_FIELD: &str = "@timestamp";

// ---------------------------------------------------------------------------
// RuleKind
// ---------------------------------------------------------------------------

/// Which way a spike must move to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeDirection {
    Up,
    Down,
    Both,
}

/// The matching algorithm of a rule, with its kind-specific thresholds.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    /// At least `num_events` documents within `timeframe`.
    Frequency { num_events: u64, timeframe: Duration },
    /// Current window count differs from the previous window by more than
    /// `spike_height` times.
    Spike {
        spike_height: f64,
        direction: SpikeDirection,
        threshold_ref: Option<u64>,
        threshold_cur: Option<u64>,
    },
    /// No documents at all for `timeframe`.
    Flatline { timeframe: Duration },
    /// A document's `compare_key` value is one of `values`.
    Blacklist {
        compare_key: String,
        values: HashSet<String>,
    },
    /// A document's `compare_key` value is not one of `values`.
    Whitelist {
        compare_key: String,
        values: HashSet<String>,
        ignore_null: bool,
    },
    /// `compare_key` changed since the last document with the same `query_key`.
    Change {
        query_key: String,
        compare_key: String,
        ignore_null: bool,
    },
    /// Distinct values of `field` within `timeframe` fall outside `[min, max]`.
    Cardinality {
        field: String,
        timeframe: Duration,
        max: Option<u64>,
        min: Option<u64>,
    },
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Frequency { .. } => "frequency",
            RuleKind::Spike { .. } => "spike",
            RuleKind::Flatline { .. } => "flatline",
            RuleKind::Blacklist { .. } => "blacklist",
            RuleKind::Whitelist { .. } => "whitelist",
            RuleKind::Change { .. } => "change",
            RuleKind::Cardinality { .. } => "cardinality",
        }
    }

    /// Kinds that only need the total hit count, never the documents.
    pub fn supports_count_query(&self) -> bool {
        matches!(
            self,
            RuleKind::Frequency { .. } | RuleKind::Spike { .. } | RuleKind::Flatline { .. }
        )
    }

    /// Document fields the evaluator reads.
    pub fn required_fields(&self) -> Vec<&str> {
        match self {
            RuleKind::Blacklist { compare_key, .. } | RuleKind::Whitelist { compare_key, .. } => {
                vec![compare_key.as_str()]
            }
            RuleKind::Change {
                query_key,
                compare_key,
                ..
            } => vec![query_key.as_str(), compare_key.as_str()],
            RuleKind::Cardinality { field, .. } => vec![field.as_str()],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RuleDefinition
// ---------------------------------------------------------------------------

/// A validated rule. Immutable once loaded; reloads replace it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub name: String,
    pub index: String,
    pub timestamp_field: String,
    /// Backend query clause, combined with the time-range filter at run time.
    pub query: serde_json::Value,
    pub kind: RuleKind,
    pub run_every: Duration,
    pub buffer_time: Duration,
    pub realert: Duration,
    pub destinations: Vec<String>,
    pub include: Vec<String>,
    pub alert_subject: Option<String>,
    pub alert_text: Option<String>,
    pub max_hits: usize,
    pub use_count_query: bool,
    pub source: PathBuf,
}

impl RuleDefinition {
    /// Fields to request from the backend, or `None` for the whole document.
    pub fn source_fields(&self) -> Option<Vec<String>> {
        if self.include.is_empty() {
            return None;
        }
        let mut fields: Vec<String> = Vec::new();
        let wanted = std::iter::once(self.timestamp_field.as_str())
            .chain(self.kind.required_fields())
            .chain(self.include.iter().map(String::as_str));
        for f in wanted {
            if !fields.iter().any(|x| x == f) {
                fields.push(f.to_string());
            }
        }
        Some(fields)
    }
}

// ---------------------------------------------------------------------------
// RuleSet
// ---------------------------------------------------------------------------

/// One generation of loaded rules, keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Arc<RuleDefinition>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule; returns `false` (and keeps the existing one) on a name clash.
    pub fn insert(&mut self, rule: RuleDefinition) -> bool {
        if self.rules.contains_key(&rule.name) {
            return false;
        }
        self.rules.insert(rule.name.clone(), Arc::new(rule));
        true
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RuleDefinition>> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RuleDefinition>> {
        self.rules.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<RuleDefinition> for RuleSet {
    fn from_iter<T: IntoIterator<Item = RuleDefinition>>(iter: T) -> Self {
        let mut set = RuleSet::new();
        for rule in iter {
            set.insert(rule);
        }
        set
    }
}

// ---------------------------------------------------------------------------
// Raw rule file
// ---------------------------------------------------------------------------

/// Destinations known to the daemon, used while validating rules.
#[derive(Debug, Clone)]
pub struct DestinationCatalog {
    pub known: HashSet<String>,
    pub defaults: Vec<String>,
}

impl DestinationCatalog {
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            known: config.destination_names().into_iter().collect(),
            defaults: config.alert.default_destinations.clone(),
        }
    }
}

/// A rule file as written, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRule {
    pub name: Option<String>,
    pub index: Option<String>,
    pub timestamp_field: Option<String>,
    pub query: Option<serde_json::Value>,
    pub run_every: Option<DurationSpec>,
    pub buffer_time: Option<DurationSpec>,
    pub realert: Option<DurationSpec>,
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
    pub alert_subject: Option<String>,
    pub alert_text: Option<String>,
    pub max_hits: Option<usize>,
    #[serde(default)]
    pub use_count_query: bool,
    pub enabled: Option<bool>,
    pub kind: Option<RawKind>,
}

/// Kind-specific parameters; which ones are required depends on `type`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawKind {
    #[serde(rename = "type")]
    pub kind_type: Option<String>,
    pub num_events: Option<u64>,
    pub timeframe: Option<DurationSpec>,
    pub spike_height: Option<f64>,
    pub spike_type: Option<SpikeDirection>,
    pub threshold_ref: Option<u64>,
    pub threshold_cur: Option<u64>,
    pub compare_key: Option<String>,
    pub blacklist: Option<Vec<String>>,
    pub whitelist: Option<Vec<String>>,
    pub ignore_null: Option<bool>,
    pub query_key: Option<String>,
    pub cardinality_field: Option<String>,
    pub max_cardinality: Option<u64>,
    pub min_cardinality: Option<u64>,
}

impl RawRule {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Validate into a schedulable definition.
    pub fn validate(
        self,
        source: &Path,
        catalog: &DestinationCatalog,
    ) -> Result<RuleDefinition, RuleValidationError> {
        let name = match self.name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => {
                return Err(RuleValidationError::Parse {
                    path: source.to_path_buf(),
                    reason: "missing required field 'name'".to_string(),
                })
            }
        };

        let missing = |field: &'static str| RuleValidationError::MissingField {
            rule: name.clone(),
            field,
        };
        let invalid = |field: &'static str, reason: &str| RuleValidationError::InvalidField {
            rule: name.clone(),
            field,
            reason: reason.to_string(),
        };

        let index = self
            .index
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| missing("index"))?;

        let run_every = self.run_every.ok_or_else(|| missing("run_every"))?.to_duration();
        if run_every.is_zero() {
            return Err(invalid("run_every", "must be greater than zero"));
        }

        let max_hits = self.max_hits.unwrap_or(DEFAULT_MAX_HITS);
        if max_hits == 0 || max_hits > MAX_HITS_LIMIT {
            return Err(invalid("max_hits", "must be between 1 and 10000"));
        }

        let raw_kind = self.kind.ok_or_else(|| missing("kind"))?;
        let kind = validate_kind(raw_kind, &missing, &invalid)?;

        if self.use_count_query && !kind.supports_count_query() {
            return Err(invalid(
                "use_count_query",
                "only frequency, spike and flatline rules can use count queries",
            ));
        }

        let destinations = if self.destinations.is_empty() {
            catalog.defaults.clone()
        } else {
            self.destinations
        };
        if destinations.is_empty() {
            return Err(missing("destinations"));
        }
        for dest in &destinations {
            if !catalog.known.contains(dest) {
                return Err(RuleValidationError::UnknownDestination {
                    rule: name.clone(),
                    destination: dest.clone(),
                });
            }
        }

        let query = match self.query {
            Some(q) if q.is_object() => q,
            Some(_) => return Err(invalid("query", "must be a table")),
            None => serde_json::json!({ "match_all": {} }),
        };

        Ok(RuleDefinition {
            index,
            timestamp_field: self
                .timestamp_field
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_FIELD.to_string()),
            query,
            kind,
            run_every,
            buffer_time: self.buffer_time.unwrap_or_default().to_duration(),
            realert: self.realert.unwrap_or_default().to_duration(),
            destinations,
            include: self.include,
            alert_subject: self.alert_subject,
            alert_text: self.alert_text,
            max_hits,
            use_count_query: self.use_count_query,
            source: source.to_path_buf(),
            name,
        })
    }
}

fn validate_kind(
    raw: RawKind,
    missing: &dyn Fn(&'static str) -> RuleValidationError,
    invalid: &dyn Fn(&'static str, &str) -> RuleValidationError,
) -> Result<RuleKind, RuleValidationError> {
    let kind_type = raw.kind_type.ok_or_else(|| missing("kind.type"))?;
    let positive = |spec: Option<DurationSpec>,
                    field: &'static str|
     -> Result<Duration, RuleValidationError> {
        let d = spec.ok_or_else(|| missing(field))?.to_duration();
        if d.is_zero() {
            return Err(invalid(field, "must be greater than zero"));
        }
        Ok(d)
    };
    let non_empty = |value: Option<String>,
                     field: &'static str|
     -> Result<String, RuleValidationError> {
        match value {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(missing(field)),
        }
    };

    match kind_type.as_str() {
        "frequency" => {
            let num_events = raw.num_events.ok_or_else(|| missing("kind.num_events"))?;
            if num_events == 0 {
                return Err(invalid("kind.num_events", "must be at least 1"));
            }
            Ok(RuleKind::Frequency {
                num_events,
                timeframe: positive(raw.timeframe, "kind.timeframe")?,
            })
        }
        "spike" => {
            let spike_height = raw.spike_height.ok_or_else(|| missing("kind.spike_height"))?;
            if !spike_height.is_finite() || spike_height <= 1.0 {
                return Err(invalid("kind.spike_height", "must be a number greater than 1"));
            }
            Ok(RuleKind::Spike {
                spike_height,
                direction: raw.spike_type.ok_or_else(|| missing("kind.spike_type"))?,
                threshold_ref: raw.threshold_ref,
                threshold_cur: raw.threshold_cur,
            })
        }
        "flatline" => Ok(RuleKind::Flatline {
            timeframe: positive(raw.timeframe, "kind.timeframe")?,
        }),
        "blacklist" => {
            let values = raw.blacklist.ok_or_else(|| missing("kind.blacklist"))?;
            if values.is_empty() {
                return Err(invalid("kind.blacklist", "must not be empty"));
            }
            Ok(RuleKind::Blacklist {
                compare_key: non_empty(raw.compare_key, "kind.compare_key")?,
                values: values.into_iter().collect(),
            })
        }
        "whitelist" => {
            let values = raw.whitelist.ok_or_else(|| missing("kind.whitelist"))?;
            if values.is_empty() {
                return Err(invalid("kind.whitelist", "must not be empty"));
            }
            Ok(RuleKind::Whitelist {
                compare_key: non_empty(raw.compare_key, "kind.compare_key")?,
                values: values.into_iter().collect(),
                ignore_null: raw.ignore_null.unwrap_or(false),
            })
        }
        "change" => Ok(RuleKind::Change {
            query_key: non_empty(raw.query_key, "kind.query_key")?,
            compare_key: non_empty(raw.compare_key, "kind.compare_key")?,
            ignore_null: raw.ignore_null.unwrap_or(false),
        }),
        "cardinality" => {
            let field = non_empty(raw.cardinality_field, "kind.cardinality_field")?;
            let timeframe = positive(raw.timeframe, "kind.timeframe")?;
            let (max, min) = (raw.max_cardinality, raw.min_cardinality);
            if max.is_none() && min.is_none() {
                return Err(missing("kind.max_cardinality"));
            }
            if let (Some(max), Some(min)) = (max, min) {
                if min > max {
                    return Err(invalid(
                        "kind.min_cardinality",
                        "must not exceed max_cardinality",
                    ));
                }
            }
            Ok(RuleKind::Cardinality {
                field,
                timeframe,
                max,
                min,
            })
        }
        _ => Err(invalid("kind.type", "unknown rule type")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
