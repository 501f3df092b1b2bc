// Job definitions
//
// A job describes one aggregation query: which table it listens on,
// an optional app allowlist, a where filter, group-by fields, the time
// bucket granularity, the aggregate functions per field and the output
// projections. Definitions are stored externally as JSON and are
// immutable during a processing cycle.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::bucket::{bucket_key, BucketUnit};
use crate::filter::Condition;
use crate::record::{value_to_string, Record};

/// Storage keys are bounded: longer group keys are truncated and made
/// unique again with a hash suffix.
pub const GROUP_KEY_MAX_LEN: usize = 140;
const GROUP_KEY_KEEP_LEN: usize = 120;

/// Which aggregate functions apply to which fields, plus the distinct,
/// passthrough-value and excluded field sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Functions {
    pub sum: BTreeSet<String>,
    pub count: BTreeSet<String>,
    pub min: BTreeSet<String>,
    pub max: BTreeSet<String>,
    pub first: BTreeSet<String>,
    pub last: BTreeSet<String>,
    pub dist: BTreeSet<String>,
    pub value: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

/// Time bucket granularity: `{type: unit, limit: width}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GroupTime {
    #[serde(rename = "type")]
    pub unit: BucketUnit,
    #[serde(rename = "limit", default = "default_width")]
    pub width: u32,
}

fn default_width() -> u32 {
    1
}

/// How one output field is filled from the accumulated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionKind {
    Count,
    Sum,
    Min,
    Max,
    First,
    Last,
    Dist,
    Exclude,
    #[serde(other)]
    Value,
}

impl Default for ProjectionKind {
    fn default() -> Self {
        ProjectionKind::Value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveField {
    #[serde(rename = "type", default)]
    pub kind: ProjectionKind,
    #[serde(default)]
    pub field: String,
}

/// Projection for one output table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveTable {
    #[serde(rename = "allField")]
    pub all_field: bool,
    pub field: BTreeMap<String, SaveField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id.
    pub key: String,
    /// Source table the job listens on.
    pub table: String,
    #[serde(rename = "use", default = "default_true")]
    pub enabled: bool,
    /// App allowlist; empty means every app.
    #[serde(rename = "for", default)]
    pub for_apps: BTreeSet<String>,
    #[serde(rename = "where", default)]
    pub where_filter: Option<Condition>,
    #[serde(rename = "groupBy", default)]
    pub group_by: Vec<String>,
    #[serde(rename = "groupTime")]
    pub group_time: GroupTime,
    #[serde(rename = "function", default)]
    pub functions: Functions,
    #[serde(rename = "saveAs", default)]
    pub save_as: BTreeMap<String, SaveTable>,
    /// Capture the whole record as the value snapshot.
    #[serde(rename = "allField", default)]
    pub all_field: bool,
}

fn default_true() -> bool {
    true
}

impl JobDefinition {
    /// Accepts records from this app?
    pub fn accepts_app(&self, app: &str) -> bool {
        self.for_apps.is_empty() || self.for_apps.contains(app)
    }

    /// The bucket id for a record: `{width}{unit}_{bucketKey}` followed
    /// by the group-by field values.
    pub fn bucket_id(&self, record: &Record, time_secs: i64) -> String {
        let mut id = format!(
            "{}{}_{}",
            self.group_time.width,
            self.group_time.unit,
            bucket_key(time_secs, self.group_time.unit, self.group_time.width)
        );
        for field in &self.group_by {
            id.push('_');
            if let Some(value) = record.get(field) {
                id.push_str(&value_to_string(value));
            }
        }
        id
    }

    /// The full group key `{jobId},{app},{bucketId}`, shortened when it
    /// exceeds the storage-key bound.
    pub fn group_key(&self, app: &str, bucket_id: &str) -> String {
        shorten_key(format!("{},{},{}", self.key, app, bucket_id))
    }
}

/// Deterministically bound a storage key's length: keep a readable
/// prefix and append a truncated hash of the whole key.
pub fn shorten_key(key: String) -> String {
    if key.chars().count() <= GROUP_KEY_MAX_LEN {
        return key;
    }
    let prefix: String = key.chars().take(GROUP_KEY_KEEP_LEN).collect();
    let digest = blake3::hash(key.as_bytes()).to_hex();
    format!("{}_{}", prefix, &digest.as_str()[..32])
}
