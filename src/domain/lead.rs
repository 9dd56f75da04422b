//! Lead records and their lock fields.
//!
//! Leads are created by upstream discovery flows; this crate only reads
//! them, ranks them, and locks or unlocks them on behalf of a run.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A prospect record a run selects, locks, and processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    /// Upstream identifier
    pub id: String,

    /// Display name of the business
    #[serde(default, deserialize_with = "null_as_default")]
    pub business_name: String,

    /// Ranking key used for selection (higher first)
    #[serde(default, deserialize_with = "null_as_default")]
    pub lead_score: f64,

    /// Pipeline status
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: LeadStatus,

    /// Whether a run currently holds this lead
    #[serde(default, deserialize_with = "null_as_default")]
    pub locked: bool,

    /// Run holding the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by_run_id: Option<String>,

    /// When the lock was taken
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub locked_at: Option<DateTime<Utc>>,

    /// When the lock lapses
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub lock_expires_at: Option<DateTime<Utc>>,

    /// Remaining business attributes, preserved verbatim
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Lead {
    /// Create an unlocked lead in the `cold` status
    pub fn new(id: impl Into<String>, business_name: impl Into<String>, lead_score: f64) -> Self {
        Self {
            id: id.into(),
            business_name: business_name.into(),
            lead_score,
            status: LeadStatus::Cold,
            locked: false,
            locked_by_run_id: None,
            locked_at: None,
            lock_expires_at: None,
            attributes: Map::new(),
        }
    }

    /// Attach an extra business attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// A lock counts only while its expiry lies in the future
    pub fn has_active_lock(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.lock_expires_at.map(|t| t > now).unwrap_or(false)
    }

    /// A locked lead whose expiry is missing, unreadable, or past
    pub fn has_stale_lock(&self, now: DateTime<Utc>) -> bool {
        self.locked && !self.has_active_lock(now)
    }

    /// Selectable by a new run
    pub fn is_eligible(&self) -> bool {
        !self.locked && self.status != LeadStatus::Won
    }

    /// Take the lock on behalf of a run
    pub fn lock(&mut self, run_id: &str, ttl: Duration, now: DateTime<Utc>) {
        self.locked = true;
        self.locked_by_run_id = Some(run_id.to_string());
        self.locked_at = Some(now);
        self.lock_expires_at = Some(now + ttl);
        self.status = LeadStatus::Processing;
    }

    /// Clear every lock field, leaving the status untouched
    pub fn unlock(&mut self) {
        self.locked = false;
        self.locked_by_run_id = None;
        self.locked_at = None;
        self.lock_expires_at = None;
    }

    /// Human-readable attribute listing used in prompts
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("Business name: {}", self.business_name)];
        for (key, value) in &self.attributes {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            lines.push(format!("{}: {}", key, rendered));
        }
        lines.push(format!("Lead score: {}", self.lead_score));
        lines.join("\n")
    }
}

/// Status of a lead in the prospecting funnel
///
/// Values written by upstream tools that this crate does not know are kept
/// in [`LeadStatus::Other`] so a whole-collection write never rewrites them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LeadStatus {
    #[default]
    Cold,
    Analyzed,
    Outreached,
    Converted,
    Won,
    Queued,
    /// Held by a running pipeline
    Processing,
    Other(String),
}

impl LeadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cold => "cold",
            Self::Analyzed => "analyzed",
            Self::Outreached => "outreached",
            Self::Converted => "converted",
            Self::Won => "won",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for LeadStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "cold" => Self::Cold,
            "analyzed" => Self::Analyzed,
            "outreached" => Self::Outreached,
            "converted" => Self::Converted,
            "won" => Self::Won,
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            _ => Self::Other(value),
        }
    }
}

impl From<LeadStatus> for String {
    fn from(status: LeadStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads an explicit `null` as the field's default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything else reads as missing.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_f64().filter(|m| m.is_finite())?;
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}
