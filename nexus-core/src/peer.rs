//! Peer records, the peer directory and the merge engine
//!
//! A [`PeerDirectory`] holds at most one [`PeerRecord`] per `node_id`.
//! Directories are reconciled with [`merge`], which keeps the record with
//! the newer `last_seen` timestamp (last-writer-wins on the whole record).
//!
//! Records are not authenticated: any peer can overwrite the stored copy of
//! any `node_id` by presenting a newer timestamp.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel stored in `ipv6` when the node has no distinct IPv6 address
pub const IPV6_NONE: &str = "none";

/// Window used by [`PeerDirectory::active_peer_count`]
pub const ACTIVE_WINDOW_MINUTES: i64 = 60;

/// Role a node advertises in its own record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Default,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Default => write!(f, "default"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Role::Default),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One known node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable opaque identity (hex-encoded hash)
    pub node_id: String,
    #[serde(default)]
    pub role: Role,
    /// Dotted-quad address, empty when unknown
    #[serde(default)]
    pub ipv4: String,
    /// IPv6 literal or [`IPV6_NONE`]
    #[serde(default = "default_ipv6")]
    pub ipv6: String,
    pub port: u16,
    /// RFC3339 UTC timestamp, kept verbatim so unparsable values survive
    #[serde(default)]
    pub last_seen: String,
}

fn default_ipv6() -> String {
    IPV6_NONE.to_string()
}

impl PeerRecord {
    /// Parsed `last_seen`, `None` when the stored string is not RFC3339
    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_seen)
    }

    /// True when `last_seen` is older than `threshold` relative to `now`.
    /// Unparsable timestamps count as infinitely old.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_seen_at() {
            Some(seen) => now - seen > threshold,
            None => true,
        }
    }

    /// Set `last_seen` to `now`
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = format_timestamp(now);
    }

    /// True if `self` should replace `other` during a merge
    fn is_newer_than(&self, other: &PeerRecord) -> bool {
        // None orders before Some, so unparsable never wins
        self.last_seen_at() > other.last_seen_at()
    }
}

/// Parse an RFC3339 timestamp into UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Format a timestamp the way records carry it on disk and on the wire
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Set of peer records keyed by `node_id`
///
/// Serialized as a plain sequence of records in ascending `node_id` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<PeerRecord>", into = "Vec<PeerRecord>")]
pub struct PeerDirectory {
    records: BTreeMap<String, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from a sequence that may repeat a `node_id`.
    /// Repeats collapse with the same rule as [`merge`].
    pub fn from_records<I: IntoIterator<Item = PeerRecord>>(records: I) -> Self {
        let mut dir = Self::new();
        for record in records {
            dir.absorb(record);
        }
        dir
    }

    /// Insert or replace by `node_id`, regardless of timestamps
    pub fn upsert(&mut self, record: PeerRecord) -> Option<PeerRecord> {
        self.records.insert(record.node_id.clone(), record)
    }

    pub fn remove(&mut self, node_id: &str) -> Option<PeerRecord> {
        self.records.remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerRecord> {
        self.records.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut PeerRecord> {
        self.records.get_mut(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.records.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<PeerRecord> {
        self.records.into_values().collect()
    }

    /// Number of peers, other than `self_id`, seen within the last 60 minutes
    ///
    /// The local node's own record is always excluded so the count reflects
    /// remote peers only.
    pub fn active_peer_count(&self, self_id: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(ACTIVE_WINDOW_MINUTES);
        self.iter()
            .filter(|p| p.node_id != self_id)
            .filter(|p| p.last_seen_at().is_some_and(|seen| seen > cutoff))
            .count()
    }

    /// Keep `record` unless an existing copy is at least as fresh
    fn absorb(&mut self, record: PeerRecord) {
        match self.records.get(&record.node_id) {
            Some(existing) if !record.is_newer_than(existing) => {}
            _ => {
                self.records.insert(record.node_id.clone(), record);
            }
        }
    }
}

impl From<Vec<PeerRecord>> for PeerDirectory {
    fn from(records: Vec<PeerRecord>) -> Self {
        Self::from_records(records)
    }
}

impl From<PeerDirectory> for Vec<PeerRecord> {
    fn from(dir: PeerDirectory) -> Self {
        dir.into_vec()
    }
}

impl FromIterator<PeerRecord> for PeerDirectory {
    fn from_iter<I: IntoIterator<Item = PeerRecord>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}

/// Reconcile two directories
///
/// The result holds every `node_id` from either side. When both sides know a
/// node, the record with the strictly newer `last_seen` wins; on a tie, or when
/// the incoming timestamp does not parse, the local copy is kept.
pub fn merge(local: &PeerDirectory, incoming: &PeerDirectory) -> PeerDirectory {
    let mut merged = local.clone();
    for record in incoming.iter() {
        merged.absorb(record.clone());
    }
    merged
}
