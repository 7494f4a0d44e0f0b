//! Row types persisted by the relational adapters.
//!
//! These are storage-level shapes: encrypted payloads and tokens are carried
//! as the serialized envelope string produced by `vaultline-core`, never as
//! plaintext. The enums are closed sets so every consumer matches them
//! exhaustively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on `sample_count` for a vault row.
pub const SAMPLE_COUNT_CAP: i32 = 50_000;

/// What a vault row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Typical discount observed for a merchant (fraction in `[0, 1]`).
    Pattern,
    /// Average monthly price after a successful negotiation.
    NegotiationSuccess,
    /// Encrypted, context-bound advice; the aggregate tracks monthly savings.
    Advice,
}

impl RecordKind {
    /// Valid domain of the aggregate for rows of this kind.
    #[must_use]
    pub const fn domain(self) -> AggregateDomain {
        match self {
            Self::Pattern => AggregateDomain::Fraction,
            Self::NegotiationSuccess | Self::Advice => AggregateDomain::Monetary,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::NegotiationSuccess => "negotiation_success",
            Self::Advice => "advice",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pattern" => Ok(Self::Pattern),
            "negotiation_success" => Ok(Self::NegotiationSuccess),
            "advice" => Ok(Self::Advice),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// Spending category a vault row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Insurance,
    Phone,
    Utilities,
    Internet,
    Subscription,
    Other,
}

impl Category {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insurance => "insurance",
            Self::Phone => "phone",
            Self::Utilities => "utilities",
            Self::Internet => "internet",
            Self::Subscription => "subscription",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "insurance" => Ok(Self::Insurance),
            "phone" => Ok(Self::Phone),
            "utilities" => Ok(Self::Utilities),
            "internet" => Ok(Self::Internet),
            "subscription" => Ok(Self::Subscription),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Who produced a vault row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// Written by automated analysis.
    Engine,
    /// Curated by an operator. Sticky: automated merges never demote it.
    Manual,
}

impl RecordSource {
    /// The source a row ends up with after merging an `incoming` observation.
    #[must_use]
    pub const fn merge(self, incoming: Self) -> Self {
        match self {
            Self::Manual => Self::Manual,
            Self::Engine => incoming,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "engine" => Ok(Self::Engine),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown record source: {other}")),
        }
    }
}

/// Valid range of a row's aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateDomain {
    /// A bounded fraction in `[0, 1]`, e.g. a typical discount.
    Fraction,
    /// A non-negative monetary average.
    Monetary,
}

impl AggregateDomain {
    /// Inclusive lower and upper bound.
    #[must_use]
    pub const fn bounds(self) -> (f64, f64) {
        match self {
            Self::Fraction => (0.0, 1.0),
            Self::Monetary => (0.0, f64::MAX),
        }
    }

    /// Clamp `value` into the domain. Non-finite input clamps to zero.
    #[must_use]
    pub fn clamp(self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let (lo, hi) = self.bounds();
        value.clamp(lo, hi)
    }
}

/// A single observation to merge into the vault.
///
/// `merchant_key` must already be normalized and non-empty; `value` must
/// already be clamped to `kind.domain()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub kind: RecordKind,
    pub category: Category,
    pub merchant: String,
    pub merchant_key: String,
    pub value: f64,
    pub source: RecordSource,
    pub notes: Option<String>,
    /// Serialized encrypted envelope, replacing the stored one when present.
    pub encrypted_payload: Option<String>,
}

/// A persisted vault row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultRow {
    pub id: Uuid,
    pub kind: RecordKind,
    pub category: Category,
    pub merchant: String,
    pub merchant_key: String,
    pub sample_count: i32,
    pub aggregate: f64,
    pub source: RecordSource,
    pub active: bool,
    pub notes: Option<String>,
    pub encrypted_payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl VaultRow {
    /// A fresh row for the first observation of a natural key.
    #[must_use]
    pub fn first(obs: &Observation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: obs.kind,
            category: obs.category,
            merchant: obs.merchant.clone(),
            merchant_key: obs.merchant_key.clone(),
            sample_count: 1,
            aggregate: obs.kind.domain().clamp(obs.value),
            source: obs.source,
            active: true,
            notes: obs.notes.clone(),
            encrypted_payload: obs.encrypted_payload.clone(),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
        }
    }

    /// Fold `obs` into this row with a sample-count-weighted running average.
    ///
    /// Mirrors the SQL merge expression in the PostgreSQL backend; both must
    /// stay in lockstep.
    pub fn absorb(&mut self, obs: &Observation, now: DateTime<Utc>) {
        let old_count = self.sample_count.max(1);
        let weighted = self.aggregate * f64::from(old_count) + obs.value;
        let next = weighted / (f64::from(old_count) + 1.0);

        self.merchant.clone_from(&obs.merchant);
        self.aggregate = self.kind.domain().clamp(next);
        self.sample_count = old_count.saturating_add(1).min(SAMPLE_COUNT_CAP);
        self.source = self.source.merge(obs.source);
        self.active = true;
        if obs.notes.is_some() {
            self.notes.clone_from(&obs.notes);
        }
        if obs.encrypted_payload.is_some() {
            self.encrypted_payload.clone_from(&obs.encrypted_payload);
        }
        self.updated_at = now;
        self.last_seen_at = now;
    }

    /// The `(kind, category, merchant_key)` natural key.
    #[must_use]
    pub fn natural_key(&self) -> (RecordKind, Category, &str) {
        (self.kind, self.category, &self.merchant_key)
    }
}

/// A persisted credential row. `item_id` is the merge key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres-backend", derive(sqlx::FromRow))]
pub struct TokenRow {
    pub item_id: String,
    pub owner_id: Option<String>,
    /// Serialized encrypted envelope.
    pub encrypted_access_token: String,
    pub updated_at: DateTime<Utc>,
}
