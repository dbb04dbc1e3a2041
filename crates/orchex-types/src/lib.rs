//! Orchex Types - Domain Types for the Intent Execution Core
//!
//! This crate defines the core types shared by every Orchex component:
//! - Time-sortable event identifiers and correlation ids
//! - The immutable event envelope and the fixed topic registry
//! - Intent, plan, and execution payloads
//! - Materialized read models for low-latency queries
//!
//! # Architecture
//!
//! Every behavior in Orchex is expressed as a domain event. An event is an
//! [`EventEnvelope`] carrying a topic-keyed [`EventPayload`]; all envelopes
//! for one intent share a [`CorrelationId`] and carry a per-correlation
//! sequence number assigned by the producer (or by the coordinator on
//! ingest when the producer does not know it).
//!
//! # Example
//!
//! ```ignore
//! use orchex_types::{EventEnvelope, EventPayload, Topic, CorrelationId, EventId};
//!
//! let intent_id = EventId::new();
//! let correlation = CorrelationId::for_intent(&intent_id);
//! let envelope = EventEnvelope::make(
//!     Topic::IntentSubmitted,
//!     EventPayload::IntentSubmitted(intent),
//!     correlation,
//!     None,
//!     Some(1),
//! )?;
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

// ============================================================================
// ID Types
// ============================================================================

/// 128-bit time-sortable event identifier.
///
/// Lexicographic order of the string form equals creation order
/// (millisecond prefix, random suffix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Millisecond timestamp encoded in the id prefix.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

/// Correlation identifier shared by all envelopes of one intent.
///
/// Always of the form `intent-<event_id>` where the event id is the id of
/// the root `intent.submitted` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn for_intent(intent_id: &EventId) -> Self {
        Self(format!("intent-{}", intent_id))
    }

    /// The event id of the root `intent.submitted` envelope, when parseable.
    pub fn root_intent_id(&self) -> Option<EventId> {
        self.0
            .strip_prefix("intent-")
            .and_then(|s| EventId::from_str(s).ok())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Venue identifier (e.g. "uniswap_v3")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(pub String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn uniswap_v3() -> Self {
        Self("uniswap_v3".to_string())
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Topic Registry
// ============================================================================

/// The fixed set of domain topics.
///
/// Producers may only publish topics from this registry; [`Topic::Unknown`]
/// exists so envelopes written by a newer writer can be stored verbatim and
/// skipped by the projector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    IntentSubmitted,
    IntentAccepted,
    IntentFailed,
    RiskApproved,
    RiskRejected,
    PlanCreated,
    PlanRejected,
    ExecStarted,
    ExecStepSubmitted,
    ExecStepFilled,
    ExecCompleted,
    ExecFailed,
    /// A topic outside the registry (forward compatibility).
    Unknown(String),
}

/// All registry topics, in lifecycle order.
pub const TOPIC_REGISTRY: [Topic; 12] = [
    Topic::IntentSubmitted,
    Topic::IntentAccepted,
    Topic::IntentFailed,
    Topic::RiskApproved,
    Topic::RiskRejected,
    Topic::PlanCreated,
    Topic::PlanRejected,
    Topic::ExecStarted,
    Topic::ExecStepSubmitted,
    Topic::ExecStepFilled,
    Topic::ExecCompleted,
    Topic::ExecFailed,
];

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::IntentSubmitted => "intent.submitted",
            Topic::IntentAccepted => "intent.accepted",
            Topic::IntentFailed => "intent.failed",
            Topic::RiskApproved => "risk.approved",
            Topic::RiskRejected => "risk.rejected",
            Topic::PlanCreated => "plan.created",
            Topic::PlanRejected => "plan.rejected",
            Topic::ExecStarted => "exec.started",
            Topic::ExecStepSubmitted => "exec.step_submitted",
            Topic::ExecStepFilled => "exec.step_filled",
            Topic::ExecCompleted => "exec.completed",
            Topic::ExecFailed => "exec.failed",
            Topic::Unknown(s) => s,
        }
    }

    /// Parse a dotted topic string. Unrecognized topics parse as
    /// [`Topic::Unknown`]; producers cannot publish them.
    pub fn parse(s: &str) -> Self {
        match s {
            "intent.submitted" => Topic::IntentSubmitted,
            "intent.accepted" => Topic::IntentAccepted,
            "intent.failed" => Topic::IntentFailed,
            "risk.approved" => Topic::RiskApproved,
            "risk.rejected" => Topic::RiskRejected,
            "plan.created" => Topic::PlanCreated,
            "plan.rejected" => Topic::PlanRejected,
            "exec.started" => Topic::ExecStarted,
            "exec.step_submitted" => Topic::ExecStepSubmitted,
            "exec.step_filled" => Topic::ExecStepFilled,
            "exec.completed" => Topic::ExecCompleted,
            "exec.failed" => Topic::ExecFailed,
            other => Topic::Unknown(other.to_string()),
        }
    }

    /// Whether this topic is in the fixed registry.
    pub fn is_registered(&self) -> bool {
        !matches!(self, Topic::Unknown(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Topic::parse(&s))
    }
}

/// Subscription pattern: an exact topic or a dotted prefix with a trailing
/// `*` wildcard (e.g. `intent.*`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    Exact(Topic),
    Prefix(String),
}

impl TopicPattern {
    /// Parse a pattern string. Fails on malformed wildcards and, for exact
    /// patterns, on topics outside the registry.
    pub fn parse(s: &str) -> Result<Self, EnvelopeError> {
        if let Some(prefix) = s.strip_suffix(".*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(EnvelopeError::InvalidPattern(s.to_string()));
            }
            return Ok(TopicPattern::Prefix(format!("{}.", prefix)));
        }
        if s.contains('*') {
            return Err(EnvelopeError::InvalidPattern(s.to_string()));
        }
        match Topic::parse(s) {
            Topic::Unknown(_) => Err(EnvelopeError::InvalidTopic(s.to_string())),
            topic => Ok(TopicPattern::Exact(topic)),
        }
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            TopicPattern::Exact(t) => t == topic,
            TopicPattern::Prefix(prefix) => topic.as_str().starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(t) => write!(f, "{}", t),
            TopicPattern::Prefix(p) => write!(f, "{}*", p),
        }
    }
}

// ============================================================================
// Failure Reasons
// ============================================================================

/// Machine-readable failure reasons surfaced in events and read models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    NotionalLimit,
    SlippageLimit,
    WindowOutOfRange,
    UnsupportedVenue,
    NoRoute,
    RouteTimeout,
    RouteInternal,
    Reverted,
    DeadlineExceeded,
    MaxAttemptsExceeded,
    AcceptPublishFailed,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::NotionalLimit => "NOTIONAL_LIMIT",
            Reason::SlippageLimit => "SLIPPAGE_LIMIT",
            Reason::WindowOutOfRange => "WINDOW_OUT_OF_RANGE",
            Reason::UnsupportedVenue => "UNSUPPORTED_VENUE",
            Reason::NoRoute => "NO_ROUTE",
            Reason::RouteTimeout => "ROUTE_TIMEOUT",
            Reason::RouteInternal => "ROUTE_INTERNAL",
            Reason::Reverted => "REVERTED",
            Reason::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Reason::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            Reason::AcceptPublishFailed => "ACCEPT_PUBLISH_FAILED",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Intent
// ============================================================================

/// A tradeable asset reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Ticker symbol (e.g. "WETH")
    pub symbol: String,
    /// Chain the token lives on
    pub chain_id: u64,
    /// Token contract address
    pub address: String,
    /// Token decimals
    pub decimals: u8,
}

impl Asset {
    pub fn new(symbol: impl Into<String>, chain_id: u64, address: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            chain_id,
            address: address.into(),
            decimals,
        }
    }
}

/// Direction of the trading goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    /// Buy the target asset with the quote asset
    Acquire,
    /// Sell the target asset into the quote asset
    Dispose,
}

/// How aggressively the plan should cross the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStyle {
    Aggressive,
    Passive,
    Adaptive,
}

/// Client-declared execution constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum tolerated slippage, exclusive (0, 1)
    pub max_slippage: Decimal,
    /// Execution window in milliseconds
    pub time_window_ms: u64,
    /// Execution style
    pub execution_style: ExecutionStyle,
    /// Optional venue allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_venues: Option<Vec<VenueId>>,
}

/// Upper bound on `amount_in`. Submissions beyond this are malformed, not a
/// risk-policy question.
pub const MAX_AMOUNT_IN: Decimal = dec!(1_000_000_000_000);

/// A declarative trading goal, the payload of `intent.submitted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Same value as the envelope event id
    pub intent_id: EventId,
    pub intent_type: IntentType,
    /// Ordered pair `[target, quote]`
    pub assets: [Asset; 2],
    /// Amount in quote units (acquire) or target units (dispose)
    pub amount_in: Decimal,
    pub constraints: Constraints,
}

impl Intent {
    pub fn target(&self) -> &Asset {
        &self.assets[0]
    }

    pub fn quote(&self) -> &Asset {
        &self.assets[1]
    }

    /// The asset being spent and the asset being received.
    pub fn direction(&self) -> (&Asset, &Asset) {
        match self.intent_type {
            IntentType::Acquire => (self.quote(), self.target()),
            IntentType::Dispose => (self.target(), self.quote()),
        }
    }

    /// Validate schema-level constraint bounds. Violations are surfaced
    /// synchronously to the submitter; no events are emitted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount_in <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(self.amount_in));
        }
        if self.amount_in > MAX_AMOUNT_IN {
            return Err(ValidationError::AmountOutOfBounds {
                max: MAX_AMOUNT_IN,
                got: self.amount_in,
            });
        }
        let slippage = self.constraints.max_slippage;
        if slippage <= Decimal::ZERO || slippage >= Decimal::ONE {
            return Err(ValidationError::SlippageOutOfRange(slippage));
        }
        if self.constraints.time_window_ms == 0 {
            return Err(ValidationError::NonPositiveWindow);
        }
        if self.assets[0].symbol == self.assets[1].symbol
            && self.assets[0].address == self.assets[1].address
        {
            return Err(ValidationError::IdenticalAssets(self.assets[0].symbol.clone()));
        }
        if self.assets[0].chain_id != self.assets[1].chain_id {
            return Err(ValidationError::ChainMismatch {
                target: self.assets[0].chain_id,
                quote: self.assets[1].chain_id,
            });
        }
        if let Some(venues) = &self.constraints.allowed_venues {
            if venues.is_empty() {
                return Err(ValidationError::EmptyVenueList);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Execution Plan
// ============================================================================

/// One concrete swap step inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub venue: VenueId,
    pub base: Asset,
    pub quote: Asset,
    pub amount_in: Decimal,
    /// Floor of the quoted output after slippage allowance
    pub min_out: Decimal,
    pub recipient: String,
}

/// Concrete single-step execution derived from an intent, the payload of
/// `plan.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Same value as the envelope event id
    pub plan_id: EventId,
    pub intent_id: EventId,
    pub steps: Vec<PlanStep>,
    pub estimated_cost: Decimal,
    pub estimated_duration_ms: u64,
}

// ============================================================================
// Event Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskApproved {
    pub intent_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRejected {
    pub intent_id: EventId,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAccepted {
    pub intent_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentFailed {
    pub intent_id: EventId,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRejected {
    pub intent_id: EventId,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecStarted {
    pub plan_id: EventId,
    pub intent_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecStepSubmitted {
    pub plan_id: EventId,
    pub step: u32,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecStepFilled {
    pub plan_id: EventId,
    pub step: u32,
    pub tx_hash: TxHash,
    pub amount_out: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecCompleted {
    pub plan_id: EventId,
    pub tx_hash: TxHash,
    pub amount_out: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecFailed {
    pub plan_id: Option<EventId>,
    pub reason: Reason,
}

/// Topic-keyed payload union. The envelope topic selects the variant; the
/// payload JSON carries no tag of its own.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    IntentSubmitted(Intent),
    RiskApproved(RiskApproved),
    RiskRejected(RiskRejected),
    IntentAccepted(IntentAccepted),
    IntentFailed(IntentFailed),
    PlanCreated(ExecutionPlan),
    PlanRejected(PlanRejected),
    ExecStarted(ExecStarted),
    ExecStepSubmitted(ExecStepSubmitted),
    ExecStepFilled(ExecStepFilled),
    ExecCompleted(ExecCompleted),
    ExecFailed(ExecFailed),
    /// Payload of a topic outside the registry, stored verbatim.
    Unknown(serde_json::Value),
}

impl EventPayload {
    /// The registry topic this payload belongs to, if any.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            EventPayload::IntentSubmitted(_) => Some(Topic::IntentSubmitted),
            EventPayload::RiskApproved(_) => Some(Topic::RiskApproved),
            EventPayload::RiskRejected(_) => Some(Topic::RiskRejected),
            EventPayload::IntentAccepted(_) => Some(Topic::IntentAccepted),
            EventPayload::IntentFailed(_) => Some(Topic::IntentFailed),
            EventPayload::PlanCreated(_) => Some(Topic::PlanCreated),
            EventPayload::PlanRejected(_) => Some(Topic::PlanRejected),
            EventPayload::ExecStarted(_) => Some(Topic::ExecStarted),
            EventPayload::ExecStepSubmitted(_) => Some(Topic::ExecStepSubmitted),
            EventPayload::ExecStepFilled(_) => Some(Topic::ExecStepFilled),
            EventPayload::ExecCompleted(_) => Some(Topic::ExecCompleted),
            EventPayload::ExecFailed(_) => Some(Topic::ExecFailed),
            EventPayload::Unknown(_) => None,
        }
    }

    /// Serialize to the topic-specific JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        // Serialization of plain data types cannot fail.
        match self {
            EventPayload::IntentSubmitted(p) => serde_json::to_value(p),
            EventPayload::RiskApproved(p) => serde_json::to_value(p),
            EventPayload::RiskRejected(p) => serde_json::to_value(p),
            EventPayload::IntentAccepted(p) => serde_json::to_value(p),
            EventPayload::IntentFailed(p) => serde_json::to_value(p),
            EventPayload::PlanCreated(p) => serde_json::to_value(p),
            EventPayload::PlanRejected(p) => serde_json::to_value(p),
            EventPayload::ExecStarted(p) => serde_json::to_value(p),
            EventPayload::ExecStepSubmitted(p) => serde_json::to_value(p),
            EventPayload::ExecStepFilled(p) => serde_json::to_value(p),
            EventPayload::ExecCompleted(p) => serde_json::to_value(p),
            EventPayload::ExecFailed(p) => serde_json::to_value(p),
            EventPayload::Unknown(v) => Ok(v.clone()),
        }
        .unwrap_or(serde_json::Value::Null)
    }

    /// Deserialize a payload for a given topic. Unknown topics yield
    /// [`EventPayload::Unknown`]; registry topics whose value does not match
    /// the schema fail with [`EnvelopeError::PayloadSchemaMismatch`].
    pub fn from_topic_value(topic: &Topic, value: serde_json::Value) -> Result<Self, EnvelopeError> {
        let mismatch = |e: serde_json::Error| EnvelopeError::PayloadSchemaMismatch {
            topic: topic.as_str().to_string(),
            detail: e.to_string(),
        };
        Ok(match topic {
            Topic::IntentSubmitted => {
                EventPayload::IntentSubmitted(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::RiskApproved => {
                EventPayload::RiskApproved(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::RiskRejected => {
                EventPayload::RiskRejected(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::IntentAccepted => {
                EventPayload::IntentAccepted(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::IntentFailed => {
                EventPayload::IntentFailed(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::PlanCreated => {
                EventPayload::PlanCreated(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::PlanRejected => {
                EventPayload::PlanRejected(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::ExecStarted => {
                EventPayload::ExecStarted(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::ExecStepSubmitted => {
                EventPayload::ExecStepSubmitted(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::ExecStepFilled => {
                EventPayload::ExecStepFilled(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::ExecCompleted => {
                EventPayload::ExecCompleted(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::ExecFailed => {
                EventPayload::ExecFailed(serde_json::from_value(value).map_err(mismatch)?)
            }
            Topic::Unknown(_) => EventPayload::Unknown(value),
        })
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Immutable record carrying one domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub topic: Topic,
    pub correlation_id: CorrelationId,
    /// Event id of the cause; `None` only for the root `intent.submitted`.
    pub causation_id: Option<EventId>,
    /// Per-correlation sequence; assigned by the coordinator when missing.
    pub sequence: Option<u64>,
    pub payload: EventPayload,
    pub version: u32,
}

impl EventEnvelope {
    /// Mint an envelope for a registry topic, validating that the payload
    /// matches the topic's schema.
    pub fn make(
        topic: Topic,
        payload: EventPayload,
        correlation_id: CorrelationId,
        causation_id: Option<EventId>,
        sequence: Option<u64>,
    ) -> Result<Self, EnvelopeError> {
        if !topic.is_registered() {
            return Err(EnvelopeError::InvalidTopic(topic.as_str().to_string()));
        }
        match payload.topic() {
            Some(t) if t == topic => {}
            _ => {
                return Err(EnvelopeError::PayloadSchemaMismatch {
                    topic: topic.as_str().to_string(),
                    detail: "payload variant does not match topic".to_string(),
                })
            }
        }
        Ok(Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            topic,
            correlation_id,
            causation_id,
            sequence,
            payload,
            version: 1,
        })
    }
}

/// Wire form of the envelope (§6 JSON schema, camelCase keys).
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    event_id: EventId,
    timestamp: DateTime<Utc>,
    topic: Topic,
    correlation_id: CorrelationId,
    causation_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    payload: serde_json::Value,
    version: u32,
}

impl Serialize for EventEnvelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEnvelope {
            event_id: self.event_id,
            timestamp: self.timestamp,
            topic: self.topic.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id,
            sequence: self.sequence,
            payload: self.payload.to_value(),
            version: self.version,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventEnvelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        let payload = EventPayload::from_topic_value(&wire.topic, wire.payload)
            .map_err(serde::de::Error::custom)?;
        Ok(EventEnvelope {
            event_id: wire.event_id,
            timestamp: wire.timestamp,
            topic: wire.topic,
            correlation_id: wire.correlation_id,
            causation_id: wire.causation_id,
            sequence: wire.sequence,
            payload,
            version: wire.version,
        })
    }
}

// ============================================================================
// Read Models
// ============================================================================

/// Lifecycle state of an intent read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    Submitted,
    Accepted,
    Planned,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Completed | IntentState::Failed | IntentState::Rejected
        )
    }
}

/// Materialized projection of one intent's event prefix, keyed
/// `intent:{intent_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentReadModel {
    pub intent_id: EventId,
    pub correlation_id: CorrelationId,
    pub state: IntentState,
    pub last_event_id: EventId,
    pub last_sequence: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_plan_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<Decimal>,
}

/// Lifecycle state of a plan read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Failed,
}

/// Materialized projection of one plan, keyed `plan:{plan_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReadModel {
    pub plan_id: EventId,
    pub intent_id: EventId,
    pub status: PlanStatus,
    pub steps: Vec<PlanStep>,
    /// Completion ratio in [0, 1]
    pub progress: Decimal,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Envelope construction and decoding errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    #[error("topic not in registry: {0}")]
    InvalidTopic(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("payload does not match schema for {topic}: {detail}")]
    PayloadSchemaMismatch { topic: String, detail: String },
}

/// Intent schema violations, surfaced synchronously to the submitter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("amount_in must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("amount_in out of bounds: max {max}, got {got}")]
    AmountOutOfBounds { max: Decimal, got: Decimal },

    #[error("max_slippage must be in (0, 1), got {0}")]
    SlippageOutOfRange(Decimal),

    #[error("time_window_ms must be positive")]
    NonPositiveWindow,

    #[error("target and quote are the same asset: {0}")]
    IdenticalAssets(String),

    #[error("assets live on different chains: target {target}, quote {quote}")]
    ChainMismatch { target: u64, quote: u64 },

    #[error("allowed_venues must not be empty when present")]
    EmptyVenueList,
}

// ============================================================================
// Tests
// ============================================================================
