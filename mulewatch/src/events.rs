// mulewatch/src/events.rs
//
// Shared domain types flowing through mulewatch: the wire-format stream
// record, the scored record returned to callers and broadcast to alert
// subscribers, and the closed rule-flag vocabulary the explainer is built
// from.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ── Stream record (queue payload) ─────────────────────────────────────────────

/// One payment request as it arrives on the stream. Unknown keys are
/// preserved in `extra` and ignored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id:           String,
    pub sender_id:       String,
    pub receiver_id:     String,
    pub amount:          f64,
    pub timestamp:       DateTime<Utc>,
    #[serde(default)]
    pub device_hash:     Option<String>,
    #[serde(default)]
    pub device_os:       Option<String>,
    #[serde(default)]
    pub ip_address:      Option<String>,
    #[serde(default)]
    pub sender_lat:      Option<f64>,
    #[serde(default)]
    pub sender_lon:      Option<f64>,
    #[serde(default)]
    pub channel:         Option<String>,
    #[serde(default)]
    pub credential_type: CredentialKind,
    #[serde(default)]
    pub upi_id_sender:   Option<String>,
    #[serde(default)]
    pub upi_id_receiver: Option<String>,
    #[serde(flatten)]
    pub extra:           HashMap<String, serde_json::Value>,
}

impl TxRecord {
    /// Structural validation before ingest. Failures are poison-message
    /// rejects, not retries.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tx_id.is_empty() {
            return Err(EngineError::InvalidInput("empty tx_id".into()));
        }
        if self.sender_id.is_empty() || self.receiver_id.is_empty() {
            return Err(EngineError::InvalidInput("empty sender_id or receiver_id".into()));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(EngineError::InvalidInput(format!("bad amount {}", self.amount)));
        }
        if let (Some(lat), Some(lon)) = (self.sender_lat, self.sender_lon) {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(EngineError::InvalidInput(format!("bad coordinates {lat},{lon}")));
            }
        }
        Ok(())
    }

    /// Device capability mask as a bitstring, if the gateway supplied one
    /// (carried in the open `extra` map as `device_caps`).
    pub fn device_caps(&self) -> Option<&str> {
        self.extra.get("device_caps").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CredentialKind {
    Mpin,
    Otp,
    Biometric,
    Netbanking,
    #[default]
    #[serde(other)]
    Unknown,
}

// ── Risk levels and extractor identities ──────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel { Low, Medium, High }

impl RiskLevel {
    /// Level is a pure function of the fused score and the two thresholds.
    pub fn from_score(score: f64, high: f64, medium: f64) -> Self {
        if score >= high { Self::High }
        else if score >= medium { Self::Medium }
        else { Self::Low }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low    => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High   => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
    Behavioral,
    GraphIntel,
    Device,
    DormantAccount,
    Velocity,
}

impl std::fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Behavioral     => write!(f, "behavioral"),
            Self::GraphIntel     => write!(f, "graph"),
            Self::Device         => write!(f, "device"),
            Self::DormantAccount => write!(f, "dead_account"),
            Self::Velocity       => write!(f, "velocity"),
        }
    }
}

// ── Rule flags ────────────────────────────────────────────────────────────────
// Closed vocabulary. Every predicate that can fire during scoring is one
// variant; the explanation string is assembled exclusively from these, so
// re-running scoring on the same inputs reproduces the identical text.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleFlag {
    // behavioural
    AmountDeviation,
    BurstActivity,
    ImpossibleTravel,
    NightTransaction,
    AmountOutlier,
    ThreeSigmaSpike,
    DormantBurst,
    RiskyAsn,
    EndpointRotation,
    FixedAmountRepeat,
    CircadianAnomaly,
    CircadianNewDevice,
    IdenticalStructuring,
    // graph intelligence
    HighRiskCommunity,
    HighRiskPeers,
    BetweennessHub,
    PageRankHub,
    FanOutPattern,
    FanInPattern,
    TightRing,
    RiskyNeighbours,
    // device
    SharedDevice,
    RiskyDevice,
    DeviceUserBurst,
    DeviceDrift,
    NewDeviceHighValue,
    FirstSeenDevice,
    HighRiskDeviceUser,
    UncommonOs,
    // dormancy
    DormantReactivation,
    VolumeSpike,
    FirstStrike,
    SleepAndFlash,
    ThinHistory,
    // velocity
    VelocityBurst,
    PassThrough,
    SingleTxDominance,
}

impl RuleFlag {
    /// Stable machine label — the `flags` array entry of the scored record.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AmountDeviation      => "amount_deviation",
            Self::BurstActivity        => "burst_activity",
            Self::ImpossibleTravel     => "impossible_travel",
            Self::NightTransaction     => "night_transaction",
            Self::AmountOutlier        => "amount_outlier",
            Self::ThreeSigmaSpike      => "three_sigma_spike",
            Self::DormantBurst         => "dormant_burst",
            Self::RiskyAsn             => "risky_asn",
            Self::EndpointRotation     => "endpoint_rotation",
            Self::FixedAmountRepeat    => "fixed_amount_repeat",
            Self::CircadianAnomaly     => "circadian_anomaly",
            Self::CircadianNewDevice   => "circadian_new_device",
            Self::IdenticalStructuring => "identical_structuring",
            Self::HighRiskCommunity    => "high_risk_community",
            Self::HighRiskPeers        => "high_risk_peers",
            Self::BetweennessHub       => "betweenness_hub",
            Self::PageRankHub          => "pagerank_hub",
            Self::FanOutPattern        => "fan_out",
            Self::FanInPattern         => "fan_in",
            Self::TightRing            => "tight_ring",
            Self::RiskyNeighbours      => "risky_neighbours",
            Self::SharedDevice         => "shared_device",
            Self::RiskyDevice          => "risky_device",
            Self::DeviceUserBurst      => "device_user_burst",
            Self::DeviceDrift          => "device_drift",
            Self::NewDeviceHighValue   => "new_device_high_value",
            Self::FirstSeenDevice      => "first_seen_device",
            Self::HighRiskDeviceUser   => "high_risk_device_user",
            Self::UncommonOs           => "uncommon_os",
            Self::DormantReactivation  => "dormant_reactivation",
            Self::VolumeSpike          => "volume_spike",
            Self::FirstStrike          => "first_strike",
            Self::SleepAndFlash        => "sleep_and_flash",
            Self::ThinHistory          => "thin_history",
            Self::VelocityBurst        => "velocity_burst",
            Self::PassThrough          => "pass_through",
            Self::SingleTxDominance    => "single_tx_dominance",
        }
    }

    /// Stable human clause — one fragment of the `reason` string.
    pub fn clause(&self) -> &'static str {
        match self {
            Self::AmountDeviation      => "amount deviates sharply from the sender's recent profile",
            Self::BurstActivity        => "burst of activity inside the velocity window",
            Self::ImpossibleTravel     => "impossible travel speed between consecutive locations",
            Self::NightTransaction     => "transaction in the local night window",
            Self::AmountOutlier        => "amount is an interquartile-range outlier for this sender",
            Self::ThreeSigmaSpike      => "amount exceeds three standard deviations above the profile mean",
            Self::DormantBurst         => "dormant account moving more than its historical mean",
            Self::RiskyAsn             => "originating network is classified as high risk",
            Self::EndpointRotation     => "rapid rotation of network endpoints over the last day",
            Self::FixedAmountRepeat    => "repeated fixed-amount transfers",
            Self::CircadianAnomaly     => "transaction hour is rare for this sender",
            Self::CircadianNewDevice   => "rare-hour transaction issued from a first-seen device",
            Self::IdenticalStructuring => "repeated near-identical amounts to the same receiver within the hour",
            Self::HighRiskCommunity    => "member of a community with elevated mean risk",
            Self::HighRiskPeers        => "shares a community with multiple high-risk accounts",
            Self::BetweennessHub       => "sits on unusually many shortest transfer paths",
            Self::PageRankHub          => "unusually high influence in the transfer graph",
            Self::FanOutPattern        => "fan-out distribution pattern to many receivers",
            Self::FanInPattern         => "fan-in collection pattern from many senders",
            Self::TightRing            => "dense ring of mutual transfers around the sender",
            Self::RiskyNeighbours      => "elevated risk among direct counterparties",
            Self::SharedDevice         => "device is shared across multiple accounts",
            Self::RiskyDevice          => "device carries elevated derived risk",
            Self::DeviceUserBurst      => "many distinct accounts used this device within a day",
            Self::DeviceDrift          => "device characteristics drifted since last seen",
            Self::NewDeviceHighValue   => "high-value MPIN transaction from a first-seen device",
            Self::FirstSeenDevice      => "first transaction from this device for the sender",
            Self::HighRiskDeviceUser   => "device is also used by a high-risk account",
            Self::UncommonOs           => "device reports an uncommon operating system",
            Self::DormantReactivation  => "account reactivated after an extended dormancy",
            Self::VolumeSpike          => "transfer volume spikes against the stored profile",
            Self::FirstStrike          => "first transaction after a dormant period",
            Self::SleepAndFlash        => "long sleep followed by an outsized transfer",
            Self::ThinHistory          => "account has almost no transaction history",
            Self::VelocityBurst        => "sustained burst of transfers",
            Self::PassThrough          => "funds pass straight through the account",
            Self::SingleTxDominance    => "a single transfer dominates lifetime outflow",
        }
    }
}

// ── Extractor output ──────────────────────────────────────────────────────────

/// One extractor's contribution: a score in [0,100] plus the rule flags
/// that fired while computing it. Flags are the only channel into the
/// explainer; extractors never write prose.
#[derive(Debug, Clone)]
pub struct FeatureScore {
    pub kind:  ExtractorKind,
    pub score: f64,
    pub flags: Vec<RuleFlag>,
}

impl FeatureScore {
    pub fn new(kind: ExtractorKind) -> Self {
        Self { kind, score: 0.0, flags: Vec::new() }
    }

    pub fn add(&mut self, points: f64, flag: RuleFlag) {
        self.score += points;
        self.flags.push(flag);
    }

    pub fn clip(mut self) -> Self {
        self.score = self.score.clamp(0.0, 100.0);
        self
    }
}

/// Per-extractor breakdown as serialized on the scored record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub graph:        f64,
    pub behavioral:   f64,
    pub device:       f64,
    pub dead_account: f64,
    pub velocity:     f64,
}

// ── Mule verdict ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuleVerdict {
    pub is_mule:    bool,
    pub confidence: f64,
    pub reasons:    Vec<String>,
}

// ── Scored record ─────────────────────────────────────────────────────────────

/// The fused result for one transaction. Returned by `POST /transaction`
/// and broadcast over `/ws/alerts` for records at or above the medium
/// threshold. Consumers ignore keys they do not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub tx_id:              String,
    pub risk_score:         f64,
    pub risk_level:         RiskLevel,
    pub breakdown:          ScoreBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id:         Option<i64>,
    pub flags:              Vec<String>,
    pub reason:             String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_mule:            Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mule_confidence:    Option<f64>,
    pub processing_time_ms: f64,
    pub timestamp:          DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_json() -> &'static str {
        r#"{
            "tx_id": "T1", "sender_id": "A", "receiver_id": "B",
            "amount": 499.5, "timestamp": "2026-03-01T09:30:00Z",
            "device_hash": "d1", "device_os": "Android 14",
            "ip_address": "49.37.10.20", "channel": "UPI",
            "credential_type": "MPIN",
            "gateway_shard": 7, "device_caps": "1011"
        }"#
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let rec: TxRecord = serde_json::from_str(record_json()).unwrap();
        assert_eq!(rec.credential_type, CredentialKind::Mpin);
        assert_eq!(rec.extra.get("gateway_shard"), Some(&serde_json::json!(7)));
        assert_eq!(rec.device_caps(), Some("1011"));

        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back.get("gateway_shard"), Some(&serde_json::json!(7)));
    }

    #[test]
    fn unknown_credential_kinds_do_not_fail_parsing() {
        let json = record_json().replace("MPIN", "PASSKEY");
        let rec: TxRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec.credential_type, CredentialKind::Unknown);
    }

    #[test]
    fn validation_rejects_malformed_records() {
        let mut rec: TxRecord = serde_json::from_str(record_json()).unwrap();
        assert!(rec.validate().is_ok());

        rec.amount = -5.0;
        assert!(rec.validate().is_err());
        rec.amount = f64::NAN;
        assert!(rec.validate().is_err());
        rec.amount = 0.0;
        assert!(rec.validate().is_ok()); // zero amount is a boundary case, not a reject

        rec.sender_lat = Some(91.0);
        rec.sender_lon = Some(0.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn level_mapping_is_a_pure_function_of_score() {
        assert_eq!(RiskLevel::from_score(70.0, 70.0, 40.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(69.99, 70.0, 40.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(40.0, 70.0, 40.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(39.99, 70.0, 40.0), RiskLevel::Low);
        assert_eq!(RiskLevel::High.to_string(), "HIGH");
    }

    #[test]
    fn risk_level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RiskLevel::Medium).unwrap(), "\"MEDIUM\"");
    }
}
