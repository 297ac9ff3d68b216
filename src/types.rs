//! Core data model: providers, devices, metrics, and canonical samples.
//!
//! A `CanonicalSample` is the normalized unit of truth. Its identity is a
//! typed `SampleKey` of (patient id, metric type, bucket), which is what makes
//! repeated delivery of the same underlying event an idempotent overwrite.

use crate::error::IngestError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Integration model a provider uses to deliver data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Provider delivers signed webhooks to us.
    Push,
    /// We pull from the provider's API with a delegated OAuth token.
    Pull,
}

/// Fixed enumeration of supported wearable ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    AppleWatch,
    WearOs,
    HealthConnect,
    GoogleFit,
    Fitbit,
    Garmin,
    Samsung,
    Withings,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::AppleWatch,
        ProviderKind::WearOs,
        ProviderKind::HealthConnect,
        ProviderKind::GoogleFit,
        ProviderKind::Fitbit,
        ProviderKind::Garmin,
        ProviderKind::Samsung,
        ProviderKind::Withings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AppleWatch => "apple-watch",
            ProviderKind::WearOs => "wear-os",
            ProviderKind::HealthConnect => "health-connect",
            ProviderKind::GoogleFit => "google-fit",
            ProviderKind::Fitbit => "fitbit",
            ProviderKind::Garmin => "garmin",
            ProviderKind::Samsung => "samsung",
            ProviderKind::Withings => "withings",
        }
    }

    /// Which integration model this provider uses.
    pub fn capability(&self) -> Capability {
        match self {
            ProviderKind::AppleWatch
            | ProviderKind::WearOs
            | ProviderKind::HealthConnect
            | ProviderKind::Samsung => Capability::Push,
            ProviderKind::GoogleFit
            | ProviderKind::Fitbit
            | ProviderKind::Garmin
            | ProviderKind::Withings => Capability::Pull,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| IngestError::UnknownProvider(s.to_string()))
    }
}

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Unauthorized,
    PendingAuth,
    Authorized,
    Expired,
    Revoked,
    Disconnected,
}

impl DeviceState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// Pull providers go pending_auth -> authorized on code exchange; push
    /// providers go unauthorized -> authorized directly on registration. From
    /// expired the only way forward is authorized (refresh) or disconnected.
    pub fn can_transition(&self, to: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, to),
            (Unauthorized, PendingAuth)
                | (Unauthorized, Authorized)
                | (PendingAuth, Authorized)
                | (PendingAuth, Disconnected)
                | (Authorized, Expired)
                | (Authorized, Revoked)
                | (Authorized, Disconnected)
                | (Expired, Authorized)
                | (Expired, Disconnected)
                | (Revoked, Disconnected)
                | (Revoked, PendingAuth)
                | (Disconnected, PendingAuth)
                | (Disconnected, Authorized)
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::PendingAuth => "pending_auth",
            DeviceState::Authorized => "authorized",
            DeviceState::Expired => "expired",
            DeviceState::Revoked => "revoked",
            DeviceState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Canonical metric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    RestingHeartRate,
    Hrv,
    BloodOxygen,
    SleepSession,
    ActivityDay,
}

/// Dedup bucket granularity for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketGranularity {
    /// Exact timestamp (point metrics).
    Point,
    /// Calendar day (aggregate metrics).
    Day,
}

impl MetricType {
    pub const ALL: [MetricType; 6] = [
        MetricType::HeartRate,
        MetricType::RestingHeartRate,
        MetricType::Hrv,
        MetricType::BloodOxygen,
        MetricType::SleepSession,
        MetricType::ActivityDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::RestingHeartRate => "resting_heart_rate",
            MetricType::Hrv => "hrv",
            MetricType::BloodOxygen => "blood_oxygen",
            MetricType::SleepSession => "sleep_session",
            MetricType::ActivityDay => "activity_day",
        }
    }

    pub fn bucket_granularity(&self) -> BucketGranularity {
        match self {
            MetricType::SleepSession | MetricType::ActivityDay => BucketGranularity::Day,
            _ => BucketGranularity::Point,
        }
    }

    /// Canonical unit for stored values.
    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::HeartRate | MetricType::RestingHeartRate => "bpm",
            MetricType::Hrv => "ms",
            MetricType::BloodOxygen => "percent",
            MetricType::SleepSession => "minutes",
            MetricType::ActivityDay => "steps",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .copied()
            .ok_or_else(|| IngestError::Parse(format!("unknown metric type: {s}")))
    }
}

/// Context tag attached to point samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleContext {
    Resting,
    Active,
    Workout,
    Sleep,
}

/// Motion context a provider may attach to a heart-rate sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionContext {
    Stationary,
    Moving,
    Workout,
}

/// Sleep stage classification (provider-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    Awake,
    Light,
    Deep,
    Rem,
}

/// Dedup bucket: exact timestamp for point metrics, calendar day for
/// aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Point(DateTime<Utc>),
    Day(NaiveDate),
}

/// Deterministic identity of a canonical sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleKey {
    pub patient_id: String,
    pub metric: MetricType,
    pub bucket: Bucket,
}

/// Per-stage minutes and score for a stored sleep session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepDetail {
    pub awake_minutes: f64,
    pub light_minutes: f64,
    pub deep_minutes: f64,
    pub rem_minutes: f64,
    /// Total asleep minutes (excludes awake).
    pub total_asleep_minutes: f64,
    /// 0-100 sleep score.
    pub score: f64,
}

/// Daily activity rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDetail {
    pub steps: u64,
    pub distance_meters: f64,
    pub calories: f64,
    pub floors: u32,
}

/// Metric-specific detail carried alongside the scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleDetail {
    Sleep(SleepDetail),
    Activity(ActivityDetail),
}

/// The normalized unit of truth emitted by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSample {
    pub patient_id: String,
    pub device_id: String,
    pub metric: MetricType,
    /// Dedup bucket; fixed at creation so identity never depends on
    /// timestamp-to-string formatting.
    pub bucket: Bucket,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub value: f64,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SampleContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<SampleDetail>,
}

impl CanonicalSample {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            patient_id: self.patient_id.clone(),
            metric: self.metric,
            bucket: self.bucket.clone(),
        }
    }
}

/// Raw, provider-specific sample shapes emitted by adapters before
/// normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawHealthSample {
    HeartRate {
        at: DateTime<Utc>,
        bpm: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        motion: Option<MotionContext>,
    },
    RestingHeartRate {
        at: DateTime<Utc>,
        bpm: f64,
    },
    Hrv {
        at: DateTime<Utc>,
        rmssd_ms: f64,
    },
    BloodOxygen {
        at: DateTime<Utc>,
        /// Whole-number percentage, 0-100.
        percentage: f64,
    },
    SleepStageSegment {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: SleepStage,
    },
    /// One activity delta; a day's deltas are summed during normalization.
    Activity {
        at: DateTime<Utc>,
        #[serde(default)]
        steps: u64,
        #[serde(default)]
        distance_meters: f64,
        #[serde(default)]
        calories: f64,
        #[serde(default)]
        floors: u32,
    },
}

/// OAuth or push-token credential, serialized and encrypted at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// A push/device token that never expires on its own.
    pub fn push_token(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// A patient's wearable connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub patient_id: String,
    pub provider: ProviderKind,
    pub state: DeviceState,
    /// Encrypted credential blob (vault format); cleared on disconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// IANA timezone used for local-hour heuristics and day bucketing.
    pub timezone: String,
    pub enabled_metrics: Vec<MetricType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn new(patient_id: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            patient_id: patient_id.into(),
            provider,
            state: DeviceState::Unauthorized,
            credential: None,
            serial_number: None,
            model: None,
            firmware: None,
            timezone: "UTC".to_string(),
            enabled_metrics: MetricType::ALL.to_vec(),
            last_sync: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a state transition, enforcing the device state machine.
    pub fn transition(&mut self, to: DeviceState) -> Result<(), IngestError> {
        if !self.state.can_transition(to) {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Soft-disable: credentials cleared, state set to disconnected. The
    /// device row survives while historical samples exist.
    pub fn disconnect(&mut self) {
        self.credential = None;
        self.state = DeviceState::Disconnected;
    }

    /// Connected devices are the only ones webhook serial lookup may match.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, DeviceState::Authorized | DeviceState::Expired)
    }
}
