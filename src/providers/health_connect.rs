//! Health Connect push adapter (wear-os, health-connect, samsung).
//!
//! All three ecosystems deliver Health Connect record batches; they differ in
//! the signature header and, for Samsung, in the HMAC input (body plus a
//! trailing ampersand, matching the external service's signing convention).

use crate::error::IngestError;
use crate::types::{ProviderKind, RawHealthSample, SleepStage};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{PushPayload, PushProvider, SignatureInput, WebhookScheme};

pub struct HealthConnectAdapter {
    kind: ProviderKind,
}

impl HealthConnectAdapter {
    pub fn new(kind: ProviderKind) -> Self {
        debug_assert!(matches!(
            kind,
            ProviderKind::WearOs | ProviderKind::HealthConnect | ProviderKind::Samsung
        ));
        Self { kind }
    }
}

impl PushProvider for HealthConnectAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn scheme(&self) -> WebhookScheme {
        match self.kind {
            ProviderKind::Samsung => WebhookScheme {
                header: "x-samsung-signature",
                input: SignatureInput::BodyWithAmpersand,
            },
            ProviderKind::WearOs => WebhookScheme {
                header: "x-wearos-signature",
                input: SignatureInput::RawBody,
            },
            _ => WebhookScheme {
                header: "x-healthconnect-signature",
                input: SignatureInput::RawBody,
            },
        }
    }

    fn parse_payload(&self, raw: &[u8]) -> Result<PushPayload, IngestError> {
        let payload: HcPayload = serde_json::from_slice(raw)?;
        let serial_number = payload.device.serial;
        if serial_number.is_empty() {
            return Err(IngestError::Parse(
                "Health Connect payload missing device serial".to_string(),
            ));
        }

        let mut samples = Vec::new();
        for record in payload.records {
            convert_record(record, &mut samples);
        }

        Ok(PushPayload {
            serial_number,
            samples,
        })
    }
}

fn convert_record(record: HcRecord, out: &mut Vec<RawHealthSample>) {
    match record {
        HcRecord::HeartRate {
            time,
            beats_per_minute,
        } => out.push(RawHealthSample::HeartRate {
            at: time,
            bpm: beats_per_minute,
            motion: None,
        }),
        HcRecord::RestingHeartRate {
            time,
            beats_per_minute,
        } => out.push(RawHealthSample::RestingHeartRate {
            at: time,
            bpm: beats_per_minute,
        }),
        HcRecord::HeartRateVariabilityRmssd {
            time,
            heart_rate_variability_millis,
        } => out.push(RawHealthSample::Hrv {
            at: time,
            rmssd_ms: heart_rate_variability_millis,
        }),
        HcRecord::OxygenSaturation { time, percentage } => {
            out.push(RawHealthSample::BloodOxygen {
                at: time,
                percentage,
            })
        }
        HcRecord::SleepSession { stages } => {
            for stage in stages {
                if let Some(parsed) = parse_stage(&stage.stage) {
                    out.push(RawHealthSample::SleepStageSegment {
                        start: stage.start_time,
                        end: stage.end_time,
                        stage: parsed,
                    });
                }
            }
        }
        HcRecord::Steps { start_time, count } => out.push(RawHealthSample::Activity {
            at: start_time,
            steps: count,
            distance_meters: 0.0,
            calories: 0.0,
            floors: 0,
        }),
        HcRecord::Distance {
            start_time,
            distance_meters,
        } => out.push(RawHealthSample::Activity {
            at: start_time,
            steps: 0,
            distance_meters,
            calories: 0.0,
            floors: 0,
        }),
        HcRecord::TotalCaloriesBurned {
            start_time,
            energy_kcal,
        } => out.push(RawHealthSample::Activity {
            at: start_time,
            steps: 0,
            distance_meters: 0.0,
            calories: energy_kcal,
            floors: 0,
        }),
        HcRecord::FloorsClimbed { start_time, floors } => out.push(RawHealthSample::Activity {
            at: start_time,
            steps: 0,
            distance_meters: 0.0,
            calories: 0.0,
            floors,
        }),
    }
}

fn parse_stage(s: &str) -> Option<SleepStage> {
    match s {
        "awake" | "awake_in_bed" | "out_of_bed" => Some(SleepStage::Awake),
        "light" | "sleeping" => Some(SleepStage::Light),
        "deep" => Some(SleepStage::Deep),
        "rem" => Some(SleepStage::Rem),
        _ => None,
    }
}

// Health Connect record batch structures

#[derive(Debug, Deserialize)]
struct HcPayload {
    device: HcDevice,
    #[serde(default)]
    records: Vec<HcRecord>,
}

#[derive(Debug, Deserialize)]
struct HcDevice {
    serial: String,
    #[allow(dead_code)]
    manufacturer: Option<String>,
    #[allow(dead_code)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "recordType")]
enum HcRecord {
    #[serde(rename = "HeartRateRecord", rename_all = "camelCase")]
    HeartRate {
        time: DateTime<Utc>,
        beats_per_minute: f64,
    },
    #[serde(rename = "RestingHeartRateRecord", rename_all = "camelCase")]
    RestingHeartRate {
        time: DateTime<Utc>,
        beats_per_minute: f64,
    },
    #[serde(rename = "HeartRateVariabilityRmssdRecord", rename_all = "camelCase")]
    HeartRateVariabilityRmssd {
        time: DateTime<Utc>,
        heart_rate_variability_millis: f64,
    },
    #[serde(rename = "OxygenSaturationRecord", rename_all = "camelCase")]
    OxygenSaturation {
        time: DateTime<Utc>,
        percentage: f64,
    },
    #[serde(rename = "SleepSessionRecord", rename_all = "camelCase")]
    SleepSession {
        #[serde(default)]
        stages: Vec<HcSleepStage>,
    },
    #[serde(rename = "StepsRecord", rename_all = "camelCase")]
    Steps {
        start_time: DateTime<Utc>,
        count: u64,
    },
    #[serde(rename = "DistanceRecord", rename_all = "camelCase")]
    Distance {
        start_time: DateTime<Utc>,
        distance_meters: f64,
    },
    #[serde(rename = "TotalCaloriesBurnedRecord", rename_all = "camelCase")]
    TotalCaloriesBurned {
        start_time: DateTime<Utc>,
        energy_kcal: f64,
    },
    #[serde(rename = "FloorsClimbedRecord", rename_all = "camelCase")]
    FloorsClimbed {
        start_time: DateTime<Utc>,
        floors: u32,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HcSleepStage {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    stage: String,
}
