//! HealthKit push adapter (apple-watch).
//!
//! Parses HealthKit export payloads delivered by the companion app and maps
//! them to raw health samples. Signatures are HMAC-SHA256 over the raw body.

use crate::error::IngestError;
use crate::types::{MotionContext, ProviderKind, RawHealthSample, SleepStage};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{PushPayload, PushProvider, SignatureInput, WebhookScheme};

pub struct HealthKitAdapter;

impl PushProvider for HealthKitAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AppleWatch
    }

    fn scheme(&self) -> WebhookScheme {
        WebhookScheme {
            header: "x-healthkit-signature",
            input: SignatureInput::RawBody,
        }
    }

    fn parse_payload(&self, raw: &[u8]) -> Result<PushPayload, IngestError> {
        let payload: HkPayload = serde_json::from_slice(raw)?;
        let serial_number = payload.device.serial_number;
        if serial_number.is_empty() {
            return Err(IngestError::Parse(
                "HealthKit payload missing device serial number".to_string(),
            ));
        }

        let mut samples = Vec::with_capacity(payload.samples.len());
        for sample in payload.samples {
            match convert_sample(&sample) {
                Some(converted) => samples.push(converted),
                None => {
                    tracing::debug!(sample_type = %sample.sample_type, "skipping unsupported HealthKit sample type");
                }
            }
        }

        Ok(PushPayload {
            serial_number,
            samples,
        })
    }
}

fn convert_sample(sample: &HkSample) -> Option<RawHealthSample> {
    let at = sample.start_date;
    match sample.sample_type.as_str() {
        "heartRate" => Some(RawHealthSample::HeartRate {
            at,
            bpm: sample.value?,
            motion: sample.motion_context.as_deref().and_then(parse_motion),
        }),
        "restingHeartRate" => Some(RawHealthSample::RestingHeartRate {
            at,
            bpm: sample.value?,
        }),
        "heartRateVariabilitySDNN" => Some(RawHealthSample::Hrv {
            at,
            rmssd_ms: sample.value?,
        }),
        // HealthKit reports oxygen saturation as a 0-1 fraction.
        "oxygenSaturation" => Some(RawHealthSample::BloodOxygen {
            at,
            percentage: sample.value? * 100.0,
        }),
        "sleepAnalysis" => Some(RawHealthSample::SleepStageSegment {
            start: sample.start_date,
            end: sample.end_date?,
            stage: parse_stage(sample.stage.as_deref()?)?,
        }),
        "stepCount" => Some(RawHealthSample::Activity {
            at,
            steps: sample.value? as u64,
            distance_meters: 0.0,
            calories: 0.0,
            floors: 0,
        }),
        "distanceWalkingRunning" => Some(RawHealthSample::Activity {
            at,
            steps: 0,
            distance_meters: sample.value?,
            calories: 0.0,
            floors: 0,
        }),
        "activeEnergyBurned" => Some(RawHealthSample::Activity {
            at,
            steps: 0,
            distance_meters: 0.0,
            calories: sample.value?,
            floors: 0,
        }),
        "flightsClimbed" => Some(RawHealthSample::Activity {
            at,
            steps: 0,
            distance_meters: 0.0,
            calories: 0.0,
            floors: sample.value? as u32,
        }),
        _ => None,
    }
}

fn parse_motion(s: &str) -> Option<MotionContext> {
    match s {
        "sedentary" => Some(MotionContext::Stationary),
        "active" => Some(MotionContext::Moving),
        "workout" => Some(MotionContext::Workout),
        _ => None,
    }
}

fn parse_stage(s: &str) -> Option<SleepStage> {
    match s {
        "awake" | "inBed" => Some(SleepStage::Awake),
        "asleepCore" | "asleepUnspecified" => Some(SleepStage::Light),
        "asleepDeep" => Some(SleepStage::Deep),
        "asleepREM" => Some(SleepStage::Rem),
        _ => None,
    }
}

// HealthKit export payload structures

#[derive(Debug, Deserialize)]
struct HkPayload {
    device: HkDevice,
    #[serde(default)]
    samples: Vec<HkSample>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HkDevice {
    serial_number: String,
    #[allow(dead_code)]
    model: Option<String>,
    #[allow(dead_code)]
    system_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HkSample {
    #[serde(rename = "type")]
    sample_type: String,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    value: Option<f64>,
    motion_context: Option<String>,
    stage: Option<String>,
}
