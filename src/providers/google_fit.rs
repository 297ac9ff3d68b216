//! Google Fit pull adapter.
//!
//! Uses the fitness REST aggregate API. Google Fit exposes no HRV or resting
//! heart-rate series, so those metrics fail explicitly rather than returning
//! empty data.

use crate::config::OauthClientConfig;
use crate::error::IngestError;
use crate::types::{MetricType, ProviderKind, RawHealthSample, SleepStage, TokenSet};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::json;

use super::PullProvider;

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const SCOPES: &str = "https://www.googleapis.com/auth/fitness.heart_rate.read \
                      https://www.googleapis.com/auth/fitness.oxygen_saturation.read \
                      https://www.googleapis.com/auth/fitness.sleep.read \
                      https://www.googleapis.com/auth/fitness.activity.read";

const SUPPORTED: [MetricType; 4] = [
    MetricType::HeartRate,
    MetricType::BloodOxygen,
    MetricType::SleepSession,
    MetricType::ActivityDay,
];

pub struct GoogleFitAdapter {
    cfg: OauthClientConfig,
    client: reqwest::Client,
}

impl GoogleFitAdapter {
    pub fn new(cfg: OauthClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self { cfg, client }
    }

    fn api_base(&self) -> &str {
        self.cfg.api_base.as_deref().unwrap_or(DEFAULT_API_BASE)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenSet, IngestError> {
        let response = self
            .client
            .post(format!("{}/oauth2/v4/token", self.api_base()))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: "google token endpoint rejected the request".to_string(),
            });
        }

        let body: GoogleTokenResponse = response.json().await?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn aggregate(
        &self,
        access_token: &str,
        data_type: &str,
        bucket_millis: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<GoogleAggregateResponse, IngestError> {
        let body = json!({
            "aggregateBy": [{"dataTypeName": data_type}],
            "bucketByTime": {"durationMillis": bucket_millis},
            "startTimeMillis": start.timestamp_millis(),
            "endTimeMillis": end.timestamp_millis(),
        });

        let response = self
            .client
            .post(format!(
                "{}/fitness/v1/users/me/dataset:aggregate",
                self.api_base()
            ))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: format!("google fit aggregate failed for {data_type}"),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PullProvider for GoogleFitAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleFit
    }

    fn supported_metrics(&self) -> &'static [MetricType] {
        &SUPPORTED
    }

    fn authorization_url(&self, state: &str) -> String {
        let mut url = reqwest::Url::parse(AUTHORIZE_URL).expect("static authorize URL");
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("redirect_uri", &self.cfg.redirect_uri)
            .append_pair("scope", SCOPES)
            .append_pair("access_type", "offline")
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.cfg.client_id),
            ("client_secret", &self.cfg.client_secret),
            ("redirect_uri", &self.cfg.redirect_uri),
        ])
        .await
        .map_err(|e| IngestError::TokenExchange(e.to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.cfg.client_id),
            ("client_secret", &self.cfg.client_secret),
        ])
        .await
        .map_err(|e| IngestError::TokenRefresh(e.to_string()))
    }

    async fn revoke(&self, access_token: &str) -> Result<bool, IngestError> {
        let response = self
            .client
            .post(format!(
                "{}/o/oauth2/revoke?token={access_token}",
                self.api_base()
            ))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn fetch(
        &self,
        access_token: &str,
        metric: MetricType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _tz: Tz,
    ) -> Result<Vec<RawHealthSample>, IngestError> {
        const MINUTE_MS: i64 = 60_000;
        const DAY_MS: i64 = 86_400_000;

        match metric {
            MetricType::HeartRate => {
                let response = self
                    .aggregate(access_token, "com.google.heart_rate.bpm", MINUTE_MS, start, end)
                    .await?;
                Ok(collect_points(&response, |at, value| {
                    Some(RawHealthSample::HeartRate {
                        at,
                        bpm: value,
                        motion: None,
                    })
                }))
            }
            MetricType::BloodOxygen => {
                let response = self
                    .aggregate(
                        access_token,
                        "com.google.oxygen_saturation",
                        MINUTE_MS,
                        start,
                        end,
                    )
                    .await?;
                Ok(collect_points(&response, |at, value| {
                    Some(RawHealthSample::BloodOxygen {
                        at,
                        percentage: value,
                    })
                }))
            }
            MetricType::ActivityDay => {
                let response = self
                    .aggregate(
                        access_token,
                        "com.google.step_count.delta",
                        DAY_MS,
                        start,
                        end,
                    )
                    .await?;
                Ok(collect_points(&response, |at, value| {
                    Some(RawHealthSample::Activity {
                        at,
                        steps: value as u64,
                        distance_meters: 0.0,
                        calories: 0.0,
                        floors: 0,
                    })
                }))
            }
            MetricType::SleepSession => {
                let response = self
                    .aggregate(access_token, "com.google.sleep.segment", DAY_MS, start, end)
                    .await?;
                Ok(collect_sleep_segments(&response))
            }
            MetricType::Hrv | MetricType::RestingHeartRate => Err(IngestError::UnsupportedMetric {
                provider: ProviderKind::GoogleFit,
                metric,
            }),
        }
    }
}

fn collect_points<F>(response: &GoogleAggregateResponse, mut build: F) -> Vec<RawHealthSample>
where
    F: FnMut(DateTime<Utc>, f64) -> Option<RawHealthSample>,
{
    let mut samples = Vec::new();
    for bucket in &response.bucket {
        for dataset in &bucket.dataset {
            for point in &dataset.point {
                let Some(at) = point.start_utc() else {
                    continue;
                };
                let Some(value) = point.scalar_value() else {
                    continue;
                };
                if let Some(sample) = build(at, value) {
                    samples.push(sample);
                }
            }
        }
    }
    samples
}

fn collect_sleep_segments(response: &GoogleAggregateResponse) -> Vec<RawHealthSample> {
    let mut samples = Vec::new();
    for bucket in &response.bucket {
        for dataset in &bucket.dataset {
            for point in &dataset.point {
                let (Some(start), Some(end)) = (point.start_utc(), point.end_utc()) else {
                    continue;
                };
                let Some(stage) = point
                    .value
                    .first()
                    .and_then(|v| v.int_val)
                    .and_then(parse_sleep_stage)
                else {
                    continue;
                };
                samples.push(RawHealthSample::SleepStageSegment { start, end, stage });
            }
        }
    }
    samples
}

// Google sleep segment stage codes.
fn parse_sleep_stage(code: i64) -> Option<SleepStage> {
    match code {
        1 => Some(SleepStage::Awake),
        2 | 4 => Some(SleepStage::Light),
        5 => Some(SleepStage::Deep),
        6 => Some(SleepStage::Rem),
        _ => None,
    }
}

// Google Fit aggregate response structures (numeric fields are strings)

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GoogleAggregateResponse {
    #[serde(default)]
    bucket: Vec<GoogleBucket>,
}

#[derive(Debug, Deserialize)]
struct GoogleBucket {
    #[serde(default)]
    dataset: Vec<GoogleDataset>,
}

#[derive(Debug, Deserialize)]
struct GoogleDataset {
    #[serde(default)]
    point: Vec<GooglePoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePoint {
    start_time_nanos: Option<String>,
    end_time_nanos: Option<String>,
    #[serde(default)]
    value: Vec<GoogleValue>,
}

impl GooglePoint {
    fn start_utc(&self) -> Option<DateTime<Utc>> {
        nanos_to_utc(self.start_time_nanos.as_deref()?)
    }

    fn end_utc(&self) -> Option<DateTime<Utc>> {
        nanos_to_utc(self.end_time_nanos.as_deref()?)
    }

    fn scalar_value(&self) -> Option<f64> {
        let value = self.value.first()?;
        value.fp_val.or(value.int_val.map(|v| v as f64))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleValue {
    fp_val: Option<f64>,
    int_val: Option<i64>,
}

fn nanos_to_utc(nanos: &str) -> Option<DateTime<Utc>> {
    let nanos: i64 = nanos.parse().ok()?;
    Utc.timestamp_opt(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_aggregate_points() {
        let json = r#"{
            "bucket": [{
                "dataset": [{
                    "point": [
                        {"startTimeNanos": "1709280000000000000", "endTimeNanos": "1709280060000000000", "value": [{"fpVal": 71.5}]},
                        {"startTimeNanos": "1709280060000000000", "endTimeNanos": "1709280120000000000", "value": [{"intVal": 68}]}
                    ]
                }]
            }]
        }"#;
        let response: GoogleAggregateResponse = serde_json::from_str(json).unwrap();
        let samples = collect_points(&response, |at, value| {
            Some(RawHealthSample::HeartRate {
                at,
                bpm: value,
                motion: None,
            })
        });
        assert_eq!(samples.len(), 2);
        match &samples[1] {
            RawHealthSample::HeartRate { bpm, .. } => assert_eq!(*bpm, 68.0),
            other => panic!("unexpected sample: {other:?}"),
        }
    }

    #[test]
    fn test_parse_sleep_segments() {
        let json = r#"{
            "bucket": [{
                "dataset": [{
                    "point": [
                        {"startTimeNanos": "1709247600000000000", "endTimeNanos": "1709251200000000000", "value": [{"intVal": 5}]},
                        {"startTimeNanos": "1709251200000000000", "endTimeNanos": "1709254800000000000", "value": [{"intVal": 3}]}
                    ]
                }]
            }]
        }"#;
        let response: GoogleAggregateResponse = serde_json::from_str(json).unwrap();
        let samples = collect_sleep_segments(&response);
        // stage code 3 (out of bed) is dropped
        assert_eq!(samples.len(), 1);
        match &samples[0] {
            RawHealthSample::SleepStageSegment { stage, .. } => {
                assert_eq!(*stage, SleepStage::Deep)
            }
            other => panic!("unexpected sample: {other:?}"),
        }
    }

    #[test]
    fn test_hrv_is_unsupported() {
        let adapter = GoogleFitAdapter::new(OauthClientConfig::default());
        assert!(!adapter.supported_metrics().contains(&MetricType::Hrv));
    }
}
