//! Garmin pull adapter.
//!
//! Speaks the Garmin wellness API: dailies, sleeps, and HRV summaries mapped
//! to raw health samples.

use crate::config::OauthClientConfig;
use crate::error::IngestError;
use crate::types::{MetricType, ProviderKind, RawHealthSample, SleepStage, TokenSet};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashMap;

use super::PullProvider;

const DEFAULT_API_BASE: &str = "https://apis.garmin.com";
const AUTHORIZE_URL: &str = "https://connect.garmin.com/oauth2Confirm";

pub struct GarminAdapter {
    cfg: OauthClientConfig,
    client: reqwest::Client,
}

impl GarminAdapter {
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
            .post(format!(
                "{}/di-oauth2-service/oauth/token",
                self.api_base()
            ))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: "garmin token endpoint rejected the request".to_string(),
            });
        }

        let body: GarminTokenResponse = response.json().await?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<T, IngestError> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base(), path))
            .query(&[
                ("uploadStartTimeInSeconds", start.timestamp()),
                ("uploadEndTimeInSeconds", end.timestamp()),
            ])
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: format!("garmin returned an error for {path}"),
            });
        }
        Ok(response.json().await?)
    }

    async fn fetch_dailies(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GarminDaily>, IngestError> {
        self.get_json(access_token, "/wellness-api/rest/dailies", start, end)
            .await
    }
}

#[async_trait]
impl PullProvider for GarminAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Garmin
    }

    fn supported_metrics(&self) -> &'static [MetricType] {
        &MetricType::ALL
    }

    fn authorization_url(&self, state: &str) -> String {
        let mut url = reqwest::Url::parse(AUTHORIZE_URL).expect("static authorize URL");
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("redirect_uri", &self.cfg.redirect_uri)
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
            .delete(format!(
                "{}/wellness-api/rest/user/registration",
                self.api_base()
            ))
            .bearer_auth(access_token)
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
        match metric {
            MetricType::HeartRate => {
                let dailies = self.fetch_dailies(access_token, start, end).await?;
                Ok(dailies.iter().flat_map(parse_heart_offsets).collect())
            }
            MetricType::RestingHeartRate => {
                let dailies = self.fetch_dailies(access_token, start, end).await?;
                Ok(dailies.iter().filter_map(parse_resting_heart).collect())
            }
            MetricType::BloodOxygen => {
                let dailies = self.fetch_dailies(access_token, start, end).await?;
                Ok(dailies.iter().filter_map(parse_spo2).collect())
            }
            MetricType::ActivityDay => {
                let dailies = self.fetch_dailies(access_token, start, end).await?;
                Ok(dailies.iter().filter_map(parse_activity).collect())
            }
            MetricType::Hrv => {
                let records: Vec<GarminHrv> = self
                    .get_json(access_token, "/wellness-api/rest/hrv", start, end)
                    .await?;
                Ok(records.iter().filter_map(parse_hrv).collect())
            }
            MetricType::SleepSession => {
                let records: Vec<GarminSleep> = self
                    .get_json(access_token, "/wellness-api/rest/sleeps", start, end)
                    .await?;
                Ok(records.iter().flat_map(parse_sleep_levels).collect())
            }
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn date_start_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn parse_heart_offsets(daily: &GarminDaily) -> Vec<RawHealthSample> {
    let (Some(start_secs), Some(offsets)) = (
        daily.start_time_in_seconds,
        &daily.time_offset_heart_rate_samples,
    ) else {
        return Vec::new();
    };
    offsets
        .iter()
        .filter_map(|(offset, bpm)| {
            let offset: i64 = offset.parse().ok()?;
            let at = Utc.timestamp_opt(start_secs + offset, 0).single()?;
            Some(RawHealthSample::HeartRate {
                at,
                bpm: *bpm,
                motion: None,
            })
        })
        .collect()
}

fn parse_resting_heart(daily: &GarminDaily) -> Option<RawHealthSample> {
    Some(RawHealthSample::RestingHeartRate {
        at: date_start_utc(parse_date(&daily.calendar_date)?),
        bpm: daily.resting_heart_rate_in_beats_per_minute?,
    })
}

fn parse_spo2(daily: &GarminDaily) -> Option<RawHealthSample> {
    Some(RawHealthSample::BloodOxygen {
        at: date_start_utc(parse_date(&daily.calendar_date)?),
        percentage: daily.avg_spo2_value?,
    })
}

fn parse_activity(daily: &GarminDaily) -> Option<RawHealthSample> {
    let date = parse_date(&daily.calendar_date)?;
    Some(RawHealthSample::Activity {
        at: date_start_utc(date),
        steps: daily.total_steps.unwrap_or(0),
        distance_meters: daily.total_distance_meters.unwrap_or(0.0),
        calories: daily.total_kilocalories.unwrap_or(0.0),
        floors: daily.floors_climbed.unwrap_or(0),
    })
}

fn parse_hrv(record: &GarminHrv) -> Option<RawHealthSample> {
    Some(RawHealthSample::Hrv {
        at: date_start_utc(parse_date(&record.calendar_date)?),
        rmssd_ms: record.last_night_avg?,
    })
}

fn parse_sleep_levels(record: &GarminSleep) -> Vec<RawHealthSample> {
    let Some(levels) = &record.sleep_levels_map else {
        return Vec::new();
    };
    let mut samples = Vec::new();
    for (level, windows) in levels {
        let Some(stage) = parse_level(level) else {
            continue;
        };
        for window in windows {
            let (Some(start), Some(end)) = (
                Utc.timestamp_opt(window.start_time_in_seconds, 0).single(),
                Utc.timestamp_opt(window.end_time_in_seconds, 0).single(),
            ) else {
                continue;
            };
            samples.push(RawHealthSample::SleepStageSegment { start, end, stage });
        }
    }
    samples
}

fn parse_level(level: &str) -> Option<SleepStage> {
    match level {
        "awake" => Some(SleepStage::Awake),
        "light" => Some(SleepStage::Light),
        "deep" => Some(SleepStage::Deep),
        "rem" => Some(SleepStage::Rem),
        _ => None,
    }
}

// Garmin wellness API response structures

#[derive(Debug, Deserialize)]
struct GarminTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GarminDaily {
    calendar_date: String,
    start_time_in_seconds: Option<i64>,
    total_steps: Option<u64>,
    total_distance_meters: Option<f64>,
    total_kilocalories: Option<f64>,
    floors_climbed: Option<u32>,
    resting_heart_rate_in_beats_per_minute: Option<f64>,
    avg_spo2_value: Option<f64>,
    time_offset_heart_rate_samples: Option<HashMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GarminHrv {
    calendar_date: String,
    last_night_avg: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GarminSleep {
    #[allow(dead_code)]
    calendar_date: Option<String>,
    sleep_levels_map: Option<HashMap<String, Vec<GarminSleepWindow>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GarminSleepWindow {
    start_time_in_seconds: i64,
    end_time_in_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_daily_fields() {
        let json = r#"{
            "calendarDate": "2024-03-01",
            "startTimeInSeconds": 1709251200,
            "totalSteps": 8500,
            "totalDistanceMeters": 6500.0,
            "totalKilocalories": 2200.0,
            "floorsClimbed": 9,
            "restingHeartRateInBeatsPerMinute": 55,
            "avgSpo2Value": 96.5,
            "timeOffsetHeartRateSamples": {"0": 62.0, "900": 66.0, "1800": 71.0}
        }"#;
        let daily: GarminDaily = serde_json::from_str(json).unwrap();

        let hr = parse_heart_offsets(&daily);
        assert_eq!(hr.len(), 3);

        match parse_resting_heart(&daily).unwrap() {
            RawHealthSample::RestingHeartRate { bpm, .. } => assert_eq!(bpm, 55.0),
            other => panic!("unexpected sample: {other:?}"),
        }
        match parse_activity(&daily).unwrap() {
            RawHealthSample::Activity { steps, floors, .. } => {
                assert_eq!(steps, 8500);
                assert_eq!(floors, 9);
            }
            other => panic!("unexpected sample: {other:?}"),
        }
    }

    #[test]
    fn test_parse_sleep_levels_map() {
        let json = r#"{
            "calendarDate": "2024-03-01",
            "sleepLevelsMap": {
                "deep": [{"startTimeInSeconds": 1709254800, "endTimeInSeconds": 1709260200}],
                "rem": [{"startTimeInSeconds": 1709260200, "endTimeInSeconds": 1709266800}],
                "unmeasurable": [{"startTimeInSeconds": 1709266800, "endTimeInSeconds": 1709267100}]
            }
        }"#;
        let record: GarminSleep = serde_json::from_str(json).unwrap();
        let samples = parse_sleep_levels(&record);
        // unmeasurable windows are dropped
        assert_eq!(samples.len(), 2);
    }
}
