//! Fitbit pull adapter.
//!
//! Speaks the Fitbit Web API: OAuth code exchange/refresh/revoke plus
//! per-metric fetches mapped to raw health samples.

use crate::config::OauthClientConfig;
use crate::error::IngestError;
use crate::types::{MetricType, ProviderKind, RawHealthSample, SleepStage, TokenSet};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use super::PullProvider;

const DEFAULT_API_BASE: &str = "https://api.fitbit.com";
const AUTHORIZE_URL: &str = "https://www.fitbit.com/oauth2/authorize";
const SCOPES: &str = "heartrate sleep activity oxygen_saturation";

pub struct FitbitAdapter {
    cfg: OauthClientConfig,
    client: reqwest::Client,
}

impl FitbitAdapter {
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
            .post(format!("{}/oauth2/token", self.api_base()))
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: "fitbit token endpoint rejected the request".to_string(),
            });
        }

        let body: FitbitTokenResponse = response.json().await?;
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
    ) -> Result<T, IngestError> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base(), path))
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: format!("fitbit returned an error for {path}"),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PullProvider for FitbitAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fitbit
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
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.cfg.redirect_uri),
        ])
        .await
        .map_err(|e| IngestError::TokenExchange(e.to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
        .map_err(|e| IngestError::TokenRefresh(e.to_string()))
    }

    async fn revoke(&self, access_token: &str) -> Result<bool, IngestError> {
        let response = self
            .client
            .post(format!("{}/oauth2/revoke", self.api_base()))
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(&[("token", access_token)])
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
        tz: Tz,
    ) -> Result<Vec<RawHealthSample>, IngestError> {
        let start_date = start.date_naive();
        let end_date = end.date_naive();

        match metric {
            MetricType::HeartRate => {
                let path = format!(
                    "/1/user/-/activities/heart/date/{start_date}/{end_date}/1min.json"
                );
                let body: FitbitHeartResponse = self.get_json(access_token, &path).await?;
                Ok(parse_heart_intraday(&body, start_date, tz))
            }
            MetricType::RestingHeartRate => {
                let path = format!("/1/user/-/activities/heart/date/{start_date}/{end_date}.json");
                let body: FitbitHeartResponse = self.get_json(access_token, &path).await?;
                Ok(parse_resting_heart(&body, tz))
            }
            MetricType::Hrv => {
                let path = format!("/1/user/-/hrv/date/{start_date}/{end_date}.json");
                let body: FitbitHrvResponse = self.get_json(access_token, &path).await?;
                Ok(parse_hrv(&body, tz))
            }
            MetricType::BloodOxygen => {
                let path = format!("/1/user/-/spo2/date/{start_date}/{end_date}.json");
                let body: Vec<FitbitSpo2Day> = self.get_json(access_token, &path).await?;
                Ok(parse_spo2(&body, tz))
            }
            MetricType::SleepSession => {
                let path = format!("/1.2/user/-/sleep/date/{start_date}/{end_date}.json");
                let body: FitbitSleepResponse = self.get_json(access_token, &path).await?;
                Ok(parse_sleep(&body, tz))
            }
            MetricType::ActivityDay => {
                let mut samples = Vec::new();
                for date in days_inclusive(start_date, end_date) {
                    let path = format!("/1/user/-/activities/date/{date}.json");
                    let body: FitbitActivityResponse = self.get_json(access_token, &path).await?;
                    if let Some(sample) = parse_activity_day(&body, date, tz) {
                        samples.push(sample);
                    }
                }
                Ok(samples)
            }
        }
    }
}

fn days_inclusive(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    // Cap backfills at 31 days per request.
    while day <= end && days.len() < 31 {
        days.push(day);
        day += chrono::Duration::days(1);
    }
    days
}

fn day_start(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    tz.from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc())
}

fn parse_heart_intraday(
    body: &FitbitHeartResponse,
    start_date: NaiveDate,
    tz: Tz,
) -> Vec<RawHealthSample> {
    let Some(intraday) = &body.intraday else {
        return Vec::new();
    };
    intraday
        .dataset
        .iter()
        .filter_map(|point| {
            let time = NaiveTime::parse_from_str(&point.time, "%H:%M:%S").ok()?;
            let at = tz
                .from_local_datetime(&start_date.and_time(time))
                .earliest()?
                .with_timezone(&Utc);
            Some(RawHealthSample::HeartRate {
                at,
                bpm: point.value,
                motion: None,
            })
        })
        .collect()
}

fn parse_resting_heart(body: &FitbitHeartResponse, tz: Tz) -> Vec<RawHealthSample> {
    body.activities_heart
        .iter()
        .filter_map(|day| {
            let date = NaiveDate::parse_from_str(&day.date_time, "%Y-%m-%d").ok()?;
            Some(RawHealthSample::RestingHeartRate {
                at: day_start(date, tz),
                bpm: day.value.resting_heart_rate?,
            })
        })
        .collect()
}

fn parse_hrv(body: &FitbitHrvResponse, tz: Tz) -> Vec<RawHealthSample> {
    body.hrv
        .iter()
        .filter_map(|day| {
            let date = NaiveDate::parse_from_str(&day.date_time, "%Y-%m-%d").ok()?;
            Some(RawHealthSample::Hrv {
                at: day_start(date, tz),
                rmssd_ms: day.value.daily_rmssd?,
            })
        })
        .collect()
}

fn parse_spo2(body: &[FitbitSpo2Day], tz: Tz) -> Vec<RawHealthSample> {
    body.iter()
        .filter_map(|day| {
            let date = NaiveDate::parse_from_str(&day.date_time, "%Y-%m-%d").ok()?;
            Some(RawHealthSample::BloodOxygen {
                at: day_start(date, tz),
                percentage: day.value.avg?,
            })
        })
        .collect()
}

fn parse_sleep(body: &FitbitSleepResponse, tz: Tz) -> Vec<RawHealthSample> {
    let mut samples = Vec::new();
    for session in &body.sleep {
        let Some(levels) = &session.levels else {
            continue;
        };
        for segment in &levels.data {
            let Some(start) = parse_fitbit_local(&segment.date_time, tz) else {
                continue;
            };
            let Some(stage) = parse_level(&segment.level) else {
                continue;
            };
            samples.push(RawHealthSample::SleepStageSegment {
                start,
                end: start + chrono::Duration::seconds(segment.seconds),
                stage,
            });
        }
    }
    samples
}

// Fitbit reports timestamps in the member's local time without an offset;
// resolve them against the device timezone so stored instants are true UTC.
fn parse_fitbit_local(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f").ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_level(level: &str) -> Option<SleepStage> {
    match level {
        "wake" | "awake" | "restless" => Some(SleepStage::Awake),
        "light" | "asleep" => Some(SleepStage::Light),
        "deep" => Some(SleepStage::Deep),
        "rem" => Some(SleepStage::Rem),
        _ => None,
    }
}

fn parse_activity_day(
    body: &FitbitActivityResponse,
    date: NaiveDate,
    tz: Tz,
) -> Option<RawHealthSample> {
    let summary = body.summary.as_ref()?;
    let distance_km = summary
        .distances
        .iter()
        .find(|d| d.activity == "total")
        .map(|d| d.distance)
        .unwrap_or(0.0);
    Some(RawHealthSample::Activity {
        at: day_start(date, tz),
        steps: summary.steps,
        distance_meters: distance_km * 1000.0,
        calories: summary.calories_out,
        floors: summary.floors,
    })
}

// Fitbit Web API response structures

#[derive(Debug, Deserialize)]
struct FitbitTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FitbitHeartResponse {
    #[serde(rename = "activities-heart", default)]
    activities_heart: Vec<FitbitHeartDay>,
    #[serde(rename = "activities-heart-intraday")]
    intraday: Option<FitbitIntraday>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitHeartDay {
    date_time: String,
    value: FitbitHeartValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitHeartValue {
    resting_heart_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FitbitIntraday {
    #[serde(default)]
    dataset: Vec<FitbitIntradayPoint>,
}

#[derive(Debug, Deserialize)]
struct FitbitIntradayPoint {
    time: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct FitbitHrvResponse {
    #[serde(default)]
    hrv: Vec<FitbitHrvDay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitHrvDay {
    date_time: String,
    value: FitbitHrvValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitHrvValue {
    daily_rmssd: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitSpo2Day {
    date_time: String,
    value: FitbitSpo2Value,
}

#[derive(Debug, Deserialize)]
struct FitbitSpo2Value {
    avg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FitbitSleepResponse {
    #[serde(default)]
    sleep: Vec<FitbitSleepSession>,
}

#[derive(Debug, Deserialize)]
struct FitbitSleepSession {
    levels: Option<FitbitSleepLevels>,
}

#[derive(Debug, Deserialize)]
struct FitbitSleepLevels {
    #[serde(default)]
    data: Vec<FitbitSleepSegment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitSleepSegment {
    date_time: String,
    level: String,
    seconds: i64,
}

#[derive(Debug, Deserialize)]
struct FitbitActivityResponse {
    summary: Option<FitbitActivitySummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitbitActivitySummary {
    #[serde(default)]
    steps: u64,
    #[serde(default)]
    calories_out: f64,
    #[serde(default)]
    floors: u32,
    #[serde(default)]
    distances: Vec<FitbitDistance>,
}

#[derive(Debug, Deserialize)]
struct FitbitDistance {
    activity: String,
    distance: f64,
}
