//! Withings pull adapter.
//!
//! Withings wraps every response in a `{"status": N, "body": {...}}` envelope
//! where a non-zero status is an application-level failure even when the HTTP
//! status is 200. Measure values are scaled as `value * 10^unit`.

use crate::config::OauthClientConfig;
use crate::error::IngestError;
use crate::types::{MetricType, ProviderKind, RawHealthSample, SleepStage, TokenSet};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::PullProvider;

const DEFAULT_API_BASE: &str = "https://wbsapi.withings.net";
const AUTHORIZE_URL: &str = "https://account.withings.com/oauth2_user/authorize2";
const SCOPES: &str = "user.metrics,user.activity";

const MEASTYPE_HEART_RATE: i64 = 11;
const MEASTYPE_SPO2: i64 = 54;

const SUPPORTED: [MetricType; 4] = [
    MetricType::HeartRate,
    MetricType::BloodOxygen,
    MetricType::SleepSession,
    MetricType::ActivityDay,
];

pub struct WithingsAdapter {
    cfg: OauthClientConfig,
    client: reqwest::Client,
}

impl WithingsAdapter {
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

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: Option<&str>,
        params: &[(&str, String)],
    ) -> Result<T, IngestError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.api_base(), path))
            .form(params);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: format!("withings {path} returned an HTTP error"),
            });
        }

        let envelope: WithingsEnvelope<T> = response.json().await?;
        if envelope.status != 0 {
            return Err(IngestError::ProviderApi {
                status: status.as_u16(),
                message: format!(
                    "withings {path} returned application status {}",
                    envelope.status
                ),
            });
        }
        envelope.body.ok_or_else(|| {
            IngestError::Parse(format!("withings {path} response missing body"))
        })
    }

    async fn token_request(&self, params: &[(&str, String)]) -> Result<TokenSet, IngestError> {
        let body: WithingsTokenBody = self.call("/v2/oauth2", None, params).await?;
        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: Some(body.refresh_token),
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

#[async_trait]
impl PullProvider for WithingsAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Withings
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
            .append_pair("state", state);
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("action", "requesttoken".to_string()),
            ("grant_type", "authorization_code".to_string()),
            ("client_id", self.cfg.client_id.clone()),
            ("client_secret", self.cfg.client_secret.clone()),
            ("code", code.to_string()),
            ("redirect_uri", self.cfg.redirect_uri.clone()),
        ])
        .await
        .map_err(|e| IngestError::TokenExchange(e.to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError> {
        self.token_request(&[
            ("action", "requesttoken".to_string()),
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.cfg.client_id.clone()),
            ("client_secret", self.cfg.client_secret.clone()),
            ("refresh_token", refresh_token.to_string()),
        ])
        .await
        .map_err(|e| IngestError::TokenRefresh(e.to_string()))
    }

    async fn revoke(&self, access_token: &str) -> Result<bool, IngestError> {
        let result: Result<serde_json::Value, _> = self
            .call(
                "/v2/oauth2",
                Some(access_token),
                &[("action", "revoke".to_string())],
            )
            .await;
        Ok(result.is_ok())
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
            MetricType::HeartRate => self.fetch_measures(access_token, MEASTYPE_HEART_RATE, start, end).await,
            MetricType::BloodOxygen => self.fetch_measures(access_token, MEASTYPE_SPO2, start, end).await,
            MetricType::SleepSession => self.fetch_sleep(access_token, start, end).await,
            MetricType::ActivityDay => self.fetch_activity(access_token, start, end).await,
            MetricType::Hrv | MetricType::RestingHeartRate => {
                Err(IngestError::UnsupportedMetric {
                    provider: ProviderKind::Withings,
                    metric,
                })
            }
        }
    }
}

impl WithingsAdapter {
    async fn fetch_measures(
        &self,
        access_token: &str,
        meastype: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawHealthSample>, IngestError> {
        let body: WithingsMeasureBody = self
            .call(
                "/measure",
                Some(access_token),
                &[
                    ("action", "getmeas".to_string()),
                    ("meastypes", meastype.to_string()),
                    ("startdate", start.timestamp().to_string()),
                    ("enddate", end.timestamp().to_string()),
                ],
            )
            .await?;

        let mut samples = Vec::new();
        for group in body.measuregrps {
            let Some(at) = Utc.timestamp_opt(group.date, 0).single() else {
                continue;
            };
            for measure in group.measures {
                if measure.measure_type != meastype {
                    continue;
                }
                let value = measure.value as f64 * 10f64.powi(measure.unit);
                let sample = match meastype {
                    MEASTYPE_HEART_RATE => RawHealthSample::HeartRate {
                        at,
                        bpm: value,
                        motion: None,
                    },
                    MEASTYPE_SPO2 => RawHealthSample::BloodOxygen {
                        at,
                        percentage: value,
                    },
                    _ => continue,
                };
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    async fn fetch_sleep(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawHealthSample>, IngestError> {
        let body: WithingsSleepBody = self
            .call(
                "/v2/sleep",
                Some(access_token),
                &[
                    ("action", "get".to_string()),
                    ("startdate", start.timestamp().to_string()),
                    ("enddate", end.timestamp().to_string()),
                ],
            )
            .await?;

        let mut samples = Vec::new();
        for segment in body.series {
            let (Some(seg_start), Some(seg_end)) = (
                Utc.timestamp_opt(segment.startdate, 0).single(),
                Utc.timestamp_opt(segment.enddate, 0).single(),
            ) else {
                continue;
            };
            let Some(stage) = parse_sleep_state(segment.state) else {
                continue;
            };
            samples.push(RawHealthSample::SleepStageSegment {
                start: seg_start,
                end: seg_end,
                stage,
            });
        }
        Ok(samples)
    }

    async fn fetch_activity(
        &self,
        access_token: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawHealthSample>, IngestError> {
        let body: WithingsActivityBody = self
            .call(
                "/v2/measure",
                Some(access_token),
                &[
                    ("action", "getactivity".to_string()),
                    ("startdateymd", start.date_naive().to_string()),
                    ("enddateymd", end.date_naive().to_string()),
                ],
            )
            .await?;

        let mut samples = Vec::new();
        for day in body.activities {
            let Ok(date) = day.date.parse::<NaiveDate>() else {
                continue;
            };
            samples.push(RawHealthSample::Activity {
                at: date.and_time(chrono::NaiveTime::MIN).and_utc(),
                steps: day.steps,
                distance_meters: day.distance,
                calories: day.calories,
                floors: 0,
            });
        }
        Ok(samples)
    }
}

// Withings sleep series state codes.
fn parse_sleep_state(state: i64) -> Option<SleepStage> {
    match state {
        0 => Some(SleepStage::Awake),
        1 => Some(SleepStage::Light),
        2 => Some(SleepStage::Deep),
        3 => Some(SleepStage::Rem),
        _ => None,
    }
}

// Withings response structures

#[derive(Debug, Deserialize)]
struct WithingsEnvelope<T> {
    status: i64,
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WithingsTokenBody {
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WithingsMeasureBody {
    #[serde(default)]
    measuregrps: Vec<WithingsMeasureGroup>,
}

#[derive(Debug, Deserialize)]
struct WithingsMeasureGroup {
    date: i64,
    #[serde(default)]
    measures: Vec<WithingsMeasure>,
}

#[derive(Debug, Deserialize)]
struct WithingsMeasure {
    value: i64,
    unit: i32,
    #[serde(rename = "type")]
    measure_type: i64,
}

#[derive(Debug, Deserialize)]
struct WithingsSleepBody {
    #[serde(default)]
    series: Vec<WithingsSleepSegment>,
}

#[derive(Debug, Deserialize)]
struct WithingsSleepSegment {
    startdate: i64,
    enddate: i64,
    state: i64,
}

#[derive(Debug, Deserialize)]
struct WithingsActivityBody {
    #[serde(default)]
    activities: Vec<WithingsActivityDay>,
}

#[derive(Debug, Deserialize)]
struct WithingsActivityDay {
    date: String,
    #[serde(default)]
    steps: u64,
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    calories: f64,
}
