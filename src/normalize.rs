//! Normalizer: raw provider samples to canonical samples.
//!
//! Point metrics map one-to-one. Sleep stage segments are chained into
//! sessions (gap under 60 minutes continues a session) and scored; activity
//! deltas are rolled up per local calendar day. Day bucketing uses the
//! device's IANA timezone so a session that crosses midnight UTC still lands
//! on the night it belongs to.

use crate::error::IngestError;
use crate::types::{
    ActivityDetail, Bucket, CanonicalSample, MetricType, MotionContext, RawHealthSample,
    SampleContext, SampleDetail, SleepDetail, SleepStage,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// A sleep gap shorter than this continues the current session.
const SESSION_GAP_MINUTES: i64 = 60;

/// Night-time hours (local): [22:00, 06:00). Heart-rate samples without
/// motion metadata in this window are tagged as sleep context.
const NIGHT_START_HOUR: u32 = 22;
const NIGHT_END_HOUR: u32 = 6;

pub struct Normalizer {
    patient_id: String,
    device_id: String,
    tz: Tz,
}

impl Normalizer {
    pub fn new(
        patient_id: impl Into<String>,
        device_id: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, IngestError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| IngestError::InvalidTimezone(timezone.to_string()))?;
        Ok(Self {
            patient_id: patient_id.into(),
            device_id: device_id.into(),
            tz,
        })
    }

    /// Normalize a raw batch into canonical samples. Point samples pass
    /// through individually; sleep segments and activity deltas from the
    /// whole batch are grouped before emission.
    pub fn normalize(&self, raw: Vec<RawHealthSample>) -> Vec<CanonicalSample> {
        let mut out = Vec::new();
        let mut sleep_segments = Vec::new();
        let mut activity_days: BTreeMap<NaiveDate, ActivityDetail> = BTreeMap::new();

        for sample in raw {
            match sample {
                RawHealthSample::HeartRate { at, bpm, motion } => {
                    out.push(self.point(MetricType::HeartRate, at, bpm, self.hr_context(at, motion)));
                }
                RawHealthSample::RestingHeartRate { at, bpm } => {
                    out.push(self.point(
                        MetricType::RestingHeartRate,
                        at,
                        bpm,
                        Some(SampleContext::Resting),
                    ));
                }
                RawHealthSample::Hrv { at, rmssd_ms } => {
                    out.push(self.point(MetricType::Hrv, at, rmssd_ms, None));
                }
                RawHealthSample::BloodOxygen { at, percentage } => {
                    out.push(self.point(MetricType::BloodOxygen, at, percentage, None));
                }
                RawHealthSample::SleepStageSegment { start, end, stage } => {
                    if end > start {
                        sleep_segments.push(Segment { start, end, stage });
                    }
                }
                RawHealthSample::Activity {
                    at,
                    steps,
                    distance_meters,
                    calories,
                    floors,
                } => {
                    let day = at.with_timezone(&self.tz).date_naive();
                    let rollup = activity_days.entry(day).or_insert(ActivityDetail {
                        steps: 0,
                        distance_meters: 0.0,
                        calories: 0.0,
                        floors: 0,
                    });
                    rollup.steps += steps;
                    rollup.distance_meters += distance_meters;
                    rollup.calories += calories;
                    rollup.floors += floors;
                }
            }
        }

        for session in build_sessions(sleep_segments) {
            out.push(self.sleep_sample(session));
        }

        for (day, detail) in activity_days {
            out.push(self.activity_sample(day, detail));
        }

        out
    }

    fn point(
        &self,
        metric: MetricType,
        at: DateTime<Utc>,
        value: f64,
        context: Option<SampleContext>,
    ) -> CanonicalSample {
        CanonicalSample {
            patient_id: self.patient_id.clone(),
            device_id: self.device_id.clone(),
            metric,
            bucket: Bucket::Point(at),
            start: at,
            end: None,
            value,
            unit: metric.unit(),
            context,
            detail: None,
        }
    }

    /// Motion metadata wins; without it, night-time local hours imply sleep.
    fn hr_context(&self, at: DateTime<Utc>, motion: Option<MotionContext>) -> Option<SampleContext> {
        match motion {
            Some(MotionContext::Stationary) => Some(SampleContext::Resting),
            Some(MotionContext::Moving) => Some(SampleContext::Active),
            Some(MotionContext::Workout) => Some(SampleContext::Workout),
            None => {
                use chrono::Timelike;
                let hour = at.with_timezone(&self.tz).hour();
                if hour >= NIGHT_START_HOUR || hour < NIGHT_END_HOUR {
                    Some(SampleContext::Sleep)
                } else {
                    None
                }
            }
        }
    }

    fn sleep_sample(&self, session: Session) -> CanonicalSample {
        let detail = score_session(&session);
        // A session belongs to the local date it started on.
        let day = session.start.with_timezone(&self.tz).date_naive();
        CanonicalSample {
            patient_id: self.patient_id.clone(),
            device_id: self.device_id.clone(),
            metric: MetricType::SleepSession,
            bucket: Bucket::Day(day),
            start: session.start,
            end: Some(session.end),
            value: detail.total_asleep_minutes,
            unit: MetricType::SleepSession.unit(),
            context: Some(SampleContext::Sleep),
            detail: Some(SampleDetail::Sleep(detail)),
        }
    }

    fn activity_sample(&self, day: NaiveDate, detail: ActivityDetail) -> CanonicalSample {
        let start = self
            .tz
            .from_local_datetime(&day.and_time(chrono::NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| day.and_time(chrono::NaiveTime::MIN).and_utc());
        CanonicalSample {
            patient_id: self.patient_id.clone(),
            device_id: self.device_id.clone(),
            metric: MetricType::ActivityDay,
            bucket: Bucket::Day(day),
            start,
            end: None,
            value: detail.steps as f64,
            unit: MetricType::ActivityDay.unit(),
            context: None,
            detail: Some(SampleDetail::Activity(detail)),
        }
    }
}

#[derive(Debug, Clone)]
struct Segment {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stage: SleepStage,
}

#[derive(Debug)]
struct Session {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    segments: Vec<Segment>,
}

/// Chain stage segments into sessions. Segments are sorted by start time; a
/// gap of SESSION_GAP_MINUTES or more closes the current session.
fn build_sessions(mut segments: Vec<Segment>) -> Vec<Session> {
    if segments.is_empty() {
        return Vec::new();
    }
    segments.sort_by_key(|s| s.start);

    let mut sessions: Vec<Session> = Vec::new();
    for segment in segments {
        match sessions.last_mut() {
            Some(current)
                if (segment.start - current.end).num_minutes() < SESSION_GAP_MINUTES =>
            {
                current.end = current.end.max(segment.end);
                current.segments.push(segment);
            }
            _ => sessions.push(Session {
                start: segment.start,
                end: segment.end,
                segments: vec![segment],
            }),
        }
    }
    sessions
}

/// Score a session: a 50-point base, plus bonuses for total duration and for
/// deep and REM ratios falling in healthy bands, clamped to [0, 100].
fn score_session(session: &Session) -> SleepDetail {
    let mut awake = 0.0;
    let mut light = 0.0;
    let mut deep = 0.0;
    let mut rem = 0.0;

    for segment in &session.segments {
        let minutes = (segment.end - segment.start).num_seconds() as f64 / 60.0;
        match segment.stage {
            SleepStage::Awake => awake += minutes,
            SleepStage::Light => light += minutes,
            SleepStage::Deep => deep += minutes,
            SleepStage::Rem => rem += minutes,
        }
    }

    let total_asleep = light + deep + rem;
    let mut score: f64 = 50.0;

    if (420.0..=540.0).contains(&total_asleep) {
        score += 20.0;
    } else if (360.0..=600.0).contains(&total_asleep) {
        score += 10.0;
    }

    if total_asleep > 0.0 {
        let deep_ratio = deep / total_asleep;
        if (0.15..=0.25).contains(&deep_ratio) {
            score += 12.0;
        } else if (0.10..=0.30).contains(&deep_ratio) {
            score += 6.0;
        }

        let rem_ratio = rem / total_asleep;
        if (0.20..=0.30).contains(&rem_ratio) {
            score += 12.0;
        } else if (0.15..=0.35).contains(&rem_ratio) {
            score += 6.0;
        }
    }

    SleepDetail {
        awake_minutes: awake,
        light_minutes: light,
        deep_minutes: deep,
        rem_minutes: rem,
        total_asleep_minutes: total_asleep,
        score: score.clamp(0.0, 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn normalizer(tz: &str) -> Normalizer {
        Normalizer::new("patient-1", "device-1", tz).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        assert!(Normalizer::new("p", "d", "Mars/Olympus").is_err());
    }

    #[test]
    fn test_heart_rate_motion_context_wins() {
        let n = normalizer("UTC");
        // 23:00 UTC would be night, but motion metadata takes precedence.
        let samples = n.normalize(vec![RawHealthSample::HeartRate {
            at: utc("2024-03-01T23:00:00Z"),
            bpm: 110.0,
            motion: Some(MotionContext::Workout),
        }]);
        assert_eq!(samples[0].context, Some(SampleContext::Workout));
    }

    #[test]
    fn test_heart_rate_night_heuristic_uses_device_timezone() {
        // 23:30 in New York is 04:30 UTC next day.
        let n = normalizer("America/New_York");
        let samples = n.normalize(vec![RawHealthSample::HeartRate {
            at: utc("2024-03-02T04:30:00Z"),
            bpm: 52.0,
            motion: None,
        }]);
        assert_eq!(samples[0].context, Some(SampleContext::Sleep));

        // Same instant interpreted as UTC is also night, but noon is not.
        let noon = n.normalize(vec![RawHealthSample::HeartRate {
            at: utc("2024-03-02T17:00:00Z"),
            bpm: 70.0,
            motion: None,
        }]);
        assert_eq!(noon[0].context, None);
    }

    #[test]
    fn test_point_metrics_bucket_on_timestamp() {
        let n = normalizer("UTC");
        let at = utc("2024-03-01T08:00:00Z");
        let samples = n.normalize(vec![RawHealthSample::Hrv {
            at,
            rmssd_ms: 55.0,
        }]);
        assert_eq!(samples[0].bucket, Bucket::Point(at));
        assert_eq!(samples[0].unit, "ms");
    }

    #[test]
    fn test_sleep_session_chaining_and_score() {
        let n = normalizer("UTC");
        // 90 deep + 110 rem + 260 light + 20 awake, contiguous from 23:00.
        let samples = n.normalize(vec![
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-01T23:00:00Z"),
                end: utc("2024-03-02T00:30:00Z"),
                stage: SleepStage::Deep,
            },
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-02T00:30:00Z"),
                end: utc("2024-03-02T02:20:00Z"),
                stage: SleepStage::Rem,
            },
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-02T02:20:00Z"),
                end: utc("2024-03-02T06:40:00Z"),
                stage: SleepStage::Light,
            },
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-02T06:40:00Z"),
                end: utc("2024-03-02T07:00:00Z"),
                stage: SleepStage::Awake,
            },
        ]);

        assert_eq!(samples.len(), 1);
        let sample = &samples[0];
        assert_eq!(sample.metric, MetricType::SleepSession);
        // Session started 2024-03-01 local, so it belongs to that night.
        assert_eq!(sample.bucket, Bucket::Day("2024-03-01".parse().unwrap()));
        assert_eq!(sample.value, 460.0);
        match sample.detail.as_ref().unwrap() {
            SampleDetail::Sleep(detail) => {
                assert_eq!(detail.deep_minutes, 90.0);
                assert_eq!(detail.rem_minutes, 110.0);
                assert_eq!(detail.light_minutes, 260.0);
                assert_eq!(detail.awake_minutes, 20.0);
                // 50 base + 20 duration + 12 deep ratio + 12 rem ratio
                assert_eq!(detail.score, 94.0);
            }
            other => panic!("expected sleep detail, got {other:?}"),
        }
    }

    #[test]
    fn test_sleep_gap_splits_sessions() {
        let n = normalizer("UTC");
        let samples = n.normalize(vec![
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-01T13:00:00Z"),
                end: utc("2024-03-01T14:00:00Z"),
                stage: SleepStage::Light,
            },
            // Gap of 9 hours: a separate session (the night sleep).
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-01T23:00:00Z"),
                end: utc("2024-03-02T05:00:00Z"),
                stage: SleepStage::Light,
            },
        ]);
        // Both sessions start on the same local date so the night session
        // overwrites the nap under the same day key only after storage; here
        // both are emitted.
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_short_gap_continues_session() {
        let n = normalizer("UTC");
        let samples = n.normalize(vec![
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-01T23:00:00Z"),
                end: utc("2024-03-02T01:00:00Z"),
                stage: SleepStage::Light,
            },
            // 30 minute gap: same session.
            RawHealthSample::SleepStageSegment {
                start: utc("2024-03-02T01:30:00Z"),
                end: utc("2024-03-02T05:00:00Z"),
                stage: SleepStage::Deep,
            },
        ]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].end, Some(utc("2024-03-02T05:00:00Z")));
    }

    #[test]
    fn test_score_stays_in_bounds() {
        let n = normalizer("UTC");
        // Tiny, awful sleep: no bonuses apply.
        let bad = n.normalize(vec![RawHealthSample::SleepStageSegment {
            start: utc("2024-03-01T23:00:00Z"),
            end: utc("2024-03-01T23:30:00Z"),
            stage: SleepStage::Light,
        }]);
        match bad[0].detail.as_ref().unwrap() {
            SampleDetail::Sleep(detail) => {
                assert!(detail.score >= 0.0 && detail.score <= 100.0);
                assert_eq!(detail.score, 50.0);
            }
            other => panic!("expected sleep detail, got {other:?}"),
        }
    }

    #[test]
    fn test_activity_rollup_sums_deltas() {
        let n = normalizer("UTC");
        let samples = n.normalize(vec![
            RawHealthSample::Activity {
                at: utc("2024-03-01T09:00:00Z"),
                steps: 1000,
                distance_meters: 800.0,
                calories: 40.0,
                floors: 2,
            },
            RawHealthSample::Activity {
                at: utc("2024-03-01T15:00:00Z"),
                steps: 2500,
                distance_meters: 2000.0,
                calories: 110.0,
                floors: 3,
            },
            // Different day, separate rollup.
            RawHealthSample::Activity {
                at: utc("2024-03-02T10:00:00Z"),
                steps: 400,
                distance_meters: 300.0,
                calories: 15.0,
                floors: 0,
            },
        ]);

        assert_eq!(samples.len(), 2);
        let day1 = &samples[0];
        assert_eq!(day1.bucket, Bucket::Day("2024-03-01".parse().unwrap()));
        assert_eq!(day1.value, 3500.0);
        match day1.detail.as_ref().unwrap() {
            SampleDetail::Activity(detail) => {
                assert_eq!(detail.steps, 3500);
                assert_eq!(detail.distance_meters, 2800.0);
                assert_eq!(detail.calories, 150.0);
                assert_eq!(detail.floors, 5);
            }
            other => panic!("expected activity detail, got {other:?}"),
        }
    }

    #[test]
    fn test_activity_day_uses_device_timezone() {
        // 01:00 UTC on March 2 is still March 1 in Los Angeles.
        let n = normalizer("America/Los_Angeles");
        let samples = n.normalize(vec![RawHealthSample::Activity {
            at: utc("2024-03-02T01:00:00Z"),
            steps: 500,
            distance_meters: 0.0,
            calories: 0.0,
            floors: 0,
        }]);
        assert_eq!(samples[0].bucket, Bucket::Day("2024-03-01".parse().unwrap()));
    }

    #[test]
    fn test_zero_length_segment_dropped() {
        let n = normalizer("UTC");
        let at = utc("2024-03-01T23:00:00Z");
        let samples = n.normalize(vec![RawHealthSample::SleepStageSegment {
            start: at,
            end: at,
            stage: SleepStage::Light,
        }]);
        assert!(samples.is_empty());
    }
}
