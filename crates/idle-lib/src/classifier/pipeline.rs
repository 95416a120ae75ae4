//! Stage functions and the pipeline that chains them

use crate::models::{Classification, MetricSample, Stage};
use crate::policy::ThresholdProfile;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A metric that kept the instance busy in stage 2
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusyMetric {
    pub metric: &'static str,
    pub value: f64,
    pub threshold: f64,
}

/// Result of running the pipeline over one sample
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationOutcome {
    pub classification: Classification,
    pub stage: Stage,
    /// Start of continuous quiet; `None` unless the sample was quiet
    pub idle_since: Option<DateTime<Utc>>,
    /// Continuous quiet time at this sample
    pub quiet_for_secs: i64,
    pub reason: String,
    pub sample: MetricSample,
}

impl ClassificationOutcome {
    pub fn quiet_minutes(&self) -> i64 {
        self.quiet_for_secs / 60
    }
}

/// Stage 1: number of live interactive sessions, if any
pub fn interactive_sessions(sample: &MetricSample) -> Option<u32> {
    (sample.interactive_sessions > 0).then_some(sample.interactive_sessions)
}

/// Stage 2: every non-session metric at or above its threshold.
///
/// Metrics are OR-ed; a missing GPU reading is ignored.
pub fn background_work(sample: &MetricSample, profile: &ThresholdProfile) -> Vec<BusyMetric> {
    let mut checks = vec![
        ("cpu", sample.cpu_percent, profile.cpu_percent),
        ("memory", sample.memory_percent, profile.memory_percent),
        ("network", sample.network_kbps, profile.network_kbps),
        ("disk", sample.disk_kbps, profile.disk_kbps),
    ];
    if let Some(gpu) = sample.gpu_percent {
        checks.push(("gpu", gpu, profile.gpu_percent));
    }

    checks
        .into_iter()
        .filter(|(_, value, threshold)| value >= threshold)
        .map(|(metric, value, threshold)| BusyMetric {
            metric,
            value,
            threshold,
        })
        .collect()
}

/// Stage 3: quiet start and elapsed quiet time.
///
/// A prior `idle_since` is kept as-is; elapsed time is clamped to zero when
/// it lies in the future of `now` (clock skew between writers).
pub fn sustained_quiet(
    prior_idle_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Duration) {
    let since = prior_idle_since.unwrap_or(now);
    let elapsed = (now - since).max(Duration::zero());
    (since, elapsed)
}

/// Run the pipeline over one sample.
///
/// `prior_idle_since` is the start of the current quiet episode as last
/// recorded in the state store, or `None` when the instance was active.
pub fn classify(
    sample: &MetricSample,
    profile: &ThresholdProfile,
    prior_idle_since: Option<DateTime<Utc>>,
) -> ClassificationOutcome {
    if let Some(sessions) = interactive_sessions(sample) {
        return ClassificationOutcome {
            classification: Classification::Active,
            stage: Stage::InteractiveSession,
            idle_since: None,
            quiet_for_secs: 0,
            reason: format!("{} interactive session(s)", sessions),
            sample: sample.clone(),
        };
    }

    let busy = background_work(sample, profile);
    if !busy.is_empty() {
        let reason = busy
            .iter()
            .map(|b| format!("{} {:.1} >= {:.1}", b.metric, b.value, b.threshold))
            .collect::<Vec<_>>()
            .join(", ");
        return ClassificationOutcome {
            classification: Classification::Working,
            stage: Stage::BackgroundWork,
            idle_since: None,
            quiet_for_secs: 0,
            reason: format!("background work: {}", reason),
            sample: sample.clone(),
        };
    }

    let (since, elapsed) = sustained_quiet(prior_idle_since, sample.timestamp);
    let required = i64::try_from(profile.idle_minutes)
        .ok()
        .and_then(Duration::try_minutes);
    let classification = if required.is_some_and(|required| elapsed >= required) {
        Classification::IdleConfirmed
    } else {
        Classification::IdleCandidate
    };

    ClassificationOutcome {
        classification,
        stage: Stage::SustainedQuiet,
        idle_since: Some(since),
        quiet_for_secs: elapsed.num_seconds(),
        reason: format!(
            "quiet for {}m of {}m",
            elapsed.num_minutes(),
            profile.idle_minutes
        ),
        sample: sample.clone(),
    }
}
