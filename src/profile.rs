use crate::query::Datum;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEvent {
    pub description: String,
    #[serde(rename = "duration(ms)")]
    pub duration_ms: f64,
    pub sub_tasks: Vec<ProfileEvent>,
}

/// Events recorded while serving one request for a profiled query.
#[derive(Debug, Clone, Default)]
pub struct ProfileTrace {
    events: Vec<ProfileEvent>,
}

pub fn maybe_make_profile_trace(profile: bool) -> Option<ProfileTrace> {
    profile.then(ProfileTrace::new)
}

impl ProfileTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, description: impl Into<String>, duration: Duration) {
        self.events.push(ProfileEvent {
            description: description.into(),
            duration_ms: duration.as_secs_f64() * 1_000.0,
            sub_tasks: Vec::new(),
        });
    }

    pub fn record_since(&mut self, description: impl Into<String>, started: Instant) {
        self.record(description, started.elapsed());
    }

    pub fn events(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn as_datum(&self) -> Datum {
        serde_json::to_value(&self.events).unwrap_or(Datum::Array(Vec::new()))
    }
}
