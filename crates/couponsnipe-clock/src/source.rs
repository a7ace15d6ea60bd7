//! Reference time sources and their payload shapes.
//!
//! Each site reports its server time in a different JSON shape: a numeric
//! epoch, an epoch wrapped in a string, or an ISO-8601 date. The shape is a
//! tagged extraction rule chosen once per source, not re-guessed per call;
//! `Probe` is the explicit generic fallback for unknown endpoints.

use serde::{Deserialize, Serialize};

/// How to pull an epoch-milliseconds timestamp out of a response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TimeShape {
    /// Numeric epoch millis at a dotted field path.
    EpochMillis { field: String },
    /// Epoch millis encoded as a string at a dotted field path.
    EpochMillisString { field: String },
    /// ISO-8601 date string at a dotted field path.
    Iso8601 { field: String },
    /// Probe common field names: `timestamp`, `time`, `currentTime`,
    /// numeric `data`.
    Probe,
}

impl TimeShape {
    /// Extract epoch millis from `payload`, or None when the shape does not
    /// match. Never panics on malformed input.
    pub fn extract(&self, payload: &serde_json::Value) -> Option<i64> {
        match self {
            TimeShape::EpochMillis { field } => json_path(payload, field)?.as_i64(),
            TimeShape::EpochMillisString { field } => {
                json_path(payload, field)?.as_str()?.trim().parse::<i64>().ok()
            }
            TimeShape::Iso8601 { field } => {
                let text = json_path(payload, field)?.as_str()?;
                chrono::DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }
            TimeShape::Probe => {
                for field in ["timestamp", "time", "currentTime"] {
                    if let Some(t) = payload.get(field).and_then(|v| v.as_i64()) {
                        return Some(t);
                    }
                }
                payload.get("data").and_then(|v| v.as_i64())
            }
        }
    }
}

/// Walk a dotted path (`data.t`) into a JSON value.
fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// A reference time endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSource {
    /// Site identifier this source serves (matches `RequestSpec::target_site`).
    pub name: String,
    pub url: String,
    pub shape: TimeShape,
}

impl TimeSource {
    pub fn new(name: &str, url: &str, shape: TimeShape) -> Self {
        Self { name: name.into(), url: url.into(), shape }
    }

    /// Pick the source for a site, falling back to the `default` entry.
    pub fn for_site<'a>(sources: &'a [TimeSource], site: &str) -> Option<&'a TimeSource> {
        sources
            .iter()
            .find(|s| s.name == site)
            .or_else(|| sources.iter().find(|s| s.name == "default"))
    }
}

/// Built-in source table. Sites the original tooling targets, each with its
/// documented payload shape, plus a generic world-time default.
pub fn builtin_sources() -> Vec<TimeSource> {
    vec![
        TimeSource::new(
            "meituan.com",
            "https://cube.meituan.com/ipromotion/cube/toc/component/base/getServerCurrentTime",
            TimeShape::EpochMillis { field: "data".into() },
        ),
        TimeSource::new(
            "taobao.com",
            "http://api.m.taobao.com/rest/api3.do?api=mtop.common.getTimestamp",
            TimeShape::EpochMillisString { field: "data.t".into() },
        ),
        TimeSource::new(
            "jd.com",
            "https://api.m.jd.com/client.action?functionId=queryServerTime",
            TimeShape::EpochMillis { field: "currentTime2".into() },
        ),
        TimeSource::new(
            "default",
            "https://worldtimeapi.org/api/timezone/Etc/UTC",
            TimeShape::Iso8601 { field: "datetime".into() },
        ),
    ]
}
