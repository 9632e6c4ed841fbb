//! Round-trip statistics shaped for operators.
//!
//! Values are computed by the proxying engine from live traffic; the store
//! only defines their shape and the derived ratios.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Quantiles reported unless the caller asks for a different set.
pub const DEFAULT_QUANTILES: [f64; 5] = [50.0, 75.0, 95.0, 99.0, 99.9];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCode {
    pub code: u16,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    /// Window the counters cover
    #[serde(with = "duration_text")]
    pub period: Duration,
    pub net_errors: u64,
    pub total: u64,
    pub status_codes: Vec<StatusCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub quantile: f64,
    #[serde(with = "duration_text")]
    pub value: Duration,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LatencyBrackets(pub Vec<Bracket>);

impl LatencyBrackets {
    /// Build brackets from a histogram accessor returning microseconds at a quantile.
    pub fn from_histogram(value_at_quantile: impl Fn(f64) -> u64) -> Self {
        Self::from_histogram_with(&DEFAULT_QUANTILES, value_at_quantile)
    }

    pub fn from_histogram_with(quantiles: &[f64], value_at_quantile: impl Fn(f64) -> u64) -> Self {
        Self(
            quantiles
                .iter()
                .map(|&quantile| Bracket {
                    quantile,
                    value: Duration::from_micros(value_at_quantile(quantile)),
                })
                .collect(),
        )
    }

    pub fn quantile(&self, q: f64) -> Option<&Bracket> {
        self.0.iter().find(|b| b.quantile == q)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Verdict {
    pub is_bad: bool,
    pub anomalies: Vec<Anomaly>,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let anomalies: Vec<String> = self.anomalies.iter().map(ToString::to_string).collect();
        write!(
            f,
            "verdict[bad={}, anomalies=[{}]]",
            self.is_bad,
            anomalies.join(", ")
        )
    }
}

/// Real time performance of an endpoint, upstream or location.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundTripStats {
    pub verdict: Verdict,
    pub counters: Counters,
    pub latency_brackets: LatencyBrackets,
}

impl RoundTripStats {
    /// Share of requests that failed with network errors (timeouts, dropped connections).
    pub fn net_error_ratio(&self) -> f64 {
        if self.counters.total == 0 {
            return 0.0;
        }
        self.counters.net_errors as f64 / self.counters.total as f64
    }

    /// Ratio of 500 responses to 2xx responses. Other error codes are ignored
    /// to keep the signal free of client noise.
    pub fn app_error_ratio(&self) -> f64 {
        self.response_code_ratio(500..501, 200..300)
    }

    /// `count(a) / count(b)` over the recorded status codes, 0 when `b` is empty.
    pub fn response_code_ratio(
        &self,
        a: std::ops::Range<u16>,
        b: std::ops::Range<u16>,
    ) -> f64 {
        let (mut in_a, mut in_b) = (0u64, 0u64);
        for status in &self.counters.status_codes {
            if a.contains(&status.code) {
                in_a += status.count;
            }
            if b.contains(&status.code) {
                in_b += status.count;
            }
        }
        if in_b == 0 {
            return 0.0;
        }
        in_a as f64 / in_b as f64
    }

    pub fn requests_per_second(&self) -> f64 {
        let seconds = self.counters.period.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.counters.total as f64 / seconds
    }
}

impl fmt::Display for RoundTripStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} requests/sec, {:.2} failures/sec",
            self.requests_per_second(),
            self.net_error_ratio()
        )
    }
}

/// Durations rendered as human readable strings (`"1m 30s"`).
mod duration_text {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> RoundTripStats {
        RoundTripStats {
            counters: Counters {
                period: Duration::from_secs(10),
                net_errors: 10,
                total: 100,
                status_codes: vec![
                    StatusCode { code: 200, count: 40 },
                    StatusCode { code: 201, count: 10 },
                    StatusCode { code: 404, count: 30 },
                    StatusCode { code: 500, count: 10 },
                ],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_ratios() {
        let s = stats();
        assert_eq!(s.net_error_ratio(), 0.1);
        assert_eq!(s.app_error_ratio(), 0.2);
        assert_eq!(s.response_code_ratio(400..500, 200..300), 0.6);
        assert_eq!(s.response_code_ratio(200..300, 300..400), 0.0);
        assert_eq!(s.requests_per_second(), 10.0);
        assert_eq!(s.to_string(), "10.00 requests/sec, 0.10 failures/sec");
    }

    #[test]
    fn test_empty_stats() {
        let s = RoundTripStats::default();
        assert_eq!(s.net_error_ratio(), 0.0);
        assert_eq!(s.app_error_ratio(), 0.0);
        assert_eq!(s.requests_per_second(), 0.0);
    }

    #[test]
    fn test_brackets() {
        let brackets = LatencyBrackets::from_histogram(|q| (q * 10.0) as u64);
        assert_eq!(brackets.0.len(), DEFAULT_QUANTILES.len());
        assert_eq!(
            brackets.quantile(95.0).unwrap().value,
            Duration::from_micros(950)
        );
        assert!(brackets.quantile(42.0).is_none());

        let custom = LatencyBrackets::from_histogram_with(&[90.0], |_| 1_000);
        assert_eq!(custom.quantile(90.0).unwrap().value, Duration::from_millis(1));
    }

    #[test]
    fn test_verdict_display() {
        let v = Verdict {
            is_bad: true,
            anomalies: vec![Anomaly {
                code: 1,
                message: "latency".to_string(),
            }],
        };
        assert_eq!(v.to_string(), "verdict[bad=true, anomalies=[(1) latency]]");
    }
}
