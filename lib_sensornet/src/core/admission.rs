//! # Admission Policies
//!
//! Each retention buffer has its own predicate deciding whether a decoded
//! record belongs in it. The typical dashboard wiring is:
//!
//! - a **log** buffer with `Unconditional` admission (every node's traffic);
//! - a **graph** buffer with `PlausibilityScoped` admission for the home node,
//!   so sensor glitches never reach the charts while the raw anomaly is still
//!   visible in the log.
//!
//! A rejection is an ordinary outcome, not a failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::{Metric, RawTelemetry, Readings};

/// # Bounds
///
/// Half-open plausibility range: a value is plausible when
/// `min <= value < max`. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Inclusive lower bound.
    pub min: Option<f64>,
    /// Exclusive upper bound.
    pub max: Option<f64>,
}

impl Bounds {
    /// Only an exclusive ceiling.
    pub fn below(max: f64) -> Self {
        Self { min: None, max: Some(max) }
    }

    /// Inclusive floor and exclusive ceiling.
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// `true` when `value` lies inside the range.
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value < max)
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "[{min}, {max})"),
            (Some(min), None) => write!(f, "[{min}, +inf)"),
            (None, Some(max)) => write!(f, "(-inf, {max})"),
            (None, None) => f.write_str("(-inf, +inf)"),
        }
    }
}

/// # Plausibility Bounds
///
/// Per-metric sanity ranges. Metrics without bounds, and metrics a record does
/// not carry, always pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlausibilityBounds {
    limits: BTreeMap<Metric, Bounds>,
}

impl PlausibilityBounds {
    /// No limits at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the range for `metric`.
    pub fn with(mut self, metric: Metric, bounds: Bounds) -> Self {
        self.limits.insert(metric, bounds);
        self
    }

    /// Range configured for `metric`.
    pub fn get(&self, metric: Metric) -> Option<Bounds> {
        self.limits.get(&metric).copied()
    }

    /// `true` when no metric is bounded.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// First implausible reading, if any.
    pub fn check(&self, readings: &Readings) -> Result<(), AdmissionReject> {
        for (metric, bounds) in &self.limits {
            if let Some(value) = readings.get(*metric) {
                if !bounds.contains(value) {
                    return Err(AdmissionReject::Implausible {
                        metric: *metric,
                        value,
                        bounds: *bounds,
                    });
                }
            }
        }
        Ok(())
    }
}

/// # Admission Reject
///
/// Why a well-formed record stayed out of a buffer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionReject {
    /// The buffer only keeps another node's records.
    #[error("origin `{actual}` is not the target `{expected}`")]
    OriginMismatch {
        /// Configured target origin.
        expected: String,
        /// Origin carried by the record.
        actual: String,
    },
    /// A reading is outside its plausibility range.
    #[error("{metric} = {value} outside plausible range {bounds}")]
    Implausible {
        /// Offending metric.
        metric: Metric,
        /// Reported value.
        value: f64,
        /// Configured range.
        bounds: Bounds,
    },
}

/// # Admission Policy
///
/// The predicate attached to one retention buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionPolicy {
    /// Accept everything.
    Unconditional,
    /// Accept only records from `target`.
    OriginScoped {
        /// Origin to keep.
        target: String,
    },
    /// Accept records inside `bounds`, optionally restricted to one origin.
    PlausibilityScoped {
        /// Origin to keep, or any origin when `None`.
        target: Option<String>,
        /// Per-metric sanity ranges.
        bounds: PlausibilityBounds,
    },
}

impl AdmissionPolicy {
    /// Decides whether `record` enters the buffer.
    pub fn admit(&self, record: &RawTelemetry) -> Result<(), AdmissionReject> {
        match self {
            AdmissionPolicy::Unconditional => Ok(()),
            AdmissionPolicy::OriginScoped { target } => check_origin(target, &record.origin_id),
            AdmissionPolicy::PlausibilityScoped { target, bounds } => {
                if let Some(target) = target {
                    check_origin(target, &record.origin_id)?;
                }
                bounds.check(&record.readings)
            }
        }
    }

    /// Origin this policy is restricted to.
    pub fn target(&self) -> Option<&str> {
        match self {
            AdmissionPolicy::Unconditional => None,
            AdmissionPolicy::OriginScoped { target } => Some(target),
            AdmissionPolicy::PlausibilityScoped { target, .. } => target.as_deref(),
        }
    }
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Unconditional => f.write_str("unconditional"),
            AdmissionPolicy::OriginScoped { target } => write!(f, "origin={target}"),
            AdmissionPolicy::PlausibilityScoped { target, bounds } => {
                f.write_str("plausible")?;
                if let Some(target) = target {
                    write!(f, " origin={target}")?;
                }
                for (metric, range) in &bounds.limits {
                    write!(f, " {metric}∈{range}")?;
                }
                Ok(())
            }
        }
    }
}

fn check_origin(expected: &str, actual: &str) -> Result<(), AdmissionReject> {
    if expected == actual {
        Ok(())
    } else {
        Err(AdmissionReject::OriginMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_graph_policy() -> AdmissionPolicy {
        AdmissionPolicy::PlausibilityScoped {
            target: Some("A1".into()),
            bounds: PlausibilityBounds::new().with(Metric::TempC, Bounds::below(150.0)),
        }
    }

    #[test]
    fn unconditional_admits_anything() {
        let policy = AdmissionPolicy::Unconditional;
        assert!(policy.admit(&RawTelemetry::new("B2")).is_ok());
        assert!(policy
            .admit(&RawTelemetry::new("A1").with_metric(Metric::TempC, 999.0))
            .is_ok());
    }

    #[test]
    fn origin_scoped_rejects_other_nodes() {
        let policy = AdmissionPolicy::OriginScoped { target: "A1".into() };
        assert!(policy.admit(&RawTelemetry::new("A1")).is_ok());
        assert_eq!(
            policy.admit(&RawTelemetry::new("B2")),
            Err(AdmissionReject::OriginMismatch {
                expected: "A1".into(),
                actual: "B2".into()
            })
        );
    }

    #[test]
    fn plausibility_ceiling_is_exclusive() {
        let policy = home_graph_policy();
        assert!(policy
            .admit(&RawTelemetry::new("A1").with_metric(Metric::TempC, 23.5))
            .is_ok());
        assert!(policy
            .admit(&RawTelemetry::new("A1").with_metric(Metric::TempC, 149.99))
            .is_ok());
        assert!(matches!(
            policy.admit(&RawTelemetry::new("A1").with_metric(Metric::TempC, 150.0)),
            Err(AdmissionReject::Implausible { metric: Metric::TempC, .. })
        ));
        assert!(policy
            .admit(&RawTelemetry::new("A1").with_metric(Metric::TempC, 999.0))
            .is_err());
    }

    #[test]
    fn plausibility_ignores_missing_metrics() {
        let policy = home_graph_policy();
        assert!(policy.admit(&RawTelemetry::new("A1")).is_ok());
        assert!(policy
            .admit(&RawTelemetry::new("A1").with_metric(Metric::HumidityPer, 300.0))
            .is_ok());
    }

    #[test]
    fn plausibility_checks_origin_first() {
        let policy = home_graph_policy();
        assert!(matches!(
            policy.admit(&RawTelemetry::new("B2").with_metric(Metric::TempC, 20.0)),
            Err(AdmissionReject::OriginMismatch { .. })
        ));
    }

    #[test]
    fn bounds_floor_is_inclusive() {
        let bounds = Bounds::between(0.0, 100.0);
        assert!(bounds.contains(0.0));
        assert!(!bounds.contains(-0.1));
        assert!(!bounds.contains(100.0));
        assert_eq!(bounds.to_string(), "[0, 100)");
    }

    #[test]
    fn policy_describes_itself() {
        assert_eq!(home_graph_policy().to_string(), "plausible origin=A1 Temp_C∈(-inf, 150)");
        assert_eq!(home_graph_policy().target(), Some("A1"));
        assert_eq!(AdmissionPolicy::Unconditional.target(), None);
    }
}
