//! Trace Loss
//!
//! Reduces reference and simulated trace sets to one scalar. Only group keys
//! present on both sides are compared and the per-group distances are
//! averaged, so a run with no comparable group has an infinite loss.

pub mod frame;
mod isolate;
pub mod metrics;

pub use frame::{Frame, FrameError, FrameKind};
pub use isolate::{IsolationError, LossEvaluator, LossWorkerPool};
pub use metrics::GroupDistance;

use job_traces::TraceSet;
use metrics::{Chamfer, EnergyDistance, Hausdorff, MeanRelativeError, RatioError, SlicedWasserstein, SortedError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Selectable loss metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Mre,
    Ratio,
    #[serde(alias = "ddks")]
    Energy,
    Wasserstein,
    Hausdorff,
    Chamfer,
    Sorted,
    Double,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::Mre,
        Metric::Ratio,
        Metric::Energy,
        Metric::Wasserstein,
        Metric::Hausdorff,
        Metric::Chamfer,
        Metric::Sorted,
        Metric::Double,
    ];

    pub fn distance(&self) -> Box<dyn GroupDistance> {
        match self {
            Metric::Mre => Box::new(MeanRelativeError),
            Metric::Ratio => Box::new(RatioError),
            Metric::Energy => Box::new(EnergyDistance),
            Metric::Wasserstein => Box::new(SlicedWasserstein::default()),
            Metric::Hausdorff => Box::new(Hausdorff),
            Metric::Chamfer => Box::new(Chamfer),
            Metric::Sorted => Box::new(SortedError { by_efficiency: false }),
            Metric::Double => Box::new(SortedError { by_efficiency: true }),
        }
    }

    pub fn evaluate(&self, reference: &TraceSet, simulated: &TraceSet) -> LossReport {
        evaluate(self.distance().as_ref(), reference, simulated)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.distance().name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mre" => Ok(Metric::Mre),
            "ratio" => Ok(Metric::Ratio),
            "energy" | "ddks" => Ok(Metric::Energy),
            "wasserstein" => Ok(Metric::Wasserstein),
            "hausdorff" => Ok(Metric::Hausdorff),
            "chamfer" => Ok(Metric::Chamfer),
            "sorted" => Ok(Metric::Sorted),
            "double" => Ok(Metric::Double),
            other => Err(format!("unknown loss metric: {}", other)),
        }
    }
}

/// Accumulated comparison of two trace sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossReport {
    /// Sum of the finite per-group distances
    pub total: f64,
    pub compared_groups: usize,
    /// Reference groups with no simulated counterpart
    pub ignored_reference_groups: usize,
    /// Simulated groups with no reference counterpart
    pub ignored_simulated_groups: usize,
    /// Intersecting groups dropped for an empty side or a non-finite distance
    pub skipped_groups: usize,
}

impl LossReport {
    /// Mean distance over compared groups, +∞ when nothing was compared
    pub fn loss(&self) -> f64 {
        if self.compared_groups == 0 {
            f64::INFINITY
        } else {
            self.total / self.compared_groups as f64
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.compared_groups == 0
    }

    pub fn merge(&mut self, other: &LossReport) {
        self.total += other.total;
        self.compared_groups += other.compared_groups;
        self.ignored_reference_groups += other.ignored_reference_groups;
        self.ignored_simulated_groups += other.ignored_simulated_groups;
        self.skipped_groups += other.skipped_groups;
    }
}

/// Compare every scenario of `simulated` against `reference`
///
/// Reference scenarios that were not simulated at all are not counted as
/// ignored; partial evaluations only cover the scenarios they ran.
pub fn evaluate(metric: &dyn GroupDistance, reference: &TraceSet, simulated: &TraceSet) -> LossReport {
    let mut report = LossReport::default();
    for (scenario, sim_index) in simulated.iter() {
        let ref_index = match reference.get(scenario) {
            Some(index) => index,
            None => {
                debug!(%scenario, groups = sim_index.len(), "no reference data for scenario");
                report.ignored_simulated_groups += sim_index.len();
                continue;
            }
        };

        for (key, ref_records) in ref_index.iter() {
            let sim_records = match sim_index.get(key) {
                Some(records) => records,
                None => {
                    debug!(%scenario, %key, "reference group not simulated");
                    report.ignored_reference_groups += 1;
                    continue;
                }
            };
            if ref_records.is_empty() || sim_records.is_empty() {
                warn!(%scenario, %key, "empty group, skipping");
                report.skipped_groups += 1;
                continue;
            }
            let d = metric.distance(ref_records, sim_records);
            if !d.is_finite() {
                warn!(%scenario, %key, metric = metric.name(), distance = d, "non-finite distance, skipping group");
                report.skipped_groups += 1;
                continue;
            }
            report.total += d;
            report.compared_groups += 1;
        }

        report.ignored_simulated_groups += sim_index.keys().filter(|k| !ref_index.contains(k)).count();
    }
    report
}

/// Message sent to an isolated loss worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRequest {
    pub metric: Metric,
    pub reference: TraceSet,
    pub simulated: TraceSet,
}

impl LossRequest {
    pub fn evaluate(&self) -> LossReport {
        self.metric.evaluate(&self.reference, &self.simulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_traces::{GroupIndex, GroupKey, Hitrate, JobRecord};
    use platform_params::{CacheMedium, NetworkTier, Scenario};

    fn job(start: f64, end: f64, compute: f64) -> JobRecord {
        JobRecord {
            start,
            end,
            compute_time: compute,
            input_transfer_time: 1.0,
            output_transfer_time: 1.0,
            machine_name: "sg01".into(),
            job_tag: "job".into(),
        }
    }

    fn key(workload: &str, machine: &str, hitrate: f64) -> GroupKey {
        GroupKey::new(workload, machine, Hitrate::new(hitrate).unwrap())
    }

    fn set(groups: Vec<(GroupKey, Vec<JobRecord>)>) -> TraceSet {
        let mut index = GroupIndex::new();
        for (k, records) in groups {
            index.insert(k, records);
        }
        let mut set = TraceSet::new();
        set.insert(Scenario::new(CacheMedium::Disk, NetworkTier::Slow), index);
        set
    }

    fn spread(n: usize, factor: f64) -> Vec<JobRecord> {
        (0..n)
            .map(|i| {
                let wall = 40.0 + 11.0 * i as f64;
                job(0.0, wall * factor, wall * 0.6)
            })
            .collect()
    }

    #[test]
    fn test_single_record_scenario_is_zero() {
        let reference = set(vec![(key("test", "sg01", 0.5), vec![job(0.0, 100.0, 80.0)])]);
        let simulated = reference.clone();
        let report = Metric::Mre.evaluate(&reference, &simulated);
        assert_eq!(report.loss(), 0.0);
        assert_eq!(report.compared_groups, 1);
    }

    #[test]
    fn test_identity_for_every_metric() {
        let reference = set(vec![
            (key("test", "sg01", 0.0), spread(10, 1.0)),
            (key("copy", "sg02", 1.0), spread(4, 1.0)),
        ]);
        for metric in Metric::ALL {
            assert_eq!(metric.evaluate(&reference, &reference).loss(), 0.0, "{}", metric);
        }
    }

    #[test]
    fn test_doubled_walltime_mre_is_one() {
        let reference = set(vec![(key("test", "sg01", 0.5), (0..10).map(|_| job(0.0, 100.0, 80.0)).collect())]);
        let simulated = set(vec![(key("test", "sg01", 0.5), (0..10).map(|_| job(0.0, 200.0, 80.0)).collect())]);
        assert_eq!(Metric::Mre.evaluate(&reference, &simulated).loss(), 1.0);
    }

    #[test]
    fn test_spurious_group_does_not_change_loss() {
        let reference = set(vec![(key("test", "sg01", 0.5), spread(8, 1.0))]);
        let simulated = set(vec![(key("test", "sg01", 0.5), spread(8, 1.3))]);
        let mut with_extra = simulated.clone();
        let mut extra = GroupIndex::new();
        extra.insert(key("test", "sg99", 0.5), spread(3, 9.0));
        with_extra.insert(Scenario::new(CacheMedium::Disk, NetworkTier::Slow), extra);

        for metric in Metric::ALL {
            let base = metric.evaluate(&reference, &simulated);
            let noisy = metric.evaluate(&reference, &with_extra);
            assert_eq!(base.loss(), noisy.loss(), "{}", metric);
            assert_eq!(noisy.ignored_simulated_groups, 1);
        }
    }

    #[test]
    fn test_no_intersection_is_infinite() {
        let reference = set(vec![(key("test", "sg01", 0.5), spread(3, 1.0))]);
        let simulated = set(vec![(key("test", "sg01", 0.4), spread(3, 1.0))]);
        for metric in Metric::ALL {
            let report = metric.evaluate(&reference, &simulated);
            assert!(report.is_degenerate());
            assert_eq!(report.loss(), f64::INFINITY);
            assert_eq!(report.ignored_reference_groups, 1);
        }
        assert_eq!(Metric::Mre.evaluate(&TraceSet::new(), &TraceSet::new()).loss(), f64::INFINITY);
    }

    #[test]
    fn test_non_finite_group_skipped() {
        let reference = set(vec![
            (key("test", "sg01", 0.5), vec![job(5.0, 5.0, 0.0)]),
            (key("test", "sg02", 0.5), vec![job(0.0, 100.0, 80.0)]),
        ]);
        let simulated = set(vec![
            (key("test", "sg01", 0.5), vec![job(0.0, 10.0, 1.0)]),
            (key("test", "sg02", 0.5), vec![job(0.0, 150.0, 80.0)]),
        ]);
        let report = Metric::Mre.evaluate(&reference, &simulated);
        assert_eq!(report.skipped_groups, 1);
        assert_eq!(report.compared_groups, 1);
        assert_eq!(report.loss(), 0.5);
    }

    #[test]
    fn test_metric_names() {
        for metric in Metric::ALL {
            assert_eq!(metric.to_string().parse::<Metric>().unwrap(), metric);
        }
        assert_eq!("ddks".parse::<Metric>().unwrap(), Metric::Energy);
        let parsed: Metric = serde_json::from_str("\"wasserstein\"").unwrap();
        assert_eq!(parsed, Metric::Wasserstein);
    }
}
