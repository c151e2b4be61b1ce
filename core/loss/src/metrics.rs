//! Per-group distances between reference and simulated job records
//!
//! Every job is reduced to the feature point (walltime, computeTime).

use job_traces::JobRecord;
use std::cmp::Ordering;

/// Distance between the reference and simulated records of one group
///
/// Both slices are non-empty. A non-finite result marks the group as
/// not comparable.
pub trait GroupDistance: Send + Sync {
    fn name(&self) -> &'static str;

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64;
}

type Point = [f64; 2];

fn features(records: &[JobRecord]) -> Vec<Point> {
    records.iter().map(|r| [r.walltime(), r.compute_time]).collect()
}

fn euclid(a: &Point, b: &Point) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

fn mean_walltime(records: &[JobRecord]) -> f64 {
    mean(records.iter().map(JobRecord::walltime))
}

/// Relative error of the mean walltime
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanRelativeError;

impl GroupDistance for MeanRelativeError {
    fn name(&self) -> &'static str {
        "mre"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let reference_time = mean_walltime(reference);
        (reference_time - mean_walltime(simulated)).abs() / reference_time
    }
}

/// `mre` plus the error of the mean CPU ratio
#[derive(Debug, Clone, Copy, Default)]
pub struct RatioError;

impl GroupDistance for RatioError {
    fn name(&self) -> &'static str {
        "ratio"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let cpu = |records: &[JobRecord]| mean(records.iter().map(JobRecord::cpu_ratio));
        MeanRelativeError.distance(reference, simulated) + (cpu(simulated) - cpu(reference)).abs()
    }
}

fn mean_pairwise(a: &[Point], b: &[Point]) -> f64 {
    mean(a.iter().flat_map(|p| b.iter().map(move |q| euclid(p, q))))
}

/// Two-sample energy distance
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyDistance;

impl GroupDistance for EnergyDistance {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let x = features(reference);
        let y = features(simulated);
        let d = 2.0 * mean_pairwise(&x, &y) - mean_pairwise(&x, &x) - mean_pairwise(&y, &y);
        d.max(0.0)
    }
}

/// W1 between two empirical 1-D distributions of any sizes
fn wasserstein_1d(mut a: Vec<f64>, mut b: Vec<f64>) -> f64 {
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut q = 0.0;
    let mut total = 0.0;
    while i < a.len() && j < b.len() {
        let next_a = (i + 1) as f64 / n;
        let next_b = (j + 1) as f64 / m;
        let next = next_a.min(next_b);
        total += (next - q) * (a[i] - b[j]).abs();
        q = next;
        if next_a <= next_b {
            i += 1;
        }
        if next_b <= next_a {
            j += 1;
        }
    }
    total
}

/// Max-sliced Wasserstein-1 over evenly spaced directions
#[derive(Debug, Clone, Copy)]
pub struct SlicedWasserstein {
    pub directions: usize,
}

impl Default for SlicedWasserstein {
    fn default() -> Self {
        Self { directions: 16 }
    }
}

impl GroupDistance for SlicedWasserstein {
    fn name(&self) -> &'static str {
        "wasserstein"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let x = features(reference);
        let y = features(simulated);
        let mut best: f64 = 0.0;
        for k in 0..self.directions.max(1) {
            let angle = std::f64::consts::PI * k as f64 / self.directions.max(1) as f64;
            let (s, c) = angle.sin_cos();
            let project = |pts: &[Point]| pts.iter().map(|p| p[0] * c + p[1] * s).collect();
            best = best.max(wasserstein_1d(project(&x), project(&y)));
        }
        best
    }
}

fn nearest(p: &Point, cloud: &[Point]) -> f64 {
    cloud
        .iter()
        .map(|q| euclid(p, q))
        .fold(f64::INFINITY, f64::min)
}

/// Directed Hausdorff distance reference → simulated
#[derive(Debug, Clone, Copy, Default)]
pub struct Hausdorff;

impl GroupDistance for Hausdorff {
    fn name(&self) -> &'static str {
        "hausdorff"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let x = features(reference);
        let y = features(simulated);
        x.iter().map(|p| nearest(p, &y)).fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Chamfer;

impl GroupDistance for Chamfer {
    fn name(&self) -> &'static str {
        "chamfer"
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let x = features(reference);
        let y = features(simulated);
        mean(x.iter().map(|p| nearest(p, &y))) + mean(y.iter().map(|p| nearest(p, &x)))
    }
}

/// Mean absolute error of two order statistics, aligned by quantile
fn quantile_mae(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    mean((0..len).map(|k| {
        let i = k * a.len() / len;
        let j = k * b.len() / len;
        (a[i] - b[j]).abs()
    }))
}

fn sorted_by<F>(records: &[JobRecord], key: F) -> Vec<&JobRecord>
where
    F: Fn(&JobRecord) -> f64,
{
    let mut sorted: Vec<&JobRecord> = records.iter().collect();
    sorted.sort_by(|a, b| key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal));
    sorted
}

/// Order-statistics error of walltime and computeTime
///
/// With `by_efficiency` set the compute times are ordered by
/// walltime / max(1, computeTime) instead of by walltime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedError {
    pub by_efficiency: bool,
}

impl SortedError {
    fn columns(&self, records: &[JobRecord]) -> (Vec<f64>, Vec<f64>) {
        let by_walltime = sorted_by(records, JobRecord::walltime);
        let walltimes = by_walltime.iter().map(|r| r.walltime()).collect();
        let compute = if self.by_efficiency {
            sorted_by(records, |r| r.walltime() / r.compute_time.max(1.0))
                .iter()
                .map(|r| r.compute_time)
                .collect()
        } else {
            by_walltime.iter().map(|r| r.compute_time).collect()
        };
        (walltimes, compute)
    }
}

impl GroupDistance for SortedError {
    fn name(&self) -> &'static str {
        if self.by_efficiency {
            "double"
        } else {
            "sorted"
        }
    }

    fn distance(&self, reference: &[JobRecord], simulated: &[JobRecord]) -> f64 {
        let (ref_wall, ref_cpu) = self.columns(reference);
        let (sim_wall, sim_cpu) = self.columns(simulated);
        quantile_mae(&ref_wall, &sim_wall) + quantile_mae(&ref_cpu, &sim_cpu)
    }
}
