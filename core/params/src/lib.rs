//! Platform Parameter Space
//!
//! Named platform speeds, their log-uniform priors, the four canonical
//! cache/network scenarios and the platform template they are rendered into.

mod scenario;
mod template;

pub use scenario::{CacheMedium, NetworkTier, Scenario};
pub use template::{PlatformTemplate, PlatformValues, TemplateError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// CPU speed used when the CPU is pinned instead of calibrated (1960 Mf)
pub const PINNED_CPU_SPEED: f64 = 1.96e9;

/// Calibrated platform parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Param {
    CpuSpeed,
    #[serde(alias = "disk")]
    DiskSpeed,
    #[serde(alias = "ramDisk")]
    RamDiskSpeed,
    #[serde(alias = "internalNetwork")]
    InternalNetworkSpeed,
    #[serde(alias = "externalFastNetwork")]
    ExternalFastNetworkSpeed,
    #[serde(alias = "externalSlowNetwork", alias = "externalNetwork")]
    ExternalSlowNetworkSpeed,
    #[serde(alias = "xrootd_flops")]
    XrootdFlops,
}

impl Param {
    pub const COUNT: usize = 7;

    pub const ALL: [Param; Self::COUNT] = [
        Param::CpuSpeed,
        Param::DiskSpeed,
        Param::RamDiskSpeed,
        Param::InternalNetworkSpeed,
        Param::ExternalFastNetworkSpeed,
        Param::ExternalSlowNetworkSpeed,
        Param::XrootdFlops,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Param::CpuSpeed => "cpuSpeed",
            Param::DiskSpeed => "diskSpeed",
            Param::RamDiskSpeed => "ramDiskSpeed",
            Param::InternalNetworkSpeed => "internalNetworkSpeed",
            Param::ExternalFastNetworkSpeed => "externalFastNetworkSpeed",
            Param::ExternalSlowNetworkSpeed => "externalSlowNetworkSpeed",
            Param::XrootdFlops => "xrootdFlops",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Param {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpuSpeed" => Ok(Param::CpuSpeed),
            "diskSpeed" | "disk" => Ok(Param::DiskSpeed),
            "ramDiskSpeed" | "ramDisk" => Ok(Param::RamDiskSpeed),
            "internalNetworkSpeed" | "internalNetwork" => Ok(Param::InternalNetworkSpeed),
            "externalFastNetworkSpeed" | "externalFastNetwork" => Ok(Param::ExternalFastNetworkSpeed),
            "externalSlowNetworkSpeed" | "externalSlowNetwork" | "externalNetwork" => {
                Ok(Param::ExternalSlowNetworkSpeed)
            }
            "xrootdFlops" | "xrootd_flops" => Ok(Param::XrootdFlops),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    Unknown(String),
    #[error("missing value for {0}")]
    Missing(Param),
    #[error("{param} = {value} is not a positive finite number")]
    NotPositive { param: Param, value: f64 },
    #[error("{param} = {value} outside [{low}, {high}]")]
    OutOfBounds {
        param: Param,
        value: f64,
        low: f64,
        high: f64,
    },
    #[error("invalid prior for {param}: {reason}")]
    BadPrior { param: Param, reason: String },
    #[error("{0} is declared more than once")]
    Conflict(Param),
    #[error("parameter space has no free parameters")]
    Empty,
    #[error("network ratio must be positive and finite, got {0}")]
    BadRatio(f64),
    #[error("expected {expected} unit coordinates, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

/// Concrete value for every platform parameter
///
/// Always complete and strictly positive; bounds are checked by the
/// `ParameterSpace` that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<Param, f64>", try_from = "BTreeMap<Param, f64>")]
pub struct ParameterAssignment {
    values: [f64; Param::COUNT],
}

impl ParameterAssignment {
    pub fn from_values(values: &BTreeMap<Param, f64>) -> Result<Self, ParamError> {
        let mut out = [0.0; Param::COUNT];
        for param in Param::ALL {
            let value = *values.get(&param).ok_or(ParamError::Missing(param))?;
            check_positive(param, value)?;
            out[param.index()] = value;
        }
        Ok(Self { values: out })
    }

    pub fn get(&self, param: Param) -> f64 {
        self.values[param.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, f64)> + '_ {
        Param::ALL.iter().map(move |p| (*p, self.get(*p)))
    }

    fn with(mut self, param: Param, value: f64) -> Self {
        self.values[param.index()] = value;
        self
    }
}

impl TryFrom<BTreeMap<Param, f64>> for ParameterAssignment {
    type Error = ParamError;

    fn try_from(values: BTreeMap<Param, f64>) -> Result<Self, Self::Error> {
        Self::from_values(&values)
    }
}

impl From<ParameterAssignment> for BTreeMap<Param, f64> {
    fn from(a: ParameterAssignment) -> Self {
        a.iter().collect()
    }
}

impl fmt::Display for ParameterAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (param, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {:.2}", param, value)?;
        }
        f.write_str("}")
    }
}

fn check_positive(param: Param, value: f64) -> Result<(), ParamError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ParamError::NotPositive { param, value })
    }
}

fn default_base() -> f64 {
    2.0
}

/// Log-uniform prior: value = base^u, u ~ U(low, high)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Exponential {
    #[serde(default = "default_base")]
    pub base: f64,
    pub low: f64,
    pub high: f64,
}

impl Exponential {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            base: default_base(),
            low,
            high,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.base.powf(self.low), self.base.powf(self.high))
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let exponent = rng.gen_range(self.low..=self.high);
        self.clamp(self.base.powf(exponent))
    }

    /// Position of `value` in [0, 1] along the exponent axis
    pub fn to_unit(&self, value: f64) -> f64 {
        let span = self.high - self.low;
        if span <= 0.0 {
            return 0.0;
        }
        ((value.log(self.base) - self.low) / span).clamp(0.0, 1.0)
    }

    pub fn from_unit(&self, u: f64) -> f64 {
        let exponent = self.low + u.clamp(0.0, 1.0) * (self.high - self.low);
        self.clamp(self.base.powf(exponent))
    }

    pub fn clamp(&self, value: f64) -> f64 {
        let (low, high) = self.bounds();
        value.clamp(low, high)
    }

    fn validate(&self, param: Param) -> Result<(), ParamError> {
        let bad = |reason: &str| ParamError::BadPrior {
            param,
            reason: reason.to_string(),
        };
        if !(self.base.is_finite() && self.base > 1.0) {
            return Err(bad("base must be a finite number > 1"));
        }
        if !(self.low.is_finite() && self.high.is_finite()) {
            return Err(bad("exponents must be finite"));
        }
        if self.low > self.high {
            return Err(bad("low exponent exceeds high exponent"));
        }
        Ok(())
    }
}

fn default_precision() -> usize {
    2
}

/// One searched dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub param: Param,
    pub prior: Exponential,
    #[serde(default = "default_precision")]
    pub precision: usize,
    #[serde(default)]
    pub unit: Option<String>,
}

impl ParamSpec {
    pub fn new(param: Param, low: f64, high: f64) -> Self {
        Self {
            param,
            prior: Exponential::new(low, high),
            precision: default_precision(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn format(&self, value: f64) -> String {
        format!(
            "{:.*}{}",
            self.precision,
            value,
            self.unit.as_deref().unwrap_or("")
        )
    }

    pub fn contains(&self, value: f64) -> bool {
        let (low, high) = self.prior.bounds();
        let slack = 1e-9;
        value >= low * (1.0 - slack) && value <= high * (1.0 + slack)
    }
}

/// Declarative description of a parameter space (JSON config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpaceConfig {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub fixed: BTreeMap<Param, f64>,
    /// When set, only the slow external network is searched and the fast
    /// tier is `ratio` times faster.
    #[serde(default)]
    pub network_ratio: Option<f64>,
}

impl Default for ParameterSpaceConfig {
    fn default() -> Self {
        Self {
            params: vec![
                ParamSpec::new(Param::CpuSpeed, 20.0, 40.0),
                ParamSpec::new(Param::RamDiskSpeed, 20.0, 40.0),
                ParamSpec::new(Param::DiskSpeed, 20.0, 33.0),
                ParamSpec::new(Param::InternalNetworkSpeed, 20.0, 33.0),
                ParamSpec::new(Param::XrootdFlops, 20.0, 47.0),
                ParamSpec::new(Param::ExternalFastNetworkSpeed, 20.0, 33.0),
                ParamSpec::new(Param::ExternalSlowNetworkSpeed, 20.0, 33.0),
            ],
            fixed: BTreeMap::new(),
            network_ratio: None,
        }
    }
}

impl ParameterSpaceConfig {
    /// Remove the CPU from the search and pin it to `PINNED_CPU_SPEED`
    pub fn pin_cpu(mut self) -> Self {
        self.params.retain(|s| s.param != Param::CpuSpeed);
        self.fixed.insert(Param::CpuSpeed, PINNED_CPU_SPEED);
        self
    }

    /// Search one external network speed and derive the fast tier from it
    pub fn with_network_ratio(mut self, ratio: f64) -> Self {
        self.params.retain(|s| s.param != Param::ExternalFastNetworkSpeed);
        self.network_ratio = Some(ratio);
        self
    }
}

/// Relative error of recovered parameters, per parameter and summed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryError {
    pub per_param: BTreeMap<Param, f64>,
    pub total: f64,
}

/// Validated parameter space
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    free: Vec<ParamSpec>,
    fixed: BTreeMap<Param, f64>,
    network_ratio: Option<f64>,
}

impl ParameterSpace {
    pub fn new(config: ParameterSpaceConfig) -> Result<Self, ParamError> {
        if config.params.is_empty() {
            return Err(ParamError::Empty);
        }

        let mut declared = [false; Param::COUNT];
        let mut declare = |param: Param| {
            if std::mem::replace(&mut declared[param.index()], true) {
                Err(ParamError::Conflict(param))
            } else {
                Ok(())
            }
        };

        for spec in &config.params {
            spec.prior.validate(spec.param)?;
            declare(spec.param)?;
        }
        for (&param, &value) in &config.fixed {
            check_positive(param, value)?;
            declare(param)?;
        }
        if let Some(ratio) = config.network_ratio {
            if !(ratio.is_finite() && ratio > 0.0) {
                return Err(ParamError::BadRatio(ratio));
            }
            declare(Param::ExternalFastNetworkSpeed)?;
        }

        if let Some(missing) = Param::ALL.iter().find(|p| !declared[p.index()]) {
            return Err(ParamError::Missing(*missing));
        }

        Ok(Self {
            free: config.params,
            fixed: config.fixed,
            network_ratio: config.network_ratio,
        })
    }

    /// Number of searched dimensions
    pub fn dims(&self) -> usize {
        self.free.len()
    }

    pub fn free(&self) -> &[ParamSpec] {
        &self.free
    }

    pub fn spec(&self, param: Param) -> Option<&ParamSpec> {
        self.free.iter().find(|s| s.param == param)
    }

    pub fn network_ratio(&self) -> Option<f64> {
        self.network_ratio
    }

    /// Draw every free parameter from its prior
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterAssignment {
        let mut values = [0.0; Param::COUNT];
        for spec in &self.free {
            values[spec.param.index()] = spec.prior.sample(rng);
        }
        self.finish(values)
    }

    /// Build an assignment from free-parameter values, checking bounds
    ///
    /// Values for fixed or derived parameters are ignored.
    pub fn assignment(&self, values: &BTreeMap<Param, f64>) -> Result<ParameterAssignment, ParamError> {
        let mut out = [0.0; Param::COUNT];
        for spec in &self.free {
            let value = *values.get(&spec.param).ok_or(ParamError::Missing(spec.param))?;
            check_positive(spec.param, value)?;
            if !spec.contains(value) {
                let (low, high) = spec.prior.bounds();
                return Err(ParamError::OutOfBounds {
                    param: spec.param,
                    value,
                    low,
                    high,
                });
            }
            out[spec.param.index()] = value;
        }
        Ok(self.finish(out))
    }

    /// Re-validate an externally supplied assignment against this space
    pub fn conform(&self, assignment: &ParameterAssignment) -> Result<ParameterAssignment, ParamError> {
        let values: BTreeMap<Param, f64> = (*assignment).into();
        self.assignment(&values)
    }

    /// Replace one free parameter, clamping it into bounds
    pub fn with_value(&self, assignment: &ParameterAssignment, param: Param, value: f64) -> ParameterAssignment {
        let value = match self.spec(param) {
            Some(spec) => spec.prior.clamp(value),
            None => return *assignment,
        };
        let mut values = assignment.values;
        values[param.index()] = value;
        self.finish(values)
    }

    pub fn to_unit(&self, assignment: &ParameterAssignment) -> Vec<f64> {
        self.free
            .iter()
            .map(|s| s.prior.to_unit(assignment.get(s.param)))
            .collect()
    }

    pub fn from_unit(&self, coords: &[f64]) -> Result<ParameterAssignment, ParamError> {
        if coords.len() != self.free.len() {
            return Err(ParamError::Dimension {
                expected: self.free.len(),
                actual: coords.len(),
            });
        }
        let mut values = [0.0; Param::COUNT];
        for (spec, u) in self.free.iter().zip(coords) {
            values[spec.param.index()] = spec.prior.from_unit(*u);
        }
        Ok(self.finish(values))
    }

    /// Render a value the way the simulator expects it
    pub fn format(&self, param: Param, value: f64) -> String {
        match self.spec(param) {
            Some(spec) => spec.format(value),
            None => format!("{:.*}", default_precision(), value),
        }
    }

    /// How far `calibrated` landed from the `truth` it should recover
    ///
    /// Pinned parameters and `xrootdFlops` are not compared; a derived fast
    /// network tier is.
    pub fn recovery_error(&self, calibrated: &ParameterAssignment, truth: &ParameterAssignment) -> RecoveryError {
        let per_param: BTreeMap<Param, f64> = Param::ALL
            .iter()
            .filter(|p| **p != Param::XrootdFlops && !self.fixed.contains_key(*p))
            .map(|p| (*p, (truth.get(*p) - calibrated.get(*p)).abs() / truth.get(*p)))
            .collect();
        RecoveryError {
            total: per_param.values().sum(),
            per_param,
        }
    }

    fn finish(&self, mut values: [f64; Param::COUNT]) -> ParameterAssignment {
        for (param, value) in &self.fixed {
            values[param.index()] = *value;
        }
        if let Some(ratio) = self.network_ratio {
            values[Param::ExternalFastNetworkSpeed.index()] =
                values[Param::ExternalSlowNetworkSpeed.index()] * ratio;
        }
        ParameterAssignment { values }
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            free: ParameterSpaceConfig::default().params,
            fixed: BTreeMap::new(),
            network_ratio: None,
        }
    }
}
