use crate::{Param, ParameterAssignment};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage medium backing the site cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMedium {
    Disk,
    Ram,
}

impl CacheMedium {
    pub fn speed_param(&self) -> Param {
        match self {
            CacheMedium::Disk => Param::DiskSpeed,
            CacheMedium::Ram => Param::RamDiskSpeed,
        }
    }

    /// Directory name used by the reference data layout
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheMedium::Disk => "diskCache",
            CacheMedium::Ram => "ramCache",
        }
    }
}

/// External network tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTier {
    Slow,
    Fast,
}

impl NetworkTier {
    pub fn speed_param(&self) -> Param {
        match self {
            NetworkTier::Slow => Param::ExternalSlowNetworkSpeed,
            NetworkTier::Fast => Param::ExternalFastNetworkSpeed,
        }
    }

    /// Token identifying the tier in reference site directory names
    pub fn dir_token(&self) -> &'static str {
        match self {
            NetworkTier::Slow => "1Gbps",
            NetworkTier::Fast => "10Gbps",
        }
    }
}

/// One cache medium × network tier combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scenario {
    pub cache: CacheMedium,
    pub network: NetworkTier,
}

impl Scenario {
    /// Evaluation order of a full run
    pub const CANONICAL: [Scenario; 4] = [
        Scenario::new(CacheMedium::Disk, NetworkTier::Slow),
        Scenario::new(CacheMedium::Ram, NetworkTier::Slow),
        Scenario::new(CacheMedium::Ram, NetworkTier::Fast),
        Scenario::new(CacheMedium::Disk, NetworkTier::Fast),
    ];

    pub const fn new(cache: CacheMedium, network: NetworkTier) -> Self {
        Self { cache, network }
    }

    pub fn cache_speed(&self, assignment: &ParameterAssignment) -> f64 {
        assignment.get(self.cache.speed_param())
    }

    pub fn external_network_speed(&self, assignment: &ParameterAssignment) -> f64 {
        assignment.get(self.network.speed_param())
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = match self.cache {
            CacheMedium::Disk => "disk",
            CacheMedium::Ram => "ram",
        };
        let network = match self.network {
            NetworkTier::Slow => "slow",
            NetworkTier::Fast => "fast",
        };
        write!(f, "{}-cache/{}-net", cache, network)
    }
}
