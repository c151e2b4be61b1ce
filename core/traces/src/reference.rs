//! Ground-truth data layout
//!
//! `<root>/<job-dir>/<diskCache|ramCache>/<SITE>*<1Gbps|10Gbps>*/*_<hitrate>.csv`

use crate::{Hitrate, TraceAggregator, TraceError, TraceReader, TraceSet};
use platform_params::{NetworkTier, Scenario};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Maps a workload name to its directory under the reference root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDir {
    pub workload: String,
    pub dir: String,
}

impl WorkloadDir {
    pub fn new(workload: impl Into<String>, dir: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            dir: dir.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceLayout {
    pub root: PathBuf,
    pub workloads: Vec<WorkloadDir>,
    pub site_prefix: String,
    pub reader: TraceReader,
}

impl ReferenceLayout {
    pub fn new(root: impl Into<PathBuf>, workloads: Vec<WorkloadDir>) -> Self {
        Self {
            root: root.into(),
            workloads,
            site_prefix: "SG".to_string(),
            reader: TraceReader::new(),
        }
    }

    pub fn with_reader(mut self, reader: TraceReader) -> Self {
        self.reader = reader;
        self
    }

    /// Site directories holding data for one workload and scenario
    pub fn site_dirs(&self, workload: &WorkloadDir, scenario: Scenario) -> Result<Vec<PathBuf>, TraceError> {
        let cache_dir = self.root.join(&workload.dir).join(scenario.cache.dir_name());
        if !cache_dir.is_dir() {
            warn!(dir = %cache_dir.display(), "reference directory missing");
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&cache_dir).map_err(|e| TraceError::io(&cache_dir, e))? {
            let entry = entry.map_err(|e| TraceError::io(&cache_dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && self.matches_site(&name, scenario.network) {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn matches_site(&self, name: &str, tier: NetworkTier) -> bool {
        name.starts_with(&self.site_prefix) && name.contains(tier.dir_token())
    }

    /// Load every scenario; records of several sites sharing a group key are merged
    pub fn load(&self) -> Result<TraceSet, TraceError> {
        let mut set = TraceSet::new();
        for scenario in Scenario::CANONICAL {
            let mut aggregator = TraceAggregator::new();
            for workload in &self.workloads {
                for dir in self.site_dirs(workload, scenario)? {
                    self.load_site(&dir, &workload.workload, &mut aggregator)?;
                }
            }
            let index = aggregator.finish();
            info!(%scenario, groups = index.len(), "loaded reference scenario");
            set.insert(scenario, index);
        }
        Ok(set)
    }

    fn load_site(&self, dir: &Path, workload: &str, aggregator: &mut TraceAggregator) -> Result<(), TraceError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| TraceError::io(dir, e))? {
            let path = entry.map_err(|e| TraceError::io(dir, e))?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if name.contains("bad_") {
                continue;
            }
            let hitrate = match Hitrate::from_file_name(&name) {
                Some(h) => h,
                None => {
                    warn!(file = %path.display(), "no hitrate in reference file name, skipping");
                    continue;
                }
            };
            match self.reader.read_path(&path) {
                Ok(traces) => aggregator.add(workload, hitrate, traces),
                Err(TraceError::EmptyOutput(_)) => {
                    warn!(file = %path.display(), "empty reference file, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Where a synthetic reference file for this combination belongs
    pub fn synthetic_path(&self, workload: &WorkloadDir, scenario: Scenario, hitrate: Hitrate) -> PathBuf {
        self.root
            .join(&workload.dir)
            .join(scenario.cache.dir_name())
            .join(format!("{}1_Synthetic{}", self.site_prefix, scenario.network.dir_token()))
            .join(format!("synthetic_hitrate_{}.csv", hitrate))
    }
}
