//! Job Trace Records
//!
//! Parses simulator output and ground-truth CSV dumps into job records and
//! indexes them by (workload, machine, hitrate) for every scenario.

mod reference;

pub use reference::{ReferenceLayout, WorkloadDir};

use platform_params::Scenario;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Tag substring marking internal/synthetic jobs that are never compared
pub const DEFAULT_INTERNAL_MARKER: &str = "__";

pub const COL_TAG: &str = "job.tag";
pub const COL_MACHINE: &str = "machine.name";
pub const COL_START: &str = "job.start";
pub const COL_END: &str = "job.end";
pub const COL_COMPUTE: &str = "job.computetime";
pub const COL_INPUT_TRANSFER: &str = "infiles.transfertime";
pub const COL_OUTPUT_TRANSFER: &str = "outfiles.transfertime";

/// One executed job (simulated or measured)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub start: f64,
    pub end: f64,
    pub compute_time: f64,
    pub input_transfer_time: f64,
    pub output_transfer_time: f64,
    pub machine_name: String,
    pub job_tag: String,
}

impl JobRecord {
    pub fn walltime(&self) -> f64 {
        self.end - self.start
    }

    /// Fraction of the walltime spent computing (0 for zero-length jobs)
    pub fn cpu_ratio(&self) -> f64 {
        let walltime = self.walltime();
        if walltime > 0.0 {
            self.compute_time / walltime
        } else {
            0.0
        }
    }
}

/// Cache hitrate in [0, 1], totally ordered so it can key a map
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Hitrate(f64);

impl Hitrate {
    pub fn new(value: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Hitrate encoded between the last `_` and the last `.` of a file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        let start = name.rfind('_')? + 1;
        let end = name.rfind('.')?;
        if start > end {
            return None;
        }
        name[start..end].parse().ok().and_then(Self::new)
    }
}

impl TryFrom<f64> for Hitrate {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("hitrate {} outside [0, 1]", value))
    }
}

impl From<Hitrate> for f64 {
    fn from(hitrate: Hitrate) -> f64 {
        hitrate.0
    }
}

impl PartialEq for Hitrate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hitrate {}

impl PartialOrd for Hitrate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hitrate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// bit equality is exactly `total_cmp` equality
impl Hash for Hitrate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Hitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("simulation produced empty output file {0}")]
    EmptyOutput(PathBuf),
    #[error("trace is missing required column {0}")]
    MissingColumn(&'static str),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl TraceError {
    fn io(path: &Path, source: io::Error) -> Self {
        TraceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A row that could not be turned into a `JobRecord`
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

/// Parsed output of one simulator run, grouped by machine
#[derive(Debug, Clone, Default)]
pub struct MachineTraces {
    by_machine: BTreeMap<String, Vec<JobRecord>>,
    pub skipped: Vec<MalformedRow>,
    pub internal_rows: usize,
}

impl MachineTraces {
    pub fn machines(&self) -> impl Iterator<Item = &str> {
        self.by_machine.keys().map(String::as_str)
    }

    pub fn records(&self, machine: &str) -> &[JobRecord] {
        self.by_machine.get(machine).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of records across machines
    pub fn len(&self) -> usize {
        self.by_machine.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_machine.is_empty()
    }

    pub fn push(&mut self, record: JobRecord) {
        self.by_machine
            .entry(record.machine_name.clone())
            .or_default()
            .push(record);
    }

    pub fn into_machines(self) -> BTreeMap<String, Vec<JobRecord>> {
        self.by_machine
    }
}

struct Columns {
    tag: usize,
    machine: usize,
    start: usize,
    end: usize,
    compute: usize,
    input_transfer: usize,
    output_transfer: usize,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, TraceError> {
        let find = |name: &'static str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(TraceError::MissingColumn(name))
        };
        Ok(Self {
            tag: find(COL_TAG)?,
            machine: find(COL_MACHINE)?,
            start: find(COL_START)?,
            end: find(COL_END)?,
            compute: find(COL_COMPUTE)?,
            input_transfer: find(COL_INPUT_TRANSFER)?,
            output_transfer: find(COL_OUTPUT_TRANSFER)?,
        })
    }

    fn parse(&self, row: &csv::StringRecord) -> Result<JobRecord, String> {
        let text = |idx: usize, name: &str| {
            row.get(idx)
                .map(str::trim)
                .ok_or_else(|| format!("missing field {}", name))
        };
        let number = |idx: usize, name: &str| -> Result<f64, String> {
            let raw = text(idx, name)?;
            raw.parse::<f64>()
                .map_err(|_| format!("{} is not a number: {:?}", name, raw))
        };

        let number = |idx: usize, name: &str| -> Result<f64, String> {
            let value = number(idx, name)?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(format!("{} is not finite: {}", name, value))
            }
        };

        Ok(JobRecord {
            start: number(self.start, COL_START)?,
            end: number(self.end, COL_END)?,
            compute_time: number(self.compute, COL_COMPUTE)?,
            input_transfer_time: number(self.input_transfer, COL_INPUT_TRANSFER)?,
            output_transfer_time: number(self.output_transfer, COL_OUTPUT_TRANSFER)?,
            machine_name: text(self.machine, COL_MACHINE)?.to_string(),
            job_tag: text(self.tag, COL_TAG)?.to_string(),
        })
    }
}

/// CSV trace parser shared by simulator output and reference data
#[derive(Debug, Clone)]
pub struct TraceReader {
    internal_marker: Option<String>,
}

impl TraceReader {
    pub fn new() -> Self {
        Self {
            internal_marker: Some(DEFAULT_INTERNAL_MARKER.to_string()),
        }
    }

    /// `None` keeps every row
    pub fn with_internal_marker(mut self, marker: Option<String>) -> Self {
        self.internal_marker = marker.filter(|m| !m.is_empty());
        self
    }

    /// Parse a trace file; a zero-byte file is an `EmptyOutput` error
    pub fn read_path(&self, path: &Path) -> Result<MachineTraces, TraceError> {
        let meta = std::fs::metadata(path).map_err(|e| TraceError::io(path, e))?;
        if meta.len() == 0 {
            return Err(TraceError::EmptyOutput(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|e| TraceError::io(path, e))?;
        let traces = self.read_from(file)?;
        debug!(
            path = %path.display(),
            records = traces.len(),
            skipped = traces.skipped.len(),
            "parsed trace"
        );
        Ok(traces)
    }

    pub fn read_from<R: io::Read>(&self, reader: R) -> Result<MachineTraces, TraceError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let columns = Columns::locate(rdr.headers()?)?;

        let mut traces = MachineTraces::default();
        let mut row = csv::StringRecord::new();
        loop {
            let line = rdr.position().line();
            match rdr.read_record(&mut row) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(line, error = %e, "skipping unreadable trace row");
                    traces.skipped.push(MalformedRow {
                        line,
                        reason: e.to_string(),
                    });
                    continue;
                }
            }
            if row.iter().all(str::is_empty) {
                continue;
            }
            match columns.parse(&row) {
                Ok(record) => {
                    let internal = self
                        .internal_marker
                        .as_deref()
                        .map_or(false, |m| record.job_tag.contains(m));
                    if internal {
                        traces.internal_rows += 1;
                    } else {
                        traces.push(record);
                    }
                }
                Err(reason) => {
                    warn!(line, %reason, "skipping malformed trace row");
                    traces.skipped.push(MalformedRow { line, reason });
                }
            }
        }
        Ok(traces)
    }
}

impl Default for TraceReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Comparison key shared by reference and simulated records
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub workload: String,
    pub machine: String,
    pub hitrate: Hitrate,
}

impl GroupKey {
    pub fn new(workload: impl Into<String>, machine: impl Into<String>, hitrate: Hitrate) -> Self {
        Self {
            workload: workload.into(),
            machine: machine.into(),
            hitrate,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.workload, self.machine, self.hitrate)
    }
}

/// Serialized form of one `GroupIndex` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub key: GroupKey,
    pub records: Vec<JobRecord>,
}

/// Records of one scenario keyed by (workload, machine, hitrate)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<GroupEntry>", from = "Vec<GroupEntry>")]
pub struct GroupIndex {
    groups: BTreeMap<GroupKey, Vec<JobRecord>>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records under `key`
    pub fn insert(&mut self, key: GroupKey, records: impl IntoIterator<Item = JobRecord>) {
        self.groups.entry(key).or_default().extend(records);
    }

    pub fn get(&self, key: &GroupKey) -> Option<&[JobRecord]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &[JobRecord])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn workloads(&self) -> BTreeSet<&str> {
        self.groups.keys().map(|k| k.workload.as_str()).collect()
    }

    pub fn merge(&mut self, other: GroupIndex) {
        for (key, records) in other.groups {
            self.insert(key, records);
        }
    }
}

impl From<Vec<GroupEntry>> for GroupIndex {
    fn from(entries: Vec<GroupEntry>) -> Self {
        let mut index = GroupIndex::new();
        for entry in entries {
            index.insert(entry.key, entry.records);
        }
        index
    }
}

impl From<GroupIndex> for Vec<GroupEntry> {
    fn from(index: GroupIndex) -> Self {
        index
            .groups
            .into_iter()
            .map(|(key, records)| GroupEntry { key, records })
            .collect()
    }
}

/// Group indices of every evaluated scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<(Scenario, GroupIndex)>", from = "Vec<(Scenario, GroupIndex)>")]
pub struct TraceSet {
    scenarios: BTreeMap<Scenario, GroupIndex>,
}

impl TraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scenario: Scenario, index: GroupIndex) {
        self.scenarios.entry(scenario).or_default().merge(index);
    }

    pub fn get(&self, scenario: Scenario) -> Option<&GroupIndex> {
        self.scenarios.get(&scenario)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scenario, &GroupIndex)> {
        self.scenarios.iter().map(|(s, g)| (*s, g))
    }

    pub fn scenarios(&self) -> impl Iterator<Item = Scenario> + '_ {
        self.scenarios.keys().copied()
    }

    pub fn group_count(&self) -> usize {
        self.scenarios.values().map(GroupIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.group_count() == 0
    }
}

impl From<Vec<(Scenario, GroupIndex)>> for TraceSet {
    fn from(entries: Vec<(Scenario, GroupIndex)>) -> Self {
        let mut set = TraceSet::new();
        for (scenario, index) in entries {
            set.insert(scenario, index);
        }
        set
    }
}

impl From<TraceSet> for Vec<(Scenario, GroupIndex)> {
    fn from(set: TraceSet) -> Self {
        set.scenarios.into_iter().collect()
    }
}

/// Transposes per-run (workload, hitrate) → machine output into a `GroupIndex`
#[derive(Debug, Default)]
pub struct TraceAggregator {
    index: GroupIndex,
}

impl TraceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, workload: &str, hitrate: Hitrate, traces: MachineTraces) {
        for (machine, records) in traces.into_machines() {
            self.index
                .insert(GroupKey::new(workload, machine, hitrate), records);
        }
    }

    pub fn finish(self) -> GroupIndex {
        self.index
    }
}

pub fn aggregate<I>(outputs: I) -> GroupIndex
where
    I: IntoIterator<Item = (String, Hitrate, MachineTraces)>,
{
    let mut aggregator = TraceAggregator::new();
    for (workload, hitrate, traces) in outputs {
        aggregator.add(&workload, hitrate, traces);
    }
    aggregator.finish()
}
