//! Platform template materialization
//!
//! Placeholders are `{name}` tokens made of ASCII letters, digits, `-` and
//! `_`. Any other brace is copied through untouched.

use crate::{Param, ParameterAssignment, ParameterSpace, Scenario};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const CPU_SPEED: &str = "cpu-speed";
pub const READ_SPEED: &str = "read-speed";
pub const LINK_SPEED: &str = "link-speed";
pub const NET_SPEED: &str = "net-speed";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read platform template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("placeholder {{{0}}} has no assigned value")]
    Unassigned(String),
    #[error("failed to write platform file: {0}")]
    Write(#[from] io::Error),
}

/// Formatted values keyed by placeholder name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformValues {
    values: BTreeMap<String, String>,
}

impl PlatformValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for one scenario of a trial
    pub fn for_scenario(space: &ParameterSpace, assignment: &ParameterAssignment, scenario: Scenario) -> Self {
        let cache = scenario.cache.speed_param();
        let network = scenario.network.speed_param();
        Self::new()
            .with(CPU_SPEED, space.format(Param::CpuSpeed, assignment.get(Param::CpuSpeed)))
            .with(READ_SPEED, space.format(cache, scenario.cache_speed(assignment)))
            .with(
                LINK_SPEED,
                space.format(Param::InternalNetworkSpeed, assignment.get(Param::InternalNetworkSpeed)),
            )
            .with(NET_SPEED, space.format(network, scenario.external_network_speed(assignment)))
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformTemplate {
    text: String,
}

impl PlatformTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { text })
    }

    /// Distinct placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (_, name) in scan(&self.text) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn render(&self, values: &PlatformValues) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.text.len());
        let mut cursor = 0;
        for (start, name) in scan(&self.text) {
            let value = values
                .get(name)
                .ok_or_else(|| TemplateError::Unassigned(name.to_string()))?;
            out.push_str(&self.text[cursor..start]);
            out.push_str(value);
            cursor = start + name.len() + 2;
        }
        out.push_str(&self.text[cursor..]);
        Ok(out)
    }

    /// Render into a temporary file inside `dir`
    ///
    /// The file is deleted when the returned handle is dropped.
    pub fn materialize(&self, values: &PlatformValues, dir: &Path) -> Result<NamedTempFile, TemplateError> {
        let contents = self.render(values)?;
        let mut file = tempfile::Builder::new()
            .prefix("platform-")
            .suffix(".xml")
            .tempfile_in(dir)?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// (byte offset of `{`, placeholder name) pairs
fn scan(text: &str) -> Vec<(usize, &str)> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let rest = &text[i + 1..];
            if let Some(end) = rest.find('}') {
                let name = &rest[..end];
                if is_placeholder_name(name) {
                    found.push((i, name));
                    i += end + 2;
                    continue;
                }
            }
        }
        i += 1;
    }
    found
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
