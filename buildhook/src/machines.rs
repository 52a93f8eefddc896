//! Static worker registry.
//!
//! The registry is loaded once at startup from the machines file and never
//! mutated afterwards. Per-process "give up on this host" state is kept by
//! the request loop in a separate disabled-host set, so the records here
//! stay pure.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use buildhook_shared::errors::{HookError, HookResult};

/// One remote worker, as declared in the machines file.
///
/// Immutable after load. `supported_features` is normalized during parsing
/// to contain every mandatory feature.
#[derive(Debug, Clone)]
pub struct Machine {
    pub host_name: String,
    /// Platform identifiers this worker builds for. Non-empty.
    pub system_types: Vec<String>,
    /// SSH identity file passed as `-i`.
    pub ssh_keys: PathBuf,
    /// Concurrent build slots. May be 0, in which case the machine is never
    /// selected.
    pub max_jobs: u32,
    /// Relative throughput weight, >= 1.0.
    pub speed_factor: f64,
    pub supported_features: Vec<String>,
    /// Every build sent to this machine must request all of these.
    pub mandatory_features: Vec<String>,
}

impl Machine {
    pub fn supports_system(&self, system: &str) -> bool {
        self.system_types.iter().any(|s| s == system)
    }

    /// All of `features` appear in `supported_features`.
    pub fn supports_features<'a>(&self, mut features: impl Iterator<Item = &'a String>) -> bool {
        features.all(|f| self.supported_features.iter().any(|s| s == f))
    }

    /// All mandatory features were explicitly requested.
    pub fn mandatory_met(&self, required: &[String]) -> bool {
        self.mandatory_features
            .iter()
            .all(|m| required.iter().any(|r| r == m))
    }

    /// Serialize back to a machines-file line, preserving the parsed fields.
    pub fn to_config_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.host_name,
            self.system_types.join(","),
            self.ssh_keys.display(),
            self.max_jobs,
            self.speed_factor,
            join_or_dash(&self.supported_features),
            join_or_dash(&self.mandatory_features),
        )
        .trim_end_matches(" -")
        .to_string()
    }
}

fn join_or_dash(features: &[String]) -> String {
    if features.is_empty() {
        "-".to_string()
    } else {
        features.join(",")
    }
}

/// The static worker list.
#[derive(Debug, Clone, Default)]
pub struct MachineRegistry {
    machines: Vec<Machine>,
}

impl MachineRegistry {
    /// Load the registry from a machines file.
    ///
    /// A missing file yields an empty registry (the hook then declines every
    /// request). Malformed lines abort startup.
    pub fn load(path: &Path) -> HookResult<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(
                    path = %path.display(),
                    "machines file does not exist, declining all builds"
                );
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(HookError::Config(format!(
                    "cannot read machines file {}: {}",
                    path.display(),
                    err
                )));
            }
        };
        Self::parse(&contents)
    }

    /// Parse machines-file contents.
    pub fn parse(contents: &str) -> HookResult<Self> {
        let mut machines = Vec::new();
        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            machines.push(parse_machine_line(line, lineno + 1)?);
        }
        Ok(Self { machines })
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }
}

fn parse_machine_line(line: &str, lineno: usize) -> HookResult<Machine> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(HookError::Config(format!(
            "machines file line {}: expected at least host, systems and key, got {:?}",
            lineno, line
        )));
    }

    let system_types = split_list(fields[1]);
    if system_types.is_empty() {
        return Err(HookError::Config(format!(
            "machines file line {}: empty system-type list",
            lineno
        )));
    }

    let max_jobs = match fields.get(3) {
        None => 1,
        Some(field) => field.parse::<u32>().map_err(|_| {
            HookError::Config(format!(
                "machines file line {}: invalid maxJobs {:?}",
                lineno, field
            ))
        })?,
    };

    let speed_factor = match fields.get(4) {
        None => 1.0,
        Some(field) => {
            let speed = field.parse::<f64>().map_err(|_| {
                HookError::Config(format!(
                    "machines file line {}: invalid speedFactor {:?}",
                    lineno, field
                ))
            })?;
            if speed < 1.0 {
                return Err(HookError::Config(format!(
                    "machines file line {}: speedFactor must be >= 1.0, got {}",
                    lineno, speed
                )));
            }
            speed
        }
    };

    let mut supported_features = fields.get(5).map(|f| split_list(f)).unwrap_or_default();
    let mandatory_features = fields.get(6).map(|f| split_list(f)).unwrap_or_default();

    // Mandatory features are implicitly supported.
    for mandatory in &mandatory_features {
        if !supported_features.contains(mandatory) {
            supported_features.push(mandatory.clone());
        }
    }

    Ok(Machine {
        host_name: fields[0].to_string(),
        system_types,
        ssh_keys: PathBuf::from(fields[2]),
        max_jobs,
        speed_factor,
        supported_features,
        mandatory_features,
    })
}

/// Split a comma-joined field. `-` is the conventional empty placeholder.
fn split_list(field: &str) -> Vec<String> {
    if field == "-" {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    field
        .split(',')
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(|s| s.to_string())
        .collect()
}
