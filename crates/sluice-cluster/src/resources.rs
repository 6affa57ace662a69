//! Resource vectors: what a task needs and what a host offers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sluice_types::{fields, Result, SluiceError};

/// Record type tag used in checkpoint lines.
const RECORD_TAG: &str = "HostResources";

/// A resource vector describing what a task requests or what a host offers.
///
/// All quantities are unsigned, so the non-negativity invariant holds by
/// construction. `timeout_secs` is a wall-clock limit, not a capacity
/// dimension: it does not participate in [`fits_within`](Self::fits_within).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    /// Number of CPU cores.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory, in bytes. Zero means "no memory requirement".
    #[serde(default)]
    pub mem_bytes: u64,
    /// Scratch disk, in bytes. Zero means "no disk requirement".
    #[serde(default)]
    pub disk_bytes: u64,
    /// Wall-clock timeout, in seconds. Zero means "no timeout".
    #[serde(default)]
    pub timeout_secs: u64,
    /// Generic named resources (GPUs, software licenses).
    #[serde(default)]
    pub custom: BTreeMap<String, u64>,
}

fn default_cpus() -> u32 {
    1
}

impl Default for HostResources {
    fn default() -> Self {
        Self {
            cpus: 1,
            mem_bytes: 0,
            disk_bytes: 0,
            timeout_secs: 0,
            custom: BTreeMap::new(),
        }
    }
}

impl HostResources {
    pub fn new(cpus: u32, mem_bytes: u64, timeout_secs: u64) -> Self {
        Self {
            cpus,
            mem_bytes,
            timeout_secs,
            ..Self::default()
        }
    }

    /// A request is satisfiable only if every capacity dimension fits within
    /// `free`. Custom resources absent from `free` count as zero.
    pub fn fits_within(&self, free: &HostResources) -> bool {
        if self.cpus > free.cpus || self.mem_bytes > free.mem_bytes {
            return false;
        }
        if self.disk_bytes > free.disk_bytes {
            return false;
        }
        self.custom
            .iter()
            .all(|(name, amount)| *amount <= free.custom.get(name).copied().unwrap_or(0))
    }

    /// Consume `other` from this vector (saturating).
    pub fn add(&mut self, other: &HostResources) {
        self.cpus = self.cpus.saturating_add(other.cpus);
        self.mem_bytes = self.mem_bytes.saturating_add(other.mem_bytes);
        self.disk_bytes = self.disk_bytes.saturating_add(other.disk_bytes);
        for (name, amount) in &other.custom {
            let entry = self.custom.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_add(*amount);
        }
    }

    /// Release `other` from this vector (saturating at zero).
    pub fn sub(&mut self, other: &HostResources) {
        self.cpus = self.cpus.saturating_sub(other.cpus);
        self.mem_bytes = self.mem_bytes.saturating_sub(other.mem_bytes);
        self.disk_bytes = self.disk_bytes.saturating_sub(other.disk_bytes);
        for (name, amount) in &other.custom {
            if let Some(entry) = self.custom.get_mut(name) {
                *entry = entry.saturating_sub(*amount);
            }
        }
    }

    /// Capacity remaining after subtracting `allocated` from this total.
    pub fn free_after(&self, allocated: &HostResources) -> HostResources {
        let mut free = self.clone();
        free.sub(allocated);
        free.timeout_secs = self.timeout_secs;
        free
    }

    /// Serialize as a nested checkpoint record fragment:
    /// `HostResources\t<cpus>\t<mem>\t<disk>\t<timeout>\t<custom list>`.
    pub fn to_record(&self) -> String {
        let custom: Vec<String> = self
            .custom
            .iter()
            .map(|(name, amount)| format!("{name}={amount}"))
            .collect();
        format!(
            "{RECORD_TAG}\t{}\t{}\t{}\t{}\t{}",
            self.cpus,
            self.mem_bytes,
            self.disk_bytes,
            self.timeout_secs,
            fields::encode_list(&custom),
        )
    }

    /// Parse the nested record fragment produced by [`to_record`](Self::to_record).
    /// `raw` holds the still-escaped fields starting at the type tag.
    pub fn from_record_fields(raw: &[&str], line: usize) -> Result<Self> {
        if raw.len() < 6 || raw[0] != RECORD_TAG {
            return Err(SluiceError::RecordError {
                line,
                message: format!("expected a {RECORD_TAG} record, got {} fields", raw.len()),
            });
        }
        let parse_num = |field: &str, what: &str| -> Result<u64> {
            field.parse().map_err(|_| SluiceError::RecordError {
                line,
                message: format!("invalid {what}: '{field}'"),
            })
        };
        let mut custom = BTreeMap::new();
        for pair in fields::decode_list(raw[5]) {
            let (name, amount) = pair.split_once('=').ok_or_else(|| SluiceError::RecordError {
                line,
                message: format!("invalid custom resource: '{pair}'"),
            })?;
            custom.insert(name.to_string(), parse_num(amount, "custom resource amount")?);
        }
        Ok(Self {
            cpus: parse_num(raw[1], "cpu count")? as u32,
            mem_bytes: parse_num(raw[2], "memory size")?,
            disk_bytes: parse_num(raw[3], "disk size")?,
            timeout_secs: parse_num(raw[4], "timeout")?,
            custom,
        })
    }

    /// Number of fields a nested record fragment occupies.
    pub const RECORD_FIELDS: usize = 6;
}
