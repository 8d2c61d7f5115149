use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::debug;

use crate::presets::GIB;
use crate::queue::JobId;

pub const DEFAULT_DEVICE_MEMORY: u64 = 8 * GIB;
pub const VRAM_ENV: &str = "VIDLIFT_VRAM_GB";

/// Counting budget over device memory. Each running job holds exactly one
/// reservation, taken on promotion and returned on its terminal state.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    capacity: u64,
    reservations: BTreeMap<JobId, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub capacity: u64,
    pub reserved: u64,
    pub holders: usize,
}

impl BudgetLedger {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            reservations: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn reserved(&self) -> u64 {
        self.reservations.values().sum()
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.reserved())
    }

    pub fn holders(&self) -> usize {
        self.reservations.len()
    }

    /// Whether `amount` could ever be reserved, even with the ledger empty.
    pub fn can_ever_fit(&self, amount: u64) -> bool {
        amount <= self.capacity
    }

    pub fn try_acquire(&mut self, job: JobId, amount: u64) -> bool {
        if self.reservations.contains_key(&job) {
            return true;
        }
        if amount > self.available() {
            debug!(
                job,
                amount,
                available = self.available(),
                "Budget reservation refused"
            );
            return false;
        }
        self.reservations.insert(job, amount);
        debug!(job, amount, available = self.available(), "Budget reserved");
        true
    }

    pub fn release(&mut self, job: JobId) -> Option<u64> {
        let released = self.reservations.remove(&job);
        if let Some(amount) = released {
            debug!(job, amount, available = self.available(), "Budget released");
        }
        released
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            capacity: self.capacity,
            reserved: self.reserved(),
            holders: self.holders(),
        }
    }
}

/// Device memory the ledger should manage. An explicit value wins, then
/// the `VIDLIFT_VRAM_GB` environment variable, then the default.
pub fn detect_device_memory(explicit_gb: Option<f64>) -> u64 {
    if let Some(gb) = explicit_gb.filter(|gb| *gb > 0.0) {
        return gb_to_bytes(gb);
    }
    std::env::var(VRAM_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|gb| *gb > 0.0)
        .map(gb_to_bytes)
        .unwrap_or(DEFAULT_DEVICE_MEMORY)
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb * GIB as f64).round() as u64
}

/// Free bytes on the filesystem holding `path`, as reported by `df`. The
/// nearest existing ancestor is measured when `path` does not exist yet.
/// `None` when the platform gives no answer.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let existing = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."));
    let output = Command::new("df")
        .arg("-Pk")
        .arg(existing)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let free = parse_df(&String::from_utf8_lossy(&output.stdout));
    debug!(path = %existing.display(), free = ?free, "Disk space checked");
    free
}

/// Available 1K blocks from POSIX `df -P` output, in bytes.
fn parse_df(output: &str) -> Option<u64> {
    let row = output.lines().nth(1)?;
    let available: u64 = row.split_whitespace().nth(3)?.parse().ok()?;
    Some(available * 1024)
}
