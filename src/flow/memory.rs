//! Host memory guard for the elastic buffer.

use crate::error::{Result, TapeStreamError};
use crate::utils::format_bytes;
use std::fs;
use tracing::debug;

/// Source of the host's available memory figure.
pub trait MemorySource {
    fn available_bytes(&self) -> Result<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemorySource for SystemMemory {
    fn available_bytes(&self) -> Result<u64> {
        let meminfo = fs::read_to_string("/proc/meminfo")?;
        parse_meminfo(&meminfo).ok_or_else(|| {
            TapeStreamError::config("MemAvailable not reported by /proc/meminfo")
        })
    }
}

/// Fixed figure, for hosts without `/proc` and for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemorySource for FixedMemory {
    fn available_bytes(&self) -> Result<u64> {
        Ok(self.0)
    }
}

fn parse_meminfo(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Refuse a buffer larger than `safe_fraction` of available memory.
pub fn check_capacity(capacity: u64, safe_fraction: f64, source: &dyn MemorySource) -> Result<()> {
    let available = source.available_bytes()?;
    let limit = (available as f64 * safe_fraction) as u64;
    debug!(
        "Memory guard: buffer {} / limit {} ({} available)",
        format_bytes(capacity),
        format_bytes(limit),
        format_bytes(available)
    );

    if capacity > limit {
        return Err(TapeStreamError::config(format!(
            "Buffer of {} exceeds {:.0}% of available memory ({}); lower --memory_buffer",
            format_bytes(capacity),
            safe_fraction * 100.0,
            format_bytes(available)
        )));
    }
    Ok(())
}
