//! VM-profile blobs: sampled counters per (trace, VM state) pair.
//!
//! The on-disk format is a little-endian header (`magic:u32, major:u16,
//! minor:u16`) followed by a flat `count[trace_max * vmst_max]` grid of
//! 64-bit counters. Cell `(t, v)` lives at index `t * vmst_max + v`.

use crate::errors::ProfileError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

pub const MAGIC: u32 = 0x1d50_f007;
pub const MAJOR: u16 = 4;
const HEADER_LEN: usize = 8;

/// Default grid shape when no debug info narrows it down.
pub const DEFAULT_TRACE_MAX: usize = 4096;

/// The fixed VM-state list, index-keyed. Trace 0 is the untraced
/// catch-all.
pub const VMSTATES: [&str; 11] = [
    "interp", "c", "igc", "exit", "record", "opt", "asm", "head", "loop", "jgc", "ffi",
];

pub fn vmst_name(vmst: usize) -> String {
    VMSTATES
        .get(vmst)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("vmst{vmst}"))
}

type Result<T> = std::result::Result<T, ProfileError>;

/// One hot-list entry: a trace, its per-state sample counts, and the total.
#[derive(Debug, Clone, PartialEq)]
pub struct HotTrace {
    /// `None` is the untraced catch-all (trace number 0).
    pub traceno: Option<u16>,
    pub vmst: BTreeMap<String, u64>,
    pub total: u64,
}

/// A parsed VM-profile counter grid.
#[derive(Debug)]
pub struct VmProfile {
    pub major: u16,
    pub minor: u16,
    pub trace_max: usize,
    pub vmst_max: usize,
    counters: Vec<u64>,
    total_cache: OnceLock<u64>,
    vmst_cache: OnceLock<BTreeMap<String, u64>>,
    hot_cache: OnceLock<Vec<HotTrace>>,
}

impl Clone for VmProfile {
    fn clone(&self) -> Self {
        // Memoization caches are recomputed on demand in the clone.
        VmProfile {
            major: self.major,
            minor: self.minor,
            trace_max: self.trace_max,
            vmst_max: self.vmst_max,
            counters: self.counters.clone(),
            total_cache: OnceLock::new(),
            vmst_cache: OnceLock::new(),
            hot_cache: OnceLock::new(),
        }
    }
}

impl PartialEq for VmProfile {
    fn eq(&self, other: &Self) -> bool {
        self.trace_max == other.trace_max
            && self.vmst_max == other.vmst_max
            && self.counters == other.counters
    }
}

impl VmProfile {
    /// Parse a profile blob with the given grid shape.
    pub fn from_bytes(data: &[u8], trace_max: usize, vmst_max: usize) -> Result<VmProfile> {
        if data.len() < HEADER_LEN {
            return Err(ProfileError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProfileError::BadMagic(magic));
        }
        let major = u16::from_le_bytes(data[4..6].try_into().unwrap());
        let minor = u16::from_le_bytes(data[6..8].try_into().unwrap());
        if major != MAJOR {
            return Err(ProfileError::UnsupportedVersion { major, minor });
        }
        let ncells = trace_max * vmst_max;
        let expected = HEADER_LEN + ncells * 8;
        if data.len() < expected {
            return Err(ProfileError::Truncated {
                expected,
                actual: data.len(),
            });
        }
        let counters = data[HEADER_LEN..expected]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        debug!(trace_max, vmst_max, "VM profile parsed");
        Ok(VmProfile {
            major,
            minor,
            trace_max,
            vmst_max,
            counters,
            total_cache: OnceLock::new(),
            vmst_cache: OnceLock::new(),
            hot_cache: OnceLock::new(),
        })
    }

    /// Read a profile file with the default grid shape.
    pub fn load(path: impl AsRef<Path>) -> Result<VmProfile> {
        Self::load_shaped(path, DEFAULT_TRACE_MAX, VMSTATES.len())
    }

    /// Read a profile file with an explicit shape (normally derived from
    /// the audit log's debug info).
    pub fn load_shaped(
        path: impl AsRef<Path>,
        trace_max: usize,
        vmst_max: usize,
    ) -> Result<VmProfile> {
        let file = std::fs::File::open(path)?;
        let data = unsafe { memmap2::Mmap::map(&file)? };
        Self::from_bytes(&data, trace_max, vmst_max)
    }

    /// Write the raw blob back out.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.counters.len() * 8);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&self.major.to_le_bytes());
        out.extend_from_slice(&self.minor.to_le_bytes());
        for cell in &self.counters {
            out.extend_from_slice(&cell.to_le_bytes());
        }
        std::fs::write(path, out)?;
        Ok(())
    }

    pub fn count(&self, traceno: usize, vmst: usize) -> u64 {
        if traceno >= self.trace_max || vmst >= self.vmst_max {
            return 0;
        }
        self.counters[traceno * self.vmst_max + vmst]
    }

    /// Sum over every cell.
    pub fn total_samples(&self) -> u64 {
        *self
            .total_cache
            .get_or_init(|| self.counters.iter().sum())
    }

    /// Per-VM-state sums across all traces.
    pub fn total_vmst_samples(&self) -> &BTreeMap<String, u64> {
        self.vmst_cache.get_or_init(|| {
            let mut sums = BTreeMap::new();
            for vmst in 0..self.vmst_max {
                let total: u64 = (0..self.trace_max).map(|t| self.count(t, vmst)).sum();
                sums.insert(vmst_name(vmst), total);
            }
            sums
        })
    }

    /// Traces with at least one sample, hottest first. Ties keep their
    /// input (trace-number) order.
    pub fn hot_traces(&self) -> &[HotTrace] {
        self.hot_cache.get_or_init(|| {
            let mut hot: Vec<HotTrace> = (0..self.trace_max)
                .filter_map(|t| {
                    let mut vmst = BTreeMap::new();
                    let mut total = 0u64;
                    for v in 0..self.vmst_max {
                        let n = self.count(t, v);
                        if n > 0 {
                            vmst.insert(vmst_name(v), n);
                        }
                        total += n;
                    }
                    (total > 0).then(|| HotTrace {
                        traceno: (t > 0).then_some(t as u16),
                        vmst,
                        total,
                    })
                })
                .collect();
            hot.sort_by(|a, b| b.total.cmp(&a.total));
            hot
        })
    }

    fn check_shape(&self, other: &VmProfile) -> Result<()> {
        if self.trace_max != other.trace_max || self.vmst_max != other.vmst_max {
            return Err(ProfileError::ShapeMismatch {
                a_traces: self.trace_max,
                a_states: self.vmst_max,
                b_traces: other.trace_max,
                b_states: other.vmst_max,
            });
        }
        Ok(())
    }

    /// Counter-wise `other - self`: what happened between two snapshots of
    /// the same profile.
    pub fn delta(&self, other: &VmProfile) -> Result<VmProfile> {
        self.check_shape(other)?;
        let counters = self
            .counters
            .iter()
            .zip(&other.counters)
            .map(|(a, b)| b.wrapping_sub(*a))
            .collect();
        Ok(VmProfile {
            counters,
            ..self.clone()
        })
    }

    /// Counter-wise saturating addition; folds per-file profiles together.
    pub fn sum(&self, other: &VmProfile) -> Result<VmProfile> {
        self.check_shape(other)?;
        let counters = self
            .counters
            .iter()
            .zip(&other.counters)
            .map(|(a, b)| a.saturating_add(*b))
            .collect();
        Ok(VmProfile {
            counters,
            ..self.clone()
        })
    }
}
