//! Named VM-profile snapshot series attached to an audit-log model.
//!
//! The snapshot rotator drops timestamped profile files next to the audit
//! log; the model keeps them as per-name series and answers windowed
//! queries over them. Counters are cumulative, so a window spanning two
//! snapshots answers with their delta.

use crate::auditlog::AuditModel;
use crate::errors::{ModelError, Result};
use crate::vmprofile::{VmProfile, DEFAULT_TRACE_MAX, VMSTATES};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One profile file at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub profile: VmProfile,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl AuditModel {
    /// Grid shape for profiles belonging to this log, from its debug info
    /// where available.
    pub fn profile_shape(&self) -> (usize, usize) {
        let trace_max = self
            .dwarf
            .constant("LJ_VMPROFILE_TRACE_MAX")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_TRACE_MAX);
        let vmst_max = self
            .dwarf
            .constant("LJ_VMST__MAX")
            .map(|v| v as usize)
            .unwrap_or(VMSTATES.len());
        (trace_max, vmst_max)
    }

    /// Append a profile file under its file name. Timestamps within one
    /// name must be non-decreasing; omitted timestamps mean now.
    pub fn add_profile(&mut self, path: impl AsRef<Path>, timestamp: Option<f64>) -> Result<()> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let (trace_max, vmst_max) = self.profile_shape();
        let profile = VmProfile::load_shaped(path, trace_max, vmst_max)?;
        self.add_profile_named(name, profile, timestamp.unwrap_or_else(now_secs))
    }

    pub fn add_profile_named(
        &mut self,
        name: String,
        profile: VmProfile,
        timestamp: f64,
    ) -> Result<()> {
        let snapshots = self.profiles.entry(name.clone()).or_default();
        if let Some(last) = snapshots.last() {
            if timestamp < last.timestamp {
                return Err(ModelError::ProfileOrder(name));
            }
        }
        snapshots.push(Snapshot { timestamp, profile });
        Ok(())
    }

    pub fn profiles(&self) -> &BTreeMap<String, Vec<Snapshot>> {
        &self.profiles
    }

    /// One profile per name for the given time window.
    ///
    /// Bounds are seconds since the epoch; a negative `endtime` means
    /// `now + endtime`, a negative `starttime` is relative to the window's
    /// end. A window holding one snapshot answers with it as-is; a window
    /// spanning several answers with the delta between the first and last.
    pub fn select_profiles(
        &self,
        starttime: Option<f64>,
        endtime: Option<f64>,
    ) -> BTreeMap<String, VmProfile> {
        let now = now_secs();
        let end = match endtime {
            None => f64::INFINITY,
            Some(e) if e < 0.0 => now + e,
            Some(e) => e,
        };
        let anchor = if end.is_finite() { end } else { now };
        let start = match starttime {
            None => f64::NEG_INFINITY,
            Some(s) if s < 0.0 => anchor + s,
            Some(s) => s,
        };

        let mut selected = BTreeMap::new();
        for (name, snapshots) in &self.profiles {
            let window: Vec<&Snapshot> = snapshots
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp <= end)
                .collect();
            match window.as_slice() {
                [] => {}
                [only] => {
                    selected.insert(name.clone(), only.profile.clone());
                }
                [first, .., last] => match first.profile.delta(&last.profile) {
                    Ok(delta) => {
                        selected.insert(name.clone(), delta);
                    }
                    Err(err) => {
                        warn!(name = %name, error = %err, "profile snapshots disagree on shape")
                    }
                },
            }
        }
        selected
    }
}
