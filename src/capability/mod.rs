// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Capability probe
//!
//! Answers "what can this process do right now": elevation, administrator
//! membership, and the enabled privilege set. A snapshot is recomputed on
//! every call because elevation can change between calls. The probe never
//! fails; any error (or a panicking host adapter) degrades to least
//! privilege with `error` set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::host::HostCapabilities;

/// Point-in-time view of the process's privileges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub is_elevated: bool,
    pub is_administrator: bool,
    pub principal_name: String,
    pub principal_domain: String,
    pub enabled_privileges: BTreeSet<String>,
    pub checked_at: DateTime<Utc>,
    /// Set when the probe failed and the snapshot is least privilege
    pub error: Option<String>,
}

impl CapabilitySnapshot {
    /// Least-privilege snapshot carrying the probe failure
    pub fn least_privilege(error: impl Into<String>) -> Self {
        Self {
            is_elevated: false,
            is_administrator: false,
            principal_name: String::new(),
            principal_domain: String::new(),
            enabled_privileges: BTreeSet::new(),
            checked_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    /// `DOMAIN\name`, or just the name when the domain is unknown
    pub fn principal(&self) -> String {
        if self.principal_domain.is_empty() {
            self.principal_name.clone()
        } else {
            format!("{}\\{}", self.principal_domain, self.principal_name)
        }
    }

    pub fn has_privilege(&self, name: &str) -> bool {
        self.enabled_privileges
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
    }
}

/// Queries the host for the current capability snapshot
#[derive(Clone)]
pub struct CapabilityProbe {
    host: Arc<dyn HostCapabilities>,
}

impl CapabilityProbe {
    pub fn new(host: Arc<dyn HostCapabilities>) -> Self {
        Self { host }
    }

    /// Take a fresh snapshot. Never fails and never caches.
    pub fn snapshot(&self) -> CapabilitySnapshot {
        let host = Arc::clone(&self.host);
        let probed = panic::catch_unwind(AssertUnwindSafe(move || host.probe_elevation()));

        match probed {
            Ok(Ok(probe)) => CapabilitySnapshot {
                is_elevated: probe.is_elevated,
                // An elevated token always implies administrator rights
                is_administrator: probe.is_administrator || probe.is_elevated,
                principal_name: probe.principal_name,
                principal_domain: probe.principal_domain,
                enabled_privileges: probe.enabled_privileges,
                checked_at: Utc::now(),
                error: None,
            },
            Ok(Err(e)) => {
                log::warn!("Elevation probe failed: {}", e);
                CapabilitySnapshot::least_privilege(e.to_string())
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!("Elevation probe panicked: {}", msg);
                CapabilitySnapshot::least_privilege(format!("elevation probe panicked: {}", msg))
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ScriptedHost;

    fn probe_for(host: ScriptedHost) -> (CapabilityProbe, Arc<ScriptedHost>) {
        let host = Arc::new(host);
        (CapabilityProbe::new(host.clone()), host)
    }

    #[test]
    fn test_standard_user_snapshot() {
        let (probe, _) = probe_for(ScriptedHost::new());
        let snap = probe.snapshot();
        assert!(!snap.is_elevated);
        assert!(!snap.is_administrator);
        assert!(snap.error.is_none());
        assert_eq!(snap.principal(), "WORKSTATION\\operator");
        assert!(snap.has_privilege("sechangenotifyprivilege"));
    }

    #[test]
    fn test_filtered_admin_is_not_elevated() {
        let (probe, _) = probe_for(ScriptedHost::new().filtered_admin());
        let snap = probe.snapshot();
        assert!(snap.is_administrator);
        assert!(!snap.is_elevated);
    }

    #[test]
    fn test_probe_error_degrades_to_least_privilege() {
        let (probe, _) = probe_for(ScriptedHost::new().elevated().failing_probe("token gone"));
        let snap = probe.snapshot();
        assert!(!snap.is_elevated);
        assert!(!snap.is_administrator);
        assert!(snap.error.as_deref().unwrap().contains("token gone"));
    }

    #[test]
    fn test_probe_panic_degrades_to_least_privilege() {
        let (probe, _) = probe_for(ScriptedHost::new().panicking_probe());
        let snap = probe.snapshot();
        assert!(!snap.is_elevated);
        assert!(snap.error.as_deref().unwrap().contains("panicked"));
    }

    #[test]
    fn test_snapshot_is_never_cached() {
        let (probe, host) = probe_for(ScriptedHost::new());
        assert!(!probe.snapshot().is_elevated);
        host.set_elevated(true);
        assert!(probe.snapshot().is_elevated);
        assert_eq!(host.probe_calls(), 2);
    }
}
