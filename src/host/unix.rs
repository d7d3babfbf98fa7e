// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Unix host adapter
//!
//! Only the elevation probe is meaningful here. Registry, certificate-store,
//! WMI, ETW and event-log facilities report `Unavailable`, which the
//! collectors turn into partial-degradation warnings.

use std::collections::BTreeSet;

use nix::unistd::{getgroups, Gid, Group, Uid, User};

use super::{
    unsupported, ElevationProbe, EventLogEntry, EventLogFilter, FeedHandle, HostCapabilities,
    NativeHost, WmiQuery, WmiRow,
};
use crate::error::Result;

/// Groups whose members can obtain root through sudo/doas
const ADMIN_GROUPS: &[&str] = &["wheel", "sudo", "admin"];

/// Linux capability bits reported as enabled privileges
#[cfg(target_os = "linux")]
const CAPABILITY_NAMES: &[(u32, &str)] = &[
    (1, "CAP_DAC_OVERRIDE"),
    (2, "CAP_DAC_READ_SEARCH"),
    (12, "CAP_NET_ADMIN"),
    (19, "CAP_SYS_PTRACE"),
    (21, "CAP_SYS_ADMIN"),
    (38, "CAP_PERFMON"),
    (39, "CAP_BPF"),
];

impl HostCapabilities for NativeHost {
    fn probe_elevation(&self) -> Result<ElevationProbe> {
        let euid = Uid::effective();
        let is_elevated = euid.is_root();

        let user = User::from_uid(euid)
            .map_err(|e| crate::error::AccessError::Unavailable(format!("user lookup: {}", e)))?;
        let principal_name = user
            .as_ref()
            .map(|u| u.name.clone())
            .unwrap_or_else(|| euid.to_string());

        let mut gids: Vec<Gid> = getgroups().unwrap_or_default();
        if let Some(u) = &user {
            gids.push(u.gid);
        }
        let in_admin_group = gids.iter().any(|gid| {
            Group::from_gid(*gid)
                .ok()
                .flatten()
                .map(|g| ADMIN_GROUPS.contains(&g.name.as_str()))
                .unwrap_or(false)
        });

        let principal_domain = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ElevationProbe {
            is_administrator: is_elevated || in_admin_group,
            is_elevated,
            principal_name,
            principal_domain,
            enabled_privileges: effective_capabilities(),
        })
    }

    fn registry_key_exists(&self, _path: &str) -> Result<bool> {
        Err(unsupported("registry"))
    }

    fn open_registry_watch(&self, _path: &str) -> Result<FeedHandle> {
        Err(unsupported("registry"))
    }

    fn cert_store_open(&self, _location: &str, _name: &str) -> Result<usize> {
        Err(unsupported("certificate stores"))
    }

    fn open_cert_watch(&self, _location: &str, _name: &str) -> Result<FeedHandle> {
        Err(unsupported("certificate stores"))
    }

    fn query_wmi(&self, _query: &WmiQuery) -> Result<Vec<WmiRow>> {
        Err(unsupported("WMI"))
    }

    fn start_etw(&self, _session_name: &str, _providers: &[String]) -> Result<FeedHandle> {
        Err(unsupported("event tracing"))
    }

    fn query_event_log(
        &self,
        _log_name: &str,
        _filter: &EventLogFilter,
    ) -> Result<Vec<EventLogEntry>> {
        Err(unsupported("event logs"))
    }

    fn subscribe_event_log(&self, _log_name: &str, _filter: &EventLogFilter) -> Result<FeedHandle> {
        Err(unsupported("event logs"))
    }
}

#[cfg(target_os = "linux")]
fn effective_capabilities() -> BTreeSet<String> {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(s) => s,
        Err(_) => return BTreeSet::new(),
    };
    let mask = status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
        .unwrap_or(0);
    capability_names(mask)
}

#[cfg(not(target_os = "linux"))]
fn effective_capabilities() -> BTreeSet<String> {
    BTreeSet::new()
}

#[cfg(target_os = "linux")]
fn capability_names(mask: u64) -> BTreeSet<String> {
    CAPABILITY_NAMES
        .iter()
        .filter(|(bit, _)| mask & (1u64 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}
