// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Host capability boundary
//!
//! Everything the gate needs from the operating system goes through
//! [`HostCapabilities`]. Implementations are simple, stateless query/command
//! functions that may be slow and may fail; the core never calls the OS
//! directly.
//!
//! # Platform Support
//!
//! - **Windows**: token elevation via `windows`, registry via `winreg`, WMI via
//!   `wmi`, certificate stores and event logs via PowerShell, ETW via `logman`
//! - **Unix**: elevation from the effective uid and group membership; all
//!   Windows-only facilities report `Unavailable`

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{FeedCounters, ScriptedHost};

/// Raw answer from the platform elevation probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationProbe {
    /// Principal belongs to the administrators group (elevated or not)
    pub is_administrator: bool,
    /// Process token currently carries administrator rights
    pub is_elevated: bool,
    /// Account name
    pub principal_name: String,
    /// Account domain (host name for local accounts)
    pub principal_domain: String,
    /// Privileges enabled on the process token
    pub enabled_privileges: BTreeSet<String>,
}

/// Registry root key named by the first segment of a key path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistryHive {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl RegistryHive {
    /// Split `HIVE\sub\key` into its hive and subkey path
    pub fn split(path: &str) -> Option<(RegistryHive, &str)> {
        let trimmed = path.trim_matches('\\');
        let (head, rest) = match trimmed.find('\\') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => (trimmed, ""),
        };
        let hive = match head.to_ascii_uppercase().as_str() {
            "HKCR" | "HKEY_CLASSES_ROOT" => RegistryHive::ClassesRoot,
            "HKCU" | "HKEY_CURRENT_USER" => RegistryHive::CurrentUser,
            "HKLM" | "HKEY_LOCAL_MACHINE" => RegistryHive::LocalMachine,
            "HKU" | "HKEY_USERS" => RegistryHive::Users,
            "HKCC" | "HKEY_CURRENT_CONFIG" => RegistryHive::CurrentConfig,
            _ => return None,
        };
        Some((hive, rest))
    }

    /// Hives outside the current user's profile need elevation to watch
    pub fn is_machine_wide(&self) -> bool {
        !matches!(self, RegistryHive::CurrentUser)
    }
}

impl std::fmt::Display for RegistryHive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegistryHive::ClassesRoot => "HKCR",
            RegistryHive::CurrentUser => "HKCU",
            RegistryHive::LocalMachine => "HKLM",
            RegistryHive::Users => "HKU",
            RegistryHive::CurrentConfig => "HKCC",
        };
        write!(f, "{}", name)
    }
}

/// A WMI query against a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WmiQuery {
    pub namespace: String,
    pub query: String,
}

impl WmiQuery {
    pub const CIMV2: &'static str = "root\\CIMV2";

    /// Query the default `root\CIMV2` namespace
    pub fn cimv2(query: impl Into<String>) -> Self {
        Self::new(Self::CIMV2, query)
    }

    pub fn new(namespace: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            query: query.into(),
        }
    }
}

impl std::fmt::Display for WmiQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.namespace, self.query)
    }
}

/// One result row, with values already converted to JSON scalars/arrays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WmiRow(pub BTreeMap<String, serde_json::Value>);

impl WmiRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for adapters and tests
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty trimmed string value
    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Unsigned integer; WMI reports `uint64` properties as strings
    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_u64().map(|v| v != 0),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String array (e.g. `IPAddress`); a scalar string becomes a single entry
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// Filter for an event-log query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogFilter {
    /// XPath-style selector, e.g. `*[System[EventID=4624]]`
    pub xpath: Option<String>,
    /// Upper bound on returned entries
    pub max_events: Option<u32>,
}

/// A single event-log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub record_id: u64,
    pub event_id: u32,
    pub provider: String,
    pub level: String,
    pub time_created: String,
    pub message: String,
}

/// OS resource held open for a monitor session.
///
/// The session owns the handle and closes it on stop or expiry. Delivering
/// change events from the handle is outside this crate.
pub trait MonitorFeed: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Release the underlying OS resource. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Boxed feed as handed back by the host adapter
pub type FeedHandle = Box<dyn MonitorFeed>;

/// Operating-system capabilities consumed by the gate
pub trait HostCapabilities: Send + Sync {
    /// Admin/elevation status of the current process
    fn probe_elevation(&self) -> Result<ElevationProbe>;

    /// Whether a registry key (`HIVE\path`) exists and is readable
    fn registry_key_exists(&self, path: &str) -> Result<bool>;

    /// Validate a registry key and hold it open for a session
    fn open_registry_watch(&self, path: &str) -> Result<FeedHandle>;

    /// Open a certificate store and return the certificate count
    fn cert_store_open(&self, location: &str, name: &str) -> Result<usize>;

    /// Validate a certificate store and take a baseline count for a session
    fn open_cert_watch(&self, location: &str, name: &str) -> Result<FeedHandle>;

    /// Run a WMI query
    fn query_wmi(&self, query: &WmiQuery) -> Result<Vec<WmiRow>>;

    /// Start a real-time trace session for the given providers
    fn start_etw(&self, session_name: &str, providers: &[String]) -> Result<FeedHandle>;

    /// Query an event log
    fn query_event_log(&self, log_name: &str, filter: &EventLogFilter)
        -> Result<Vec<EventLogEntry>>;

    /// Validate an event log and filter and hold them for a session
    fn subscribe_event_log(&self, log_name: &str, filter: &EventLogFilter) -> Result<FeedHandle>;
}

/// Host adapter for the platform this binary was built for
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHost;

impl NativeHost {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(any(unix, windows)))]
impl HostCapabilities for NativeHost {
    fn probe_elevation(&self) -> Result<ElevationProbe> {
        Err(unsupported("elevation probe"))
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
    fn query_event_log(&self, _log: &str, _f: &EventLogFilter) -> Result<Vec<EventLogEntry>> {
        Err(unsupported("event logs"))
    }
    fn subscribe_event_log(&self, _log: &str, _f: &EventLogFilter) -> Result<FeedHandle> {
        Err(unsupported("event logs"))
    }
}

#[allow(dead_code)]
pub(crate) fn unsupported(facility: &str) -> crate::error::AccessError {
    crate::error::AccessError::Unavailable(format!(
        "{} not supported on {}",
        facility,
        std::env::consts::OS
    ))
}
