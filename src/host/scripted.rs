// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Scriptable host adapter for tests and benchmarks
//!
//! Behaviour is configured up front with builder methods; elevation can also
//! be flipped at runtime to check that capability snapshots are never cached.
//! Every feed handed out is counted so tests can assert that no session
//! handle leaks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use super::{
    ElevationProbe, EventLogEntry, EventLogFilter, FeedHandle, HostCapabilities, MonitorFeed,
    WmiQuery, WmiRow,
};
use crate::error::{AccessError, Result};

/// Shared open/close counters for feeds handed out by a [`ScriptedHost`]
#[derive(Debug, Clone, Default)]
pub struct FeedCounters {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FeedCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Feeds opened and not yet closed
    pub fn live(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }
}

type LiveTraces = Arc<Mutex<BTreeSet<String>>>;

struct ScriptedFeed {
    description: String,
    counters: FeedCounters,
    /// Trace session name to release on close
    trace: Option<(String, LiveTraces)>,
    closed: bool,
}

impl MonitorFeed for ScriptedFeed {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some((name, live)) = self.trace.take() {
                lock(&live).remove(&name);
            }
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
enum ProbeBehavior {
    Answer,
    Fail(String),
    Panic,
}

#[derive(Debug, Clone)]
enum WmiBehavior {
    Rows(Vec<WmiRow>),
    Denied(String),
    Unavailable(String),
    Hang(Duration, Vec<WmiRow>),
    Panic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Granted,
    Denied,
}

/// Host adapter whose answers are scripted by the test
pub struct ScriptedHost {
    probe: Mutex<ElevationProbe>,
    probe_behavior: Mutex<ProbeBehavior>,
    probe_calls: AtomicUsize,
    registry: BTreeMap<String, Access>,
    cert_stores: BTreeMap<(String, String), Option<usize>>,
    wmi: BTreeMap<String, WmiBehavior>,
    trace_providers: BTreeSet<String>,
    /// Trace session names currently running; duplicates are refused
    live_traces: LiveTraces,
    event_logs: BTreeMap<String, Option<Vec<EventLogEntry>>>,
    feeds: FeedCounters,
    open_delay: Option<Duration>,
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHost {
    /// A standard, non-elevated user with no resources
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(ElevationProbe {
                is_administrator: false,
                is_elevated: false,
                principal_name: "operator".into(),
                principal_domain: "WORKSTATION".into(),
                enabled_privileges: ["SeChangeNotifyPrivilege".to_string()].into_iter().collect(),
            }),
            probe_behavior: Mutex::new(ProbeBehavior::Answer),
            probe_calls: AtomicUsize::new(0),
            registry: BTreeMap::new(),
            cert_stores: BTreeMap::new(),
            wmi: BTreeMap::new(),
            trace_providers: BTreeSet::new(),
            live_traces: Arc::new(Mutex::new(BTreeSet::new())),
            event_logs: BTreeMap::new(),
            feeds: FeedCounters::default(),
            open_delay: None,
        }
    }

    /// Run as an elevated administrator
    pub fn elevated(self) -> Self {
        self.set_elevated(true);
        self
    }

    /// Administrator with a filtered (non-elevated) token
    pub fn filtered_admin(self) -> Self {
        {
            let mut probe = lock(&self.probe);
            probe.is_administrator = true;
            probe.is_elevated = false;
        }
        self
    }

    /// Flip elevation at runtime, as after a UAC prompt
    pub fn set_elevated(&self, elevated: bool) {
        let mut probe = lock(&self.probe);
        probe.is_elevated = elevated;
        probe.is_administrator = elevated || probe.is_administrator;
        if elevated {
            probe.enabled_privileges.insert("SeDebugPrivilege".into());
            probe.enabled_privileges.insert("SeSecurityPrivilege".into());
        }
    }

    pub fn failing_probe(self, message: &str) -> Self {
        *lock(&self.probe_behavior) = ProbeBehavior::Fail(message.to_string());
        self
    }

    pub fn panicking_probe(self) -> Self {
        *lock(&self.probe_behavior) = ProbeBehavior::Panic;
        self
    }

    pub fn with_registry_key(mut self, path: &str) -> Self {
        self.registry.insert(path.to_ascii_uppercase(), Access::Granted);
        self
    }

    pub fn with_denied_registry_key(mut self, path: &str) -> Self {
        self.registry.insert(path.to_ascii_uppercase(), Access::Denied);
        self
    }

    pub fn with_cert_store(mut self, location: &str, name: &str, count: usize) -> Self {
        self.cert_stores.insert(store_key(location, name), Some(count));
        self
    }

    pub fn with_denied_cert_store(mut self, location: &str, name: &str) -> Self {
        self.cert_stores.insert(store_key(location, name), None);
        self
    }

    pub fn with_wmi(mut self, class: &str, rows: Vec<WmiRow>) -> Self {
        self.wmi.insert(class.to_ascii_lowercase(), WmiBehavior::Rows(rows));
        self
    }

    pub fn denied_wmi(mut self, class: &str) -> Self {
        self.wmi.insert(
            class.to_ascii_lowercase(),
            WmiBehavior::Denied(format!("{}: WBEM_E_ACCESS_DENIED", class)),
        );
        self
    }

    pub fn failing_wmi(mut self, class: &str, message: &str) -> Self {
        self.wmi.insert(
            class.to_ascii_lowercase(),
            WmiBehavior::Unavailable(message.to_string()),
        );
        self
    }

    pub fn hanging_wmi(mut self, class: &str, delay: Duration) -> Self {
        let rows = match self.wmi.get(&class.to_ascii_lowercase()) {
            Some(WmiBehavior::Rows(rows)) => rows.clone(),
            _ => Vec::new(),
        };
        self.wmi
            .insert(class.to_ascii_lowercase(), WmiBehavior::Hang(delay, rows));
        self
    }

    pub fn panicking_wmi(mut self, class: &str) -> Self {
        self.wmi.insert(
            class.to_ascii_lowercase(),
            WmiBehavior::Panic(format!("{} provider crashed", class)),
        );
        self
    }

    pub fn with_trace_provider(mut self, provider: &str) -> Self {
        self.trace_providers.insert(provider.to_ascii_lowercase());
        self
    }

    pub fn with_event_log(mut self, log_name: &str, entries: Vec<EventLogEntry>) -> Self {
        self.event_logs
            .insert(log_name.to_ascii_lowercase(), Some(entries));
        self
    }

    pub fn with_denied_event_log(mut self, log_name: &str) -> Self {
        self.event_logs.insert(log_name.to_ascii_lowercase(), None);
        self
    }

    /// Sleep inside every feed-opening call, widening race windows
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Rows for every class the inventory and performance sections query
    pub fn with_inventory_fixture(self) -> Self {
        self.with_wmi(
            "Win32_ComputerSystem",
            vec![WmiRow::new()
                .with("Manufacturer", "Contoso")
                .with("Model", "Workstation 9000")
                .with("Domain", "corp.contoso.com")
                .with("TotalPhysicalMemory", "34359738368")],
        )
        .with_wmi(
            "Win32_BIOS",
            vec![WmiRow::new()
                .with("SerialNumber", "CZC1234XYZ")
                .with("SMBIOSBIOSVersion", "1.18.0")],
        )
        .with_wmi(
            "Win32_Processor",
            vec![WmiRow::new()
                .with("Name", "Contoso Core 16-Thread @ 3.2GHz")
                .with("NumberOfCores", 8)
                .with("NumberOfLogicalProcessors", 16)],
        )
        .with_wmi(
            "Win32_SystemDriver",
            vec![
                WmiRow::new()
                    .with("Name", "disk")
                    .with("DisplayName", "Disk Driver")
                    .with("State", "Running")
                    .with("StartMode", "Boot")
                    .with("PathName", "C:\\Windows\\system32\\drivers\\disk.sys"),
                WmiRow::new()
                    .with("Name", "tcpip")
                    .with("DisplayName", "TCP/IP Protocol Driver")
                    .with("State", "Running")
                    .with("StartMode", "Boot"),
            ],
        )
        .with_wmi(
            "Win32_LogicalDisk",
            vec![WmiRow::new()
                .with("DeviceID", "C:")
                .with("VolumeName", "OS")
                .with("FileSystem", "NTFS")
                .with("Size", "511101108224")
                .with("FreeSpace", "201326592000")],
        )
        .with_wmi(
            "Win32_NetworkAdapterConfiguration",
            vec![WmiRow::new()
                .with("Description", "Contoso Gigabit Ethernet")
                .with("MACAddress", "00:11:22:33:44:55")
                .with("IPAddress", json!(["10.0.0.5", "fe80::1"]))
                .with("DHCPEnabled", true)],
        )
        .with_wmi(
            "Win32_Battery",
            vec![WmiRow::new()
                .with("BatteryStatus", 2)
                .with("EstimatedChargeRemaining", 87)],
        )
        .with_wmi(
            "Win32_PowerPlan",
            vec![WmiRow::new()
                .with("ElementName", "Balanced")
                .with("IsActive", true)],
        )
        .with_wmi(
            "Win32_EncryptableVolume",
            vec![WmiRow::new()
                .with("DriveLetter", "C:")
                .with("ProtectionStatus", 1)
                .with("EncryptionMethod", 7)],
        )
        .with_wmi(
            "Win32_PerfFormattedData_PerfOS_Processor",
            vec![WmiRow::new()
                .with("Name", "_Total")
                .with("PercentProcessorTime", "23")],
        )
        .with_wmi(
            "Win32_OperatingSystem",
            vec![WmiRow::new()
                .with("TotalVisibleMemorySize", "33554432")
                .with("FreePhysicalMemory", "16777216")],
        )
        .with_wmi(
            "Win32_PerfFormattedData_PerfDisk_PhysicalDisk",
            vec![
                WmiRow::new()
                    .with("Name", "0 C:")
                    .with("DiskReadBytesPerSec", "1048576")
                    .with("DiskWriteBytesPerSec", "524288")
                    .with("CurrentDiskQueueLength", 1),
                WmiRow::new().with("Name", "_Total"),
            ],
        )
        .with_wmi(
            "Win32_PerfFormattedData_Tcpip_NetworkInterface",
            vec![WmiRow::new()
                .with("Name", "Contoso Gigabit Ethernet")
                .with("BytesReceivedPersec", "20480")
                .with("BytesSentPersec", "4096")],
        )
        .with_wmi(
            "Win32_PerfFormattedData_PerfProc_Process",
            vec![
                WmiRow::new()
                    .with("Name", "_Total")
                    .with("IDProcess", 0)
                    .with("PercentProcessorTime", "100"),
                WmiRow::new()
                    .with("Name", "Idle")
                    .with("IDProcess", 0)
                    .with("PercentProcessorTime", "77"),
                WmiRow::new()
                    .with("Name", "msedge")
                    .with("IDProcess", 4242)
                    .with("PercentProcessorTime", "12")
                    .with("WorkingSetPrivate", "157286400"),
                WmiRow::new()
                    .with("Name", "svchost")
                    .with("IDProcess", 912)
                    .with("PercentProcessorTime", "3")
                    .with("WorkingSetPrivate", "20971520"),
            ],
        )
    }

    /// Open/close counters for every feed this host handed out
    pub fn feeds(&self) -> FeedCounters {
        self.feeds.clone()
    }

    /// Number of elevation probes served
    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Names of the trace sessions currently running
    pub fn live_trace_sessions(&self) -> Vec<String> {
        lock(&self.live_traces).iter().cloned().collect()
    }

    fn open_feed(&self, description: String) -> FeedHandle {
        self.open_feed_with(description, None)
    }

    fn open_feed_with(&self, description: String, trace: Option<(String, LiveTraces)>) -> FeedHandle {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        self.feeds.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedFeed {
            description,
            counters: self.feeds.clone(),
            trace,
            closed: false,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn store_key(location: &str, name: &str) -> (String, String) {
    (location.to_ascii_lowercase(), name.to_ascii_lowercase())
}

/// Class name following `FROM` in a WQL query
fn wql_class(query: &str) -> Option<String> {
    let mut words = query.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("from") {
            return words.next().map(|c| c.to_ascii_lowercase());
        }
    }
    None
}

impl HostCapabilities for ScriptedHost {
    fn probe_elevation(&self) -> Result<ElevationProbe> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.probe_behavior).clone();
        match behavior {
            ProbeBehavior::Answer => Ok(lock(&self.probe).clone()),
            ProbeBehavior::Fail(msg) => Err(AccessError::Unavailable(msg)),
            ProbeBehavior::Panic => panic!("token query crashed"),
        }
    }

    fn registry_key_exists(&self, path: &str) -> Result<bool> {
        match self.registry.get(&path.to_ascii_uppercase()) {
            Some(Access::Granted) => Ok(true),
            Some(Access::Denied) => Err(AccessError::AccessDenied(path.to_string())),
            None => Ok(false),
        }
    }

    fn open_registry_watch(&self, path: &str) -> Result<FeedHandle> {
        if !self.registry_key_exists(path)? {
            return Err(AccessError::NotFound(path.to_string()));
        }
        Ok(self.open_feed(format!("registry watch on {}", path)))
    }

    fn cert_store_open(&self, location: &str, name: &str) -> Result<usize> {
        let label = format!("{}\\{}", location, name);
        match self.cert_stores.get(&store_key(location, name)) {
            Some(Some(count)) => Ok(*count),
            Some(None) => Err(AccessError::AccessDenied(label)),
            None => Err(AccessError::NotFound(label)),
        }
    }

    fn open_cert_watch(&self, location: &str, name: &str) -> Result<FeedHandle> {
        let count = self.cert_store_open(location, name)?;
        Ok(self.open_feed(format!(
            "certificate watch on {}\\{} ({} certificates)",
            location, name, count
        )))
    }

    fn query_wmi(&self, query: &WmiQuery) -> Result<Vec<WmiRow>> {
        let class = wql_class(&query.query)
            .ok_or_else(|| AccessError::InvalidRequest(format!("bad WQL: {}", query.query)))?;
        match self.wmi.get(&class) {
            Some(WmiBehavior::Rows(rows)) => Ok(rows.clone()),
            Some(WmiBehavior::Denied(msg)) => Err(AccessError::AccessDenied(msg.clone())),
            Some(WmiBehavior::Unavailable(msg)) => Err(AccessError::Unavailable(msg.clone())),
            Some(WmiBehavior::Hang(delay, rows)) => {
                std::thread::sleep(*delay);
                Ok(rows.clone())
            }
            Some(WmiBehavior::Panic(msg)) => panic!("{}", msg),
            None => Err(AccessError::Unavailable(format!(
                "{}: invalid class",
                query
            ))),
        }
    }

    fn start_etw(&self, session_name: &str, providers: &[String]) -> Result<FeedHandle> {
        if providers.is_empty() {
            return Err(AccessError::InvalidRequest("no trace providers given".into()));
        }
        if let Some(unknown) = providers
            .iter()
            .find(|p| !self.trace_providers.contains(&p.to_ascii_lowercase()))
        {
            return Err(AccessError::NotFound(format!("trace provider {}", unknown)));
        }
        // Session names are machine-wide, as with `logman -ets`
        if !lock(&self.live_traces).insert(session_name.to_string()) {
            return Err(AccessError::Conflict(format!("trace session {}", session_name)));
        }
        Ok(self.open_feed_with(
            format!("trace session {} ({} providers)", session_name, providers.len()),
            Some((session_name.to_string(), Arc::clone(&self.live_traces))),
        ))
    }

    fn query_event_log(
        &self,
        log_name: &str,
        filter: &EventLogFilter,
    ) -> Result<Vec<EventLogEntry>> {
        match self.event_logs.get(&log_name.to_ascii_lowercase()) {
            Some(Some(entries)) => {
                let limit = filter.max_events.unwrap_or(u32::MAX) as usize;
                Ok(entries.iter().take(limit).cloned().collect())
            }
            Some(None) => Err(AccessError::AccessDenied(log_name.to_string())),
            None => Err(AccessError::NotFound(format!("event log {}", log_name))),
        }
    }

    fn subscribe_event_log(&self, log_name: &str, filter: &EventLogFilter) -> Result<FeedHandle> {
        self.query_event_log(log_name, filter)?;
        Ok(self.open_feed(format!("event log subscription on {}", log_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wql_class_extraction() {
        assert_eq!(
            wql_class("SELECT Name FROM Win32_BIOS WHERE x = 1").as_deref(),
            Some("win32_bios")
        );
        assert_eq!(wql_class("SELECT *"), None);
    }

    #[test]
    fn test_feed_counters_track_close_once() {
        let host = ScriptedHost::new().with_registry_key("HKCU\\Software\\Test");
        let mut feed = host.open_registry_watch("HKCU\\Software\\Test").unwrap();
        assert_eq!(host.feeds().live(), 1);
        feed.close();
        feed.close();
        drop(feed);
        assert_eq!(host.feeds().opened(), 1);
        assert_eq!(host.feeds().closed(), 1);
    }

    #[test]
    fn test_trace_names_are_exclusive_while_running() {
        let host = ScriptedHost::new().with_trace_provider("Microsoft-Windows-Kernel-Process");
        let providers = vec!["Microsoft-Windows-Kernel-Process".to_string()];
        let mut feed = host.start_etw("pgate-trace-x", &providers).unwrap();
        let err = host.start_etw("pgate-trace-x", &providers).err().unwrap();
        assert_eq!(err.to_string(), "trace session pgate-trace-x already exists");
        assert_eq!(host.live_trace_sessions(), vec!["pgate-trace-x".to_string()]);

        feed.close();
        assert!(host.live_trace_sessions().is_empty());
        assert!(host.start_etw("pgate-trace-x", &providers).is_ok());
    }

    #[test]
    fn test_runtime_elevation_toggle() {
        let host = ScriptedHost::new();
        assert!(!host.probe_elevation().unwrap().is_elevated);
        host.set_elevated(true);
        assert!(host.probe_elevation().unwrap().is_elevated);
        assert_eq!(host.probe_calls(), 2);
    }
}
