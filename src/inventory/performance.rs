// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Performance sample sections, read from the formatted perf-counter classes

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::host::{HostCapabilities, WmiQuery};

/// Options for a performance sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceOptions {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_include_processes")]
    pub include_processes: bool,
    /// Number of processes kept, busiest first
    #[serde(default)]
    pub top_processes: Option<usize>,
}

fn default_include_processes() -> bool {
    true
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self {
            correlation_id: None,
            include_processes: true,
            top_processes: None,
        }
    }
}

/// One performance section's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceSection {
    Cpu(CpuSample),
    Memory(MemorySample),
    Disk(Vec<DiskSample>),
    NetworkIo(Vec<NetworkIoSample>),
    Processes(Vec<ProcessSample>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub usage_percent: f64,
    pub logical_processors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSample {
    pub name: String,
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
    pub queue_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkIoSample {
    pub name: String,
    pub bytes_received_per_sec: u64,
    pub bytes_sent_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub name: String,
    pub pid: u32,
    /// Share of total machine CPU, 0-100
    pub cpu_percent: f64,
    pub working_set_private_bytes: u64,
}

/// Counter instances that aggregate rather than describe a real object
fn is_aggregate(name: &str) -> bool {
    name == "_Total" || name == "Idle"
}

pub fn sample_cpu(host: &dyn HostCapabilities) -> Result<CpuSample> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, PercentProcessorTime FROM Win32_PerfFormattedData_PerfOS_Processor WHERE Name = '_Total'",
    ))?;
    let usage = rows
        .iter()
        .find(|r| r.string("Name").as_deref() == Some("_Total"))
        .and_then(|r| r.f64("PercentProcessorTime"))
        .ok_or_else(|| AccessError::Unavailable("no _Total processor counter".into()))?;
    Ok(CpuSample {
        usage_percent: usage.clamp(0.0, 100.0),
        logical_processors: num_cpus::get(),
    })
}

pub fn sample_memory(host: &dyn HostCapabilities) -> Result<MemorySample> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT TotalVisibleMemorySize, FreePhysicalMemory FROM Win32_OperatingSystem",
    ))?;
    let row = rows
        .first()
        .ok_or_else(|| AccessError::Unavailable("Win32_OperatingSystem returned no rows".into()))?;

    // Both properties are in KiB
    let total_bytes = row.u64("TotalVisibleMemorySize").unwrap_or(0) * 1024;
    let available_bytes = row.u64("FreePhysicalMemory").unwrap_or(0) * 1024;
    let used_percent = if total_bytes == 0 {
        0.0
    } else {
        total_bytes.saturating_sub(available_bytes) as f64 / total_bytes as f64 * 100.0
    };
    Ok(MemorySample {
        total_bytes,
        available_bytes,
        used_percent,
    })
}

pub fn sample_disks(host: &dyn HostCapabilities) -> Result<Vec<DiskSample>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, DiskReadBytesPerSec, DiskWriteBytesPerSec, CurrentDiskQueueLength FROM Win32_PerfFormattedData_PerfDisk_PhysicalDisk",
    ))?;
    Ok(rows
        .iter()
        .filter_map(|r| {
            let name = r.string("Name")?;
            if is_aggregate(&name) {
                return None;
            }
            Some(DiskSample {
                name,
                read_bytes_per_sec: r.u64("DiskReadBytesPerSec").unwrap_or(0),
                write_bytes_per_sec: r.u64("DiskWriteBytesPerSec").unwrap_or(0),
                queue_length: r.u64("CurrentDiskQueueLength").unwrap_or(0),
            })
        })
        .collect())
}

pub fn sample_network(host: &dyn HostCapabilities) -> Result<Vec<NetworkIoSample>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, BytesReceivedPersec, BytesSentPersec FROM Win32_PerfFormattedData_Tcpip_NetworkInterface",
    ))?;
    Ok(rows
        .iter()
        .filter_map(|r| {
            Some(NetworkIoSample {
                name: r.string("Name")?,
                bytes_received_per_sec: r.u64("BytesReceivedPersec").unwrap_or(0),
                bytes_sent_per_sec: r.u64("BytesSentPersec").unwrap_or(0),
            })
        })
        .collect())
}

/// Busiest `top` processes by CPU
pub fn sample_processes(host: &dyn HostCapabilities, top: usize) -> Result<Vec<ProcessSample>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, IDProcess, PercentProcessorTime, WorkingSetPrivate FROM Win32_PerfFormattedData_PerfProc_Process",
    ))?;
    // Per-process counters are summed across all logical processors
    let cpus = num_cpus::get().max(1) as f64;

    let mut processes: Vec<ProcessSample> = rows
        .iter()
        .filter_map(|r| {
            let name = r.string("Name")?;
            if is_aggregate(&name) {
                return None;
            }
            Some(ProcessSample {
                name,
                pid: r.u64("IDProcess").unwrap_or(0) as u32,
                cpu_percent: (r.f64("PercentProcessorTime").unwrap_or(0.0) / cpus).min(100.0),
                working_set_private_bytes: r.u64("WorkingSetPrivate").unwrap_or(0),
            })
        })
        .collect();

    processes.sort_by(|a, b| {
        b.cpu_percent
            .partial_cmp(&a.cpu_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.working_set_private_bytes.cmp(&a.working_set_private_bytes))
    });
    processes.truncate(top);
    Ok(processes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ScriptedHost, WmiRow};

    #[test]
    fn test_cpu_total() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let cpu = sample_cpu(&host).unwrap();
        assert_eq!(cpu.usage_percent, 23.0);
        assert!(cpu.logical_processors >= 1);
    }

    #[test]
    fn test_cpu_missing_total() {
        let host = ScriptedHost::new().with_wmi("Win32_PerfFormattedData_PerfOS_Processor", Vec::new());
        assert!(sample_cpu(&host).is_err());
    }

    #[test]
    fn test_memory_in_bytes() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let mem = sample_memory(&host).unwrap();
        assert_eq!(mem.total_bytes, 33_554_432 * 1024);
        assert!((mem.used_percent - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_disks_skip_total() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let disks = sample_disks(&host).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].read_bytes_per_sec, 1_048_576);
    }

    #[test]
    fn test_processes_ranked_and_truncated() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let procs = sample_processes(&host, 1).unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].name, "msedge");
        assert_eq!(procs[0].pid, 4242);

        let all = sample_processes(&host, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|p| p.name != "_Total" && p.name != "Idle"));
    }

    #[test]
    fn test_network_rows_without_name_skipped() {
        let host = ScriptedHost::new().with_wmi(
            "Win32_PerfFormattedData_Tcpip_NetworkInterface",
            vec![
                WmiRow::new().with("BytesSentPersec", "10"),
                WmiRow::new().with("Name", "eth0").with("BytesSentPersec", "10"),
            ],
        );
        let nics = sample_network(&host).unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].bytes_sent_per_sec, 10);
    }
}
