// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Inventory and performance orchestration
//!
//! Builds the fixed section collectors, stamps the report with the device
//! and correlation ids, and hands them to the [`IsolationRunner`]. The
//! security section asks the consent gate from inside its own collector, so
//! a denial degrades only that section.

pub mod performance;
pub mod sections;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cancel::CancelToken;
use crate::collect::{CollectionReport, IsolationRunner, RunContext, SectionCollector, SectionName};
use crate::consent::{ConsentGate, ConsentRequest, RiskLevel};
use crate::error::AccessError;
use crate::host::HostCapabilities;

pub use performance::{PerformanceOptions, PerformanceSection};
pub use sections::InventorySection;

/// Processes kept in a performance sample unless the caller asks otherwise
pub const DEFAULT_TOP_PROCESSES: usize = 10;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation id such as `inv-1760000000000-3`
pub fn next_correlation_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, millis, counter)
}

/// Produces inventory snapshots and performance samples
#[derive(Clone)]
pub struct InventoryService {
    host: Arc<dyn HostCapabilities>,
    gate: ConsentGate,
    runner: IsolationRunner,
    device_id: String,
    top_processes: usize,
    root: CancelToken,
}

impl InventoryService {
    pub fn new(
        host: Arc<dyn HostCapabilities>,
        gate: ConsentGate,
        runner: IsolationRunner,
        device_id: impl Into<String>,
        root: CancelToken,
    ) -> Self {
        Self {
            host,
            gate,
            runner,
            device_id: device_id.into(),
            top_processes: DEFAULT_TOP_PROCESSES,
            root,
        }
    }

    pub fn with_top_processes(mut self, top: usize) -> Self {
        self.top_processes = top;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn context(&self, correlation_id: Option<String>, prefix: &str, cancel: &CancelToken) -> RunContext {
        RunContext {
            correlation_id: correlation_id
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| next_correlation_id(prefix)),
            device_id: self.device_id.clone(),
            cancel: cancel.child(),
        }
    }

    /// Best-effort snapshot of hardware, drivers, storage, network, power and
    /// security state
    pub fn get_inventory(&self, correlation_id: Option<String>) -> CollectionReport<InventorySection> {
        self.get_inventory_with(correlation_id, &self.root)
    }

    /// [`get_inventory`](Self::get_inventory) bound to a caller's signal
    pub fn get_inventory_with(
        &self,
        correlation_id: Option<String>,
        cancel: &CancelToken,
    ) -> CollectionReport<InventorySection> {
        let ctx = self.context(correlation_id, "inv", cancel);
        log::info!("Collecting inventory [{}]", ctx.correlation_id);

        let host = &self.host;
        let collectors = vec![
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Hardware, move || {
                    sections::collect_hardware(host.as_ref()).map(InventorySection::Hardware)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Drivers, move || {
                    sections::collect_drivers(host.as_ref()).map(InventorySection::Drivers)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Storage, move || {
                    sections::collect_storage(host.as_ref()).map(InventorySection::Storage)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Network, move || {
                    sections::collect_network(host.as_ref()).map(InventorySection::Network)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Power, move || {
                    sections::collect_power(host.as_ref()).map(InventorySection::Power)
                })
            },
            self.security_collector(ctx.correlation_id.clone()),
        ];

        let report = self.runner.run(&ctx, collectors);
        log::info!(
            "Inventory [{}] done: {} of {} sections, {} warning(s)",
            report.correlation_id,
            report.populated(),
            report.sections.len(),
            report.warnings.len()
        );
        report
    }

    fn security_collector(&self, correlation_id: String) -> SectionCollector<InventorySection> {
        let host = Arc::clone(&self.host);
        let gate = self.gate.clone();
        SectionCollector::new(SectionName::Security, move || {
            let request = ConsentRequest::new(
                "ReadBitLockerStatus",
                RiskLevel::Medium,
                "read volume encryption status for inventory",
            )
            .with_correlation_id(correlation_id);
            if !gate.request_consent(&request).granted {
                return Err(AccessError::AccessDenied("may require elevation".into()));
            }
            sections::collect_security(host.as_ref()).map(InventorySection::Security)
        })
    }

    /// Point-in-time CPU, memory, disk, network and process counters
    pub fn get_performance_sample(
        &self,
        options: PerformanceOptions,
    ) -> CollectionReport<PerformanceSection> {
        self.get_performance_sample_with(options, &self.root)
    }

    pub fn get_performance_sample_with(
        &self,
        options: PerformanceOptions,
        cancel: &CancelToken,
    ) -> CollectionReport<PerformanceSection> {
        let ctx = self.context(options.correlation_id.clone(), "perf", cancel);
        log::debug!("Sampling performance [{}]", ctx.correlation_id);

        let host = &self.host;
        let mut collectors = vec![
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Cpu, move || {
                    performance::sample_cpu(host.as_ref()).map(PerformanceSection::Cpu)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Memory, move || {
                    performance::sample_memory(host.as_ref()).map(PerformanceSection::Memory)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::Disk, move || {
                    performance::sample_disks(host.as_ref()).map(PerformanceSection::Disk)
                })
            },
            {
                let host = Arc::clone(host);
                SectionCollector::new(SectionName::NetworkIo, move || {
                    performance::sample_network(host.as_ref()).map(PerformanceSection::NetworkIo)
                })
            },
        ];

        if options.include_processes {
            let host = Arc::clone(host);
            let top = options.top_processes.unwrap_or(self.top_processes);
            collectors.push(SectionCollector::new(SectionName::Processes, move || {
                performance::sample_processes(host.as_ref(), top).map(PerformanceSection::Processes)
            }));
        }

        self.runner.run(&ctx, collectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityProbe;
    use crate::consent::{AuditTrail, UserResponse};
    use crate::host::ScriptedHost;
    use std::time::Duration;

    fn service(host: ScriptedHost) -> (InventoryService, Arc<AuditTrail>) {
        let host = Arc::new(host);
        let audit = Arc::new(AuditTrail::new(16));
        let gate = ConsentGate::new(CapabilityProbe::new(host.clone()), audit.clone());
        let svc = InventoryService::new(
            host,
            gate,
            IsolationRunner::new(Duration::from_secs(5)),
            "dev-1",
            CancelToken::new(),
        );
        (svc, audit)
    }

    #[test]
    fn test_elevated_inventory_complete() {
        let (svc, audit) = service(ScriptedHost::new().elevated().with_inventory_fixture());
        let report = svc.get_inventory(Some("c-1".into()));
        assert!(report.success);
        assert_eq!(report.populated(), 6);
        assert!(report.warnings.is_empty());
        assert_eq!(report.correlation_id, "c-1");
        assert_eq!(report.device_id, "dev-1");
        match report.section(SectionName::Security) {
            Some(InventorySection::Security(s)) => assert!(s.fully_protected()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(audit.recent()[0].user_response, UserResponse::AutoGrantedElevated);
    }

    #[test]
    fn test_security_section_gated_siblings_populated() {
        let (svc, audit) = service(ScriptedHost::new().with_inventory_fixture());
        let report = svc.get_inventory(Some("c-2".into()));
        assert!(report.success);
        assert_eq!(report.populated(), 5);
        assert_eq!(report.section(SectionName::Security), None);
        assert_eq!(
            report.warnings,
            vec!["Security inventory collection failed: access denied - may require elevation".to_string()]
        );
        let records = audit.recent();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, "c-2");
        assert!(!records[0].granted);
    }

    #[test]
    fn test_two_failing_sections_degrade() {
        let (svc, _) = service(
            ScriptedHost::new()
                .elevated()
                .with_inventory_fixture()
                .failing_wmi("Win32_SystemDriver", "provider load failure")
                .panicking_wmi("Win32_LogicalDisk"),
        );
        let report = svc.get_inventory(None);
        assert!(report.success);
        assert_eq!(report.populated(), 4);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].starts_with("Driver inventory collection failed"));
        assert!(report.warnings[1].starts_with("Storage inventory collection failed"));
        assert!(report.correlation_id.starts_with("inv-"));
    }

    #[test]
    fn test_cancelled_inventory_fails_whole() {
        let (svc, _) = service(ScriptedHost::new().with_inventory_fixture());
        let signal = CancelToken::new();
        signal.cancel();
        let report = svc.get_inventory_with(None, &signal);
        assert!(!report.success);
        assert!(report.sections.is_empty());
    }

    #[test]
    fn test_performance_sample() {
        let (svc, _) = service(ScriptedHost::new().with_inventory_fixture());
        let report = svc.get_performance_sample(PerformanceOptions {
            correlation_id: None,
            include_processes: true,
            top_processes: Some(1),
        });
        assert!(report.success);
        assert_eq!(report.populated(), 5);
        assert!(report.correlation_id.starts_with("perf-"));
        match report.section(SectionName::Processes) {
            Some(PerformanceSection::Processes(p)) => assert_eq!(p.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_performance_without_processes() {
        let (svc, _) = service(ScriptedHost::new().with_inventory_fixture());
        let report = svc.get_performance_sample(PerformanceOptions {
            include_processes: false,
            ..Default::default()
        });
        assert_eq!(report.sections.len(), 4);
        assert!(!report.sections.contains_key(&SectionName::Processes));
    }

    #[test]
    fn test_stalled_perf_section_times_out() {
        let host = ScriptedHost::new()
            .with_inventory_fixture()
            .hanging_wmi("Win32_PerfFormattedData_PerfDisk_PhysicalDisk", Duration::from_millis(500));
        let host = Arc::new(host);
        let gate = ConsentGate::new(CapabilityProbe::new(host.clone()), Arc::new(AuditTrail::new(4)));
        let svc = InventoryService::new(
            host,
            gate,
            IsolationRunner::new(Duration::from_millis(100)),
            "dev-1",
            CancelToken::new(),
        );
        let report = svc.get_performance_sample(PerformanceOptions::default());
        assert!(report.success);
        assert_eq!(report.section(SectionName::Disk), None);
        assert_eq!(report.populated(), 4);
    }

    #[test]
    fn test_correlation_ids_unique() {
        let a = next_correlation_id("inv");
        let b = next_correlation_id("inv");
        assert_ne!(a, b);
        assert!(a.starts_with("inv-"));
    }
}
