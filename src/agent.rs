// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Agent facade and request dispatcher
//!
//! [`AccessAgent`] wires the capability probe, consent gate, session
//! registry and inventory service around one host adapter and one root
//! cancel signal. [`AgentRequest`]/[`AgentResponse`] give the same
//! operations a JSON shape for controllers and the CLI.
//!
//! ```json
//! {"operation": "start_monitor", "kind": "RegistryWatch", "session_id": "m1", "target": "HKCU\\Software\\Test"}
//! {"type": "started", "data": {"session_id": "m1", "kind": "RegistryWatch", "created_at": "..."}}
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::capability::{CapabilityProbe, CapabilitySnapshot};
use crate::collect::{CollectionReport, IsolationRunner};
use crate::config::AgentConfig;
use crate::consent::{
    ApprovalChannel, AuditRecord, AuditTrail, ConsentDecision, ConsentGate, ConsentRequest,
    RiskLevel,
};
use crate::error::{AccessError, ErrorKind, Result};
use crate::host::HostCapabilities;
use crate::inventory::{InventorySection, InventoryService, PerformanceOptions, PerformanceSection};
use crate::session::{MonitorKind, MonitorRequest, SessionInfo, SessionRegistry, Started, Stopped};

/// The on-device access agent
pub struct AccessAgent {
    config: AgentConfig,
    probe: CapabilityProbe,
    gate: ConsentGate,
    registry: SessionRegistry,
    inventory: InventoryService,
    audit: Arc<AuditTrail>,
    root: CancelToken,
}

impl AccessAgent {
    /// Agent with the default fail-closed policy
    pub fn new(config: AgentConfig, host: Arc<dyn HostCapabilities>) -> Self {
        Self::with_approval(config, host, None)
    }

    /// Agent whose non-elevated requests may be approved out of band
    pub fn with_approval(
        config: AgentConfig,
        host: Arc<dyn HostCapabilities>,
        approval: Option<Arc<dyn ApprovalChannel>>,
    ) -> Self {
        let root = CancelToken::new();
        let audit = Arc::new(AuditTrail::new(config.audit_capacity));
        let probe = CapabilityProbe::new(Arc::clone(&host));
        let mut gate = ConsentGate::new(probe.clone(), Arc::clone(&audit));
        if let Some(channel) = approval {
            gate = gate.with_approval_channel(channel);
        }

        let registry = SessionRegistry::new(Arc::clone(&host), gate.clone(), root.clone())
            .with_default_max_duration(config.default_session_max_duration());
        let inventory = InventoryService::new(
            host,
            gate.clone(),
            IsolationRunner::new(config.section_timeout()),
            config.device_id(),
            root.clone(),
        )
        .with_top_processes(config.top_processes);

        log::debug!(
            "Agent ready for device {} (section timeout {:?})",
            inventory.device_id(),
            config.section_timeout()
        );

        Self {
            config,
            probe,
            gate,
            registry,
            inventory,
            audit,
            root,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        self.inventory.device_id()
    }

    /// Signal fired by [`shutdown`](Self::shutdown); sessions link to it
    pub fn root_signal(&self) -> &CancelToken {
        &self.root
    }

    pub fn check_privileges(&self) -> CapabilitySnapshot {
        self.probe.snapshot()
    }

    pub fn request_elevation_consent(&self, request: &ConsentRequest) -> ConsentDecision {
        self.gate.request_consent(request)
    }

    pub fn start_monitor(&self, request: MonitorRequest) -> Result<Started> {
        self.registry.start(request)
    }

    pub fn stop_monitor(&self, kind: MonitorKind, session_id: &str) -> Result<Stopped> {
        self.registry.stop(kind, session_id)
    }

    pub fn get_inventory(&self, correlation_id: Option<String>) -> CollectionReport<InventorySection> {
        self.inventory.get_inventory(correlation_id)
    }

    pub fn get_performance_sample(
        &self,
        options: PerformanceOptions,
    ) -> CollectionReport<PerformanceSection> {
        self.inventory.get_performance_sample(options)
    }

    pub fn list_monitors(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    pub fn is_monitor_active(&self, kind: MonitorKind, session_id: &str) -> bool {
        self.registry.contains(kind, session_id)
    }

    /// Recent consent decisions, oldest first
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.recent()
    }

    /// Fire the root signal and stop every session
    pub fn shutdown(&self) -> Vec<Stopped> {
        log::info!("Agent shutting down");
        self.root.cancel();
        self.registry.stop_all()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Dispatch one request
    pub fn handle(&self, request: AgentRequest) -> AgentResponse {
        match request {
            AgentRequest::CheckPrivileges => AgentResponse::Privileges(self.check_privileges()),
            AgentRequest::RequestElevationConsent {
                operation_name,
                risk_level,
                reason,
                correlation_id,
            } => {
                let request = ConsentRequest::new(operation_name, risk_level, reason)
                    .with_correlation_id(correlation_id);
                AgentResponse::Consent(self.request_elevation_consent(&request))
            }
            AgentRequest::StartMonitor {
                kind,
                session_id,
                target,
                max_duration_secs,
                requires_elevation,
                correlation_id,
            } => {
                let mut request =
                    MonitorRequest::new(kind, session_id, target).with_correlation_id(correlation_id);
                request.max_duration = max_duration_secs.map(Duration::from_secs);
                request.requires_elevation = requires_elevation;
                self.start_monitor(request).into()
            }
            AgentRequest::StopMonitor { kind, session_id } => {
                self.stop_monitor(kind, &session_id).into()
            }
            AgentRequest::GetInventory { correlation_id } => {
                AgentResponse::Inventory(self.get_inventory(correlation_id))
            }
            AgentRequest::GetPerformanceSample {
                correlation_id,
                include_processes,
                top_processes,
            } => AgentResponse::Performance(self.get_performance_sample(PerformanceOptions {
                correlation_id,
                include_processes,
                top_processes,
            })),
            AgentRequest::ListMonitors => AgentResponse::Monitors(self.list_monitors()),
            AgentRequest::AuditLog => AgentResponse::Audit(self.audit_records()),
        }
    }

    /// Dispatch one JSON request and render the JSON response
    pub fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<AgentRequest>(request) {
            Ok(request) => self.handle(request),
            Err(e) => AgentResponse::from(AccessError::from(e)),
        };
        match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode response: {}", e);
                let message = serde_json::to_string(&e.to_string())
                    .unwrap_or_else(|_| "\"response encoding failed\"".to_string());
                format!(
                    r#"{{"type":"error","data":{{"kind":"internal","message":{}}}}}"#,
                    message
                )
            }
        }
    }
}

fn default_true() -> bool {
    true
}

/// A boundary operation in wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum AgentRequest {
    CheckPrivileges,
    RequestElevationConsent {
        operation_name: String,
        risk_level: RiskLevel,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        correlation_id: String,
    },
    StartMonitor {
        kind: MonitorKind,
        session_id: String,
        target: String,
        #[serde(default)]
        max_duration_secs: Option<u64>,
        /// Can only add a consent requirement to a target that has none
        #[serde(default)]
        requires_elevation: Option<bool>,
        #[serde(default)]
        correlation_id: String,
    },
    StopMonitor {
        kind: MonitorKind,
        session_id: String,
    },
    GetInventory {
        #[serde(default)]
        correlation_id: Option<String>,
    },
    GetPerformanceSample {
        #[serde(default)]
        correlation_id: Option<String>,
        #[serde(default = "default_true")]
        include_processes: bool,
        #[serde(default)]
        top_processes: Option<usize>,
    },
    ListMonitors,
    AuditLog,
}

/// Result of a dispatched request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentResponse {
    Privileges(CapabilitySnapshot),
    Consent(ConsentDecision),
    Started(Started),
    Stopped(Stopped),
    Inventory(CollectionReport<InventorySection>),
    Performance(CollectionReport<PerformanceSection>),
    Monitors(Vec<SessionInfo>),
    Audit(Vec<AuditRecord>),
    Error { kind: ErrorKind, message: String },
}

impl AgentResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, AgentResponse::Error { .. })
    }
}

impl From<AccessError> for AgentResponse {
    fn from(err: AccessError) -> Self {
        AgentResponse::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Result<Started>> for AgentResponse {
    fn from(result: Result<Started>) -> Self {
        result.map(AgentResponse::Started).unwrap_or_else(AgentResponse::from)
    }
}

impl From<Result<Stopped>> for AgentResponse {
    fn from(result: Result<Stopped>) -> Self {
        result.map(AgentResponse::Stopped).unwrap_or_else(AgentResponse::from)
    }
}
