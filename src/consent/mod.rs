// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Consent gate
//!
//! Decides whether a privileged operation may proceed. The policy is fail
//! closed: an elevated process is granted automatically, anything else is
//! denied unless an [`ApprovalChannel`] explicitly approves, and every
//! failure along the way is a denial. Every decision is logged under
//! [`audit::AUDIT_TARGET`] and appended to the [`AuditTrail`].

pub mod audit;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use crate::capability::{panic_message, CapabilityProbe, CapabilitySnapshot};
use crate::error::{AccessError, Result};

pub use audit::{AuditRecord, AuditTrail, AUDIT_TARGET};

/// How much damage the operation can do if misused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = AccessError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(AccessError::InvalidRequest(format!("unknown risk level: {}", s))),
        }
    }
}

/// A request to perform a privileged operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub operation_name: String,
    pub risk_level: RiskLevel,
    pub reason: String,
    /// Opaque caller token, echoed into the decision and the audit log
    #[serde(default)]
    pub correlation_id: String,
}

impl ConsentRequest {
    pub fn new(operation_name: impl Into<String>, risk_level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            risk_level,
            reason: reason.into(),
            correlation_id: String::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// How a consent decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserResponse {
    AutoGrantedElevated,
    DeniedNonAdminDefault,
    DeniedError,
    GrantedExplicit,
}

impl UserResponse {
    /// Whether this response permits the operation
    pub fn grants(&self) -> bool {
        matches!(self, Self::AutoGrantedElevated | Self::GrantedExplicit)
    }
}

impl fmt::Display for UserResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoGrantedElevated => "AUTO_GRANTED_ELEVATED",
            Self::DeniedNonAdminDefault => "DENIED_NON_ADMIN_DEFAULT",
            Self::DeniedError => "DENIED_ERROR",
            Self::GrantedExplicit => "GRANTED_EXPLICIT",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a consent request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub granted: bool,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub responded_at: DateTime<Utc>,
    pub correlation_id: String,
    pub user_response: UserResponse,
    pub error: Option<String>,
}

/// Answer from an external approver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Declined(String),
}

/// Out-of-band approval for non-elevated processes, e.g. an operator
/// confirming through the controller
pub trait ApprovalChannel: Send + Sync {
    fn request_approval(
        &self,
        request: &ConsentRequest,
        snapshot: &CapabilitySnapshot,
    ) -> Result<ApprovalOutcome>;
}

impl<F> ApprovalChannel for F
where
    F: Fn(&ConsentRequest, &CapabilitySnapshot) -> Result<ApprovalOutcome> + Send + Sync,
{
    fn request_approval(
        &self,
        request: &ConsentRequest,
        snapshot: &CapabilitySnapshot,
    ) -> Result<ApprovalOutcome> {
        self(request, snapshot)
    }
}

const REASON_ELEVATED: &str = "already elevated";
const REASON_NOT_ELEVATED: &str = "requires explicit consent: process is not elevated";

/// Grant/deny decision function with audit
#[derive(Clone)]
pub struct ConsentGate {
    probe: CapabilityProbe,
    approval: Option<Arc<dyn ApprovalChannel>>,
    audit: Arc<AuditTrail>,
}

impl ConsentGate {
    pub fn new(probe: CapabilityProbe, audit: Arc<AuditTrail>) -> Self {
        Self {
            probe,
            approval: None,
            audit,
        }
    }

    pub fn with_approval_channel(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = Some(channel);
        self
    }

    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// Decide on a request. Never fails; failures are `DENIED_ERROR`.
    pub fn request_consent(&self, request: &ConsentRequest) -> ConsentDecision {
        let requested_at = Utc::now();
        let snapshot = self.probe.snapshot();

        let (user_response, reason, error) = self.decide(request, &snapshot);

        let decision = ConsentDecision {
            granted: user_response.grants(),
            reason,
            requested_at,
            responded_at: Utc::now(),
            correlation_id: request.correlation_id.clone(),
            user_response,
            error,
        };

        self.emit(request, &decision, &snapshot);
        decision
    }

    /// Like [`request_consent`](Self::request_consent), but a denial is an
    /// `AccessDenied` error
    pub fn require(&self, request: &ConsentRequest) -> Result<ConsentDecision> {
        let decision = self.request_consent(request);
        if decision.granted {
            Ok(decision)
        } else {
            Err(AccessError::AccessDenied(format!(
                "{}: {}",
                request.operation_name, decision.reason
            )))
        }
    }

    fn decide(
        &self,
        request: &ConsentRequest,
        snapshot: &CapabilitySnapshot,
    ) -> (UserResponse, String, Option<String>) {
        if let Some(err) = &snapshot.error {
            return internal_error(err.clone());
        }
        if snapshot.is_elevated {
            return (UserResponse::AutoGrantedElevated, REASON_ELEVATED.into(), None);
        }

        let channel = match &self.approval {
            Some(channel) => Arc::clone(channel),
            None => return (UserResponse::DeniedNonAdminDefault, REASON_NOT_ELEVATED.into(), None),
        };

        let answer = panic::catch_unwind(AssertUnwindSafe(|| {
            channel.request_approval(request, snapshot)
        }));
        match answer {
            Ok(Ok(ApprovalOutcome::Approved)) => (
                UserResponse::GrantedExplicit,
                "explicitly approved".into(),
                None,
            ),
            Ok(Ok(ApprovalOutcome::Declined(why))) => (
                UserResponse::DeniedNonAdminDefault,
                format!("requires explicit consent: {}", why),
                None,
            ),
            Ok(Err(e)) => internal_error(format!("approval channel failed: {}", e)),
            Err(payload) => internal_error(format!(
                "approval channel panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    fn emit(&self, request: &ConsentRequest, decision: &ConsentDecision, snapshot: &CapabilitySnapshot) {
        let verdict = if decision.granted { "granted" } else { "denied" };
        if decision.user_response == UserResponse::DeniedError {
            log::error!(
                target: AUDIT_TARGET,
                "consent {} operation={} risk={} justification=\"{}\" response={} reason=\"{}\" correlation_id={}",
                verdict,
                request.operation_name,
                request.risk_level,
                request.reason,
                decision.user_response,
                decision.reason,
                decision.correlation_id
            );
        } else {
            log::warn!(
                target: AUDIT_TARGET,
                "consent {} operation={} risk={} justification=\"{}\" response={} reason=\"{}\" correlation_id={}",
                verdict,
                request.operation_name,
                request.risk_level,
                request.reason,
                decision.user_response,
                decision.reason,
                decision.correlation_id
            );
        }
        self.audit
            .record(AuditRecord::new(request, decision, snapshot.principal()));
    }
}

fn internal_error(message: String) -> (UserResponse, String, Option<String>) {
    (
        UserResponse::DeniedError,
        format!("internal error: {}", message),
        Some(message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ScriptedHost;

    fn gate(host: ScriptedHost) -> ConsentGate {
        let probe = CapabilityProbe::new(Arc::new(host));
        ConsentGate::new(probe, Arc::new(AuditTrail::new(16)))
    }

    fn request(risk: RiskLevel) -> ConsentRequest {
        ConsentRequest::new("StartTrace", risk, "collect kernel events").with_correlation_id("c-1")
    }

    #[test]
    fn test_fail_closed_for_every_risk_level() {
        let gate = gate(ScriptedHost::new());
        for risk in RiskLevel::ALL {
            let decision = gate.request_consent(&request(risk));
            assert!(!decision.granted, "{} was granted", risk);
            assert_eq!(decision.user_response, UserResponse::DeniedNonAdminDefault);
            assert!(decision.reason.starts_with("requires explicit consent"));
            assert!(decision.error.is_none());
        }
    }

    #[test]
    fn test_filtered_admin_still_denied() {
        let gate = gate(ScriptedHost::new().filtered_admin());
        let decision = gate.request_consent(&request(RiskLevel::Low));
        assert!(!decision.granted);
        assert_eq!(decision.user_response, UserResponse::DeniedNonAdminDefault);
    }

    #[test]
    fn test_elevated_auto_granted() {
        let gate = gate(ScriptedHost::new().elevated());
        let decision = gate.request_consent(&request(RiskLevel::Critical));
        assert!(decision.granted);
        assert_eq!(decision.user_response, UserResponse::AutoGrantedElevated);
        assert_eq!(decision.reason, "already elevated");
        assert_eq!(decision.correlation_id, "c-1");
        assert!(decision.responded_at >= decision.requested_at);
    }

    #[test]
    fn test_probe_failure_denied_error() {
        let gate = gate(ScriptedHost::new().elevated().failing_probe("token query failed"));
        let decision = gate.request_consent(&request(RiskLevel::Low));
        assert!(!decision.granted);
        assert_eq!(decision.user_response, UserResponse::DeniedError);
        assert!(decision.reason.starts_with("internal error"));
        assert!(decision.error.as_deref().unwrap().contains("token query failed"));
    }

    #[test]
    fn test_probe_panic_denied_error() {
        let gate = gate(ScriptedHost::new().panicking_probe());
        let decision = gate.request_consent(&request(RiskLevel::High));
        assert_eq!(decision.user_response, UserResponse::DeniedError);
    }

    #[test]
    fn test_explicit_approval_channel() {
        let approve = |_: &ConsentRequest, _: &CapabilitySnapshot| -> Result<ApprovalOutcome> {
            Ok(ApprovalOutcome::Approved)
        };
        let gate = gate(ScriptedHost::new()).with_approval_channel(Arc::new(approve));
        let decision = gate.request_consent(&request(RiskLevel::Medium));
        assert!(decision.granted);
        assert_eq!(decision.user_response, UserResponse::GrantedExplicit);
    }

    #[test]
    fn test_declined_approval() {
        let decline = |_: &ConsentRequest, _: &CapabilitySnapshot| -> Result<ApprovalOutcome> {
            Ok(ApprovalOutcome::Declined("operator declined".into()))
        };
        let gate = gate(ScriptedHost::new()).with_approval_channel(Arc::new(decline));
        let decision = gate.request_consent(&request(RiskLevel::Medium));
        assert!(!decision.granted);
        assert_eq!(decision.user_response, UserResponse::DeniedNonAdminDefault);
        assert!(decision.reason.contains("operator declined"));
    }

    #[test]
    fn test_failing_and_panicking_channels_deny() {
        let failing = |_: &ConsentRequest, _: &CapabilitySnapshot| -> Result<ApprovalOutcome> {
            Err(AccessError::Unavailable("controller offline".into()))
        };
        let gate1 = gate(ScriptedHost::new()).with_approval_channel(Arc::new(failing));
        assert_eq!(
            gate1.request_consent(&request(RiskLevel::Low)).user_response,
            UserResponse::DeniedError
        );

        let panicking = |_: &ConsentRequest, _: &CapabilitySnapshot| -> Result<ApprovalOutcome> {
            panic!("prompt crashed")
        };
        let gate2 = gate(ScriptedHost::new()).with_approval_channel(Arc::new(panicking));
        let decision = gate2.request_consent(&request(RiskLevel::Low));
        assert_eq!(decision.user_response, UserResponse::DeniedError);
        assert!(decision.error.unwrap().contains("prompt crashed"));
    }

    #[test]
    fn test_channel_not_consulted_when_elevated() {
        let never = |_: &ConsentRequest, _: &CapabilitySnapshot| -> Result<ApprovalOutcome> {
            panic!("should not be asked")
        };
        let gate = gate(ScriptedHost::new().elevated()).with_approval_channel(Arc::new(never));
        let decision = gate.request_consent(&request(RiskLevel::Low));
        assert_eq!(decision.user_response, UserResponse::AutoGrantedElevated);
    }

    #[test]
    fn test_every_decision_is_audited() {
        let gate = gate(ScriptedHost::new());
        gate.request_consent(&request(RiskLevel::Low));
        gate.request_consent(&request(RiskLevel::High));
        let records = gate.audit().recent();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].risk_level, RiskLevel::High);
        assert_eq!(records[1].correlation_id, "c-1");
        assert_eq!(records[1].principal, "WORKSTATION\\operator");
        assert_eq!(records[1].justification, "collect kernel events");
        assert_eq!(records[1].reason, "requires explicit consent: process is not elevated");
        let json = serde_json::to_string(&records).unwrap();
        assert!(json.contains("\"justification\":\"collect kernel events\""));
    }

    #[test]
    fn test_require_maps_denial() {
        let gate = gate(ScriptedHost::new());
        let err = gate.require(&request(RiskLevel::Low)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AccessDenied);
    }

    #[test]
    fn test_user_response_wire_names() {
        let json = serde_json::to_string(&UserResponse::DeniedNonAdminDefault).unwrap();
        assert_eq!(json, "\"DENIED_NON_ADMIN_DEFAULT\"");
        assert_eq!(UserResponse::GrantedExplicit.to_string(), "GRANTED_EXPLICIT");
    }

    #[test]
    fn test_risk_level_from_str() {
        assert_eq!("critical".parse::<RiskLevel>().unwrap(), RiskLevel::Critical);
        assert!("extreme".parse::<RiskLevel>().is_err());
    }
}
