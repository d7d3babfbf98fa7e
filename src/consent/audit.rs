// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Bounded in-memory trail of consent decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{ConsentDecision, ConsentRequest, RiskLevel, UserResponse};

/// Log target every consent decision is emitted under
pub const AUDIT_TARGET: &str = "privilege_gate::audit";

/// One consent decision as kept in the trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation_name: String,
    pub risk_level: RiskLevel,
    /// Why the caller asked, as given in the request
    pub justification: String,
    pub granted: bool,
    pub user_response: UserResponse,
    pub reason: String,
    pub correlation_id: String,
    pub principal: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(request: &ConsentRequest, decision: &ConsentDecision, principal: String) -> Self {
        Self {
            operation_name: request.operation_name.clone(),
            risk_level: request.risk_level,
            justification: request.reason.clone(),
            granted: decision.granted,
            user_response: decision.user_response,
            reason: decision.reason.clone(),
            correlation_id: decision.correlation_id.clone(),
            principal,
            recorded_at: decision.responded_at,
        }
    }
}

/// Keeps the most recent `capacity` records, oldest first
#[derive(Debug)]
pub struct AuditTrail {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: AuditRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Copy of the retained records, oldest first
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> AuditRecord {
        AuditRecord {
            operation_name: format!("op-{}", n),
            risk_level: RiskLevel::Low,
            justification: "collect kernel events".into(),
            granted: false,
            user_response: UserResponse::DeniedNonAdminDefault,
            reason: "requires explicit consent".into(),
            correlation_id: format!("c-{}", n),
            principal: "WORKSTATION\\operator".into(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_trail_evicts_oldest() {
        let trail = AuditTrail::new(2);
        trail.record(record(1));
        trail.record(record(2));
        trail.record(record(3));
        let kept: Vec<_> = trail.recent().into_iter().map(|r| r.operation_name).collect();
        assert_eq!(kept, vec!["op-2", "op-3"]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let trail = AuditTrail::new(0);
        trail.record(record(1));
        assert!(trail.is_empty());
    }
}
