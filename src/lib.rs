// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! # Privilege Gate
//!
//! On-device agent core that mediates privileged access to host
//! introspection: registry key watches, certificate-store watches,
//! event tracing, event-log subscription and WMI-based inventory.
//!
//! Every such facility can leak sensitive data or needs elevated rights, so
//! access goes through one model:
//!
//! - **Fail closed**: the [`ConsentGate`] grants automatically only to an
//!   elevated process; everything else is denied unless an
//!   [`ApprovalChannel`] explicitly approves. Errors are denials.
//! - **Owned sessions**: long-lived monitors live in a [`SessionRegistry`]
//!   keyed by `(kind, session_id)`, each with one cancel handle that is
//!   disposed exactly once.
//! - **Partial degradation**: inventory and performance snapshots run their
//!   sections in isolation; a failing section becomes a warning.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pgatelib::{AccessAgent, AgentConfig, NativeHost};
//!
//! let agent = AccessAgent::new(AgentConfig::default(), Arc::new(NativeHost::new()));
//! let report = agent.get_inventory(None);
//! for warning in &report.warnings {
//!     println!("{}", warning);
//! }
//! ```

pub mod agent;
pub mod cancel;
pub mod capability;
pub mod collect;
pub mod config;
pub mod consent;
pub mod error;
pub mod host;
pub mod inventory;
pub mod session;

pub use agent::{AccessAgent, AgentRequest, AgentResponse};
pub use cancel::{CancelHandle, CancelReason, CancelToken};
pub use capability::{CapabilityProbe, CapabilitySnapshot};
pub use collect::{CollectionReport, IsolationRunner, SectionCollector, SectionName};
pub use config::{AgentConfig, ConfigError, LogLevel};
pub use consent::{
    ApprovalChannel, ApprovalOutcome, AuditRecord, AuditTrail, ConsentDecision, ConsentGate,
    ConsentRequest, RiskLevel, UserResponse,
};
pub use error::{AccessError, ErrorKind, Result};
pub use host::{HostCapabilities, NativeHost};
pub use inventory::{InventorySection, InventoryService, PerformanceOptions, PerformanceSection};
pub use session::{MonitorKind, MonitorRequest, SessionInfo, SessionRegistry, Started, Stopped};
