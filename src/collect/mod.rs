// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Collector isolation runner
//!
//! Runs independently fallible section collectors and merges their output
//! into one [`CollectionReport`]. A collector that errors, panics, overruns
//! its timeout or is cancelled only costs its own section: the section is
//! reported as `None` and a warning `"<label> collection failed: <message>"`
//! is appended. The report as a whole fails only when the run could not
//! start at all.
//!
//! A collector thread that overruns its deadline is detached, not killed.
//! The runner remembers it and skips that section on later runs until the
//! thread returns, so a source that hangs on every call holds at most one
//! thread per section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::capability::panic_message;
use crate::error::{AccessError, Result};

/// Default bound on a single section
pub const DEFAULT_SECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// How often a waiting runner re-checks its cancel signal
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Report sections across inventory and performance snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionName {
    Hardware,
    Drivers,
    Storage,
    Network,
    Power,
    Security,
    Cpu,
    Memory,
    Disk,
    NetworkIo,
    Processes,
}

impl SectionName {
    pub const INVENTORY: [SectionName; 6] = [
        SectionName::Hardware,
        SectionName::Drivers,
        SectionName::Storage,
        SectionName::Network,
        SectionName::Power,
        SectionName::Security,
    ];

    pub const PERFORMANCE: [SectionName; 5] = [
        SectionName::Cpu,
        SectionName::Memory,
        SectionName::Disk,
        SectionName::NetworkIo,
        SectionName::Processes,
    ];

    /// Human label used in warnings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hardware => "Hardware inventory",
            Self::Drivers => "Driver inventory",
            Self::Storage => "Storage inventory",
            Self::Network => "Network inventory",
            Self::Power => "Power inventory",
            Self::Security => "Security inventory",
            Self::Cpu => "CPU performance",
            Self::Memory => "Memory performance",
            Self::Disk => "Disk performance",
            Self::NetworkIo => "Network performance",
            Self::Processes => "Process performance",
        }
    }

    fn thread_name(&self) -> String {
        format!("pgate-{:?}", self).to_ascii_lowercase()
    }
}

impl std::fmt::Display for SectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

type CollectFn<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// One named, fallible sub-collector
pub struct SectionCollector<T> {
    name: SectionName,
    collect: CollectFn<T>,
}

impl<T> SectionCollector<T> {
    pub fn new<F>(name: SectionName, collect: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            name,
            collect: Box::new(collect),
        }
    }

    pub fn name(&self) -> SectionName {
        self.name
    }
}

/// Identity stamped on a report plus the signal that can abort it
#[derive(Debug, Clone)]
pub struct RunContext {
    pub correlation_id: String,
    pub device_id: String,
    pub cancel: CancelToken,
}

/// Merged result of a multi-section collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionReport<T> {
    pub success: bool,
    pub collected_at: DateTime<Utc>,
    pub correlation_id: String,
    pub device_id: String,
    pub sections: HashMap<SectionName, Option<T>>,
    pub warnings: Vec<String>,
    /// Set only when the run as a whole failed
    pub error: Option<String>,
}

impl<T> CollectionReport<T> {
    fn empty(ctx: &RunContext) -> Self {
        Self {
            success: true,
            collected_at: Utc::now(),
            correlation_id: ctx.correlation_id.clone(),
            device_id: ctx.device_id.clone(),
            sections: HashMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// A populated section
    pub fn section(&self, name: SectionName) -> Option<&T> {
        self.sections.get(&name).and_then(|s| s.as_ref())
    }

    pub fn populated(&self) -> usize {
        self.sections.values().filter(|s| s.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.sections.values().filter(|s| s.is_none()).count()
    }

    /// Some sections failed but the run succeeded
    pub fn is_degraded(&self) -> bool {
        self.success && self.failed() > 0
    }
}

enum Outcome<T> {
    Done(Result<T>),
    Panicked(String),
}

/// Executes collectors concurrently, one thread per section
#[derive(Debug, Clone)]
pub struct IsolationRunner {
    section_timeout: Duration,
    /// Sections whose collector thread has not returned yet
    in_flight: Arc<Mutex<HashSet<SectionName>>>,
}

impl Default for IsolationRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SECTION_TIMEOUT)
    }
}

impl IsolationRunner {
    pub fn new(section_timeout: Duration) -> Self {
        Self {
            section_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<SectionName>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sections still held by a collector thread from an earlier run
    pub fn outstanding(&self) -> Vec<SectionName> {
        let mut names: Vec<SectionName> = self.in_flight().iter().copied().collect();
        names.sort();
        names
    }

    pub fn section_timeout(&self) -> Duration {
        self.section_timeout
    }

    /// Run every collector and merge the results
    pub fn run<T>(&self, ctx: &RunContext, collectors: Vec<SectionCollector<T>>) -> CollectionReport<T>
    where
        T: Send + 'static,
    {
        let mut report = CollectionReport::empty(ctx);

        if let Some(reason) = ctx.cancel.reason() {
            let err = AccessError::Cancelled(reason.to_string());
            log::warn!(
                "Collection {} aborted before start: {}",
                ctx.correlation_id,
                err
            );
            report.success = false;
            report.error = Some(err.to_string());
            return report;
        }

        let order: Vec<SectionName> = collectors.iter().map(|c| c.name).collect();
        let mut failures: HashMap<SectionName, String> = HashMap::new();
        let mut pending: Vec<SectionName> = Vec::with_capacity(order.len());
        let (tx, rx) = mpsc::channel::<(SectionName, Outcome<T>)>();

        for collector in collectors {
            let name = collector.name;
            report.sections.insert(name, None);
            if !self.in_flight().insert(name) {
                failures.insert(name, "previous collection is still running".into());
                continue;
            }

            let tx = tx.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let collect = collector.collect;
            let spawned = thread::Builder::new()
                .name(name.thread_name())
                .spawn(move || {
                    let outcome = match panic::catch_unwind(AssertUnwindSafe(collect)) {
                        Ok(result) => Outcome::Done(result),
                        Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
                    };
                    // Released before sending so the next run sees the slot free
                    in_flight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&name);
                    // The runner may have given up on this section already
                    let _ = tx.send((name, outcome));
                });
            match spawned {
                Ok(_) => pending.push(name),
                Err(e) => {
                    self.in_flight().remove(&name);
                    failures.insert(name, format!("could not start collector: {}", e));
                }
            }
        }
        drop(tx);

        let started = Instant::now();
        // An unrepresentable deadline means the run waits for every collector
        let deadline = started.checked_add(self.section_timeout);

        while !pending.is_empty() {
            if let Some(reason) = ctx.cancel.reason() {
                for name in pending.drain(..) {
                    failures.insert(name, AccessError::Cancelled(reason.to_string()).to_string());
                }
                break;
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    for name in pending.drain(..) {
                        failures.insert(
                            name,
                            format!("timed out after {}s", self.section_timeout.as_secs_f64()),
                        );
                    }
                    break;
                }
                Some(deadline) => (deadline - now).min(CANCEL_POLL),
                None => CANCEL_POLL,
            };
            match rx.recv_timeout(wait) {
                Ok((name, outcome)) => {
                    pending.retain(|n| *n != name);
                    match outcome {
                        Outcome::Done(Ok(value)) => {
                            log::debug!(
                                "{} collected in {:?}",
                                name.label(),
                                started.elapsed()
                            );
                            report.sections.insert(name, Some(value));
                        }
                        Outcome::Done(Err(e)) => {
                            failures.insert(name, e.to_string());
                        }
                        Outcome::Panicked(msg) => {
                            failures.insert(name, format!("collector panicked: {}", msg));
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    for name in pending.drain(..) {
                        failures.insert(name, "collector exited without a result".into());
                    }
                }
            }
        }

        for name in order {
            if let Some(msg) = failures.remove(&name) {
                let warning = format!("{} collection failed: {}", name.label(), msg);
                log::warn!("[{}] {}", ctx.correlation_id, warning);
                report.warnings.push(warning);
            }
        }

        report.collected_at = Utc::now();
        report
    }
}
