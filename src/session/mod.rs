// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Monitor session registry
//!
//! Holds the live, named, cancellable monitors keyed by `(kind, session_id)`.
//! A single mutex guards the table and is held only to sweep, reserve, insert
//! or remove entries; consent, target validation and OS feed setup all happen
//! outside it, as does disposal. A start reserves its key before touching the
//! host, so concurrent starts for one key never reach the OS twice.
//!
//! Sessions expire lazily: every registry operation first removes entries
//! whose cancel handle has fired (maximum duration reached or linked outer
//! signal cancelled). No thread is spawned per session.
//!
//! # Example
//!
//! ```no_run
//! use pgatelib::session::{MonitorKind, MonitorRequest};
//! # fn demo(registry: &pgatelib::session::SessionRegistry) -> pgatelib::Result<()> {
//! let started = registry.start(MonitorRequest::new(
//!     MonitorKind::RegistryWatch,
//!     "m1",
//!     "HKCU\\Software\\Test",
//! ))?;
//! let stopped = registry.stop(MonitorKind::RegistryWatch, &started.session_id)?;
//! assert!(!stopped.expired);
//! # Ok(())
//! # }
//! ```

pub mod target;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::{CancelHandle, CancelToken};
use crate::capability::panic_message;
use crate::consent::{ConsentGate, ConsentRequest};
use crate::error::{AccessError, Result};
use crate::host::{EventLogFilter, FeedHandle, HostCapabilities};

pub use target::{MonitorKind, MonitorTarget, StoreLocation};

type SessionKey = (MonitorKind, String);

/// Parameters for starting a monitor
#[derive(Debug, Clone)]
pub struct MonitorRequest {
    pub kind: MonitorKind,
    pub session_id: String,
    pub target: String,
    pub max_duration: Option<Duration>,
    /// `Some(true)` asks for consent even where the target does not need it.
    /// A target that needs elevation is always gated.
    pub requires_elevation: Option<bool>,
    /// Outer signal the session is linked to; the registry root when `None`
    pub parent: Option<CancelToken>,
    pub correlation_id: String,
}

impl MonitorRequest {
    pub fn new(kind: MonitorKind, session_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            target: target.into(),
            max_duration: None,
            requires_elevation: None,
            parent: None,
            correlation_id: String::new(),
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn requires_elevation(mut self, required: bool) -> Self {
        self.requires_elevation = Some(required);
        self
    }

    pub fn linked_to(mut self, parent: CancelToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// Result of a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Started {
    pub session_id: String,
    pub kind: MonitorKind,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stopped {
    pub session_id: String,
    pub kind: MonitorKind,
    /// The session had already expired or been cancelled from outside
    pub expired: bool,
    pub ran_for_ms: u64,
}

/// Listing entry for an active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub kind: MonitorKind,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub max_duration_secs: Option<u64>,
    pub remaining_secs: Option<u64>,
    pub feed: Option<String>,
}

/// A live monitor, owned by its registry entry
pub struct MonitorSession {
    session_id: String,
    kind: MonitorKind,
    target: MonitorTarget,
    created_at: DateTime<Utc>,
    started: Instant,
    max_duration: Option<Duration>,
    cancel: CancelHandle,
    feed: Option<FeedHandle>,
}

impl MonitorSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timed out or cancelled through its outer signal
    pub fn is_expired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            kind: self.kind,
            target: self.target.to_string(),
            created_at: self.created_at,
            max_duration_secs: self.max_duration.map(|d| d.as_secs()),
            remaining_secs: self.cancel.token().remaining().map(|d| d.as_secs()),
            feed: self.feed.as_ref().map(|f| f.describe()),
        }
    }

    /// Cancel, close the OS feed and consume the session
    fn dispose(mut self) -> Stopped {
        let expired = self.is_expired();
        let ran_for_ms = self.started.elapsed().as_millis() as u64;
        self.release();
        Stopped {
            session_id: std::mem::take(&mut self.session_id),
            kind: self.kind,
            expired,
            ran_for_ms,
        }
    }

    fn release(&mut self) {
        if self.cancel.dispose() {
            log::debug!("Disposed {} session '{}'", self.kind, self.session_id);
        }
        if let Some(mut feed) = self.feed.take() {
            feed.close();
        }
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MonitorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSession")
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .field("max_duration", &self.max_duration)
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[derive(Default)]
struct SessionTable {
    active: HashMap<SessionKey, MonitorSession>,
    /// Keys whose start is past the duplicate check but not yet inserted
    pending: HashSet<SessionKey>,
}

/// Claim on a key between the duplicate check and the insert; released on drop
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    key: Option<SessionKey>,
}

impl Reservation<'_> {
    fn commit(mut self, table: &mut SessionTable, session: MonitorSession) {
        if let Some(key) = self.key.take() {
            table.pending.remove(&key);
            table.active.insert(key, session);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.registry.lock().pending.remove(&key);
        }
    }
}

/// Concurrent table of active monitor sessions
pub struct SessionRegistry {
    host: Arc<dyn HostCapabilities>,
    gate: ConsentGate,
    root: CancelToken,
    default_max_duration: Option<Duration>,
    sessions: Mutex<SessionTable>,
    trace_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new(host: Arc<dyn HostCapabilities>, gate: ConsentGate, root: CancelToken) -> Self {
        Self {
            host,
            gate,
            root,
            default_max_duration: None,
            sessions: Mutex::new(SessionTable::default()),
            trace_seq: AtomicU64::new(0),
        }
    }

    /// Maximum duration applied when a request does not carry one
    pub fn with_default_max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.default_max_duration = max_duration;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        // Critical sections only insert/remove entries, so a poisoned map is
        // still consistent.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a monitor. Exactly one concurrent start per key succeeds.
    pub fn start(&self, request: MonitorRequest) -> Result<Started> {
        validate_session_id(&request.session_id)?;
        let target = MonitorTarget::parse(request.kind, &request.target)?;
        let kind = request.kind;
        let key: SessionKey = (kind, request.session_id.clone());

        let parent = request.parent.clone().unwrap_or_else(|| self.root.clone());
        parent.check()?;

        let reservation = self.reserve(&key)?;

        // The request can add a consent requirement, never lift one
        let elevate = target.requires_elevation() || request.requires_elevation == Some(true);
        if elevate {
            let consent = ConsentRequest::new(
                format!("Start{}", kind),
                target.risk_level(),
                format!("watch {}", target),
            )
            .with_correlation_id(request.correlation_id.clone());
            self.gate.require(&consent)?;
        }

        let feed = self.open_feed(&request.session_id, &target)?;

        let max_duration = request.max_duration.or(self.default_max_duration);
        let session = MonitorSession {
            session_id: request.session_id.clone(),
            kind,
            target,
            created_at: Utc::now(),
            started: Instant::now(),
            max_duration,
            cancel: CancelHandle::linked(&parent, max_duration),
            feed: Some(feed),
        };
        let started = Started {
            session_id: session.session_id.clone(),
            kind,
            created_at: session.created_at,
        };

        let expired = {
            let mut table = self.lock();
            let expired = take_expired(&mut table.active);
            reservation.commit(&mut table, session);
            expired
        };
        dispose_all(expired);

        log::info!(
            "Started {} session '{}' (max duration: {:?})",
            kind,
            started.session_id,
            max_duration
        );
        Ok(started)
    }

    /// Claim `key` for one start; `Conflict` if it is active or being started
    fn reserve(&self, key: &SessionKey) -> Result<Reservation<'_>> {
        let (expired, reserved) = {
            let mut table = self.lock();
            let expired = take_expired(&mut table.active);
            let reserved = !table.active.contains_key(key) && table.pending.insert(key.clone());
            (expired, reserved)
        };
        dispose_all(expired);
        if !reserved {
            return Err(conflict(key.0, &key.1));
        }
        Ok(Reservation {
            registry: self,
            key: Some(key.clone()),
        })
    }

    /// Stop a monitor. A second stop for the same key is `NotFound`.
    pub fn stop(&self, kind: MonitorKind, session_id: &str) -> Result<Stopped> {
        let key: SessionKey = (kind, session_id.to_string());
        let (target, expired) = {
            let mut table = self.lock();
            let target = table.active.remove(&key);
            (target, take_expired(&mut table.active))
        };
        dispose_all(expired);

        match target {
            Some(session) => {
                let stopped = session.dispose();
                log::info!(
                    "Stopped {} session '{}' after {} ms{}",
                    kind,
                    session_id,
                    stopped.ran_for_ms,
                    if stopped.expired { " (already expired)" } else { "" }
                );
                Ok(stopped)
            }
            None => Err(AccessError::NotFound(format!(
                "{} session '{}'",
                kind, session_id
            ))),
        }
    }

    /// Remove and dispose every expired session; returns how many
    pub fn sweep_expired(&self) -> usize {
        let expired = take_expired(&mut self.lock().active);
        let count = expired.len();
        dispose_all(expired);
        count
    }

    /// Active sessions, ordered by kind then id
    pub fn list(&self) -> Vec<SessionInfo> {
        let (expired, mut infos) = {
            let mut table = self.lock();
            let expired = take_expired(&mut table.active);
            let infos: Vec<SessionInfo> = table.active.values().map(|s| s.info()).collect();
            (expired, infos)
        };
        dispose_all(expired);
        infos.sort_by(|a, b| (a.kind, &a.session_id).cmp(&(b.kind, &b.session_id)));
        infos
    }

    pub fn contains(&self, kind: MonitorKind, session_id: &str) -> bool {
        let key: SessionKey = (kind, session_id.to_string());
        let (expired, present) = {
            let mut table = self.lock();
            let expired = take_expired(&mut table.active);
            (expired, table.active.contains_key(&key))
        };
        dispose_all(expired);
        present
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every session, disposing each exactly once
    pub fn stop_all(&self) -> Vec<Stopped> {
        let drained: Vec<MonitorSession> = self.lock().active.drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            log::info!("Stopping {} monitor session(s)", drained.len());
        }
        drained.into_iter().map(MonitorSession::dispose).collect()
    }

    fn open_feed(&self, session_id: &str, target: &MonitorTarget) -> Result<FeedHandle> {
        let host = Arc::clone(&self.host);
        let opened = panic::catch_unwind(AssertUnwindSafe(|| match target {
            MonitorTarget::Registry { path, .. } => {
                if !host.registry_key_exists(path)? {
                    return Err(AccessError::NotFound(format!("registry key {}", path)));
                }
                host.open_registry_watch(path)
            }
            MonitorTarget::Certificate { location, store } => {
                host.open_cert_watch(location.as_str(), store)
            }
            MonitorTarget::Trace { providers } => {
                let seq = self.trace_seq.fetch_add(1, Ordering::Relaxed);
                host.start_etw(&trace_session_name(session_id, seq), providers)
            }
            MonitorTarget::Log { log_name, xpath } => host.subscribe_event_log(
                log_name,
                &EventLogFilter {
                    xpath: xpath.clone(),
                    max_events: None,
                },
            ),
        }));

        match opened {
            Ok(result) => result,
            Err(payload) => Err(AccessError::Unavailable(format!(
                "host adapter panicked opening {}: {}",
                target,
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let remaining = self.stop_all();
        if !remaining.is_empty() {
            log::debug!("Registry dropped with {} live session(s)", remaining.len());
        }
    }
}

fn take_expired(sessions: &mut HashMap<SessionKey, MonitorSession>) -> Vec<MonitorSession> {
    let keys: Vec<SessionKey> = sessions
        .iter()
        .filter(|(_, s)| s.is_expired())
        .map(|(k, _)| k.clone())
        .collect();
    keys.iter().filter_map(|k| sessions.remove(k)).collect()
}

fn dispose_all(sessions: Vec<MonitorSession>) {
    for session in sessions {
        let stopped = session.dispose();
        log::info!(
            "Expired {} session '{}' after {} ms",
            stopped.kind,
            stopped.session_id,
            stopped.ran_for_ms
        );
    }
}

fn conflict(kind: MonitorKind, session_id: &str) -> AccessError {
    AccessError::Conflict(format!("{} session '{}'", kind, session_id))
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.trim().is_empty() {
        return Err(AccessError::InvalidRequest("session id is empty".into()));
    }
    if session_id.len() > 128 || session_id.chars().any(|c| c.is_control()) {
        return Err(AccessError::InvalidRequest(format!(
            "invalid session id '{}'",
            session_id.escape_debug()
        )));
    }
    Ok(())
}

/// OS-visible trace session name, unique per process and attempt.
///
/// `logman` rejects most punctuation, so the id is reduced to a readable
/// suffix; uniqueness comes from the process id and `seq`.
pub fn trace_session_name(session_id: &str, seq: u64) -> String {
    let cleaned: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!(
        "pgate-{}-{}-{}-{}",
        MonitorKind::TraceSession.slug(),
        std::process::id(),
        seq,
        cleaned
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityProbe;
    use crate::consent::AuditTrail;
    use crate::error::ErrorKind;
    use crate::host::ScriptedHost;
    use std::sync::Barrier;
    use std::thread;

    fn new_registry(host: ScriptedHost) -> (SessionRegistry, Arc<ScriptedHost>) {
        let host = Arc::new(host);
        let gate = ConsentGate::new(
            CapabilityProbe::new(host.clone()),
            Arc::new(AuditTrail::new(32)),
        );
        (SessionRegistry::new(host.clone(), gate, CancelToken::new()), host)
    }

    fn test_host() -> ScriptedHost {
        ScriptedHost::new()
            .with_registry_key("HKCU\\Software\\Test")
            .with_registry_key("HKLM\\SYSTEM\\CurrentControlSet")
            .with_cert_store("CurrentUser", "My", 3)
            .with_trace_provider("Microsoft-Windows-Kernel-Process")
            .with_event_log("Application", Vec::new())
            .with_event_log("Security", Vec::new())
    }

    #[test]
    fn test_registry_watch_round_trip() {
        let (registry, host) = new_registry(test_host());
        let started = registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test"))
            .unwrap();
        assert_eq!(started.session_id, "m1");
        assert!(registry.contains(MonitorKind::RegistryWatch, "m1"));

        let stopped = registry.stop(MonitorKind::RegistryWatch, "m1").unwrap();
        assert_eq!(stopped.session_id, "m1");
        assert!(!stopped.expired);

        let again = registry.stop(MonitorKind::RegistryWatch, "m1").unwrap_err();
        assert_eq!(again.kind(), ErrorKind::NotFound);
        assert_eq!(host.feeds().opened(), 1);
        assert_eq!(host.feeds().live(), 0);
    }

    #[test]
    fn test_duplicate_start_conflicts() {
        let (registry, host) = new_registry(test_host());
        let req = MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test");
        registry.start(req.clone()).unwrap();
        let err = registry.start(req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "RegistryWatch session 'm1' already exists");
        assert_eq!(host.feeds().live(), 1);
    }

    #[test]
    fn test_same_id_different_kind_is_independent() {
        let (registry, _) = new_registry(test_host());
        registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "s", "HKCU\\Software\\Test"))
            .unwrap();
        registry
            .start(MonitorRequest::new(MonitorKind::CertificateWatch, "s", "CurrentUser\\My"))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_start_exactly_once() {
        const N: usize = 8;
        let (registry, host) = new_registry(test_host().with_open_delay(Duration::from_millis(5)));
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(N));

        let results: Vec<Result<Started>> = (0..N)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.start(MonitorRequest::new(
                        MonitorKind::RegistryWatch,
                        "race",
                        "HKCU\\Software\\Test",
                    ))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        let started = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(AccessError::Conflict(_))))
            .count();
        assert_eq!(started, 1);
        assert_eq!(conflicts, N - 1);
        assert_eq!(host.feeds().live(), 1);

        registry.stop(MonitorKind::RegistryWatch, "race").unwrap();
        assert_eq!(host.feeds().live(), 0);
    }

    #[test]
    fn test_concurrent_stop_exactly_once() {
        const N: usize = 6;
        let (registry, host) = new_registry(test_host());
        let registry = Arc::new(registry);
        registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test"))
            .unwrap();
        let barrier = Arc::new(Barrier::new(N));
        let stopped = (0..N)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.stop(MonitorKind::RegistryWatch, "m1").is_ok()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(stopped, 1);
        assert_eq!(host.feeds().closed(), 1);
    }

    #[test]
    fn test_elevation_denied_leaves_registry_untouched() {
        let (registry, host) = new_registry(test_host());
        let err = registry
            .start(MonitorRequest::new(
                MonitorKind::RegistryWatch,
                "hklm",
                "HKLM\\SYSTEM\\CurrentControlSet",
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert!(registry.is_empty());
        assert_eq!(host.feeds().opened(), 0);
    }

    #[test]
    fn test_elevated_trace_session() {
        let (registry, host) = new_registry(test_host().elevated());
        registry
            .start(MonitorRequest::new(
                MonitorKind::TraceSession,
                "t1",
                "Microsoft-Windows-Kernel-Process",
            ))
            .unwrap();
        let info = registry.list();
        assert_eq!(info.len(), 1);
        let feed = info[0].feed.as_deref().unwrap();
        assert!(feed.starts_with("trace session pgate-trace-"));
        assert!(feed.contains("-t1 ("));
        drop(registry);
        assert_eq!(host.feeds().live(), 0);
    }

    #[test]
    fn test_elevation_override_only_adds_consent() {
        let (registry, host) = new_registry(test_host());
        let err = registry
            .start(
                MonitorRequest::new(MonitorKind::TraceSession, "t1", "Microsoft-Windows-Kernel-Process")
                    .requires_elevation(false),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(registry.gate.audit().len(), 1);
        assert_eq!(host.feeds().opened(), 0);

        // Lowering is ignored for a target that needs no consent anyway
        registry
            .start(
                MonitorRequest::new(MonitorKind::LogSubscription, "app", "Application")
                    .requires_elevation(false),
            )
            .unwrap();
        assert_eq!(registry.gate.audit().len(), 1);

        let err = registry
            .start(
                MonitorRequest::new(MonitorKind::LogSubscription, "app2", "Application")
                    .requires_elevation(true),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(registry.gate.audit().len(), 2);
    }

    #[test]
    fn test_concurrent_trace_start_exactly_once() {
        const N: usize = 6;
        let (registry, host) = new_registry(test_host().elevated().with_open_delay(Duration::from_millis(5)));
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(N));

        let results: Vec<Result<Started>> = (0..N)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.start(MonitorRequest::new(
                        MonitorKind::TraceSession,
                        "race",
                        "Microsoft-Windows-Kernel-Process",
                    ))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AccessError::Conflict(_))))
                .count(),
            N - 1
        );
        assert_eq!(host.feeds().opened(), 1);
        assert_eq!(host.live_trace_sessions().len(), 1);

        registry.stop(MonitorKind::TraceSession, "race").unwrap();
        assert!(host.live_trace_sessions().is_empty());
    }

    #[test]
    fn test_trace_ids_with_same_sanitized_form_coexist() {
        let (registry, host) = new_registry(test_host().elevated());
        for id in ["a b", "a_b"] {
            registry
                .start(MonitorRequest::new(
                    MonitorKind::TraceSession,
                    id,
                    "Microsoft-Windows-Kernel-Process",
                ))
                .unwrap();
        }
        assert_eq!(host.live_trace_sessions().len(), 2);

        // Restarting an id right after stopping it gets a fresh OS name
        registry.stop(MonitorKind::TraceSession, "a b").unwrap();
        registry
            .start(MonitorRequest::new(
                MonitorKind::TraceSession,
                "a b",
                "Microsoft-Windows-Kernel-Process",
            ))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_start_releases_reservation() {
        let (registry, host) = new_registry(test_host());
        let req = MonitorRequest::new(MonitorKind::TraceSession, "t1", "Microsoft-Windows-Kernel-Process");
        assert!(registry.start(req.clone()).is_err());
        host.set_elevated(true);
        registry.start(req).unwrap();
        assert!(registry.contains(MonitorKind::TraceSession, "t1"));
    }

    #[test]
    fn test_unreachable_targets() {
        let (registry, _) = new_registry(test_host().elevated().with_denied_registry_key("HKCU\\Secret"));
        let missing = registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "a", "HKCU\\Software\\Missing"))
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let denied = registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "b", "HKCU\\Secret"))
            .unwrap_err();
        assert_eq!(denied.kind(), ErrorKind::AccessDenied);

        let provider = registry
            .start(MonitorRequest::new(MonitorKind::TraceSession, "c", "No-Such-Provider"))
            .unwrap_err();
        assert_eq!(provider.kind(), ErrorKind::NotFound);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_requests() {
        let (registry, _) = new_registry(test_host());
        let err = registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, " ", "HKCU\\Software\\Test"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        let err = registry
            .start(MonitorRequest::new(MonitorKind::CertificateWatch, "c", "My"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_session_expires_lazily() {
        let (registry, host) = new_registry(test_host());
        registry
            .start(
                MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test")
                    .with_max_duration(Duration::from_millis(20)),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!registry.contains(MonitorKind::RegistryWatch, "m1"));
        assert_eq!(host.feeds().live(), 0);

        // The id is free again after expiry
        registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test"))
            .unwrap();
    }

    #[test]
    fn test_stop_reports_expiry() {
        let (registry, _) = new_registry(test_host());
        registry
            .start(
                MonitorRequest::new(MonitorKind::RegistryWatch, "m1", "HKCU\\Software\\Test")
                    .with_max_duration(Duration::from_millis(10)),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        let stopped = registry.stop(MonitorKind::RegistryWatch, "m1").unwrap();
        assert!(stopped.expired);
        assert!(registry.stop(MonitorKind::RegistryWatch, "m1").is_err());
    }

    #[test]
    fn test_outer_cancellation_expires_session() {
        let (registry, host) = new_registry(test_host());
        let outer = CancelToken::new();
        registry
            .start(
                MonitorRequest::new(MonitorKind::CertificateWatch, "c1", "CurrentUser\\My")
                    .linked_to(outer.clone()),
            )
            .unwrap();
        assert_eq!(registry.sweep_expired(), 0);
        outer.cancel();
        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(host.feeds().live(), 0);
    }

    #[test]
    fn test_cancelled_parent_rejects_start() {
        let (registry, host) = new_registry(test_host());
        let outer = CancelToken::new();
        outer.cancel();
        let err = registry
            .start(
                MonitorRequest::new(MonitorKind::CertificateWatch, "c1", "CurrentUser\\My")
                    .linked_to(outer),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(host.feeds().opened(), 0);
    }

    #[test]
    fn test_default_max_duration_applies() {
        let (registry, _) = new_registry(test_host());
        let registry = registry.with_default_max_duration(Some(Duration::from_secs(600)));
        registry
            .start(MonitorRequest::new(MonitorKind::LogSubscription, "l1", "Application"))
            .unwrap();
        let info = registry.list();
        assert_eq!(info[0].max_duration_secs, Some(600));
        assert!(info[0].remaining_secs.unwrap() <= 600);
    }

    #[test]
    fn test_stop_all_disposes_each_once() {
        let (registry, host) = new_registry(test_host());
        registry
            .start(MonitorRequest::new(MonitorKind::RegistryWatch, "a", "HKCU\\Software\\Test"))
            .unwrap();
        registry
            .start(MonitorRequest::new(MonitorKind::CertificateWatch, "b", "CurrentUser\\My"))
            .unwrap();
        let stopped = registry.stop_all();
        assert_eq!(stopped.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(host.feeds().closed(), 2);
        assert!(registry.stop_all().is_empty());
    }

    #[test]
    fn test_trace_session_name_sanitized() {
        let name = trace_session_name("kernel procs/1", 7);
        assert_eq!(
            name,
            format!("pgate-trace-{}-7-kernel_procs_1", std::process::id())
        );
        assert_ne!(trace_session_name("a b", 1), trace_session_name("a_b", 2));
    }
}
