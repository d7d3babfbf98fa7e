// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Cancellation signals and owned cancel handles
//!
//! A [`CancelToken`] is a cheap, cloneable cancellation signal. Tokens form a
//! tree: a child observes its parent, and may carry its own deadline. Nothing
//! here spawns a timer thread; deadlines are evaluated lazily whenever the
//! token is observed.
//!
//! A [`CancelHandle`] is the owned, non-cloneable form held by a monitor
//! session. Disposing it fires the token exactly once, and dropping it
//! disposes it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Why a token fired. The first source observed wins and is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// `cancel()` was called on this token
    Requested,
    /// A linked ancestor fired
    Parent,
    /// The token's own deadline elapsed
    Expired,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::Parent => write!(f, "parent operation cancelled"),
            Self::Expired => write!(f, "maximum duration elapsed"),
        }
    }
}

#[derive(Debug)]
struct TokenState {
    fired: OnceLock<CancelReason>,
    parent: Option<CancelToken>,
    deadline: Option<Instant>,
}

/// Cloneable cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// Create a root token with no parent and no deadline
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Create a token linked to this one
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// Create a linked token that also fires once `timeout` elapses
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some(self.clone()), Instant::now().checked_add(timeout))
    }

    fn build(parent: Option<CancelToken>, deadline: Option<Instant>) -> Self {
        Self {
            state: Arc::new(TokenState {
                fired: OnceLock::new(),
                parent,
                deadline,
            }),
        }
    }

    /// Fire this token. Has no effect if it already fired.
    pub fn cancel(&self) {
        let _ = self.state.fired.set(CancelReason::Requested);
    }

    /// Whether this token, an ancestor, or the deadline has fired
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The latched reason this token fired, if it has
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.state.fired.get() {
            return Some(*reason);
        }

        let observed = if self
            .state
            .parent
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false)
        {
            Some(CancelReason::Parent)
        } else if self
            .state
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
        {
            Some(CancelReason::Expired)
        } else {
            None
        };

        match observed {
            Some(reason) => Some(*self.state.fired.get_or_init(|| reason)),
            None => None,
        }
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.state
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Convert a fired token into a `Cancelled` error
    pub fn check(&self) -> crate::error::Result<()> {
        match self.reason() {
            Some(reason) => Err(crate::error::AccessError::Cancelled(reason.to_string())),
            None => Ok(()),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned cancel handle with idempotent dispose
#[derive(Debug)]
pub struct CancelHandle {
    token: CancelToken,
    disposed: AtomicBool,
}

impl CancelHandle {
    /// Derive a handle from `parent`, optionally armed with a maximum duration
    pub fn linked(parent: &CancelToken, max_duration: Option<Duration>) -> Self {
        let token = match max_duration {
            Some(d) => parent.child_with_timeout(d),
            None => parent.child(),
        };
        Self {
            token,
            disposed: AtomicBool::new(false),
        }
    }

    /// Observe-only view of the handle's signal
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Whether the handle fired (timeout, parent, or explicit)
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and release. Returns `true` only for the call that performed
    /// the release.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
