// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Error types for Privilege Gate

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias for gate operations
pub type Result<T> = std::result::Result<T, AccessError>;

/// Main error type for Privilege Gate
#[derive(Error, Debug)]
pub enum AccessError {
    /// Elevation required and not granted, or an OS-level permission failure
    #[error("access denied - {0}")]
    AccessDenied(String),

    /// Target resource or session id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Session id already active
    #[error("{0} already exists")]
    Conflict(String),

    /// Transient OS/API failure (missing WMI namespace, unsupported platform)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Caller-initiated or timeout-initiated cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Malformed request or target descriptor
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire-level classification of an [`AccessError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    NotFound,
    Conflict,
    Unavailable,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl AccessError {
    /// Classify this error for a remote caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::AccessDenied(_) => ErrorKind::AccessDenied,
            AccessError::NotFound(_) => ErrorKind::NotFound,
            AccessError::Conflict(_) => ErrorKind::Conflict,
            AccessError::Unavailable(_) => ErrorKind::Unavailable,
            AccessError::Cancelled(_) => ErrorKind::Cancelled,
            AccessError::InvalidRequest(_) | AccessError::Json(_) => ErrorKind::InvalidRequest,
            AccessError::Configuration(_) => ErrorKind::Internal,
            AccessError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
                _ => ErrorKind::Unavailable,
            },
        }
    }

    /// Map an I/O failure from an OS call into the access taxonomy
    pub fn from_os(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AccessError::NotFound(what.to_string()),
            io::ErrorKind::PermissionDenied => AccessError::AccessDenied(what.to_string()),
            _ => AccessError::Unavailable(format!("{}: {}", what, err)),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}
