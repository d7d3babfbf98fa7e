// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Monitor kinds and their target descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::consent::RiskLevel;
use crate::error::{AccessError, Result};
use crate::host::RegistryHive;

/// The kinds of long-lived monitor a session can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MonitorKind {
    #[serde(alias = "registry_watch")]
    RegistryWatch,
    #[serde(alias = "certificate_watch")]
    CertificateWatch,
    #[serde(alias = "trace_session")]
    TraceSession,
    #[serde(alias = "log_subscription")]
    LogSubscription,
}

impl MonitorKind {
    pub const ALL: [MonitorKind; 4] = [
        MonitorKind::RegistryWatch,
        MonitorKind::CertificateWatch,
        MonitorKind::TraceSession,
        MonitorKind::LogSubscription,
    ];

    /// Short lowercase name used in OS-visible session names
    pub fn slug(&self) -> &'static str {
        match self {
            Self::RegistryWatch => "registry",
            Self::CertificateWatch => "cert",
            Self::TraceSession => "trace",
            Self::LogSubscription => "log",
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryWatch => write!(f, "RegistryWatch"),
            Self::CertificateWatch => write!(f, "CertificateWatch"),
            Self::TraceSession => write!(f, "TraceSession"),
            Self::LogSubscription => write!(f, "LogSubscription"),
        }
    }
}

impl FromStr for MonitorKind {
    type Err = AccessError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "registrywatch" | "registry" => Ok(Self::RegistryWatch),
            "certificatewatch" | "certwatch" | "certificate" | "cert" => Ok(Self::CertificateWatch),
            "tracesession" | "trace" | "etw" => Ok(Self::TraceSession),
            "logsubscription" | "log" | "eventlog" => Ok(Self::LogSubscription),
            _ => Err(AccessError::InvalidRequest(format!("unknown monitor kind: {}", s))),
        }
    }
}

/// Certificate store location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreLocation {
    CurrentUser,
    LocalMachine,
}

impl StoreLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentUser => "CurrentUser",
            Self::LocalMachine => "LocalMachine",
        }
    }
}

/// A parsed target descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorTarget {
    /// `HIVE\path`
    Registry { hive: RegistryHive, path: String },
    /// `Location\Store`
    Certificate { location: StoreLocation, store: String },
    /// Comma-separated provider names or GUIDs
    Trace { providers: Vec<String> },
    /// `LogName` or `LogName|xpath`
    Log { log_name: String, xpath: Option<String> },
}

impl MonitorTarget {
    /// Parse `descriptor` for a monitor of `kind`
    pub fn parse(kind: MonitorKind, descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(AccessError::InvalidRequest(format!(
                "{} target descriptor is empty",
                kind
            )));
        }

        match kind {
            MonitorKind::RegistryWatch => {
                let (hive, sub) = RegistryHive::split(descriptor).ok_or_else(|| {
                    AccessError::InvalidRequest(format!("unknown registry hive in '{}'", descriptor))
                })?;
                let path = if sub.is_empty() {
                    hive.to_string()
                } else {
                    format!("{}\\{}", hive, sub)
                };
                Ok(Self::Registry { hive, path })
            }
            MonitorKind::CertificateWatch => {
                let (location, store) = descriptor.split_once('\\').ok_or_else(|| {
                    AccessError::InvalidRequest(format!(
                        "certificate target must be Location\\Store, got '{}'",
                        descriptor
                    ))
                })?;
                let location = match location.to_ascii_lowercase().as_str() {
                    "currentuser" => StoreLocation::CurrentUser,
                    "localmachine" => StoreLocation::LocalMachine,
                    _ => {
                        return Err(AccessError::InvalidRequest(format!(
                            "unknown certificate store location '{}'",
                            location
                        )))
                    }
                };
                let store = store.trim();
                if store.is_empty() || store.contains('\\') {
                    return Err(AccessError::InvalidRequest(format!(
                        "invalid certificate store name '{}'",
                        store
                    )));
                }
                Ok(Self::Certificate {
                    location,
                    store: store.to_string(),
                })
            }
            MonitorKind::TraceSession => {
                let providers: Vec<String> = descriptor
                    .split(',')
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_string())
                    .collect();
                if providers.is_empty() {
                    return Err(AccessError::InvalidRequest(
                        "trace target names no providers".into(),
                    ));
                }
                Ok(Self::Trace { providers })
            }
            MonitorKind::LogSubscription => {
                let (log_name, xpath) = match descriptor.split_once('|') {
                    Some((name, filter)) => {
                        let filter = filter.trim();
                        (name.trim(), (!filter.is_empty()).then(|| filter.to_string()))
                    }
                    None => (descriptor, None),
                };
                if log_name.is_empty() {
                    return Err(AccessError::InvalidRequest("log name is empty".into()));
                }
                Ok(Self::Log {
                    log_name: log_name.to_string(),
                    xpath,
                })
            }
        }
    }

    pub fn kind(&self) -> MonitorKind {
        match self {
            Self::Registry { .. } => MonitorKind::RegistryWatch,
            Self::Certificate { .. } => MonitorKind::CertificateWatch,
            Self::Trace { .. } => MonitorKind::TraceSession,
            Self::Log { .. } => MonitorKind::LogSubscription,
        }
    }

    /// Whether watching this target needs elevation unless the caller says
    /// otherwise
    pub fn requires_elevation(&self) -> bool {
        match self {
            Self::Registry { hive, .. } => hive.is_machine_wide(),
            Self::Certificate { location, .. } => *location == StoreLocation::LocalMachine,
            Self::Trace { .. } => true,
            Self::Log { log_name, .. } => log_name.eq_ignore_ascii_case("Security"),
        }
    }

    /// Risk level quoted in the consent request
    pub fn risk_level(&self) -> RiskLevel {
        match self {
            Self::Trace { .. } => RiskLevel::High,
            Self::Log { log_name, .. } if log_name.eq_ignore_ascii_case("Security") => {
                RiskLevel::High
            }
            _ => RiskLevel::Medium,
        }
    }
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { path, .. } => write!(f, "{}", path),
            Self::Certificate { location, store } => write!(f, "{}\\{}", location.as_str(), store),
            Self::Trace { providers } => write!(f, "{}", providers.join(",")),
            Self::Log { log_name, xpath: Some(x) } => write!(f, "{}|{}", log_name, x),
            Self::Log { log_name, xpath: None } => write!(f, "{}", log_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str_variants() {
        assert_eq!("RegistryWatch".parse::<MonitorKind>().unwrap(), MonitorKind::RegistryWatch);
        assert_eq!("trace_session".parse::<MonitorKind>().unwrap(), MonitorKind::TraceSession);
        assert_eq!("log-subscription".parse::<MonitorKind>().unwrap(), MonitorKind::LogSubscription);
        assert!("filewatch".parse::<MonitorKind>().is_err());
    }

    #[test]
    fn test_kind_serde_alias() {
        let kind: MonitorKind = serde_json::from_str("\"certificate_watch\"").unwrap();
        assert_eq!(kind, MonitorKind::CertificateWatch);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"CertificateWatch\"");
    }

    #[test]
    fn test_registry_target() {
        let t = MonitorTarget::parse(MonitorKind::RegistryWatch, "hkey_current_user\\Software\\Test").unwrap();
        assert_eq!(t.to_string(), "HKCU\\Software\\Test");
        assert!(!t.requires_elevation());

        let t = MonitorTarget::parse(MonitorKind::RegistryWatch, "HKLM\\SYSTEM").unwrap();
        assert!(t.requires_elevation());

        assert!(MonitorTarget::parse(MonitorKind::RegistryWatch, "Software\\Test").is_err());
    }

    #[test]
    fn test_certificate_target() {
        let t = MonitorTarget::parse(MonitorKind::CertificateWatch, "CurrentUser\\My").unwrap();
        assert_eq!(
            t,
            MonitorTarget::Certificate {
                location: StoreLocation::CurrentUser,
                store: "My".into()
            }
        );
        assert!(!t.requires_elevation());
        assert!(MonitorTarget::parse(MonitorKind::CertificateWatch, "LocalMachine\\Root")
            .unwrap()
            .requires_elevation());
        assert!(MonitorTarget::parse(MonitorKind::CertificateWatch, "My").is_err());
        assert!(MonitorTarget::parse(MonitorKind::CertificateWatch, "Remote\\My").is_err());
    }

    #[test]
    fn test_trace_target() {
        let t = MonitorTarget::parse(
            MonitorKind::TraceSession,
            "Microsoft-Windows-Kernel-Process, {22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716},",
        )
        .unwrap();
        match &t {
            MonitorTarget::Trace { providers } => assert_eq!(providers.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.requires_elevation());
        assert_eq!(t.risk_level(), RiskLevel::High);
        assert!(MonitorTarget::parse(MonitorKind::TraceSession, " , ").is_err());
    }

    #[test]
    fn test_log_target() {
        let t = MonitorTarget::parse(MonitorKind::LogSubscription, "Security|*[System[EventID=4624]]").unwrap();
        assert_eq!(
            t,
            MonitorTarget::Log {
                log_name: "Security".into(),
                xpath: Some("*[System[EventID=4624]]".into())
            }
        );
        assert!(t.requires_elevation());

        let t = MonitorTarget::parse(MonitorKind::LogSubscription, "Application").unwrap();
        assert!(!t.requires_elevation());
        assert_eq!(t.to_string(), "Application");
        assert!(MonitorTarget::parse(MonitorKind::LogSubscription, "|*").is_err());
    }
}
