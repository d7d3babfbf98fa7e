// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Windows host adapter
//!
//! This module talks to Windows using:
//! - Process token queries (`TokenElevation`, `TokenElevationType`,
//!   `TokenPrivileges`) for the elevation probe
//! - `winreg` for registry keys
//! - WMI through the `wmi` crate for inventory and performance rows
//! - PowerShell for certificate stores and event logs
//! - `logman` for real-time ETW sessions

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Command;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, LUID};
use windows::Win32::Security::{
    GetTokenInformation, LookupPrivilegeNameW, TokenElevation, TokenElevationType,
    TokenElevationTypeLimited, TokenPrivileges, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ELEVATION, TOKEN_ELEVATION_TYPE, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use winreg::enums::{
    HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS,
    KEY_NOTIFY, KEY_READ,
};
use winreg::RegKey;
use wmi::{COMLibrary, Variant, WMIConnection};

use super::{
    ElevationProbe, EventLogEntry, EventLogFilter, FeedHandle, HostCapabilities, MonitorFeed,
    NativeHost, RegistryHive, WmiQuery, WmiRow,
};
use crate::error::{AccessError, Result};

// ── Elevation probe ──

/// Process token closed on drop
struct TokenGuard(HANDLE);

impl Drop for TokenGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn open_process_token() -> Result<TokenGuard> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }
        .map_err(|e| AccessError::Unavailable(format!("OpenProcessToken: {}", e)))?;
    Ok(TokenGuard(token))
}

fn token_is_elevated(token: &TokenGuard) -> Result<bool> {
    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned = 0u32;
    unsafe {
        GetTokenInformation(
            token.0,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    }
    .map_err(|e| AccessError::Unavailable(format!("TokenElevation: {}", e)))?;
    Ok(elevation.TokenIsElevated != 0)
}

fn token_elevation_type(token: &TokenGuard) -> Result<TOKEN_ELEVATION_TYPE> {
    let mut kind = TOKEN_ELEVATION_TYPE::default();
    let mut returned = 0u32;
    unsafe {
        GetTokenInformation(
            token.0,
            TokenElevationType,
            Some(&mut kind as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION_TYPE>() as u32,
            &mut returned,
        )
    }
    .map_err(|e| AccessError::Unavailable(format!("TokenElevationType: {}", e)))?;
    Ok(kind)
}

fn enabled_privileges(token: &TokenGuard) -> BTreeSet<String> {
    let mut names = BTreeSet::new();

    // First call reports the required buffer size.
    let mut needed = 0u32;
    let _ = unsafe { GetTokenInformation(token.0, TokenPrivileges, None, 0, &mut needed) };
    if needed == 0 {
        return names;
    }

    // u64 backing keeps the buffer aligned for TOKEN_PRIVILEGES.
    let mut buffer = vec![0u64; (needed as usize + 7) / 8];
    if unsafe {
        GetTokenInformation(
            token.0,
            TokenPrivileges,
            Some(buffer.as_mut_ptr() as *mut _),
            needed,
            &mut needed,
        )
    }
    .is_err()
    {
        return names;
    }

    let header = buffer.as_ptr() as *const TOKEN_PRIVILEGES;
    let count = unsafe { (*header).PrivilegeCount } as usize;
    let entries: &[LUID_AND_ATTRIBUTES] =
        unsafe { std::slice::from_raw_parts((*header).Privileges.as_ptr(), count) };

    for entry in entries {
        if entry.Attributes.0 & SE_PRIVILEGE_ENABLED.0 == 0 {
            continue;
        }
        if let Some(name) = privilege_name(&entry.Luid) {
            names.insert(name);
        }
    }
    names
}

fn privilege_name(luid: &LUID) -> Option<String> {
    let mut buf = [0u16; 128];
    let mut len = buf.len() as u32;
    unsafe {
        LookupPrivilegeNameW(
            PCWSTR::null(),
            luid as *const LUID,
            PWSTR(buf.as_mut_ptr()),
            &mut len,
        )
    }
    .ok()?;
    Some(String::from_utf16_lossy(&buf[..len as usize]))
}

// ── WMI ──

/// Create WMI connection with robust COM initialization
/// Handles cases where COM is already initialized on this thread
fn create_wmi_connection(namespace: &str) -> Result<WMIConnection> {
    // Strategy 1: Fresh COM initialization (works best in collector threads)
    if let Ok(com) = COMLibrary::new() {
        if let Ok(conn) = WMIConnection::with_namespace_path(namespace, com) {
            return Ok(conn);
        }
    }

    // Strategy 2: COM without security init
    if let Ok(com) = COMLibrary::without_security() {
        if let Ok(conn) = WMIConnection::with_namespace_path(namespace, com) {
            return Ok(conn);
        }
    }

    // Strategy 3: Assume COM is already initialized by the host process
    let com = unsafe { COMLibrary::assume_initialized() };
    WMIConnection::with_namespace_path(namespace, com).map_err(|e| wmi_error(namespace, e))
}

fn wmi_error(context: &str, err: wmi::WMIError) -> AccessError {
    let message = err.to_string();
    // WBEM_E_ACCESS_DENIED
    if message.contains("0x80041003") || message.to_lowercase().contains("access denied") {
        AccessError::AccessDenied(format!("{}: {}", context, message))
    } else {
        AccessError::Unavailable(format!("{}: {}", context, message))
    }
}

fn variant_to_json(value: Variant) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Variant::Empty | Variant::Null => Value::Null,
        Variant::String(s) => Value::String(s),
        Variant::Bool(b) => Value::Bool(b),
        Variant::I1(n) => n.into(),
        Variant::I2(n) => n.into(),
        Variant::I4(n) => n.into(),
        Variant::I8(n) => n.into(),
        Variant::UI1(n) => n.into(),
        Variant::UI2(n) => n.into(),
        Variant::UI4(n) => n.into(),
        Variant::UI8(n) => n.into(),
        Variant::R4(f) => f.into(),
        Variant::R8(f) => f.into(),
        Variant::Array(items) => Value::Array(items.into_iter().map(variant_to_json).collect()),
        _ => Value::Null,
    }
}

// ── PowerShell ──

/// Quote a value for a single-quoted PowerShell literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn run_powershell(script: &str, what: &str) -> Result<String> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| AccessError::from_os(e, "powershell"))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Err(classify_failure(&stderr, what))
}

fn classify_failure(stderr: &str, what: &str) -> AccessError {
    let lower = stderr.to_lowercase();
    if lower.contains("access is denied")
        || lower.contains("unauthorized operation")
        || lower.contains("requires elevation")
    {
        AccessError::AccessDenied(what.to_string())
    } else if lower.contains("already exists") {
        AccessError::Conflict(what.to_string())
    } else if lower.contains("cannot find path")
        || lower.contains("no events were found")
        || lower.contains("there is not an event log")
        || lower.contains("could not be found")
        || lower.contains("not found")
    {
        AccessError::NotFound(what.to_string())
    } else {
        let first_line = stderr.lines().next().unwrap_or("").trim();
        AccessError::Unavailable(format!("{}: {}", what, first_line))
    }
}

/// `ConvertTo-Json` emits an object for a single result and an array otherwise
fn json_items(text: &str) -> Vec<serde_json::Value> {
    if text.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(arr)) => arr,
        Ok(obj @ serde_json::Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn cert_path(location: &str, name: &str) -> Result<String> {
    let location = match location.to_ascii_lowercase().as_str() {
        "currentuser" => "CurrentUser",
        "localmachine" => "LocalMachine",
        _ => {
            return Err(AccessError::InvalidRequest(format!(
                "unknown certificate store location '{}'",
                location
            )))
        }
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
    {
        return Err(AccessError::InvalidRequest(format!(
            "invalid certificate store name '{}'",
            name
        )));
    }
    Ok(format!("Cert:\\{}\\{}", location, name))
}

// ── Feeds ──

/// Registry key opened with `KEY_NOTIFY`; no notification is armed
struct RegistryWatchFeed {
    path: String,
    key: Option<RegKey>,
}

impl MonitorFeed for RegistryWatchFeed {
    fn describe(&self) -> String {
        format!("registry watch on {}", self.path)
    }

    fn close(&mut self) {
        self.key.take();
    }
}

/// Store path plus the count seen at open
struct CertStoreFeed {
    path: String,
    baseline: usize,
    open: bool,
}

impl MonitorFeed for CertStoreFeed {
    fn describe(&self) -> String {
        let state = if self.open { "open" } else { "closed" };
        format!(
            "certificate watch on {} ({} certificates, {})",
            self.path, self.baseline, state
        )
    }

    fn close(&mut self) {
        self.open = false;
    }
}

struct EtwFeed {
    session_name: String,
    running: bool,
}

impl MonitorFeed for EtwFeed {
    fn describe(&self) -> String {
        format!("ETW session {}", self.session_name)
    }

    fn close(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        match Command::new("logman")
            .args(["stop", &self.session_name, "-ets"])
            .output()
        {
            Ok(out) if out.status.success() => {
                log::debug!("stopped ETW session {}", self.session_name);
            }
            Ok(out) => log::warn!(
                "logman stop {} failed: {}",
                self.session_name,
                String::from_utf8_lossy(&out.stdout).trim()
            ),
            Err(e) => log::warn!("logman stop {} failed: {}", self.session_name, e),
        }
    }
}

impl Drop for EtwFeed {
    fn drop(&mut self) {
        self.close();
    }
}

/// Log name and filter checked at open
struct EventLogFeed {
    log_name: String,
    xpath: Option<String>,
    open: bool,
}

impl MonitorFeed for EventLogFeed {
    fn describe(&self) -> String {
        let state = if self.open { "open" } else { "closed" };
        match &self.xpath {
            Some(x) => format!("event log subscription on {} [{}] ({})", self.log_name, x, state),
            None => format!("event log subscription on {} ({})", self.log_name, state),
        }
    }

    fn close(&mut self) {
        self.open = false;
    }
}

fn open_registry_key(path: &str) -> std::io::Result<RegKey> {
    let (hive, subkey) = RegistryHive::split(path).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "unknown registry hive")
    })?;
    let root = RegKey::predef(match hive {
        RegistryHive::ClassesRoot => HKEY_CLASSES_ROOT,
        RegistryHive::CurrentUser => HKEY_CURRENT_USER,
        RegistryHive::LocalMachine => HKEY_LOCAL_MACHINE,
        RegistryHive::Users => HKEY_USERS,
        RegistryHive::CurrentConfig => HKEY_CURRENT_CONFIG,
    });
    root.open_subkey_with_flags(subkey, KEY_READ | KEY_NOTIFY)
}

impl HostCapabilities for NativeHost {
    fn probe_elevation(&self) -> Result<ElevationProbe> {
        let token = open_process_token()?;
        let is_elevated = token_is_elevated(&token)?;
        // A split (limited) token means an administrator running filtered.
        let is_administrator =
            is_elevated || token_elevation_type(&token)? == TokenElevationTypeLimited;

        Ok(ElevationProbe {
            is_administrator,
            is_elevated,
            principal_name: std::env::var("USERNAME").unwrap_or_default(),
            principal_domain: std::env::var("USERDOMAIN").unwrap_or_default(),
            enabled_privileges: enabled_privileges(&token),
        })
    }

    fn registry_key_exists(&self, path: &str) -> Result<bool> {
        match open_registry_key(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AccessError::from_os(e, path)),
        }
    }

    fn open_registry_watch(&self, path: &str) -> Result<FeedHandle> {
        let key = open_registry_key(path).map_err(|e| AccessError::from_os(e, path))?;
        Ok(Box::new(RegistryWatchFeed {
            path: path.to_string(),
            key: Some(key),
        }))
    }

    fn cert_store_open(&self, location: &str, name: &str) -> Result<usize> {
        let path = cert_path(location, name)?;
        let script = format!(
            "(Get-ChildItem -Path {} -ErrorAction Stop | Measure-Object).Count",
            ps_quote(&path)
        );
        let text = run_powershell(&script, &path)?;
        text.parse::<usize>()
            .map_err(|_| AccessError::Unavailable(format!("{}: unexpected output '{}'", path, text)))
    }

    fn open_cert_watch(&self, location: &str, name: &str) -> Result<FeedHandle> {
        let baseline = self.cert_store_open(location, name)?;
        Ok(Box::new(CertStoreFeed {
            path: cert_path(location, name)?,
            baseline,
            open: true,
        }))
    }

    fn query_wmi(&self, query: &WmiQuery) -> Result<Vec<WmiRow>> {
        let conn = create_wmi_connection(&query.namespace)?;
        let rows: Vec<HashMap<String, Variant>> = conn
            .raw_query(&query.query)
            .map_err(|e| wmi_error(&query.query, e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                WmiRow(
                    row.into_iter()
                        .map(|(k, v)| (k, variant_to_json(v)))
                        .collect::<BTreeMap<_, _>>(),
                )
            })
            .collect())
    }

    fn start_etw(&self, session_name: &str, providers: &[String]) -> Result<FeedHandle> {
        let (first, rest) = providers
            .split_first()
            .ok_or_else(|| AccessError::InvalidRequest("no trace providers given".into()))?;

        let out = Command::new("logman")
            .args(["start", session_name, "-p", first, "-ets", "-rt"])
            .output()
            .map_err(|e| AccessError::from_os(e, "logman"))?;
        if !out.status.success() {
            return Err(classify_failure(
                &String::from_utf8_lossy(&out.stdout),
                &format!("trace session {}", session_name),
            ));
        }

        // Owns the session from here on; dropping stops it.
        let feed = EtwFeed {
            session_name: session_name.to_string(),
            running: true,
        };

        for provider in rest {
            let out = Command::new("logman")
                .args(["update", "trace", session_name, "-p", provider, "-ets"])
                .output()
                .map_err(|e| AccessError::from_os(e, "logman"))?;
            if !out.status.success() {
                return Err(classify_failure(
                    &String::from_utf8_lossy(&out.stdout),
                    &format!("trace provider {}", provider),
                ));
            }
        }

        Ok(Box::new(feed))
    }

    fn query_event_log(
        &self,
        log_name: &str,
        filter: &EventLogFilter,
    ) -> Result<Vec<EventLogEntry>> {
        let mut script = format!(
            "Get-WinEvent -LogName {} -MaxEvents {} -ErrorAction Stop",
            ps_quote(log_name),
            filter.max_events.unwrap_or(50)
        );
        if let Some(xpath) = &filter.xpath {
            script.push_str(&format!(" -FilterXPath {}", ps_quote(xpath)));
        }
        script.push_str(
            " | Select-Object RecordId, Id, ProviderName, LevelDisplayName, \
             @{n='TimeCreated';e={$_.TimeCreated.ToString('o')}}, Message \
             | ConvertTo-Json -Compress",
        );

        let text = match run_powershell(&script, log_name) {
            Ok(text) => text,
            // Get-WinEvent fails when the filter simply matched nothing.
            Err(AccessError::NotFound(_)) if !log_missing(log_name) => String::new(),
            Err(e) => return Err(e),
        };

        Ok(json_items(&text)
            .iter()
            .map(|item| EventLogEntry {
                record_id: item["RecordId"].as_u64().unwrap_or(0),
                event_id: item["Id"].as_u64().unwrap_or(0) as u32,
                provider: item["ProviderName"].as_str().unwrap_or("").to_string(),
                level: item["LevelDisplayName"].as_str().unwrap_or("").to_string(),
                time_created: item["TimeCreated"].as_str().unwrap_or("").to_string(),
                message: item["Message"].as_str().unwrap_or("").trim().to_string(),
            })
            .collect())
    }

    fn subscribe_event_log(&self, log_name: &str, filter: &EventLogFilter) -> Result<FeedHandle> {
        let probe = EventLogFilter {
            xpath: filter.xpath.clone(),
            max_events: Some(1),
        };
        self.query_event_log(log_name, &probe)?;
        Ok(Box::new(EventLogFeed {
            log_name: log_name.to_string(),
            xpath: filter.xpath.clone(),
            open: true,
        }))
    }
}

fn log_missing(log_name: &str) -> bool {
    let script = format!(
        "if (Get-WinEvent -ListLog {} -ErrorAction SilentlyContinue) {{ 'yes' }} else {{ 'no' }}",
        ps_quote(log_name)
    );
    matches!(run_powershell(&script, log_name).as_deref(), Ok("no"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_quote_escapes() {
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_cert_path_validation() {
        assert_eq!(cert_path("currentuser", "My").unwrap(), "Cert:\\CurrentUser\\My");
        assert!(cert_path("Elsewhere", "My").is_err());
        assert!(cert_path("LocalMachine", "My'; rm").is_err());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Access is denied.", "x"),
            AccessError::AccessDenied(_)
        ));
        assert!(matches!(
            classify_failure("There is not an event log on the localhost computer", "x"),
            AccessError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("Error:\r\nData Collector already exists.", "trace session t"),
            AccessError::Conflict(_)
        ));
    }

    #[test]
    fn test_probe_runs() {
        let probe = NativeHost::new().probe_elevation().unwrap();
        if probe.is_elevated {
            assert!(probe.is_administrator);
        }
    }
}
