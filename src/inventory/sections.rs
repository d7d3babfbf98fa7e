// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Inventory section records and their WMI collectors

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::host::{HostCapabilities, WmiQuery, WmiRow};

/// WMI namespace holding the BitLocker provider
pub const BITLOCKER_NAMESPACE: &str = "root\\CIMV2\\Security\\MicrosoftVolumeEncryption";
/// WMI namespace holding power plans
pub const POWER_NAMESPACE: &str = "root\\cimv2\\power";

/// One inventory section's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventorySection {
    Hardware(HardwareInfo),
    Drivers(Vec<DriverInfo>),
    Storage(Vec<VolumeInfo>),
    Network(Vec<NetworkAdapterInfo>),
    Power(PowerInfo),
    Security(SecurityInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub domain: Option<String>,
    pub total_memory_bytes: Option<u64>,
    pub serial_number: Option<String>,
    pub bios_version: Option<String>,
    pub processor: Option<String>,
    pub physical_cores: Option<u32>,
    pub logical_processors: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub display_name: Option<String>,
    pub state: Option<String>,
    pub start_mode: Option<String>,
    pub path: Option<String>,
}

impl DriverInfo {
    fn from_row(row: &WmiRow) -> Option<Self> {
        Some(Self {
            name: row.string("Name")?,
            display_name: row.string("DisplayName"),
            state: row.string("State"),
            start_mode: row.string("StartMode"),
            path: row.string("PathName"),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.as_deref() == Some("Running")
    }
}

/// A fixed local volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub device_id: String,
    pub label: Option<String>,
    pub file_system: Option<String>,
    pub size_bytes: u64,
    pub free_bytes: u64,
}

impl VolumeInfo {
    fn from_row(row: &WmiRow) -> Option<Self> {
        Some(Self {
            device_id: row.string("DeviceID")?,
            label: row.string("VolumeName"),
            file_system: row.string("FileSystem"),
            size_bytes: row.u64("Size").unwrap_or(0),
            free_bytes: row.u64("FreeSpace").unwrap_or(0),
        })
    }

    pub fn used_percent(&self) -> f64 {
        if self.size_bytes == 0 {
            return 0.0;
        }
        let used = self.size_bytes.saturating_sub(self.free_bytes);
        used as f64 / self.size_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapterInfo {
    pub description: String,
    pub mac_address: Option<String>,
    pub ip_addresses: Vec<String>,
    pub dhcp_enabled: bool,
}

impl NetworkAdapterInfo {
    fn from_row(row: &WmiRow) -> Option<Self> {
        Some(Self {
            description: row.string("Description")?,
            mac_address: row.string("MACAddress"),
            ip_addresses: row.strings("IPAddress"),
            dhcp_enabled: row.bool("DHCPEnabled").unwrap_or(false),
        })
    }
}

/// Battery state as reported by `Win32_Battery.BatteryStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Discharging,
    OnAc,
    FullyCharged,
    Low,
    Critical,
    Charging,
    Unknown,
}

impl BatteryState {
    fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Discharging,
            2 => Self::OnAc,
            3 => Self::FullyCharged,
            4 => Self::Low,
            5 => Self::Critical,
            6..=9 => Self::Charging,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerInfo {
    pub has_battery: bool,
    pub battery_charge_percent: Option<u8>,
    pub battery_state: Option<BatteryState>,
    pub active_power_plan: Option<String>,
}

/// BitLocker protection status of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionStatus {
    Off,
    On,
    Unknown,
}

impl ProtectionStatus {
    fn from_code(code: Option<u64>) -> Self {
        match code {
            Some(0) => Self::Off,
            Some(1) => Self::On,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitLockerVolume {
    pub drive_letter: String,
    pub protection: ProtectionStatus,
    pub encryption_method: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub bitlocker_volumes: Vec<BitLockerVolume>,
}

impl SecurityInfo {
    /// Every volume reports protection on
    pub fn fully_protected(&self) -> bool {
        !self.bitlocker_volumes.is_empty()
            && self
                .bitlocker_volumes
                .iter()
                .all(|v| v.protection == ProtectionStatus::On)
    }
}

fn first_row(host: &dyn HostCapabilities, query: &WmiQuery) -> Result<WmiRow> {
    host.query_wmi(query)?
        .into_iter()
        .next()
        .ok_or_else(|| AccessError::Unavailable(format!("{} returned no rows", query)))
}

pub fn collect_hardware(host: &dyn HostCapabilities) -> Result<HardwareInfo> {
    let system = first_row(
        host,
        &WmiQuery::cimv2("SELECT Manufacturer, Model, Domain, TotalPhysicalMemory FROM Win32_ComputerSystem"),
    )?;
    let bios = first_row(
        host,
        &WmiQuery::cimv2("SELECT SerialNumber, SMBIOSBIOSVersion FROM Win32_BIOS"),
    )?;
    let processors = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, NumberOfCores, NumberOfLogicalProcessors FROM Win32_Processor",
    ))?;

    let sum = |key: &str| -> Option<u32> {
        let values: Vec<u64> = processors.iter().filter_map(|p| p.u64(key)).collect();
        (!values.is_empty()).then(|| values.iter().sum::<u64>() as u32)
    };

    Ok(HardwareInfo {
        manufacturer: system.string("Manufacturer"),
        model: system.string("Model"),
        domain: system.string("Domain"),
        total_memory_bytes: system.u64("TotalPhysicalMemory"),
        serial_number: bios.string("SerialNumber"),
        bios_version: bios.string("SMBIOSBIOSVersion"),
        processor: processors.first().and_then(|p| p.string("Name")),
        physical_cores: sum("NumberOfCores"),
        logical_processors: sum("NumberOfLogicalProcessors"),
    })
}

pub fn collect_drivers(host: &dyn HostCapabilities) -> Result<Vec<DriverInfo>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Name, DisplayName, State, StartMode, PathName FROM Win32_SystemDriver",
    ))?;
    let mut drivers: Vec<DriverInfo> = rows.iter().filter_map(DriverInfo::from_row).collect();
    drivers.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    Ok(drivers)
}

pub fn collect_storage(host: &dyn HostCapabilities) -> Result<Vec<VolumeInfo>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT DeviceID, VolumeName, FileSystem, Size, FreeSpace FROM Win32_LogicalDisk WHERE DriveType = 3",
    ))?;
    Ok(rows.iter().filter_map(VolumeInfo::from_row).collect())
}

pub fn collect_network(host: &dyn HostCapabilities) -> Result<Vec<NetworkAdapterInfo>> {
    let rows = host.query_wmi(&WmiQuery::cimv2(
        "SELECT Description, MACAddress, IPAddress, DHCPEnabled FROM Win32_NetworkAdapterConfiguration WHERE IPEnabled = TRUE",
    ))?;
    Ok(rows.iter().filter_map(NetworkAdapterInfo::from_row).collect())
}

pub fn collect_power(host: &dyn HostCapabilities) -> Result<PowerInfo> {
    let batteries = host.query_wmi(&WmiQuery::cimv2(
        "SELECT BatteryStatus, EstimatedChargeRemaining FROM Win32_Battery",
    ))?;
    let battery = batteries.first();

    // Power plans live in their own namespace, which some SKUs lack
    let active_power_plan = match host.query_wmi(&WmiQuery::new(
        POWER_NAMESPACE,
        "SELECT ElementName, IsActive FROM Win32_PowerPlan WHERE IsActive = TRUE",
    )) {
        Ok(rows) => rows
            .iter()
            .find(|r| r.bool("IsActive").unwrap_or(true))
            .and_then(|r| r.string("ElementName")),
        Err(e) => {
            log::debug!("Power plan query failed: {}", e);
            None
        }
    };

    Ok(PowerInfo {
        has_battery: battery.is_some(),
        battery_charge_percent: battery
            .and_then(|b| b.u64("EstimatedChargeRemaining"))
            .map(|c| c.min(100) as u8),
        battery_state: battery
            .and_then(|b| b.u64("BatteryStatus"))
            .map(BatteryState::from_code),
        active_power_plan,
    })
}

/// BitLocker status; the provider only answers elevated callers
pub fn collect_security(host: &dyn HostCapabilities) -> Result<SecurityInfo> {
    let rows = host.query_wmi(&WmiQuery::new(
        BITLOCKER_NAMESPACE,
        "SELECT DriveLetter, ProtectionStatus, EncryptionMethod FROM Win32_EncryptableVolume",
    ))?;
    let bitlocker_volumes = rows
        .iter()
        .filter_map(|row| {
            Some(BitLockerVolume {
                drive_letter: row.string("DriveLetter")?,
                protection: ProtectionStatus::from_code(row.u64("ProtectionStatus")),
                encryption_method: row.u64("EncryptionMethod").map(|m| m as u32),
            })
        })
        .collect();
    Ok(SecurityInfo { bitlocker_volumes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ScriptedHost;

    #[test]
    fn test_hardware_from_fixture() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let hw = collect_hardware(&host).unwrap();
        assert_eq!(hw.manufacturer.as_deref(), Some("Contoso"));
        assert_eq!(hw.total_memory_bytes, Some(34_359_738_368));
        assert_eq!(hw.serial_number.as_deref(), Some("CZC1234XYZ"));
        assert_eq!(hw.logical_processors, Some(16));
        assert_eq!(hw.physical_cores, Some(8));
    }

    #[test]
    fn test_hardware_requires_system_row() {
        let host = ScriptedHost::new()
            .with_inventory_fixture()
            .with_wmi("Win32_ComputerSystem", Vec::new());
        let err = collect_hardware(&host).unwrap_err();
        assert!(err.to_string().contains("returned no rows"));
    }

    #[test]
    fn test_drivers_sorted_and_rowless_skipped() {
        let host = ScriptedHost::new().with_wmi(
            "Win32_SystemDriver",
            vec![
                WmiRow::new().with("Name", "tcpip").with("State", "Running"),
                WmiRow::new().with("DisplayName", "nameless"),
                WmiRow::new().with("Name", "Disk").with("State", "Stopped"),
            ],
        );
        let drivers = collect_drivers(&host).unwrap();
        let names: Vec<_> = drivers.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Disk", "tcpip"]);
        assert!(drivers[1].is_running());
    }

    #[test]
    fn test_storage_used_percent() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let volumes = collect_storage(&host).unwrap();
        assert_eq!(volumes.len(), 1);
        let used = volumes[0].used_percent();
        assert!(used > 60.0 && used < 61.0, "{}", used);
    }

    #[test]
    fn test_network_addresses() {
        let host = ScriptedHost::new().with_inventory_fixture();
        let adapters = collect_network(&host).unwrap();
        assert_eq!(adapters[0].ip_addresses.len(), 2);
        assert!(adapters[0].dhcp_enabled);
    }

    #[test]
    fn test_power_without_plan_namespace() {
        let host = ScriptedHost::new()
            .with_inventory_fixture()
            .failing_wmi("Win32_PowerPlan", "invalid namespace");
        let power = collect_power(&host).unwrap();
        assert!(power.has_battery);
        assert_eq!(power.battery_charge_percent, Some(87));
        assert_eq!(power.battery_state, Some(BatteryState::OnAc));
        assert_eq!(power.active_power_plan, None);
    }

    #[test]
    fn test_power_desktop_without_battery() {
        let host = ScriptedHost::new()
            .with_inventory_fixture()
            .with_wmi("Win32_Battery", Vec::new());
        let power = collect_power(&host).unwrap();
        assert!(!power.has_battery);
        assert_eq!(power.active_power_plan.as_deref(), Some("Balanced"));
    }

    #[test]
    fn test_security_protection_status() {
        let host = ScriptedHost::new().with_wmi(
            "Win32_EncryptableVolume",
            vec![
                WmiRow::new().with("DriveLetter", "C:").with("ProtectionStatus", 1),
                WmiRow::new().with("DriveLetter", "D:").with("ProtectionStatus", 0),
                WmiRow::new().with("DriveLetter", "E:"),
            ],
        );
        let security = collect_security(&host).unwrap();
        let statuses: Vec<_> = security.bitlocker_volumes.iter().map(|v| v.protection).collect();
        assert_eq!(
            statuses,
            vec![ProtectionStatus::On, ProtectionStatus::Off, ProtectionStatus::Unknown]
        );
        assert!(!security.fully_protected());
    }
}
