// ============================================
// bootsmith - devices.rs
// ============================================
// Block device enumeration. This is the safety net in front of the
// media writer: before anything destructive happens we need to know
// which devices exist, which are whole disks vs. partitions, and
// which are mounted (writing over a mounted disk is how systems die).
//
// The data comes from `lsblk -J`, which prints the kernel's view of
// the block layer as JSON. We parse exactly the six columns we ask
// for; missing TRAN/MODEL values mean "unknown", not an error.
// ============================================

use std::process::Command;

use serde::Deserialize;
use thiserror::Error;

/// The lsblk columns we request. Keep in sync with `LsblkEntry`.
const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINT,TRAN,MODEL";

// ============================================
// ERRORS
// ============================================

/// Device listing failed. Callers should degrade to "no devices
/// available" and surface the message, never crash.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("could not run lsblk: {0}")]
    Unavailable(#[from] std::io::Error),

    #[error("lsblk exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("could not parse lsblk output: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ============================================
// DATA STRUCTURES
// ============================================

/// How the device is attached to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Sata,
    Nvme,
    Other(String),
    Unknown,
}

impl Transport {
    fn from_lsblk(tran: Option<&str>) -> Self {
        match tran {
            Some("usb") => Transport::Usb,
            Some("sata") | Some("ata") => Transport::Sata,
            Some("nvme") => Transport::Nvme,
            Some(other) if !other.is_empty() => Transport::Other(other.to_string()),
            _ => Transport::Unknown,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Transport::Usb => "usb",
            Transport::Sata => "sata",
            Transport::Nvme => "nvme",
            Transport::Other(s) => s,
            Transport::Unknown => "unknown",
        }
    }
}

/// Whole disk or a partition inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    WholeDisk,
    Partition,
}

/// One block device as the writer and the UI see it.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// Device node path, e.g. "/dev/sdb"
    pub path: String,
    /// Human-readable size straight from lsblk, e.g. "14.9G"
    pub size: String,
    /// Whole disk or partition
    pub class: DeviceClass,
    /// Where this device is mounted, if anywhere (partitions, mostly)
    pub mountpoint: Option<String>,
    /// usb / sata / nvme / ... (whole disks; partitions inherit)
    pub transport: Transport,
    /// Device model string, if the kernel knows it
    pub model: Option<String>,
    /// For partitions: path of the whole disk they live on
    pub parent: Option<String>,
    /// Whole disks: true when any child partition is mounted
    pub has_mounted_partitions: bool,
    /// Whole disks: true when this disk holds the running system's /
    pub is_system_disk: bool,
}

impl BlockDevice {
    /// Machine-checkable hazard flag. A hazardous device must never be
    /// offered as a write target without an explicit override.
    pub fn is_hazardous(&self) -> bool {
        self.mountpoint.is_some() || self.has_mounted_partitions || self.is_system_disk
    }

    /// One-line summary for device listings,
    /// e.g. "/dev/sdb  14.9G  usb  SanDisk Ultra  [MOUNTED]"
    pub fn display_string(&self) -> String {
        let model = self.model.as_deref().unwrap_or("-");
        let hazard = if self.is_system_disk {
            "  [SYSTEM]"
        } else if self.is_hazardous() {
            "  [MOUNTED]"
        } else {
            ""
        };
        format!(
            "{}  {}  {}  {}{}",
            self.path,
            self.size,
            self.transport.label(),
            model,
            hazard
        )
    }
}

// ============================================
// LSBLK JSON SHAPE
// ============================================
// Matches `lsblk -J -o NAME,SIZE,TYPE,MOUNTPOINT,TRAN,MODEL`.
// serde ignores any extra fields lsblk versions may add.

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

// ============================================
// ENUMERATION
// ============================================

/// List the machine's block devices, whole disks first in each pair.
///
/// Whole disks with a USB transport sort before everything else so the
/// most likely target (a thumb drive) is at the top, not the system
/// NVMe. Loop and rom devices are filtered out - neither is a valid
/// write target.
pub fn list_devices() -> Result<Vec<BlockDevice>, EnumerationError> {
    let output = Command::new("lsblk")
        .args(["-J", "-o", LSBLK_COLUMNS])
        .output()?;

    if !output.status.success() {
        return Err(EnumerationError::CommandFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

/// Parse lsblk JSON into the flat device list. Split out from
/// `list_devices` so it can be tested against canned output.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>, EnumerationError> {
    let report: LsblkReport = serde_json::from_str(json)?;

    let mut devices = Vec::new();

    for entry in &report.blockdevices {
        if entry.kind != "disk" {
            // loop devices, roms, zram - not writable targets
            continue;
        }

        let disk_path = format!("/dev/{}", entry.name);
        let transport = Transport::from_lsblk(entry.tran.as_deref());

        let mut has_mounted = false;
        let mut holds_root = entry.mountpoint.as_deref() == Some("/");
        let mut partitions = Vec::new();

        for child in &entry.children {
            if child.kind != "part" {
                continue;
            }
            let mounted = child.mountpoint.is_some();
            has_mounted |= mounted;
            holds_root |= child.mountpoint.as_deref() == Some("/");

            partitions.push(BlockDevice {
                path: format!("/dev/{}", child.name),
                size: child.size.clone().unwrap_or_default(),
                class: DeviceClass::Partition,
                mountpoint: child.mountpoint.clone(),
                transport: transport.clone(),
                model: None,
                parent: Some(disk_path.clone()),
                has_mounted_partitions: false,
                is_system_disk: false,
            });
        }

        devices.push(BlockDevice {
            path: disk_path,
            size: entry.size.clone().unwrap_or_default(),
            class: DeviceClass::WholeDisk,
            mountpoint: entry.mountpoint.clone(),
            transport,
            model: entry.model.as_deref().map(|m| m.trim().to_string()),
            parent: None,
            has_mounted_partitions: has_mounted,
            is_system_disk: holds_root,
        });
        devices.extend(partitions);
    }

    // USB-attached disks first, then by path. Partitions travel with
    // their parent because they share its transport and sort after it
    // lexicographically (/dev/sdb < /dev/sdb1).
    devices.sort_by(|a, b| {
        let a_usb = a.transport == Transport::Usb;
        let b_usb = b.transport == Transport::Usb;
        b_usb.cmp(&a_usb).then_with(|| a.path.cmp(&b.path))
    });

    log::debug!("enumerated {} block devices", devices.len());
    Ok(devices)
}

/// Find one device by its node path in a fresh enumeration.
pub fn find_device(path: &str) -> Result<Option<BlockDevice>, EnumerationError> {
    Ok(list_devices()?.into_iter().find(|d| d.path == path))
}

// ============================================
// SIZE FORMATTING
// ============================================

/// Format a byte count as a human-readable size string.
///
/// Examples:
///   format_size(9_000_000) => "8.6 MB"
///   format_size(512_000)   => "500 KB"
///   format_size(1_500_000_000) => "1.4 GB"
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A system NVMe with mounted partitions plus a clean USB stick.
    const TWO_DISKS: &str = r#"{
        "blockdevices": [
            {"name":"nvme0n1", "size":"476.9G", "type":"disk", "mountpoint":null,
             "tran":"nvme", "model":"Samsung SSD 970 EVO",
             "children": [
                {"name":"nvme0n1p1", "size":"512M", "type":"part", "mountpoint":"/boot/efi", "tran":null, "model":null},
                {"name":"nvme0n1p2", "size":"476.4G", "type":"part", "mountpoint":"/", "tran":null, "model":null}
             ]},
            {"name":"sdb", "size":"14.9G", "type":"disk", "mountpoint":null,
             "tran":"usb", "model":"SanDisk Ultra", "children": []},
            {"name":"loop0", "size":"4K", "type":"loop", "mountpoint":"/snap/x"}
        ]
    }"#;

    #[test]
    fn test_partitions_always_have_a_parent_disk() {
        let devices = parse_lsblk(TWO_DISKS).unwrap();
        for dev in &devices {
            match dev.class {
                DeviceClass::Partition => {
                    let parent = dev.parent.as_ref().expect("partition without parent");
                    assert!(
                        devices
                            .iter()
                            .any(|d| d.class == DeviceClass::WholeDisk && &d.path == parent),
                        "parent {} not in listing",
                        parent
                    );
                }
                DeviceClass::WholeDisk => assert!(dev.parent.is_none()),
            }
        }
    }

    #[test]
    fn test_mounted_child_flags_parent_hazardous() {
        let devices = parse_lsblk(TWO_DISKS).unwrap();
        let nvme = devices.iter().find(|d| d.path == "/dev/nvme0n1").unwrap();
        assert!(nvme.has_mounted_partitions);
        assert!(nvme.is_system_disk);
        assert!(nvme.is_hazardous());

        let usb = devices.iter().find(|d| d.path == "/dev/sdb").unwrap();
        assert!(!usb.has_mounted_partitions);
        assert!(!usb.is_system_disk);
        assert!(!usb.is_hazardous());
    }

    #[test]
    fn test_usb_disks_sort_first() {
        let devices = parse_lsblk(TWO_DISKS).unwrap();
        assert_eq!(devices[0].path, "/dev/sdb");
        assert_eq!(devices[0].transport, Transport::Usb);
    }

    #[test]
    fn test_loop_devices_filtered_out() {
        let devices = parse_lsblk(TWO_DISKS).unwrap();
        assert!(devices.iter().all(|d| !d.path.contains("loop")));
    }

    #[test]
    fn test_missing_tran_and_model_are_unknown_not_errors() {
        let json = r#"{"blockdevices": [
            {"name":"sdc", "size":"7.5G", "type":"disk", "mountpoint":null}
        ]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].transport, Transport::Unknown);
        assert!(devices[0].model.is_none());
    }

    #[test]
    fn test_malformed_json_is_an_enumeration_error() {
        match parse_lsblk("this is not json") {
            Err(EnumerationError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_partition_mountpoint_is_hazard() {
        let devices = parse_lsblk(TWO_DISKS).unwrap();
        let efi = devices.iter().find(|d| d.path == "/dev/nvme0n1p1").unwrap();
        assert_eq!(efi.class, DeviceClass::Partition);
        assert!(efi.is_hazardous());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1_048_576), "1.0 MB");
        assert_eq!(format_size(9_000_000), "8.6 MB");
        assert_eq!(format_size(1_073_741_824), "1.0 GB");
    }
}
