// ============================================
// bootsmith - writer.rs
// ============================================
// Writes an ISO image byte-for-byte onto a whole disk. This is the
// one destructive operation in the program, so the order of work is
// strict:
//
// 1. Preflight - re-enumerate devices and validate the target.
//    Nothing destructive happens unless every check passes.
// 2. Best-effort unmount of the target's mounted partitions.
//    An unmount failure is logged, not fatal - the raw write will
//    fail loudly on a busy device instead of corrupting it quietly.
// 3. Raw copy via dd with a 4M block size, stderr captured.
// 4. While dd runs we only have a heuristic progress estimate.
//    The job finishes when dd's real exit status says so - the
//    estimate is never treated as completion.
//
// A failed write leaves the device in an unknown, possibly
// unbootable state. WriteError::device_state_unknown() lets callers
// surface that distinctly from ordinary failures.
// ============================================

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::devices::{self, BlockDevice, DeviceClass, EnumerationError};
use crate::progress::{HeuristicProgress, Progress};

/// Block size handed to dd. 4M balances throughput against how often
/// the kernel lets us observe the copy.
const DD_BLOCK_SIZE: &str = "4M";

/// How often the dd child is polled for exit while ticking the
/// progress estimate.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================
// ERRORS
// ============================================

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("device {0} not found - replug it and re-list devices")]
    DeviceNotFound(String),

    #[error("{0} is a partition, not a whole disk - pass the parent device")]
    NotWholeDisk(String),

    #[error("{0} has mounted partitions or holds the running system; pass --force to override")]
    HazardousTarget(String),

    #[error("image file {0} does not exist")]
    ImageMissing(String),

    #[error("image file {0} is empty")]
    ImageEmpty(String),

    #[error("device listing failed: {0}")]
    Enumeration(#[from] EnumerationError),

    #[error("could not start dd: {0}")]
    Spawn(std::io::Error),

    #[error("raw write to {path} failed ({status}): {diagnostic}")]
    DeviceFailed {
        path: String,
        status: String,
        diagnostic: String,
    },
}

impl WriteError {
    /// True when the destructive write already started before the
    /// failure - the target device is now in an unknown, possibly
    /// unusable state and the user must be told exactly that.
    pub fn device_state_unknown(&self) -> bool {
        matches!(self, WriteError::DeviceFailed { .. })
    }
}

// ============================================
// PREFLIGHT
// ============================================

/// Validate a write target against a device listing.
///
/// Pure check - attempts zero destructive operations. Rejects:
/// - paths that are not in the listing
/// - partitions (only whole disks are written)
/// - hazardous disks (mounted children / system disk) unless
///   `allow_hazardous` was explicitly set by the caller
/// - missing or empty image files
pub fn preflight_against(
    image: &Path,
    device_path: &str,
    listing: &[BlockDevice],
    allow_hazardous: bool,
) -> Result<BlockDevice, WriteError> {
    let meta = fs::metadata(image)
        .map_err(|_| WriteError::ImageMissing(image.display().to_string()))?;
    if meta.len() == 0 {
        return Err(WriteError::ImageEmpty(image.display().to_string()));
    }

    let device = listing
        .iter()
        .find(|d| d.path == device_path)
        .ok_or_else(|| WriteError::DeviceNotFound(device_path.to_string()))?;

    if device.class != DeviceClass::WholeDisk {
        return Err(WriteError::NotWholeDisk(device_path.to_string()));
    }

    if device.is_hazardous() && !allow_hazardous {
        return Err(WriteError::HazardousTarget(device_path.to_string()));
    }

    Ok(device.clone())
}

/// Preflight against a fresh enumeration. Called immediately before
/// the destructive phase because device topology can change between
/// the user picking a target and confirming the write.
pub fn preflight(
    image: &Path,
    device_path: &str,
    allow_hazardous: bool,
) -> Result<BlockDevice, WriteError> {
    let listing = devices::list_devices()?;
    preflight_against(image, device_path, &listing, allow_hazardous)
}

// ============================================
// UNMOUNT
// ============================================

/// Unmount every mounted partition of the target disk. Best effort:
/// failures are logged and the write proceeds - dd will fail loudly
/// on a genuinely busy device.
fn unmount_children(target: &BlockDevice) {
    let listing = match devices::list_devices() {
        Ok(l) => l,
        Err(e) => {
            log::warn!("could not re-list devices before unmount: {}", e);
            return;
        }
    };

    for dev in listing {
        let is_child = dev.parent.as_deref() == Some(target.path.as_str());
        if is_child && dev.mountpoint.is_some() {
            log::info!("unmounting {}", dev.path);
            match Command::new("umount").arg(&dev.path).output() {
                Ok(out) if out.status.success() => {}
                Ok(out) => log::warn!(
                    "umount {} failed: {}",
                    dev.path,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => log::warn!("could not run umount for {}: {}", dev.path, e),
            }
        }
    }
}

// ============================================
// RAW WRITE
// ============================================

/// Write `image` onto `device_path`, emitting heuristic progress
/// while dd runs.
///
/// The estimate climbs toward (and stops at) its cap; completion is
/// decided only by dd's exit status. On success the final
/// `Progress::Percent(100)` is emitted after dd has exited cleanly.
pub fn write_image(
    image: &Path,
    device_path: &str,
    allow_hazardous: bool,
    mut on_progress: impl FnMut(Progress),
) -> Result<(), WriteError> {
    let device = preflight(image, device_path, allow_hazardous)?;

    log::info!(
        "writing {} -> {} ({})",
        image.display(),
        device.path,
        device.size
    );

    unmount_children(&device);

    let mut child = Command::new("dd")
        .arg(format!("if={}", image.display()))
        .arg(format!("of={}", device.path))
        .arg(format!("bs={}", DD_BLOCK_SIZE))
        .arg("conv=fsync")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(WriteError::Spawn)?;

    // From here the device contents are undefined until dd succeeds.
    let mut estimate = HeuristicProgress::new(0);
    on_progress(Progress::Percent(0));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                on_progress(Progress::Percent(estimate.tick()));
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                // Can't observe the child anymore; fall back to a
                // blocking wait so the exit status stays authoritative.
                log::warn!("try_wait failed ({}), blocking on dd", e);
                break child.wait().map_err(WriteError::Spawn)?;
            }
        }
    };

    // dd prints its copy summary (or the error) on stderr
    let diagnostic = child
        .stderr
        .take()
        .and_then(|mut err| {
            use std::io::Read;
            let mut buf = String::new();
            err.read_to_string(&mut buf).ok().map(|_| buf)
        })
        .unwrap_or_default()
        .trim()
        .to_string();

    if !status.success() {
        log::error!("dd failed on {}: {}", device.path, diagnostic);
        return Err(WriteError::DeviceFailed {
            path: device.path,
            status: status.to_string(),
            diagnostic,
        });
    }

    log::info!("dd finished: {}", diagnostic.replace('\n', " | "));
    on_progress(Progress::Percent(100));
    Ok(())
}

// ============================================
// BOOT TEST
// ============================================

/// Boot the freshly written device in QEMU so the user can check the
/// media actually boots before walking off with it.
pub fn boot_test(device_path: &str, memory_mb: u32) -> Result<()> {
    log::info!("boot-testing {} in QEMU", device_path);
    Command::new("qemu-system-x86_64")
        .arg("-m")
        .arg(memory_mb.to_string())
        .args(["-boot", "order=d"])
        .arg("-drive")
        .arg(format!("file={},format=raw,if=ide", device_path))
        .arg("-enable-kvm")
        .spawn()
        .with_context(|| format!("failed to launch QEMU for {}", device_path))?;
    Ok(())
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Transport;
    use std::io::Write as _;

    fn disk(path: &str, hazardous: bool) -> BlockDevice {
        BlockDevice {
            path: path.to_string(),
            size: "14.9G".to_string(),
            class: DeviceClass::WholeDisk,
            mountpoint: None,
            transport: Transport::Usb,
            model: Some("Test Stick".to_string()),
            parent: None,
            has_mounted_partitions: hazardous,
            is_system_disk: false,
        }
    }

    fn partition(path: &str, parent: &str) -> BlockDevice {
        BlockDevice {
            path: path.to_string(),
            size: "512M".to_string(),
            class: DeviceClass::Partition,
            mountpoint: None,
            transport: Transport::Usb,
            model: None,
            parent: Some(parent.to_string()),
            has_mounted_partitions: false,
            is_system_disk: false,
        }
    }

    fn temp_image(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_preflight_rejects_partition() {
        // A partition target must be rejected before anything runs.
        let img = temp_image(1024);
        let listing = vec![disk("/dev/sdb", false), partition("/dev/sdb1", "/dev/sdb")];
        match preflight_against(img.path(), "/dev/sdb1", &listing, false) {
            Err(WriteError::NotWholeDisk(p)) => assert_eq!(p, "/dev/sdb1"),
            other => panic!("expected NotWholeDisk, got {:?}", other.map(|d| d.path)),
        }
    }

    #[test]
    fn test_preflight_rejects_hazardous_disk_without_force() {
        let img = temp_image(1024);
        let listing = vec![disk("/dev/sda", true)];
        assert!(matches!(
            preflight_against(img.path(), "/dev/sda", &listing, false),
            Err(WriteError::HazardousTarget(_))
        ));
        // Explicit override lets it through
        assert!(preflight_against(img.path(), "/dev/sda", &listing, true).is_ok());
    }

    #[test]
    fn test_preflight_rejects_missing_and_empty_images() {
        let listing = vec![disk("/dev/sdb", false)];
        assert!(matches!(
            preflight_against(Path::new("/no/such/file.iso"), "/dev/sdb", &listing, false),
            Err(WriteError::ImageMissing(_))
        ));

        let empty = temp_image(0);
        assert!(matches!(
            preflight_against(empty.path(), "/dev/sdb", &listing, false),
            Err(WriteError::ImageEmpty(_))
        ));
    }

    #[test]
    fn test_preflight_rejects_unknown_device() {
        let img = temp_image(1024);
        let listing = vec![disk("/dev/sdb", false)];
        assert!(matches!(
            preflight_against(img.path(), "/dev/sdz", &listing, false),
            Err(WriteError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_preflight_accepts_clean_whole_disk() {
        let img = temp_image(4096);
        let listing = vec![disk("/dev/sdb", false)];
        let dev = preflight_against(img.path(), "/dev/sdb", &listing, false).unwrap();
        assert_eq!(dev.path, "/dev/sdb");
    }

    #[test]
    fn test_only_device_failed_marks_state_unknown() {
        // Preflight failures happen before any write - the device is
        // untouched and must not be reported as possibly corrupted.
        assert!(!WriteError::NotWholeDisk("/dev/sdb1".into()).device_state_unknown());
        assert!(!WriteError::ImageMissing("x.iso".into()).device_state_unknown());
        assert!(!WriteError::HazardousTarget("/dev/sda".into()).device_state_unknown());
        assert!(WriteError::DeviceFailed {
            path: "/dev/sdb".into(),
            status: "exit status: 1".into(),
            diagnostic: "dd: error writing '/dev/sdb': No space left on device".into(),
        }
        .device_state_unknown());
    }
}
