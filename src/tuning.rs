// ============================================
// bootsmith - tuning.rs
// ============================================
// Rescue-USB tuning: sysctl and service adjustments that make a
// system running from USB storage responsive enough to rescue with.
//
// Everything here is a stateless shell-out, fully independent of the
// install pipeline:
//   - a fixed table of vm/kernel sysctl values applied via `sysctl -w`
//   - systemd drop-in overrides that delay and deprioritize services
//     a rescue session does not need (bluetooth, printing, ...)
//   - a JSON report of what was applied
//
// Individual failures are logged and counted, never fatal - a rescue
// environment with half the tuning applied still beats no tuning.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

/// Sysctl values for running a desktop from slow removable storage:
/// keep pages in RAM, flush dirty pages early and often, favor
/// interactive scheduling.
const SYSCTL_TUNING: &[(&str, &str)] = &[
    // Memory
    ("vm.swappiness", "1"),
    ("vm.dirty_ratio", "3"),
    ("vm.dirty_background_ratio", "1"),
    ("vm.vfs_cache_pressure", "200"),
    // I/O
    ("vm.dirty_expire_centisecs", "500"),
    ("vm.dirty_writeback_centisecs", "100"),
    // Desktop responsiveness
    ("kernel.sched_autogroup_enabled", "1"),
    ("kernel.sched_cfs_bandwidth_slice_us", "3000"),
];

/// Services a rescue session can start late and at low priority.
const DELAYABLE_SERVICES: &[&str] = &[
    "bluetooth.service",
    "cups.service",
    "avahi-daemon.service",
    "ModemManager.service",
];

/// Drop-in body written for each delayed service.
const DELAY_OVERRIDE: &str = "[Unit]\n\
    After=graphical-session.target\n\
    \n\
    [Service]\n\
    Nice=10\n\
    IOSchedulingClass=3\n";

/// Where service drop-ins live.
const SYSTEMD_OVERRIDE_ROOT: &str = "/etc/systemd/system";

/// Where the tuning report is written.
const REPORT_PATH: &str = "/var/log/bootsmith-tuning.json";

// ============================================
// REPORT
// ============================================

/// Summary of one tuning run, also serialized to REPORT_PATH.
#[derive(Debug, Default, Serialize)]
pub struct TuningReport {
    pub sysctl_applied: Vec<String>,
    pub sysctl_failed: Vec<String>,
    pub services_delayed: Vec<String>,
    pub services_skipped: Vec<String>,
}

impl TuningReport {
    pub fn all_applied(&self) -> bool {
        self.sysctl_failed.is_empty()
    }
}

// ============================================
// TUNING
// ============================================

/// Apply the full rescue-USB tuning profile.
///
/// With `dry_run` set, every step is logged and reported but nothing
/// is changed on the system.
pub fn apply(dry_run: bool) -> TuningReport {
    let mut report = TuningReport::default();

    apply_sysctls(&mut report, dry_run);
    delay_services(&mut report, Path::new(SYSTEMD_OVERRIDE_ROOT), dry_run);

    if !dry_run {
        write_report(&report, Path::new(REPORT_PATH));
    }

    log::info!(
        "tuning done: {} sysctls applied, {} failed, {} services delayed",
        report.sysctl_applied.len(),
        report.sysctl_failed.len(),
        report.services_delayed.len()
    );
    report
}

fn apply_sysctls(report: &mut TuningReport, dry_run: bool) {
    for (param, value) in SYSCTL_TUNING {
        let setting = format!("{}={}", param, value);
        if dry_run {
            log::info!("would apply: sysctl -w {}", setting);
            report.sysctl_applied.push(setting);
            continue;
        }

        match Command::new("sysctl").arg("-w").arg(&setting).output() {
            Ok(out) if out.status.success() => {
                log::info!("applied {}", setting);
                report.sysctl_applied.push(setting);
            }
            Ok(out) => {
                log::warn!(
                    "sysctl {} failed: {}",
                    setting,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                report.sysctl_failed.push(setting);
            }
            Err(e) => {
                log::warn!("could not run sysctl: {}", e);
                report.sysctl_failed.push(setting);
            }
        }
    }
}

/// Create a delay/deprioritize drop-in for each enabled delayable
/// service. Disabled or absent services are skipped, not failed.
fn delay_services(report: &mut TuningReport, override_root: &Path, dry_run: bool) {
    for service in DELAYABLE_SERVICES {
        if !service_is_enabled(service) {
            log::debug!("{} not enabled, skipping", service);
            report.services_skipped.push(service.to_string());
            continue;
        }

        if dry_run {
            log::info!("would delay {}", service);
            report.services_delayed.push(service.to_string());
            continue;
        }

        match write_delay_override(override_root, service) {
            Ok(()) => {
                log::info!("created delay override for {}", service);
                report.services_delayed.push(service.to_string());
            }
            Err(e) => {
                log::warn!("could not write override for {}: {}", service, e);
                report.services_skipped.push(service.to_string());
            }
        }
    }
}

fn service_is_enabled(service: &str) -> bool {
    Command::new("systemctl")
        .args(["is-enabled", service])
        .output()
        .map(|out| {
            out.status.success()
                && String::from_utf8_lossy(&out.stdout).trim().contains("enabled")
        })
        .unwrap_or(false)
}

/// Write `<root>/<service>.d/rescue-delay.conf`.
fn write_delay_override(override_root: &Path, service: &str) -> std::io::Result<()> {
    let dir = override_dir(override_root, service);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("rescue-delay.conf"), DELAY_OVERRIDE)
}

fn override_dir(override_root: &Path, service: &str) -> PathBuf {
    override_root.join(format!("{}.d", service))
}

fn write_report(report: &TuningReport, path: &Path) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                log::warn!("could not write tuning report {}: {}", path.display(), e);
            }
        }
        Err(e) => log::warn!("could not serialize tuning report: {}", e),
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuning_tables_are_sane() {
        // Every sysctl key has a namespace and a non-empty value
        for (param, value) in SYSCTL_TUNING {
            assert!(param.contains('.'), "bare sysctl key: {}", param);
            assert!(!value.is_empty());
        }
        assert!(!DELAYABLE_SERVICES.is_empty());
        for service in DELAYABLE_SERVICES {
            assert!(service.ends_with(".service"));
        }
    }

    #[test]
    fn test_override_dir_layout() {
        let dir = override_dir(Path::new("/etc/systemd/system"), "cups.service");
        assert_eq!(dir, PathBuf::from("/etc/systemd/system/cups.service.d"));
    }

    #[test]
    fn test_delay_override_is_valid_unit_snippet() {
        assert!(DELAY_OVERRIDE.starts_with("[Unit]"));
        assert!(DELAY_OVERRIDE.contains("[Service]"));
        assert!(DELAY_OVERRIDE.contains("Nice=10"));
    }

    #[test]
    fn test_write_delay_override_creates_dropin() {
        let root = tempfile::tempdir().unwrap();
        write_delay_override(root.path(), "bluetooth.service").unwrap();
        let conf = root
            .path()
            .join("bluetooth.service.d")
            .join("rescue-delay.conf");
        assert!(conf.exists());
        assert_eq!(fs::read_to_string(conf).unwrap(), DELAY_OVERRIDE);
    }

    #[test]
    fn test_report_serializes() {
        let mut report = TuningReport::default();
        report.sysctl_applied.push("vm.swappiness=1".to_string());
        report.services_delayed.push("cups.service".to_string());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("vm.swappiness=1"));
        assert!(report.all_applied());

        report.sysctl_failed.push("vm.bogus=1".to_string());
        assert!(!report.all_applied());
    }
}
