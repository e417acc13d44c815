// ============================================
// bootsmith - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. main() starts, logging is wired up
// 2. The command line is parsed into a subcommand
// 3. Commands that touch disks verify we run as root - refusing at
//    startup beats failing halfway through a destructive operation
// 4. The subcommand drives the core modules; install/write jobs run
//    on a worker thread and stream progress events back here
// ============================================

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

// Our modules
mod builder; // external repo-to-ISO builds
mod catalog; // the OS catalog (configuration)
mod controller; // the one-job-at-a-time state machine
mod devices; // block device enumeration
mod fetch; // ISO downloads
mod matcher; // natural-language catalog search
mod progress; // progress reporting types
mod tuning; // rescue-USB sysctl/service tuning
mod writer; // raw image writing

use catalog::{Catalog, SourceLocator};
use controller::{InstallationController, JobEvent, JobOutcome, JobPhase, JobSource, JobSpec};
use progress::Progress;

// ============================================
// COMMAND LINE
// ============================================

#[derive(Parser)]
#[command(
    name = "bootsmith",
    version,
    about = "Natural-language OS search, ISO download, and bootable USB creation"
)]
struct Cli {
    /// Use an alternate catalog TOML instead of the built-in one
    #[arg(long, global = true, value_name = "FILE")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the catalog with a natural-language query
    Search {
        /// e.g. "kali for pentesting" or "windows for gaming"
        query: Vec<String>,
    },

    /// List block devices (USB-attached disks first)
    Devices,

    /// List every catalog entry with its versions
    Catalog,

    /// Search, download (or build), and write to a device
    Install {
        /// Natural-language query; the best match is installed
        query: Vec<String>,

        /// Target device, e.g. /dev/sdb
        #[arg(long, value_name = "DEV")]
        device: String,

        /// Version label (defaults to the entry's first version)
        #[arg(long)]
        version: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Write even to a device with mounted partitions (dangerous)
        #[arg(long)]
        force: bool,
    },

    /// Write a local image file to a device
    Write {
        /// Path to the ISO/raw image
        #[arg(long, value_name = "FILE")]
        image: PathBuf,

        /// Target device, e.g. /dev/sdb
        #[arg(long, value_name = "DEV")]
        device: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Write even to a device with mounted partitions (dangerous)
        #[arg(long)]
        force: bool,
    },

    /// Clone/update a buildable entry's repository and build its ISO
    Build {
        /// Catalog entry id (e.g. "ai-powerhouse")
        entry: String,
    },

    /// Boot a written device in QEMU to check the media works
    BootTest {
        /// Device to boot, e.g. /dev/sdb
        #[arg(long, value_name = "DEV")]
        device: String,

        /// Guest memory in MB
        #[arg(long, default_value_t = 2048)]
        memory: u32,
    },

    /// Apply rescue-USB sysctl/service tuning to this system
    Tune {
        /// Show what would change without changing anything
        #[arg(long)]
        dry_run: bool,
    },
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    println!("bootsmith v{}", env!("CARGO_PKG_VERSION"));

    // Disk enumeration with mount state, raw writes, builds, and
    // sysctl tuning all need root. Check once, up front.
    if command_needs_root(&cli.command) && !nix::unistd::Uid::effective().is_root() {
        bail!("this command needs root privileges - run with sudo");
    }

    let catalog = load_catalog(cli.catalog.as_deref())?;

    match cli.command {
        Commands::Search { query } => cmd_search(&catalog, &query.join(" ")),
        Commands::Devices => cmd_devices(),
        Commands::Catalog => cmd_catalog(&catalog),
        Commands::Install {
            query,
            device,
            version,
            yes,
            force,
        } => cmd_install(&catalog, &query.join(" "), &device, version.as_deref(), yes, force),
        Commands::Write {
            image,
            device,
            yes,
            force,
        } => cmd_write(&image, &device, yes, force),
        Commands::Build { entry } => cmd_build(&catalog, &entry),
        Commands::BootTest { device, memory } => writer::boot_test(&device, memory),
        Commands::Tune { dry_run } => cmd_tune(dry_run),
    }
}

fn command_needs_root(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Devices
            | Commands::Install { .. }
            | Commands::Write { .. }
            | Commands::Build { .. }
            | Commands::BootTest { .. }
            | Commands::Tune { .. }
    )
}

fn load_catalog(path: Option<&std::path::Path>) -> Result<Catalog> {
    match path {
        Some(p) => Catalog::from_file(p).with_context(|| format!("loading {}", p.display())),
        None => Catalog::embedded().context("loading built-in catalog"),
    }
}

// ============================================
// SEARCH & LISTING COMMANDS
// ============================================

fn cmd_search(catalog: &Catalog, query: &str) -> Result<()> {
    let results = matcher::search(catalog, query);
    if results.is_empty() {
        println!("No matches. Try different keywords, e.g. 'ubuntu for beginners'.");
        return Ok(());
    }

    println!("Found {} match(es):", results.len());
    for result in &results {
        let versions: Vec<&str> = result
            .entry
            .versions
            .iter()
            .map(|v| v.label.as_str())
            .collect();
        println!(
            "  {:<22} score {:<4} versions: {}",
            result.entry.name,
            result.score,
            versions.join(", ")
        );
    }
    Ok(())
}

fn cmd_devices() -> Result<()> {
    // A broken lsblk means "no devices to offer", not a crash.
    let listing = match devices::list_devices() {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Device listing unavailable: {}", e);
            println!("No devices available.");
            return Ok(());
        }
    };

    if listing.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Block devices (write targets must be whole disks):");
    for dev in &listing {
        match dev.class {
            devices::DeviceClass::WholeDisk => println!("  {}", dev.display_string()),
            devices::DeviceClass::Partition => {
                let mount = dev.mountpoint.as_deref().unwrap_or("-");
                println!("      {}  {}  mounted: {}", dev.path, dev.size, mount);
            }
        }
    }
    Ok(())
}

fn cmd_catalog(catalog: &Catalog) -> Result<()> {
    println!("Known operating systems:");
    for entry in &catalog.entries {
        let versions: Vec<&str> = entry.versions.iter().map(|v| v.label.as_str()).collect();
        println!("  {:<16} {:<22} {}", entry.id, entry.name, versions.join(", "));
    }
    Ok(())
}

// ============================================
// INSTALL / WRITE COMMANDS
// ============================================

fn cmd_install(
    catalog: &Catalog,
    query: &str,
    device: &str,
    version: Option<&str>,
    yes: bool,
    force: bool,
) -> Result<()> {
    let results = matcher::search(catalog, query);
    let best = match results.first() {
        Some(r) => r,
        None => bail!("no catalog entry matches '{}'", query),
    };
    println!("Best match: {} (score {})", best.entry.name, best.score);

    let version = match version {
        Some(label) => best
            .entry
            .version(label)
            .with_context(|| format!("{} has no version '{}'", best.entry.name, label))?,
        None => best
            .entry
            .default_version()
            .with_context(|| format!("{} has no versions", best.entry.name))?,
    };
    println!("Version: {}", version.label);

    let source = match &version.source {
        SourceLocator::Url { url } => JobSource::RemoteIso {
            url: url.clone(),
            dest: fetch::download_dir().join(fetch::iso_filename(&best.entry.name, &version.label)),
        },
        SourceLocator::Repo { repo } => JobSource::BuildRepo {
            repo_url: repo.clone(),
        },
    };

    confirm_target(device, force, yes)?;
    run_job(source, device, force)
}

fn cmd_write(image: &std::path::Path, device: &str, yes: bool, force: bool) -> Result<()> {
    confirm_target(device, force, yes)?;
    run_job(
        JobSource::LocalImage {
            path: image.to_path_buf(),
        },
        device,
        force,
    )
}

/// Show the target device and make the user type out their consent.
/// Hazardous targets are refused here unless --force was given; the
/// writer re-checks all of this right before the raw write anyway.
fn confirm_target(device_path: &str, force: bool, yes: bool) -> Result<()> {
    let device = devices::find_device(device_path)
        .context("device listing failed")?
        .with_context(|| format!("{} not found - check `bootsmith devices`", device_path))?;

    println!("Target: {}", device.display_string());

    if device.is_hazardous() && !force {
        bail!(
            "{} has mounted partitions or holds the running system; \
             unmount it or pass --force if you are certain",
            device_path
        );
    }

    if yes {
        return Ok(());
    }

    print!(
        "This will ERASE all data on {}. Type 'yes' to continue: ",
        device_path
    );
    std::io::stdout().flush().ok();

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("could not read confirmation")?;
    if answer.trim() != "yes" {
        bail!("aborted - nothing was written");
    }
    Ok(())
}

/// Start the job and render its event stream until it finishes.
fn run_job(source: JobSource, device: &str, force: bool) -> Result<()> {
    let mut controller = InstallationController::new();
    let handle = controller.start(JobSpec {
        source,
        device_path: device.to_string(),
        allow_hazardous: force,
    })?;

    let outcome = handle.wait(render_event);
    println!();

    match outcome {
        JobOutcome::Succeeded => {
            println!("Done. Bootable media created on {}.", device);
            println!(
                "Tip: `bootsmith boot-test --device {}` boots it in QEMU.",
                device
            );
            Ok(())
        }
        JobOutcome::Cancelled => {
            println!("Cancelled. The device was not modified.");
            Ok(())
        }
        JobOutcome::Failed {
            error,
            device_state_unknown,
        } => {
            if device_state_unknown {
                eprintln!(
                    "WARNING: the write to {} failed partway through. The device \
                     is in an unknown state and may be unusable until rewritten.",
                    device
                );
            }
            bail!("job failed: {}", error)
        }
    }
}

/// One-line progress rendering for the terminal.
fn render_event(event: &JobEvent) {
    match event {
        JobEvent::Phase(phase) => {
            println!();
            match phase {
                JobPhase::Fetching => println!("Downloading image..."),
                JobPhase::Building => println!("Building image (external build)..."),
                JobPhase::Writing => println!("Writing image to device..."),
                _ => {}
            }
        }
        JobEvent::Progress(Progress::Percent(pct)) => {
            print!("\r  {:>3}%", pct);
            std::io::stdout().flush().ok();
        }
        JobEvent::Progress(Progress::Indeterminate) => {
            print!("\r  ...");
            std::io::stdout().flush().ok();
        }
        JobEvent::Finished(_) => {}
    }
}

// ============================================
// OTHER COMMANDS
// ============================================

fn cmd_build(catalog: &Catalog, entry_id: &str) -> Result<()> {
    let entry = catalog
        .entry(entry_id)
        .with_context(|| format!("no catalog entry '{}'", entry_id))?;

    let repo = entry
        .versions
        .iter()
        .find_map(|v| match &v.source {
            SourceLocator::Repo { repo } => Some(repo.clone()),
            SourceLocator::Url { .. } => None,
        })
        .with_context(|| format!("{} is not built from a repository", entry.name))?;

    println!("Building {} from {}...", entry.name, repo);
    let adapter = builder::BuildAdapter::new(&repo);
    let image = adapter.build(|p| render_event(&JobEvent::Progress(p)))?;
    println!();
    println!("Image ready: {}", image.display());
    Ok(())
}

fn cmd_tune(dry_run: bool) -> Result<()> {
    if dry_run {
        println!("Tuning (dry run - nothing will change):");
    } else {
        println!("Applying rescue-USB tuning...");
    }

    let report = tuning::apply(dry_run);

    println!("  sysctl applied: {}", report.sysctl_applied.len());
    if !report.sysctl_failed.is_empty() {
        println!("  sysctl failed:  {}", report.sysctl_failed.len());
        for failed in &report.sysctl_failed {
            println!("    {}", failed);
        }
    }
    println!("  services delayed: {}", report.services_delayed.len());
    for service in &report.services_delayed {
        println!("    {}", service);
    }

    if report.all_applied() {
        println!("Tuning complete.");
    } else {
        println!("Tuning finished with some failures (see log).");
    }
    Ok(())
}
