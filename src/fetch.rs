// ============================================
// bootsmith - fetch.rs
// ============================================
// Streams a remote ISO to a local file.
//
// How it works:
// 1. GET the URL with a blocking reqwest client (redirects followed)
// 2. Read the body in 8 KB chunks into a .part temp file
// 3. Report percent progress when Content-Length is known,
//    Indeterminate when it is not - a made-up percentage helps nobody
// 4. Check the cancel flag at every chunk boundary
// 5. On completion, rename the .part file onto the final name
//
// Cancellation is not an error: the function returns
// FetchOutcome::Cancelled and leaves the partial file in place for
// the caller to clean up or resume from.
// ============================================

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::progress::{percent_of, Progress};

/// Chunk size for the download loop. 8 KB keeps memory flat no matter
/// how large the ISO is.
const CHUNK_SIZE: usize = 8192;

/// Connect timeout for the initial request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================
// ERRORS & OUTCOME
// ============================================

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to create HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("could not reach {url}: {source}")]
    Connect { url: String, source: reqwest::Error },

    #[error("server returned status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("error reading download stream: {0}")]
    Stream(std::io::Error),

    #[error("error writing {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// How a fetch ended. Cancelled is deliberately not an error - the
/// caller must be able to tell "finished" from "stopped on request"
/// without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every byte arrived and the file is in place.
    Completed,
    /// The cancel flag was raised; a partial .part file remains.
    Cancelled,
}

// ============================================
// DOWNLOAD
// ============================================

/// Stream `url` into `dest`, reporting progress after each chunk.
///
/// The cancel flag is checked once per chunk; raising it makes the
/// function stop writing and return `Ok(FetchOutcome::Cancelled)`.
/// The partial download is left at `<dest>.part-<uuid>` - callers
/// decide whether to delete it.
pub fn fetch(
    url: &str,
    dest: &Path,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(Progress),
) -> Result<FetchOutcome, FetchError> {
    log::info!("downloading {} -> {}", url, dest.display());
    on_progress(Progress::Percent(0));

    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("bootsmith/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(FetchError::Client)?;

    let response = client
        .get(url)
        .send()
        .map_err(|source| FetchError::Connect {
            url: url.to_string(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status()));
    }

    // 0 means the server did not tell us - progress goes indeterminate
    let total_size = response.content_length().unwrap_or(0);
    log::debug!("content-length: {} bytes", total_size);

    // Download into a temp name next to the destination so a crashed or
    // cancelled run never leaves a half-written file under the final name.
    let part_path = part_path_for(dest);
    let io_err = |source: std::io::Error| FetchError::Io {
        path: part_path.display().to_string(),
        source,
    };

    let mut file = File::create(&part_path).map_err(io_err)?;
    let mut reader = response;
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded: u64 = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("download cancelled after {} bytes", downloaded);
            file.flush().map_err(io_err)?;
            return Ok(FetchOutcome::Cancelled);
        }

        let bytes_read = reader.read(&mut buffer).map_err(FetchError::Stream)?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read]).map_err(io_err)?;
        downloaded += bytes_read as u64;
        on_progress(percent_of(downloaded, total_size));
    }

    file.flush().map_err(io_err)?;
    drop(file);

    fs::rename(&part_path, dest).map_err(|source| FetchError::Io {
        path: dest.display().to_string(),
        source,
    })?;

    on_progress(Progress::Percent(100));
    log::info!("download complete: {} bytes", downloaded);
    Ok(FetchOutcome::Completed)
}

/// Temp-file name used while a download is in flight.
fn part_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{}.part-{}", file_name, Uuid::new_v4()))
}

// ============================================
// DOWNLOAD LOCATIONS
// ============================================

/// Directory downloaded ISOs land in: ~/Downloads/bootsmith
/// (falls back to ./downloads when no home directory exists).
pub fn download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("downloads"))
        .join("bootsmith")
}

/// Filename for a catalog download, e.g. "Kali_Linux_2024.1.iso".
pub fn iso_filename(display_name: &str, version_label: &str) -> String {
    format!("{}_{}.iso", display_name.replace(' ', "_"), version_label)
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_filename() {
        assert_eq!(iso_filename("Kali Linux", "2024.1"), "Kali_Linux_2024.1.iso");
        assert_eq!(iso_filename("Ubuntu", "24.04"), "Ubuntu_24.04.iso");
    }

    #[test]
    fn test_part_path_is_hidden_and_unique() {
        let dest = Path::new("/tmp/Ubuntu_24.04.iso");
        let a = part_path_for(dest);
        let b = part_path_for(dest);
        assert_ne!(a, b);
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".Ubuntu_24.04.iso.part-"));
        assert_eq!(a.parent(), dest.parent());
    }

    #[test]
    fn test_download_dir_ends_with_tool_name() {
        assert!(download_dir().ends_with("bootsmith"));
    }

    /// Real network download of a small file.
    /// Run with: cargo test test_fetch_small_file -- --nocapture --ignored
    #[test]
    #[ignore] // Ignored by default - requires network
    fn test_fetch_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("robots.txt");
        let cancel = AtomicBool::new(false);

        let outcome = fetch(
            "https://www.kernel.org/robots.txt",
            &dest,
            &cancel,
            |p| println!("   progress: {:?}", p),
        )
        .expect("fetch should succeed");

        assert_eq!(outcome, FetchOutcome::Completed);
        assert!(dest.exists());
        assert!(fs::metadata(&dest).unwrap().len() > 0);
    }

    /// Cancellation before the first chunk leaves no final file.
    /// Run with: cargo test test_fetch_cancelled -- --nocapture --ignored
    #[test]
    #[ignore] // Ignored by default - requires network
    fn test_fetch_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("never.iso");
        let cancel = AtomicBool::new(true); // raised before we start

        let outcome = fetch(
            "https://www.kernel.org/robots.txt",
            &dest,
            &cancel,
            |_| {},
        )
        .expect("cancel is not an error");

        assert_eq!(outcome, FetchOutcome::Cancelled);
        assert!(!dest.exists(), "cancelled fetch must not produce the final file");
    }
}
