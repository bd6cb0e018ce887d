//! Resumable ROM downloader
//!
//! Data is written to `<name>.miflasher_part` and renamed into place only once
//! the transfer completes. A later run sends a `Range` request for the bytes
//! already on disk; a `206` reply is appended, a `200` reply restarts the file.
//! Connection problems are retried, HTTP error statuses are not. A shutdown
//! request between chunks leaves the partial file in place for the next run.

use crate::core::error::{FlashError, Result};
use log::{debug, info, warn};
use md5::Md5;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Read/write granularity
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Attempts per download
pub const MAX_RETRIES: u32 = 3;

/// Pause between attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Suffix of the in-progress file
pub const PART_SUFFIX: &str = ".miflasher_part";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches a remote source into a local directory.
///
/// The flash dispatcher only needs this one operation, so tests can swap in a
/// stub that never touches the network.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest_dir: &Path, checksum: Option<&Checksum>) -> Result<PathBuf>;
}

/// Digest used to verify a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgo {
    #[default]
    Sha256,
    Md5,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Sha256 => "sha256",
            ChecksumAlgo::Md5 => "md5",
        }
    }

    /// Length of the hex digest
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgo::Sha256 => 64,
            ChecksumAlgo::Md5 => 32,
        }
    }

    /// Hex digest of a file
    pub fn hash_file(&self, path: &Path) -> io::Result<String> {
        match self {
            ChecksumAlgo::Sha256 => sha256_file(path),
            ChecksumAlgo::Md5 => md5_file(path),
        }
    }
}

impl Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgo {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(ChecksumAlgo::Sha256),
            "md5" => Ok(ChecksumAlgo::Md5),
            _ => Err(FlashError::UnknownTarget {
                kind: "checksum",
                name: s.to_string(),
                expected: "sha256, md5",
            }),
        }
    }
}

/// Expected digest of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub digest: String,
}

impl Checksum {
    pub fn new(algo: ChecksumAlgo, digest: impl Into<String>) -> Self {
        Self {
            algo,
            digest: digest.into().trim().to_ascii_lowercase(),
        }
    }

    pub fn sha256(digest: impl Into<String>) -> Self {
        Self::new(ChecksumAlgo::Sha256, digest)
    }

    pub fn md5(digest: impl Into<String>) -> Self {
        Self::new(ChecksumAlgo::Md5, digest)
    }

    pub fn matches(&self, actual: &str) -> bool {
        self.digest.eq_ignore_ascii_case(actual)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.digest)
    }
}

/// Progress update information
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub file_name: String,
    /// Bytes on disk, including any resumed prefix
    pub downloaded: u64,
    /// Expected final size when the server reports one
    pub total: Option<u64>,
    pub phase: DownloadPhase,
}

/// Current phase of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Request sent; `resume_from` bytes already on disk
    Starting { attempt: u32, resume_from: u64 },
    Transferring,
    Verifying,
    Complete,
}

/// Progress callback type
pub type DownloadCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

enum AttemptError {
    /// Worth retrying
    Transient(String),
    /// Server said no; retrying will not help
    Status(StatusCode),
    /// Shutdown requested between chunks
    Paused,
}

/// HTTP downloader with resume and checksum verification
pub struct Downloader {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
    progress_callback: Option<DownloadCallback>,
    shutdown_flag: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Self::with_shutdown_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Create a downloader sharing the application's shutdown flag
    pub fn with_shutdown_flag(flag: Arc<AtomicBool>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .user_agent(concat!("miflasher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FlashError::Download(e.to_string()))?;
        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            progress_callback: None,
            shutdown_flag: flag,
        })
    }

    /// Set progress callback
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    fn report(&self, file_name: &str, downloaded: u64, total: Option<u64>, phase: DownloadPhase) {
        if let Some(ref callback) = self.progress_callback {
            callback(DownloadProgress {
                file_name: file_name.to_string(),
                downloaded,
                total,
                phase,
            });
        }
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Download `url` into `dest_dir`, named `file_name` or after the URL
    pub fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        file_name: Option<&str>,
        checksum: Option<&Checksum>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let name = file_name
            .map(str::to_string)
            .unwrap_or_else(|| file_name_from_url(url));
        let dest = dest_dir.join(&name);
        let part = dest_dir.join(format!("{}{}", name, PART_SUFFIX));

        info!("Downloading {} -> {}", url, dest.display());
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let existing = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            self.report(
                &name,
                existing,
                None,
                DownloadPhase::Starting {
                    attempt,
                    resume_from: existing,
                },
            );

            match self.attempt(url, &name, &part, existing) {
                Ok(()) => {
                    fs::rename(&part, &dest)?;
                    if let Some(expected) = checksum {
                        self.verify(&name, &dest, expected)?;
                    }
                    let size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
                    self.report(&name, size, Some(size), DownloadPhase::Complete);
                    info!("Download complete: {} ({} bytes)", dest.display(), size);
                    return Ok(dest);
                }
                Err(AttemptError::Status(status)) => {
                    return Err(FlashError::Download(format!("{}: HTTP {}", url, status)));
                }
                Err(AttemptError::Paused) => {
                    warn!("Download paused. Run again to resume.");
                    return Err(FlashError::Cancelled(format!(
                        "download of {} paused; partial data kept in {}",
                        name,
                        part.display()
                    )));
                }
                Err(AttemptError::Transient(message)) => {
                    warn!("Download attempt {} failed: {}", attempt, message);
                    last_error = message;
                }
            }

            if attempt < self.max_retries {
                debug!("Retrying in {:?}", self.retry_delay);
                thread::sleep(self.retry_delay);
            }
        }

        Err(FlashError::Download(format!(
            "{} failed after {} attempts: {}",
            url, self.max_retries, last_error
        )))
    }

    fn attempt(
        &self,
        url: &str,
        name: &str,
        part: &Path,
        existing: u64,
    ) -> std::result::Result<(), AttemptError> {
        if self.is_shutdown_requested() {
            return Err(AttemptError::Paused);
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }
        let mut response = request
            .send()
            .map_err(|e| AttemptError::Transient(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // Stale partial file larger than the resource; start over
            let _ = fs::remove_file(part);
            return Err(AttemptError::Transient("range not satisfiable".to_string()));
        }
        if !status.is_success() {
            return Err(AttemptError::Status(status));
        }

        let length = response.content_length();
        let (mut file, mut done, total) = if status == StatusCode::PARTIAL_CONTENT {
            debug!("Resuming at byte {}", existing);
            let file = OpenOptions::new()
                .append(true)
                .open(part)
                .map_err(|e| AttemptError::Transient(e.to_string()))?;
            (file, existing, length.map(|l| l + existing))
        } else {
            if existing > 0 {
                debug!("Server ignored range request; restarting");
            }
            let file = File::create(part).map_err(|e| AttemptError::Transient(e.to_string()))?;
            (file, 0, length)
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| AttemptError::Transient(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| AttemptError::Transient(e.to_string()))?;
            done += n as u64;
            self.report(name, done, total, DownloadPhase::Transferring);

            if self.is_shutdown_requested() {
                let _ = file.flush();
                return Err(AttemptError::Paused);
            }
        }
        file.flush()
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        if let Some(total) = total {
            if done < total {
                return Err(AttemptError::Transient(format!(
                    "connection closed after {} of {} bytes",
                    done, total
                )));
            }
        }
        Ok(())
    }

    fn verify(&self, name: &str, path: &Path, expected: &Checksum) -> Result<()> {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.report(name, size, Some(size), DownloadPhase::Verifying);
        if expected.digest.len() != expected.algo.hex_len() {
            warn!(
                "{} digest should be {} hex characters, got {}",
                expected.algo,
                expected.algo.hex_len(),
                expected.digest.len()
            );
        }
        let actual = expected.algo.hash_file(path)?;
        if expected.matches(&actual) {
            info!("{} OK: {}", expected.algo, &actual[..16]);
            Ok(())
        } else {
            let _ = fs::remove_file(path);
            Err(FlashError::Download(format!(
                "{} checksum mismatch for {} (expected {}, got {}); corrupt file removed",
                expected.algo, name, expected.digest, actual
            )))
        }
    }
}

impl Fetcher for Downloader {
    fn fetch(&self, url: &str, dest_dir: &Path, checksum: Option<&Checksum>) -> Result<PathBuf> {
        self.download(url, dest_dir, None, checksum)
    }
}

/// Last path segment of a URL, ignoring the query string
pub fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("rom_download")
        .to_string()
}

/// Whether a flash source names a remote resource
pub fn is_remote(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    digest_file::<Sha256>(path)
}

/// Hex MD5 of a file
pub fn md5_file(path: &Path) -> io::Result<String> {
    digest_file::<Md5>(path)
}

fn digest_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn downloader() -> Downloader {
        Downloader::new().unwrap().with_retry_delay(Duration::ZERO)
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/roms/ruby_global.tgz?sig=abc"),
            "ruby_global.tgz"
        );
        assert_eq!(file_name_from_url("https://cdn.example.com/"), "rom_download");
        assert_eq!(file_name_from_url("https://"), "rom_download");
        assert!(is_remote("HTTPS://x/y.zip"));
        assert!(!is_remote("/sdcard/rom.zip"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "hello world").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_md5_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "hello world").unwrap();
        assert_eq!(md5_file(&path).unwrap(), HELLO_MD5);
        assert_eq!(ChecksumAlgo::Md5.hash_file(&path).unwrap(), HELLO_MD5);
        assert_eq!(ChecksumAlgo::Sha256.hash_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_checksum_algo_parse() {
        assert_eq!("SHA-256".parse::<ChecksumAlgo>().unwrap(), ChecksumAlgo::Sha256);
        assert_eq!(" md5 ".parse::<ChecksumAlgo>().unwrap(), ChecksumAlgo::Md5);
        assert_eq!(ChecksumAlgo::default(), ChecksumAlgo::Sha256);
        let err = "crc32".parse::<ChecksumAlgo>().unwrap_err();
        assert!(matches!(err, FlashError::UnknownTarget { kind: "checksum", .. }));

        let checksum = Checksum::md5(" 5EB63BBBE01EEED093CB22BB8F5ACDC3 ");
        assert_eq!(checksum.digest, HELLO_MD5);
        assert_eq!(checksum.to_string(), format!("md5:{}", HELLO_MD5));
    }

    #[test]
    fn test_full_download_with_md5_checksum() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/rom.tgz")
            .with_status(200)
            .with_body("hello world")
            .create();

        let dir = TempDir::new().unwrap();
        let path = downloader()
            .download(
                &format!("{}/rom.tgz", server.url()),
                dir.path(),
                None,
                Some(&Checksum::md5(HELLO_MD5)),
            )
            .unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello world");
    }

    #[test]
    fn test_md5_mismatch_removes_file() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/rom.tgz")
            .with_status(200)
            .with_body("tampered")
            .create();

        let dir = TempDir::new().unwrap();
        let err = downloader()
            .download(
                &format!("{}/rom.tgz", server.url()),
                dir.path(),
                None,
                Some(&Checksum::md5(HELLO_MD5)),
            )
            .unwrap_err();

        assert!(matches!(err, FlashError::Download(ref m) if m.contains("md5 checksum mismatch")));
        assert!(!dir.path().join("rom.tgz").exists());
    }

    #[test]
    fn test_full_download_with_checksum() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/rom.tgz")
            .with_status(200)
            .with_body("hello world")
            .create();

        let dir = TempDir::new().unwrap();
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&phases);
        let path = downloader()
            .with_progress(move |p| seen.lock().unwrap().push(p.phase))
            .download(
                &format!("{}/rom.tgz", server.url()),
                dir.path(),
                None,
                Some(&Checksum::sha256(HELLO_SHA256.to_uppercase())),
            )
            .unwrap();

        mock.assert();
        assert_eq!(path, dir.path().join("rom.tgz"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
        assert!(!dir.path().join("rom.tgz.miflasher_part").exists());

        let phases = phases.lock().unwrap();
        assert!(matches!(phases[0], DownloadPhase::Starting { attempt: 1, resume_from: 0 }));
        assert!(phases.contains(&DownloadPhase::Verifying));
        assert_eq!(phases.last(), Some(&DownloadPhase::Complete));
    }

    #[test]
    fn test_resume_appends_partial_content() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/rom.zip")
            .match_header("range", "bytes=6-")
            .with_status(206)
            .with_body("world")
            .create();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rom.zip.miflasher_part"), "hello ").unwrap();

        let path = downloader()
            .download(
                &format!("{}/rom.zip", server.url()),
                dir.path(),
                None,
                Some(&Checksum::sha256(HELLO_SHA256)),
            )
            .unwrap();

        mock.assert();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello world");
    }

    #[test]
    fn test_ignored_range_restarts_file() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/rom.zip")
            .with_status(200)
            .with_body("hello world")
            .create();

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rom.zip.miflasher_part"), "stale bytes ").unwrap();

        let path = downloader()
            .download(&format!("{}/rom.zip", server.url()), dir.path(), None, None)
            .unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello world");
    }

    #[test]
    fn test_http_error_is_not_retried() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/missing.zip")
            .with_status(404)
            .expect(1)
            .create();

        let dir = TempDir::new().unwrap();
        let err = downloader()
            .download(&format!("{}/missing.zip", server.url()), dir.path(), None, None)
            .unwrap_err();

        mock.assert();
        assert!(matches!(err, FlashError::Download(ref m) if m.contains("404")));
    }

    #[test]
    fn test_checksum_mismatch_removes_file() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/rom.zip")
            .with_status(200)
            .with_body("tampered")
            .create();

        let dir = TempDir::new().unwrap();
        let err = downloader()
            .download(
                &format!("{}/rom.zip", server.url()),
                dir.path(),
                None,
                Some(&Checksum::sha256(HELLO_SHA256)),
            )
            .unwrap_err();

        assert!(matches!(err, FlashError::Download(ref m) if m.contains("sha256 checksum mismatch")));
        assert!(!dir.path().join("rom.zip").exists());
    }

    #[test]
    fn test_shutdown_pauses_and_keeps_partial() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rom.zip.miflasher_part"), "hello ").unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let err = Downloader::with_shutdown_flag(flag)
            .unwrap()
            .download("http://127.0.0.1:9/rom.zip", dir.path(), None, None)
            .unwrap_err();

        assert!(matches!(err, FlashError::Cancelled(_)));
        assert_eq!(
            fs::read_to_string(dir.path().join("rom.zip.miflasher_part")).unwrap(),
            "hello "
        );
    }

    #[test]
    fn test_connection_failure_exhausts_retries() {
        let dir = TempDir::new().unwrap();
        let err = downloader()
            .with_max_retries(2)
            .download("http://127.0.0.1:9/rom.zip", dir.path(), None, None)
            .unwrap_err();
        assert!(matches!(err, FlashError::Download(ref m) if m.contains("2 attempts")));
    }
}
