//! FTP deploy of the output tree, uploading only files newer than their
//! remote copies.
//!
//! Work is split into disjoint chunks, one per worker, and every worker opens
//! its own connection. A failed file is recorded and the batch continues.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};

use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::paths::{slash_path, OUTPUT_ROOT};

/// Remote directory the project root maps onto
pub const DEFAULT_REMOTE_ROOT: &str = "/public_html";

/// Concurrent connections
pub const DEFAULT_PARALLEL: usize = 10;

const DEFAULT_FTP_PORT: u16 = 21;

/// FTP login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Connection settings, read once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    /// `host:port`
    pub host: String,
    pub credentials: Credentials,
    pub remote_root: String,
    pub parallel: usize,
}

impl DeployConfig {
    /// Read `HOST`, `USER` and `USER_PASSWORD` from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BuildError::config(format!("environment variable {key} is not set")))
        };

        let host = require("HOST")?;
        let user = require("USER")?;
        let password = require("USER_PASSWORD")?;

        Ok(Self {
            host: with_default_port(host.trim()),
            credentials: Credentials { user, password },
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            parallel: DEFAULT_PARALLEL,
        })
    }
}

fn with_default_port(host: &str) -> String {
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{host}:{DEFAULT_FTP_PORT}"),
    }
}

/// A remote file store. Each worker owns its own instance.
pub trait RemoteTarget {
    /// Modification time in unix seconds, `None` if the file does not exist
    fn modified(&mut self, remote_path: &str) -> Result<Option<i64>>;

    /// Upload a local file, creating parent directories. Returns bytes sent.
    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<u64>;
}

/// Upload iff the remote copy is absent or strictly older
#[inline]
pub fn needs_upload(local: i64, remote: Option<i64>) -> bool {
    remote.map_or(true, |remote| local > remote)
}

// =============================================================================
// FTP
// =============================================================================

pub struct FtpRemote {
    stream: FtpStream,
    created: HashSet<String>,
}

impl FtpRemote {
    pub fn connect(config: &DeployConfig) -> Result<Self> {
        let fail = |e: FtpError| BuildError::Transfer {
            path: PathBuf::from(&config.host),
            message: e.to_string(),
        };

        let mut stream = FtpStream::connect(config.host.as_str()).map_err(fail)?;
        stream
            .login(
                config.credentials.user.as_str(),
                config.credentials.password.as_str(),
            )
            .map_err(fail)?;
        stream.transfer_type(FileType::Binary).map_err(fail)?;

        Ok(Self {
            stream,
            created: HashSet::new(),
        })
    }

    /// Create every missing ancestor of `remote_path`
    fn ensure_parents(&mut self, remote_path: &str) {
        let mut dir = String::new();
        let parents: Vec<&str> = remote_path.split('/').filter(|p| !p.is_empty()).collect();
        for part in parents.iter().take(parents.len().saturating_sub(1)) {
            dir.push('/');
            dir.push_str(part);
            if self.created.contains(&dir) {
                continue;
            }
            let result = self.stream.mkdir(dir.as_str());
            if directory_settled(&result) {
                self.created.insert(dir.clone());
            } else if let Err(e) = result {
                crate::debug!("deploy"; "mkdir {dir}: {e}");
            }
        }
    }
}

/// Whether a MKD result leaves the directory in place. Existing directories
/// answer 550.
fn directory_settled(result: &std::result::Result<(), FtpError>) -> bool {
    match result {
        Ok(()) => true,
        Err(FtpError::UnexpectedResponse(r)) => r.status == Status::FileUnavailable,
        Err(_) => false,
    }
}

/// Interpret an MDTM reply. Only 550 means the file is absent; any other
/// refusal is a transfer error so the file is never blindly re-uploaded.
fn remote_time(
    remote_path: &str,
    result: std::result::Result<i64, FtpError>,
) -> Result<Option<i64>> {
    match result {
        Ok(seconds) => Ok(Some(seconds)),
        Err(FtpError::UnexpectedResponse(r)) if r.status == Status::FileUnavailable => Ok(None),
        Err(e) => Err(BuildError::Transfer {
            path: PathBuf::from(remote_path),
            message: e.to_string(),
        }),
    }
}

impl RemoteTarget for FtpRemote {
    fn modified(&mut self, remote_path: &str) -> Result<Option<i64>> {
        let result = self
            .stream
            .mdtm(remote_path)
            .map(|time| time.and_utc().timestamp());
        remote_time(remote_path, result)
    }

    fn upload(&mut self, local: &Path, remote_path: &str) -> Result<u64> {
        self.ensure_parents(remote_path);
        let mut file = File::open(local).map_err(|e| BuildError::io(local, e))?;
        self.stream
            .put_file(remote_path, &mut file)
            .map_err(|e| BuildError::Transfer {
                path: local.to_path_buf(),
                message: e.to_string(),
            })
    }
}

impl Drop for FtpRemote {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}

// =============================================================================
// Planning and transfer
// =============================================================================

/// One local file and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub local: PathBuf,
    pub remote: String,
    /// Local modification time in unix seconds
    pub modified: i64,
}

/// Cache-line aligned counter, one per line to avoid false sharing
#[repr(align(64))]
pub struct CacheAlignedAtomic(pub AtomicU64);

impl CacheAlignedAtomic {
    pub const fn new(val: u64) -> Self {
        Self(AtomicU64::new(val))
    }

    #[inline]
    fn bump(&self, by: u64) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live transfer counters shared by all workers
pub struct TransferStats {
    pub uploaded: CacheAlignedAtomic,
    pub skipped: CacheAlignedAtomic,
    pub failed: CacheAlignedAtomic,
    pub bytes_sent: CacheAlignedAtomic,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            uploaded: CacheAlignedAtomic::new(0),
            skipped: CacheAlignedAtomic::new(0),
            failed: CacheAlignedAtomic::new(0),
            bytes_sent: CacheAlignedAtomic::new(0),
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-file result of a deploy
#[derive(Debug, Default)]
pub struct DeployReport {
    pub uploaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, BuildError)>,
}

impl DeployReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug)]
enum Outcome {
    Uploaded,
    Skipped,
    Failed(BuildError),
}

fn unix_seconds(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| BuildError::io(path, e))?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

/// Every output file (names with an extension) and its remote path.
///
/// Remote paths keep the output directory's own name: `dist/a.css` goes to
/// `{remote_root}/dist/a.css`.
pub fn plan(config: &Config, remote_root: &str) -> Result<Vec<UploadJob>> {
    let root = config.paths.root();
    let files = config.paths.resolve(&format!("{OUTPUT_ROOT}/**/*.*"))?;
    files
        .into_iter()
        .map(|local| {
            let relative = slash_path(local.strip_prefix(root).unwrap_or(&local));
            Ok(UploadJob {
                remote: format!("{}/{relative}", remote_root.trim_end_matches('/')),
                modified: unix_seconds(&local)?,
                local,
            })
        })
        .collect()
}

fn upload_progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} files")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

fn transfer<R: RemoteTarget>(remote: &mut R, job: &UploadJob, stats: &TransferStats) -> Outcome {
    let result = remote.modified(&job.remote).and_then(|remote_time| {
        if needs_upload(job.modified, remote_time) {
            remote.upload(&job.local, &job.remote).map(Some)
        } else {
            Ok(None)
        }
    });

    match result {
        Ok(Some(bytes)) => {
            stats.uploaded.bump(1);
            stats.bytes_sent.bump(bytes);
            crate::debug!("deploy"; "uploaded {}", job.remote);
            Outcome::Uploaded
        }
        Ok(None) => {
            stats.skipped.bump(1);
            Outcome::Skipped
        }
        Err(e) => {
            stats.failed.bump(1);
            crate::log!("failed"; "{}: {e}", job.remote);
            Outcome::Failed(e)
        }
    }
}

/// Transfer `jobs` on up to `parallel` workers, each with its own target.
///
/// Files left unprocessed after `shutdown` is set appear nowhere in the report.
/// `progress` advances once per processed file.
pub fn deploy_with<R, F>(
    jobs: &[UploadJob],
    parallel: usize,
    connect: F,
    stats: &TransferStats,
    progress: Option<&ProgressBar>,
    shutdown: &AtomicBool,
) -> Result<DeployReport>
where
    R: RemoteTarget,
    F: Fn() -> Result<R> + Sync,
{
    if jobs.is_empty() {
        return Ok(DeployReport::default());
    }

    let parallel = parallel.max(1);
    let chunk_size = jobs.len().div_ceil(parallel);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel)
        .build()
        .map_err(|e| BuildError::config(format!("failed to start deploy workers: {e}")))?;

    let outcomes: Vec<(PathBuf, Outcome)> = pool.install(|| {
        jobs.par_chunks(chunk_size)
            .flat_map_iter(|chunk| {
                let mut results = Vec::with_capacity(chunk.len());
                let mut remote = match connect() {
                    Ok(remote) => remote,
                    Err(e) => {
                        let message = e.to_string();
                        crate::log!("failed"; "connection: {message}");
                        for job in chunk {
                            stats.failed.bump(1);
                            let error = BuildError::Transfer {
                                path: job.local.clone(),
                                message: message.clone(),
                            };
                            results.push((job.local.clone(), Outcome::Failed(error)));
                        }
                        if let Some(pb) = progress {
                            pb.inc(chunk.len() as u64);
                        }
                        return results;
                    }
                };
                for job in chunk {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    results.push((job.local.clone(), transfer(&mut remote, job, stats)));
                    if let Some(pb) = progress {
                        pb.inc(1);
                    }
                }
                results
            })
            .collect()
    });

    let mut report = DeployReport::default();
    for (path, outcome) in outcomes {
        match outcome {
            Outcome::Uploaded => report.uploaded.push(path),
            Outcome::Skipped => report.skipped.push(path),
            Outcome::Failed(e) => report.failed.push((path, e)),
        }
    }
    Ok(report)
}

/// Upload every newer output file to the server named by the environment
pub fn deploy(config: &Config, shutdown: &AtomicBool) -> Result<DeployReport> {
    let remote = DeployConfig::from_env()?;
    let jobs = plan(config, &remote.remote_root)?;
    crate::log!(
        "deploy";
        "{} file(s) to {}{} over {} connection(s)",
        jobs.len(),
        remote.host,
        remote.remote_root,
        remote.parallel
    );

    let stats = TransferStats::new();
    let progress = config.verbose.then(|| upload_progress(jobs.len()));
    let report = deploy_with(
        &jobs,
        remote.parallel,
        || FtpRemote::connect(&remote),
        &stats,
        progress.as_ref(),
        shutdown,
    )?;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    crate::log!(
        "deploy";
        "{} uploaded ({} bytes), {} up to date, {} failed",
        stats.uploaded.get(),
        stats.bytes_sent.get(),
        stats.skipped.get(),
        stats.failed.get()
    );
    Ok(report)
}
