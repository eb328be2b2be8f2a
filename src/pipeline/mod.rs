//! Bulk orchestration: walks a source set, bounds concurrency, drives one
//! chunk pipeline per file and tallies skipped/transferred/aborted counts.
//! Jobs start in enumeration order; completion order is not guaranteed.
//! Five failures in a row with no successful completion in between cancel
//! the run and surface the last failure as the run result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_channel::{Receiver, Sender};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::pipeline::comparer::{CompareOutcome, DiffKind, ObjectComparer};
use crate::pipeline::downloader::{DownloadSink, ObjectDownloader};
use crate::pipeline::filter::PathFilter;
use crate::pipeline::skip::SkipOracle;
use crate::pipeline::uploader::ObjectUploader;
use crate::pipeline::walker::walk_local_tree;
use crate::storage::layout::{KeyLayout, normalize_path};
use crate::storage::ObjectStore;
use crate::types::error::is_cancelled_error;
use crate::types::token::TransferCancellationToken;
use crate::types::{ProgressHandle, TransferStatistics};

pub mod comparer;
pub mod downloader;
pub mod filter;
pub mod skip;
pub mod uploader;
pub mod walker;

const RECENT_ABORTS_LIMIT: u32 = 5;
const JOB_CHANNEL_CAPACITY: usize = 20000;

#[derive(Debug, Clone)]
enum BulkJob {
    Upload {
        local_path: PathBuf,
        logical_path: String,
        relative_path: String,
        size: u64,
    },
    Download {
        logical_path: String,
        local_path: PathBuf,
        relative_path: String,
        size: u64,
    },
}

impl BulkJob {
    fn relative_path(&self) -> &str {
        match self {
            BulkJob::Upload { relative_path, .. } => relative_path,
            BulkJob::Download { relative_path, .. } => relative_path,
        }
    }

    fn size(&self) -> u64 {
        match self {
            BulkJob::Upload { size, .. } => *size,
            BulkJob::Download { size, .. } => *size,
        }
    }
}

#[derive(Debug, Default)]
struct BulkCounters {
    completed_files: AtomicU64,
    completed_bytes: AtomicU64,
    skipped_files: AtomicU64,
    skipped_bytes: AtomicU64,
    aborted_files: AtomicU64,
    aborted_bytes: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    /// Includes skipped files: untouched-but-up-to-date counts as done.
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub skipped_files: u64,
    pub skipped_bytes: u64,
    pub aborted_files: u64,
    pub aborted_bytes: u64,
}

impl BulkSummary {
    pub fn is_success(&self) -> bool {
        self.aborted_files == 0
    }

    fn from_counters(counters: &BulkCounters) -> Self {
        Self {
            completed_files: counters.completed_files.load(Ordering::SeqCst),
            completed_bytes: counters.completed_bytes.load(Ordering::SeqCst),
            skipped_files: counters.skipped_files.load(Ordering::SeqCst),
            skipped_bytes: counters.skipped_bytes.load(Ordering::SeqCst),
            aborted_files: counters.aborted_files.load(Ordering::SeqCst),
            aborted_bytes: counters.aborted_bytes.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompareSummary {
    pub identical_files: u64,
    pub differing: Vec<(String, DiffKind)>,
    pub local_only: Vec<String>,
    pub remote_only: Vec<String>,
}

impl CompareSummary {
    /// Tree-membership differences outrank content differences.
    pub fn exit_code(&self) -> i32 {
        if !self.local_only.is_empty() || !self.remote_only.is_empty() {
            2
        } else if !self.differing.is_empty() {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Md5CheckSummary {
    pub verified_files: u64,
    pub failed: Vec<String>,
}

impl Md5CheckSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() { 0 } else { 1 }
    }
}

pub struct BulkOrchestrator {
    config: Config,
    store: ObjectStore,
    layout: KeyLayout,
    cancellation_token: TransferCancellationToken,
    stats_sender: Sender<TransferStatistics>,
    agent_info: Option<String>,
    next_transfer_id: Arc<AtomicU64>,
}

impl BulkOrchestrator {
    pub fn new(
        config: Config,
        store: ObjectStore,
        cancellation_token: TransferCancellationToken,
        stats_sender: Sender<TransferStatistics>,
    ) -> Self {
        let layout = KeyLayout::new(&config.prefix);
        Self {
            config,
            store,
            layout,
            cancellation_token,
            stats_sender,
            agent_info: None,
            next_transfer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_agent_info(mut self, agent_info: Option<String>) -> Self {
        self.agent_info = agent_info;
        self
    }

    pub async fn push(&self, local_root: &Path, s3_root: &str) -> Result<BulkSummary> {
        let filter = PathFilter::new(
            &self.config.filter_config.only,
            &self.config.filter_config.exclude,
        )?;

        let mut jobs = Vec::new();
        for file in walk_local_tree(local_root)? {
            if !filter.matches(&file.relpath) {
                trace!(path = file.relpath, "filtered out.");
                continue;
            }
            jobs.push(BulkJob::Upload {
                local_path: file.path,
                logical_path: join_logical(s3_root, &file.relpath),
                relative_path: file.relpath,
                size: file.size,
            });
        }

        info!(files = jobs.len(), root = %local_root.display(), "push enumeration completed.");
        self.run_jobs(jobs).await
    }

    pub async fn pull(&self, s3_root: &str, local_root: &Path) -> Result<BulkSummary> {
        let filter = PathFilter::new(
            &self.config.filter_config.only,
            &self.config.filter_config.exclude,
        )?;

        let mut jobs = Vec::new();
        for (logical_path, relative_path, size) in self.remote_files(s3_root).await? {
            if !filter.matches(&relative_path) {
                trace!(path = relative_path, "filtered out.");
                continue;
            }
            let local_path = local_root.join(relative_path.replace('/', std::path::MAIN_SEPARATOR_STR));
            jobs.push(BulkJob::Download {
                logical_path,
                local_path,
                relative_path,
                size,
            });
        }

        info!(files = jobs.len(), root = s3_root, "pull enumeration completed.");
        self.run_jobs(jobs).await
    }

    /// Flat listing of `(logical path, path relative to s3_root, size)` under
    /// the data namespace.
    async fn remote_files(&self, s3_root: &str) -> Result<Vec<(String, String, u64)>> {
        let root = normalize_path(s3_root);
        let prefix = self.layout.data_prefix(&root);
        let listing = self.store.list(&prefix, None).await?;

        let mut files = Vec::new();
        for object in listing.objects {
            let Some(logical_path) = self.layout.logical_path_from_data_key(&object.key) else {
                continue;
            };
            let relative_path = if root.is_empty() {
                logical_path.clone()
            } else {
                match logical_path.strip_prefix(&format!("{root}/")) {
                    Some(relative_path) => relative_path.to_string(),
                    None => continue,
                }
            };
            files.push((logical_path, relative_path, object.size));
        }

        Ok(files)
    }

    async fn run_jobs(&self, jobs: Vec<BulkJob>) -> Result<BulkSummary> {
        let total_files = jobs.len() as u64;
        let total_bytes: u64 = jobs.iter().map(|job| job.size()).sum();
        let _ = self
            .stats_sender
            .send(TransferStatistics::TotalDiscovered {
                files: total_files,
                bytes: total_bytes,
            })
            .await;

        let counters = Arc::new(BulkCounters::default());
        let recent_aborts = Arc::new(AtomicU32::new(0));
        let last_error = Arc::new(Mutex::new(None::<anyhow::Error>));

        let (job_sender, job_receiver) = async_channel::bounded(JOB_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for job in jobs {
                if job_sender.send(job).await.is_err() {
                    break;
                }
            }
        });

        let mut worker_handles = Vec::new();
        for worker_index in 0..self.config.worker_size {
            let worker = BulkWorker {
                worker_index,
                config: self.config.clone(),
                store: self.store.clone(),
                layout: self.layout.clone(),
                cancellation_token: self.cancellation_token.clone(),
                stats_sender: self.stats_sender.clone(),
                agent_info: self.agent_info.clone(),
                next_transfer_id: self.next_transfer_id.clone(),
            };
            let job_receiver = job_receiver.clone();
            let counters = counters.clone();
            let recent_aborts = recent_aborts.clone();
            let last_error = last_error.clone();

            worker_handles.push(tokio::spawn(async move {
                worker
                    .run(job_receiver, counters, recent_aborts, last_error)
                    .await;
            }));
        }

        for worker_handle in worker_handles {
            worker_handle.await.context("bulk worker panicked.")?;
        }

        let summary = BulkSummary::from_counters(&counters);
        if recent_aborts.load(Ordering::SeqCst) >= RECENT_ABORTS_LIMIT {
            let e = last_error.lock().unwrap().take();
            return Err(e
                .unwrap_or_else(|| anyhow!("bulk run cancelled after repeated failures"))
                .context(format!(
                    "{RECENT_ABORTS_LIMIT} transfers failed in a row, run aborted."
                )));
        }

        Ok(summary)
    }

    /// Compares a remote tree against a local tree. Tree membership is
    /// decided from the enumerations; common paths are byte-compared with
    /// bounded concurrency.
    pub async fn compare(&self, s3_root: &str, local_root: &Path) -> Result<CompareSummary> {
        let filter = PathFilter::new(
            &self.config.filter_config.only,
            &self.config.filter_config.exclude,
        )?;

        let mut local_files = BTreeMap::new();
        for file in walk_local_tree(local_root)? {
            if filter.matches(&file.relpath) {
                local_files.insert(file.relpath.clone(), file);
            }
        }

        let mut remote_files = BTreeMap::new();
        for (logical_path, relative_path, _) in self.remote_files(s3_root).await? {
            if filter.matches(&relative_path) {
                remote_files.insert(relative_path, logical_path);
            }
        }

        let mut summary = CompareSummary::default();
        for relative_path in local_files.keys() {
            if !remote_files.contains_key(relative_path) {
                summary.local_only.push(relative_path.clone());
            }
        }
        for relative_path in remote_files.keys() {
            if !local_files.contains_key(relative_path) {
                summary.remote_only.push(relative_path.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.worker_size as usize));
        let mut compare_handles = FuturesUnordered::new();

        for (relative_path, logical_path) in &remote_files {
            let Some(local_file) = local_files.get(relative_path) else {
                continue;
            };

            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(crate::types::error::TransferError::Cancelled));
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("tokio::sync::Semaphore::acquire_owned() failed.")?;
            let comparer = ObjectComparer::new(
                self.store.clone(),
                self.layout.clone(),
                self.config.clone(),
                self.cancellation_token.clone(),
            );
            let logical_path = logical_path.clone();
            let relative_path = relative_path.clone();
            let local_path = local_file.path.clone();

            compare_handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = comparer.compare(&logical_path, &local_path).await?;
                Ok::<(String, CompareOutcome), anyhow::Error>((relative_path, outcome))
            }));
        }

        while let Some(join_result) = compare_handles.next().await {
            let (relative_path, outcome) = join_result.context("compare task panicked.")??;
            match outcome {
                CompareOutcome::Identical => summary.identical_files += 1,
                CompareOutcome::Different(DiffKind::MissingRemote) => {
                    summary.remote_only.retain(|p| p != &relative_path);
                    summary.local_only.push(relative_path);
                }
                CompareOutcome::Different(kind) => summary.differing.push((relative_path, kind)),
            }
        }

        Ok(summary)
    }

    /// Verifies every md5sum sidecar under `s3_root` against the stored
    /// content, without writing anything locally.
    pub async fn md5check(&self, s3_root: &str) -> Result<Md5CheckSummary> {
        let filter = PathFilter::new(
            &self.config.filter_config.only,
            &self.config.filter_config.exclude,
        )?;

        let semaphore = Arc::new(Semaphore::new(self.config.worker_size as usize));
        let mut check_handles = FuturesUnordered::new();

        for (logical_path, relative_path, _) in self.remote_files(s3_root).await? {
            if !filter.matches(&relative_path) {
                continue;
            }

            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(crate::types::error::TransferError::Cancelled));
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("tokio::sync::Semaphore::acquire_owned() failed.")?;
            let downloader = ObjectDownloader::new(
                self.store.clone(),
                self.layout.clone(),
                self.config.clone(),
                self.cancellation_token.clone(),
            )
            .with_agent_info(self.agent_info.clone());

            check_handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = downloader
                    .download(&logical_path, &DownloadSink::Discard, None)
                    .await;
                (relative_path, result)
            }));
        }

        let mut summary = Md5CheckSummary::default();
        while let Some(join_result) = check_handles.next().await {
            let (relative_path, result) = join_result.context("md5check task panicked.")?;
            match result {
                Ok(_) => summary.verified_files += 1,
                Err(e) => {
                    warn!(
                        path = relative_path,
                        error = e.to_string(),
                        "md5check failed."
                    );
                    summary.failed.push(relative_path);
                }
            }
        }

        Ok(summary)
    }
}

struct BulkWorker {
    worker_index: u16,
    config: Config,
    store: ObjectStore,
    layout: KeyLayout,
    cancellation_token: TransferCancellationToken,
    stats_sender: Sender<TransferStatistics>,
    agent_info: Option<String>,
    next_transfer_id: Arc<AtomicU64>,
}

impl BulkWorker {
    async fn run(
        &self,
        job_receiver: Receiver<BulkJob>,
        counters: Arc<BulkCounters>,
        recent_aborts: Arc<AtomicU32>,
        last_error: Arc<Mutex<Option<anyhow::Error>>>,
    ) {
        trace!(worker_index = self.worker_index, "bulk worker started.");

        let uploader = ObjectUploader::new(
            self.store.clone(),
            self.layout.clone(),
            self.config.clone(),
            self.cancellation_token.clone(),
        );
        let downloader = ObjectDownloader::new(
            self.store.clone(),
            self.layout.clone(),
            self.config.clone(),
            self.cancellation_token.clone(),
        )
        .with_agent_info(self.agent_info.clone());
        let skip_oracle = SkipOracle::new(self.store.clone(), self.layout.clone());

        loop {
            tokio::select! {
                recv_result = job_receiver.recv() => {
                    match recv_result {
                        Ok(job) => {
                            self.process(job, &uploader, &downloader, &skip_oracle,
                                &counters, &recent_aborts, &last_error).await;
                        }
                        Err(_) => {
                            // normal shutdown
                            trace!(worker_index = self.worker_index, "bulk worker completed.");
                            break;
                        }
                    }
                },
                _ = self.cancellation_token.cancelled() => {
                    info!(worker_index = self.worker_index, "bulk worker cancelled.");
                    break;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        job: BulkJob,
        uploader: &ObjectUploader,
        downloader: &ObjectDownloader,
        skip_oracle: &SkipOracle,
        counters: &BulkCounters,
        recent_aborts: &AtomicU32,
        last_error: &Mutex<Option<anyhow::Error>>,
    ) {
        let id = self.next_transfer_id.fetch_add(1, Ordering::SeqCst);
        let relative_path = job.relative_path().to_string();
        let size = job.size();

        let _ = self
            .stats_sender
            .send(TransferStatistics::TransferStart {
                id,
                key: relative_path.clone(),
                total_bytes: size,
            })
            .await;

        let (local_path, logical_path) = match &job {
            BulkJob::Upload {
                local_path,
                logical_path,
                ..
            } => (local_path.clone(), logical_path.clone()),
            BulkJob::Download {
                logical_path,
                local_path,
                ..
            } => (local_path.clone(), logical_path.clone()),
        };

        let decision = match skip_oracle
            .should_skip(&local_path, &logical_path, self.config.skip_logic)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                self.record_abort(id, &relative_path, size, e, counters, recent_aborts, last_error)
                    .await;
                return;
            }
        };

        if decision.skip {
            counters.skipped_files.fetch_add(1, Ordering::SeqCst);
            counters.skipped_bytes.fetch_add(size, Ordering::SeqCst);
            // An up-to-date file counts as completed as well.
            counters.completed_files.fetch_add(1, Ordering::SeqCst);
            counters.completed_bytes.fetch_add(size, Ordering::SeqCst);
            recent_aborts.store(0, Ordering::SeqCst);

            let _ = self
                .stats_sender
                .send(TransferStatistics::TransferSkip {
                    id,
                    key: relative_path,
                    bytes: size,
                })
                .await;
            return;
        }

        let progress = ProgressHandle::new(self.stats_sender.clone(), id);
        let result = match &job {
            BulkJob::Upload { .. } => uploader
                .upload_file(&local_path, &logical_path, Some(progress))
                .await
                .map(|outcome| outcome.bytes),
            BulkJob::Download { .. } => downloader
                .download(
                    &logical_path,
                    &DownloadSink::File(local_path.clone()),
                    Some(progress),
                )
                .await
                .map(|outcome| outcome.bytes),
        };

        match result {
            Ok(bytes) => {
                counters.completed_files.fetch_add(1, Ordering::SeqCst);
                counters.completed_bytes.fetch_add(bytes, Ordering::SeqCst);
                recent_aborts.store(0, Ordering::SeqCst);

                let _ = self
                    .stats_sender
                    .send(TransferStatistics::TransferComplete {
                        id,
                        key: relative_path,
                        bytes,
                    })
                    .await;
            }
            Err(e) => {
                self.record_abort(id, &relative_path, size, e, counters, recent_aborts, last_error)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_abort(
        &self,
        id: u64,
        relative_path: &str,
        size: u64,
        e: anyhow::Error,
        counters: &BulkCounters,
        recent_aborts: &AtomicU32,
        last_error: &Mutex<Option<anyhow::Error>>,
    ) {
        counters.aborted_files.fetch_add(1, Ordering::SeqCst);
        counters.aborted_bytes.fetch_add(size, Ordering::SeqCst);

        let _ = self
            .stats_sender
            .send(TransferStatistics::TransferAbort {
                id,
                key: relative_path.to_string(),
                bytes: size,
            })
            .await;

        if is_cancelled_error(&e) {
            debug!(
                worker_index = self.worker_index,
                path = relative_path,
                "transfer cancelled."
            );
            return;
        }

        error!(
            worker_index = self.worker_index,
            path = relative_path,
            error = e.to_string(),
            "transfer aborted."
        );

        let aborts_in_a_row = recent_aborts.fetch_add(1, Ordering::SeqCst) + 1;
        *last_error.lock().unwrap() = Some(e);

        if aborts_in_a_row >= RECENT_ABORTS_LIMIT {
            error!(
                aborts_in_a_row = aborts_in_a_row,
                "too many failures in a row, cancelling the run."
            );
            self.cancellation_token.cancel();
        }
    }
}

/// Joins the bulk destination root and a relative path into a logical path.
fn join_logical(root: &str, relative_path: &str) -> String {
    let root = normalize_path(root);
    if root.is_empty() {
        normalize_path(relative_path)
    } else {
        format!("{root}/{}", normalize_path(relative_path))
    }
}
