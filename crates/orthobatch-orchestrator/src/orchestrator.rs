//! Batch driver: jobs are processed one after another, chunk groups one after
//! another inside a job.
//!
//! Failure containment follows three levels:
//! - pre-run errors (configuration, discovery, device setup) abort the batch
//! - job errors (work area, session open, relocation, rename) leave that job
//!   unprocessed and the batch moves on
//! - stage and checkpoint errors stop one chunk group only

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use orthobatch_config::{ChannelMode, ChannelRuleConfig, Config, default_channel_rules};
use orthobatch_engine_api::{Engine, ProjectSession};
use orthobatch_lock::{WorkAreaLock, work_area_lock_path};
use orthobatch_receipt::{ChunkOutcome, ChunkReceipt, ReceiptManager, RunMode};
use orthobatch_utils::error::{DiscoveryError, OrthoError, RelocationError, StageError};
use orthobatch_utils::logging::{chunk_span, format_elapsed, job_span};
use tracing::{error, info, warn};

use crate::channel::ChannelRules;
use crate::checkpoint::CheckpointManager;
use crate::fs::FileSystemGateway;
use crate::pipeline::{ChunkPipeline, PipelineFailure, PipelineRun, PipelineSettings, PipelineStage};
use crate::resources::ResourceConfigurator;
use crate::types::{ChunkGroup, Job, JobState, PROJECT_DATA_DIR, PROJECT_FILE, WorkArea};

/// Label of the chunk produced by merge mode
pub const MERGED_CHUNK_LABEL: &str = "merged";

/// Everything the orchestrator needs besides the engine and devices
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Root under which work areas are staged
    pub tmp_folder: PathBuf,
    /// Run log copied into every finished job
    pub log_file: Option<PathBuf>,
    pub channel_mode: ChannelMode,
    pub channels: Vec<ChannelRuleConfig>,
    /// Delay between a save and the second lock removal
    pub settle: Duration,
    /// Override work-area locks held by live processes
    pub force: bool,
    pub pipeline: PipelineSettings,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn new(tmp_folder: PathBuf) -> Self {
        Self {
            tmp_folder,
            log_file: None,
            channel_mode: ChannelMode::default(),
            channels: default_channel_rules(),
            settle: Duration::from_secs(orthobatch_config::DEFAULT_SETTLE_SECS),
            force: false,
            pipeline: PipelineSettings::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, log_file: Option<PathBuf>) -> Self {
        Self {
            tmp_folder: config.tmp_folder.clone(),
            log_file,
            channel_mode: config.channel_mode,
            channels: config.channels.clone(),
            settle: Duration::from_secs(config.settle_secs),
            force: false,
            pipeline: PipelineSettings::default(),
        }
    }
}

/// A discovered job and the chunk groups it would produce
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub job: Job,
    pub subfolders: Vec<String>,
    pub groups: Vec<ChunkGroup>,
    /// Why the job's photos could not be listed. Such a job still runs and
    /// fails on its own.
    pub error: Option<String>,
}

/// Jobs under `root` with their photo subfolders and chunk groups.
///
/// Only an unreadable `root` is an error; a job whose photos cannot be
/// listed is planned with its error.
pub fn plan_jobs(gateway: &FileSystemGateway, root: &Path) -> Result<Vec<PlannedJob>, DiscoveryError> {
    Ok(gateway
        .discover_jobs(root)?
        .into_iter()
        .map(|job| plan_job(gateway, job))
        .collect())
}

fn plan_job(gateway: &FileSystemGateway, job: Job) -> PlannedJob {
    let listed = gateway
        .photo_subfolders(&job)
        .and_then(|subfolders| Ok((subfolders, gateway.discover_chunk_groups(&job)?)));
    match listed {
        Ok((subfolders, groups)) => PlannedJob {
            job,
            subfolders,
            groups,
            error: None,
        },
        Err(e) => {
            warn!(job = %job.name, error = %e, "Cannot list photos");
            PlannedJob {
                job,
                subfolders: Vec::new(),
                groups: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Result of one job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Final state; `path` is the renamed folder for processed jobs
    pub job: Job,
    pub chunks: Vec<ChunkReceipt>,
    /// Job-fatal error, if any
    pub error: Option<String>,
}

impl JobOutcome {
    #[must_use]
    pub fn count(&self, outcome: ChunkOutcome) -> usize {
        self.chunks.iter().filter(|c| c.outcome == outcome).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub jobs: Vec<JobOutcome>,
}

impl BatchSummary {
    #[must_use]
    pub fn processed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.job.state == JobState::Processed)
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.jobs.len() - self.processed()
    }

    /// True when every job was processed. Chunk failures do not count.
    #[must_use]
    pub fn all_processed(&self) -> bool {
        self.failed() == 0
    }
}

/// Drives discovery, staging, per-chunk pipelines, relocation and renaming
pub struct JobOrchestrator<E: Engine> {
    engine: E,
    resources: ResourceConfigurator,
    gateway: FileSystemGateway,
    checkpoints: CheckpointManager,
    settings: OrchestratorSettings,
}

impl<E: Engine> JobOrchestrator<E> {
    /// Fails with a configuration error before touching any job when the
    /// device option is invalid
    pub fn new(engine: E, config: &Config, log_file: Option<PathBuf>) -> Result<Self, OrthoError> {
        let resources = ResourceConfigurator::configure(&config.gpu_option, config.cpu_enabled)?;
        Ok(Self::with_settings(
            engine,
            resources,
            OrchestratorSettings::from_config(config, log_file),
        ))
    }

    #[must_use]
    pub fn with_settings(
        engine: E,
        resources: ResourceConfigurator,
        settings: OrchestratorSettings,
    ) -> Self {
        let gateway = FileSystemGateway::new(
            ChannelRules::from_config(&settings.channels),
            settings.channel_mode,
        );
        Self {
            engine,
            resources,
            gateway,
            checkpoints: CheckpointManager::new(settings.settle),
            settings,
        }
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.settings.force = force;
        self
    }

    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Copy of the run log placed into every finished job
    #[must_use]
    pub fn with_log_file(mut self, log_file: PathBuf) -> Self {
        self.settings.log_file = Some(log_file);
        self
    }

    /// Jobs under `root` with their chunk groups, without touching anything
    pub fn plan(&self, root: &Path) -> Result<Vec<PlannedJob>, DiscoveryError> {
        plan_jobs(&self.gateway, root)
    }

    /// Process every unprocessed job under `root`.
    ///
    /// Only discovery and device setup errors are returned; everything else
    /// is reported per job in the summary.
    pub fn run(&mut self, root: &Path) -> Result<BatchSummary, OrthoError> {
        let batch_started = Instant::now();
        let jobs = self.gateway.discover_jobs(root)?;
        info!(root = %root.display(), jobs = jobs.len(), "Discovered jobs");
        if jobs.is_empty() {
            return Ok(BatchSummary::default());
        }

        self.resources.apply(&mut self.engine)?;

        let mut summary = BatchSummary::default();
        for job in jobs {
            summary.jobs.push(self.process_job(job));
        }

        info!(
            processed = summary.processed(),
            failed = summary.failed(),
            elapsed = %format_elapsed(batch_started.elapsed()),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Merge every chunk of the project stored in `job_dir` into one and
    /// rebuild its products. The folder is not renamed.
    pub fn merge_project(&mut self, job_dir: &Path) -> Result<JobOutcome, OrthoError> {
        self.resources.apply(&mut self.engine)?;

        let mut job = Job::new(job_dir.to_path_buf());
        let span = job_span(&job.name);
        let _guard = span.enter();
        let started = Instant::now();
        let started_at = Utc::now();
        job.state = JobState::InProgress;
        info!(path = %job.path.display(), "Merging project chunks");

        let lock = match self.acquire_lock(&job) {
            Ok(lock) => lock,
            Err(e) => return Ok(Self::job_failed(job, &e, Vec::new(), started)),
        };
        let work_area = match self.stage_existing_project(&job) {
            Ok(area) => area,
            Err(e) => return Ok(Self::job_failed(job, &e, Vec::new(), started)),
        };

        let mut session = match self.open_session(&work_area) {
            Ok(session) => session,
            Err(e) => {
                // The project files are in the work area; bring them home
                match move_project(work_area.path(), &job.path) {
                    Ok(()) => FileSystemGateway::discard_work_area(&work_area),
                    Err(relocation) => warn!(error = %relocation, "Project left in work area"),
                }
                return Ok(Self::job_failed(job, &e, Vec::new(), started));
            }
        };

        let chunk_started = Instant::now();
        let receipt = {
            let span = chunk_span(&job.name, MERGED_CHUNK_LABEL);
            let _chunk_guard = span.enter();
            match session.merge_chunks(MERGED_CHUNK_LABEL) {
                Ok(chunk) => {
                    info!(images = chunk.image_count, "Merged chunks");
                    let mut pipeline = ChunkPipeline::new(
                        &self.checkpoints,
                        &self.settings.pipeline,
                        &work_area.export_dir(),
                    );
                    let result = pipeline.run_aligned(&mut session, chunk);
                    pipeline_receipt(result, chunk_started)
                }
                Err(source) => setup_receipt(
                    MERGED_CHUNK_LABEL,
                    0,
                    &StageError::Setup {
                        chunk: MERGED_CHUNK_LABEL.to_string(),
                        source,
                    },
                    chunk_started,
                ),
            }
        };
        log_chunk_summary(&receipt);

        Self::close_session(&mut session);
        let outcome = self.finish_job(
            job,
            &work_area,
            RunMode::Merge,
            started_at,
            vec![receipt],
            started,
        );
        release_lock(lock);
        Ok(outcome)
    }

    /// Run one job to completion. Never fails; the outcome carries the error.
    fn process_job(&mut self, mut job: Job) -> JobOutcome {
        let span = job_span(&job.name);
        let _guard = span.enter();
        let started = Instant::now();
        let started_at = Utc::now();
        job.state = JobState::InProgress;
        info!(path = %job.path.display(), "Processing job");

        let lock = match self.acquire_lock(&job) {
            Ok(lock) => lock,
            Err(e) => return Self::job_failed(job, &e, Vec::new(), started),
        };
        let work_area =
            match FileSystemGateway::stage_work_area(&self.settings.tmp_folder, &job.name) {
                Ok(area) => area,
                Err(e) => return Self::job_failed(job, &e.into(), Vec::new(), started),
            };

        let mut session = match self.open_session(&work_area) {
            Ok(session) => session,
            Err(e) => {
                FileSystemGateway::discard_work_area(&work_area);
                return Self::job_failed(job, &e, Vec::new(), started);
            }
        };

        let groups = match self.gateway.discover_chunk_groups(&job) {
            Ok(groups) => groups,
            Err(e) => {
                Self::close_session(&mut session);
                FileSystemGateway::discard_work_area(&work_area);
                return Self::job_failed(job, &e.into(), Vec::new(), started);
            }
        };
        if groups.is_empty() {
            warn!("No chunk groups with qualifying images");
        }

        let export_dir = work_area.export_dir();
        let mut receipts = Vec::with_capacity(groups.len());
        for group in &groups {
            let receipt = self.process_group(&mut session, &job, group, &export_dir);
            log_chunk_summary(&receipt);
            receipts.push(receipt);
        }

        Self::close_session(&mut session);
        let outcome = self.finish_job(
            job,
            &work_area,
            RunMode::Batch,
            started_at,
            receipts,
            started,
        );
        release_lock(lock);
        outcome
    }

    fn process_group(
        &self,
        session: &mut E::Session,
        job: &Job,
        group: &ChunkGroup,
        export_dir: &Path,
    ) -> ChunkReceipt {
        let span = chunk_span(&job.name, &group.label);
        let _guard = span.enter();
        let started = Instant::now();

        let chunk = match session.add_chunk(&group.label, &group.images) {
            Ok(chunk) => chunk,
            Err(source) => {
                let error = StageError::Setup {
                    chunk: group.label.clone(),
                    source,
                };
                error!(error = %error, "Chunk group not created");
                return setup_receipt(&group.label, group.images.len(), &error, started);
            }
        };
        info!(
            channel = %group.channel,
            images = chunk.image_count,
            "Loaded images"
        );

        let mut pipeline = ChunkPipeline::new(&self.checkpoints, &self.settings.pipeline, export_dir);
        pipeline_receipt(pipeline.run(session, chunk), started)
    }

    fn acquire_lock(&self, job: &Job) -> Result<WorkAreaLock, OrthoError> {
        let lock_path = work_area_lock_path(&self.settings.tmp_folder, &job.name);
        Ok(WorkAreaLock::acquire(
            &lock_path,
            &job.name,
            self.settings.force,
            None,
        )?)
    }

    /// Open the project and checkpoint it once so the file exists on disk
    fn open_session(&mut self, work_area: &WorkArea) -> Result<E::Session, OrthoError> {
        let mut session = self.engine.open(&work_area.project_path())?;
        if let Err(e) = self.checkpoints.checkpoint(&mut session) {
            Self::close_session(&mut session);
            return Err(e.into());
        }
        Ok(session)
    }

    fn close_session(session: &mut E::Session) {
        if let Err(e) = session.close() {
            warn!(error = %e, "Closing project failed");
        }
    }

    /// Move an existing project out of the job folder into a fresh work area
    fn stage_existing_project(&self, job: &Job) -> Result<WorkArea, OrthoError> {
        let project = job.path.join(PROJECT_FILE);
        if !project.is_file() {
            return Err(RelocationError::MissingSource { path: project }.into());
        }
        let work_area = FileSystemGateway::stage_work_area(&self.settings.tmp_folder, &job.name)?;
        if let Err(e) = move_project(&job.path, work_area.path()) {
            // Whatever already moved goes back so the job keeps its project
            match move_project(work_area.path(), &job.path) {
                Ok(()) => FileSystemGateway::discard_work_area(&work_area),
                Err(restore) => error!(
                    error = %restore,
                    work_area = %work_area.path().display(),
                    "Project left in work area"
                ),
            }
            return Err(e.into());
        }
        Ok(work_area)
    }

    /// Receipt, relocation, log copy and, for batch jobs, the completion
    /// rename. Any relocation or rename failure leaves the job unprocessed.
    fn finish_job(
        &self,
        mut job: Job,
        work_area: &WorkArea,
        mode: RunMode,
        started_at: DateTime<Utc>,
        chunks: Vec<ChunkReceipt>,
        started: Instant,
    ) -> JobOutcome {
        let warnings: Vec<String> = chunks
            .iter()
            .filter(|c| c.outcome == ChunkOutcome::Completed && !c.transform_solved)
            .map(|c| format!("{}: no geo-transform solved, orthomosaic not built", c.label))
            .collect();
        let receipts = ReceiptManager::new(&work_area.export_dir());
        let mut receipt = receipts.create_receipt(
            &job.name,
            mode,
            started_at,
            Some(&self.resources.devices()),
            chunks.clone(),
            warnings,
        );
        if let Err(e) = receipts.write_receipt(&mut receipt) {
            warn!(error = %e, "Could not write job receipt");
        }

        if let Err(e) = self.relocate(work_area, &job.path) {
            return Self::job_failed(job, &e.into(), chunks, started);
        }
        FileSystemGateway::discard_work_area(work_area);

        if mode == RunMode::Batch {
            match FileSystemGateway::mark_complete(&job) {
                Ok(renamed) => job = renamed,
                Err(e) => return Self::job_failed(job, &e.into(), chunks, started),
            }
        } else {
            job.state = JobState::Processed;
        }

        let outcome = JobOutcome {
            job,
            chunks,
            error: None,
        };
        info!(
            state = %outcome.job.state,
            completed = outcome.count(ChunkOutcome::Completed),
            failed = outcome.count(ChunkOutcome::Failed),
            skipped = outcome.count(ChunkOutcome::Skipped),
            elapsed = %format_elapsed(started.elapsed()),
            "Job finished"
        );
        outcome
    }

    fn relocate(&self, work_area: &WorkArea, home: &Path) -> Result<(), RelocationError> {
        let moved = FileSystemGateway::move_tree(work_area.path(), home)?;
        info!(files = moved, to = %home.display(), "Relocated work area");
        if let Some(log_file) = &self.settings.log_file
            && let Some(name) = log_file.file_name()
        {
            FileSystemGateway::copy_file(log_file, &home.join(name))?;
        }
        Ok(())
    }

    fn job_failed(
        mut job: Job,
        error: &OrthoError,
        chunks: Vec<ChunkReceipt>,
        started: Instant,
    ) -> JobOutcome {
        job.state = JobState::Failed;
        error!(
            error = %error,
            elapsed = %format_elapsed(started.elapsed()),
            "Job failed; folder left unprocessed"
        );
        JobOutcome {
            job,
            chunks,
            error: Some(error.to_string()),
        }
    }
}

/// Move `project.psx` and the contents of `project.files/` from one folder
/// to another. Missing pieces are skipped.
fn move_project(from: &Path, to: &Path) -> Result<(), RelocationError> {
    let project = from.join(PROJECT_FILE);
    if project.is_file() {
        FileSystemGateway::move_file(&project, &to.join(PROJECT_FILE))?;
    }
    let data_dir = from.join(PROJECT_DATA_DIR);
    if data_dir.is_dir() {
        FileSystemGateway::move_tree(&data_dir, &to.join(PROJECT_DATA_DIR))?;
        std::fs::remove_dir(&data_dir).map_err(|e| RelocationError::from_io(&data_dir, e))?;
    }
    Ok(())
}

fn release_lock(lock: WorkAreaLock) {
    if let Err(e) = lock.release() {
        warn!(error = %e, "Could not release work-area lock");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn last_stage(run: &PipelineRun) -> Option<String> {
    (run.stage > PipelineStage::Created).then(|| run.stage.as_str().to_string())
}

fn run_receipt(run: &PipelineRun, outcome: ChunkOutcome, error: Option<String>, started: Instant) -> ChunkReceipt {
    let export = run.export.unwrap_or_default();
    ChunkReceipt {
        label: run.label().to_string(),
        image_count: run.chunk.image_count,
        outcome,
        last_stage: last_stage(run),
        error,
        transform_solved: run.has_geo_transform(),
        raster_written: export.raster_written,
        report_written: export.report_written,
        duration_ms: elapsed_ms(started),
    }
}

fn pipeline_receipt(result: Result<PipelineRun, PipelineFailure>, started: Instant) -> ChunkReceipt {
    match result {
        Ok(run) => run_receipt(&run, ChunkOutcome::Completed, None, started),
        Err(failure) => run_receipt(
            &failure.run,
            ChunkOutcome::Failed,
            Some(failure.error.to_string()),
            started,
        ),
    }
}

fn setup_receipt(label: &str, image_count: usize, error: &StageError, started: Instant) -> ChunkReceipt {
    ChunkReceipt {
        label: label.to_string(),
        image_count,
        outcome: ChunkOutcome::Skipped,
        last_stage: None,
        error: Some(error.to_string()),
        transform_solved: false,
        raster_written: false,
        report_written: false,
        duration_ms: elapsed_ms(started),
    }
}

fn log_chunk_summary(receipt: &ChunkReceipt) {
    let last_stage = receipt.last_stage.as_deref().unwrap_or("none");
    match receipt.outcome {
        ChunkOutcome::Completed => info!(
            chunk = %receipt.label,
            transform = receipt.transform_solved,
            raster = receipt.raster_written,
            duration_ms = receipt.duration_ms,
            "Chunk group completed"
        ),
        ChunkOutcome::Failed | ChunkOutcome::Skipped => error!(
            chunk = %receipt.label,
            outcome = ?receipt.outcome,
            last_stage,
            error = receipt.error.as_deref().unwrap_or_default(),
            duration_ms = receipt.duration_ms,
            "Chunk group did not complete"
        ),
    }
}
