//! Per-chunk reconstruction state machine
//!
//! ```text
//! Created → Aligned → DepthMapped → Modeled ─┬─ transform solved ─→ PointClouded → Smoothed → Orthomosaicked ─┬→ Exported → Done
//!                                            └───────────────────── no transform ────────────────────────────┘
//! ```
//!
//! Every transition consumes a [`PipelineRun`] and returns the advanced one.
//! A transition runs one engine stage and then checkpoints the project; the
//! next transition only starts after the checkpoint succeeded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use orthobatch_engine_api::{
    AlignParams, ChunkHandle, DEFAULT_SMOOTHING_STRENGTH, DepthMapParams, EngineError,
    ExportOutcome, ExportRequest, GeoTransform, ModelSource, ProjectSession, SurfaceSource, ops,
};
use orthobatch_utils::error::StageError;
use orthobatch_utils::logging::{StageClock, log_stage_complete, log_stage_error, stage_span};
use tracing::info;

use crate::checkpoint::CheckpointManager;
use crate::types::{raster_path, report_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Created,
    Aligned,
    DepthMapped,
    Modeled,
    PointClouded,
    Smoothed,
    Orthomosaicked,
    Exported,
    Done,
}

impl PipelineStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Aligned => "aligned",
            Self::DepthMapped => "depth_mapped",
            Self::Modeled => "modeled",
            Self::PointClouded => "point_clouded",
            Self::Smoothed => "smoothed",
            Self::Orthomosaicked => "orthomosaicked",
            Self::Exported => "exported",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one chunk group
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub chunk: ChunkHandle,
    /// Last stage that completed and was checkpointed
    pub stage: PipelineStage,
    /// Transform read after modeling
    pub transform: Option<GeoTransform>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub export: Option<ExportOutcome>,
}

impl PipelineRun {
    #[must_use]
    pub fn new(chunk: ChunkHandle) -> Self {
        Self::at(chunk, PipelineStage::Created)
    }

    /// Run for a chunk that is already aligned, such as a merged chunk
    #[must_use]
    pub fn aligned(chunk: ChunkHandle) -> Self {
        Self::at(chunk, PipelineStage::Aligned)
    }

    fn at(chunk: ChunkHandle, stage: PipelineStage) -> Self {
        Self {
            chunk,
            stage,
            transform: None,
            last_checkpoint: None,
            export: None,
        }
    }

    /// Gate for the point cloud, smoothing and orthomosaic stages
    #[must_use]
    pub fn has_geo_transform(&self) -> bool {
        self.transform.as_ref().is_some_and(GeoTransform::is_complete)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.chunk.label
    }
}

/// A failed run together with how far it got
#[derive(Debug)]
pub struct PipelineFailure {
    pub run: PipelineRun,
    pub error: StageError,
}

/// Engine parameters for every stage
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub align: AlignParams,
    pub depth_maps: DepthMapParams,
    pub model_source: ModelSource,
    pub smoothing_strength: f64,
    pub surface: SurfaceSource,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            align: AlignParams::default(),
            depth_maps: DepthMapParams::default(),
            model_source: ModelSource::DepthMaps,
            smoothing_strength: DEFAULT_SMOOTHING_STRENGTH,
            surface: SurfaceSource::Model,
        }
    }
}

/// Drives one chunk through the stage sequence
pub struct ChunkPipeline<'a> {
    checkpoints: &'a CheckpointManager,
    settings: &'a PipelineSettings,
    export_dir: PathBuf,
    clock: StageClock,
}

impl<'a> ChunkPipeline<'a> {
    #[must_use]
    pub fn new(
        checkpoints: &'a CheckpointManager,
        settings: &'a PipelineSettings,
        export_dir: &Path,
    ) -> Self {
        Self {
            checkpoints,
            settings,
            export_dir: export_dir.to_path_buf(),
            clock: StageClock::new(),
        }
    }

    /// Full sequence for a freshly added chunk
    pub fn run<S: ProjectSession>(
        &mut self,
        session: &mut S,
        chunk: ChunkHandle,
    ) -> Result<PipelineRun, PipelineFailure> {
        let run = self.align(session, PipelineRun::new(chunk))?;
        self.after_alignment(session, run)
    }

    /// Sequence for a chunk whose cameras are already aligned
    pub fn run_aligned<S: ProjectSession>(
        &mut self,
        session: &mut S,
        chunk: ChunkHandle,
    ) -> Result<PipelineRun, PipelineFailure> {
        self.after_alignment(session, PipelineRun::aligned(chunk))
    }

    fn after_alignment<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let run = self.build_depth_maps(session, run)?;
        let run = self.build_model(session, run)?;
        let mut run = self.read_transform(session, run)?;
        if run.has_geo_transform() {
            run = self.build_point_cloud(session, run)?;
            run = self.smooth_model(session, run)?;
            run = self.build_orthomosaic(session, run)?;
        } else {
            info!(
                chunk = %run.label(),
                "No geo-transform solved; skipping point cloud, smoothing and orthomosaic"
            );
        }
        let run = self.export(session, run)?;
        Ok(Self::finish(run))
    }

    pub fn align<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let settings = self.settings;
        let params = &settings.align;
        self.transition(session, run, ops::ALIGN, PipelineStage::Aligned, |s, c| {
            s.align(c, params)
        })
        .map(|(run, ())| run)
    }

    pub fn build_depth_maps<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let settings = self.settings;
        let params = &settings.depth_maps;
        self.transition(
            session,
            run,
            ops::BUILD_DEPTH_MAPS,
            PipelineStage::DepthMapped,
            |s, c| s.build_depth_maps(c, params),
        )
        .map(|(run, ())| run)
    }

    pub fn build_model<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let source = self.settings.model_source;
        self.transition(session, run, ops::BUILD_MODEL, PipelineStage::Modeled, |s, c| {
            s.build_model(c, source)
        })
        .map(|(run, ())| run)
    }

    /// Read the transform that gates the geometry stages. Not checkpointed;
    /// nothing in the project changes.
    pub fn read_transform<S: ProjectSession>(
        &mut self,
        session: &mut S,
        mut run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        match session.geo_transform(&run.chunk) {
            Ok(transform) => {
                info!(
                    chunk = %run.label(),
                    complete = transform.is_complete(),
                    "Read geo-transform"
                );
                run.transform = Some(transform);
                Ok(run)
            }
            Err(source) => {
                let error = StageError::Engine {
                    chunk: run.chunk.label.clone(),
                    stage: ops::GEO_TRANSFORM.to_string(),
                    source,
                };
                log_stage_error(run.label(), ops::GEO_TRANSFORM, &error.to_string(), 0);
                Err(PipelineFailure { run, error })
            }
        }
    }

    pub fn build_point_cloud<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        self.transition(
            session,
            run,
            ops::BUILD_POINT_CLOUD,
            PipelineStage::PointClouded,
            |s, c| s.build_point_cloud(c),
        )
        .map(|(run, ())| run)
    }

    pub fn smooth_model<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let strength = self.settings.smoothing_strength;
        self.transition(
            session,
            run,
            ops::SMOOTH_MODEL,
            PipelineStage::Smoothed,
            |s, c| s.smooth_model(c, strength),
        )
        .map(|(run, ())| run)
    }

    pub fn build_orthomosaic<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let surface = self.settings.surface;
        self.transition(
            session,
            run,
            ops::BUILD_ORTHOMOSAIC,
            PipelineStage::Orthomosaicked,
            |s, c| s.build_orthomosaic(c, surface),
        )
        .map(|(run, ())| run)
    }

    /// Always attempted. The engine writes the raster only when an
    /// orthomosaic exists.
    pub fn export<S: ProjectSession>(
        &mut self,
        session: &mut S,
        run: PipelineRun,
    ) -> Result<PipelineRun, PipelineFailure> {
        let request = ExportRequest::new(
            raster_path(&self.export_dir, run.label()),
            report_path(&self.export_dir, run.label()),
        );
        let (mut run, outcome) = self.transition(
            session,
            run,
            ops::EXPORT_RASTER,
            PipelineStage::Exported,
            |s, c| s.export_raster(c, &request),
        )?;
        info!(
            chunk = %run.label(),
            raster = outcome.raster_written,
            report = outcome.report_written,
            "Exported products"
        );
        run.export = Some(outcome);
        Ok(run)
    }

    fn finish(mut run: PipelineRun) -> PipelineRun {
        run.stage = PipelineStage::Done;
        run
    }

    /// Run one stage, checkpoint, advance
    fn transition<S, T, F>(
        &mut self,
        session: &mut S,
        mut run: PipelineRun,
        operation: &str,
        next: PipelineStage,
        stage: F,
    ) -> Result<(PipelineRun, T), PipelineFailure>
    where
        S: ProjectSession,
        F: FnOnce(&mut S, &ChunkHandle) -> Result<T, EngineError>,
    {
        let span = stage_span(run.label(), operation);
        let _guard = span.enter();
        self.clock.mark(run.label(), operation);
        let started = Instant::now();

        let output = match stage(&mut *session, &run.chunk) {
            Ok(output) => output,
            Err(source) => {
                let error = StageError::Engine {
                    chunk: run.chunk.label.clone(),
                    stage: operation.to_string(),
                    source,
                };
                log_stage_error(
                    run.label(),
                    operation,
                    &error.to_string(),
                    started.elapsed().as_millis(),
                );
                return Err(PipelineFailure { run, error });
            }
        };

        if let Err(source) = self.checkpoints.checkpoint(session) {
            let error = StageError::Checkpoint {
                chunk: run.chunk.label.clone(),
                stage: operation.to_string(),
                source,
            };
            log_stage_error(
                run.label(),
                operation,
                &error.to_string(),
                started.elapsed().as_millis(),
            );
            return Err(PipelineFailure { run, error });
        }

        run.stage = next;
        run.last_checkpoint = Some(Utc::now());
        log_stage_complete(run.label(), operation, started.elapsed().as_millis());
        Ok((run, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedEngine;
    use orthobatch_engine_api::Engine;
    use std::time::Duration;
    use tempfile::TempDir;

    const GEOMETRY_STAGES: [&str; 3] = [
        ops::BUILD_POINT_CLOUD,
        ops::SMOOTH_MODEL,
        ops::BUILD_ORTHOMOSAIC,
    ];

    fn run_chunk(engine: ScriptedEngine, label: &str) -> (TempDir, Result<PipelineRun, PipelineFailure>) {
        let temp = TempDir::new().unwrap();
        let export = temp.path().join("export");
        std::fs::create_dir_all(&export).unwrap();
        let mut session = engine.clone().open(&temp.path().join("project.psx")).unwrap();
        let chunk = orthobatch_engine_api::ProjectSession::add_chunk(
            &mut session,
            label,
            &[PathBuf::from("a.jpg"), PathBuf::from("b.jpg")],
        )
        .unwrap();

        let checkpoints = CheckpointManager::new(Duration::ZERO);
        let settings = PipelineSettings::default();
        let result = ChunkPipeline::new(&checkpoints, &settings, &export).run(&mut session, chunk);
        (temp, result)
    }

    #[test]
    fn test_full_sequence_with_transform() {
        let engine = ScriptedEngine::new();
        let (temp, result) = run_chunk(engine.clone(), "flightA");
        let run = result.unwrap();

        assert_eq!(run.stage, PipelineStage::Done);
        assert!(run.has_geo_transform());
        assert!(run.last_checkpoint.is_some());
        assert_eq!(
            engine.stage_calls("flightA"),
            vec![
                ops::ALIGN,
                ops::BUILD_DEPTH_MAPS,
                ops::BUILD_MODEL,
                ops::GEO_TRANSFORM,
                ops::BUILD_POINT_CLOUD,
                ops::SMOOTH_MODEL,
                ops::BUILD_ORTHOMOSAIC,
                ops::EXPORT_RASTER,
            ]
        );
        // One save per checkpointed stage
        assert_eq!(engine.save_count(), 7);
        assert!(temp.path().join("export/flightA_orthomosaic.tif").is_file());
        assert!(temp.path().join("export/flightA_report.pdf").is_file());
    }

    #[test]
    fn test_gate_skips_geometry_without_transform() {
        let engine = ScriptedEngine::new().without_transform("flightA");
        let (temp, result) = run_chunk(engine.clone(), "flightA");
        let run = result.unwrap();

        assert_eq!(run.stage, PipelineStage::Done);
        assert!(!run.has_geo_transform());
        let calls = engine.stage_calls("flightA");
        assert!(GEOMETRY_STAGES.iter().all(|op| !calls.contains(op)));
        assert_eq!(calls.last(), Some(&ops::EXPORT_RASTER));
        assert_eq!(run.export.map(|e| e.raster_written), Some(false));
        assert!(!temp.path().join("export/flightA_orthomosaic.tif").exists());
        assert!(temp.path().join("export/flightA_report.pdf").is_file());
    }

    #[test]
    fn test_partial_transform_counts_as_missing() {
        let engine = ScriptedEngine::new().partial_transform("flightA");
        let (_temp, result) = run_chunk(engine.clone(), "flightA");
        assert!(!result.unwrap().has_geo_transform());
        let calls = engine.stage_calls("flightA");
        assert!(GEOMETRY_STAGES.iter().all(|op| !calls.contains(op)));
    }

    #[test]
    fn test_stage_failure_stops_the_run() {
        let engine = ScriptedEngine::new().fail_at("flightA", ops::BUILD_DEPTH_MAPS);
        let (_temp, result) = run_chunk(engine.clone(), "flightA");
        let failure = result.unwrap_err();

        assert_eq!(failure.run.stage, PipelineStage::Aligned);
        assert_eq!(failure.error.stage(), Some(ops::BUILD_DEPTH_MAPS));
        assert_eq!(failure.error.chunk(), "flightA");
        assert_eq!(
            engine.stage_calls("flightA"),
            vec![ops::ALIGN, ops::BUILD_DEPTH_MAPS]
        );
    }

    #[test]
    fn test_checkpoint_failure_is_a_stage_error() {
        let engine = ScriptedEngine::new().fail_saves_for("flightA");
        let (_temp, result) = run_chunk(engine.clone(), "flightA");
        let failure = result.unwrap_err();

        assert!(matches!(failure.error, StageError::Checkpoint { .. }));
        assert_eq!(failure.run.stage, PipelineStage::Created);
        assert_eq!(engine.stage_calls("flightA"), vec![ops::ALIGN]);
    }

    #[test]
    fn test_stage_names_order() {
        assert!(PipelineStage::Created < PipelineStage::Aligned);
        assert!(PipelineStage::Orthomosaicked < PipelineStage::Exported);
        assert_eq!(PipelineStage::DepthMapped.to_string(), "depth_mapped");
    }
}
