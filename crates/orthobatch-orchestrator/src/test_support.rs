//! Scripted in-memory engine for tests.
//!
//! Records every call, enforces stage preconditions, writes the project file,
//! lock artifact and export products to disk like a real engine would, and
//! fails on demand.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use orthobatch_engine_api::{
    AlignParams, ChunkHandle, DepthMapParams, DeviceConfig, Engine, EngineError, ExportOutcome,
    ExportRequest, GeoTransform, ModelSource, ProjectSession, StageExecutor, SurfaceSource, ops,
};
use orthobatch_lock::project_lock_path;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    ApplyDevices(DeviceConfig),
    Open(PathBuf),
    AddChunk { label: String, images: usize },
    Stage { chunk: String, operation: &'static str },
    Save(PathBuf),
    MergeChunks(String),
    Close(PathBuf),
}

#[derive(Debug, Default)]
struct Script {
    failures: Vec<(String, &'static str)>,
    no_transform: BTreeSet<String>,
    partial_transform: BTreeSet<String>,
    fail_open: bool,
    fail_saves: bool,
    fail_saves_for: BTreeSet<String>,
    refuse_save_when_locked: bool,
    existing_chunks: Vec<ChunkHandle>,
}

/// Cloning shares the call log and the script
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    calls: Rc<RefCell<Vec<EngineCall>>>,
    script: Rc<RefCell<Script>>,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `operation` on chunk `label`
    #[must_use]
    pub fn fail_at(self, label: &str, operation: &'static str) -> Self {
        self.script
            .borrow_mut()
            .failures
            .push((label.to_string(), operation));
        self
    }

    /// Leave the transform of `label` unsolved
    #[must_use]
    pub fn without_transform(self, label: &str) -> Self {
        self.script
            .borrow_mut()
            .no_transform
            .insert(label.to_string());
        self
    }

    /// Solve only the scale of `label`
    #[must_use]
    pub fn partial_transform(self, label: &str) -> Self {
        self.script
            .borrow_mut()
            .partial_transform
            .insert(label.to_string());
        self
    }

    #[must_use]
    pub fn fail_open(self) -> Self {
        self.script.borrow_mut().fail_open = true;
        self
    }

    #[must_use]
    pub fn fail_saves(self) -> Self {
        self.script.borrow_mut().fail_saves = true;
        self
    }

    /// Fail saves made while `label` is the chunk being worked on
    #[must_use]
    pub fn fail_saves_for(self, label: &str) -> Self {
        self.script
            .borrow_mut()
            .fail_saves_for
            .insert(label.to_string());
        self
    }

    /// Refuse to save while the lock artifact exists
    #[must_use]
    pub fn refuse_save_when_locked(self) -> Self {
        self.script.borrow_mut().refuse_save_when_locked = true;
        self
    }

    /// Aligned chunks present in every opened project
    #[must_use]
    pub fn with_existing_chunks(self, labels: &[&str]) -> Self {
        self.script.borrow_mut().existing_chunks = labels
            .iter()
            .map(|label| ChunkHandle {
                label: (*label).to_string(),
                image_count: 10,
            })
            .collect();
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.borrow().clone()
    }

    /// Stage operations run on `label`, in order
    #[must_use]
    pub fn stage_calls(&self, label: &str) -> Vec<&'static str> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                EngineCall::Stage { chunk, operation } if chunk == label => Some(*operation),
                _ => None,
            })
            .collect()
    }

    /// Labels passed to `add_chunk`, in order
    #[must_use]
    pub fn added_chunks(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddChunk { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| matches!(c, EngineCall::Save(_)))
            .count()
    }
}

impl Engine for ScriptedEngine {
    type Session = ScriptedSession;

    fn apply_devices(&mut self, devices: &DeviceConfig) -> Result<(), EngineError> {
        self.calls
            .borrow_mut()
            .push(EngineCall::ApplyDevices(*devices));
        Ok(())
    }

    fn open(&mut self, project_path: &Path) -> Result<Self::Session, EngineError> {
        self.calls
            .borrow_mut()
            .push(EngineCall::Open(project_path.to_path_buf()));
        let script = self.script.borrow();
        if script.fail_open {
            return Err(EngineError::Open {
                path: project_path.to_path_buf(),
                reason: "scripted open failure".to_string(),
            });
        }
        let chunks = script
            .existing_chunks
            .iter()
            .cloned()
            .map(|handle| ChunkState::new(handle, true))
            .collect();
        Ok(ScriptedSession {
            path: project_path.to_path_buf(),
            calls: Rc::clone(&self.calls),
            script: Rc::clone(&self.script),
            chunks,
            current: None,
        })
    }
}

#[derive(Debug)]
struct ChunkState {
    handle: ChunkHandle,
    aligned: bool,
    depth_maps: bool,
    model: bool,
    transform: GeoTransform,
    orthomosaic: bool,
}

impl ChunkState {
    fn new(handle: ChunkHandle, aligned: bool) -> Self {
        Self {
            handle,
            aligned,
            depth_maps: false,
            model: false,
            transform: GeoTransform::default(),
            orthomosaic: false,
        }
    }
}

#[derive(Debug)]
pub struct ScriptedSession {
    path: PathBuf,
    calls: Rc<RefCell<Vec<EngineCall>>>,
    script: Rc<RefCell<Script>>,
    chunks: Vec<ChunkState>,
    current: Option<String>,
}

impl ScriptedSession {
    /// Record the call, apply scripted failures and return the chunk state
    fn enter(
        &mut self,
        chunk: &ChunkHandle,
        operation: &'static str,
    ) -> Result<&mut ChunkState, EngineError> {
        let index = self
            .chunks
            .iter()
            .position(|c| c.handle.label == chunk.label)
            .ok_or_else(|| EngineError::UnknownChunk {
                label: chunk.label.clone(),
            })?;
        self.calls.borrow_mut().push(EngineCall::Stage {
            chunk: chunk.label.clone(),
            operation,
        });
        self.current = Some(chunk.label.clone());

        let scripted_failure = self
            .script
            .borrow()
            .failures
            .iter()
            .any(|(label, op)| *label == chunk.label && *op == operation);
        if scripted_failure {
            return Err(EngineError::failed(operation, "scripted failure"));
        }
        Ok(&mut self.chunks[index])
    }
}

fn require(condition: bool, operation: &str, what: &str) -> Result<(), EngineError> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::failed(operation, format!("requires {what}")))
    }
}

fn write_product(path: &Path, operation: &str) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::failed(operation, e.to_string()))?;
    }
    fs::write(path, b"product").map_err(|e| EngineError::failed(operation, e.to_string()))
}

impl StageExecutor for ScriptedSession {
    fn align(&mut self, chunk: &ChunkHandle, _params: &AlignParams) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::ALIGN)?;
        state.aligned = true;
        Ok(())
    }

    fn build_depth_maps(
        &mut self,
        chunk: &ChunkHandle,
        _params: &DepthMapParams,
    ) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::BUILD_DEPTH_MAPS)?;
        require(state.aligned, ops::BUILD_DEPTH_MAPS, "alignment")?;
        state.depth_maps = true;
        Ok(())
    }

    fn build_model(
        &mut self,
        chunk: &ChunkHandle,
        _source: ModelSource,
    ) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::BUILD_MODEL)?;
        require(state.depth_maps, ops::BUILD_MODEL, "depth maps")?;
        state.model = true;
        Ok(())
    }

    fn geo_transform(&mut self, chunk: &ChunkHandle) -> Result<GeoTransform, EngineError> {
        let (unsolved, partial) = {
            let script = self.script.borrow();
            (
                script.no_transform.contains(&chunk.label),
                script.partial_transform.contains(&chunk.label),
            )
        };
        let state = self.enter(chunk, ops::GEO_TRANSFORM)?;
        state.transform = if unsolved {
            GeoTransform::default()
        } else if partial {
            GeoTransform {
                scale: Some(1.0),
                ..GeoTransform::default()
            }
        } else {
            GeoTransform {
                scale: Some(0.5),
                rotation: Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]),
                translation: Some([4_000_000.0, 600_000.0, 5_000_000.0]),
            }
        };
        Ok(state.transform.clone())
    }

    fn build_point_cloud(&mut self, chunk: &ChunkHandle) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::BUILD_POINT_CLOUD)?;
        require(state.transform.is_complete(), ops::BUILD_POINT_CLOUD, "a transform")
    }

    fn smooth_model(&mut self, chunk: &ChunkHandle, _strength: f64) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::SMOOTH_MODEL)?;
        require(state.model, ops::SMOOTH_MODEL, "a model")
    }

    fn build_orthomosaic(
        &mut self,
        chunk: &ChunkHandle,
        _surface: SurfaceSource,
    ) -> Result<(), EngineError> {
        let state = self.enter(chunk, ops::BUILD_ORTHOMOSAIC)?;
        require(state.transform.is_complete(), ops::BUILD_ORTHOMOSAIC, "a transform")?;
        state.orthomosaic = true;
        Ok(())
    }

    fn export_raster(
        &mut self,
        chunk: &ChunkHandle,
        request: &ExportRequest,
    ) -> Result<ExportOutcome, EngineError> {
        let state = self.enter(chunk, ops::EXPORT_RASTER)?;
        let raster_written = state.orthomosaic;
        if raster_written {
            write_product(&request.raster_path, ops::EXPORT_RASTER)?;
        }
        write_product(&request.report_path, ops::EXPORT_RASTER)?;
        Ok(ExportOutcome {
            raster_written,
            report_written: true,
        })
    }
}

impl ProjectSession for ScriptedSession {
    fn path(&self) -> &Path {
        &self.path
    }

    fn add_chunk(&mut self, label: &str, images: &[PathBuf]) -> Result<ChunkHandle, EngineError> {
        self.calls.borrow_mut().push(EngineCall::AddChunk {
            label: label.to_string(),
            images: images.len(),
        });
        if self.script.borrow().failures.iter().any(|(l, op)| l == label && *op == ops::ADD_CHUNK) {
            return Err(EngineError::failed(ops::ADD_CHUNK, "scripted failure"));
        }
        let handle = ChunkHandle {
            label: label.to_string(),
            image_count: images.len(),
        };
        self.chunks.push(ChunkState::new(handle.clone(), false));
        self.current = Some(label.to_string());
        Ok(handle)
    }

    fn chunks(&self) -> Vec<ChunkHandle> {
        self.chunks.iter().map(|c| c.handle.clone()).collect()
    }

    fn save(&mut self) -> Result<(), EngineError> {
        self.calls
            .borrow_mut()
            .push(EngineCall::Save(self.path.clone()));
        let save_error = |reason: String| EngineError::Save {
            path: self.path.clone(),
            reason,
        };

        let lock = project_lock_path(&self.path);
        {
            let script = self.script.borrow();
            let failing_chunk = self
                .current
                .as_ref()
                .is_some_and(|label| script.fail_saves_for.contains(label));
            if script.fail_saves || failing_chunk {
                return Err(save_error("scripted save failure".to_string()));
            }
            if script.refuse_save_when_locked && lock.exists() {
                return Err(save_error("project is locked".to_string()));
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| save_error(e.to_string()))?;
        }
        fs::write(&self.path, b"scripted project").map_err(|e| save_error(e.to_string()))?;
        if let Some(parent) = lock.parent() {
            fs::create_dir_all(parent).map_err(|e| save_error(e.to_string()))?;
        }
        fs::write(&lock, b"locked").map_err(|e| save_error(e.to_string()))
    }

    fn merge_chunks(&mut self, label: &str) -> Result<ChunkHandle, EngineError> {
        self.calls
            .borrow_mut()
            .push(EngineCall::MergeChunks(label.to_string()));
        if self.chunks.is_empty() {
            return Err(EngineError::failed(ops::MERGE_CHUNKS, "no chunks to merge"));
        }
        let handle = ChunkHandle {
            label: label.to_string(),
            image_count: self.chunks.iter().map(|c| c.handle.image_count).sum(),
        };
        self.chunks.push(ChunkState::new(handle.clone(), true));
        self.current = Some(label.to_string());
        Ok(handle)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.calls
            .borrow_mut()
            .push(EngineCall::Close(self.path.clone()));
        Ok(())
    }
}
