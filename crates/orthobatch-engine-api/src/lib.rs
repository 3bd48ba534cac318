//! Contract between the orchestrator and a reconstruction engine
//!
//! The orchestrator never talks to an engine directly. It goes through three
//! traits defined here:
//!
//! - [`Engine`]: process-wide entry point. Receives the device configuration
//!   once and opens project sessions.
//! - [`ProjectSession`]: one open project document. Hosts chunks, saves and
//!   closes.
//! - [`StageExecutor`]: the individual reconstruction stages run against a
//!   chunk of an open session.
//!
//! Every stage call is blocking and may run for hours. Parameter types are
//! serde-serializable so adapters can forward them over a process boundary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Operation names shared by engine adapters and logs
pub mod ops {
    pub const CONFIGURE_DEVICES: &str = "configure_devices";
    pub const OPEN: &str = "open";
    pub const ADD_CHUNK: &str = "add_chunk";
    pub const ALIGN: &str = "align";
    pub const BUILD_DEPTH_MAPS: &str = "build_depth_maps";
    pub const BUILD_MODEL: &str = "build_model";
    pub const GEO_TRANSFORM: &str = "geo_transform";
    pub const BUILD_POINT_CLOUD: &str = "build_point_cloud";
    pub const SMOOTH_MODEL: &str = "smooth_model";
    pub const BUILD_ORTHOMOSAIC: &str = "build_orthomosaic";
    pub const EXPORT_RASTER: &str = "export_raster";
    pub const SAVE: &str = "save";
    pub const CLOSE: &str = "close";
    pub const MERGE_CHUNKS: &str = "merge_chunks";
}

/// Errors reported by an engine or engine adapter
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine operation '{operation}' failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Cannot open project {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Saving project {path} failed: {reason}")]
    Save { path: PathBuf, reason: String },

    #[error("Unknown chunk '{label}'")]
    UnknownChunk { label: String },

    #[error("Engine returned an unreadable response for '{operation}': {reason}")]
    Protocol { operation: String, reason: String },

    #[error("Engine operation '{operation}' timed out after {timeout_seconds} seconds")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Device configuration rejected: {reason}")]
    Devices { reason: String },
}

impl EngineError {
    /// Shorthand for [`EngineError::OperationFailed`]
    pub fn failed(operation: &str, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Engine-native chunk inside an open project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHandle {
    /// Label the chunk was created with
    pub label: String,
    /// Number of images the engine actually loaded
    pub image_count: usize,
}

/// Georeferencing solved for a chunk after modeling.
///
/// Each component is optional because alignment can succeed without
/// reference data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub scale: Option<f64>,
    pub rotation: Option<[[f64; 3]; 3]>,
    pub translation: Option<[f64; 3]>,
}

impl GeoTransform {
    /// True when scale, rotation and translation are all present
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.scale.is_some() && self.rotation.is_some() && self.translation.is_some()
    }
}

/// Image matching and camera alignment parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignParams {
    /// 0 is the highest accuracy
    pub downscale: u32,
    pub generic_preselection: bool,
    pub reference_preselection: bool,
    pub filter_mask: bool,
    pub mask_tiepoints: bool,
    pub keypoint_limit: u32,
    pub tiepoint_limit: u32,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            downscale: 0,
            generic_preselection: true,
            reference_preselection: true,
            filter_mask: false,
            mask_tiepoints: false,
            keypoint_limit: 40_000,
            tiepoint_limit: 4_000,
        }
    }
}

/// Depth filtering strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    None,
    Mild,
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthMapParams {
    pub downscale: u32,
    pub filter_mode: FilterMode,
}

impl Default for DepthMapParams {
    fn default() -> Self {
        Self {
            downscale: 2,
            filter_mode: FilterMode::Mild,
        }
    }
}

/// Data the mesh is built from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    #[default]
    DepthMaps,
    PointCloud,
    TiePoints,
}

/// Surface the orthomosaic is projected onto
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceSource {
    #[default]
    Model,
    Elevation,
}

/// Smoothing strength applied to the model
pub const DEFAULT_SMOOTHING_STRENGTH: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiffCompression {
    None,
    Lzw,
    Jpeg,
    Deflate,
}

/// Raster encoding options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionProfile {
    pub tiff_compression: TiffCompression,
    pub jpeg_quality: u8,
    pub tiff_tiled: bool,
    pub tiff_big: bool,
    pub tiff_overviews: bool,
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self {
            tiff_compression: TiffCompression::Jpeg,
            jpeg_quality: 90,
            tiff_tiled: true,
            tiff_big: true,
            tiff_overviews: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    Planar,
    Cylindrical,
}

/// Output projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub kind: ProjectionKind,
    pub crs: String,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            kind: ProjectionKind::Planar,
            crs: "EPSG::4326".to_string(),
        }
    }
}

/// Everything `export_raster` needs to write products for one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub raster_path: PathBuf,
    pub report_path: PathBuf,
    pub compression: CompressionProfile,
    pub projection: Projection,
    pub save_alpha: bool,
    pub white_background: bool,
}

impl ExportRequest {
    /// Request with the fixed product profile for the given output paths
    #[must_use]
    pub fn new(raster_path: PathBuf, report_path: PathBuf) -> Self {
        Self {
            raster_path,
            report_path,
            compression: CompressionProfile::default(),
            projection: Projection::default(),
            save_alpha: false,
            white_background: true,
        }
    }
}

/// What an export actually produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub raster_written: bool,
    pub report_written: bool,
}

/// Process-wide compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bit N enables GPU N
    pub gpu_mask: u32,
    pub cpu_enabled: bool,
}

/// Individual reconstruction stages run against one chunk.
///
/// Stages must be called in pipeline order; each documents its precondition.
pub trait StageExecutor {
    /// Match images and solve camera positions. May leave the transform unset.
    fn align(&mut self, chunk: &ChunkHandle, params: &AlignParams) -> Result<(), EngineError>;

    /// Requires alignment
    fn build_depth_maps(
        &mut self,
        chunk: &ChunkHandle,
        params: &DepthMapParams,
    ) -> Result<(), EngineError>;

    /// Requires depth maps when `source` is [`ModelSource::DepthMaps`]
    fn build_model(&mut self, chunk: &ChunkHandle, source: ModelSource)
    -> Result<(), EngineError>;

    fn geo_transform(&mut self, chunk: &ChunkHandle) -> Result<GeoTransform, EngineError>;

    /// Requires a complete transform
    fn build_point_cloud(&mut self, chunk: &ChunkHandle) -> Result<(), EngineError>;

    /// Requires a model
    fn smooth_model(&mut self, chunk: &ChunkHandle, strength: f64) -> Result<(), EngineError>;

    /// Requires a complete transform
    fn build_orthomosaic(
        &mut self,
        chunk: &ChunkHandle,
        surface: SurfaceSource,
    ) -> Result<(), EngineError>;

    /// Writes the raster when an orthomosaic exists and always writes the report
    fn export_raster(
        &mut self,
        chunk: &ChunkHandle,
        request: &ExportRequest,
    ) -> Result<ExportOutcome, EngineError>;
}

/// One open project document
pub trait ProjectSession: StageExecutor {
    /// Location of the project file
    fn path(&self) -> &Path;

    /// Create a chunk and load `images` into it
    fn add_chunk(&mut self, label: &str, images: &[PathBuf]) -> Result<ChunkHandle, EngineError>;

    /// Chunks currently in the document, in creation order
    fn chunks(&self) -> Vec<ChunkHandle>;

    /// Persist the document. Leaves the engine's lock artifact behind.
    fn save(&mut self) -> Result<(), EngineError>;

    /// Merge every chunk into a new chunk called `label`
    fn merge_chunks(&mut self, label: &str) -> Result<ChunkHandle, EngineError>;

    fn close(&mut self) -> Result<(), EngineError>;
}

/// Entry point of a reconstruction engine
pub trait Engine {
    type Session: ProjectSession;

    /// Apply the device configuration. Called once, before any session opens.
    fn apply_devices(&mut self, devices: &DeviceConfig) -> Result<(), EngineError>;

    /// Open the project at `project_path`, creating an empty one if absent
    fn open(&mut self, project_path: &Path) -> Result<Self::Session, EngineError>;
}
