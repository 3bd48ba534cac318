//! Engine adapter that drives an external bridge executable.
//!
//! Every engine operation is one process invocation:
//!
//! ```text
//! <program> <args...> <operation> [--project <path>] [--chunk <label>] [--params -]
//! ```
//!
//! With `--params -` the parameters are a JSON document on stdin. Image lists
//! for a large flight exceed the per-argument size limit, so they never
//! travel on the command line.
//!
//! The device configuration travels in `ORTHOBATCH_GPU_MASK` and
//! `ORTHOBATCH_CPU_ENABLED` on every call. The bridge answers with a single
//! JSON line on stdout, `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": "..."}`; any earlier stdout lines are engine chatter
//! and are ignored.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use orthobatch_engine_api::{
    AlignParams, ChunkHandle, DepthMapParams, DeviceConfig, Engine, EngineError, ExportOutcome,
    ExportRequest, GeoTransform, ModelSource, ProjectSession, StageExecutor, SurfaceSource, ops,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::RunnerError;
use crate::{CommandSpec, NativeRunner, ProcessRunner};

pub const GPU_MASK_ENV: &str = "ORTHOBATCH_GPU_MASK";
pub const CPU_ENABLED_ENV: &str = "ORTHOBATCH_CPU_ENABLED";

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenResult {
    #[serde(default)]
    chunks: Vec<ChunkHandle>,
}

/// Last non-empty stdout line parsed as a bridge response
fn parse_response(operation: &str, stdout: &str) -> Result<BridgeResponse, EngineError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| EngineError::Protocol {
            operation: operation.to_string(),
            reason: "no response on stdout".to_string(),
        })?;
    serde_json::from_str(line).map_err(|e| EngineError::Protocol {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn to_params<T: serde::Serialize>(operation: &str, value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Protocol {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone)]
struct Bridge<R> {
    runner: R,
    program: OsString,
    base_args: Vec<OsString>,
    timeout: Option<Duration>,
    devices: Option<DeviceConfig>,
}

impl<R: ProcessRunner> Bridge<R> {
    fn command(
        &self,
        operation: &str,
        project: Option<&Path>,
        chunk: Option<&str>,
        params: Option<&Value>,
    ) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.program)
            .args(&self.base_args)
            .arg(operation);
        if let Some(project) = project {
            cmd = cmd.arg("--project").arg(project);
        }
        if let Some(chunk) = chunk {
            cmd = cmd.arg("--chunk").arg(chunk);
        }
        if let Some(params) = params {
            cmd = cmd.arg("--params").arg("-").stdin(params.to_string());
        }
        if let Some(devices) = &self.devices {
            cmd = cmd
                .env(GPU_MASK_ENV, devices.gpu_mask.to_string())
                .env(CPU_ENABLED_ENV, if devices.cpu_enabled { "1" } else { "0" });
        }
        cmd
    }

    fn invoke(
        &self,
        operation: &str,
        project: Option<&Path>,
        chunk: Option<&str>,
        params: Option<&Value>,
    ) -> Result<Value, EngineError> {
        let cmd = self.command(operation, project, chunk, params);
        debug!(command = %cmd, "Invoking engine bridge");

        let output = self.runner.run(&cmd, self.timeout).map_err(|e| match e {
            RunnerError::Timeout { timeout_seconds } => EngineError::Timeout {
                operation: operation.to_string(),
                timeout_seconds,
            },
            other => EngineError::failed(operation, other.to_string()),
        })?;

        let response = parse_response(operation, &output.stdout_string());

        if !output.success() {
            // A structured error from the bridge beats raw stderr
            let reason = match response {
                Ok(BridgeResponse {
                    error: Some(error), ..
                }) => error,
                _ => {
                    let tail = output.stderr_tail(STDERR_TAIL_LINES);
                    let code = output
                        .exit_code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    if tail.is_empty() {
                        format!("bridge exited with {code}")
                    } else {
                        format!("bridge exited with {code}: {tail}")
                    }
                }
            };
            return Err(EngineError::failed(operation, reason));
        }

        let response = response?;
        if !response.ok {
            return Err(EngineError::failed(
                operation,
                response
                    .error
                    .unwrap_or_else(|| "engine reported failure".to_string()),
            ));
        }
        Ok(response.result)
    }

    fn invoke_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        project: Option<&Path>,
        chunk: Option<&str>,
        params: Option<&Value>,
    ) -> Result<T, EngineError> {
        let result = self.invoke(operation, project, chunk, params)?;
        serde_json::from_value(result).map_err(|e| EngineError::Protocol {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }
}

/// [`Engine`] backed by an external bridge executable
#[derive(Debug, Clone)]
pub struct CommandEngine<R = NativeRunner> {
    bridge: Bridge<R>,
}

impl CommandEngine<NativeRunner> {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self::with_runner(NativeRunner::new(), program)
    }
}

impl<R: ProcessRunner + Clone> CommandEngine<R> {
    #[must_use]
    pub fn with_runner(runner: R, program: impl Into<OsString>) -> Self {
        Self {
            bridge: Bridge {
                runner,
                program: program.into(),
                base_args: Vec::new(),
                timeout: None,
                devices: None,
            },
        }
    }

    /// Arguments placed before the operation name
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.bridge.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Bound every invocation. `None` waits indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.bridge.timeout = timeout;
        self
    }

    #[must_use]
    pub fn devices(&self) -> Option<DeviceConfig> {
        self.bridge.devices
    }
}

impl<R: ProcessRunner + Clone> Engine for CommandEngine<R> {
    type Session = CommandSession<R>;

    fn apply_devices(&mut self, devices: &DeviceConfig) -> Result<(), EngineError> {
        if devices.gpu_mask == 0 && !devices.cpu_enabled {
            return Err(EngineError::Devices {
                reason: "no GPU selected and CPU disabled".to_string(),
            });
        }
        self.bridge.devices = Some(*devices);
        let params = to_params(ops::CONFIGURE_DEVICES, devices)?;
        self.bridge
            .invoke(ops::CONFIGURE_DEVICES, None, None, Some(&params))?;
        info!(
            gpu_mask = devices.gpu_mask,
            cpu_enabled = devices.cpu_enabled,
            "Engine devices configured"
        );
        Ok(())
    }

    fn open(&mut self, project_path: &Path) -> Result<Self::Session, EngineError> {
        let opened: Option<OpenResult> = self
            .bridge
            .invoke_as(ops::OPEN, Some(project_path), None, None)
            .map_err(|e| EngineError::Open {
                path: project_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(CommandSession {
            bridge: self.bridge.clone(),
            path: project_path.to_path_buf(),
            chunks: opened.unwrap_or_default().chunks,
        })
    }
}

/// Project opened through a [`CommandEngine`]
#[derive(Debug)]
pub struct CommandSession<R = NativeRunner> {
    bridge: Bridge<R>,
    path: PathBuf,
    chunks: Vec<ChunkHandle>,
}

impl<R: ProcessRunner> CommandSession<R> {
    fn known(&self, chunk: &ChunkHandle) -> Result<(), EngineError> {
        if self.chunks.iter().any(|c| c.label == chunk.label) {
            Ok(())
        } else {
            Err(EngineError::UnknownChunk {
                label: chunk.label.clone(),
            })
        }
    }

    fn stage(
        &self,
        operation: &str,
        chunk: &ChunkHandle,
        params: Option<Value>,
    ) -> Result<Value, EngineError> {
        self.known(chunk)?;
        self.bridge.invoke(
            operation,
            Some(&self.path),
            Some(&chunk.label),
            params.as_ref(),
        )
    }

    fn stage_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        chunk: &ChunkHandle,
        params: Option<Value>,
    ) -> Result<T, EngineError> {
        self.known(chunk)?;
        self.bridge.invoke_as(
            operation,
            Some(&self.path),
            Some(&chunk.label),
            params.as_ref(),
        )
    }
}

impl<R: ProcessRunner> StageExecutor for CommandSession<R> {
    fn align(&mut self, chunk: &ChunkHandle, params: &AlignParams) -> Result<(), EngineError> {
        let params = to_params(ops::ALIGN, params)?;
        self.stage(ops::ALIGN, chunk, Some(params)).map(drop)
    }

    fn build_depth_maps(
        &mut self,
        chunk: &ChunkHandle,
        params: &DepthMapParams,
    ) -> Result<(), EngineError> {
        let params = to_params(ops::BUILD_DEPTH_MAPS, params)?;
        self.stage(ops::BUILD_DEPTH_MAPS, chunk, Some(params))
            .map(drop)
    }

    fn build_model(
        &mut self,
        chunk: &ChunkHandle,
        source: ModelSource,
    ) -> Result<(), EngineError> {
        self.stage(ops::BUILD_MODEL, chunk, Some(json!({ "source": source })))
            .map(drop)
    }

    fn geo_transform(&mut self, chunk: &ChunkHandle) -> Result<GeoTransform, EngineError> {
        self.stage_as(ops::GEO_TRANSFORM, chunk, None)
    }

    fn build_point_cloud(&mut self, chunk: &ChunkHandle) -> Result<(), EngineError> {
        self.stage(ops::BUILD_POINT_CLOUD, chunk, None).map(drop)
    }

    fn smooth_model(&mut self, chunk: &ChunkHandle, strength: f64) -> Result<(), EngineError> {
        self.stage(
            ops::SMOOTH_MODEL,
            chunk,
            Some(json!({ "strength": strength })),
        )
        .map(drop)
    }

    fn build_orthomosaic(
        &mut self,
        chunk: &ChunkHandle,
        surface: SurfaceSource,
    ) -> Result<(), EngineError> {
        self.stage(
            ops::BUILD_ORTHOMOSAIC,
            chunk,
            Some(json!({ "surface": surface })),
        )
        .map(drop)
    }

    fn export_raster(
        &mut self,
        chunk: &ChunkHandle,
        request: &ExportRequest,
    ) -> Result<ExportOutcome, EngineError> {
        let params = to_params(ops::EXPORT_RASTER, request)?;
        self.stage_as(ops::EXPORT_RASTER, chunk, Some(params))
    }
}

impl<R: ProcessRunner> ProjectSession for CommandSession<R> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn add_chunk(&mut self, label: &str, images: &[PathBuf]) -> Result<ChunkHandle, EngineError> {
        let params = json!({ "images": images });
        let handle: ChunkHandle = self.bridge.invoke_as(
            ops::ADD_CHUNK,
            Some(&self.path),
            Some(label),
            Some(&params),
        )?;
        info!(
            chunk = %handle.label,
            requested = images.len(),
            loaded = handle.image_count,
            "Images loaded into chunk"
        );
        self.chunks.push(handle.clone());
        Ok(handle)
    }

    fn chunks(&self) -> Vec<ChunkHandle> {
        self.chunks.clone()
    }

    fn save(&mut self) -> Result<(), EngineError> {
        self.bridge
            .invoke(ops::SAVE, Some(&self.path), None, None)
            .map(drop)
            .map_err(|e| EngineError::Save {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    fn merge_chunks(&mut self, label: &str) -> Result<ChunkHandle, EngineError> {
        let handle: ChunkHandle =
            self.bridge
                .invoke_as(ops::MERGE_CHUNKS, Some(&self.path), Some(label), None)?;
        self.chunks.push(handle.clone());
        Ok(handle)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.bridge
            .invoke(ops::CLOSE, Some(&self.path), None, None)
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessOutput;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays canned outputs and records every command
    #[derive(Debug, Clone, Default)]
    struct MockRunner {
        calls: Rc<RefCell<Vec<(CommandSpec, Option<Duration>)>>>,
        replies: Rc<RefCell<VecDeque<Result<ProcessOutput, RunnerError>>>>,
    }

    impl MockRunner {
        fn reply(&self, stdout: &str) -> &Self {
            self.replies.borrow_mut().push_back(Ok(ProcessOutput::new(
                stdout.as_bytes().to_vec(),
                Vec::new(),
                Some(0),
            )));
            self
        }

        fn reply_output(&self, output: ProcessOutput) -> &Self {
            self.replies.borrow_mut().push_back(Ok(output));
            self
        }

        fn reply_err(&self, err: RunnerError) -> &Self {
            self.replies.borrow_mut().push_back(Err(err));
            self
        }

        fn args(&self, index: usize) -> Vec<String> {
            self.calls.borrow()[index]
                .0
                .args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        }
    }

    impl ProcessRunner for MockRunner {
        fn run(
            &self,
            cmd: &CommandSpec,
            timeout: Option<Duration>,
        ) -> Result<ProcessOutput, RunnerError> {
            self.calls.borrow_mut().push((cmd.clone(), timeout));
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(ProcessOutput::new(b"{\"ok\":true}".to_vec(), Vec::new(), Some(0))))
        }
    }

    fn engine(runner: &MockRunner) -> CommandEngine<MockRunner> {
        CommandEngine::with_runner(runner.clone(), "bridge").with_args(["--engine", "metashape"])
    }

    fn chunk(label: &str) -> ChunkHandle {
        ChunkHandle {
            label: label.to_string(),
            image_count: 5,
        }
    }

    #[test]
    fn test_open_reads_existing_chunks() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":true,"result":{"chunks":[{"label":"flightA","image_count":12}]}}"#);

        let session = engine(&runner)
            .open(Path::new("/tmp/work/siteA_unprocessed/project.psx"))
            .unwrap();

        assert_eq!(session.chunks(), vec![ChunkHandle {
            label: "flightA".to_string(),
            image_count: 12
        }]);
        assert_eq!(
            runner.args(0),
            vec![
                "--engine",
                "metashape",
                "open",
                "--project",
                "/tmp/work/siteA_unprocessed/project.psx"
            ]
        );
    }

    #[test]
    fn test_open_failure_maps_to_open_error() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":false,"error":"license not found"}"#);

        let err = engine(&runner)
            .open(Path::new("/tmp/project.psx"))
            .unwrap_err();
        match err {
            EngineError::Open { path, reason } => {
                assert_eq!(path, PathBuf::from("/tmp/project.psx"));
                assert!(reason.contains("license not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_devices_travel_in_environment() {
        let runner = MockRunner::default();
        let mut engine = engine(&runner);
        engine
            .apply_devices(&DeviceConfig {
                gpu_mask: 0b11,
                cpu_enabled: false,
            })
            .unwrap();
        let mut session = engine.open(Path::new("/tmp/project.psx")).unwrap();
        session.save().unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 3);
        for (cmd, _) in calls.iter() {
            assert_eq!(
                cmd.env.get(&OsString::from(GPU_MASK_ENV)),
                Some(&OsString::from("3"))
            );
            assert_eq!(
                cmd.env.get(&OsString::from(CPU_ENABLED_ENV)),
                Some(&OsString::from("0"))
            );
        }
        drop(calls);
        assert_eq!(runner.args(0)[2], ops::CONFIGURE_DEVICES);
    }

    #[test]
    fn test_rejects_empty_device_selection() {
        let runner = MockRunner::default();
        let err = engine(&runner)
            .apply_devices(&DeviceConfig {
                gpu_mask: 0,
                cpu_enabled: false,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Devices { .. }));
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_add_chunk_sends_label_as_argument_and_images_on_stdin() {
        let runner = MockRunner::default();
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply("Loading photos...\n{\"ok\":true,\"result\":{\"label\":\"flight A\",\"image_count\":2}}\n");

        let handle = session
            .add_chunk(
                "flight A",
                &[PathBuf::from("/p/IMG_0001.jpg"), PathBuf::from("/p/IMG_0002.jpg")],
            )
            .unwrap();

        assert_eq!(handle.image_count, 2);
        assert_eq!(session.chunks().len(), 1);
        let args = runner.args(1);
        assert_eq!(args[5], "--chunk");
        assert_eq!(args[6], "flight A");
        assert_eq!(args[7..], ["--params", "-"]);
        let stdin = runner.calls.borrow()[1].0.stdin.clone().unwrap();
        let params: Value = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(params["images"][1], "/p/IMG_0002.jpg");
    }

    #[test]
    fn test_stage_on_unknown_chunk_is_rejected_without_invocation() {
        let runner = MockRunner::default();
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();

        let err = session.build_point_cloud(&chunk("ghost")).unwrap_err();
        assert!(matches!(err, EngineError::UnknownChunk { label } if label == "ghost"));
        assert_eq!(runner.calls.borrow().len(), 1);
    }

    #[test]
    fn test_geo_transform_decodes_partial_result() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":true,"result":{"chunks":[{"label":"flightA","image_count":5}]}}"#);
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply(r#"{"ok":true,"result":{"scale":1.5,"rotation":null,"translation":null}}"#);

        let transform = session.geo_transform(&chunk("flightA")).unwrap();
        assert_eq!(transform.scale, Some(1.5));
        assert!(!transform.is_complete());
    }

    #[test]
    fn test_non_zero_exit_reports_stderr_tail() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":true,"result":{"chunks":[{"label":"flightA","image_count":5}]}}"#);
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply_output(ProcessOutput::new(
            Vec::new(),
            b"Traceback\nRuntimeError: out of GPU memory\n".to_vec(),
            Some(1),
        ));

        let err = session
            .build_depth_maps(&chunk("flightA"), &DepthMapParams::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(ops::BUILD_DEPTH_MAPS));
        assert!(message.contains("out of GPU memory"));
    }

    #[test]
    fn test_timeout_is_forwarded_and_mapped() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":true,"result":{"chunks":[{"label":"flightA","image_count":5}]}}"#);
        let mut session = engine(&runner)
            .with_timeout(Some(Duration::from_secs(3600)))
            .open(Path::new("/tmp/project.psx"))
            .unwrap();
        runner.reply_err(RunnerError::Timeout {
            timeout_seconds: 3600,
        });

        let err = session
            .align(&chunk("flightA"), &AlignParams::default())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Timeout { ref operation, timeout_seconds: 3600 } if operation == ops::ALIGN
        ));
        assert_eq!(
            runner.calls.borrow()[1].1,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_save_failure_maps_to_save_error() {
        let runner = MockRunner::default();
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply(r#"{"ok":false,"error":"disk full"}"#);

        let err = session.save().unwrap_err();
        assert!(matches!(err, EngineError::Save { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_garbage_output_is_a_protocol_error() {
        let runner = MockRunner::default();
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply("not json at all");

        let err = session.close().unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn test_export_outcome_is_decoded() {
        let runner = MockRunner::default();
        runner.reply(r#"{"ok":true,"result":{"chunks":[{"label":"flightA","image_count":5}]}}"#);
        let mut session = engine(&runner).open(Path::new("/tmp/project.psx")).unwrap();
        runner.reply(r#"{"ok":true,"result":{"raster_written":false,"report_written":true}}"#);

        let outcome = session
            .export_raster(
                &chunk("flightA"),
                &ExportRequest::new(
                    PathBuf::from("export/flightA_orthomosaic.tif"),
                    PathBuf::from("export/flightA_report.pdf"),
                ),
            )
            .unwrap();
        assert!(!outcome.raster_written);
        assert!(outcome.report_written);
    }

    #[cfg(unix)]
    #[test]
    fn test_add_chunk_with_thousands_of_images() {
        // The bridge counts the images it received on stdin
        let script = r#"n=$(tr ',' '\n' | grep -c IMG_); echo "{\"ok\":true,\"result\":{\"label\":\"flightA\",\"image_count\":$n}}""#;
        let mut session = CommandEngine::new("sh")
            .with_args(["-c", script, "bridge"])
            .open(Path::new("/tmp/work/siteA_unprocessed/project.psx"))
            .unwrap();

        let images: Vec<PathBuf> = (0..3_500)
            .map(|i| {
                PathBuf::from(format!(
                    "/mnt/data/input/siteA_unprocessed/photos/flightA/DJI_202405_survey_block_07/IMG_{i:05}.JPG"
                ))
            })
            .collect();
        let bytes: usize = images.iter().map(|p| p.as_os_str().len()).sum();
        assert!(bytes > 128 * 1024);

        let handle = session.add_chunk("flightA", &images).unwrap();
        assert_eq!(handle.image_count, 3_500);
    }
}
