//! Logging infrastructure for orthobatch
//!
//! Every run writes to the console and to a per-run log file under
//! `{log_dir}/log-files/`. The log file is later copied into each completed
//! job directory, so it is written without ANSI escapes.

use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{Level, error, info, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Directory under `log_dir` that holds per-run logs
pub const LOG_SUBDIR: &str = "log-files";

/// Check if colored console output should be used.
fn use_color() -> bool {
    std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Path of the log file for a run started at `started`
#[must_use]
pub fn log_file_path(log_dir: &Path, started: DateTime<Local>) -> PathBuf {
    log_dir.join(LOG_SUBDIR).join(format!(
        "log_{}.log",
        started.format("%Y-%m-%d_%H-%M-%S")
    ))
}

/// Create `{log_dir}/log-files/log_{YYYY-mm-dd_HH-MM-SS}.log` and return its path.
///
/// An existing file with the same name is appended to rather than truncated.
pub fn create_log_file(log_dir: &Path, started: DateTime<Local>) -> io::Result<PathBuf> {
    let path = log_file_path(log_dir, started);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok(path)
}

/// Initialize the tracing subscriber.
///
/// Console output goes to stderr in compact form. When `log_file` is given, a
/// second layer appends the same events to it without colors.
///
/// # Arguments
/// * `verbose` - Enable debug-level output and span close events
/// * `log_file` - Per-run log file created by [`create_log_file`]
pub fn init_tracing(
    verbose: bool,
    log_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("orthobatch=debug,info")
            } else {
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if verbose {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_color())
        .with_target(verbose)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_span_events(span_events.clone())
        .compact();

    let file_layer = match log_file {
        Some(path) => {
            let file = File::options().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_span_events(span_events)
                    .compact(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Span covering one job from staging to rename
pub fn job_span(job: &str) -> tracing::Span {
    span!(Level::INFO, "job", job = %job)
}

/// Span covering one chunk group's stage sequence
pub fn chunk_span(job: &str, chunk: &str) -> tracing::Span {
    span!(Level::INFO, "chunk", job = %job, chunk = %chunk)
}

/// Span covering one stage
pub fn stage_span(chunk: &str, stage: &str) -> tracing::Span {
    span!(Level::INFO, "stage", chunk = %chunk, stage = %stage)
}

pub fn log_stage_complete(chunk: &str, stage: &str, duration_ms: u128) {
    info!(
        chunk = %chunk,
        stage = %stage,
        duration_ms = %duration_ms,
        "Stage completed"
    );
}

pub fn log_stage_error(chunk: &str, stage: &str, error: &str, duration_ms: u128) {
    error!(
        chunk = %chunk,
        stage = %stage,
        duration_ms = %duration_ms,
        error = %error,
        "Stage failed"
    );
}

/// Wall-clock bookkeeping for stage start lines.
///
/// Each [`mark`](Self::mark) logs the local start time of a stage and the time
/// elapsed since the previous mark.
#[derive(Debug)]
pub struct StageClock {
    last: Option<Instant>,
}

impl StageClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Log the start of `stage` and return the elapsed time since the previous mark
    pub fn mark(&mut self, chunk: &str, stage: &str) -> Option<Duration> {
        let now = Instant::now();
        let since_previous = self.last.map(|prev| now.duration_since(prev));
        self.last = Some(now);

        let started = Local::now().format("%Y-%m-%d %H:%M:%S");
        match since_previous {
            Some(elapsed) => info!(
                chunk = %chunk,
                stage = %stage,
                started = %started,
                since_previous_secs = elapsed.as_secs(),
                "Starting stage ({})",
                format_elapsed(elapsed)
            ),
            None => info!(
                chunk = %chunk,
                stage = %stage,
                started = %started,
                "Starting stage"
            ),
        }
        since_previous
    }
}

impl Default for StageClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a duration as `1h 02m 03s`, `2m 03s` or `3s`
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_name_format() {
        let started = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let path = log_file_path(Path::new("/var/log/ortho"), started);
        assert_eq!(
            path,
            PathBuf::from("/var/log/ortho/log-files/log_2024-03-09_07-05-01.log")
        );
    }

    #[test]
    fn test_create_log_file_creates_directory() {
        let dir = TempDir::new().unwrap();
        let started = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let path = create_log_file(dir.path(), started).unwrap();
        assert!(path.is_file());
        assert!(dir.path().join(LOG_SUBDIR).is_dir());

        // Second call reuses the file
        fs::write(&path, "first line\n").unwrap();
        let again = create_log_file(dir.path(), started).unwrap();
        assert_eq!(fs::read_to_string(again).unwrap(), "first line\n");
    }

    #[test]
    fn test_tracing_initialization() {
        // Fails if another test already installed a subscriber, which is fine
        let result = init_tracing(false, None);
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_span_creation() {
        let span = stage_span("flightA", "align");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "stage");
        }
        let _ = job_span("siteA_unprocessed");
        let _ = chunk_span("siteA_unprocessed", "flightA");
    }

    #[test]
    fn test_stage_clock_reports_elapsed_after_first_mark() {
        let mut clock = StageClock::new();
        assert!(clock.mark("flightA", "align").is_none());
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = clock.mark("flightA", "depth_maps").unwrap();
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(3)), "3s");
        assert_eq!(format_elapsed(Duration::from_secs(123)), "2m 03s");
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_structured_logging_functions() {
        log_stage_complete("flightA", "align", 1000);
        log_stage_error("flightA", "align", "engine crashed", 1000);
    }
}
