//! External transcoder and prober invocation.
//!
//! Tools communicate only through exit status and captured output. Every
//! invocation goes through [`ToolRunner`], which can stop a child process when
//! its cancellation token fires or its timeout elapses.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, VidxError};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_TAIL: usize = 2048;

/// Captured output of a successful tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.stdout)
            .map_err(|_| VidxError::Probe("tool output is not UTF-8".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    program: PathBuf,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ToolRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Run the tool to completion and fail on a non-zero exit status.
    pub fn run<I, S>(&self, args: I) -> Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> =
            args.into_iter().map(|arg| arg.as_ref().to_owned()).collect();
        let tool = self.tool_name();
        debug!(%tool, ?args, "running external tool");

        if self.cancel.is_cancelled() {
            return Err(VidxError::Cancelled(format!("{tool} not started")));
        }

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| VidxError::tool(&tool, "spawn failed", err.to_string()))?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = self.wait(&mut child, &tool);

        let stdout = stdout.join().unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default())
            .into_owned();

        let status = waited?;
        if !status.success() {
            return Err(VidxError::tool(tool, status.to_string(), tail(&stderr)));
        }
        Ok(ToolOutput { stdout, stderr })
    }

    fn wait(&self, child: &mut Child, tool: &str) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self.cancel.is_cancelled() {
                terminate(child, tool);
                return Err(VidxError::Cancelled(format!("{tool} was cancelled")));
            }
            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                terminate(child, tool);
                return Err(VidxError::tool(
                    tool,
                    format!("timed out after {}s", limit.as_secs_f64()),
                    "",
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source
            && let Err(err) = source.read_to_end(&mut buf)
        {
            debug!("failed to read tool output: {err}");
        }
        buf
    })
}

fn terminate(child: &mut Child, tool: &str) {
    if let Err(err) = child.kill() {
        warn!(%tool, "failed to kill child process: {err}");
    }
    if let Err(err) = child.wait() {
        warn!(%tool, "failed to reap child process: {err}");
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Width and height of one storyboard cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSize {
    pub width: u32,
    pub height: u32,
}

impl Default for CellSize {
    fn default() -> Self {
        Self {
            width: 160,
            height: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewClip {
    pub start_secs: f64,
    pub length_secs: f64,
    pub width: u32,
}

/// Encoder settings for preview clips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewEncoding {
    /// Container, also used as the file extension.
    pub container: String,
    pub video_codec: String,
    pub bitrate_kbps: u32,
}

impl Default for PreviewEncoding {
    fn default() -> Self {
        Self {
            container: "webm".to_string(),
            video_codec: "libvpx-vp9".to_string(),
            bitrate_kbps: 300,
        }
    }
}

/// Operations the asset pipeline needs from the external transcoder.
#[cfg_attr(test, mockall::automock)]
pub trait Transcoder: Send + Sync {
    /// Write one JPEG frame captured at `at_secs`, scaled to `width`.
    fn capture_frame(
        &self,
        source: &Path,
        at_secs: f64,
        width: u32,
        output: &Path,
    ) -> Result<()>;

    /// Encode a muted preview clip to `output`.
    fn encode_preview(
        &self,
        source: &Path,
        clip: &PreviewClip,
        output: &Path,
    ) -> Result<()>;

    /// Decode only keyframes, scaled to `cell`, into numbered JPEGs inside
    /// `output_dir`.
    fn extract_keyframes(
        &self,
        source: &Path,
        cell: CellSize,
        output_dir: &Path,
    ) -> Result<()>;

    /// Presentation times in seconds of the keyframe packets of the first
    /// video stream, ascending.
    fn keyframe_timestamps(&self, source: &Path) -> Result<Vec<f64>>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: ToolRunner,
    ffprobe: ToolRunner,
    preview: PreviewEncoding,
}

impl FfmpegTranscoder {
    pub fn new(
        ffmpeg: ToolRunner,
        ffprobe: ToolRunner,
        preview: PreviewEncoding,
    ) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            preview,
        }
    }

    pub fn preview_encoding(&self) -> &PreviewEncoding {
        &self.preview
    }
}

fn quiet_args() -> Vec<OsString> {
    ["-hide_banner", "-loglevel", "error", "-y"]
        .iter()
        .map(OsString::from)
        .collect()
}

fn secs_arg(secs: f64) -> OsString {
    OsString::from(format!("{:.3}", secs.max(0.0)))
}

impl Transcoder for FfmpegTranscoder {
    fn capture_frame(
        &self,
        source: &Path,
        at_secs: f64,
        width: u32,
        output: &Path,
    ) -> Result<()> {
        let mut args = quiet_args();
        args.extend([
            "-ss".into(),
            secs_arg(at_secs),
            "-i".into(),
            source.as_os_str().to_owned(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={width}:-2").into(),
            "-q:v".into(),
            "3".into(),
            "-f".into(),
            "image2".into(),
            output.as_os_str().to_owned(),
        ]);
        self.ffmpeg.run(args).map(|_| ())
    }

    fn encode_preview(
        &self,
        source: &Path,
        clip: &PreviewClip,
        output: &Path,
    ) -> Result<()> {
        let bitrate = self.preview.bitrate_kbps;
        let mut args = quiet_args();
        args.extend([
            "-ss".into(),
            secs_arg(clip.start_secs),
            "-i".into(),
            source.as_os_str().to_owned(),
            "-t".into(),
            secs_arg(clip.length_secs),
            "-an".into(),
            "-vf".into(),
            format!("scale={}:-2", clip.width).into(),
            "-c:v".into(),
            self.preview.video_codec.clone().into(),
            "-b:v".into(),
            format!("{bitrate}k").into(),
            "-maxrate".into(),
            format!("{}k", bitrate + bitrate / 2).into(),
            "-bufsize".into(),
            format!("{}k", bitrate * 2).into(),
            "-f".into(),
            self.preview.container.clone().into(),
            output.as_os_str().to_owned(),
        ]);
        self.ffmpeg.run(args).map(|_| ())
    }

    fn extract_keyframes(
        &self,
        source: &Path,
        cell: CellSize,
        output_dir: &Path,
    ) -> Result<()> {
        let mut args = quiet_args();
        args.extend([
            "-skip_frame".into(),
            "nokey".into(),
            "-i".into(),
            source.as_os_str().to_owned(),
            "-an".into(),
            "-fps_mode".into(),
            "passthrough".into(),
            "-vf".into(),
            format!("scale={}:{}", cell.width, cell.height).into(),
            "-q:v".into(),
            "5".into(),
            output_dir.join("%05d.jpg").into_os_string(),
        ]);
        self.ffmpeg.run(args).map(|_| ())
    }

    fn keyframe_timestamps(&self, source: &Path) -> Result<Vec<f64>> {
        let output = self.ffprobe.run([
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-select_streams"),
            OsStr::new("v:0"),
            OsStr::new("-show_entries"),
            OsStr::new("packet=pts_time,flags"),
            OsStr::new("-of"),
            OsStr::new("csv=print_section=0"),
            source.as_os_str(),
        ])?;
        Ok(parse_keyframe_rows(output.stdout_text()?))
    }
}

/// Parse `pts_time,flags` rows, keeping keyframe packets in ascending order.
pub fn parse_keyframe_rows(text: &str) -> Vec<f64> {
    let mut times: Vec<f64> = text
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(',');
            let pts = fields.next()?.trim();
            let flags = fields.next()?.trim();
            if !flags.contains('K') {
                return None;
            }
            pts.parse::<f64>().ok().filter(|t| t.is_finite())
        })
        .collect();
    times.sort_by(f64::total_cmp);
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_rows_keep_only_flagged_packets() {
        let csv = "0.000000,K__\n0.033367,___\n2.002000,K__\nN/A,K__\n\n4.004000,K_D\n";
        assert_eq!(parse_keyframe_rows(csv), vec![0.0, 2.002, 4.004]);
    }

    #[test]
    fn keyframe_rows_are_sorted() {
        let csv = "4.0,K__\n0.5,K__\n2.0,K__\n";
        assert_eq!(parse_keyframe_rows(csv), vec![0.5, 2.0, 4.0]);
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        let long = "é".repeat(STDERR_TAIL);
        let cut = tail(&long);
        assert!(cut.len() <= STDERR_TAIL);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn missing_program_is_an_external_tool_error() {
        let runner = ToolRunner::new("/nonexistent/vidx-tool");
        let err = runner.run(["-version"]).unwrap_err();
        assert!(matches!(err, VidxError::ExternalTool { .. }));
    }

    #[test]
    fn cancelled_runner_does_not_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = ToolRunner::new("/nonexistent/vidx-tool")
            .with_cancellation(cancel);
        assert!(matches!(runner.run(["x"]), Err(VidxError::Cancelled(_))));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_reports_status() {
        let runner = ToolRunner::new("sh");
        let err = runner.run(["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err {
            VidxError::ExternalTool { tool, stderr, .. } => {
                assert_eq!(tool, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_hung_process() {
        let runner = ToolRunner::new("sleep")
            .with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = runner.run(["5"]).unwrap_err();
        assert!(matches!(err, VidxError::ExternalTool { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_running_process() {
        let cancel = CancellationToken::new();
        let runner = ToolRunner::new("sleep").with_cancellation(cancel.clone());
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let err = runner.run(["5"]).unwrap_err();
        trigger.join().unwrap();
        assert!(matches!(err, VidxError::Cancelled(_)));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout() {
        let out = ToolRunner::new("sh").run(["-c", "printf hello"]).unwrap();
        assert_eq!(out.stdout_text().unwrap(), "hello");
    }
}
