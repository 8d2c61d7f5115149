use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Decoder, EncodeSpec, Encoder, FrameSink, FrameSource};
use crate::video::{ContainerFormat, Frame, FrameRate, Resolution, VideoInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegSettings {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_copy_audio")]
    pub copy_audio: bool,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            codec: default_codec(),
            copy_audio: default_copy_audio(),
        }
    }
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_copy_audio() -> bool {
    true
}

/// Lines of ffmpeg diagnostics kept for error messages.
const STDERR_TAIL_LINES: usize = 32;

/// Drains a child's stderr on its own thread so a chatty process never
/// blocks on a full pipe. Only the last lines are kept.
struct StderrTail {
    reader: Option<JoinHandle<String>>,
}

impl StderrTail {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let reader = stderr.and_then(|pipe| {
            thread::Builder::new()
                .name("vidlift-ffmpeg-stderr".into())
                .spawn(move || tail_lines(BufReader::new(pipe), STDERR_TAIL_LINES))
                .map_err(|err| warn!(error = %err, "Failed to drain ffmpeg stderr"))
                .ok()
        });
        Self { reader }
    }

    /// Waits for the pipe to close and returns what was kept.
    fn collect(&mut self) -> String {
        self.reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    }
}

fn tail_lines(reader: impl BufRead, keep: usize) -> String {
    let mut tail = VecDeque::with_capacity(keep);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n").trim().to_string()
}

/// Where a required tool resolved on `PATH`, and the version it reports.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub name: String,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

impl ToolCheck {
    pub fn is_ok(&self) -> bool {
        self.version.is_some()
    }
}

/// Resolves the configured `ffmpeg` and `ffprobe` and asks each for its
/// version.
pub fn check_tools(settings: &FfmpegSettings) -> Vec<ToolCheck> {
    [settings.ffmpeg.as_str(), settings.ffprobe.as_str()]
        .into_iter()
        .map(check_tool)
        .collect()
}

fn check_tool(name: &str) -> ToolCheck {
    let path = which::which(name).ok();
    let version = path.as_ref().and_then(|path| {
        let output = Command::new(path)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    });
    debug!(tool = name, found = path.is_some(), version = ?version, "Tool checked");
    ToolCheck {
        name: name.to_string(),
        path,
        version,
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// Reads the first video stream's geometry and rate through `ffprobe`.
pub fn probe(settings: &FfmpegSettings, input: &Path) -> Result<VideoInfo> {
    let output = Command::new(&settings.ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,width,height,r_frame_rate,nb_frames",
            "-of",
            "json",
        ])
        .arg(input)
        .output()
        .with_context(|| format!("Failed to run {}", settings.ffprobe))?;
    if !output.status.success() {
        bail!(
            "ffprobe rejected {}: {}",
            input.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe(&output.stdout).with_context(|| format!("Failed to probe {}", input.display()))
}

fn parse_probe(raw: &[u8]) -> Result<VideoInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).context("invalid ffprobe JSON")?;
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));
    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let width = video.width.filter(|w| *w > 0).ok_or_else(|| anyhow!("video width missing"))?;
    let height = video
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("video height missing"))?;
    let frame_rate: FrameRate = video
        .r_frame_rate
        .as_deref()
        .ok_or_else(|| anyhow!("video frame rate missing"))?
        .parse()?;
    let frame_count = video.nb_frames.as_deref().and_then(|n| n.parse().ok());

    Ok(VideoInfo {
        resolution: Resolution::new(width, height),
        frame_rate,
        frame_count,
        has_audio,
    })
}

pub struct FfmpegDecoder {
    settings: FfmpegSettings,
}

impl FfmpegDecoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }
}

impl Decoder for FfmpegDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, input: &Path) -> Result<Box<dyn FrameSource>> {
        if !input.is_file() {
            bail!("Input file '{}' not found", input.display());
        }
        let info = probe(&self.settings, input)?;
        let mut child = Command::new(&self.settings.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.settings.ffmpeg))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))?;
        let stderr = StderrTail::spawn(child.stderr.take());
        debug!(input = %input.display(), resolution = %info.resolution, rate = %info.frame_rate, "Decoder opened");

        Ok(Box::new(FfmpegSource {
            frame_bytes: info.resolution.frame_bytes() as usize,
            info,
            child,
            reader: BufReader::new(stdout),
            stderr,
            next_index: 0,
        }))
    }
}

struct FfmpegSource {
    info: VideoInfo,
    child: Child,
    reader: BufReader<ChildStdout>,
    stderr: StderrTail,
    frame_bytes: usize,
    next_index: u64,
}

impl FfmpegSource {
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("Failed to read decoded frames"),
            }
        }
        Ok(filled)
    }

    fn check_exit(&mut self) -> Result<()> {
        let status = self.child.wait().context("Failed to wait for ffmpeg")?;
        let stderr = self.stderr.collect();
        if status.success() {
            return Ok(());
        }
        bail!("ffmpeg decode exited with {status}: {stderr}")
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; self.frame_bytes];
        let filled = self.fill(&mut buf)?;
        if filled == 0 {
            self.check_exit()?;
            return Ok(None);
        }
        if filled < buf.len() {
            bail!(
                "truncated frame {}: got {filled} of {} bytes",
                self.next_index,
                buf.len()
            );
        }
        let Resolution { width, height } = self.info.resolution;
        let frame = Frame::new(self.next_index, width, height, buf)?;
        self.next_index += 1;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub struct FfmpegEncoder {
    settings: FfmpegSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    fn build_command(&self, spec: &EncodeSpec) -> Command {
        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(spec.resolution.to_string())
            .arg("-r")
            .arg(spec.frame_rate.to_string())
            .args(["-i", "-"]);

        let audio = spec
            .audio_source
            .as_ref()
            .filter(|_| self.settings.copy_audio);
        if let Some(source) = audio {
            // No -shortest: a short audio track must never cut the video.
            cmd.arg("-i")
                .arg(source)
                .args(["-map", "0:v:0", "-map", "1:a?", "-c:a", "copy"]);
        }

        let codec = self.settings.codec.as_str();
        cmd.args(["-c:v", codec]);
        if codec.contains("nvenc") {
            cmd.args(["-preset", "p4", "-cq"]);
        } else {
            cmd.args(["-preset", spec.tuning.speed, "-crf"]);
        }
        cmd.arg(spec.tuning.crf.to_string())
            .args(["-pix_fmt", "yuv420p"]);
        if matches!(spec.container, ContainerFormat::Mp4 | ContainerFormat::Mov) {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.arg(&spec.output);
        cmd
    }
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn create(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameSink>> {
        if let Some(parent) = spec.output.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
        let mut child = self
            .build_command(spec)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.settings.ffmpeg))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;
        let stderr = StderrTail::spawn(child.stderr.take());
        debug!(output = %spec.output.display(), codec = %self.settings.codec, "Encoder started");
        Ok(Box::new(FfmpegSink {
            child: Some(child),
            stdin: Some(stdin),
            stderr,
            resolution: spec.resolution,
        }))
    }
}

struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: StderrTail,
    resolution: Resolution,
}

impl FrameSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.resolution() != self.resolution {
            bail!(
                "frame {} is {} but the stream is {}",
                frame.index,
                frame.resolution(),
                self.resolution
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder already finished"))?;
        stdin
            .write_all(&frame.data)
            .with_context(|| format!("Failed to pipe frame {} to ffmpeg", frame.index))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("encoder already finished"))?;
        let status = child.wait().context("Failed to wait for ffmpeg")?;
        let stderr = self.stderr.collect();
        if !status.success() {
            bail!("ffmpeg encode exited with {status}: {stderr}");
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        // Closing stdin lets ffmpeg flush whatever it already received.
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    warn!(%status, "Partial encode terminated with an error")
                }
                Err(err) => warn!(error = %err, "Failed to reap ffmpeg encoder"),
                _ => {}
            }
        }
    }
}
