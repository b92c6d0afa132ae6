//! ffmpeg adapter (primary media-processing backend).
//!
//! Implements the `MediaProcessor` port by driving `ffmpeg`/`ffprobe` as
//! subprocesses: pure invocation building, stderr tail capture for error
//! reports, and a hard wall-clock ceiling with kill + reap.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::debug;

use fsb_core::{
    config::Config,
    errors::Error,
    media::{MediaProcessor, OperationSpec},
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 8 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 100;

#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub timeout: Duration,
}

impl FfmpegConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            ffprobe_path: cfg.ffprobe_path.clone(),
            timeout: cfg.process_timeout,
        }
    }
}

/// A concrete subprocess invocation.
#[derive(Clone, Debug)]
pub struct FfmpegInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

pub struct FfmpegProcessor {
    cfg: FfmpegConfig,
}

impl FfmpegProcessor {
    pub fn new(cfg: FfmpegConfig) -> Self {
        Self { cfg }
    }

    /// Build the ffmpeg argument list for a resolved operation.
    ///
    /// `RandomScreenshot` must be resolved to a concrete second first.
    fn build_invocation(
        &self,
        op: &OperationSpec,
        input: &Path,
        output: &Path,
    ) -> FfmpegInvocation {
        let input = input.display().to_string();
        let output = output.display().to_string();

        let args: Vec<String> = match op {
            OperationSpec::Screenshot { at_second } => vec![
                "-y".into(),
                "-loglevel".into(),
                "error".into(),
                "-ss".into(),
                at_second.to_string(),
                "-i".into(),
                input,
                "-frames:v".into(),
                "1".into(),
                "-q:v".into(),
                "2".into(),
                output,
            ],
            OperationSpec::Clip {
                start_second,
                duration_seconds,
            } => vec![
                "-y".into(),
                "-loglevel".into(),
                "error".into(),
                "-ss".into(),
                start_second.to_string(),
                "-i".into(),
                input,
                "-t".into(),
                duration_seconds.to_string(),
                "-c:v".into(),
                "libx264".into(),
                "-c:a".into(),
                "copy".into(),
                output,
            ],
            OperationSpec::Watermark { text } => vec![
                "-y".into(),
                "-loglevel".into(),
                "error".into(),
                "-i".into(),
                input,
                "-vf".into(),
                format!(
                    "drawtext=text='{}':x=w-tw-20:y=h-th-20:fontsize=24:fontcolor=white:box=1:boxcolor=black@0.5",
                    escape_drawtext(text)
                ),
                "-c:a".into(),
                "copy".into(),
                output,
            ],
            OperationSpec::RandomScreenshot => {
                unreachable!("random screenshots are resolved before invocation building")
            }
        };

        FfmpegInvocation {
            program: self.cfg.ffmpeg_path.clone(),
            args,
        }
    }

    /// Run an invocation under the configured time ceiling.
    async fn run(&self, operation: &str, inv: FfmpegInvocation) -> Result<()> {
        debug!(operation, program = %inv.program.display(), "spawning media tool");

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        let stderr = child.stderr.take();
        let tail: std::sync::Arc<Mutex<StderrTail>> =
            std::sync::Arc::new(Mutex::new(StderrTail::default()));
        if let Some(stderr) = stderr {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            });
        }

        let status = match tokio::time::timeout(self.cfg.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                // Over the ceiling: kill, reap, report.
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(Error::ProcessingTimeout {
                    operation: operation.to_string(),
                    seconds: self.cfg.timeout.as_secs(),
                });
            }
        };

        if !status.success() {
            let detail = tail.lock().await.snapshot();
            let detail = if detail.trim().is_empty() {
                format!("exit status {status}")
            } else {
                detail
            };
            return Err(Error::Processing {
                operation: operation.to_string(),
                detail,
            });
        }

        Ok(())
    }
}

/// Pick a concrete second for a random screenshot.
fn random_screenshot_second(duration: f64) -> u32 {
    let max = duration.floor() as u32;
    if max <= 1 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max)
}

/// Escape drawtext filter metacharacters in user-provided watermark text.
fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace('%', "\\%")
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let out = tokio::time::timeout(
            self.cfg.timeout,
            Command::new(&self.cfg.ffprobe_path)
                .args([
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ])
                .arg(input)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| Error::ProcessingTimeout {
            operation: "probe".to_string(),
            seconds: self.cfg.timeout.as_secs(),
        })??;

        if !out.status.success() {
            return Err(Error::Processing {
                operation: "probe".to_string(),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&out.stdout);
        text.trim().parse::<f64>().map_err(|_| Error::Processing {
            operation: "probe".to_string(),
            detail: format!("unparseable duration: {}", text.trim()),
        })
    }

    async fn transform(&self, input: &Path, op: &OperationSpec, output: &Path) -> Result<()> {
        op.validate()?;

        // Resolve the random variant against the probed duration so the
        // invocation itself is always concrete.
        let resolved = match op {
            OperationSpec::RandomScreenshot => {
                let duration = self.probe_duration(input).await?;
                OperationSpec::Screenshot {
                    at_second: random_screenshot_second(duration),
                }
            }
            OperationSpec::Clip {
                start_second,
                duration_seconds,
            } => {
                let duration = self.probe_duration(input).await?;
                if f64::from(*start_second) >= duration {
                    return Err(Error::InvalidOperation(format!(
                        "clip start {start_second}s is beyond the {duration:.0}s source"
                    )));
                }
                OperationSpec::Clip {
                    start_second: *start_second,
                    duration_seconds: *duration_seconds,
                }
            }
            other => other.clone(),
        };

        let inv = self.build_invocation(&resolved, input, output);
        let result = self.run(resolved.name(), inv).await;
        if result.is_err() {
            // Partial output is worthless; make sure it is gone.
            let _ = std::fs::remove_file(output);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> FfmpegProcessor {
        FfmpegProcessor::new(FfmpegConfig {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            timeout: Duration::from_millis(200),
        })
    }

    #[test]
    fn screenshot_invocation_shape() {
        let p = processor();
        let inv = p.build_invocation(
            &OperationSpec::Screenshot { at_second: 42 },
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out.jpg"),
        );
        assert_eq!(inv.program, PathBuf::from("ffmpeg"));
        assert_eq!(
            inv.args,
            vec![
                "-y",
                "-loglevel",
                "error",
                "-ss",
                "42",
                "-i",
                "/tmp/in.mp4",
                "-frames:v",
                "1",
                "-q:v",
                "2",
                "/tmp/out.jpg"
            ]
        );
    }

    #[test]
    fn clip_invocation_copies_audio_and_reencodes_video() {
        let p = processor();
        let inv = p.build_invocation(
            &OperationSpec::Clip {
                start_second: 90,
                duration_seconds: 20,
            },
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out.mp4"),
        );
        let args: Vec<&str> = inv.args.iter().map(|s| s.as_str()).collect();
        assert!(args.windows(2).any(|w| w == ["-ss", "90"]));
        assert!(args.windows(2).any(|w| w == ["-t", "20"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
    }

    #[test]
    fn watermark_text_is_escaped_for_drawtext() {
        let p = processor();
        let inv = p.build_invocation(
            &OperationSpec::Watermark {
                text: "it's 50%: fun".to_string(),
            },
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out.mp4"),
        );
        let vf = inv
            .args
            .iter()
            .find(|a| a.starts_with("drawtext="))
            .unwrap();
        assert!(vf.contains("it\\'s 50\\%\\: fun"));
    }

    #[test]
    fn random_second_stays_inside_the_source() {
        for _ in 0..100 {
            let s = random_screenshot_second(90.0);
            assert!(s < 90);
        }
        assert_eq!(random_screenshot_second(0.4), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_processing_error_with_stderr_detail() {
        let p = processor();
        let inv = FfmpegInvocation {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
        };
        let err = p.run("clip", inv).await.unwrap_err();
        match err {
            Error::Processing { operation, detail } => {
                assert_eq!(operation, "clip");
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn overlong_invocations_are_killed() {
        let p = processor();
        let inv = FfmpegInvocation {
            program: PathBuf::from("sleep"),
            args: vec!["5".into()],
        };
        let err = p.run("clip", inv).await.unwrap_err();
        assert!(matches!(err, Error::ProcessingTimeout { .. }));
    }
}
