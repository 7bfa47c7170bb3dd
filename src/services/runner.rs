use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use super::error::{PipelineError, PipelineResult};

/// Lines of stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// One call of an external media tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&OsString> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Executes external transforms. Success means exit status zero; any other
/// ending is reported as a [`PipelineError`].
#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> PipelineResult<TransformOutput>;
}

/// Runs transforms as child processes bounded by the invocation timeout.
/// The child is killed and reaped on timeout, and `kill_on_drop` covers a
/// cancelled caller.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl TransformRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> PipelineResult<TransformOutput> {
        let program = invocation.program.clone();
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::io(&invocation.program, source))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = timeout(invocation.timeout, async {
            tokio::join!(read_all(stdout), read_all(stderr), child.wait())
        })
        .await;

        let (stdout, stderr, status) = match finished {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "{} exceeded {:?}, killing pid {:?}",
                    program,
                    invocation.timeout,
                    child.id()
                );
                if let Err(err) = child.kill().await {
                    log::error!("failed to kill {}: {}", program, err);
                }
                return Err(PipelineError::TransformTimeout {
                    program,
                    timeout: invocation.timeout,
                });
            }
        };

        let status = status.map_err(|source| PipelineError::io(&program, source))?;
        let stdout = stdout.map_err(|source| PipelineError::io(&program, source))?;
        let stderr = stderr_tail(&stderr.map_err(|source| PipelineError::io(&program, source))?);

        match status.code() {
            Some(0) => Ok(TransformOutput { stdout, stderr }),
            Some(code) => Err(PipelineError::exit(program, code, stderr)),
            None => Err(PipelineError::TransformCrashed {
                program,
                detail: format!("{status}"),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, limit: Duration) -> Invocation {
        Invocation::new("sh", limit).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = ProcessRunner
            .run(&sh("printf hello", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let err = ProcessRunner
            .run(&sh("echo broken >&2; exit 3", Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            PipelineError::TransformFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn killed_process_is_reported_as_crash() {
        let err = ProcessRunner
            .run(&sh("kill -9 $$", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformCrashed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn terminated_process_is_reported_as_crash() {
        let err = ProcessRunner
            .run(&sh(
                "trap 'exit 255' TERM; kill -TERM $$; sleep 1",
                Duration::from_secs(5),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformCrashed { .. }), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn shell_reported_signal_is_reported_as_crash() {
        let err = ProcessRunner
            .run(&sh("exit 143", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformCrashed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = std::time::Instant::now();
        let err = ProcessRunner
            .run(&sh("sleep 30", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransformTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let err = ProcessRunner
            .run(&Invocation::new(
                "definitely-not-a-real-transcoder",
                Duration::from_secs(1),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn flag_value_reads_the_next_argument() {
        let inv = Invocation::new("ffmpeg", Duration::from_secs(1)).args(["-ss", "4.5", "-i", "in.mp4"]);
        assert_eq!(inv.flag_value("-ss").unwrap(), "4.5");
        assert!(inv.flag_value("-t").is_none());
    }
}
