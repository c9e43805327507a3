//! The result producer boundary.
//!
//! The producer is the expensive, slow part of a job (typically a model call).
//! The pipeline treats it as a black box: it reports progress through a
//! [`ProgressReporter`] and eventually returns `{data, usage}` or fails.

use crate::model::{JobInput, ProducerOutput, Usage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Progress channel capacity between producer and job driver.
pub const PROGRESS_CHANNEL_SIZE: usize = 64;

/// Lines of producer stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Handle the producer uses to report progress.
///
/// Reports never fail: once the driver stops listening they are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// Reporter plus the receiving end, sized for the driver.
    pub fn channel() -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_SIZE);
        (Self::new(tx), rx)
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(tx)
    }

    pub async fn report(&self, percent: u8, message: impl Into<String>) {
        let update = ProgressUpdate {
            percent: percent.min(100),
            message: message.into(),
        };
        let _ = self.tx.send(update).await;
    }
}

#[async_trait]
pub trait ResultProducer: Send + Sync + 'static {
    async fn produce(&self, input: JobInput, progress: ProgressReporter) -> Result<ProducerOutput>;
}

/// One line of `CommandProducer` output.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OutputLine {
    Result {
        data: serde_json::Value,
        #[serde(default)]
        usage: Usage,
    },
    Progress {
        percent: u8,
        #[serde(default)]
        message: String,
    },
}

/// Runs an external program as the producer.
///
/// The job input is written to the program's stdin as JSON. Each stdout line
/// is JSON: `{"percent", "message"}` reports progress and `{"data", "usage"}`
/// is the result. Lines that are not JSON become progress messages at the
/// last reported percent. A non-zero exit fails with the tail of stderr.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandProducer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ResultProducer for CommandProducer {
    async fn produce(&self, input: JobInput, progress: ProgressReporter) -> Result<ProducerOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn producer {}", self.program.display()))?;

        let mut stdin = child.stdin.take().context("Failed to open producer stdin")?;
        let stdout = child.stdout.take().context("Failed to open producer stdout")?;
        let mut stderr = child.stderr.take().context("Failed to open producer stderr")?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            let mut tail: VecDeque<&str> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in buf.lines() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        // Input is written concurrently with the stdout loop. The producer
        // may exit without reading it.
        let mut payload = serde_json::to_vec(&input)?;
        payload.push(b'\n');
        let stdin_task = tokio::spawn(async move {
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!("producer closed stdin before reading all input");
                    Ok(())
                }
                other => other,
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut last_percent = 0u8;
        let mut output = None;

        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<OutputLine>(trimmed) {
                Ok(OutputLine::Progress { percent, message }) => {
                    last_percent = percent.min(100);
                    progress.report(last_percent, message).await;
                }
                Ok(OutputLine::Result { data, usage }) => {
                    output = Some(ProducerOutput { data, usage });
                }
                Err(_) => progress.report(last_percent, trimmed).await,
            }
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let written = stdin_task.await;

        if !status.success() {
            anyhow::bail!(
                "producer exited with {}{}",
                status,
                if stderr_tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", stderr_tail)
                }
            );
        }
        written
            .context("producer input writer failed")?
            .context("Failed to write job input to producer")?;

        output.context("producer finished without emitting a result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubjectRef;
    use serde_json::json;

    fn input() -> JobInput {
        JobInput::new(SubjectRef::new("acme", "widgets", "main"), "scorecard")
    }

    fn sh(script: &str) -> CommandProducer {
        CommandProducer::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_reporter_clamps_percent() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.report(250, "over").await;
        assert_eq!(rx.recv().await.unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_detached_reporter_never_blocks() {
        let reporter = ProgressReporter::detached();
        for i in 0..10 {
            reporter.report(i * 10, "ignored").await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_producer_streams_progress_and_result() {
        let producer = sh(r#"cat >/dev/null
echo '{"percent": 40, "message": "reading files"}'
echo 'plain text note'
echo '{"data": {"score": 7}, "usage": {"input_units": 10, "output_units": 5, "total_units": 15}}'"#);

        let (reporter, mut rx) = ProgressReporter::channel();
        let output = producer.produce(input(), reporter).await.unwrap();

        assert_eq!(output.data, json!({"score": 7}));
        assert_eq!(output.usage.total_units, 15);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.percent, 40);
        assert_eq!(first.message, "reading files");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percent, 40);
        assert_eq!(second.message, "plain text note");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_producer_receives_input() {
        let producer = sh(r#"read line
case "$line" in
  *'"is_retry":true'*) echo '{"data": "retry seen"}' ;;
  *) echo '{"data": "fresh"}' ;;
esac"#);

        let retried = input().with_prior(None, Some("previous failure".into()));
        let output = producer
            .produce(retried, ProgressReporter::detached())
            .await
            .unwrap();
        assert_eq!(output.data, json!("retry seen"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_producer_failure_includes_stderr() {
        let producer = sh("cat >/dev/null; echo 'model quota exhausted' >&2; exit 3");
        let err = producer
            .produce(input(), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model quota exhausted"), "{}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_retry_input_keeps_producer_error() {
        let producer = sh("echo 'model api key missing' >&2; exit 2");
        let prior = json!({ "notes": "x".repeat(2 * 1024 * 1024) });
        let retried = input().with_prior(Some(prior), Some("earlier failure".into()));

        let err = producer
            .produce(retried, ProgressReporter::detached())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("model api key missing"), "{}", message);
        assert!(message.contains("exited with"), "{}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_producer_output_larger_than_pipe_before_reading_input() {
        let producer = sh(r#"i=0
while [ $i -lt 2000 ]; do
  echo '{"percent": 10, "message": "warming up the scoring model before reading input"}'
  i=$((i+1))
done
cat >/dev/null
echo '{"data": {"score": 5}}'"#);
        let prior = json!({ "notes": "y".repeat(512 * 1024) });
        let retried = input().with_prior(Some(prior), None);

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            producer.produce(retried, ProgressReporter::detached()),
        )
        .await
        .expect("producer stalled")
        .unwrap();
        assert_eq!(output.data, json!({"score": 5}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_producer_without_result() {
        let producer = sh(r#"cat >/dev/null; echo '{"percent": 100, "message": "done"}'"#);
        let err = producer
            .produce(input(), ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without emitting a result"));
    }
}
