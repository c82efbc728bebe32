use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::error::ScanError;

/// Source of an encoded image of the operator's primary display.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, ScanError>;
}

/// Runs an external screenshot tool and takes the image from its stdout,
/// e.g. `import -window root png:-` or `grim -`.
pub struct CommandCapturer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCapturer {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, ScanError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ScanError::Capture("empty capture command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl SnapshotSource for CommandCapturer {
    async fn capture(&self) -> Result<Vec<u8>, ScanError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ScanError::Capture(format!("{} timed out", self.program)))?
            .map_err(|e| ScanError::Capture(format!("failed to execute {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(ScanError::Capture(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(ScanError::Capture(format!("{} produced no image", self.program)));
        }
        debug!(bytes = output.stdout.len(), "captured screen");
        Ok(output.stdout)
    }
}

/// Capturer for headless deployments; always reports no image.
pub struct NoSnapshot;

#[async_trait]
impl SnapshotSource for NoSnapshot {
    async fn capture(&self) -> Result<Vec<u8>, ScanError> {
        Err(ScanError::Capture("screen capture disabled".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn takes_image_from_stdout() {
        let c = CommandCapturer::new(&cmd(&["printf", "PNGDATA"]), Duration::from_secs(5)).unwrap();
        assert_eq!(c.capture().await.unwrap(), b"PNGDATA".to_vec());
    }

    #[tokio::test]
    async fn failing_tool_is_capture_error() {
        let c = CommandCapturer::new(&cmd(&["false"]), Duration::from_secs(5)).unwrap();
        assert!(matches!(c.capture().await, Err(ScanError::Capture(_))));

        let c = CommandCapturer::new(&cmd(&["true"]), Duration::from_secs(5)).unwrap();
        assert!(matches!(c.capture().await, Err(ScanError::Capture(_))));
    }

    #[test]
    fn empty_command_rejected() {
        assert!(CommandCapturer::new(&[], Duration::from_secs(1)).is_err());
    }
}
