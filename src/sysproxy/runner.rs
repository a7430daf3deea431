//! Execution of platform proxy scripts.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::error::{SysProxyError, SysProxyResult};

/// Runs a platform script and returns its standard output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `script`, giving up after `timeout`.
    async fn run(&self, script: &str, timeout: Duration) -> SysProxyResult<String>;
}

/// Runs scripts through `powershell.exe`.
///
/// The child is killed when the timeout elapses. On anything but Windows
/// every call fails with [`SysProxyError::Unsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerShellRunner;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[async_trait]
impl CommandRunner for PowerShellRunner {
    async fn run(&self, script: &str, timeout: Duration) -> SysProxyResult<String> {
        if !cfg!(windows) {
            return Err(SysProxyError::Unsupported(std::env::consts::OS));
        }

        let mut command = Command::new("powershell.exe");
        command
            .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        trace!("Running proxy script ({} bytes)", script.len());
        let child = command.spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SysProxyError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(SysProxyError::CommandFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(not(windows))]
    async fn test_unsupported_off_windows() {
        let err = PowerShellRunner
            .run("Write-Output 1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SysProxyError::Unsupported(_)));
    }
}
