//! Bounded execution of host commands.
//!
//! The `virsh` client and the capability probe both shell out to host
//! binaries. Every call is bounded by a timeout and the child is killed if
//! the caller gives up on it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::NativeError;

/// Run `binary` with `args` and return its stdout.
///
/// # Errors
/// Returns [`NativeError::ClientNotFound`] if the binary does not exist,
/// [`NativeError::Timeout`] if it does not exit within `timeout`, and
/// [`NativeError::CallFailed`] with the trimmed stderr on a non-zero exit.
pub(crate) async fn run<S: AsRef<str>>(
    binary: &Path,
    args: &[S],
    timeout: Duration,
) -> Result<String, NativeError> {
    let command_line = render(binary, args);
    tracing::debug!(command = %command_line, "running host command");

    let child = Command::new(binary)
        .args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NativeError::ClientNotFound { path: binary.to_owned() }
            } else {
                NativeError::Spawn { command: command_line.clone(), reason: e.to_string() }
            }
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| NativeError::Timeout { command: command_line.clone(), after: timeout })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        return Err(NativeError::CallFailed {
            command: command_line,
            stderr: if stderr.is_empty() { output.status.to_string() } else { stderr },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Verify a binary exists either at the given path or in `PATH`.
///
/// # Errors
/// Returns [`NativeError::ClientNotFound`] if it cannot be located.
pub(crate) fn which_binary(path: &Path) -> Result<(), NativeError> {
    if path.is_absolute() {
        if path.exists() {
            return Ok(());
        }
        return Err(NativeError::ClientNotFound { path: path.to_owned() });
    }

    let found = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(path).exists()))
        .unwrap_or(false);

    if found {
        Ok(())
    } else {
        Err(NativeError::ClientNotFound { path: path.to_owned() })
    }
}

fn render<S: AsRef<str>>(binary: &Path, args: &[S]) -> String {
    let mut line = binary.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg.as_ref());
    }
    line
}
