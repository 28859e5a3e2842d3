// Shared helpers for child-process output capture.
use tokio::io::{AsyncRead, AsyncReadExt};

/// Drain one std stream of a child to a lossy string. Run on its own task
/// so a full pipe never dead-locks against waiting on the child.
pub(crate) async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_string()
}

pub(crate) fn merge_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    }
}
