use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PortStream;
use crate::error::{Result, ScanError};
use crate::types::{EngineKind, OpenPortRecord};

const CHANNEL_CAPACITY: usize = 256;
const STDERR_LIMIT: u64 = 8 * 1024;
/// Longest stdout line handed to a parser. Longer lines are dropped.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Spawn `cmd` and stream the records `parse` extracts from each stdout line.
///
/// Lines that are not UTF-8, exceed [`MAX_LINE_BYTES`] or fail to parse are
/// logged and skipped. The child is killed as soon as `cancel` fires or the
/// stream is dropped.
pub(crate) fn stream_lines<P>(
    mut cmd: Command,
    engine: EngineKind,
    cancel: CancellationToken,
    mut parse: P,
) -> Result<PortStream>
where
    P: FnMut(&str) -> Result<Vec<OpenPortRecord>> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(%engine, command = ?cmd.as_std(), "spawning engine");

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ScanError::EngineUnavailable {
            engine,
            reason: e.to_string(),
        },
        _ => ScanError::execution(engine, format!("failed to start: {e}")),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ScanError::Internal("child stdout not captured".into()))?;
    let stderr = child.stderr.take().map(|err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.take(STDERR_LIMIT).read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).trim().to_string()
        })
    });

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill(&mut child, engine).await;
                    let _ = tx.send(Err(ScanError::Cancelled)).await;
                    return;
                }
                read = read_line(&mut reader, &mut buf) => read,
            };
            let line = match read {
                Ok(Line::Complete) => match std::str::from_utf8(&buf) {
                    Ok(text) => text.trim_end_matches(['\n', '\r']),
                    Err(e) => {
                        warn!(%engine, "skipping undecodable output line: {e}");
                        continue;
                    }
                },
                Ok(Line::Oversized(len)) => {
                    warn!(%engine, len, "skipping oversized output line");
                    continue;
                }
                Ok(Line::Eof) => break,
                Err(e) => {
                    kill(&mut child, engine).await;
                    let _ = tx
                        .send(Err(ScanError::execution(engine, format!("reading output: {e}"))))
                        .await;
                    return;
                }
            };
            match parse(line) {
                Ok(records) => {
                    for rec in records {
                        if tx.send(Ok(rec)).await.is_err() {
                            // Consumer went away; dropping `child` kills it.
                            return;
                        }
                    }
                }
                Err(e) => warn!(%engine, "skipping output line: {e}"),
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill(&mut child, engine).await;
                let _ = tx.send(Err(ScanError::Cancelled)).await;
                return;
            }
            status = child.wait() => status,
        };
        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(s) if s.success() => debug!(%engine, "engine exited cleanly"),
            Ok(s) => {
                let mut msg = format!("exited with {s}");
                if !stderr.is_empty() {
                    msg.push_str(": ");
                    msg.push_str(&stderr);
                }
                let _ = tx.send(Err(ScanError::execution(engine, msg))).await;
            }
            Err(e) => {
                let _ = tx
                    .send(Err(ScanError::execution(engine, format!("wait failed: {e}"))))
                    .await;
            }
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

enum Line {
    /// `buf` holds one line, newline included if there was one.
    Complete,
    /// A line longer than [`MAX_LINE_BYTES`] was consumed and discarded.
    Oversized(usize),
    Eof,
}

/// Read the next raw line into `buf` without buffering more than
/// [`MAX_LINE_BYTES`] of it.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let cap = MAX_LINE_BYTES as u64 + 1;
    let n = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.len() <= MAX_LINE_BYTES || buf.last() == Some(&b'\n') {
        return Ok(Line::Complete);
    }

    let mut len = buf.len();
    loop {
        buf.clear();
        let n = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
        len += n;
        if n == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Line::Oversized(len))
}

async fn kill(child: &mut Child, engine: EngineKind) {
    if let Err(e) = child.start_kill() {
        debug!(%engine, "kill: {e}");
    }
    let _ = child.wait().await;
}
