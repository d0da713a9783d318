//! The archive stream pipeline.
//!
//! One invocation owns one compression subprocess and relays its stdout to
//! an HTTP response body in bounded chunks. The relay loop alternates
//! strictly between reading one chunk and handing it to a bounded channel,
//! so memory in flight is O(chunk size) regardless of archive size — the
//! channel send is the backpressure point, and it only completes once the
//! HTTP body has drained the previous chunk into the transport.
//!
//! ## Cleanup guarantee
//!
//! [`relay`] never returns before the subprocess has been reaped. On normal
//! end-of-stream the child is awaited, with shutdown able to interrupt the
//! wait and escalate to a kill; on every other path (client gone, read
//! error, cancellation, timeout, non-zero exit) it is killed first and
//! then awaited. `kill_on_drop` backs this up if the relay task itself is
//! torn down.

use std::io;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Chunks buffered between the relay loop and the HTTP body. One is enough:
/// a larger buffer only delays disconnect detection and grows memory.
pub const CHUNK_CHANNEL_CAPACITY: usize = 1;

/// At most this much compressor stderr is retained for failure logs.
const STDERR_CAPTURE_LIMIT: u64 = 64 * 1024;

/// Sending half of the chunk channel; the receiving half feeds the HTTP
/// body. An `Err` item makes the transport abort the body without a clean
/// end-of-stream marker, which clients see as a truncated download.
pub type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

/// Terminal state of one archive transfer. Either way, the subprocess has
/// been reaped by the time a relay reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The compressor finished cleanly and every chunk was delivered.
    Completed,
    /// The transfer was cut short: compressor failure, client disconnect,
    /// cancellation, or timeout.
    Aborted,
}

/// How the read/send loop stopped; [`relay`] turns this into cleanup
/// actions and a [`StreamEnd`].
enum PumpEnd {
    /// The compressor closed its stdout; all output was forwarded.
    Eof,
    /// The chunk channel is closed: the client went away.
    ClientGone,
    /// The shared cancellation token fired (server shutdown).
    Cancelled,
    /// The configured stream timeout elapsed.
    TimedOut,
    /// Reading the compressor's stdout failed.
    ReadError(io::Error),
}

/// Launches the compression subprocess for one archive request.
///
/// The compressor runs with the base directory as its working directory and
/// receives the identifier as a literal argument — never through a shell.
/// Stdout is piped to the relay; stderr is piped separately and only ever
/// logged.
///
/// # Errors
///
/// Returns [`Error::Spawn`] when the executable is missing or cannot be
/// started. No response bytes have been produced at that point.
pub fn spawn_compressor(config: &ServerConfig, identifier: &str) -> Result<Child> {
    Command::new(&config.zip_bin)
        .arg("-r")
        .arg("-")
        .arg(identifier)
        .current_dir(&config.base_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Spawn {
            program: config.zip_bin.display().to_string(),
            source,
        })
}

/// Relays compressor output to the chunk channel and enforces the cleanup
/// guarantee.
///
/// Runs the read/send loop until end-of-stream or interruption, then — on
/// every path — reaps the subprocess, killing it first if it has not
/// already exited. Stderr is drained concurrently and logged when the
/// compressor fails.
///
/// # Behavior
///
/// - Chunks are forwarded in read order; there is exactly one reader and
///   one channel, so no reordering is possible.
/// - On end-of-stream with a zero exit status, the sender is dropped,
///   which the transport translates into a clean end-of-body.
/// - On any failure after streaming began, a final `Err` chunk is offered
///   so the transport aborts the body instead of ending it cleanly.
pub async fn relay(
    mut child: Child,
    identifier: &str,
    chunk_tx: ChunkSender,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> StreamEnd {
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(capture_stderr(s)));

    let end = pump(&mut child, identifier, &chunk_tx, config, &cancel).await;

    // Unconditional cleanup: observe the exit status, forcing it if the
    // child is still running. After this point no process outlives us.
    let natural_exit = matches!(end, PumpEnd::Eof);
    let status = reap(&mut child, natural_exit, &cancel).await;

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    match end {
        PumpEnd::Eof => match status {
            Ok(status) if status.success() => {
                tracing::info!("archive {identifier} was successfully downloaded");
                StreamEnd::Completed
            }
            Ok(status) => {
                tracing::error!(
                    "compressor for {identifier} exited with {status}: {}",
                    String::from_utf8_lossy(&stderr).trim_end()
                );
                abort_body(&chunk_tx, format!("compressor exited with {status}")).await;
                StreamEnd::Aborted
            }
            Err(e) => {
                tracing::error!("failed to reap compressor for {identifier}: {e}");
                abort_body(&chunk_tx, "compressor could not be reaped".to_string()).await;
                StreamEnd::Aborted
            }
        },
        PumpEnd::ClientGone => {
            tracing::warn!("download of {identifier} was interrupted");
            StreamEnd::Aborted
        }
        PumpEnd::Cancelled => {
            tracing::warn!("archive stream for {identifier} cancelled by shutdown");
            abort_body(&chunk_tx, "server is shutting down".to_string()).await;
            StreamEnd::Aborted
        }
        PumpEnd::TimedOut => {
            tracing::error!("archive stream for {identifier} exceeded the configured timeout");
            abort_body(&chunk_tx, "archive stream timed out".to_string()).await;
            StreamEnd::Aborted
        }
        PumpEnd::ReadError(e) => {
            tracing::error!("reading compressor output for {identifier} failed: {e}");
            abort_body(&chunk_tx, format!("compressor read failed: {e}")).await;
            StreamEnd::Aborted
        }
    }
}

/// The strictly alternating read/send loop.
async fn pump(
    child: &mut Child,
    identifier: &str,
    chunk_tx: &ChunkSender,
    config: &ServerConfig,
    cancel: &CancellationToken,
) -> PumpEnd {
    let Some(mut stdout) = child.stdout.take() else {
        return PumpEnd::ReadError(io::Error::other("compressor stdout was not captured"));
    };
    let deadline = config.stream_timeout.map(|limit| Instant::now() + limit);
    let mut buf = vec![0u8; config.chunk_size];

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return PumpEnd::Cancelled,
            () = sleep_until_deadline(deadline) => return PumpEnd::TimedOut,
            read = stdout.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => return PumpEnd::ReadError(e),
        };

        if let Some(pause) = config.throttle {
            tokio::select! {
                () = cancel.cancelled() => return PumpEnd::Cancelled,
                () = sleep_until_deadline(deadline) => return PumpEnd::TimedOut,
                () = tokio::time::sleep(pause) => {}
            }
        }

        tracing::debug!("sending {identifier} archive chunk ({n} bytes)");
        // The send blocks while the transport drains the previous chunk;
        // a shutdown or deadline must be able to interrupt that wait too.
        tokio::select! {
            () = cancel.cancelled() => return PumpEnd::Cancelled,
            () = sleep_until_deadline(deadline) => return PumpEnd::TimedOut,
            sent = chunk_tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))) => {
                if sent.is_err() {
                    return PumpEnd::ClientGone;
                }
            }
        }
    }
}

/// Observes the child's exit status, killing it first unless it is already
/// on its way out after closing stdout. Even that natural wait stays
/// interruptible: a shutdown signal escalates it to a kill, so cleanup
/// latency is bounded on every path.
async fn reap(
    child: &mut Child,
    natural_exit: bool,
    cancel: &CancellationToken,
) -> io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }
    if natural_exit {
        tokio::select! {
            status = child.wait() => return status,
            () = cancel.cancelled() => {}
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

/// Pends forever when no timeout is configured.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Best-effort injection of an `Err` chunk so the transport truncates the
/// body. Ignored when the client is already gone.
async fn abort_body(chunk_tx: &ChunkSender, reason: String) {
    let _ = chunk_tx
        .send(Err(io::Error::other(Error::Aborted { reason })))
        .await;
}

/// Drains the compressor's stderr into a bounded buffer for failure logs.
async fn capture_stderr(stderr: ChildStderr) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = stderr
        .take(STDERR_CAPTURE_LIMIT)
        .read_to_end(&mut buf)
        .await;
    buf
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Installs an executable shell script standing in for `zip`. The
    /// script receives `-r - <identifier>` but most fakes ignore it.
    fn fake_compressor(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-zip");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_with(dir: &TempDir, script: &str) -> ServerConfig {
        let mut config = ServerConfig::new(dir.path());
        config.zip_bin = fake_compressor(dir, script);
        config
    }

    async fn collect_ok(mut rx: mpsc::Receiver<io::Result<Bytes>>) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        let mut aborted = false;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => body.extend_from_slice(&chunk),
                Err(_) => aborted = true,
            }
        }
        (body, aborted)
    }

    #[tokio::test]
    async fn chunks_arrive_in_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&dir, "i=0; while [ $i -lt 100 ]; do echo chunk-$i; i=$((i+1)); done");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let collector = tokio::spawn(collect_ok(rx));

        let end = relay(child, "any", tx, &config, CancellationToken::new()).await;
        assert_eq!(end, StreamEnd::Completed);

        let (body, aborted) = collector.await.unwrap();
        assert!(!aborted);
        let expected: String = (0..100).map(|i| format!("chunk-{i}\n")).collect();
        assert_eq!(body, expected.as_bytes());
    }

    #[tokio::test]
    async fn failing_compressor_truncates_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&dir, "echo partial; echo boom >&2; exit 12");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let collector = tokio::spawn(collect_ok(rx));

        let end = relay(child, "any", tx, &config, CancellationToken::new()).await;
        assert_eq!(end, StreamEnd::Aborted);

        let (body, aborted) = collector.await.unwrap();
        // Already flushed bytes cannot be retracted; the stream must end
        // with an error so the transport truncates instead of finalizing.
        assert_eq!(body, b"partial\n");
        assert!(aborted);
    }

    #[tokio::test]
    async fn disconnected_client_kills_the_compressor() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&dir, "while :; do echo y; done");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let relay_task = {
            let config = config.clone();
            tokio::spawn(async move {
                relay(child, "any", tx, &config, CancellationToken::new()).await
            })
        };

        // Take one chunk, then hang up.
        assert!(rx.recv().await.is_some());
        drop(rx);

        // relay only returns once the child has been killed and reaped.
        let end = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay did not clean up after disconnect")
            .unwrap();
        assert_eq!(end, StreamEnd::Aborted);
    }

    #[tokio::test]
    async fn abort_errors_carry_the_taxonomy() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&dir, "exit 7");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let end = relay(child, "any", tx, &config, CancellationToken::new()).await;
        assert_eq!(end, StreamEnd::Aborted);

        let err = rx.recv().await.unwrap().unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|source| source.downcast_ref::<Error>());
        assert!(matches!(inner, Some(Error::Aborted { .. })), "got {err:?}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_client_stalls_the_compressor() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("progress");
        // Ten 256 KiB blocks, logging after each one. The OS pipe plus the
        // one-chunk channel bound how far the compressor can run ahead of
        // an idle consumer.
        let script = format!(
            "i=0\n\
             while [ $i -lt 10 ]; do\n\
             dd if=/dev/zero bs=262144 count=1 2>/dev/null\n\
             echo block-$i >> {progress}\n\
             i=$((i+1))\n\
             done",
            progress = progress.display()
        );
        let mut config = config_with(&dir, &script);
        config.chunk_size = 262_144;

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let relay_task = {
            let config = config.clone();
            tokio::spawn(async move {
                relay(child, "any", tx, &config, CancellationToken::new()).await
            })
        };

        // Hold the receiver idle; the producer must stop within a couple
        // of blocks instead of racing to the end.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stalled = std::fs::read_to_string(&progress)
            .unwrap_or_default()
            .lines()
            .count();
        assert!(
            stalled <= 4,
            "compressor wrote {stalled} blocks against an idle consumer"
        );

        let mut total = 0usize;
        while let Some(item) = rx.recv().await {
            total += item.unwrap().len();
        }
        assert_eq!(total, 10 * 262_144);
        assert_eq!(relay_task.await.unwrap(), StreamEnd::Completed);

        let finished = std::fs::read_to_string(&progress).unwrap().lines().count();
        assert_eq!(finished, 10);
    }

    #[tokio::test]
    async fn cancellation_interrupts_post_eof_wait() {
        let dir = tempfile::tempdir().unwrap();
        // Closes stdout but keeps running; the relay must not wait out the
        // sleep once shutdown is signalled.
        let config = config_with(&dir, "echo tail; exec 1>&-; exec sleep 600");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let relay_task = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay(child, "any", tx, &config, cancel).await })
        };

        assert!(rx.recv().await.is_some());
        // Give the relay a moment to reach the post-EOF wait, then shut
        // down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let end = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay kept waiting for a lingering compressor")
            .unwrap();
        assert_eq!(end, StreamEnd::Aborted);
        drop(rx);
    }

    #[tokio::test]
    async fn cancellation_interrupts_throttle_pause() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(&dir, "echo y");
        config.throttle = Some(Duration::from_secs(600));

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, _rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let relay_task = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay(child, "any", tx, &config, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let end = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay slept out the throttle after cancellation")
            .unwrap();
        assert_eq!(end, StreamEnd::Aborted);
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(&dir, "while :; do echo y; sleep 1; done");

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let relay_task = {
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { relay(child, "any", tx, &config, cancel).await })
        };

        assert!(rx.recv().await.is_some());
        cancel.cancel();

        let end = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay did not honor cancellation")
            .unwrap();
        assert_eq!(end, StreamEnd::Aborted);
    }

    #[tokio::test]
    async fn stream_timeout_aborts_long_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with(&dir, "echo start; exec sleep 600");
        config.stream_timeout = Some(Duration::from_millis(200));

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let collector = tokio::spawn(collect_ok(rx));

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            relay(child, "any", tx, &config, CancellationToken::new()),
        )
        .await
        .expect("relay did not honor the stream timeout");
        assert_eq!(end, StreamEnd::Aborted);

        let (_, aborted) = collector.await.unwrap();
        assert!(aborted);
    }

    #[tokio::test]
    async fn throttle_spaces_out_chunks() {
        let dir = tempfile::tempdir().unwrap();
        // 64 bytes of output against an 8-byte chunk size forces at least
        // 8 reads, each preceded by the throttle pause.
        let mut config = config_with(&dir, "printf '%064d' 0");
        config.chunk_size = 8;
        config.throttle = Some(Duration::from_millis(20));

        let child = spawn_compressor(&config, "any").unwrap();
        let (tx, mut rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let relay_task = {
            let config = config.clone();
            tokio::spawn(async move {
                relay(child, "any", tx, &config, CancellationToken::new()).await
            })
        };

        let started = std::time::Instant::now();
        let mut chunks = 0usize;
        while let Some(item) = rx.recv().await {
            item.unwrap();
            chunks += 1;
        }
        assert!(chunks >= 8, "expected >= 8 chunks, got {chunks}");
        assert!(
            started.elapsed() >= Duration::from_millis(20) * chunks as u32,
            "throttle was not applied"
        );
        assert_eq!(relay_task.await.unwrap(), StreamEnd::Completed);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::new(dir.path());
        config.zip_bin = dir.path().join("no-such-zip");

        let err = spawn_compressor(&config, "any").unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
