//! Per-process watcher task.
//!
//! Every registered child gets one watcher. It owns the
//! [`tokio::process::Child`], drains its stdout/stderr line by line, waits
//! for it to exit, and carries out stop requests. Everything it observes is
//! forwarded as a [`WatchEvent`] to the registry's update loop, which is the
//! only place record state changes.

use std::time::Duration;

use kiln_core::lifecycle::ExecutionMode;
use kiln_core::types::WorkerId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::signal;

/// How a stop should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// SIGTERM now, SIGKILL once the grace period has passed.
    Graceful(Duration),
    /// SIGKILL now.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub(crate) enum WatchEventKind {
    Output(OutputStream),
    Exited(Option<i32>),
    Failed(String),
}

/// Something a watcher observed, tagged with the registration it belongs to.
#[derive(Debug)]
pub(crate) struct WatchEvent {
    pub worker_id: WorkerId,
    /// Distinguishes a re-registered worker from its predecessor.
    pub instance: u64,
    pub kind: WatchEventKind,
}

pub(crate) struct Watcher {
    pub worker_id: WorkerId,
    pub instance: u64,
    pub pid: u32,
    pub mode: ExecutionMode,
    pub events: mpsc::Sender<WatchEvent>,
}

impl Watcher {
    /// Watch `child` until it exits.
    pub async fn run(self, mut child: Child, stop_rx: oneshot::Receiver<StopSignal>) {
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut stop_rx = Some(stop_rx);
        let mut kill_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                line = next_line(&mut stdout) => match line {
                    Some(line) => self.on_output(OutputStream::Stdout, &line).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr) => match line {
                    Some(line) => self.on_output(OutputStream::Stderr, &line).await,
                    None => stderr = None,
                },
                status = child.wait() => {
                    let kind = match status {
                        Ok(status) => WatchEventKind::Exited(status.code()),
                        Err(e) => WatchEventKind::Failed(e.to_string()),
                    };
                    self.send(kind).await;
                    break;
                }
                request = recv_stop(&mut stop_rx) => {
                    stop_rx = None;
                    match request {
                        Some(StopSignal::Graceful(grace)) => {
                            if let Err(e) = signal::terminate(self.pid) {
                                tracing::warn!(
                                    worker_id = %self.worker_id,
                                    pid = self.pid,
                                    error = %e,
                                    "SIGTERM failed, killing immediately",
                                );
                                self.force_kill(&mut child);
                            } else {
                                kill_deadline = Some(Instant::now() + grace);
                            }
                        }
                        Some(StopSignal::Force) => self.force_kill(&mut child),
                        // Bookkeeping dropped without a signal: keep draining.
                        None => {}
                    }
                }
                _ = sleep_until(kill_deadline) => {
                    kill_deadline = None;
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        pid = self.pid,
                        "Process ignored SIGTERM, sending SIGKILL",
                    );
                    self.force_kill(&mut child);
                }
            }
        }
    }

    async fn on_output(&self, stream: OutputStream, line: &str) {
        tracing::debug!(
            worker_id = %self.worker_id,
            stream = ?stream,
            "{line}",
        );
        if self.mode == ExecutionMode::Server {
            self.send(WatchEventKind::Output(stream)).await;
        }
    }

    fn force_kill(&self, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            tracing::warn!(
                worker_id = %self.worker_id,
                pid = self.pid,
                error = %e,
                "Failed to kill process",
            );
        }
    }

    async fn send(&self, kind: WatchEventKind) {
        let event = WatchEvent {
            worker_id: self.worker_id.clone(),
            instance: self.instance,
            kind,
        };
        // A closed channel means the registry is gone; nothing to update.
        let _ = self.events.send(event).await;
    }
}

/// Next line from an optional stream; pends forever once the stream is gone.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// The pending stop request, if any; pends forever once consumed.
async fn recv_stop(rx: &mut Option<oneshot::Receiver<StopSignal>>) -> Option<StopSignal> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
