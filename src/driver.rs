//! Driver spawns and manages the encode task

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::recode::{FrameCoder, FrameOutcome, FrameReport, RecodeBudget, RecodeLoop};
use crate::session::SessionHandle;
use crate::source::FrameSource;
use crate::{BrcError, Operation, Result};

/// Retry policy for source errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Consecutive source errors tolerated before the task gives up
    pub max_source_errors: u32,
    /// First backoff delay; doubles per consecutive error up to 32x
    pub backoff_base: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self { max_source_errors: 10, backoff_base: Duration::from_millis(50) }
    }
}

impl DriverOptions {
    fn backoff(&self, error_count: u32) -> Duration {
        self.backoff_base * (1 << error_count.min(5))
    }
}

/// Why the encode task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverExit {
    SourceEnded,
    Cancelled,
    SourceFailed,
    BrcFailed,
}

/// Totals of one driver run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub frames: u64,
    pub accepted: u64,
    pub padded: u64,
    pub skipped: u64,
    /// Frames finished by a panic the recode loop imposed
    pub forced: u64,
    /// Update calls over all frames
    pub attempts: u64,
    pub bytes: u64,
    pub exit: DriverExit,
    /// Last error, for failed exits
    pub error: Option<String>,
}

impl DriverSummary {
    fn new() -> Self {
        Self {
            frames: 0,
            accepted: 0,
            padded: 0,
            skipped: 0,
            forced: 0,
            attempts: 0,
            bytes: 0,
            exit: DriverExit::SourceEnded,
            error: None,
        }
    }

    fn record(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.attempts += report.attempts() as u64;
        self.bytes += u64::from(report.final_size);
        self.forced += u64::from(report.forced);
        match report.outcome {
            FrameOutcome::Accepted => self.accepted += 1,
            FrameOutcome::Padded => self.padded += 1,
            FrameOutcome::Skipped => self.skipped += 1,
        }
    }

    fn fail(&mut self, exit: DriverExit, error: &BrcError) {
        self.exit = exit;
        self.error = Some(error.to_string());
    }
}

/// Result of spawning the encode task
pub struct DriverChannels {
    /// Receiver for the latest finished frame
    pub reports: watch::Receiver<Option<Arc<FrameReport>>>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
    task: JoinHandle<DriverSummary>,
}

impl DriverChannels {
    /// Stream of finished frames.
    ///
    /// Backed by a watch channel: a slow consumer sees the latest report and
    /// skips intermediate ones. Ends when the encode task stops.
    pub fn report_stream(&self) -> impl Stream<Item = Arc<FrameReport>> + Send + 'static {
        WatchStream::new(self.reports.clone()).filter_map(|report| report)
    }

    /// Wait for the source to end or the task to fail.
    pub async fn finish(self) -> Result<DriverSummary> {
        self.task.await.map_err(|e| BrcError::encoder_with_source("encode task panicked", Box::new(e)))
    }

    /// Stop after the frame in flight and wait for the task.
    ///
    /// The session is quiescent afterwards, ready for reset or close.
    pub async fn drain(self) -> Result<DriverSummary> {
        self.cancel.cancel();
        self.finish().await
    }
}

/// Driver spawns and manages the encode task
///
/// The task owns the source and the coder and shares the session through a
/// [`SessionHandle`]. Each frame runs through the recode loop with the session
/// locked, so cancellation only ever lands between frames.
pub struct EncodeDriver;

impl EncodeDriver {
    /// Spawn the encode task with default retry options
    pub fn spawn<S, C>(handle: SessionHandle, source: S, coder: C, budget: RecodeBudget) -> DriverChannels
    where
        S: FrameSource,
        C: FrameCoder + Send + 'static,
    {
        Self::spawn_with(handle, source, coder, budget, DriverOptions::default())
    }

    /// Spawn the encode task
    ///
    /// Returns a watch receiver for frame reports, a cancellation token and the
    /// task's join handle wrapped in [`DriverChannels`].
    pub fn spawn_with<S, C>(
        handle: SessionHandle,
        source: S,
        coder: C,
        budget: RecodeBudget,
        options: DriverOptions,
    ) -> DriverChannels
    where
        S: FrameSource,
        C: FrameCoder + Send + 'static,
    {
        let (report_tx, report_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        let task = tokio::spawn(async move {
            Self::encode_task(handle, source, coder, RecodeLoop::new(budget), options, report_tx, cancel_task).await
        });

        DriverChannels { reports: report_rx, cancel, task }
    }

    /// Encode task - pulls frames and runs them through the recode loop
    async fn encode_task<S, C>(
        handle: SessionHandle,
        mut source: S,
        mut coder: C,
        recode: RecodeLoop,
        options: DriverOptions,
        report_tx: watch::Sender<Option<Arc<FrameReport>>>,
        cancel: CancellationToken,
    ) -> DriverSummary
    where
        S: FrameSource,
        C: FrameCoder + Send + 'static,
    {
        info!(
            frame_rate = source.frame_rate(),
            max_recode = recode.budget().max_recode,
            "Encode task started"
        );
        let mut summary = DriverSummary::new();
        let mut error_count = 0u32;

        loop {
            // Check for cancellation between frames
            if cancel.is_cancelled() {
                info!("Encode task cancelled");
                summary.exit = DriverExit::Cancelled;
                break;
            }

            // Use select to allow cancellation while waiting on the source
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Encode task cancelled while waiting for a frame");
                    summary.exit = DriverExit::Cancelled;
                    break;
                }
                result = source.next_frame() => result,
            };

            match result {
                Ok(Some(descriptor)) => {
                    error_count = 0;
                    trace!(frame = descriptor.encoded_order, "Frame received");

                    let outcome = handle
                        .with(Operation::FrameControl, |session| recode.run_frame(session, &mut coder, descriptor));
                    match outcome {
                        Ok(report) => {
                            summary.record(&report);
                            report_tx.send_replace(Some(Arc::new(report)));
                        }
                        Err(e) => {
                            // Rate-control state is no longer trustworthy
                            error!(frame = descriptor.encoded_order, error = %e, "Frame failed, stopping encode");
                            summary.fail(DriverExit::BrcFailed, &e);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!(frames = summary.frames, "Source ended");
                    summary.exit = DriverExit::SourceEnded;
                    break;
                }
                Err(e) => {
                    // Source error - don't give up on transient failures
                    error_count += 1;
                    warn!("Source error ({}/{}): {}", error_count, options.max_source_errors, e);

                    if error_count >= options.max_source_errors {
                        error!("Too many source errors, shutting down");
                        summary.fail(DriverExit::SourceFailed, &e);
                        break;
                    }

                    let backoff = options.backoff(error_count);
                    debug!(?backoff, "Backing off before the next read");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(
            frames = summary.frames,
            attempts = summary.attempts,
            skipped = summary.skipped,
            padded = summary.padded,
            exit = ?summary.exit,
            "Encode task ended"
        );
        summary
    }
}
