// vim: tw=80
//! Raid group driver
//!
//! Runs block operations against a raid group: generates each SIOTS, drives
//! its state machine, sends its member requests and feeds their completions
//! back in.

use std::{sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use serde_derive::{Deserialize, Serialize};
use tracing_futures::Instrument;

use crate::{
    block_op::BlockOperation,
    degraded::DegradedTracker,
    geometry::RaidGeometry,
    iots::{Iots, IotsSummary},
    memory::MemoryPool,
    siots::{FruCompletion, Siots},
    state::{self, ExecContext, StateStatus, WaitReason},
    transport::FruTransport,
    types::*,
    write_log::WriteLog,
};

fn default_max_alloc_attempts() -> u32 { 16 }
fn default_backoff_ms() -> u64 { 1 }
fn default_ride_through_ms() -> u64 { 100 }
fn default_max_retries() -> u32 { 3 }

/// How hard to try before giving up on a transient failure
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Consecutive page allocation failures tolerated per IOTS
    #[serde(default = "default_max_alloc_attempts")]
    pub max_alloc_attempts: u32,
    /// Delay before the first allocation retry.  It doubles with every
    /// further attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// How long to wait for a member that logged out
    #[serde(default = "default_ride_through_ms")]
    pub ride_through_ms: u64,
    /// Times a SIOTS may reissue member requests
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_alloc_attempts: default_max_alloc_attempts(),
            backoff_ms: default_backoff_ms(),
            ride_through_ms: default_ride_through_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicy {
    /// Delay before allocation attempt number `attempt`, counting from 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << shift))
    }

    pub fn ride_through(&self) -> Duration {
        Duration::from_millis(self.ride_through_ms)
    }
}

/// A raid group and everything it needs to run I/O
pub struct RaidGroup {
    geometry: RaidGeometry,
    tracker: Arc<dyn DegradedTracker>,
    memory: Arc<dyn MemoryPool>,
    transport: Arc<dyn FruTransport>,
    retry: RetryPolicy,
    write_log: Option<Arc<WriteLog>>,
}

impl RaidGroup {
    pub fn new(geometry: RaidGeometry,
               tracker: Arc<dyn DegradedTracker>,
               memory: Arc<dyn MemoryPool>,
               transport: Arc<dyn FruTransport>,
               retry: RetryPolicy) -> Self
    {
        let write_log = WriteLog::for_geometry(&geometry);
        RaidGroup{geometry, tracker, memory, transport, retry, write_log}
    }

    pub fn geometry(&self) -> &RaidGeometry {
        &self.geometry
    }

    pub fn tracker(&self) -> &Arc<dyn DegradedTracker> {
        &self.tracker
    }

    pub fn write_log(&self) -> Option<&Arc<WriteLog>> {
        self.write_log.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Decompose an operation into SIOTSs without issuing any I/O
    #[tracing::instrument(skip(self))]
    pub fn plan(&self, op: BlockOperation) -> Result<IotsSummary> {
        let iots = Iots::new(op, &self.geometry, &*self.tracker)?;
        iots.plan(&*self.tracker)
    }

    /// Run a block operation to completion
    #[tracing::instrument(skip(self))]
    pub async fn execute(&self, op: BlockOperation) -> Result<IotsSummary> {
        let mut iots = Iots::new(op, &self.geometry, &*self.tracker)?;
        let ctx = ExecContext {
            memory: &*self.memory,
            max_retries: self.retry.max_retries,
            write_log: self.write_log.as_ref(),
        };
        let mut alloc_attempts = 0;
        while iots.blocks_remaining() > 0 && !iots.is_failed() {
            let siots = iots.generate_next(&*self.tracker)?;
            match self.run(siots, &ctx).await {
                Ok(()) => {
                    alloc_attempts = 0;
                    iots.complete_current()?;
                }
                Err(e) if e.is_retryable() => {
                    iots.abandon_current()?;
                    alloc_attempts += 1;
                    if alloc_attempts >= self.retry.max_alloc_attempts {
                        tracing::error!(attempts = alloc_attempts,
                            "giving up on page allocation");
                        return Err(e);
                    }
                    let delay = self.retry.backoff(alloc_attempts);
                    tracing::warn!(lba = iots.current_lba(),
                        attempt = alloc_attempts, ?delay,
                        "No pages available; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e)
            }
        }
        iots.finish()
    }

    /// Replay every write log slot that may hold a torn write.
    ///
    /// Returns the number of slots flushed.
    #[tracing::instrument(skip(self))]
    pub async fn flush_write_log(&self) -> Result<usize> {
        let log = match self.write_log.as_ref() {
            Some(log) => log,
            None => return Ok(0)
        };
        let ctx = ExecContext {
            memory: &*self.memory,
            max_retries: self.retry.max_retries,
            write_log: Some(log),
        };
        let mut flushed = 0;
        while let Some(claim) = log.claim_flush() {
            let slot = claim.slot();
            let mut siots = Siots::flush(claim, self.geometry.width());
            let mut dead = (0..self.geometry.width())
                .filter(|p| self.tracker.is_rebuild_logging(*p));
            siots.dead_pos = dead.next();
            siots.dead_pos_2 = dead.next();
            tracing::debug!(slot, dead_pos = ?siots.dead_pos,
                "flushing write log slot");
            self.run(&mut siots, &ctx).await?;
            siots.status()?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Drive one SIOTS until it finishes.
    ///
    /// Returns `Err(ResourceExhausted)` if the SIOTS couldn't get pages before
    /// issuing any I/O.  A SIOTS that needs more pages later waits for them in
    /// place.
    async fn run(&self, siots: &mut Siots, ctx: &ExecContext<'_>) -> Result<()>
    {
        let mut alloc_attempts = 0;
        loop {
            match state::execute(siots, ctx) {
                StateStatus::Executing => (),
                StateStatus::Done => return Ok(()),
                StateStatus::Waiting(WaitReason::Memory)
                    if !siots.has_issued() =>
                {
                    return Err(Error::ResourceExhausted);
                }
                StateStatus::Waiting(WaitReason::Memory) => {
                    alloc_attempts += 1;
                    if alloc_attempts >= self.retry.max_alloc_attempts {
                        tracing::error!(lba = siots.lba,
                            attempts = alloc_attempts,
                            "giving up on page allocation");
                        siots.abort(Error::ResourceExhausted);
                        continue;
                    }
                    let delay = self.retry.backoff(alloc_attempts);
                    tracing::warn!(lba = siots.lba, attempt = alloc_attempts,
                        ?delay, "No pages available mid-SIOTS; waiting");
                    tokio::time::sleep(delay).await;
                }
                StateStatus::Waiting(WaitReason::FruIo) => {
                    self.dispatch(siots).await;
                }
                StateStatus::Waiting(WaitReason::RideThrough) => {
                    tracing::warn!(lba = siots.lba,
                        "Waiting for a member to return");
                    tokio::time::sleep(self.retry.ride_through()).await;
                }
                StateStatus::Waiting(WaitReason::WriteLogSlot) => {
                    tracing::debug!(lba = siots.lba,
                        "Waiting for a write log slot");
                    if let Some(log) = ctx.write_log {
                        log.wait_for_slot(self.retry.backoff(1)).await;
                    }
                }
            }
        }
    }

    /// Send a SIOTS's pending member requests and wait for all of them
    async fn dispatch(&self, siots: &mut Siots) {
        let mut pending = siots.take_outbox()
            .into_iter()
            .map(|request| {
                self.transport.submit(request)
                    .map(move |status| FruCompletion{request, status})
                    .in_current_span()
            }).collect::<FuturesUnordered<_>>();
        while let Some(completion) = pending.next().await {
            siots.complete_fru(completion);
        }
    }
}

// LCOV_EXCL_STOP
