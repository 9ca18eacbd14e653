// vim: tw=80
//! I/O transaction state
//!
//! An IOTS tracks one block operation from acceptance to completion.  It carves
//! the operation into SIOTSs in ascending LBA order.  At most one of them holds
//! pages at any time.

use std::collections::VecDeque;

use serde_derive::{Deserialize, Serialize};

use crate::{
    block_op::{BlockOperation, Opcode},
    degraded::{DegradedTracker, RebuildLoggingMask},
    generate::{GenerateContext, GenerateEngine},
    geometry::RaidGeometry,
    siots::{Siots, SiotsPlan},
    state::SiotsState,
    types::*,
};

/// What an IOTS did, once it's done
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IotsSummary {
    pub opcode: Opcode,
    pub lba: LbaT,
    pub blocks: BlockCount,
    pub siots: Vec<SiotsPlan>,
}

#[derive(Debug)]
pub struct Iots {
    op: BlockOperation,
    geometry: RaidGeometry,
    engine: GenerateEngine,
    blocks_remaining: BlockCount,
    current_lba: LbaT,
    siots: VecDeque<Siots>,
    rebuild_logging: RebuildLoggingMask,
    status: Result<()>,
    completed: Vec<SiotsPlan>,
}

impl Iots {
    /// Accept a block operation.
    ///
    /// The rebuild-logging mask is seeded from `tracker`.
    pub fn new(op: BlockOperation, geometry: &RaidGeometry,
               tracker: &dyn DegradedTracker) -> Result<Self>
    {
        let end = op.lba.checked_add(op.blocks);
        let fits = end.map(|e| e <= geometry.capacity()).unwrap_or(false);
        if op.blocks == 0 || !fits {
            tracing::debug!(lba = op.lba, blocks = op.blocks,
                capacity = geometry.capacity(), "rejecting request");
            return Err(Error::InvalidRequest);
        }
        if op.block_size != geometry.block_size() ||
            u64::from(op.optimal_block_size) != geometry.optimal_block_size()
        {
            tracing::debug!(block_size = op.block_size,
                optimal_block_size = op.optimal_block_size,
                "block sizes don't match the raid group");
            return Err(Error::InvalidRequest);
        }
        Ok(Iots {
            op,
            geometry: *geometry,
            engine: GenerateEngine::for_geometry(geometry),
            blocks_remaining: op.blocks,
            current_lba: op.lba,
            siots: VecDeque::new(),
            rebuild_logging: RebuildLoggingMask::from_tracker(tracker,
                geometry.width()),
            status: Ok(()),
            completed: Vec::new(),
        })
    }

    pub fn op(&self) -> &BlockOperation {
        &self.op
    }

    pub fn blocks_remaining(&self) -> BlockCount {
        self.blocks_remaining
    }

    pub fn current_lba(&self) -> LbaT {
        self.current_lba
    }

    pub fn rebuild_logging(&self) -> &RebuildLoggingMask {
        &self.rebuild_logging
    }

    /// Change the rebuild-logging state of one member for every SIOTS
    /// generated hereafter
    pub fn set_rebuild_logging(&mut self, position: Position, logging: bool) {
        self.rebuild_logging.set(position, logging);
    }

    /// Has a SIOTS failed?
    pub fn is_failed(&self) -> bool {
        self.status.is_err()
    }

    /// Number of SIOTSs generated but not yet retired
    pub fn queued(&self) -> usize {
        self.siots.len()
    }

    /// Generate the next SIOTS and append it to the queue.
    ///
    /// Generation failures don't make this return an error.  Instead the
    /// SIOTS is left in a failure state, and executing it reports the error.
    pub fn generate_next(&mut self, tracker: &dyn DegradedTracker)
        -> Result<&mut Siots>
    {
        if self.blocks_remaining == 0 || self.is_failed() {
            tracing::error!(lba = self.current_lba,
                "no blocks left to generate");
            return Err(Error::InvariantViolation);
        }
        if self.siots.iter().any(Siots::has_pages) {
            tracing::error!(lba = self.current_lba,
                "generating while another SIOTS holds pages");
            return Err(Error::InvariantViolation);
        }
        let mut siots = Siots::new(self.op.opcode, self.current_lba,
            self.blocks_remaining, self.geometry.width());
        let ctx = GenerateContext {
            geometry: &self.geometry,
            tracker,
            rebuild_logging: &self.rebuild_logging,
            pre_read: self.op.pre_read,
        };
        self.engine.generate_start(&mut siots, &ctx);
        if !siots.state.is_error() {
            if siots.xfer == 0 || siots.xfer > self.blocks_remaining {
                tracing::error!(lba = siots.lba, xfer = siots.xfer,
                    blocks_remaining = self.blocks_remaining,
                    "generate made no progress");
                siots.error = Some(Error::InvariantViolation);
                siots.state = SiotsState::UnexpectedError;
            } else {
                self.current_lba += siots.xfer;
                self.blocks_remaining -= siots.xfer;
            }
        }
        self.siots.push_back(siots);
        self.siots.back_mut().ok_or(Error::InvariantViolation)
    }

    /// The oldest SIOTS still queued
    pub fn current(&mut self) -> Option<&mut Siots> {
        self.siots.front_mut()
    }

    /// Retire the oldest SIOTS, which must have finished.  Its pages are
    /// released and its error, if any, becomes the IOTS's status.
    pub fn complete_current(&mut self) -> Result<()> {
        let mut siots = self.siots.pop_front()
            .ok_or(Error::InvariantViolation)?;
        if !siots.state.is_finished() {
            tracing::error!(lba = siots.lba, state = ?siots.state,
                "retiring an unfinished SIOTS");
            self.siots.push_front(siots);
            return Err(Error::InvariantViolation);
        }
        siots.release();
        match siots.status() {
            Ok(()) => self.completed.push(siots.plan()),
            Err(e) => {
                if self.status.is_ok() {
                    self.status = Err(e);
                }
            }
        }
        Ok(())
    }

    /// Discard the newest SIOTS, which must not have issued any I/O, and
    /// credit its blocks back so they will be generated again.
    pub fn abandon_current(&mut self) -> Result<()> {
        let mut siots = self.siots.pop_back()
            .ok_or(Error::InvariantViolation)?;
        if siots.outstanding() > 0 || siots.has_issued() {
            tracing::error!(lba = siots.lba,
                "abandoning a SIOTS that issued I/O");
            self.siots.push_back(siots);
            return Err(Error::InvariantViolation);
        }
        siots.release();
        if !siots.state.is_error() {
            self.current_lba -= siots.xfer;
            self.blocks_remaining += siots.xfer;
        }
        tracing::debug!(lba = siots.lba, xfer = siots.xfer, "abandoned SIOTS");
        Ok(())
    }

    /// Generate every SIOTS without executing any of them
    pub fn plan(mut self, tracker: &dyn DegradedTracker)
        -> Result<IotsSummary>
    {
        while self.blocks_remaining > 0 {
            let siots = self.generate_next(tracker)?;
            match siots.state {
                SiotsState::InvalidOpcode =>
                    return Err(Error::UnrecognizedOpcode),
                SiotsState::UnexpectedError => {
                    return Err(siots.error
                        .unwrap_or(Error::InvariantViolation));
                }
                _ => ()
            }
            let plan = siots.plan();
            self.siots.pop_back();
            self.completed.push(plan);
        }
        self.finish()
    }

    /// Tear down the IOTS and report its final status
    pub fn finish(self) -> Result<IotsSummary> {
        if !self.siots.is_empty() ||
            (self.blocks_remaining != 0 && self.status.is_ok())
        {
            tracing::error!(lba = self.op.lba, queued = self.siots.len(),
                blocks_remaining = self.blocks_remaining,
                "destroying an unfinished IOTS");
            return Err(Error::InvariantViolation);
        }
        self.status?;
        Ok(IotsSummary {
            opcode: self.op.opcode,
            lba: self.op.lba,
            blocks: self.op.blocks,
            siots: self.completed,
        })
    }
}

// LCOV_EXCL_STOP
