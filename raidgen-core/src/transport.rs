// vim: tw=80
//! Delivery of per-drive requests to the member drives

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Mutex, PoisonError},
};

use futures::future;
#[cfg(test)] use mockall::automock;

use crate::{
    siots::{FruRequest, FruStatus},
    types::*,
};

pub type FruFut = Pin<Box<dyn Future<Output = FruStatus> + Send>>;

/// Something that can send a request to a member drive
#[cfg_attr(test, automock)]
pub trait FruTransport: Send + Sync {
    /// Send one request.  The returned future completes when the member does.
    fn submit(&self, request: FruRequest) -> FruFut;
}

#[derive(Debug, Default)]
struct Faults {
    /// Statuses to return for the next requests to each position, in order
    once: BTreeMap<Position, VecDeque<FruStatus>>,
    /// Status to return for every request to a position
    always: BTreeMap<Position, FruStatus>,
}

/// A transport that completes every request immediately and records it.
///
/// Failures can be injected per position.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    log: Mutex<Vec<FruRequest>>,
    faults: Mutex<Faults>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the next request sent to `position` with `status`.  Calls
    /// queue up.
    pub fn fail_next(&self, position: Position, status: FruStatus) {
        let mut faults = self.faults.lock()
            .unwrap_or_else(PoisonError::into_inner);
        faults.once.entry(position).or_default().push_back(status);
    }

    /// Complete every request sent to `position` with `status`
    pub fn fail_always(&self, position: Position, status: FruStatus) {
        let mut faults = self.faults.lock()
            .unwrap_or_else(PoisonError::into_inner);
        faults.always.insert(position, status);
    }

    /// Forget every fault injected for `position`
    pub fn heal(&self, position: Position) {
        let mut faults = self.faults.lock()
            .unwrap_or_else(PoisonError::into_inner);
        faults.once.remove(&position);
        faults.always.remove(&position);
    }

    /// Every request received so far, in order of submission
    pub fn requests(&self) -> Vec<FruRequest> {
        self.log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take every request received so far
    pub fn drain(&self) -> Vec<FruRequest> {
        std::mem::take(&mut *self.log.lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn status(&self, position: Position) -> FruStatus {
        let mut faults = self.faults.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = faults.once.get_mut(&position)
            .and_then(VecDeque::pop_front)
        {
            return s;
        }
        faults.always.get(&position)
            .copied()
            .unwrap_or(FruStatus::Success)
    }
}

impl FruTransport for RecordingTransport {
    fn submit(&self, request: FruRequest) -> FruFut {
        let status = self.status(request.position);
        if status != FruStatus::Success {
            tracing::debug!(position = request.position, lba = request.lba,
                ?status, "injected fault");
        }
        self.log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Box::pin(future::ready(status))
    }
}

// LCOV_EXCL_STOP
