// vim: tw=80
//! SIOTS state machines
//!
//! Every algorithm runs a fixed, ordered sequence of states.  A state either
//! advances the SIOTS and asks to keep executing, or blocks on something
//! external and asks to be called again later at the same state.  The only
//! way back to an earlier point is through a family's `Retry` state.

use std::sync::Arc;

use crate::{
    memory::{MemoryPool, PageRequest, ResourceShape},
    siots::{Algorithm, FruCompletion, FruExtent, FruOpcode, FruRequest,
            FruStatus, Siots},
    types::*,
    write_log::{select_header, HeaderVerdict, WriteLog},
};

/// Result of running a state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateStatus {
    /// Run the next state immediately
    Executing,
    /// Blocked.  Execute the SIOTS again once the reason is resolved.
    Waiting(WaitReason),
    /// The SIOTS reached a terminal state
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitReason {
    /// Pages could not be allocated yet
    Memory,
    /// Member requests are outstanding
    FruIo,
    /// A member logged out.  Wait for it to return before retrying.
    RideThrough,
    /// Every write log slot is busy
    WriteLogSlot,
}

/// Which I/O phase a retry returns to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    Reads,
    Writes,
    /// Journal writes to the write log
    Journal,
}

/// `R5_RD`, `R5_SM_RD`, `RAID0_RD`, `MIRROR_RD`, `RG_CHECK_ZEROED`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadState {
    Allocate,
    IssueReads,
    ReadsComplete,
    Retry,
    Finish,
}

/// `R5_DEG_RD`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DegradedReadState {
    Allocate,
    /// Read the requested data from the survivors, along with everything
    /// needed to rebuild the dead member's portion
    IssueReads,
    ReadsComplete,
    Reconstruct,
    Retry,
    Finish,
}

/// `R5_468`, `R5_SMALL_468`, `R5_MR3`, `R5_RCW`, `R5_CORRUPT_DATA`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteState {
    Allocate,
    IssuePreReads,
    PreReadsComplete,
    ComputeParity,
    /// Claim a write log slot.  Only for journaled writes.
    ClaimSlot,
    IssueJournalWrites,
    JournalWritesComplete,
    /// Record the slot's header once its data is durable
    CommitJournal,
    IssueWrites,
    WritesComplete,
    /// Invalidate and free the write log slot
    ReleaseSlot,
    Retry(Resume),
    Finish,
}

/// `MIRROR_WR`, `MIRROR_CORRUPT_DATA`, `RAID0_WR`, `RG_ZERO`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MirrorWriteState {
    Allocate,
    IssueWrites,
    WritesComplete,
    Retry,
    Finish,
}

/// `RG_FLUSH_JOURNAL`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushState {
    Allocate,
    /// Read the slot's header from every member
    IssueHeaderReads,
    HeaderReadsComplete,
    RetryHeaderReads,
    /// Decide whether the slot holds data to replay
    ValidateHeaders,
    AllocateData,
    /// Read the journaled data
    IssueReads,
    ReadsComplete,
    /// Write the journaled data to the live stripe
    IssueWrites,
    WritesComplete,
    ReleaseSlot,
    Retry(Resume),
    Finish,
}

/// `R5_VR`, `R5_RB`, `MIRROR_VR`, `MIRROR_RB`, `RAID0_VR`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyState {
    Allocate,
    IssueReads,
    ReadsComplete,
    /// Decide what must be rewritten
    Check,
    IssueWrites,
    WritesComplete,
    Retry(Resume),
    Finish,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SiotsState {
    /// Not yet generated
    #[default]
    Generate,
    Read(ReadState),
    DegradedRead(DegradedReadState),
    Write(WriteState),
    MirrorWrite(MirrorWriteState),
    Verify(VerifyState),
    Flush(FlushState),
    /// The opcode isn't supported by the geometry
    InvalidOpcode,
    /// The SIOTS failed.  Its error is recorded in the SIOTS.
    UnexpectedError,
    Finished,
}

impl SiotsState {
    /// First state of an algorithm
    pub fn initial(algorithm: Algorithm) -> Self {
        use Algorithm::*;
        match algorithm {
            Raid0Rd | MirrorRd | R5Rd | R5SmRd | RgCheckZeroed =>
                SiotsState::Read(ReadState::Allocate),
            R5DegRd => SiotsState::DegradedRead(DegradedReadState::Allocate),
            R5Mr3 | R5Rmw | R5SmallRmw | R5Rcw | R5CorruptData =>
                SiotsState::Write(WriteState::Allocate),
            Raid0Wr | MirrorWr | MirrorCorruptData | RgZero =>
                SiotsState::MirrorWrite(MirrorWriteState::Allocate),
            R5Vr | R5Rb | MirrorVr | MirrorRb | Raid0Vr =>
                SiotsState::Verify(VerifyState::Allocate),
            RgFlushJournal => SiotsState::Flush(FlushState::Allocate),
            InvalidOpcode => SiotsState::InvalidOpcode,
        }
    }

    /// Is this a state that ends the IOTS with a failure?
    pub fn is_error(&self) -> bool {
        matches!(self, SiotsState::InvalidOpcode | SiotsState::UnexpectedError)
    }

    pub fn is_finished(&self) -> bool {
        *self == SiotsState::Finished
    }
}

/// Collaborators needed by the state machines
pub struct ExecContext<'a> {
    pub memory: &'a dyn MemoryPool,
    /// Most times a SIOTS may reissue member requests
    pub max_retries: u32,
    /// The raid group's write log, if it has one
    pub write_log: Option<&'a Arc<WriteLog>>,
}

/// Run a SIOTS until it blocks or finishes
pub fn execute(siots: &mut Siots, ctx: &ExecContext) -> StateStatus {
    loop {
        let status = step(siots, ctx);
        if status != StateStatus::Executing {
            return status;
        }
    }
}

fn step(siots: &mut Siots, ctx: &ExecContext) -> StateStatus {
    match siots.state {
        SiotsState::Generate => {
            fail(siots, Error::InvariantViolation)
        }
        SiotsState::Read(s) => read_step(s, siots, ctx),
        SiotsState::DegradedRead(s) => degraded_read_step(s, siots, ctx),
        SiotsState::Write(s) => write_step(s, siots, ctx),
        SiotsState::MirrorWrite(s) => mirror_write_step(s, siots, ctx),
        SiotsState::Verify(s) => verify_step(s, siots, ctx),
        SiotsState::Flush(s) => flush_step(s, siots, ctx),
        SiotsState::InvalidOpcode => {
            tracing::debug!(lba = siots.lba, opcode = ?siots.opcode,
                "invalid opcode");
            siots.error = Some(Error::UnrecognizedOpcode);
            siots.state = SiotsState::Finished;
            StateStatus::Done
        }
        SiotsState::UnexpectedError => {
            let e = *siots.error.get_or_insert(Error::InvariantViolation);
            if e == Error::InvariantViolation {
                tracing::error!(lba = siots.lba, xfer = siots.xfer,
                    algorithm = %siots.algorithm, "SIOTS invariant violated");
            } else {
                tracing::warn!(lba = siots.lba, xfer = siots.xfer,
                    algorithm = %siots.algorithm, error = %e, "SIOTS failed");
            }
            siots.release();
            // A slot with committed journal data stays behind for a flush.
            drop(siots.journal.take());
            siots.state = SiotsState::Finished;
            StateStatus::Done
        }
        SiotsState::Finished => StateStatus::Done
    }
}

fn fail(siots: &mut Siots, e: Error) -> StateStatus {
    siots.error = Some(e);
    siots.state = SiotsState::UnexpectedError;
    StateStatus::Executing
}

fn finish(siots: &mut Siots) -> StateStatus {
    tracing::trace!(lba = siots.lba, xfer = siots.xfer, "SIOTS complete");
    siots.release();
    siots.state = SiotsState::Finished;
    StateStatus::Done
}

fn read_opcode(siots: &Siots) -> FruOpcode {
    if siots.algorithm == Algorithm::RgCheckZeroed {
        FruOpcode::CheckZeroed
    } else {
        FruOpcode::Read
    }
}

fn write_opcode(siots: &Siots) -> FruOpcode {
    match siots.algorithm {
        Algorithm::RgZero => FruOpcode::Zero,
        Algorithm::R5CorruptData | Algorithm::MirrorCorruptData =>
            FruOpcode::CorruptCrc,
        _ => FruOpcode::Write
    }
}

/// May a request of the given phase be sent to this extent's member?
fn issuable(siots: &Siots, x: &FruExtent, phase: Resume) -> bool {
    !x.is_empty() && match phase {
        Resume::Reads => !siots.is_dead(x.position),
        Resume::Writes => siots.algorithm.is_rebuild() ||
            !siots.is_dead(x.position),
        Resume::Journal => !siots.is_dead(x.position),
    }
}

fn requests(siots: &Siots, extents: &[FruExtent], phase: Resume)
    -> Vec<FruRequest>
{
    let opcode = match phase {
        Resume::Reads => read_opcode(siots),
        Resume::Writes | Resume::Journal => write_opcode(siots),
    };
    extents.iter()
        .filter(|x| issuable(siots, x, phase))
        .flat_map(|x| live_pieces(siots, x))
        .map(|x| FruRequest {
            position: x.position,
            lba: x.lba,
            blocks: x.blocks,
            opcode,
        }).collect()
}

/// The write extents that a journaled write must log first
fn journaled_extents(siots: &Siots) -> Vec<FruExtent> {
    siots.writes.iter()
        .filter(|x| issuable(siots, x, Resume::Journal))
        .copied()
        .collect()
}

/// Journal writes: each logged extent lands behind the slot's header block.
fn journal_requests(siots: &Siots, slot_lba: LbaT) -> Vec<FruRequest> {
    journaled_extents(siots).into_iter()
        .map(|x| FruRequest {
            position: x.position,
            lba: slot_lba,
            blocks: 1 + x.blocks,
            opcode: FruOpcode::Write,
        }).collect()
}

/// The parts of an extent that don't lie in a degraded region span
fn live_pieces(siots: &Siots, x: &FruExtent) -> Vec<FruExtent> {
    let spans = siots.zero_spans.iter()
        .filter(|s| s.position == x.position)
        .collect::<Vec<_>>();
    if spans.is_empty() {
        return vec![*x];
    }
    spans.into_iter()
        .filter(|s| s.dead_pos.is_none())
        .filter_map(|s| {
            let start = s.lba.max(x.lba);
            let end = (s.lba + s.blocks).min(x.lba + x.blocks);
            (start < end).then_some(FruExtent {
                position: x.position,
                lba: start,
                blocks: end - start
            })
        }).collect()
}

/// Compute the resources needed by every request the SIOTS will issue
pub fn resource_shape(siots: &Siots) -> Result<ResourceShape> {
    let mut shape = ResourceShape::default();
    let reads = requests(siots, &siots.reads, Resume::Reads);
    let writes = requests(siots, &siots.writes, Resume::Writes);
    for r in reads.iter().chain(writes.iter()) {
        shape.add_fru(r.blocks)?;
    }
    if siots.write_logged {
        for r in journal_requests(siots, 0) {
            shape.add_fru(r.blocks)?;
        }
    }
    if siots.algorithm.repairs() {
        // Each read can report one bad block, which Check turns into a
        // single-block repair write.
        for _ in reads.iter() {
            shape.add_fru(1)?;
        }
    }
    shape.verify_tracking = matches!(siots.state, SiotsState::Verify(_));
    Ok(shape)
}

fn allocate(siots: &mut Siots, ctx: &ExecContext, next: SiotsState)
    -> StateStatus
{
    if !siots.has_pages() {
        let shape = match resource_shape(siots) {
            Ok(shape) => shape,
            Err(e) => return fail(siots, e)
        };
        let request = PageRequest::for_shape(&shape);
        match ctx.memory.try_allocate(&request) {
            Ok(pages) => siots.pages = Some(pages),
            Err(Error::ResourceExhausted) => {
                tracing::debug!(lba = siots.lba, ?request,
                    "page allocation deferred");
                return StateStatus::Waiting(WaitReason::Memory);
            }
            Err(e) => return fail(siots, e)
        }
    }
    siots.state = next;
    StateStatus::Executing
}

fn issue(siots: &mut Siots, reqs: Vec<FruRequest>, next: SiotsState)
    -> StateStatus
{
    siots.completions.clear();
    siots.issued |= !reqs.is_empty();
    siots.outstanding = reqs.len();
    siots.outbox = reqs;
    siots.state = next;
    if siots.outstanding == 0 {
        StateStatus::Executing
    } else {
        StateStatus::Waiting(WaitReason::FruIo)
    }
}

fn issue_phase(siots: &mut Siots, phase: Resume, next: SiotsState)
    -> StateStatus
{
    let reqs = match phase {
        Resume::Reads => requests(siots, &siots.reads, phase),
        Resume::Writes => requests(siots, &siots.writes, phase),
        Resume::Journal => match siots.journal.as_ref() {
            Some(claim) => journal_requests(siots, claim.lba()),
            None => return fail(siots, Error::InvariantViolation)
        }
    };
    issue(siots, reqs, next)
}

enum Outcome {
    Success,
    Retry {ride_through: bool},
    /// Parity read requests that failed and must be rebuilt from the
    /// survivors
    Reconstruct(Vec<FruRequest>),
    Failed(Error),
}

/// Examine the completions of the current phase
fn collect(siots: &mut Siots, ctx: &ExecContext, phase: Resume) -> Outcome {
    let completions: Vec<FruCompletion> =
        std::mem::take(&mut siots.completions);
    let mut ride_through = false;
    let mut retry = Vec::new();
    let mut lost = Vec::new();
    for c in completions {
        let pos = c.request.position;
        match c.status {
            FruStatus::Success => (),
            FruStatus::Retryable => {
                tracing::warn!(position = pos, "member logged out");
                ride_through = true;
                retry.push(c.request);
            }
            FruStatus::MediaError(lba) if phase == Resume::Reads &&
                siots.algorithm.repairs() =>
            {
                siots.repairs.push(FruExtent{position: pos, lba, blocks: 1});
            }
            FruStatus::MediaError(_) | FruStatus::Dead
                if siots.state ==
                    SiotsState::Flush(FlushState::HeaderReadsComplete) =>
            {
                tracing::warn!(position = pos, lba = c.request.lba,
                    "write log header unreadable");
                siots.failed_positions.push(pos);
            }
            FruStatus::MediaError(_) | FruStatus::Dead
                if siots.algorithm == Algorithm::MirrorRd =>
            {
                siots.failed_positions.push(pos);
                let alternate = (0..siots.fru_extents.len() as Position)
                    .find(|p| !siots.is_dead(*p) &&
                         !siots.failed_positions.contains(p));
                match alternate {
                    Some(p) => {
                        tracing::debug!(from = pos, to = p,
                            "redirecting mirror read");
                        retry.push(FruRequest{position: p, ..c.request});
                    }
                    None => return Outcome::Failed(Error::MemberIo(pos))
                }
            }
            FruStatus::MediaError(_) | FruStatus::Dead
                if phase == Resume::Reads && siots.algorithm.reconstructs() =>
            {
                tracing::debug!(position = pos, lba = c.request.lba,
                    "parity read failed; reconstructing");
                lost.push(c.request);
            }
            FruStatus::MediaError(_) | FruStatus::Dead => {
                return Outcome::Failed(Error::MemberIo(pos));
            }
        }
    }
    if !lost.is_empty() {
        return Outcome::Reconstruct(lost);
    }
    if retry.is_empty() {
        return Outcome::Success;
    }
    if siots.retries >= ctx.max_retries {
        return Outcome::Failed(Error::MemberIo(retry[0].position));
    }
    siots.retries += 1;
    siots.retry = retry;
    Outcome::Retry{ride_through}
}

/// Handle the end of an I/O phase
fn phase_complete(
    siots: &mut Siots,
    ctx: &ExecContext,
    phase: Resume,
    next: SiotsState,
    retry: SiotsState) -> StateStatus
{
    if siots.outstanding > 0 {
        return StateStatus::Waiting(WaitReason::FruIo);
    }
    match collect(siots, ctx, phase) {
        Outcome::Success => {
            siots.state = next;
            StateStatus::Executing
        }
        Outcome::Retry{ride_through} => {
            siots.state = retry;
            if ride_through {
                StateStatus::Waiting(WaitReason::RideThrough)
            } else {
                StateStatus::Executing
            }
        }
        Outcome::Reconstruct(lost) => match degrade(siots, &lost) {
            Ok(()) => StateStatus::Executing,
            Err(e) => fail(siots, e)
        },
        Outcome::Failed(e) => fail(siots, e)
    }
}

/// Turn a parity read into a degraded read that treats the members of the
/// `lost` requests as dead.
///
/// Every survivor is read wherever a lost request was, so the SIOTS needs new
/// pages.
fn degrade(siots: &mut Siots, lost: &[FruRequest]) -> Result<()> {
    let pm = siots.positions.ok_or(Error::InvariantViolation)?;
    let mut dead = siots.dead_positions().collect::<Vec<_>>();
    for r in lost {
        if !dead.contains(&r.position) {
            dead.push(r.position);
        }
    }
    if dead.len() > pm.redundant().len() {
        return Err(Error::MemberIo(lost[0].position));
    }
    let mut dead = dead.into_iter();
    siots.dead_pos = dead.next();
    siots.dead_pos_2 = dead.next();
    siots.reads = pm.all().iter()
        .map(|p| {
            let mut x = siots.reads.iter()
                .find(|r| r.position == *p)
                .copied()
                .unwrap_or_else(|| FruExtent::empty(*p));
            for l in lost {
                x.merge(l.lba, l.blocks);
            }
            x
        }).collect();
    siots.update_footprint();
    siots.algorithm = Algorithm::R5DegRd;
    siots.release();
    siots.state = SiotsState::DegradedRead(DegradedReadState::Allocate);
    Ok(())
}

fn reissue(siots: &mut Siots, next: SiotsState) -> StateStatus {
    let reqs = std::mem::take(&mut siots.retry);
    issue(siots, reqs, next)
}

fn read_step(s: ReadState, siots: &mut Siots, ctx: &ExecContext)
    -> StateStatus
{
    use ReadState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::Read(IssueReads)),
        IssueReads => issue_phase(siots, Resume::Reads,
                                  SiotsState::Read(ReadsComplete)),
        ReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::Read(Finish), SiotsState::Read(Retry)),
        Retry => reissue(siots, SiotsState::Read(ReadsComplete)),
        Finish => finish(siots),
    }
}

fn degraded_read_step(s: DegradedReadState, siots: &mut Siots,
                      ctx: &ExecContext) -> StateStatus
{
    use DegradedReadState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::DegradedRead(IssueReads)),
        IssueReads => issue_phase(siots, Resume::Reads,
                                  SiotsState::DegradedRead(ReadsComplete)),
        ReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::DegradedRead(Reconstruct),
            SiotsState::DegradedRead(Retry)),
        Reconstruct => {
            tracing::trace!(lba = siots.lba, dead_pos = ?siots.dead_pos,
                "reconstructing");
            siots.state = SiotsState::DegradedRead(Finish);
            StateStatus::Executing
        }
        Retry => reissue(siots, SiotsState::DegradedRead(ReadsComplete)),
        Finish => finish(siots),
    }
}

fn write_step(s: WriteState, siots: &mut Siots, ctx: &ExecContext)
    -> StateStatus
{
    use WriteState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::Write(IssuePreReads)),
        IssuePreReads => issue_phase(siots, Resume::Reads,
                                     SiotsState::Write(PreReadsComplete)),
        PreReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::Write(ComputeParity),
            SiotsState::Write(Retry(Resume::Reads))),
        ComputeParity => {
            tracing::trace!(lba = siots.lba, parity_start = siots.parity_start,
                parity_count = siots.parity_count, "computing parity");
            siots.state = if siots.write_logged {
                SiotsState::Write(ClaimSlot)
            } else {
                SiotsState::Write(IssueWrites)
            };
            StateStatus::Executing
        }
        ClaimSlot => claim_slot(siots, ctx),
        IssueJournalWrites => issue_phase(siots, Resume::Journal,
            SiotsState::Write(JournalWritesComplete)),
        JournalWritesComplete => phase_complete(siots, ctx, Resume::Journal,
            SiotsState::Write(CommitJournal),
            SiotsState::Write(Retry(Resume::Journal))),
        CommitJournal => {
            let extents = journaled_extents(siots);
            match siots.journal.as_mut() {
                Some(claim) => {
                    claim.commit(siots.parity_start, siots.parity_count,
                                 extents);
                    siots.state = SiotsState::Write(IssueWrites);
                    StateStatus::Executing
                }
                None => fail(siots, Error::InvariantViolation)
            }
        }
        IssueWrites => issue_phase(siots, Resume::Writes,
                                   SiotsState::Write(WritesComplete)),
        WritesComplete => {
            let next = if siots.write_logged {
                SiotsState::Write(ReleaseSlot)
            } else {
                SiotsState::Write(Finish)
            };
            phase_complete(siots, ctx, Resume::Writes, next,
                SiotsState::Write(Retry(Resume::Writes)))
        }
        ReleaseSlot => {
            if let Some(claim) = siots.journal.take() {
                claim.retire();
            }
            siots.state = SiotsState::Write(Finish);
            StateStatus::Executing
        }
        Retry(Resume::Reads) =>
            reissue(siots, SiotsState::Write(PreReadsComplete)),
        Retry(Resume::Writes) =>
            reissue(siots, SiotsState::Write(WritesComplete)),
        Retry(Resume::Journal) =>
            reissue(siots, SiotsState::Write(JournalWritesComplete)),
        Finish => finish(siots),
    }
}

fn mirror_write_step(s: MirrorWriteState, siots: &mut Siots,
                     ctx: &ExecContext) -> StateStatus
{
    use MirrorWriteState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::MirrorWrite(IssueWrites)),
        IssueWrites => issue_phase(siots, Resume::Writes,
                                   SiotsState::MirrorWrite(WritesComplete)),
        WritesComplete => phase_complete(siots, ctx, Resume::Writes,
            SiotsState::MirrorWrite(Finish), SiotsState::MirrorWrite(Retry)),
        Retry => reissue(siots, SiotsState::MirrorWrite(WritesComplete)),
        Finish => finish(siots),
    }
}

fn verify_step(s: VerifyState, siots: &mut Siots, ctx: &ExecContext)
    -> StateStatus
{
    use VerifyState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::Verify(IssueReads)),
        IssueReads => issue_phase(siots, Resume::Reads,
                                  SiotsState::Verify(ReadsComplete)),
        ReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::Verify(Check),
            SiotsState::Verify(Retry(Resume::Reads))),
        Check => {
            let repairs = std::mem::take(&mut siots.repairs);
            if !repairs.is_empty() {
                tracing::info!(lba = siots.lba, n = repairs.len(),
                    "verify found media errors");
            }
            siots.writes.extend(repairs);
            siots.state = SiotsState::Verify(IssueWrites);
            StateStatus::Executing
        }
        IssueWrites => issue_phase(siots, Resume::Writes,
                                   SiotsState::Verify(WritesComplete)),
        WritesComplete => phase_complete(siots, ctx, Resume::Writes,
            SiotsState::Verify(Finish),
            SiotsState::Verify(Retry(Resume::Writes))),
        Retry(Resume::Reads) =>
            reissue(siots, SiotsState::Verify(ReadsComplete)),
        Retry(Resume::Writes) =>
            reissue(siots, SiotsState::Verify(WritesComplete)),
        Retry(Resume::Journal) => fail(siots, Error::InvariantViolation),
        Finish => finish(siots),
    }
}

fn claim_slot(siots: &mut Siots, ctx: &ExecContext) -> StateStatus {
    if siots.journal.is_none() {
        let log = match ctx.write_log {
            Some(log) => log,
            None => return fail(siots, Error::InvariantViolation)
        };
        match log.allocate() {
            Some(claim) => {
                tracing::trace!(lba = siots.lba, slot = claim.slot(),
                    "journaling write");
                siots.journal = Some(claim);
            }
            None => {
                tracing::debug!(lba = siots.lba, "no free write log slot");
                return StateStatus::Waiting(WaitReason::WriteLogSlot);
            }
        }
    }
    siots.state = SiotsState::Write(WriteState::IssueJournalWrites);
    StateStatus::Executing
}

fn flush_step(s: FlushState, siots: &mut Siots, ctx: &ExecContext)
    -> StateStatus
{
    use FlushState::*;
    match s {
        Allocate => allocate(siots, ctx, SiotsState::Flush(IssueHeaderReads)),
        IssueHeaderReads => issue_phase(siots, Resume::Reads,
            SiotsState::Flush(HeaderReadsComplete)),
        HeaderReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::Flush(ValidateHeaders),
            SiotsState::Flush(RetryHeaderReads)),
        RetryHeaderReads =>
            reissue(siots, SiotsState::Flush(HeaderReadsComplete)),
        ValidateHeaders => validate_headers(siots),
        AllocateData => allocate(siots, ctx, SiotsState::Flush(IssueReads)),
        IssueReads => issue_phase(siots, Resume::Reads,
                                  SiotsState::Flush(ReadsComplete)),
        ReadsComplete => phase_complete(siots, ctx, Resume::Reads,
            SiotsState::Flush(IssueWrites),
            SiotsState::Flush(Retry(Resume::Reads))),
        IssueWrites => issue_phase(siots, Resume::Writes,
                                   SiotsState::Flush(WritesComplete)),
        WritesComplete => phase_complete(siots, ctx, Resume::Writes,
            SiotsState::Flush(ReleaseSlot),
            SiotsState::Flush(Retry(Resume::Writes))),
        ReleaseSlot => {
            if let Some(claim) = siots.journal.take() {
                claim.retire();
            }
            siots.state = SiotsState::Flush(Finish);
            StateStatus::Executing
        }
        Retry(Resume::Reads) =>
            reissue(siots, SiotsState::Flush(ReadsComplete)),
        Retry(Resume::Writes) =>
            reissue(siots, SiotsState::Flush(WritesComplete)),
        Retry(Resume::Journal) => fail(siots, Error::InvariantViolation),
        Finish => finish(siots),
    }
}

/// Pick the slot's header from the copies that could be read, and plan the
/// replay it describes.
fn validate_headers(siots: &mut Siots) -> StateStatus {
    let (slot_lba, copies) = match siots.journal.as_ref() {
        Some(claim) => {
            let copies = siots.reads.iter()
                .map(|x| x.position)
                .filter(|p| !siots.is_dead(*p) &&
                        !siots.failed_positions.contains(p))
                .filter_map(|p| claim.header(p).map(|h| (p, h)))
                .collect::<Vec<_>>();
            (claim.lba(), copies)
        }
        None => return fail(siots, Error::InvariantViolation)
    };
    match select_header(&copies) {
        Ok(HeaderVerdict::Empty) => {
            tracing::debug!(slot_lba, "write log slot is empty");
            siots.state = SiotsState::Flush(FlushState::ReleaseSlot);
            StateStatus::Executing
        }
        Ok(HeaderVerdict::Flush(h)) => {
            tracing::info!(slot_lba, parity_start = h.parity_start,
                parity_count = h.parity_count, "replaying write log slot");
            siots.parity_start = h.parity_start;
            siots.parity_count = h.parity_count;
            siots.reads = h.extents.iter()
                .filter(|x| !siots.is_dead(x.position))
                .map(|x| FruExtent {
                    position: x.position,
                    lba: slot_lba + 1,
                    blocks: x.blocks
                }).collect();
            siots.writes = h.extents;
            siots.update_footprint();
            // The data phase is sized differently than the header reads.
            siots.release();
            siots.state = SiotsState::Flush(FlushState::AllocateData);
            StateStatus::Executing
        }
        Err(e) => {
            tracing::error!(slot_lba, "abandoning untrusted write log slot");
            if let Some(claim) = siots.journal.take() {
                claim.retire();
            }
            fail(siots, e)
        }
    }
}

// LCOV_EXCL_STOP
