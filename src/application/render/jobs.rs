use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

use super::surface::IndexedFormula;
use super::types::{FormulaError, RenderResult};

pub(crate) type Completion = oneshot::Sender<Vec<RenderResult>>;

/// Progress of a single formula. `Resolved` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Resolved(RenderResult),
}

/// Bookkeeping for one formula of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    index: usize,
    formula: String,
    status: JobStatus,
}

impl RenderJob {
    pub fn new(index: usize, formula: impl Into<String>) -> Self {
        Self {
            index,
            formula: formula.into(),
            status: JobStatus::Pending,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, JobStatus::Pending)
    }

    /// Move `Pending → Resolved`. Returns `false` if the job was already
    /// resolved, in which case the new result is dropped.
    pub fn resolve(&mut self, result: RenderResult) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = JobStatus::Resolved(result);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveOutcome {
    Resolved,
    AlreadyResolved,
    UnknownSlot,
}

/// All jobs of one request plus the completion waiting on them.
///
/// `request_id` is fixed for the life of the request; `id` names the current
/// dispatch and changes whenever the batch is sent to the surface again.
#[derive(Debug)]
pub(crate) struct RenderBatch {
    request_id: Uuid,
    id: Uuid,
    jobs: Vec<RenderJob>,
    completion: Completion,
    accepted_at: Instant,
    first_dispatch: Option<Instant>,
    dispatches: u32,
}

impl RenderBatch {
    pub(crate) fn new(formulas: Vec<String>, completion: Completion) -> Self {
        let jobs = formulas
            .into_iter()
            .enumerate()
            .map(|(index, formula)| RenderJob::new(index, formula))
            .collect();
        let request_id = Uuid::new_v4();
        Self {
            request_id,
            id: request_id,
            jobs,
            completion,
            accepted_at: Instant::now(),
            first_dispatch: None,
            dispatches: 0,
        }
    }

    pub(crate) fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Record a dispatch and return when the first one happened. Timeouts
    /// are measured from that instant, across re-dispatches.
    pub(crate) fn mark_dispatched(&mut self) -> Instant {
        self.dispatches += 1;
        *self.first_dispatch.get_or_insert_with(Instant::now)
    }

    pub(crate) fn first_dispatch(&self) -> Option<Instant> {
        self.first_dispatch
    }

    pub(crate) fn dispatches(&self) -> u32 {
        self.dispatches
    }

    /// Assign a fresh id so messages addressed to an earlier dispatch are
    /// no longer accepted.
    pub(crate) fn rekey(&mut self) -> Uuid {
        self.id = Uuid::new_v4();
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    pub(crate) fn jobs(&self) -> &[RenderJob] {
        &self.jobs
    }

    pub(crate) fn formula(&self, index: usize) -> Option<&str> {
        self.jobs.get(index).map(RenderJob::formula)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.is_pending()).count()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.jobs.iter().all(|job| !job.is_pending())
    }

    pub(crate) fn pending_formulas(&self) -> Vec<IndexedFormula> {
        self.jobs
            .iter()
            .filter(|job| job.is_pending())
            .map(|job| IndexedFormula {
                index: job.index,
                latex: job.formula.clone(),
            })
            .collect()
    }

    pub(crate) fn resolve(&mut self, index: usize, result: RenderResult) -> ResolveOutcome {
        match self.jobs.get_mut(index) {
            Some(job) => {
                if job.resolve(result) {
                    ResolveOutcome::Resolved
                } else {
                    ResolveOutcome::AlreadyResolved
                }
            }
            None => ResolveOutcome::UnknownSlot,
        }
    }

    /// Resolve the first pending job whose formula text matches `latex`.
    /// Returns the slot index alongside the outcome.
    pub(crate) fn resolve_by_formula(
        &mut self,
        latex: &str,
        result: RenderResult,
    ) -> (Option<usize>, ResolveOutcome) {
        let pending = self
            .jobs
            .iter()
            .position(|job| job.is_pending() && job.formula == latex);
        match pending {
            Some(index) => (Some(index), self.resolve(index, result)),
            None if self.jobs.iter().any(|job| job.formula == latex) => {
                (None, ResolveOutcome::AlreadyResolved)
            }
            None => (None, ResolveOutcome::UnknownSlot),
        }
    }

    /// Resolve every still-pending job with `error`; returns how many changed.
    pub(crate) fn fail_pending(&mut self, error: &FormulaError) -> usize {
        self.jobs
            .iter_mut()
            .filter(|job| job.is_pending())
            .map(|job| job.resolve(RenderResult::Failed(error.clone())))
            .filter(|changed| *changed)
            .count()
    }

    /// Ordered results plus the completion they are owed to. Slots that are
    /// somehow still pending come out as `Aborted`.
    pub(crate) fn into_results(self) -> (Vec<RenderResult>, Completion) {
        let results = self
            .jobs
            .into_iter()
            .map(|job| match job.status {
                JobStatus::Resolved(result) => result,
                JobStatus::Pending => RenderResult::Failed(FormulaError::Aborted),
            })
            .collect();
        (results, self.completion)
    }
}
