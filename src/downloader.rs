use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Fatal, UnitError, UnitFailure};
use crate::manager::{Absorbed, StoreManager};
use crate::model::{Container, ContainerId, Signature};
use crate::tally::Tally;
use crate::transport::Transport;

/// How a download run ended, short of a fatal error.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Rounds that were started.
    pub rounds: usize,
    /// Signatures finalized during the run.
    pub written: usize,
    /// Containers absorbed successfully, over all rounds.
    pub succeeded: HashSet<ContainerId>,
    /// Signatures still pending once the round bound was used up.
    pub unresolved: HashSet<Signature>,
    /// Units that failed in the last round.
    pub failures: HashMap<ContainerId, UnitFailure>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// The partitioned result of one round.
#[derive(Debug, Default)]
struct RoundOutcome {
    succeeded: HashSet<ContainerId>,
    failed: HashMap<ContainerId, UnitFailure>,
    written: usize,
}

impl RoundOutcome {
    fn merge(&mut self, other: RoundOutcome) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.written += other.written;
    }
}

type WorkQueue = Arc<Mutex<VecDeque<Arc<Container>>>>;

/// Downloads the containers pending files need, in rounds of concurrent
/// workers, until every file is written or the round bound is used up.
pub struct SignatureDownloader {
    manager: Arc<StoreManager>,
    transport: Arc<dyn Transport>,
    threads: usize,
    stagger_delay: Duration,
    rounds: usize,
}

impl SignatureDownloader {
    pub fn new(
        manager: Arc<StoreManager>,
        transport: Arc<dyn Transport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            manager,
            transport,
            threads: config.threads(),
            stagger_delay: config.stagger_delay(),
            rounds: config.rounds(),
        }
    }

    /// Runs rounds until nothing is pending or the round bound is reached.
    ///
    /// Unresolved files are part of the report, not an error. Only
    /// interruption, internal faults and a rejected session end the run
    /// early.
    pub async fn execute(
        &self,
        tally: &Tally,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, Fatal> {
        let initial = self.manager.pending_signatures();
        let mut report = DownloadReport::default();

        for round in 1..=self.rounds {
            if cancel.is_cancelled() {
                return Err(Fatal::Interrupted(format!("cancelled before round {round}")));
            }

            // credited to the previous round, the reset below starts over
            match self.manager.finalize_satisfied().await {
                Ok(flushed) => {
                    tally.complete(flushed.finalized());
                    for failed in &flushed.failed_writes {
                        tracing::warn!(
                            signature = %failed.signature,
                            error = %failed.message,
                            "could not write satisfied file"
                        );
                    }
                }
                Err(err) => {
                    let failure = UnitError::from(err).classify()?;
                    tracing::warn!(error = %failure, "could not finalize satisfied files");
                }
            }

            // claimed plans are gone from the index, so this is exactly what
            // is left to do
            let pending = self.manager.pending_signatures();
            if pending.is_empty() {
                break;
            }
            let work = self.manager.outstanding_containers();

            tally.reset(pending.len());
            report.rounds = round;
            tracing::debug!(
                round,
                pending = pending.len(),
                containers = work.len(),
                "starting round"
            );

            let outcome = self.run_round(work, tally, cancel).await?;
            tracing::debug!(
                round,
                succeeded = outcome.succeeded.len(),
                failed = outcome.failed.len(),
                written = outcome.written,
                "round finished"
            );
            if !outcome.failed.is_empty() {
                tracing::warn!(round, failed = outcome.failed.len(), "round had failed units");
            }

            report.succeeded.extend(outcome.succeeded);
            report.failures = outcome.failed;
        }

        report.unresolved = self.manager.pending_signatures();
        report.written = initial.difference(&report.unresolved).count();
        // forget failures a later flush made up for
        let outstanding: HashSet<_> = self
            .manager
            .outstanding_containers()
            .iter()
            .map(|container| container.id)
            .collect();
        report.failures.retain(|id, failure| match failure {
            UnitFailure::Write { signature, .. } => report.unresolved.contains(signature),
            _ => outstanding.contains(id),
        });
        if !report.unresolved.is_empty() {
            tracing::warn!(
                unresolved = report.unresolved.len(),
                rounds = report.rounds,
                "files left unresolved"
            );
        }
        Ok(report)
    }

    async fn run_round(
        &self,
        work: Vec<Arc<Container>>,
        tally: &Tally,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, Fatal> {
        let queue: WorkQueue = Arc::new(Mutex::new(work.into()));
        // cancelled by the caller, or by the first fatal unit
        let abort = cancel.child_token();
        let mut workers = JoinSet::new();

        for worker in 0..self.threads {
            if worker > 0 && !self.stagger_delay.is_zero() {
                tokio::select! {
                    _ = abort.cancelled() => {
                        if cancel.is_cancelled() {
                            workers.detach_all();
                            return Err(Fatal::Interrupted("cancelled while starting workers".into()));
                        }
                        break;
                    }
                    _ = tokio::time::sleep(self.stagger_delay) => {}
                }
            }
            if queue.lock().is_empty() {
                break;
            }
            workers.spawn(run_worker(
                worker,
                Arc::clone(&self.manager),
                Arc::clone(&self.transport),
                Arc::clone(&queue),
                tally.clone(),
                abort.clone(),
            ));
        }

        let mut outcome = RoundOutcome::default();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                joined = workers.join_next() => Some(joined),
            };
            let Some(joined) = next else {
                abort.cancel();
                // in-flight fetches finish on their own
                workers.detach_all();
                return Err(Fatal::Interrupted("cancelled during round".into()));
            };
            let Some(joined) = joined else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => {
                    Err(Fatal::Interrupted(format!("worker was cancelled: {err}")))
                }
                Err(err) => Err(Fatal::Internal(format!("worker panicked: {err}"))),
            };
            match result {
                Ok(partial) => outcome.merge(partial),
                Err(fatal) => {
                    tracing::error!(error = %fatal, "aborting download");
                    abort.cancel();
                    // in-flight fetches finish on their own
                    workers.detach_all();
                    return Err(fatal);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Fatal::Interrupted("cancelled during round".into()));
        }
        Ok(outcome)
    }
}

async fn run_worker(
    worker: usize,
    manager: Arc<StoreManager>,
    transport: Arc<dyn Transport>,
    queue: WorkQueue,
    tally: Tally,
    abort: CancellationToken,
) -> Result<RoundOutcome, Fatal> {
    let mut outcome = RoundOutcome::default();

    while !abort.is_cancelled() {
        let Some(container) = queue.lock().pop_front() else {
            break;
        };
        let id = container.id;
        tracing::trace!(worker, container = %id, "fetching");

        tally.start_unit();
        let result = fetch_and_absorb(&manager, transport.as_ref(), container).await;
        let failed = result
            .as_ref()
            .map_or(true, |absorbed| !absorbed.failed_writes.is_empty());
        tally.finish_unit(failed);

        match result {
            Ok(absorbed) => {
                let finalized = absorbed.finalized();
                tally.complete(finalized);
                outcome.written += finalized;
                // the container is stored either way
                outcome.succeeded.insert(id);
                if let Some(failed) = absorbed.failed_writes.into_iter().next() {
                    let failure = UnitFailure::Write {
                        signature: failed.signature,
                        message: failed.message,
                    };
                    tracing::warn!(worker, container = %id, error = %failure, "unit failed");
                    outcome.failed.insert(id, failure);
                }
            }
            Err(err) => match err.classify() {
                Ok(failure) => {
                    tracing::warn!(worker, container = %id, error = %failure, "unit failed");
                    outcome.failed.insert(id, failure);
                }
                Err(fatal) => {
                    abort.cancel();
                    return Err(fatal);
                }
            },
        }
    }

    Ok(outcome)
}

async fn fetch_and_absorb(
    manager: &StoreManager,
    transport: &dyn Transport,
    container: Arc<Container>,
) -> Result<Absorbed, UnitError> {
    let payload = transport.fetch(&container).await?;
    Ok(manager.absorb(container, payload).await?)
}
