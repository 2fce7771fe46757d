use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::decrypt::DecrypterFactory;
use crate::error::AbsorbError;
use crate::manifest::ManifestTables;
use crate::model::{Container, ContainerId, ReassemblyPlan, Signature};
use crate::plans::PlanIndex;
use crate::progress::{Level, ProgressSink};
use crate::reader::ComposedReader;
use crate::refs::ReferenceIndex;
use crate::store::ChunkStore;
use crate::writer::SignatureWriter;

/// What absorbing a container (or flushing satisfied plans) achieved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Absorbed {
    /// The container was already stored and got replaced.
    pub overwritten: bool,
    pub written: Vec<Signature>,
    /// Signatures the writer had no entry for.
    pub unreferenced: Vec<Signature>,
    /// Writes that failed; their plans stay pending.
    pub failed_writes: Vec<FailedWrite>,
}

impl Absorbed {
    /// Signatures that are no longer pending because of this call.
    pub fn finalized(&self) -> usize {
        self.written.len() + self.unreferenced.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    pub signature: Signature,
    pub message: String,
}

enum Finalized {
    Written,
    Unreferenced,
    /// Not satisfied yet, or claimed by someone else.
    Skipped,
}

/// Ties the chunk store, the reference index and the pending plans together.
///
/// Every fetched container goes through [`StoreManager::absorb`], which
/// decrypts and stores it and then writes each file that just became
/// complete. Any number of containers may be absorbed concurrently.
pub struct StoreManager {
    store: ChunkStore,
    references: ReferenceIndex,
    plans: PlanIndex,
    /// In manifest order.
    containers: Vec<Arc<Container>>,
    decrypters: DecrypterFactory,
    writer: Arc<dyn SignatureWriter>,
    progress: Arc<dyn ProgressSink>,
}

impl StoreManager {
    pub fn new(
        store: ChunkStore,
        references: ReferenceIndex,
        plans: PlanIndex,
        containers: Vec<Arc<Container>>,
        decrypters: DecrypterFactory,
        writer: Arc<dyn SignatureWriter>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store,
            references,
            plans,
            containers,
            decrypters,
            writer,
            progress,
        }
    }

    pub fn from_manifest(
        tables: ManifestTables,
        decrypters: DecrypterFactory,
        writer: Arc<dyn SignatureWriter>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self::new(
            ChunkStore::new(),
            ReferenceIndex::from_pairs(tables.references),
            tables.plans.into_iter().collect(),
            tables.containers,
            decrypters,
            writer,
            progress,
        )
    }

    /// Decrypts and stores `container`, then writes every file it completes.
    ///
    /// A failed write puts that file's plan back so a later round can retry
    /// it, and is listed in [`Absorbed::failed_writes`]. The other candidates
    /// are still evaluated.
    pub async fn absorb(
        &self,
        container: Arc<Container>,
        payload: Bytes,
    ) -> Result<Absorbed, AbsorbError> {
        let id = container.id;
        let chunks = self.decrypt(container, payload).await?;
        let chunk_count = chunks.len();

        let overwritten = self.store.put(id, chunks);
        if overwritten {
            tracing::warn!(container = %id, "container was delivered twice, overwriting");
        }
        self.progress.println(
            Level::VV,
            &format!("stored container {id} ({chunk_count} chunks)"),
        );

        let candidates = self.references.keys_for(&id);
        if candidates.is_empty() {
            // nothing will ever read from it
            tracing::debug!(container = %id, "absorbed container without dependents");
            self.store.remove(&id);
        }

        let mut absorbed = self.finalize_all(candidates).await?;
        absorbed.overwritten = overwritten;
        Ok(absorbed)
    }

    /// Writes every pending plan the store can already satisfy.
    ///
    /// Catches plans no container absorb will ever complete: files without
    /// any chunks, and files whose write failed after their last container
    /// was stored.
    pub async fn finalize_satisfied(&self) -> Result<Absorbed, AbsorbError> {
        let satisfied: HashSet<_> = self
            .plans
            .plans()
            .iter()
            .filter(|plan| self.is_satisfied(plan))
            .map(|plan| plan.signature)
            .collect();
        if !satisfied.is_empty() {
            tracing::debug!(count = satisfied.len(), "finalizing satisfied plans");
        }
        self.finalize_all(satisfied).await
    }

    async fn finalize_all(
        &self,
        candidates: HashSet<Signature>,
    ) -> Result<Absorbed, AbsorbError> {
        let mut absorbed = Absorbed::default();

        for signature in candidates {
            match self.finalize(&signature).await {
                Ok(Finalized::Written) => absorbed.written.push(signature),
                Ok(Finalized::Unreferenced) => absorbed.unreferenced.push(signature),
                Ok(Finalized::Skipped) => {}
                Err(AbsorbError::Write { signature, source }) => {
                    tracing::warn!(
                        %signature,
                        error = %source,
                        "write failed, keeping the plan pending"
                    );
                    absorbed.failed_writes.push(FailedWrite {
                        signature,
                        message: source.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        Ok(absorbed)
    }

    async fn finalize(&self, signature: &Signature) -> Result<Finalized, AbsorbError> {
        // already written, or never planned
        let Some(plan) = self.plans.get(signature) else {
            return Ok(Finalized::Skipped);
        };
        if !self.is_satisfied(&plan) {
            return Ok(Finalized::Skipped);
        }
        let Some(plan) = self.plans.claim(signature) else {
            tracing::trace!(%signature, "claimed by another worker");
            return Ok(Finalized::Skipped);
        };

        let Some(mut reader) = self.compose(&plan) else {
            self.plans.restore(plan);
            return Err(AbsorbError::Internal(format!(
                "chunks of satisfied plan {signature} vanished from the store"
            )));
        };
        tracing::trace!(%signature, bytes = reader.len(), "writing");

        let result = self.writer.write(signature, &mut reader).await;
        drop(reader);

        match result {
            Ok(Some(reports)) => {
                for report in reports {
                    self.progress.println(
                        Level::V,
                        &format!("{}: {}", report.path.display(), report.outcome),
                    );
                }
                self.release(signature);
                Ok(Finalized::Written)
            }
            Ok(None) => {
                tracing::warn!(%signature, "no output entry for signature");
                self.release(signature);
                Ok(Finalized::Unreferenced)
            }
            Err(source) => {
                self.plans.restore(plan);
                Err(AbsorbError::Write {
                    signature: *signature,
                    source: source.into(),
                })
            }
        }
    }

    async fn decrypt(
        &self,
        container: Arc<Container>,
        payload: Bytes,
    ) -> Result<Vec<Bytes>, AbsorbError> {
        let id = container.id;
        let mut decrypter = (self.decrypters)();
        tokio::task::spawn_blocking(move || decrypter.decrypt(&container, &payload))
            .await
            .map_err(|err| AbsorbError::Internal(format!("decrypt task of {id} failed: {err}")))?
            .map_err(|source| AbsorbError::Integrity {
                container: id,
                source,
            })
    }

    fn is_satisfied(&self, plan: &ReassemblyPlan) -> bool {
        plan.references
            .iter()
            .all(|reference| self.store.contains(&reference.container, reference.index))
    }

    fn compose(&self, plan: &ReassemblyPlan) -> Option<ComposedReader> {
        let chunks = plan
            .references
            .iter()
            .map(|reference| self.store.reader(&reference.container, reference.index))
            .collect::<Option<Vec<_>>>()?;
        Some(ComposedReader::new(chunks))
    }

    /// Detaches a finished signature and frees the containers nobody needs
    /// anymore.
    fn release(&self, signature: &Signature) {
        for container in self.references.remove_key(signature) {
            if self.store.remove(&container) {
                tracing::trace!(%container, "released container");
            }
        }
    }

    /// Signatures not written yet.
    pub fn pending_signatures(&self) -> HashSet<Signature> {
        self.plans.pending()
    }

    /// Containers a pending plan still needs and that are not stored, in
    /// manifest order.
    pub fn outstanding_containers(&self) -> Vec<Arc<Container>> {
        let needed: HashSet<ContainerId> = self
            .plans
            .plans()
            .iter()
            .flat_map(|plan| plan.containers())
            .collect();
        self.containers
            .iter()
            .filter(|container| {
                needed.contains(&container.id) && !self.store.contains_container(&container.id)
            })
            .cloned()
            .collect()
    }

    /// Every container any file ever depended on.
    pub fn container_list(&self) -> HashSet<ContainerId> {
        self.references.value_set()
    }

    pub fn is_stored(&self, container: &ContainerId) -> bool {
        self.store.contains_container(container)
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn references(&self) -> &ReferenceIndex {
        &self.references
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("stored", &self.store.len())
            .field("pending", &self.plans.len())
            .field("dependents", &self.references.key_count())
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}
