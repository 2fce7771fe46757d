use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::model::{ChunkReference, Container, ContainerId, ReassemblyPlan, Signature};

/// A chunk reference local to a [`FileGroup`]: containers are addressed by
/// their position in the group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupChunkReference {
    pub container_index: u32,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileReferences {
    pub signature: Signature,
    pub chunks: Vec<GroupChunkReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileGroup {
    pub containers: Vec<Container>,
    pub files: Vec<FileReferences>,
}

/// What the storage service tells us about where a batch of files lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub groups: Vec<FileGroup>,
}

/// The inputs of a download run, derived from a [`Manifest`].
#[derive(Debug, Default)]
pub struct ManifestTables {
    /// All distinct containers, in manifest order.
    pub containers: Vec<Arc<Container>>,
    pub plans: Vec<ReassemblyPlan>,
    /// One `(signature, container)` pair per dependency.
    pub references: Vec<(Signature, ContainerId)>,
}

impl Manifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn file_count(&self) -> usize {
        self.groups.iter().map(|group| group.files.len()).sum()
    }

    /// Resolves group-local references into plans and checks that every
    /// reference points at an existing chunk.
    pub fn build(&self) -> Result<ManifestTables, ManifestError> {
        let mut tables = ManifestTables::default();
        let mut known_containers = HashSet::new();
        let mut known_signatures = HashSet::new();

        for (group_index, group) in self.groups.iter().enumerate() {
            let containers: Vec<_> = group
                .containers
                .iter()
                .map(|container| Arc::new(container.clone()))
                .collect();
            for container in &containers {
                if known_containers.insert(container.id) {
                    tables.containers.push(Arc::clone(container));
                }
            }

            for file in &group.files {
                let mut references = Vec::with_capacity(file.chunks.len());
                let mut dependencies = HashSet::new();

                for chunk in &file.chunks {
                    let container = containers
                        .get(chunk.container_index as usize)
                        .ok_or(ManifestError::UnknownContainer {
                            signature: file.signature,
                            group: group_index,
                            container_index: chunk.container_index,
                            containers: containers.len(),
                        })?;
                    if chunk.chunk_index as usize >= container.chunk_count() {
                        return Err(ManifestError::UnknownChunk {
                            signature: file.signature,
                            container: container.id,
                            chunk_index: chunk.chunk_index,
                            chunks: container.chunk_count(),
                        });
                    }
                    references.push(ChunkReference {
                        container: container.id,
                        index: chunk.chunk_index,
                    });
                    dependencies.insert(container.id);
                }

                if !known_signatures.insert(file.signature) {
                    tracing::debug!(signature = %file.signature, "duplicate file in manifest");
                    continue;
                }
                tables
                    .references
                    .extend(dependencies.into_iter().map(|id| (file.signature, id)));
                tables.plans.push(ReassemblyPlan {
                    signature: file.signature,
                    references,
                });
            }
        }

        tracing::debug!(
            containers = tables.containers.len(),
            plans = tables.plans.len(),
            "built manifest tables"
        );
        Ok(tables)
    }
}
