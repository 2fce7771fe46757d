//! Encrypted backups built in memory, plus a transport and a writer to
//! restore them with. Used by the tests and the stresstest.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::decrypt::seal_chunk;
use crate::error::TransportError;
use crate::manifest::{FileGroup, FileReferences, GroupChunkReference, Manifest};
use crate::model::{
    Checksum, ChunkDescriptor, ChunkKey, Compression, Container, ContainerId, HashAlgorithm,
    HostInfo, Signature,
};
use crate::reader::ComposedReader;
use crate::transport::Transport;
use crate::writer::{SignatureWriter, WriteOutcome, WriteReport};

const KEY_CONTEXT: &str = "chunkhaul 2025-01 synthetic chunk key";

const ONE_KIB: u32 = 1024;
const MIN_CHUNK: u32 = 4 * ONE_KIB;
const AVG_CHUNK: u32 = 16 * ONE_KIB;
const MAX_CHUNK: u32 = 64 * ONE_KIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// Every file is a single chunk.
    None,
    Fixed(u32),
    /// Content defined, with min, average and max chunk size.
    Cdc(u32, u32, u32),
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Cdc(MIN_CHUNK, AVG_CHUNK, MAX_CHUNK)
    }
}

impl ChunkingStrategy {
    fn split<'d>(&self, data: &'d [u8]) -> Vec<&'d [u8]> {
        if data.is_empty() {
            return vec![];
        }
        match *self {
            ChunkingStrategy::None => vec![data],
            ChunkingStrategy::Fixed(size) => data.chunks(size.max(1) as usize).collect(),
            ChunkingStrategy::Cdc(min_size, avg_size, max_size) => {
                let min_size = min_size.max(fastcdc::v2020::MINIMUM_MIN);
                let avg_size = avg_size.max(fastcdc::v2020::AVERAGE_MIN);
                let max_size = max_size.max(fastcdc::v2020::MAXIMUM_MIN);
                fastcdc::v2020::FastCDC::new(data, min_size, avg_size, max_size)
                    .map(|chunk| &data[chunk.offset..chunk.offset + chunk.length])
                    .collect()
            }
        }
    }
}

/// Builds a [`SyntheticBackup`] the way a backup client would lay one out:
/// files are chunked, identical chunks are stored once, and chunks are packed
/// into containers spread over the configured hosts.
pub struct BackupBuilder {
    chunking: ChunkingStrategy,
    container_size: usize,
    compression: Compression,
    hosts: Vec<String>,
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl Default for BackupBuilder {
    fn default() -> Self {
        Self {
            chunking: ChunkingStrategy::default(),
            container_size: 256 * ONE_KIB as usize,
            compression: Compression::None,
            hosts: vec!["memory://host-0".into()],
            files: vec![],
        }
    }
}

impl BackupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunking(mut self, chunking: ChunkingStrategy) -> Self {
        self.chunking = chunking;
        self
    }

    /// Payload budget of one container. A chunk bigger than that gets a
    /// container of its own.
    pub fn container_size(mut self, bytes: usize) -> Self {
        self.container_size = bytes;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn hosts<S: Into<String>>(mut self, hosts: impl IntoIterator<Item = S>) -> Self {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }

    pub fn files<P, C>(mut self, files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: Into<PathBuf>,
        C: Into<Vec<u8>>,
    {
        self.files
            .extend(files.into_iter().map(|(path, contents)| (path.into(), contents.into())));
        self
    }

    pub fn build(mut self) -> io::Result<SyntheticBackup> {
        if self.hosts.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a backup needs at least one host",
            ));
        }

        let input = std::mem::take(&mut self.files);
        let mut packer = Packer::new(&self);
        let mut backup_files = HashMap::new();
        let mut paths = Vec::with_capacity(input.len());
        let mut references = vec![];

        for (path, contents) in input {
            let signature = Signature::from_contents(&contents);
            paths.push((path, signature));
            let Entry::Vacant(vacant) = backup_files.entry(signature) else {
                continue;
            };

            let mut chunks = vec![];
            for chunk in self.chunking.split(&contents) {
                chunks.push(packer.add(chunk)?);
            }
            references.push((signature, chunks));
            vacant.insert(contents);
        }

        let (containers, payloads) = packer.finish();
        let files = references
            .into_iter()
            .map(|(signature, chunks)| FileReferences {
                signature,
                chunks: chunks
                    .into_iter()
                    .map(|(container_index, chunk_index)| GroupChunkReference {
                        container_index,
                        chunk_index,
                    })
                    .collect(),
            })
            .collect();

        Ok(SyntheticBackup {
            manifest: Manifest {
                groups: vec![FileGroup { containers, files }],
            },
            payloads,
            files: backup_files,
            paths,
        })
    }
}

/// Packs sealed chunks into containers.
struct Packer<'b> {
    builder: &'b BackupBuilder,
    /// plaintext hash to `(container, chunk)` position
    seen: HashMap<[u8; 32], (u32, u32)>,
    containers: Vec<Container>,
    payloads: HashMap<ContainerId, Bytes>,
    descriptors: Vec<ChunkDescriptor>,
    payload: Vec<u8>,
}

impl<'b> Packer<'b> {
    fn new(builder: &'b BackupBuilder) -> Self {
        Self {
            builder,
            seen: HashMap::new(),
            containers: vec![],
            payloads: HashMap::new(),
            descriptors: vec![],
            payload: vec![],
        }
    }

    fn add(&mut self, plaintext: &[u8]) -> io::Result<(u32, u32)> {
        let hash = *blake3::hash(plaintext).as_bytes();
        if let Some(position) = self.seen.get(&hash) {
            return Ok(*position);
        }

        let key = ChunkKey(blake3::derive_key(KEY_CONTEXT, plaintext));
        let sealed = seal_chunk(&key, plaintext, self.builder.compression)?;
        if !self.descriptors.is_empty()
            && self.payload.len() + sealed.len() > self.builder.container_size
        {
            self.close();
        }

        let descriptor = ChunkDescriptor {
            offset: self.payload.len() as u32,
            encrypted_size: sealed.len() as u32,
            size: plaintext.len() as u32,
            compression: self.builder.compression,
            key,
            checksum: Checksum::compute(HashAlgorithm::Blake3, plaintext),
        };
        self.payload.extend_from_slice(&sealed);
        self.descriptors.push(descriptor);

        let position = (
            self.containers.len() as u32,
            self.descriptors.len() as u32 - 1,
        );
        self.seen.insert(hash, position);
        Ok(position)
    }

    fn close(&mut self) {
        let index = self.containers.len();
        let host = &self.builder.hosts[index % self.builder.hosts.len()];
        let container = Container::new(
            HostInfo::get(format!("{host}/containers/{index}")),
            std::mem::take(&mut self.descriptors),
        );
        self.payloads
            .insert(container.id, std::mem::take(&mut self.payload).into());
        self.containers.push(container);
    }

    fn finish(mut self) -> (Vec<Container>, HashMap<ContainerId, Bytes>) {
        if !self.descriptors.is_empty() {
            self.close();
        }
        (self.containers, self.payloads)
    }
}

/// A backup that exists only in memory.
#[derive(Debug)]
pub struct SyntheticBackup {
    pub manifest: Manifest,
    /// Encrypted container payloads.
    pub payloads: HashMap<ContainerId, Bytes>,
    /// Plaintext per distinct file.
    pub files: HashMap<Signature, Vec<u8>>,
    /// Every file path with its signature, in the order they were added.
    pub paths: Vec<(PathBuf, Signature)>,
}

impl SyntheticBackup {
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.manifest
            .groups
            .iter()
            .flat_map(|group| &group.containers)
            .map(|container| Arc::new(container.clone()))
            .collect()
    }

    pub fn payload(&self, container: &ContainerId) -> Bytes {
        self.payloads.get(container).cloned().unwrap_or_default()
    }

    pub fn signature(&self, path: impl AsRef<Path>) -> Option<Signature> {
        let path = path.as_ref();
        self.paths
            .iter()
            .find(|(candidate, _)| candidate == path)
            .map(|(_, signature)| *signature)
    }

    /// The containers a file's chunks live in.
    pub fn containers_of(&self, signature: &Signature) -> HashSet<ContainerId> {
        self.manifest
            .groups
            .iter()
            .flat_map(|group| {
                group
                    .files
                    .iter()
                    .filter(|file| file.signature == *signature)
                    .flat_map(|file| &file.chunks)
                    .map(|chunk| group.containers[chunk.container_index as usize].id)
            })
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|contents| contents.len() as u64).sum()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.payloads.clone())
    }
}

/// A scripted fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Respond with this HTTP status.
    Status(u16),
    /// Drop the connection.
    Io,
    /// Deliver the payload with a flipped byte.
    Corrupt,
}

/// Serves container payloads from memory, failing on demand.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    payloads: HashMap<ContainerId, Bytes>,
    faults: Mutex<HashMap<ContainerId, VecDeque<Fault>>>,
    latency: Option<Duration>,
    fetches: AtomicUsize,
    fetches_by_container: Mutex<HashMap<ContainerId, usize>>,
}

impl MemoryTransport {
    pub fn new(payloads: HashMap<ContainerId, Bytes>) -> Self {
        Self {
            payloads,
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues faults for the next fetches of `container`.
    pub fn fail(&self, container: ContainerId, faults: impl IntoIterator<Item = Fault>) {
        self.faults
            .lock()
            .entry(container)
            .or_default()
            .extend(faults);
    }

    /// Queues the same faults for every container.
    pub fn fail_all(&self, faults: &[Fault]) {
        let mut queued = self.faults.lock();
        for container in self.payloads.keys() {
            queued
                .entry(*container)
                .or_default()
                .extend(faults.iter().copied());
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, container: &ContainerId) -> usize {
        self.fetches_by_container
            .lock()
            .get(container)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, container: &Container) -> Result<Bytes, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self
            .fetches_by_container
            .lock()
            .entry(container.id)
            .or_default() += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let fault = self
            .faults
            .lock()
            .get_mut(&container.id)
            .and_then(VecDeque::pop_front);
        let Some(payload) = self.payloads.get(&container.id).cloned() else {
            return Err(TransportError::Status {
                code: 404,
                message: format!("no container at {}", container.host.uri),
            });
        };

        match fault {
            None => Ok(payload),
            Some(Fault::Status(code)) => Err(TransportError::Status {
                code,
                message: "injected".into(),
            }),
            Some(Fault::Io) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected",
            ))),
            Some(Fault::Corrupt) => {
                let mut corrupt = payload.to_vec();
                if let Some(byte) = corrupt.first_mut() {
                    *byte ^= 0xff;
                }
                Ok(corrupt.into())
            }
        }
    }
}

/// Collects restored files in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    /// Signatures with an output entry. `None` knows all of them.
    known: Option<HashSet<Signature>>,
    written: Mutex<HashMap<Signature, Vec<u8>>>,
    attempts: Mutex<HashMap<Signature, usize>>,
    failures: Mutex<HashMap<Signature, usize>>,
    writes: AtomicUsize,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knowing(signatures: impl IntoIterator<Item = Signature>) -> Self {
        Self {
            known: Some(signatures.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Makes the next `times` writes of `signature` fail.
    pub fn fail_next(&self, signature: Signature, times: usize) {
        *self.failures.lock().entry(signature).or_default() += times;
    }

    pub fn written(&self, signature: &Signature) -> Option<Vec<u8>> {
        self.written.lock().get(signature).cloned()
    }

    /// Write calls for `signature`, failed ones included.
    pub fn attempts(&self, signature: &Signature) -> usize {
        self.attempts.lock().get(signature).copied().unwrap_or(0)
    }

    /// Successful writes over all signatures.
    pub fn total_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SignatureWriter for MemoryWriter {
    async fn write(
        &self,
        signature: &Signature,
        reader: &mut ComposedReader,
    ) -> anyhow::Result<Option<Vec<WriteReport>>> {
        *self.attempts.lock().entry(*signature).or_default() += 1;
        // widen the window for racing writers
        tokio::task::yield_now().await;

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(signature).filter(|n| **n > 0) {
                *remaining -= 1;
                anyhow::bail!("injected write failure for {signature}");
            }
        }
        if self
            .known
            .as_ref()
            .is_some_and(|known| !known.contains(signature))
        {
            return Ok(None);
        }

        let contents = reader.read_to_vec().await?;
        let bytes = contents.len() as u64;
        if self.written.lock().insert(*signature, contents).is_some() {
            anyhow::bail!("{signature} was written twice");
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(Some(vec![WriteReport {
            path: PathBuf::from(signature.to_string()),
            outcome: WriteOutcome::Written { bytes },
        }]))
    }
}
