use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunkhaul::decrypt::chunk_decrypters;
use chunkhaul::model::{Compression, Signature};
use chunkhaul::progress::{Level, NullProgress, TracingProgress};
use chunkhaul::reader::ComposedReader;
use chunkhaul::synthetic::{BackupBuilder, ChunkingStrategy, Fault, MemoryWriter, SyntheticBackup};
use chunkhaul::transport::Transport;
use chunkhaul::writer::{DirectoryWriter, SignatureWriter, WriteReport};
use chunkhaul::{EngineConfig, Fatal, SignatureDownloader, StoreManager, Tally, UnitFailure};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager(backup: &SyntheticBackup, writer: Arc<dyn SignatureWriter>) -> Arc<StoreManager> {
    Arc::new(StoreManager::from_manifest(
        backup.manifest.build().unwrap(),
        chunk_decrypters(),
        writer,
        Arc::new(NullProgress),
    ))
}

fn config(threads: usize) -> EngineConfig {
    EngineConfig::builder()
        .threads(threads)
        .stagger_delay(Duration::from_millis(1))
        .build()
}

/// A mixed backup: shared chunks, files spanning containers, an empty file.
fn mixed_backup() -> SyntheticBackup {
    let shared: Vec<u8> = (0..=255u8).collect();
    BackupBuilder::new()
        .chunking(ChunkingStrategy::Fixed(256))
        .container_size(1024)
        .compression(Compression::Zstd)
        .hosts(["memory://eu", "memory://us"])
        .files((0..24u32).map(|i| {
            let mut contents = shared.clone();
            contents.extend((0..i * 64).map(|n| (n * 7 + i) as u8));
            (format!("dir/file-{i}"), contents)
        }))
        .file("empty", vec![])
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_spanning_two_containers_is_written_once() {
    init_tracing();
    // a file that needs (C1, 0) and (C2, 1)
    let backup = BackupBuilder::new()
        .chunking(ChunkingStrategy::Fixed(4))
        .container_size(8)
        .file("c1", b"AAAABBBB".to_vec())
        .file("c2", b"CCCCDDDD".to_vec())
        .file("s1", b"AAAADDDD".to_vec())
        .build()
        .unwrap();
    let containers = backup.containers();
    let s1 = backup.signature("s1").unwrap();
    assert_eq!(
        backup.containers_of(&s1),
        HashSet::from([containers[0].id, containers[1].id])
    );

    for _ in 0..16 {
        let writer = Arc::new(MemoryWriter::new());
        let manager = manager(&backup, writer.clone());

        let mut absorbs = tokio::task::JoinSet::new();
        for container in backup.containers() {
            let manager = Arc::clone(&manager);
            let payload = backup.payload(&container.id);
            absorbs.spawn(async move { manager.absorb(container, payload).await });
        }
        while let Some(absorbed) = absorbs.join_next().await {
            absorbed.unwrap().unwrap();
        }

        assert_eq!(writer.attempts(&s1), 1);
        assert_eq!(writer.written(&s1).unwrap(), b"AAAADDDD");
        assert!(!manager.pending_signatures().contains(&s1));
        assert_eq!(manager.references().key_count(), 0);
        assert!(manager.pending_signatures().is_empty());
    }
}

#[tokio::test]
async fn reliable_transport_resolves_everything_in_one_round() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    let writer = Arc::new(MemoryWriter::new());
    let manager = manager(&backup, writer.clone());
    let downloader = SignatureDownloader::new(
        Arc::clone(&manager),
        transport.clone() as Arc<dyn Transport>,
        &config(4),
    );
    let tally = Tally::new();

    let report = downloader
        .execute(&tally, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.rounds, 1);
    assert_eq!(report.written, backup.files.len());
    assert_eq!(report.succeeded.len(), backup.payloads.len());
    for (signature, contents) in &backup.files {
        assert_eq!(&writer.written(signature).unwrap(), contents);
        assert_eq!(writer.attempts(signature), 1);
    }
    assert_eq!(transport.fetches(), backup.payloads.len());
    assert_eq!(tally.snapshot().pending(), 0);
    assert_eq!(tally.snapshot().in_flight, 0);
    // every chunk was read once and released
    assert!(manager.store().is_empty());
    assert_eq!(manager.container_list().len(), backup.payloads.len());
}

#[tokio::test]
async fn corrupt_container_keeps_its_dependents_pending() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    let writer = Arc::new(MemoryWriter::new());
    let c3 = backup.containers()[2].id;
    transport.fail(c3, [Fault::Corrupt]);

    let config = EngineConfig::builder()
        .threads(3)
        .stagger_delay(Duration::ZERO)
        .retries(1, 1)
        .build();
    let downloader = SignatureDownloader::new(
        manager(&backup, writer.clone()),
        transport.clone() as Arc<dyn Transport>,
        &config,
    );
    let report = downloader
        .execute(&Tally::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        report.failures.get(&c3),
        Some(UnitFailure::Integrity(_))
    ));
    assert_eq!(report.failures.len(), 1);

    let dependents: HashSet<_> = backup
        .files
        .keys()
        .filter(|signature| backup.containers_of(signature).contains(&c3))
        .copied()
        .collect();
    assert!(!dependents.is_empty());
    assert_eq!(report.unresolved, dependents);
    for signature in &dependents {
        assert_eq!(writer.attempts(signature), 0);
    }
}

#[tokio::test]
async fn transient_failures_resolve_within_the_round_bound() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    transport.fail_all(&[Fault::Status(503), Fault::Io]);
    let writer = Arc::new(MemoryWriter::new());

    let config = EngineConfig::builder()
        .threads(4)
        .stagger_delay(Duration::ZERO)
        .retries(3, 12)
        .build();
    let downloader = SignatureDownloader::new(
        manager(&backup, writer.clone()),
        transport.clone() as Arc<dyn Transport>,
        &config,
    );
    let tally = Tally::new();
    let report = downloader
        .execute(&tally, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.rounds, 3);
    assert!(report.is_complete());
    assert!(report.failures.is_empty());
    assert_eq!(tally.snapshot().pending(), 0);
    assert_eq!(writer.total_writes(), backup.files.len());
    for id in backup.payloads.keys() {
        assert_eq!(transport.fetches_of(id), 3);
    }
}

#[tokio::test]
async fn rejected_session_stops_everything() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    transport.fail_all(&[Fault::Status(401)]);
    let writer = Arc::new(MemoryWriter::new());

    let downloader = SignatureDownloader::new(
        manager(&backup, writer.clone()),
        transport.clone() as Arc<dyn Transport>,
        &config(1),
    );
    let result = downloader
        .execute(&Tally::new(), &CancellationToken::new())
        .await;

    assert!(matches!(
        result,
        Err(Fatal::Authentication(err)) if err.status() == Some(401)
    ));
    assert_eq!(transport.fetches(), 1);
    // only the empty file, which needs no container
    assert_eq!(writer.total_writes(), 1);
}

#[tokio::test]
async fn rejected_session_with_many_workers_fetches_no_further() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport().with_latency(Duration::from_millis(5)));
    transport.fail_all(&[Fault::Status(401)]);
    let threads = 3;

    let downloader = SignatureDownloader::new(
        manager(&backup, Arc::new(MemoryWriter::new())),
        transport.clone() as Arc<dyn Transport>,
        &config(threads),
    );
    let result = downloader
        .execute(&Tally::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Fatal::Authentication(_))));

    // detached workers may still finish the fetch they started
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.fetches() <= threads);
}

#[tokio::test]
async fn failed_writes_are_retried_next_round() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    let writer = Arc::new(MemoryWriter::new());
    let victim = backup.signature("dir/file-7").unwrap();
    writer.fail_next(victim, 1);

    let downloader = SignatureDownloader::new(
        manager(&backup, writer.clone()),
        transport.clone() as Arc<dyn Transport>,
        &config(2),
    );
    let tally = Tally::new();
    let report = downloader
        .execute(&tally, &CancellationToken::new())
        .await
        .unwrap();

    // the second round found the file satisfied before fetching anything
    assert!(report.is_complete());
    assert_eq!(report.rounds, 1);
    assert_eq!(report.written, backup.files.len());
    assert_eq!(tally.snapshot().pending(), 0);
    assert!(report.failures.is_empty());
    assert_eq!(writer.attempts(&victim), 2);
    assert_eq!(&writer.written(&victim).unwrap(), &backup.files[&victim]);
    // the chunks stayed in the store, nothing was fetched again
    assert_eq!(transport.fetches(), backup.payloads.len());
}

#[tokio::test]
async fn redelivered_containers_are_harmless() {
    init_tracing();
    let backup = mixed_backup();
    let writer = Arc::new(MemoryWriter::new());
    let manager = manager(&backup, writer.clone());

    let containers = backup.containers();
    for container in containers.iter().chain(containers.iter().rev()) {
        manager
            .absorb(Arc::clone(container), backup.payload(&container.id))
            .await
            .unwrap();
    }
    manager.finalize_satisfied().await.unwrap();

    assert!(manager.pending_signatures().is_empty());
    assert_eq!(writer.total_writes(), backup.files.len());
    for signature in backup.files.keys() {
        assert_eq!(writer.attempts(signature), 1);
    }
}

#[tokio::test]
async fn cancellation_is_fatal() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport());
    let downloader = SignatureDownloader::new(
        manager(&backup, Arc::new(MemoryWriter::new())),
        transport.clone() as Arc<dyn Transport>,
        &config(2),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = downloader.execute(&Tally::new(), &cancel).await;
    assert!(matches!(result, Err(Fatal::Interrupted(_))));
    assert_eq!(transport.fetches(), 0);
}

#[tokio::test]
async fn cancellation_does_not_wait_for_slow_fetches() {
    init_tracing();
    let backup = mixed_backup();
    let transport = Arc::new(backup.transport().with_latency(Duration::from_secs(5)));
    let config = EngineConfig::builder()
        .threads(2)
        .stagger_delay(Duration::ZERO)
        .build();
    let downloader = SignatureDownloader::new(
        manager(&backup, Arc::new(MemoryWriter::new())),
        transport.clone() as Arc<dyn Transport>,
        &config,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = downloader.execute(&Tally::new(), &cancel).await;
    assert!(matches!(result, Err(Fatal::Interrupted(_))));
    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    assert_eq!(transport.fetches(), 2);
}

struct PanickingWriter;

#[async_trait::async_trait]
impl SignatureWriter for PanickingWriter {
    async fn write(
        &self,
        signature: &Signature,
        _reader: &mut ComposedReader,
    ) -> anyhow::Result<Option<Vec<WriteReport>>> {
        panic!("writer gave up on {signature}");
    }
}

#[tokio::test]
async fn panicking_worker_is_an_internal_fault() {
    init_tracing();
    // four files per container, no empty file
    let backup = BackupBuilder::new()
        .chunking(ChunkingStrategy::Fixed(16))
        .container_size(64)
        .files((0..8u8).map(|i| (format!("f{i}"), vec![i; 16])))
        .build()
        .unwrap();
    assert_eq!(backup.containers().len(), 2);
    let transport = Arc::new(backup.transport());

    let downloader = SignatureDownloader::new(
        manager(&backup, Arc::new(PanickingWriter)),
        transport.clone() as Arc<dyn Transport>,
        &config(1),
    );
    let result = downloader
        .execute(&Tally::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Fatal::Internal(message)) if message.contains("panicked")));
    // neither another container nor another round
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn restores_into_a_directory() {
    init_tracing();
    let backup = mixed_backup();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = DirectoryWriter::new(dir.path());
    writer.extend(
        backup
            .paths
            .iter()
            .map(|(path, signature)| (*signature, path.clone())),
    );
    let manager = Arc::new(StoreManager::from_manifest(
        backup.manifest.build().unwrap(),
        chunk_decrypters(),
        Arc::new(writer),
        Arc::new(TracingProgress::new(Some(Level::VV))),
    ));
    let downloader = SignatureDownloader::new(
        manager,
        Arc::new(backup.transport()) as Arc<dyn Transport>,
        &config(4),
    );
    let report = downloader
        .execute(&Tally::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_complete());

    for (path, signature) in &backup.paths {
        let restored = std::fs::read(dir.path().join(path)).unwrap();
        assert_eq!(&restored, &backup.files[signature], "{}", path.display());
    }
}
