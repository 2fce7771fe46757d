use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use bytesize::ByteSize;
use chunkhaul::decrypt::chunk_decrypters;
use chunkhaul::model::Compression;
use chunkhaul::progress::TracingProgress;
use chunkhaul::synthetic::{BackupBuilder, MemoryWriter};
use chunkhaul::{EngineConfig, Fatal, SignatureDownloader, StoreManager, Tally};
use sketches_ddsketch::DDSketch;
use tokio_util::sync::CancellationToken;

use crate::host::{fetch_manifest, ContainerHost, HttpTransport};
use crate::workload::Workload;

const SESSION_TOKEN: &str = "stresstest-session";
const CONTAINER_SIZE: usize = 4 * 1024 * 1024;

pub async fn perform_stresstest(workloads: Vec<Workload>) -> Result<()> {
    let host = ContainerHost::start(SESSION_TOKEN).await?;
    let client = reqwest::Client::new();

    for (i, mut workload) in workloads.into_iter().enumerate() {
        let files = workload.generate_files()?;
        let backup = BackupBuilder::new()
            .chunking(workload.config.chunking)
            .container_size(CONTAINER_SIZE)
            .compression(Compression::Zstd)
            .hosts([host.base_url()])
            .files(files)
            .build()?;
        host.publish(&backup)?;
        for container in backup.containers() {
            let faults = workload.next_faults();
            if !faults.is_empty() {
                host.fail(&container, faults);
            }
        }

        // the listing always succeeds; a stale session only shows on fetches
        let manifest = fetch_manifest(&client, &host.base_url(), SESSION_TOKEN).await?;

        let config = &workload.config;
        let token = if config.reject_session {
            "stale-session"
        } else {
            SESSION_TOKEN
        };
        let transport = Arc::new(HttpTransport::new(client.clone(), token));
        let writer = Arc::new(MemoryWriter::new());
        let manager = StoreManager::from_manifest(
            manifest.build()?,
            chunk_decrypters(),
            writer.clone(),
            Arc::new(TracingProgress::new(None)),
        );
        let engine = EngineConfig::builder()
            .threads(config.threads)
            .retries(config.rounds, config.rounds)
            .stagger_delay(Duration::from_millis(10))
            .build();
        let downloader = SignatureDownloader::new(Arc::new(manager), transport.clone(), &engine);

        let tally = Tally::new();
        let start = Instant::now();
        let result = downloader.execute(&tally, &CancellationToken::new()).await;
        let elapsed = start.elapsed();

        println!(
            "# Workload {i}: {} (threads: {}, rounds: {})",
            workload.name(),
            config.threads,
            config.rounds
        );
        println!(
            "  file sizes {}-{}",
            ByteSize::b(config.p50_size),
            ByteSize::b(config.p99_size)
        );
        println!(
            "  {} files, {} in {} containers",
            manifest.file_count(),
            ByteSize::b(backup.total_bytes()),
            backup.payloads.len()
        );

        let report = match result {
            Err(Fatal::Authentication(err)) if config.reject_session => {
                println!("=> session rejected: {err}");
                continue;
            }
            Err(err) => return Err(err.into()),
            Ok(_) if config.reject_session => anyhow::bail!("a stale session was accepted"),
            Ok(report) => report,
        };

        if !report.is_complete() {
            anyhow::bail!(
                "{} files unresolved after {} rounds",
                report.unresolved.len(),
                report.rounds
            );
        }
        for (signature, contents) in &backup.files {
            if writer.written(signature).as_ref() != Some(contents) {
                anyhow::bail!("restored contents of {signature} do not match");
            }
        }

        let throughput = backup.total_bytes() as f64 / elapsed.as_secs_f64();
        println!(
            "=> {} files in {} rounds, {elapsed:.2?}, {}/s",
            report.written,
            report.rounds,
            ByteSize::b(throughput as u64)
        );
        print_latencies(&transport.latencies.lock());
    }

    Ok(())
}

fn print_latencies(sketch: &DDSketch) {
    let fetches = sketch.count();
    if fetches == 0 {
        return;
    }
    let quantile = |q| {
        sketch
            .quantile(q)
            .ok()
            .flatten()
            .map(Duration::from_secs_f64)
            .unwrap_or_default()
    };

    let avg = Duration::from_secs_f64(sketch.sum().unwrap_or_default() / fetches as f64);
    let p50 = quantile(0.5);
    let p90 = quantile(0.9);
    let p99 = quantile(0.99);
    println!("  {fetches} fetches; avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
