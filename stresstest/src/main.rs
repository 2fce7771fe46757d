use chunkhaul::synthetic::ChunkingStrategy;
use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod host;
mod stresstest;
mod workload;

const KIB: u32 = 1024;
const MIB: u32 = 1024 * KIB;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let workloads = vec![
        Workload::builder("small-files")
            .files(500)
            .size_distribution(4 * KIB as u64, 64 * KIB as u64)
            .fault_weights(100, 0, 0)
            .build()?,
        Workload::builder("flaky-hosts")
            .files(200)
            .threads(8)
            .rounds(4)
            .fault_weights(70, 25, 5)
            .build()?,
        Workload::builder("large-files")
            .files(20)
            .size_distribution(MIB as u64, 16 * MIB as u64)
            .chunking(ChunkingStrategy::Cdc(256 * KIB, MIB, 4 * MIB))
            .build()?,
        Workload::builder("stale-session")
            .files(10)
            .reject_session(true)
            .build()?,
    ];

    perform_stresstest(workloads).await
}
