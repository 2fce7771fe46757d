use std::io::{self, Read};

use chunkhaul::synthetic::{ChunkingStrategy, Fault};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal};

pub struct WorkloadBuilder {
    pub name: &'static str,
    pub files: usize,
    pub seed: u64,
    pub threads: usize,
    pub rounds: usize,
    pub chunking: ChunkingStrategy,

    pub p50_size: u64,
    pub p99_size: u64,

    pub ok_weight: u8,
    pub transient_weight: u8,
    pub corrupt_weight: u8,
    pub reject_session: bool,
}

impl WorkloadBuilder {
    pub fn files(mut self, files: usize) -> Self {
        self.files = files;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn chunking(mut self, chunking: ChunkingStrategy) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    /// Relative odds of a container fetch succeeding, failing with a 5xx, or
    /// delivering a corrupt payload.
    pub fn fault_weights(mut self, ok: u8, transient: u8, corrupt: u8) -> Self {
        self.ok_weight = ok;
        self.transient_weight = transient;
        self.corrupt_weight = corrupt;
        self
    }

    /// Fetch with a token the host does not accept.
    pub fn reject_session(mut self, reject: bool) -> Self {
        self.reject_session = reject;
        self
    }

    pub fn build(self) -> anyhow::Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let fault_distribution =
            WeightedIndex::new([self.ok_weight, self.transient_weight, self.corrupt_weight])?;

        Ok(Workload {
            config: self,
            rng,
            size_distribution,
            fault_distribution,
        })
    }
}

pub struct Workload {
    pub config: WorkloadBuilder,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates file sizes.
    size_distribution: LogNormal<f64>,
    /// Picks between ok, transient and corrupt fetches.
    fault_distribution: WeightedIndex<u8>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            files: 100,
            seed: rand::random(),
            threads: 4,
            rounds: 3,
            chunking: ChunkingStrategy::default(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            ok_weight: 90,
            transient_weight: 8,
            corrupt_weight: 2,
            reject_session: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    /// Generates the contents of every file of this workload.
    pub fn generate_files(&mut self) -> io::Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::with_capacity(self.config.files);
        for i in 0..self.config.files {
            let seed = self.rng.next_u64();
            let mut contents = vec![];
            self.get_payload(seed).read_to_end(&mut contents)?;
            files.push((format!("{}/file-{i:05}", self.config.name), contents));
        }
        Ok(files)
    }

    /// The faults that the next fetches of one container run into, in order.
    ///
    /// A container fails at most `rounds - 1` times, so every workload can be
    /// restored completely.
    pub fn next_faults(&mut self) -> Vec<Fault> {
        let mut faults = vec![];
        while faults.len() + 1 < self.config.rounds {
            match self.fault_distribution.sample(&mut self.rng) {
                0 => break,
                1 => {
                    let status = [500, 502, 503, 504][self.rng.random_range(0..4)];
                    faults.push(Fault::Status(status));
                }
                _ => faults.push(Fault::Corrupt),
            }
        }
        faults
    }
}

pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}
