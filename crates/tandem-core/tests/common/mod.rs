//! Shared fixtures: deterministic collaborators and an in-process pool

#![allow(dead_code, unused_imports)]

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::broadcast::BroadcastChannel;
use tandem_core::config::TandemConfig;
use tandem_core::generation::{GenerationLoop, GenerationState};
use tandem_core::model::{self, Model, StepOutput};
use tandem_core::session::PromptTemplate;
use tandem_core::sync::RequestSynchronizer;
use tandem_core::tokenizer::Tokenizer;
use tandem_core::transport::{LocalGroup, Transport};
use tandem_core::{Primary, Result, Worker};
use tokio::task::JoinHandle;

pub use tandem_core::test_support::{CharTokenizer, ScriptedModel, StallingTransport, BOS, EOS};

pub const PREAMBLE: &str = "PRE";

/// Samples characters from a seeded generator; greedy at temperature 0
pub struct SeededModel {
    seed: u64,
    rng: StdRng,
}

const ALPHABET: &[char] = &['a', 'e', 'l', 'm', 'o', ' ', '.', '\n'];

impl SeededModel {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Model for SeededModel {
    fn step(&mut self, state: &GenerationState) -> Result<StepOutput> {
        if state.generated.is_empty() {
            self.rng = StdRng::seed_from_u64(self.seed);
        }
        let index = if state.temperature == 0.0 {
            state.position() % ALPHABET.len()
        } else {
            self.rng.gen_range(0..ALPHABET.len())
        };
        Ok(StepOutput {
            token: u32::from(ALPHABET[index]),
            end_of_sequence: false,
        })
    }
}

pub fn test_config(world_size: usize) -> TandemConfig {
    let mut config = TandemConfig::default();
    config.cluster.world_size = world_size;
    config.chat.preamble = PREAMBLE.to_string();
    config
}

/// A running in-process pool: the primary plus one task per worker
pub struct Pool {
    pub primary: Primary,
    pub workers: Vec<JoinHandle<Result<usize>>>,
}

impl Pool {
    /// Drop the primary and collect each worker's completed-request count
    pub async fn shutdown(self) -> Vec<usize> {
        drop(self.primary);
        let mut served = Vec::new();
        for worker in self.workers {
            served.push(worker.await.unwrap().unwrap());
        }
        served
    }
}

pub async fn spawn_pool<F>(config: &TandemConfig, model_for_rank: F) -> Pool
where
    F: FnMut(usize) -> Box<dyn Model>,
{
    let timeout = config.sync.timeout();
    let transports = LocalGroup::new(config.cluster.world_size)
        .into_iter()
        .map(|t| (Arc::new(t) as Arc<dyn Transport>, timeout))
        .collect();
    spawn_pool_over(config, transports, model_for_rank).await
}

/// Like [`spawn_pool`], over caller-supplied transports, each with its own
/// synchronisation bound
pub async fn spawn_pool_over<F>(
    config: &TandemConfig,
    transports: Vec<(Arc<dyn Transport>, Option<Duration>)>,
    mut model_for_rank: F,
) -> Pool
where
    F: FnMut(usize) -> Box<dyn Model>,
{
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(CharTokenizer);
    let template = PromptTemplate {
        preamble: PREAMBLE.to_string(),
        user_tag: config.chat.user_tag.clone(),
        assistant_tag: config.chat.assistant_tag.clone(),
    };
    let fingerprint = config.fingerprint(PREAMBLE);
    let seed = config.model.seed;

    let mut primary = None;
    let mut workers = Vec::new();
    for (transport, timeout) in transports {
        let rank = transport.rank();
        let channel = BroadcastChannel::new(transport, config.sync.payload_capacity, timeout);
        let synchronizer = RequestSynchronizer::new(
            channel,
            Arc::clone(&tokenizer),
            &config.sync,
            config.chat.stop_marker.clone(),
        );
        let generator = GenerationLoop::new(
            model::shared(model_for_rank(rank)),
            Arc::clone(&tokenizer),
            config.model.max_seq_len,
        );

        if rank == 0 {
            primary = Some(Primary::new(
                synchronizer,
                generator,
                template.clone(),
                config.chat.history_length,
            ));
        } else {
            let worker = Worker::new(synchronizer, generator);
            workers.push(tokio::spawn(async move {
                worker.start(seed, fingerprint).await?;
                worker.serve().await
            }));
        }
    }

    let primary = primary.expect("pool has a primary");
    primary.start(seed, fingerprint).await.unwrap();
    Pool { primary, workers }
}
