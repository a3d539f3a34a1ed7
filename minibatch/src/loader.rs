//! Epoch-wise iteration over minibatches of a seed sequence.
//!
//! Every call to [`MinibatchIterator::epoch`] partitions the (optionally reshuffled) seed
//! sequence into contiguous batches and returns a lazy [`Epoch`] yielding one
//! [`MinibatchRecord`] per batch, strictly in batch order.
//!
//! With `num_workers > 0` batches are built ahead of time on worker threads. The consumer hands
//! batch indices to the workers through a job queue and keeps at most
//! `num_workers * prefetch_factor` batches in flight, so idle workers wait for the consumer to
//! catch up. Results may complete out of order; they are buffered and released by index.
//! Dropping an epoch cancels outstanding work and joins its workers.
//!
//! Every batch samples from its own random stream derived from the loader seed, the epoch
//! number and the batch index, so the produced blocks do not depend on the number of workers.

use std::{
    any::Any,
    collections::BTreeMap,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, instrument, warn};

use crate::{
    block::MinibatchRecord, config::BatchOptions, BlockChainAssembler, NeighborSampler, NodeId,
    Result, SamplingError, UniformNeighborSampler,
};

/// Random stream used to shuffle the seeds; batch `b` uses stream `b + 1`.
const SHUFFLE_STREAM: u64 = 0;

fn stream_rng(base_seed: u64, epoch: u64, stream: u64) -> ChaCha8Rng {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&base_seed.to_le_bytes());
    seed[8..16].copy_from_slice(&epoch.to_le_bytes());
    let mut rng = ChaCha8Rng::from_seed(seed);
    rng.set_stream(stream);
    rng
}

pub struct MinibatchIterator<S = UniformNeighborSampler> {
    assembler: Arc<BlockChainAssembler<S>>,
    seeds: Vec<NodeId>,
    options: BatchOptions,
    base_seed: u64,
    next_epoch: u64,
}

impl<S: NeighborSampler + 'static> MinibatchIterator<S> {
    /// Validates the options and every seed id up front; no batch is built here.
    pub fn new(
        assembler: BlockChainAssembler<S>,
        seeds: Vec<NodeId>,
        options: BatchOptions,
    ) -> Result<Self> {
        options.validate()?;
        assembler.graph().check_nodes(&seeds)?;
        let base_seed = options.random_seed.unwrap_or_else(rand::random);
        debug!(
            num_seeds = seeds.len(),
            batch_size = options.batch_size,
            num_workers = options.num_workers,
            base_seed,
            "created minibatch iterator"
        );
        Ok(Self {
            assembler: Arc::new(assembler),
            seeds,
            options,
            base_seed,
            next_epoch: 0,
        })
    }

    pub fn assembler(&self) -> &BlockChainAssembler<S> {
        &self.assembler
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Seed actually used for the random streams, drawn at construction when none was given.
    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Number of batches every epoch yields.
    pub fn num_batches(&self) -> usize {
        self.options.num_batches(self.seeds.len())
    }

    /// Starts the next epoch. The previous epoch must have been dropped, which guarantees its
    /// workers are joined and none of its records can show up in this one.
    #[instrument(name = "MinibatchIterator::epoch", skip_all, level = "debug", fields(epoch = self.next_epoch))]
    pub fn epoch(&mut self) -> Epoch<'_, S> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let mut order = self.seeds.clone();
        if self.options.shuffle {
            order.shuffle(&mut stream_rng(self.base_seed, epoch, SHUFFLE_STREAM));
        }
        let num_batches = self.num_batches();
        let plan = Arc::new(EpochPlan {
            assembler: self.assembler.clone(),
            order,
            batch_size: self.options.batch_size,
            base_seed: self.base_seed,
            epoch,
        });
        info!(
            epoch,
            num_batches,
            num_workers = self.options.num_workers,
            "starting epoch"
        );

        let producer = if self.options.num_workers == 0 || num_batches == 0 {
            Producer::Inline(plan)
        } else {
            let window = self.options.num_workers * self.options.prefetch_factor;
            match Prefetcher::spawn(plan.clone(), self.options.num_workers, window, num_batches) {
                Ok(prefetcher) => Producer::Prefetch(prefetcher),
                Err(e) => {
                    warn!("could not spawn prefetch workers, building batches inline: {e}");
                    Producer::Inline(plan)
                }
            }
        };
        Epoch {
            index: epoch,
            next_batch: 0,
            num_batches,
            finished: false,
            producer,
            _iterator: PhantomData,
        }
    }
}

/// Everything needed to build any batch of one epoch.
struct EpochPlan<S> {
    assembler: Arc<BlockChainAssembler<S>>,
    order: Vec<NodeId>,
    batch_size: usize,
    base_seed: u64,
    epoch: u64,
}

impl<S: NeighborSampler> EpochPlan<S> {
    fn build(&self, batch: usize) -> MinibatchRecord {
        let start = batch * self.batch_size;
        let end = (start + self.batch_size).min(self.order.len());
        let seeds = &self.order[start..end];
        let mut rng = stream_rng(self.base_seed, self.epoch, batch as u64 + 1);
        let chain = self.assembler.assemble_unchecked(seeds, &mut rng);
        MinibatchRecord::new(batch, seeds.to_vec(), chain)
    }
}

enum Producer<S> {
    Inline(Arc<EpochPlan<S>>),
    Prefetch(Prefetcher),
}

struct Prefetcher {
    jobs: Option<Sender<usize>>,
    results: Option<Receiver<(usize, Result<MinibatchRecord>)>>,
    /// Completed batches waiting for their turn.
    pending: BTreeMap<usize, Result<MinibatchRecord>>,
    next_job: usize,
    num_batches: usize,
    cancelled: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Prefetcher {
    fn spawn<S: NeighborSampler + 'static>(
        plan: Arc<EpochPlan<S>>,
        num_workers: usize,
        window: usize,
        num_batches: usize,
    ) -> std::io::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<usize>(window);
        let (result_tx, result_rx) = crossbeam_channel::bounded(window);
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut prefetcher = Self {
            jobs: Some(job_tx),
            results: Some(result_rx),
            pending: BTreeMap::new(),
            next_job: 0,
            num_batches,
            cancelled: cancelled.clone(),
            workers: Vec::with_capacity(num_workers),
        };
        for worker in 0..num_workers {
            let plan = plan.clone();
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let cancelled = cancelled.clone();
            let spawned = thread::Builder::new()
                .name(format!("minibatch-worker-{worker}"))
                .spawn(move || worker_loop(&plan, &jobs, &results, &cancelled));
            match spawned {
                Ok(handle) => prefetcher.workers.push(handle),
                Err(e) => {
                    prefetcher.shutdown();
                    return Err(e);
                }
            }
        }
        for _ in 0..window.min(num_batches) {
            prefetcher.submit_next();
        }
        Ok(prefetcher)
    }

    fn submit_next(&mut self) {
        if self.next_job >= self.num_batches {
            return;
        }
        if let Some(jobs) = &self.jobs {
            // a failed send means every worker is gone, which `next_result` reports
            let _ = jobs.send(self.next_job);
        }
        self.next_job += 1;
    }

    /// Blocks until batch `batch` is available.
    fn next_result(&mut self, batch: usize) -> Result<MinibatchRecord> {
        loop {
            if let Some(result) = self.pending.remove(&batch) {
                self.submit_next();
                return result;
            }
            let received = match &self.results {
                Some(results) => results.recv().ok(),
                None => None,
            };
            match received {
                Some((index, result)) => {
                    self.pending.insert(index, result);
                }
                None => {
                    return Err(SamplingError::WorkerPanicked {
                        batch,
                        message: "all prefetch workers exited".to_string(),
                    })
                }
            }
        }
    }

    /// Cancels outstanding work, releases the queues and joins every worker. Idempotent.
    fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.jobs.take();
        self.results.take();
        self.pending.clear();
        let num_workers = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("prefetch worker terminated abnormally");
            }
        }
        if num_workers > 0 {
            debug!(num_workers, "joined prefetch workers");
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<S: NeighborSampler>(
    plan: &EpochPlan<S>,
    jobs: &Receiver<usize>,
    results: &Sender<(usize, Result<MinibatchRecord>)>,
    cancelled: &AtomicBool,
) {
    while let Ok(batch) = jobs.recv() {
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| plan.build(batch))).map_err(
            |payload| SamplingError::WorkerPanicked {
                batch,
                message: panic_message(payload.as_ref()),
            },
        );
        if results.send((batch, result)).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// The batches of one epoch, yielded in batch order.
///
/// The first error ends the epoch: the iterator yields it once and then only `None`.
pub struct Epoch<'a, S> {
    index: u64,
    next_batch: usize,
    num_batches: usize,
    finished: bool,
    producer: Producer<S>,
    _iterator: PhantomData<&'a mut MinibatchIterator<S>>,
}

impl<S> Epoch<'_, S> {
    /// Epoch number, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Producer::Prefetch(prefetcher) = &mut self.producer {
            prefetcher.shutdown();
        }
    }
}

impl<S: NeighborSampler> Iterator for Epoch<'_, S> {
    type Item = Result<MinibatchRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.next_batch >= self.num_batches {
            self.finish();
            return None;
        }
        let batch = self.next_batch;
        self.next_batch += 1;
        let result = match &mut self.producer {
            Producer::Inline(plan) => Ok(plan.build(batch)),
            Producer::Prefetch(prefetcher) => prefetcher.next_result(batch),
        };
        if let Err(e) = &result {
            warn!(epoch = self.index, batch, "stopping epoch: {e}");
            self.finish();
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            let remaining = self.num_batches - self.next_batch;
            (0, Some(remaining))
        }
    }
}
