//! The agent orchestrator.
//!
//! One dispatcher loop owns the whole pipeline: it drains the two ingest
//! channels (ordinary and priority-bearing traces, already normalized by the
//! transport), runs the per-trace protocol, and fans every admitted trace
//! out to the concentrator and the chosen sampler. On the flush tick the
//! subsystems' outputs are assembled into one payload for the uploader; on
//! the watchdog tick the pre-sampler is re-tuned.
//!
//! Fan-out runs on a bounded task pool so a burst cannot spawn unbounded
//! work, and each fan-out task catches its own panics. A poisoned trace
//! loses that trace, never the dispatcher.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::filters::{self, Filter};
use crate::model::normalizer::now_ns;
use crate::model::{trace, ProcessedTrace, Span, Trace};
use crate::model::sublayers::{compute_sublayers, set_sublayers_on_span};
use crate::payload::Payload;
use crate::receiver::{LanguageRegistry, ReceiverStats, LANGUAGE_HEADER_KEY};
use crate::sampler::presampler::PreSampler;
use crate::sampler::rate_by_service::RateByService;
use crate::sampler::Sampler;
use crate::stats::concentrator::Concentrator;
use crate::watchdog::{DieHook, Watchdog};

/// Upper bound on concurrently running fan-out tasks.
const FANOUT_POOL_SIZE: u32 = 64;

/// Capacity of the uploader channel; a slow uploader costs payloads, not
/// dispatcher liveness.
const PAYLOAD_CHANNEL_CAPACITY: usize = 10;

/// Canonicalizes a span's resource. The real implementation lives outside
/// the core; the agent only promises to invoke it once per span, after
/// sublayer computation and before weight propagation.
pub trait Quantizer: Send + Sync {
    fn quantize(&self, span: &mut Span);
}

/// Identity quantizer used when no quantizer is injected.
pub struct NoopQuantizer;

impl Quantizer for NoopQuantizer {
    fn quantize(&self, _span: &mut Span) {}
}

/// Creates the bounded uploader channel the agent pushes payloads into.
pub fn payload_channel() -> (mpsc::Sender<Payload>, mpsc::Receiver<Payload>) {
    mpsc::channel(PAYLOAD_CHANNEL_CAPACITY)
}

/// The ingestion-and-sampling pipeline, wired and ready to run.
pub struct Agent {
    config: Arc<Config>,
    concentrator: Arc<Concentrator>,
    score_sampler: Arc<Sampler>,
    priority_sampler: Arc<Sampler>,
    filters: Vec<Box<dyn Filter>>,
    pre_sampler: Arc<PreSampler>,
    rates: Arc<RateByService>,
    stats: Arc<ReceiverStats>,
    languages: Arc<LanguageRegistry>,
    quantizer: Arc<dyn Quantizer>,
    fanout_permits: Arc<Semaphore>,
    watchdog: Watchdog,
    traces_rx: Option<mpsc::Receiver<Trace>>,
    distributed_rx: Option<mpsc::Receiver<Trace>>,
    payload_tx: mpsc::Sender<Payload>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        traces_rx: mpsc::Receiver<Trace>,
        distributed_rx: mpsc::Receiver<Trace>,
        payload_tx: mpsc::Sender<Payload>,
        die: DieHook,
        shutdown: CancellationToken,
    ) -> Self {
        let rates = Arc::new(RateByService::new(config.priority_sampler_timeout));
        let pre_sampler = Arc::new(PreSampler::new());
        let concentrator = Arc::new(Concentrator::new(
            config.bucket_interval_ns(),
            config.extra_aggregators.clone(),
            config.hostname.clone(),
        ));
        let score_sampler = Arc::new(Sampler::new_score_sampler(&config));
        let priority_sampler =
            Arc::new(Sampler::new_priority_sampler(&config, Arc::clone(&rates)));
        let filters = filters::setup(&config);
        let watchdog = Watchdog::new(&config, Arc::clone(&pre_sampler), die);

        Self {
            config,
            concentrator,
            score_sampler,
            priority_sampler,
            filters,
            pre_sampler,
            rates,
            stats: Arc::new(ReceiverStats::default()),
            languages: Arc::new(LanguageRegistry::default()),
            quantizer: Arc::new(NoopQuantizer),
            fanout_permits: Arc::new(Semaphore::new(FANOUT_POOL_SIZE as usize)),
            watchdog,
            traces_rx: Some(traces_rx),
            distributed_rx: Some(distributed_rx),
            payload_tx,
            shutdown,
        }
    }

    /// Installs the resource quantizer. Must happen before [`run`](Self::run).
    pub fn with_quantizer(mut self, quantizer: Arc<dyn Quantizer>) -> Self {
        self.quantizer = quantizer;
        self
    }

    /// Pre-sampler handle the transport consults before decoding.
    pub fn pre_sampler(&self) -> Arc<PreSampler> {
        Arc::clone(&self.pre_sampler)
    }

    /// Rate table the transport publishes back to tracers.
    pub fn rates(&self) -> Arc<RateByService> {
        Arc::clone(&self.rates)
    }

    /// Reject counters the transport maps into response headers.
    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Registry of observed tracer languages.
    pub fn languages(&self) -> Arc<LanguageRegistry> {
        Arc::clone(&self.languages)
    }

    /// Runs the dispatcher until shutdown, then drains in-flight fan-out and
    /// flushes one last time.
    pub async fn run(mut self) {
        let Some(mut traces_rx) = self.traces_rx.take() else {
            error!("agent run() called twice");
            return;
        };
        let Some(mut distributed_rx) = self.distributed_rx.take() else {
            error!("agent run() called twice");
            return;
        };

        let shutdown = self.shutdown.clone();
        tokio::spawn(Arc::clone(&self.score_sampler).run(shutdown.clone()));
        tokio::spawn(Arc::clone(&self.priority_sampler).run(shutdown.clone()));

        let mut flush_ticker = tokio::time::interval(self.config.bucket_interval);
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The watchdog interval must never be too short: the agent must not
        // be able to start and kill itself in a tight loop.
        let mut watchdog_ticker = tokio::time::interval(self.config.watchdog_interval);
        watchdog_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("trace agent running");
        loop {
            tokio::select! {
                maybe_trace = traces_rx.recv() => match maybe_trace {
                    Some(t) => self.process(t).await,
                    None => self.shutdown.cancel(),
                },
                maybe_trace = distributed_rx.recv() => match maybe_trace {
                    Some(t) => self.process_distributed(t).await,
                    None => self.shutdown.cancel(),
                },
                _ = flush_ticker.tick() => self.flush().await,
                _ = watchdog_ticker.tick() => self.watchdog.tick(),
                () = shutdown.cancelled() => {
                    info!("exiting");
                    self.drain().await;
                    self.flush().await;
                    return;
                }
            }
        }
    }

    /// Processes an ordinary trace through the score sampler.
    pub async fn process(&self, trace: Trace) {
        self.process_with_sampler(trace, Arc::clone(&self.score_sampler))
            .await;
    }

    /// Processes a priority-bearing trace through the priority sampler.
    pub async fn process_distributed(&self, trace: Trace) {
        self.process_with_sampler(trace, Arc::clone(&self.priority_sampler))
            .await;
    }

    async fn process_with_sampler(&self, mut trace: Trace, sampler: Arc<Sampler>) {
        if trace.is_empty() {
            // Normalization rejects empty traces before they get here.
            debug!("skipping received empty trace");
            return;
        }
        let Some(root) = trace::root_index(&trace) else {
            debug!("skipping trace without a root");
            return;
        };

        if trace[root].end() < now_ns() - 2 * self.config.bucket_interval_ns() {
            error!(
                "skipping trace with root too far in past, service={} start={}",
                trace[root].service, trace[root].start
            );
            self.stats.record_dropped(trace.len() as u64);
            return;
        }

        for filter in &self.filters {
            if filter.keep(&trace[root]) {
                continue;
            }
            debug!("rejecting trace by filter, resource={}", trace[root].resource);
            self.stats.record_filtered(trace.len() as u64);
            return;
        }

        // Fold the admission gate's rate into whatever the client applied.
        trace[root].apply_sample_rate(self.pre_sampler.rate());

        trace::compute_top_level(&mut trace);

        let sublayers = compute_sublayers(&trace);
        set_sublayers_on_span(&mut trace[root], &sublayers);

        for span in trace.iter_mut() {
            self.quantizer.quantize(span);
        }

        // Last mutation before the trace is shared: the fan-out reads the
        // metric maps concurrently.
        trace::compute_weight(&mut trace, root);

        let env = trace::env(&trace, root)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_env.clone());
        let pt = Arc::new(ProcessedTrace {
            trace,
            root,
            env,
            sublayers,
        });

        self.spawn_fanout("concentrator", {
            let concentrator = Arc::clone(&self.concentrator);
            let pt = Arc::clone(&pt);
            move || concentrator.add(&pt)
        })
        .await;
        self.spawn_fanout("sampler", {
            let pt = Arc::clone(&pt);
            move || {
                sampler.add(&pt);
            }
        })
        .await;
    }

    /// Runs one downstream hand-off on the bounded pool, isolated from
    /// panics. Waits for a permit, so bursts are absorbed by the ingest
    /// channel instead of unbounded tasks.
    async fn spawn_fanout<F>(&self, target: &'static str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.fanout_permits).acquire_owned().await else {
            // The semaphore only closes on shutdown.
            return;
        };
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let _permit = permit;
            if AssertUnwindSafe(async { work() })
                .catch_unwind()
                .await
                .is_err()
            {
                stats.record_fanout_panic();
                error!("panic in {target} fan-out task, trace lost");
            }
        });
    }

    /// Waits until every in-flight fan-out task has finished.
    async fn drain(&self) {
        if let Ok(_all) = self.fanout_permits.acquire_many(FANOUT_POOL_SIZE).await {
            debug!("fan-out drained");
        }
    }

    /// Assembles one payload from every subsystem and hands it to the
    /// uploader. Score-sampled traces come first, priority-sampled traces
    /// are appended; downstream consumers count on that order.
    pub async fn flush(&self) {
        let now = now_ns();
        let concentrator = Arc::clone(&self.concentrator);
        let stats_task = tokio::spawn(async move { concentrator.flush(now) });
        let score = Arc::clone(&self.score_sampler);
        let priority = Arc::clone(&self.priority_sampler);
        let traces_task = tokio::spawn(async move {
            let mut traces = score.flush();
            traces.extend(priority.flush());
            traces
        });

        let mut payload = Payload::new(self.config.hostname.clone(), self.config.default_env.clone());
        match stats_task.await {
            Ok(stats) => payload.stats = stats,
            Err(err) => {
                self.stats.record_fanout_panic();
                error!("stats flush task failed: {err}");
            }
        }
        match traces_task.await {
            Ok(traces) => payload.traces = traces,
            Err(err) => {
                self.stats.record_fanout_panic();
                error!("trace flush task failed: {err}");
            }
        }

        if payload.is_empty() {
            debug!("nothing to flush");
            return;
        }
        payload.set_extra(LANGUAGE_HEADER_KEY, self.languages.languages());

        if let Err(err) = self.payload_tx.try_send(payload) {
            error!("uploader unavailable, dropping payload: {err}");
        }
    }
}
