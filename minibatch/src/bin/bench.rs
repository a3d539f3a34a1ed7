//! Measures minibatch construction and layer-wise inference on a synthetic graph and appends one
//! CSV row per run.

use std::{collections::HashMap, fs::OpenOptions, path::Path, sync::Arc, time};

use anyhow::{ensure, Context};
use clap::Parser;
use csv::WriterBuilder;
use minibatch::{
    testing::{random_features, random_graph, MeanAggregationLayer},
    BatchOptions, FanoutSpec, GnnLayer, LayerwiseInferenceDriver, LoaderConfig, NodeId,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser, Debug)]
struct BenchArgs {
    /// number of nodes of the synthetic graph
    #[arg(long, default_value_t = 100_000)]
    num_nodes: usize,

    /// average in-degree of the synthetic graph
    #[arg(long, default_value_t = 10.0)]
    avg_degree: f64,

    /// per-layer fanouts, outermost last, e.g. `10,25` or `5,all`
    #[arg(long, default_value = "10,25")]
    fanouts: FanoutSpec,

    #[arg(long, default_value_t = 1024)]
    batch_size: usize,

    #[arg(long, default_value_t = 0)]
    num_workers: usize,

    #[arg(long, default_value_t = 1)]
    epochs: usize,

    /// JSON loader configuration; overrides the fanout and batch flags
    #[arg(long)]
    config: Option<String>,

    /// width of the input features and of every hidden layer
    #[arg(long, default_value_t = 32)]
    dim: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// skip the layer-wise inference pass
    #[arg(long)]
    skip_inference: bool,

    /// output file name
    #[arg(short, long, default_value = "bench-minibatch.csv")]
    output: String,

    /// emit logs as JSON
    #[arg(long, env = "MINIBATCH_JSON_LOGS")]
    json: bool,
}

const HEADER_NODES: &str = "nodes";
const HEADER_EDGES: &str = "edges";
const HEADER_FANOUTS: &str = "fanouts";
const HEADER_BATCH_SIZE: &str = "batch_size";
const HEADER_WORKERS: &str = "workers";
const HEADER_GRAPH_TIME: &str = "graph_time";
const HEADER_EPOCH_TIME: &str = "epoch_time";
const HEADER_INPUT_NODES: &str = "avg_input_nodes";
const HEADER_INFERENCE_TIME: &str = "inference_time";

fn setup_logging(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    }
}

fn main() -> anyhow::Result<()> {
    let args = BenchArgs::parse();
    setup_logging(args.json);

    let config = match &args.config {
        Some(path) => LoaderConfig::from_path(path)?,
        None => LoaderConfig::new(
            args.fanouts.clone(),
            BatchOptions::new(args.batch_size)
                .with_shuffle(true)
                .with_num_workers(args.num_workers)
                .with_random_seed(args.seed),
        ),
    };
    config.batch.validate()?;

    let mut bencher = CsvBencher::from_headers([
        HEADER_NODES,
        HEADER_EDGES,
        HEADER_FANOUTS,
        HEADER_BATCH_SIZE,
        HEADER_WORKERS,
        HEADER_GRAPH_TIME,
        HEADER_EPOCH_TIME,
        HEADER_INPUT_NODES,
        HEADER_INFERENCE_TIME,
    ]);

    let graph = bencher.r(HEADER_GRAPH_TIME, || {
        random_graph(args.num_nodes, args.avg_degree, args.seed)
    });
    let graph = Arc::new(graph);
    info!(
        nodes = %utils::separated(graph.num_nodes()),
        edges = %utils::separated(graph.num_edges()),
        size = %utils::human_bytes(graph.memory_size()),
        "built synthetic graph"
    );
    bencher.set(HEADER_NODES, graph.num_nodes());
    bencher.set(HEADER_EDGES, graph.num_edges());
    bencher.set(HEADER_FANOUTS, &config.fanouts);
    bencher.set(HEADER_BATCH_SIZE, config.batch.batch_size);
    bencher.set(HEADER_WORKERS, config.batch.num_workers);

    let seeds: Vec<NodeId> = (0..graph.num_nodes() as NodeId).collect();
    let mut iterator = config.build_iterator(graph.clone(), seeds, config.num_layers())?;
    let (input_nodes, batches) = bencher.r(HEADER_EPOCH_TIME, || -> anyhow::Result<_> {
        let mut input_nodes = 0;
        let mut batches = 0;
        for _ in 0..args.epochs {
            for record in iterator.epoch() {
                input_nodes += record?.input_nodes().len();
                batches += 1;
            }
        }
        Ok((input_nodes, batches))
    })?;
    ensure!(batches > 0, "no batch was produced");
    bencher.set(HEADER_INPUT_NODES, input_nodes / batches);

    if args.skip_inference {
        bencher.set(HEADER_INFERENCE_TIME, "");
    } else {
        let layers: Vec<Box<dyn GnnLayer>> = (0..config.num_layers())
            .map(|i| {
                Box::new(MeanAggregationLayer::random(args.dim, args.dim, i as u64))
                    as Box<dyn GnnLayer>
            })
            .collect();
        let features = random_features(graph.num_nodes(), args.dim, args.seed);
        let driver = LayerwiseInferenceDriver::new(graph, config.batch.batch_size)?;
        let output = bencher
            .r(HEADER_INFERENCE_TIME, || driver.infer(&layers, features))
            .context("layer-wise inference")?;
        info!(rows = output.num_rows(), dim = output.dim(), "inference done");
    }

    bencher.flush(&args.output)?;
    info!("results appended to {}", args.output);
    Ok(())
}

/// Collects one CSV row of timings and values.
struct CsvBencher {
    data: HashMap<String, String>,
    headers: Vec<String>,
}

impl CsvBencher {
    fn from_headers<S: IntoIterator<Item = T>, T: Into<String>>(headers: S) -> Self {
        Self {
            data: Default::default(),
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }

    /// Runs `f` and records its duration in milliseconds under `column`.
    fn r<A, F: FnOnce() -> A>(&mut self, column: &str, f: F) -> A {
        self.check(column);
        let now = time::Instant::now();
        let output = f();
        let elapsed = now.elapsed().as_millis();
        info!("STEP: {column} took {elapsed}ms");
        self.data.insert(column.to_string(), elapsed.to_string());
        output
    }

    fn set<I: ToString>(&mut self, column: &str, data: I) {
        self.check(column);
        self.data.insert(column.to_string(), data.to_string());
    }

    fn check(&self, column: &str) {
        assert!(
            !self.data.contains_key(column),
            "column {column} is already set"
        );
        assert!(
            self.headers.iter().any(|h| h == column),
            "column {column} does not exist"
        );
    }

    fn flush(&self, fname: &str) -> anyhow::Result<()> {
        let file_exists = Path::new(fname).exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(fname)
            .with_context(|| format!("opening {fname}"))?;
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !file_exists {
            writer.write_record(&self.headers)?;
        }
        let values = self
            .headers
            .iter()
            .map(|h| self.data.get(h).cloned().unwrap_or_default());
        writer.write_record(values)?;
        writer.flush()?;
        Ok(())
    }
}
