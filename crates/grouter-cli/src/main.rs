use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grouter_core::accept;
use grouter_core::config::Params;
use grouter_core::stats;
use grouter_core::target::{couchbase, memcached_ascii, memcached_binary, memory, Target};
use grouter_core::workload;

#[derive(Parser, Debug)]
#[command(name = "grouter", version, about = "memcached protocol router")]
struct Args {
    /// Source of requests, as SOURCE_KIND[:MORE_PARAMS]. Kinds:
    /// memcached:LISTEN_INTERFACE:LISTEN_PORT,
    /// memcached-ascii:LISTEN_INTERFACE:LISTEN_PORT, workload
    #[arg(long, default_value = "memcached-ascii::11300")]
    source: String,

    /// Max conns allowed into source.
    #[arg(long, default_value_t = 100)]
    source_max_conns: usize,

    /// Target of requests, as TARGET_KIND[:MORE_PARAMS]. Kinds: memory,
    /// memcached-ascii:HOST:PORT, memcached-binary:HOST:PORT,
    /// couchbase://HOST:PORT, http://HOST:PORT
    #[arg(long, default_value = "memory")]
    target: String,

    /// Target chan size to control queuing.
    #[arg(long, default_value_t = 5)]
    target_chan_size: usize,

    /// Number of concurrent workers in front of target.
    #[arg(long, default_value_t = 4)]
    target_concurrency: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let params = Params {
        source_spec: args.source,
        source_max_conns: args.source_max_conns,
        target_spec: args.target,
        target_chan_size: args.target_chan_size,
        target_concurrency: args.target_concurrency,
    };

    info!("grouter");
    info!("  source: {}", params.source_spec);
    info!("    source-max-conns: {}", params.source_max_conns);
    info!("  target: {}", params.target_spec);
    info!("    target-chan-size: {}", params.target_chan_size);
    info!("    target-concurrency: {}", params.target_concurrency);

    run(params).await
}

async fn run(mut params: Params) -> anyhow::Result<()> {
    let source_kind = kind_of(&params.source_spec);
    let target_kind = kind_of(&params.target_spec);

    // Some targets have limited concurrency.
    let max_concurrency = match target_kind.as_str() {
        "memory" => memory::MAX_CONCURRENCY,
        _ => usize::MAX,
    };
    if params.target_concurrency > max_concurrency {
        params.target_concurrency = max_concurrency;
        info!(
            "    target-concurrency clipped to: {}; due to limitations of target kind: {}",
            params.target_concurrency, target_kind
        );
    }

    let stats_chan = stats::start_stats_reporter(
        params.source_max_conns + params.target_concurrency,
    );

    let target: Target = match target_kind.as_str() {
        "memory" => memory::start(&params),
        "memcached-ascii" => memcached_ascii::start(&params.target_spec, &params, stats_chan.clone()),
        "memcached-binary" => {
            memcached_binary::start(&params.target_spec, &params, stats_chan.clone())
        }
        "couchbase" | "http" => {
            couchbase::start(&params.target_spec, &params, stats_chan.clone())
                .await
                .with_context(|| format!("couchbase connect failed: {}", params.target_spec))?
        }
        _ => anyhow::bail!("unknown target kind: {}", params.target_spec),
    };
    let target = Arc::new(target);

    match source_kind.as_str() {
        "memcached" | "memcached-ascii" => {
            accept::listen_source(&params.source_spec, &params, target, stats_chan).await
        }
        "workload" => workload::run(&params.source_spec, &params, target, stats_chan).await,
        _ => anyhow::bail!("unknown source kind: {}", params.source_spec),
    }
}

fn kind_of(spec: &str) -> String {
    spec.split(':').next().unwrap_or("").to_string()
}
