//! Memcached binary-protocol backend driver. One worker per lane; requests
//! go one-at-a-time through the binary client and the returned response is
//! forwarded as-is.

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Params;
use crate::mcbin::BinClient;
use crate::reconnect::reconnect;
use crate::request::{Request, Response, Status};
use crate::stats::Stats;
use crate::target::Target;

pub fn start(spec: &str, params: &Params, stats: mpsc::Sender<Stats>) -> Target {
    let server = spec
        .strip_prefix("memcached-binary:")
        .unwrap_or(spec)
        .to_string();
    let chan_size = params.target_chan_size.max(1);

    let mut lanes = Vec::with_capacity(params.target_concurrency.max(1));
    for _ in 0..params.target_concurrency.max(1) {
        let (tx, rx) = mpsc::channel(chan_size);
        tokio::spawn(run_lane(server.clone(), rx, stats.clone()));
        lanes.push(tx);
    }
    Target::new(lanes)
}

async fn run_lane(
    server: String,
    mut incoming: mpsc::Receiver<Vec<Request>>,
    stats: mpsc::Sender<Stats>,
) {
    let mut client = reconnect(&server, || BinClient::connect(&server)).await;
    let mut ops = 0i64;
    let mut errors = 0i64;

    while let Some(reqs) = incoming.recv().await {
        for req in reqs {
            ops += 1;
            match client.send(&req.cmd).await {
                Ok(res) => req.respond(res).await,
                Err(err) => {
                    warn!("memcached-binary send failed: {}; reconnecting", err);
                    errors += 1;
                    req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
                    client = reconnect(&server, || BinClient::connect(&server)).await;
                }
            }
        }
        if ops >= 100 {
            let _ = stats
                .send(Stats::new(
                    vec!["tot-target-binary-ops", "tot-target-binary-errors"],
                    vec![ops, errors],
                ))
                .await;
            ops = 0;
            errors = 0;
        }
    }
}
