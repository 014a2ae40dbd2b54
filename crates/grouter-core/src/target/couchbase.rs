//! Couchbase backend driver: vbucket-aware dispatch. Each lane worker sorts
//! a batch so contiguous runs share (bucket, primary server), stamps each
//! request's vbucket id, and hands runs to lazily spawned per-server
//! sub-workers that pipeline transmits then receive in order.
//!
//! Bucket disappearance/reappearance/rebalancing is not handled beyond what
//! the cluster-map client provides.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::cbclient::{Bucket, Cluster, Pool};
use crate::config::Params;
use crate::mcbin::BinClient;
use crate::reconnect::reconnect;
use crate::request::{Request, Response, Status};
use crate::stats::Stats;
use crate::target::Target;

/// Queue depth of each per-server sub-worker.
const SERVER_CHAN_SIZE: usize = 10;

pub async fn start(
    spec: &str,
    params: &Params,
    stats: mpsc::Sender<Stats>,
) -> anyhow::Result<Target> {
    let cluster = Cluster::connect(spec).await?;
    let pool = cluster.pool("default").await?;

    let chan_size = params.target_chan_size.max(1);
    let mut lanes = Vec::with_capacity(params.target_concurrency.max(1));
    for _ in 0..params.target_concurrency.max(1) {
        let (tx, rx) = mpsc::channel(chan_size);
        tokio::spawn(run_lane(pool.clone(), rx, stats.clone()));
        lanes.push(tx);
    }
    Ok(Target::new(lanes))
}

struct Routed {
    addr: String,
    req: Request,
}

async fn run_lane(pool: Pool, mut incoming: mpsc::Receiver<Vec<Request>>, stats: mpsc::Sender<Stats>) {
    // Both maps are owned by this task alone: the bucket cache fills lazily,
    // the server map grows one sub-worker per distinct data address.
    let mut buckets: HashMap<String, Arc<Bucket>> = HashMap::new();
    let mut servers: HashMap<String, mpsc::Sender<Vec<Request>>> = HashMap::new();
    let mut ops = 0i64;
    let mut errors = 0i64;

    while let Some(reqs) = incoming.recv().await {
        let mut routed: Vec<Routed> = Vec::with_capacity(reqs.len());
        for mut req in reqs {
            ops += 1;
            let Some(bucket) = lookup_bucket(&pool, &mut buckets, &req.bucket).await else {
                errors += 1;
                req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
                continue;
            };
            let vb = bucket.vb_hash(&req.cmd.key);
            let addr = bucket
                .primary_for_vb(vb)
                .and_then(|idx| bucket.server_addr(idx))
                .map(str::to_string);
            let Some(addr) = addr else {
                errors += 1;
                req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
                continue;
            };
            req.cmd.vbucket = vb;
            routed.push(Routed { addr, req });
        }

        for (addr, run) in split_runs(routed) {
            dispatch(&mut servers, addr, run).await;
        }

        if ops >= 100 {
            let _ = stats
                .send(Stats::new(
                    vec!["tot-target-couchbase-ops", "tot-target-couchbase-errors"],
                    vec![ops, errors],
                ))
                .await;
            ops = 0;
            errors = 0;
        }
    }
}

async fn lookup_bucket(
    pool: &Pool,
    cache: &mut HashMap<String, Arc<Bucket>>,
    name: &str,
) -> Option<Arc<Bucket>> {
    if let Some(bucket) = cache.get(name) {
        return Some(bucket.clone());
    }
    match pool.get_bucket(name).await {
        Ok(bucket) => {
            let bucket = Arc::new(bucket);
            cache.insert(name.to_string(), bucket.clone());
            Some(bucket)
        }
        Err(err) => {
            warn!("missing bucket: {}; err: {:#}", name, err);
            None
        }
    }
}

/// Stable-sorts by (bucket, server address) and splits into contiguous
/// same-address runs. Stability keeps a client's requests in arrival order
/// within each run.
fn split_runs(mut routed: Vec<Routed>) -> Vec<(String, Vec<Request>)> {
    routed.sort_by(|a, b| {
        (a.req.bucket.as_str(), a.addr.as_str()).cmp(&(b.req.bucket.as_str(), b.addr.as_str()))
    });

    let mut runs: Vec<(String, Vec<Request>)> = Vec::new();
    for r in routed {
        match runs.last_mut() {
            Some((addr, run)) if *addr == r.addr && run[0].bucket == r.req.bucket => {
                run.push(r.req)
            }
            _ => runs.push((r.addr, vec![r.req])),
        }
    }
    runs
}

/// Ensures the sub-worker for `addr` exists, then dispatches the run to it.
async fn dispatch(
    servers: &mut HashMap<String, mpsc::Sender<Vec<Request>>>,
    addr: String,
    run: Vec<Request>,
) {
    let tx = servers.entry(addr.clone()).or_insert_with(|| {
        let (tx, rx) = mpsc::channel(SERVER_CHAN_SIZE);
        tokio::spawn(run_server(addr, rx));
        tx
    });
    if tx.send(run).await.is_err() {
        // Sub-workers only exit when their sender is dropped, so this is
        // unreachable in practice.
        warn!("couchbase server worker channel closed");
    }
}

/// One sub-worker per server data address. All requests of a run share the
/// same bucket and server; transmits are pipelined, receives strictly in
/// transmit order.
async fn run_server(addr: String, mut incoming: mpsc::Receiver<Vec<Request>>) {
    let mut client = reconnect(&addr, || BinClient::connect(&addr)).await;

    while let Some(reqs) = incoming.recv().await {
        let mut failed = false;
        for req in &reqs {
            if !failed && client.transmit(&req.cmd).await.is_err() {
                failed = true;
            }
        }
        if !failed && client.flush().await.is_err() {
            failed = true;
        }
        for req in reqs {
            if failed {
                req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
                continue;
            }
            match client.receive().await {
                Ok(res) => req.respond(res).await,
                Err(err) => {
                    warn!("couchbase receive failed: {}", err);
                    failed = true;
                    req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
                }
            }
        }
        if failed {
            client = reconnect(&addr, || BinClient::connect(&addr)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Command, Opcode};
    use bytes::Bytes;

    fn routed(bucket: &str, addr: &str, opaque: u32) -> (Routed, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(1);
        let mut cmd = Command::new(Opcode::Get, Bytes::from(format!("k{}", opaque)));
        cmd.opaque = opaque;
        (
            Routed {
                addr: addr.to_string(),
                req: Request {
                    bucket: bucket.to_string(),
                    cmd,
                    reply: tx,
                    client_num: 0,
                },
            },
            rx,
        )
    }

    #[test]
    fn test_split_runs_groups_by_bucket_and_server() {
        let mut keep = Vec::new();
        let mut input = Vec::new();
        for (bucket, addr, opaque) in [
            ("default", "a:11210", 0),
            ("default", "b:11210", 1),
            ("default", "a:11210", 2),
            ("other", "b:11210", 3),
            ("default", "b:11210", 4),
        ] {
            let (r, rx) = routed(bucket, addr, opaque);
            keep.push(rx);
            input.push(r);
        }

        let runs = split_runs(input);
        let shape: Vec<(String, Vec<u32>)> = runs
            .into_iter()
            .map(|(addr, run)| (addr, run.iter().map(|r| r.cmd.opaque).collect()))
            .collect();
        // Runs never span buckets, even though "other"'s run lands right
        // after a run on the same server address.
        assert_eq!(
            shape,
            vec![
                ("a:11210".to_string(), vec![0, 2]),
                ("b:11210".to_string(), vec![1, 4]),
                ("b:11210".to_string(), vec![3]),
            ]
        );
    }

    #[test]
    fn test_split_runs_preserves_arrival_order_within_run() {
        let mut keep = Vec::new();
        let mut input = Vec::new();
        for opaque in 0..5u32 {
            let (r, rx) = routed("default", "a:11210", opaque);
            keep.push(rx);
            input.push(r);
        }
        let runs = split_runs(input);
        assert_eq!(runs.len(), 1);
        let opaques: Vec<u32> = runs[0].1.iter().map(|r| r.cmd.opaque).collect();
        assert_eq!(opaques, vec![0, 1, 2, 3, 4]);
    }
}
