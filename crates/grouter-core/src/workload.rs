//! Synthetic workload source. A JSON cfg names a command decision tree
//! (itself JSON); one generator task per client number fills batches by
//! interpreting the tree, and a paired sender task ships each batch to the
//! target and drains the replies, tolerating out-of-order arrival by
//! stashing on the opaque tag.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use md5::{Digest, Md5};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Params;
use crate::request::{Command, Opcode, Reply, Request, Response};
use crate::stats::Stats;
use crate::target::Target;

pub const DEFAULT_BATCH: i64 = 1000;
pub const DEFAULT_MAX_ITEM: i64 = 10000;
pub const DEFAULT_MAX_CREATE: i64 = 10000;
pub const DEFAULT_RATIO_HOT: f64 = 1.0;

const REPORT_EVERY: i64 = 100;

/// Key-value cfg map plus the command generation decision tree.
///
/// The cfg is intrinsically untyped JSON; typed accessors with defaults
/// cover the mix of numbers (from the file) and strings (from `k=v` spec
/// overrides). Keys ending in `-` are descriptions paired with the base
/// key.
pub struct WorkloadCfg {
    cfg: serde_json::Map<String, Value>,
    cmd_tree: Vec<Value>,
}

impl WorkloadCfg {
    /// Reads the cfg file and its decision tree. `k=v` pairs appended
    /// comma-separated after `workload:` override file values, and
    /// `cfg-path=...` picks the file itself.
    pub fn read(source_spec: &str, default_cfg_path: &str) -> anyhow::Result<WorkloadCfg> {
        let spec = source_spec.strip_prefix("workload:").unwrap_or(source_spec);
        let overrides: Vec<(&str, &str)> =
            spec.split(',').filter_map(|kv| kv.split_once('=')).collect();

        let mut cfg_path = default_cfg_path.to_string();
        for (k, v) in &overrides {
            if *k == "cfg-path" {
                cfg_path = v.to_string();
            }
        }
        info!("  cfg-path: {}", cfg_path);

        let mut cfg = read_json_file(&cfg_path)?
            .as_object()
            .cloned()
            .with_context(|| format!("workload cfg is not a JSON object: {}", cfg_path))?;

        // Spec values take precedence over file values.
        for (k, v) in overrides {
            cfg.insert(k.to_string(), Value::String(v.to_string()));
        }

        let tree_path = cfg
            .get("cmd-tree")
            .and_then(Value::as_str)
            .context("missing decision 'cmd-tree' parameter")?
            .to_string();
        let cmd_tree = read_json_file(&tree_path)?
            .as_array()
            .cloned()
            .with_context(|| format!("cmd-tree is not a JSON list: {}", tree_path))?;

        Ok(WorkloadCfg { cfg, cmd_tree })
    }

    /// Logs the cfg for diagnosis, pairing each key with its `key-`
    /// description when one exists.
    pub fn log(&self) {
        let mut keys: Vec<&String> = self.cfg.keys().filter(|k| !k.ends_with('-')).collect();
        keys.sort();
        for key in keys {
            match self.cfg.get(&format!("{}-", key)) {
                Some(desc) => info!("    {}: {} - {}", key, self.cfg[key.as_str()], desc),
                None => info!("    {}: {}", key, self.cfg[key.as_str()]),
            }
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.cfg.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    fn require_f64(&self, key: &str) -> anyhow::Result<f64> {
        match self.cfg.get(key) {
            Some(Value::Number(n)) => n.as_f64().context("non-finite cfg number"),
            Some(Value::String(s)) => s
                .parse()
                .with_context(|| format!("cfg {} is not a number: {:?}", key, s)),
            _ => anyhow::bail!("missing cfg parameter: {}", key),
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.cfg.get(key) {
            Some(Value::Number(n)) => n.as_f64().map(|f| f as i64).unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.cfg.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }
}

fn read_json_file(path: &str) -> anyhow::Result<Value> {
    let bytes = std::fs::read(Path::new(path)).with_context(|| format!("could not read: {}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("could not parse json from: {}", path))
}

/// The source entry: one workload per client number, `target-concurrency`
/// of them.
pub async fn run(
    source_spec: &str,
    params: &Params,
    target: Arc<Target>,
    stats: mpsc::Sender<Stats>,
) -> anyhow::Result<()> {
    let cfg = Arc::new(WorkloadCfg::read(source_spec, "./workload.json")?);
    cfg.log();

    let n = params.target_concurrency.max(1);
    let mut tasks = Vec::new();
    for i in 1..n {
        tasks.push(tokio::spawn(work_load(
            cfg.clone(),
            i as u32,
            target.clone(),
            stats.clone(),
        )));
    }
    work_load(cfg, 0, target, stats).await;
    for t in tasks {
        let _ = t.await;
    }
    Ok(())
}

/// Sender half: ships generated batches to the target and drains exactly
/// one reply per request, reordering through the opaque stash.
async fn work_load(
    cfg: Arc<WorkloadCfg>,
    client_num: u32,
    target: Arc<Target>,
    stats: mpsc::Sender<Stats>,
) {
    let bucket = "default";
    let batch = cfg.get_i64("batch", DEFAULT_BATCH).max(1) as usize;

    let (res_tx, mut res_rx) = mpsc::channel::<Response>(batch);
    // Unit capacity: the next batch generates concurrently while the
    // current one is in flight, no further ahead.
    let (gen_tx, mut gen_rx) = mpsc::channel::<Vec<Request>>(1);

    tokio::spawn(batch_gen(
        cfg,
        client_num,
        bucket,
        batch,
        gen_tx,
        res_tx,
        stats.clone(),
    ));

    let mut stash: HashMap<u32, Response> = HashMap::new();
    let mut tot_ops: i64 = 0;
    let mut tot_ops_usecs: i64 = 0;

    while let Some(reqs) = gen_rx.recv().await {
        let start = Instant::now();
        let opaques: Vec<u32> = reqs.iter().map(|r| r.cmd.opaque).collect();
        let chan = target.pick_channel(client_num, bucket);
        if chan.send(reqs).await.is_err() {
            return;
        }
        if !drain_batch(&mut res_rx, &opaques, &mut stash).await {
            return;
        }
        debug_assert!(stash.is_empty());

        tot_ops += batch as i64;
        tot_ops_usecs += start.elapsed().as_micros() as i64;
        if tot_ops % REPORT_EVERY == 0 {
            let _ = stats
                .send(Stats::new(
                    vec!["tot_workload_ops", "tot_workload_ops_usecs"],
                    vec![tot_ops, tot_ops_usecs],
                ))
                .await;
            tot_ops = 0;
            tot_ops_usecs = 0;
        }
    }
}

/// Receives one response per expected opaque. Early arrivals for later
/// requests are stashed by their own opaque and claimed when their turn
/// comes, so the stash is empty once every expectation is met.
async fn drain_batch(
    res_rx: &mut mpsc::Receiver<Response>,
    opaques: &[u32],
    stash: &mut HashMap<u32, Response>,
) -> bool {
    for &expected in opaques {
        if stash.remove(&expected).is_some() {
            continue;
        }
        loop {
            let Some(res) = res_rx.recv().await else {
                return false;
            };
            if res.opaque == expected {
                break;
            }
            stash.insert(res.opaque, res);
        }
    }
    true
}

/// Generator half: fills batches by interpreting the decision tree and
/// emits per-counter stats deltas as it goes.
async fn batch_gen(
    cfg: Arc<WorkloadCfg>,
    client_num: u32,
    bucket: &'static str,
    batch: usize,
    gen_tx: mpsc::Sender<Vec<Request>>,
    res_tx: Reply,
    stats: mpsc::Sender<Stats>,
) {
    let mut pre: HashMap<String, u64> = HashMap::new();
    let mut cur: HashMap<String, u64> = HashMap::new();
    let mut opaque: u32 = 0;

    loop {
        cur.insert("out".to_string(), 0);
        let mut out: Vec<Command> = Vec::with_capacity(batch);
        while counter(&cur, "out") < batch as u64 {
            if let Err(err) = next_cmd(&cfg, &cfg.cmd_tree, &mut cur, &mut out, batch) {
                error!("workload generation failed: {:#}", err);
                return;
            }
        }

        let reqs: Vec<Request> = out
            .into_iter()
            .map(|mut cmd| {
                cmd.opaque = opaque;
                opaque = opaque.wrapping_add(1);
                Request {
                    bucket: bucket.to_string(),
                    cmd,
                    reply: res_tx.clone(),
                    client_num,
                }
            })
            .collect();
        if gen_tx.send(reqs).await.is_err() {
            return;
        }

        if opaque % 100 == 0 {
            let mut keys = Vec::with_capacity(cur.len());
            let mut vals = Vec::with_capacity(cur.len());
            for (k, v) in &cur {
                keys.push(k.clone());
                vals.push((*v as i64) - (counter(&pre, k) as i64));
            }
            let _ = stats.send(Stats::new(keys, vals)).await;
            pre = cur.clone();
        }
    }
}

fn counter(map: &HashMap<String, u64>, key: &str) -> u64 {
    map.get(key).copied().unwrap_or(0)
}

fn bump(map: &mut HashMap<String, u64>, key: &str, by: u64) {
    *map.entry(key.to_string()).or_insert(0) += by;
}

/// Runs the decision tree from the top. A single run may emit more than one
/// request, so emission stops once the batch is full.
fn next_cmd(
    cfg: &WorkloadCfg,
    tree: &[Value],
    cur: &mut HashMap<String, u64>,
    out: &mut Vec<Command>,
    batch: usize,
) -> anyhow::Result<()> {
    let mut pos = 0;
    while pos < tree.len() && counter(cur, "out") < batch as u64 {
        let name = tree[pos]
            .as_str()
            .with_context(|| format!("workload cmd at {} is not a string", pos))?;
        pos += apply_cmd(cfg, name, tree, pos, cur, out, batch)?;
    }
    Ok(())
}

/// One tree opcode: mutates the cursor state and returns how many tokens it
/// consumed.
fn apply_cmd(
    cfg: &WorkloadCfg,
    name: &str,
    tree: &[Value],
    pos: usize,
    cur: &mut HashMap<String, u64>,
    out: &mut Vec<Command>,
    batch: usize,
) -> anyhow::Result<usize> {
    match name {
        // Evaluates ratios and recursively runs either the left or right
        // block of commands.
        "choose" => {
            anyhow::ensure!(pos + 4 < tree.len(), "truncated choose at {}", pos);
            let var_left = tree[pos + 1].as_str().context("choose left name")?;
            let var_right = tree[pos + 2].as_str().context("choose right name")?;
            let block_left = tree[pos + 3].as_array().context("choose left block")?;
            let block_right = tree[pos + 4].as_array().context("choose right block")?;

            let cur_left = counter(cur, &format!("tot-{}", var_left));
            let cur_right = counter(cur, &format!("tot-{}", var_right));
            let cur_total = cur_left + cur_right;
            let ratio_left = cfg.require_f64(&format!("ratio-{}", var_left))?;
            // On the very first pass 0/0 is NaN, NaN < ratio is false, and
            // the right block wins.
            if (cur_left as f64) / (cur_total as f64) < ratio_left {
                bump(cur, &format!("tot-{}", var_left), 1);
                next_cmd(cfg, block_left, cur, out, batch)?;
            } else {
                bump(cur, &format!("tot-{}", var_right), 1);
                next_cmd(cfg, block_right, cur, out, batch)?;
            }
            Ok(5)
        }
        // Picks a new key.
        "new" => {
            cur.insert("key".to_string(), counter(cur, "tot-item"));
            if counter(cur, "tot-item") < cfg.get_i64("max-item", DEFAULT_MAX_ITEM) as u64
                && counter(cur, "tot-create") < cfg.get_i64("max-create", DEFAULT_MAX_CREATE) as u64
            {
                bump(cur, "tot-item", 1);
            }
            Ok(1)
        }
        // Picks a hot key from the most recently created tail.
        "hot" => {
            let ratio_hot = cfg.get_f64("ratio-hot", DEFAULT_RATIO_HOT);
            let tot_item = counter(cur, "tot-item");
            let items = (tot_item as f64 * ratio_hot) as u64;
            let key = if items == 0 {
                tot_item.wrapping_sub(1)
            } else {
                tot_item.wrapping_sub(items) + (counter(cur, "tot-ops") % items)
            };
            cur.insert("key".to_string(), key);
            Ok(1)
        }
        // Picks a cold key from the old head.
        "cold" => {
            let ratio_hot = cfg.get_f64("ratio-hot", DEFAULT_RATIO_HOT);
            let tot_item = counter(cur, "tot-item");
            let items = (tot_item as f64 * (1.0 - ratio_hot)) as u64;
            let key = if items == 0 {
                0
            } else {
                counter(cur, "tot-ops") % items
            };
            cur.insert("key".to_string(), key);
            Ok(1)
        }
        // Picks a key that is not supposed to be in the db.
        "miss" => {
            cur.insert("key".to_string(), u64::MAX);
            Ok(1)
        }
        "set" | "get" | "delete" => {
            if counter(cur, "out") < batch as u64 {
                let key = key_string(cfg, counter(cur, "key"));
                let (opcode, value) = match name {
                    "set" => (Opcode::Set, Bytes::from(key.clone())),
                    "get" => (Opcode::Get, Bytes::new()),
                    _ => (Opcode::Delete, Bytes::new()),
                };
                let mut cmd = Command::new(opcode, Bytes::from(key));
                cmd.value = value;
                out.push(cmd);
                bump(cur, &format!("tot-ops-{}", name), 1);
                bump(cur, "tot-ops", 1);
                bump(cur, "out", 1);
            }
            Ok(1)
        }
        other => anyhow::bail!("unknown workload cmd: {}", other),
    }
}

/// Formats a numeric key: decimal, optionally replaced by the first 16 hex
/// chars of its md5, optionally prefixed.
pub fn key_string(cfg: &WorkloadCfg, key: u64) -> String {
    let mut s = key.to_string();
    if cfg.get_i64("hashed", 1) > 0 {
        s = md5_hex(&s)[..16].to_string();
    }
    let prefix = cfg.get_str("prefix", "");
    if !prefix.is_empty() {
        s = format!("{}-{}", prefix, s);
    }
    s
}

fn md5_hex(s: &str) -> String {
    let digest = Md5::digest(s.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
