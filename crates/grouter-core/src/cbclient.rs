//! Couchbase cluster-map client: walks the management REST interface
//! (`/pools` -> pool -> buckets) and exposes each bucket's vbucket server
//! map. Deliberately dumb — no streaming config, no rebalance awareness;
//! the router re-fetches a bucket only when it has never seen it.

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PoolsInfo {
    pools: Vec<PoolRef>,
}

#[derive(Debug, Deserialize)]
struct PoolRef {
    name: String,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PoolInfo {
    buckets: BucketsRef,
}

#[derive(Debug, Deserialize)]
struct BucketsRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    name: String,
    v_bucket_server_map: Option<VBucketServerMap>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketServerMap {
    pub hash_algorithm: String,
    /// Data-port addresses, `host:port`.
    pub server_list: Vec<String>,
    /// vbucket id -> [primary server index, replica indexes...]; -1 marks an
    /// unassigned slot.
    pub v_bucket_map: Vec<Vec<i32>>,
}

/// One cluster endpoint. Cloneable; the underlying HTTP client is pooled.
#[derive(Debug, Clone)]
pub struct Cluster {
    http: reqwest::Client,
    base: String,
}

impl Cluster {
    /// Normalizes `couchbase://HOST:PORT` (or `http://HOST:PORT`) and
    /// verifies the management endpoint answers.
    pub async fn connect(spec: &str) -> anyhow::Result<Cluster> {
        let base = normalize_spec(spec);
        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        let cluster = Cluster { http, base };
        // Probe /pools now so a bad endpoint fails the dial, not the first
        // request.
        cluster.fetch_pools().await?;
        Ok(cluster)
    }

    async fn fetch_pools(&self) -> anyhow::Result<PoolsInfo> {
        let url = format!("{}/pools", self.base);
        let info: PoolsInfo = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {}", url))?
            .json()
            .await
            .context("decode /pools")?;
        Ok(info)
    }

    /// Resolves a pool by name (`default` for every stock cluster).
    pub async fn pool(&self, name: &str) -> anyhow::Result<Pool> {
        let pools = self.fetch_pools().await?;
        let pool_ref = pools
            .pools
            .into_iter()
            .find(|p| p.name == name)
            .with_context(|| format!("no pool named {:?}", name))?;
        let url = join_uri(&self.base, &pool_ref.uri);
        let info: PoolInfo = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {}", url))?
            .json()
            .await
            .context("decode pool")?;
        Ok(Pool {
            http: self.http.clone(),
            base: self.base.clone(),
            buckets_uri: info.buckets.uri,
        })
    }
}

/// One pool within a cluster; hands out bucket maps.
#[derive(Debug, Clone)]
pub struct Pool {
    http: reqwest::Client,
    base: String,
    buckets_uri: String,
}

impl Pool {
    pub async fn get_bucket(&self, name: &str) -> anyhow::Result<Bucket> {
        let url = join_uri(&self.base, &self.buckets_uri);
        let buckets: Vec<BucketInfo> = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("GET {}", url))?
            .json()
            .await
            .context("decode buckets")?;
        let info = buckets
            .into_iter()
            .find(|b| b.name == name)
            .with_context(|| format!("no bucket named {:?}", name))?;
        let map = info
            .v_bucket_server_map
            .with_context(|| format!("bucket {:?} has no vBucketServerMap", name))?;
        anyhow::ensure!(!map.v_bucket_map.is_empty(), "empty vbucket map");
        Ok(Bucket {
            name: info.name,
            map,
        })
    }
}

/// A bucket's routing view: vbucket hash plus the server map.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    map: VBucketServerMap,
}

impl Bucket {
    /// CRC32-IEEE over the key, folded the way the cluster map expects.
    pub fn vb_hash(&self, key: &[u8]) -> u16 {
        let crc = crc32fast::hash(key);
        (((crc >> 16) & 0x7fff) % self.map.v_bucket_map.len() as u32) as u16
    }

    /// Primary server index for a vbucket; None for unassigned slots.
    pub fn primary_for_vb(&self, vbucket: u16) -> Option<usize> {
        let row = self.map.v_bucket_map.get(vbucket as usize)?;
        match row.first() {
            Some(&idx) if idx >= 0 => Some(idx as usize),
            _ => None,
        }
    }

    pub fn server_addr(&self, index: usize) -> Option<&str> {
        self.map.server_list.get(index).map(String::as_str)
    }
}

fn normalize_spec(spec: &str) -> String {
    let spec = if let Some(rest) = spec.strip_prefix("couchbase:") {
        format!("http:{}", rest)
    } else {
        spec.to_string()
    };
    spec.trim_end_matches('/').to_string()
}

/// Pool/bucket URIs come back absolute-path (`/pools/default?uuid=...`).
fn join_uri(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{}{}", base, uri)
    }
}
