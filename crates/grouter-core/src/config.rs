/// Runtime wiring parameters, resolved from the command line before any
/// endpoint is constructed.
#[derive(Debug, Clone)]
pub struct Params {
    /// Source of requests, as `KIND[:MORE_PARAMS]`.
    pub source_spec: String,
    /// Max concurrent client connections admitted by a listening source.
    pub source_max_conns: usize,

    /// Target of requests, as `KIND[:MORE_PARAMS]`.
    pub target_spec: String,
    /// Queue depth of every inter-stage channel.
    pub target_chan_size: usize,
    /// Number of lanes / backend workers in front of the target. Clipped to
    /// the target kind's max concurrency by the entry point.
    pub target_concurrency: usize,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            source_spec: "memcached-ascii::11300".to_string(),
            source_max_conns: 100,
            target_spec: "memory".to_string(),
            target_chan_size: 5,
            target_concurrency: 4,
        }
    }
}
