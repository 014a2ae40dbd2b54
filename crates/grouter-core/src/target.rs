use tokio::sync::mpsc;

use crate::request::Request;

pub mod couchbase;
pub mod memcached_ascii;
pub mod memcached_binary;
pub mod memory;

/// A backend endpoint: N inbound lanes, each consumed by one worker that
/// owns one backend connection. Sources select a lane by client number so a
/// client's requests always ride the same connection, which is what keeps
/// its responses ordered.
pub struct Target {
    lanes: Vec<mpsc::Sender<Vec<Request>>>,
}

impl Target {
    pub fn new(lanes: Vec<mpsc::Sender<Vec<Request>>>) -> Target {
        assert!(!lanes.is_empty());
        Target { lanes }
    }

    /// The channel selector: `client_num mod N`. The bucket rides along only
    /// so bucket-aware targets can shard on it downstream.
    pub fn pick_channel(&self, client_num: u32, _bucket: &str) -> mpsc::Sender<Vec<Request>> {
        self.lanes[client_num as usize % self.lanes.len()].clone()
    }

    pub fn concurrency(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_channel_wraps_by_client_num() {
        let (a, _ra) = mpsc::channel::<Vec<Request>>(1);
        let (b, _rb) = mpsc::channel::<Vec<Request>>(1);
        let target = Target::new(vec![a.clone(), b.clone()]);
        assert!(target.pick_channel(0, "default").same_channel(&a));
        assert!(target.pick_channel(1, "default").same_channel(&b));
        assert!(target.pick_channel(6, "default").same_channel(&a));
        assert_eq!(target.concurrency(), 2);
    }
}
