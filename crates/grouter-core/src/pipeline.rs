use tokio::sync::mpsc;

use crate::request::Request;

/// Batches up requests from the incoming channel to feed the outgoing
/// channel. At the head of each iteration the buffer is empty or partial:
/// empty blocks on input, full (at or past `max_batch_size`) blocks on
/// output, and partial races "send what we have" against "append more" so a
/// ready consumer is never kept waiting. No artificial delay is ever
/// inserted.
///
/// When the input closes, any buffered tail is flushed before returning, so
/// the concatenation of emitted batches always equals the concatenation of
/// inputs, in order.
pub async fn batch_requests(
    max_batch_size: usize,
    mut incoming: mpsc::Receiver<Vec<Request>>,
    outgoing: mpsc::Sender<Vec<Request>>,
) {
    let max_batch_size = max_batch_size.max(1);
    let mut batch: Vec<Request> = Vec::with_capacity(max_batch_size);

    loop {
        if batch.is_empty() {
            match incoming.recv().await {
                Some(reqs) => batch.extend(reqs),
                None => return,
            }
        } else if batch.len() >= max_batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(max_batch_size));
            if outgoing.send(full).await.is_err() {
                return;
            }
        } else {
            tokio::select! {
                permit = outgoing.reserve() => {
                    let Ok(permit) = permit else { return };
                    permit.send(std::mem::replace(
                        &mut batch,
                        Vec::with_capacity(max_batch_size),
                    ));
                }
                reqs = incoming.recv() => {
                    match reqs {
                        Some(reqs) => batch.extend(reqs),
                        None => {
                            let tail = std::mem::take(&mut batch);
                            let _ = outgoing.send(tail).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Reads incoming request batches and shards each whole batch into one of
/// the output lanes by client number affinity.
///
/// A batch is assumed homogeneous in client number and only the first
/// request is inspected; a mixed batch would be misrouted. One blocked lane
/// stalls the partitioner (and so every other lane).
pub async fn partition_requests(
    mut incoming: mpsc::Receiver<Vec<Request>>,
    lanes: Vec<mpsc::Sender<Vec<Request>>>,
) {
    while let Some(reqs) = incoming.recv().await {
        let Some(first) = reqs.first() else { continue };
        let lane = &lanes[first.client_num as usize % lanes.len()];
        if lane.send(reqs).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Command, Opcode, Response};
    use bytes::Bytes;

    fn req(client_num: u32, opaque: u32) -> (Request, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(1);
        let mut cmd = Command::new(Opcode::Get, Bytes::from(format!("k{}", opaque)));
        cmd.opaque = opaque;
        (
            Request {
                bucket: "default".to_string(),
                cmd,
                reply: tx,
                client_num,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_batcher_is_loss_free_and_order_preserving() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let task = tokio::spawn(batch_requests(3, in_rx, out_tx));

        let mut keep = Vec::new();
        for opaque in 0..10u32 {
            let (r, rx) = req(0, opaque);
            keep.push(rx);
            in_tx.send(vec![r]).await.unwrap();
        }
        drop(in_tx);

        let mut seen = Vec::new();
        while let Some(batch) = out_rx.recv().await {
            assert!(!batch.is_empty());
            seen.extend(batch.into_iter().map(|r| r.cmd.opaque));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_batcher_coalesces_when_downstream_is_slow() {
        // Downstream capacity 1 and no consumer: the first batch fills the
        // channel, the rest coalesce up to the cap.
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let task = tokio::spawn(batch_requests(4, in_rx, out_tx));

        let mut keep = Vec::new();
        for opaque in 0..5u32 {
            let (r, rx) = req(0, opaque);
            keep.push(rx);
            in_tx.send(vec![r]).await.unwrap();
        }
        drop(in_tx);

        // Only one downstream slot and no consumer yet: whichever way the
        // send/append race goes, five one-element inputs collapse into
        // exactly two batches.
        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first.len() + second.len(), 5);
        assert!(out_rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_partitioner_lane_affinity() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        let task = tokio::spawn(partition_requests(in_rx, vec![a_tx, b_tx]));

        let mut keep = Vec::new();
        for client in [0u32, 1, 2, 3, 5] {
            let (r, rx) = req(client, client);
            keep.push(rx);
            in_tx.send(vec![r]).await.unwrap();
        }
        in_tx.send(vec![]).await.unwrap(); // empty batches are skipped
        drop(in_tx);
        task.await.unwrap();

        let mut lane_a = Vec::new();
        while let Ok(batch) = a_rx.try_recv() {
            lane_a.extend(batch.into_iter().map(|r| r.client_num));
        }
        let mut lane_b = Vec::new();
        while let Ok(batch) = b_rx.try_recv() {
            lane_b.extend(batch.into_iter().map(|r| r.client_num));
        }
        assert_eq!(lane_a, vec![0, 2]);
        assert_eq!(lane_b, vec![1, 3, 5]);
    }
}
