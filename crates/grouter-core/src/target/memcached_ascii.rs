//! Memcached text-protocol backend driver. One worker per lane, each owning
//! one upstream connection. A batch is pipelined: every command line is
//! written, one flush, then one reply is read per request in order.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Params;
use crate::pipeline::batch_requests;
use crate::reconnect::reconnect;
use crate::request::{Command, Opcode, Request, Response, Status};
use crate::stats::Stats;
use crate::target::Target;

/// Upper bound on how many requests one pipelined write cycle covers.
const MAX_BATCH: usize = 100;

const MAX_LINE: u64 = 8192;

pub fn start(spec: &str, params: &Params, stats: mpsc::Sender<Stats>) -> Target {
    let server = spec
        .strip_prefix("memcached-ascii:")
        .unwrap_or(spec)
        .to_string();
    let chan_size = params.target_chan_size.max(1);

    let mut lanes = Vec::with_capacity(params.target_concurrency.max(1));
    for _ in 0..params.target_concurrency.max(1) {
        let (lane_tx, lane_rx) = mpsc::channel(chan_size);
        let (work_tx, work_rx) = mpsc::channel(chan_size);
        // The text source sends one-element batches; coalesce them so one
        // flush covers a run of commands.
        tokio::spawn(batch_requests(MAX_BATCH, lane_rx, work_tx));
        tokio::spawn(run_lane(server.clone(), work_rx, stats.clone()));
        lanes.push(lane_tx);
    }
    Target::new(lanes)
}

async fn dial(addr: &str) -> anyhow::Result<BufStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(BufStream::new(stream))
}

async fn run_lane(
    server: String,
    mut incoming: mpsc::Receiver<Vec<Request>>,
    stats: mpsc::Sender<Stats>,
) {
    let mut conn = reconnect(&server, || dial(&server)).await;
    let mut counters = LaneCounters::default();

    while let Some(reqs) = incoming.recv().await {
        let failed = process_batch(&mut conn, reqs, &mut counters).await;
        counters.maybe_flush(&stats).await;
        if failed {
            warn!("memcached-ascii closing conn to {}", server);
            conn = reconnect(&server, || dial(&server)).await;
        }
    }
}

#[derive(Default)]
struct LaneCounters {
    ops: i64,
    errors: i64,
}

impl LaneCounters {
    async fn maybe_flush(&mut self, stats: &mpsc::Sender<Stats>) {
        if self.ops >= 100 {
            let _ = stats
                .send(Stats::new(
                    vec!["tot-target-ascii-ops", "tot-target-ascii-errors"],
                    vec![self.ops, self.errors],
                ))
                .await;
            self.ops = 0;
            self.errors = 0;
        }
    }
}

fn routable(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Get
            | Opcode::Set
            | Opcode::Add
            | Opcode::Replace
            | Opcode::Append
            | Opcode::Prepend
            | Opcode::Delete
    )
}

/// Runs one batch against the upstream. Returns true when the connection is
/// poisoned and must be re-dialed. Every request gets exactly one response:
/// unknown opcodes are answered locally, and once an I/O error hits, the
/// rest of the batch is answered with Einval.
async fn process_batch<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
    reqs: Vec<Request>,
    counters: &mut LaneCounters,
) -> bool {
    let mut failed = false;

    for req in &reqs {
        if routable(req.cmd.opcode) && !failed {
            if write_command(conn, &req.cmd).await.is_err() {
                failed = true;
            }
        }
    }
    if !failed && conn.flush().await.is_err() {
        failed = true;
    }

    for req in reqs {
        if !routable(req.cmd.opcode) {
            req.respond(Response::reply_to(&req.cmd, Status::UnknownCommand))
                .await;
            continue;
        }
        counters.ops += 1;
        if failed {
            counters.errors += 1;
            req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
            continue;
        }
        match read_reply(conn, &req.cmd).await {
            Ok(res) => req.respond(res).await,
            Err(err) => {
                warn!("memcached-ascii read failed: {}", err);
                failed = true;
                counters.errors += 1;
                req.respond(Response::reply_to(&req.cmd, Status::Einval)).await;
            }
        }
    }

    failed
}

async fn write_command<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
    cmd: &Command,
) -> io::Result<()> {
    match cmd.opcode {
        Opcode::Get => {
            conn.write_all(b"get ").await?;
            conn.write_all(&cmd.key).await?;
            conn.write_all(b"\r\n").await
        }
        Opcode::Delete => {
            conn.write_all(b"delete ").await?;
            conn.write_all(&cmd.key).await?;
            conn.write_all(b"\r\n").await
        }
        Opcode::Set => write_mutation(conn, cmd, b"set ").await,
        Opcode::Add => write_mutation(conn, cmd, b"add ").await,
        Opcode::Replace => write_mutation(conn, cmd, b"replace ").await,
        Opcode::Append => write_mutation(conn, cmd, b"append ").await,
        Opcode::Prepend => write_mutation(conn, cmd, b"prepend ").await,
        Opcode::Quit | Opcode::Version => {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "not routable"))
        }
    }
}

async fn write_mutation<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
    cmd: &Command,
    verb: &[u8],
) -> io::Result<()> {
    let line = format!(" {} {} {}\r\n", cmd.flags, cmd.expiration, cmd.value.len());
    conn.write_all(verb).await?;
    conn.write_all(&cmd.key).await?;
    conn.write_all(line.as_bytes()).await?;
    conn.write_all(&cmd.value).await?;
    conn.write_all(b"\r\n").await
}

async fn read_reply<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
    cmd: &Command,
) -> io::Result<Response> {
    match cmd.opcode {
        Opcode::Get => read_get_reply(conn, cmd).await,
        Opcode::Delete => {
            let line = read_line(conn).await?;
            Ok(match line.as_str() {
                "DELETED" => Response::reply_to(cmd, Status::Success),
                "NOT_FOUND" => Response::reply_to(cmd, Status::KeyEnoent),
                _ => Response::reply_to(cmd, Status::Einval),
            })
        }
        _ => {
            let line = read_line(conn).await?;
            Ok(match line.as_str() {
                "STORED" => Response::reply_to(cmd, Status::Success),
                "NOT_STORED" => Response::reply_to(cmd, Status::NotStored),
                _ => Response::reply_to(cmd, Status::Einval),
            })
        }
    }
}

/// Reads `VALUE ...` lines until `END`. Single-key gets see zero or one
/// value; absence of any `VALUE` before `END` is a miss.
async fn read_get_reply<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
    cmd: &Command,
) -> io::Result<Response> {
    let mut hit: Option<Response> = None;
    loop {
        let line = read_line(conn).await?;
        let parts: Vec<&str> = line.split(' ').collect();
        match parts[0] {
            "VALUE" => {
                if parts.len() < 4 {
                    return Err(invalid("short VALUE line"));
                }
                let flags: u32 = parts[2].parse().map_err(|_| invalid("bad flags"))?;
                let nval: usize = parts[3].parse().map_err(|_| invalid("bad value length"))?;
                let mut body = vec![0u8; nval + 2];
                conn.read_exact(&mut body).await?;
                if &body[nval..] != b"\r\n" {
                    return Err(invalid("was expecting crlf"));
                }
                if hit.is_none() {
                    let mut extras = BytesMut::with_capacity(4);
                    extras.put_u32(flags);
                    body.truncate(nval);
                    hit = Some(Response {
                        opcode: cmd.opcode,
                        status: Status::Success,
                        opaque: cmd.opaque,
                        key: Bytes::copy_from_slice(parts[1].as_bytes()),
                        extras: extras.freeze(),
                        value: Bytes::from(body),
                        cas: 0,
                    });
                }
            }
            "END" => {
                return Ok(hit.unwrap_or_else(|| Response::reply_to(cmd, Status::KeyEnoent)));
            }
            _ => return Ok(Response::reply_to(cmd, Status::Einval)),
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Reads one CRLF-terminated line, capped; an over-long line poisons the
/// connection.
async fn read_line<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut BufStream<S>,
) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut limited = (&mut *conn).take(MAX_LINE);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
    }
    if !buf.ends_with(b"\n") {
        return Err(invalid("line is too long"));
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| invalid("non-utf8 reply line"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn req(opcode: Opcode, key: &str, value: &str) -> (Request, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(1);
        let mut cmd = Command::new(opcode, Bytes::copy_from_slice(key.as_bytes()));
        cmd.value = Bytes::copy_from_slice(value.as_bytes());
        (
            Request {
                bucket: "default".to_string(),
                cmd,
                reply: tx,
                client_num: 0,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_batch_pipelines_writes_and_maps_replies() {
        let (ours, mut theirs) = duplex(4096);
        let mut conn = BufStream::new(ours);

        let upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut got = Vec::new();
            // Both commands arrive in one pipelined chunk before any reply.
            while !got.ends_with(b"get k\r\n") {
                let n = theirs.read(&mut buf).await.unwrap();
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(&got[..], b"set k 0 0 5\r\nhello\r\nget k\r\n".as_slice());
            theirs
                .write_all(b"STORED\r\nVALUE k 7 5\r\nhello\r\nEND\r\n")
                .await
                .unwrap();
        });

        let (set, mut set_rx) = req(Opcode::Set, "k", "hello");
        let (get, mut get_rx) = req(Opcode::Get, "k", "");
        let mut counters = LaneCounters::default();
        let failed = process_batch(&mut conn, vec![set, get], &mut counters).await;
        assert!(!failed);

        assert_eq!(set_rx.recv().await.unwrap().status, Status::Success);
        let got = get_rx.recv().await.unwrap();
        assert_eq!(got.status, Status::Success);
        assert_eq!(got.flags(), 7);
        assert_eq!(&got.value[..], b"hello");
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_miss_maps_to_key_enoent() {
        let (ours, mut theirs) = duplex(4096);
        let mut conn = BufStream::new(ours);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let _ = theirs.read(&mut buf).await.unwrap();
            theirs.write_all(b"END\r\n").await.unwrap();
        });

        let (get, mut rx) = req(Opcode::Get, "missing", "");
        let mut counters = LaneCounters::default();
        assert!(!process_batch(&mut conn, vec![get], &mut counters).await);
        assert_eq!(rx.recv().await.unwrap().status, Status::KeyEnoent);
    }

    #[tokio::test]
    async fn test_upstream_close_synthesizes_einval_for_tail() {
        let (ours, mut theirs) = duplex(4096);
        let mut conn = BufStream::new(ours);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 128];
            let _ = theirs.read(&mut buf).await.unwrap();
            // One reply, then hang up with a second request outstanding.
            theirs.write_all(b"STORED\r\n").await.unwrap();
            drop(theirs);
        });

        let (a, mut a_rx) = req(Opcode::Set, "a", "1");
        let (b, mut b_rx) = req(Opcode::Set, "b", "2");
        let mut counters = LaneCounters::default();
        let failed = process_batch(&mut conn, vec![a, b], &mut counters).await;
        assert!(failed);
        assert_eq!(a_rx.recv().await.unwrap().status, Status::Success);
        assert_eq!(b_rx.recv().await.unwrap().status, Status::Einval);
        assert_eq!(counters.errors, 1);
    }

    #[tokio::test]
    async fn test_unknown_opcode_answered_locally() {
        let (ours, theirs) = duplex(64);
        let mut conn = BufStream::new(ours);
        let (v, mut rx) = req(Opcode::Version, "", "");
        let mut counters = LaneCounters::default();
        // No upstream interaction at all: the wire stays silent.
        assert!(!process_batch(&mut conn, vec![v], &mut counters).await);
        assert_eq!(rx.recv().await.unwrap().status, Status::UnknownCommand);
        drop(theirs);
    }
}
