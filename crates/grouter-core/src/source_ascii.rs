//! Memcached text-protocol source: one task per client connection reads
//! framed command lines, routes each command to the target, and writes the
//! correlated reply back. A connection is served by a single task with no
//! intra-connection parallelism, which is exactly what preserves per-client
//! ordering.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::request::{Command, Opcode, Reply, Request, Response, Status};
use crate::stats::Stats;
use crate::target::Target;

pub const VERSION: &[u8] = b"VERSION grouter 0.0.0\r\n";

const MAX_LINE: u64 = 8192;
const STATS_EVERY: i64 = 100;

/// Serves one client connection until EOF, protocol abort, or `quit`.
pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    client_num: u32,
    target: Arc<Target>,
    stats: mpsc::Sender<Stats>,
) {
    let (rd, wr) = tokio::io::split(stream);
    let mut br = BufReader::new(rd);
    let mut bw = BufWriter::new(wr);

    // Reused across commands: at most one request is outstanding per
    // connection, so capacity one is exact.
    let (reply_tx, mut reply_rx) = mpsc::channel::<Response>(1);

    let mut tot_ops: i64 = 0;
    let mut tot_ops_usecs: i64 = 0;

    loop {
        let line = match read_line(&mut br).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                debug!("ascii source error: {}", err);
                return;
            }
        };

        let start = Instant::now();
        let fields: Vec<&str> = line.trim().split(' ').collect();
        let keep_going = match fields[0] {
            "quit" => false,
            "version" => {
                bw.write_all(VERSION).await.is_ok() && bw.flush().await.is_ok()
            }
            "get" => {
                handle_get(&fields, &mut bw, &target, client_num, &reply_tx, &mut reply_rx).await
            }
            "delete" => {
                handle_delete(&fields, &mut bw, &target, client_num, &reply_tx, &mut reply_rx)
                    .await
            }
            "set" | "add" | "replace" | "prepend" | "append" => {
                handle_mutation(
                    &fields,
                    &mut br,
                    &mut bw,
                    &target,
                    client_num,
                    &reply_tx,
                    &mut reply_rx,
                )
                .await
            }
            other => {
                client_error(&mut bw, &format!("unknown command - {}\r\n", other)).await
            }
        };

        if !keep_going {
            return;
        }

        tot_ops += 1;
        tot_ops_usecs += start.elapsed().as_micros() as i64;
        if tot_ops % STATS_EVERY == 0 {
            let _ = stats
                .send(Stats::new(
                    vec!["tot-source-ascii-ops", "tot-source-ascii-ops-usecs"],
                    vec![tot_ops, tot_ops_usecs],
                ))
                .await;
            tot_ops = 0;
            tot_ops_usecs = 0;
        }
    }
}

/// Sends one single-request batch onto the target's channel and waits for
/// the correlated reply. None means the pipeline went away under us.
async fn round_trip(
    target: &Target,
    client_num: u32,
    reply_tx: &Reply,
    reply_rx: &mut mpsc::Receiver<Response>,
    cmd: Command,
) -> Option<Response> {
    let req = Request {
        bucket: "default".to_string(),
        cmd,
        reply: reply_tx.clone(),
        client_num,
    };
    let chan = target.pick_channel(client_num, "default");
    if chan.send(vec![req]).await.is_err() {
        return None;
    }
    reply_rx.recv().await
}

async fn handle_get<W: AsyncWrite + Unpin>(
    fields: &[&str],
    bw: &mut W,
    target: &Target,
    client_num: u32,
    reply_tx: &Reply,
    reply_rx: &mut mpsc::Receiver<Response>,
) -> bool {
    if fields.len() != 2 {
        return client_error(bw, "expected 1 param for get command\r\n").await;
    }
    let key = fields[1];
    if key.is_empty() {
        return client_error(bw, "missing key\r\n").await;
    }
    let cmd = Command::new(Opcode::Get, Bytes::copy_from_slice(key.as_bytes()));
    let Some(res) = round_trip(target, client_num, reply_tx, reply_rx, cmd).await else {
        return false;
    };
    if res.status == Status::Success {
        let head = format!(" {} {}\r\n", res.flags(), res.value.len());
        if bw.write_all(b"VALUE ").await.is_err()
            || bw.write_all(&res.key).await.is_err()
            || bw.write_all(head.as_bytes()).await.is_err()
            || bw.write_all(&res.value).await.is_err()
            || bw.write_all(b"\r\n").await.is_err()
        {
            return false;
        }
    }
    bw.write_all(b"END\r\n").await.is_ok() && bw.flush().await.is_ok()
}

async fn handle_delete<W: AsyncWrite + Unpin>(
    fields: &[&str],
    bw: &mut W,
    target: &Target,
    client_num: u32,
    reply_tx: &Reply,
    reply_rx: &mut mpsc::Receiver<Response>,
) -> bool {
    if fields.len() != 2 {
        return client_error(bw, "expected 1 param for delete command\r\n").await;
    }
    let key = fields[1];
    if key.is_empty() {
        return client_error(bw, "missing key\r\n").await;
    }
    let cmd = Command::new(Opcode::Delete, Bytes::copy_from_slice(key.as_bytes()));
    let Some(res) = round_trip(target, client_num, reply_tx, reply_rx, cmd).await else {
        return false;
    };
    let reply: &[u8] = if res.status == Status::Success {
        b"DELETED\r\n"
    } else {
        b"NOT_FOUND\r\n"
    };
    bw.write_all(reply).await.is_ok() && bw.flush().await.is_ok()
}

async fn handle_mutation<R, W>(
    fields: &[&str],
    br: &mut R,
    bw: &mut W,
    target: &Target,
    client_num: u32,
    reply_tx: &Reply,
    reply_rx: &mut mpsc::Receiver<Response>,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let opcode = match fields[0] {
        "set" => Opcode::Set,
        "add" => Opcode::Add,
        "replace" => Opcode::Replace,
        "prepend" => Opcode::Prepend,
        "append" => Opcode::Append,
        _ => return false,
    };
    if fields.len() != 5 {
        return client_error(bw, "expected 4 params for set command\r\n").await;
    }
    let key = fields[1];
    if key.is_empty() {
        return client_error(bw, "missing key\r\n").await;
    }
    let Ok(flags) = fields[2].parse::<u32>() else {
        return client_error(bw, "could not parse flag\r\n").await;
    };
    let Ok(expiration) = fields[3].parse::<u32>() else {
        return client_error(bw, "could not parse expiration\r\n").await;
    };
    let Ok(nval) = fields[4].parse::<usize>() else {
        return client_error(bw, "could not parse value length\r\n").await;
    };

    // The body is exactly nval bytes plus the CRLF terminator.
    let mut body = vec![0u8; nval + 2];
    if let Err(err) = br.read_exact(&mut body).await {
        debug!("ascii source error: {}", err);
        return false;
    }
    if &body[nval..] != b"\r\n" {
        return client_error(bw, "was expecting CRNL value termination\r\n").await;
    }
    body.truncate(nval);

    let mut cmd = Command::new(opcode, Bytes::copy_from_slice(key.as_bytes()));
    cmd.flags = flags;
    cmd.expiration = expiration;
    cmd.value = Bytes::from(body);

    let Some(res) = round_trip(target, client_num, reply_tx, reply_rx, cmd).await else {
        return false;
    };
    let reply: &[u8] = if res.status == Status::Success {
        b"STORED\r\n"
    } else {
        b"SERVER_ERROR\r\n"
    };
    bw.write_all(reply).await.is_ok() && bw.flush().await.is_ok()
}

/// Writes a `CLIENT_ERROR` line; the connection stays open.
async fn client_error<W: AsyncWrite + Unpin>(bw: &mut W, msg: &str) -> bool {
    bw.write_all(b"CLIENT_ERROR ").await.is_ok()
        && bw.write_all(msg.as_bytes()).await.is_ok()
        && bw.flush().await.is_ok()
}

/// Reads one newline-terminated command line, capped at the reader's
/// buffer. Ok(None) is clean EOF; an unterminated or over-long line is an
/// abort.
async fn read_line<S: AsyncRead + Unpin>(
    br: &mut BufReader<ReadHalf<S>>,
) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = (&mut *br).take(MAX_LINE).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request is too long",
        ));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 request line"))
}
