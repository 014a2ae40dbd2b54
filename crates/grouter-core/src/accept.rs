//! Listening source: binds the spec's address and gates accepted
//! connections behind a max-concurrency limit, one text-protocol source
//! task per connection.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Params;
use crate::source_ascii;
use crate::stats::Stats;
use crate::target::Target;

/// Parses `KIND:LISTEN_INTERFACE:LISTEN_PORT`, binds, and runs the accept
/// gate until the listener dies. Bind and spec errors are fatal.
pub async fn listen_source(
    source_spec: &str,
    params: &Params,
    target: Arc<Target>,
    stats: mpsc::Sender<Stats>,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = source_spec.split(':').collect();
    anyhow::ensure!(
        parts.len() == 3,
        "missing listen HOST:PORT; instead, got: {}",
        parts[1..].join(":")
    );
    let listen = parts[1..].join(":");
    // An empty interface means every interface.
    let addr = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.clone()
    };
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not listen on: {}", listen))?;
    info!("listening to: {}", listen);
    accept_conns(listener, params.source_max_conns, target, stats).await;
    Ok(())
}

/// Accepts a max number of concurrent connections, starting a source task
/// per accepted stream. At the limit, accepting pauses until a connection
/// closes. Client numbers increment once per accepted connection, wrapping
/// on overflow (their only use is modulo hashing).
pub async fn accept_conns(
    listener: TcpListener,
    max_conns: usize,
    target: Arc<Target>,
    stats: mpsc::Sender<Stats>,
) {
    info!("accepting max conns: {}", max_conns);

    let (accepted_tx, mut accepted_rx) = mpsc::channel::<TcpStream>(1);
    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(max_conns.max(1));

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    if accepted_tx.send(stream).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    // Dropping the sender closes the accepted channel and
                    // terminates the gate; in-flight handlers drain on
                    // their own.
                    error!("listener accept failed: {}", err);
                    return;
                }
            }
        }
    });

    let mut num_conns: usize = 0;
    let mut tot_conns: u32 = 0;

    loop {
        if num_conns < max_conns {
            debug!("accepted conns: {}", num_conns);
            tokio::select! {
                stream = accepted_rx.recv() => {
                    let Some(stream) = stream else {
                        error!("can't accept more conns");
                        return;
                    };
                    debug!("conn accepted");
                    num_conns += 1;
                    tot_conns = tot_conns.wrapping_add(1);

                    let target = target.clone();
                    let stats = stats.clone();
                    let closed_tx = closed_tx.clone();
                    let client_num = tot_conns;
                    tokio::spawn(async move {
                        source_ascii::run(stream, client_num, target, stats).await;
                        let _ = closed_tx.send(()).await;
                    });
                }
                _ = closed_rx.recv() => {
                    debug!("conn closed");
                    num_conns = num_conns.saturating_sub(1);
                }
            }
        } else {
            debug!("reached max conns: {}", num_conns);
            if closed_rx.recv().await.is_none() {
                return;
            }
            debug!("conn closed");
            num_conns = num_conns.saturating_sub(1);
        }
    }
}
