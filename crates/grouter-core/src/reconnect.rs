use std::future::Future;
use std::time::Duration;

use tracing::warn;

const SLEEP_START: Duration = Duration::from_millis(100);
const SLEEP_MAX: Duration = Duration::from_millis(2000);

/// Capped, exponential-backoff retry loop around a dialer, generic over the
/// dialed client type. Never gives up; `spec` is only named in the log
/// line, the dialer already knows where it is going.
///
/// The sleep starts at 100ms and doubles per failed attempt, clamped at
/// 2000ms before the sleep is taken.
pub async fn reconnect<C, D, F>(spec: &str, mut dial: D) -> C
where
    D: FnMut() -> F,
    F: Future<Output = anyhow::Result<C>>,
{
    let mut sleep = SLEEP_START;
    loop {
        match dial().await {
            Ok(client) => return client,
            Err(err) => {
                if sleep > SLEEP_MAX {
                    sleep = SLEEP_MAX;
                }
                warn!(
                    "reconnect failed: {}; sleeping (ms): {}; err: {:#}",
                    spec,
                    sleep.as_millis(),
                    err
                );
                tokio::time::sleep(sleep).await;
                sleep *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_returns_first_success() {
        let attempts = AtomicUsize::new(0);
        let client = reconnect("spec", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    anyhow::bail!("dial refused");
                }
                Ok(42u32)
            }
        })
        .await;
        assert_eq!(client, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_is_capped() {
        // Seven failures sleep 100+200+400+800+1600+2000+2000 ms; paused
        // time makes the total deterministic.
        let start = tokio::time::Instant::now();
        let attempts = AtomicUsize::new(0);
        let _client: u8 = reconnect("spec", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 7 {
                    anyhow::bail!("dial refused");
                }
                Ok(0u8)
            }
        })
        .await;
        assert_eq!(start.elapsed(), Duration::from_millis(7100));
    }
}
