use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Result, WebSocketError};

/// Ping/pong liveness check.
///
/// Every `interval` a ping goes out and the peer gets one more `interval` to answer with a
/// pong. Any pong counts, whatever its payload. Pongs arriving while no ping is outstanding
/// are ignored.
///
/// The pong may sit unread while the reader is held up in a handler. A deadline that passes
/// during or right after such a hold is pushed back by one interval.
pub(crate) struct KeepAlive {
    interval: Duration,
    awaiting: AtomicBool,
    pong: Notify,
    held: AtomicUsize,
    stalled: AtomicBool,
}

/// Marks the reader as held up until dropped.
pub(crate) struct Hold<'a>(&'a KeepAlive);

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        self.0.held.fetch_sub(1, Ordering::AcqRel);
    }
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            awaiting: AtomicBool::new(false),
            pong: Notify::new(),
            held: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    /// Called by the reader before it hands a message to the handlers.
    pub fn hold(&self) -> Hold<'_> {
        self.held.fetch_add(1, Ordering::AcqRel);
        self.stalled.store(true, Ordering::Release);
        Hold(self)
    }

    fn was_held(&self) -> bool {
        let stalled = self.stalled.swap(false, Ordering::AcqRel);
        stalled || self.held.load(Ordering::Acquire) > 0
    }

    /// Records a pong from the peer.
    pub fn on_pong(&self) {
        if self.awaiting.swap(false, Ordering::AcqRel) {
            self.pong.notify_one();
        }
    }

    /// Runs the ping loop until `cancel` fires, a ping cannot be sent or a pong is overdue.
    ///
    /// Returns `Ok(())` on cancellation and [`WebSocketError::PongTimeout`] when the peer
    /// stopped answering.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut send_ping: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }

            self.awaiting.store(true, Ordering::Release);
            self.stalled.store(false, Ordering::Release);
            send_ping().await?;

            #[cfg(feature = "logging")]
            log::trace!("ping sent, waiting {:?} for a pong", self.interval);

            let mut deadline = tokio::time::Instant::now() + self.interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.pong.notified() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        if self.was_held() {
                            deadline += self.interval;
                            continue;
                        }

                        #[cfg(feature = "logging")]
                        log::debug!("no pong within {:?}", self.interval);

                        return Err(WebSocketError::PongTimeout);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pong_timeout() {
        let keep_alive = KeepAlive::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let pings = AtomicUsize::new(0);

        let start = tokio::time::Instant::now();
        let res = keep_alive
            .run(&cancel, || {
                pings.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(res, Err(WebSocketError::PongTimeout)));
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert!(start.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_it_alive() {
        let keep_alive = Arc::new(KeepAlive::new(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let pings = Arc::new(AtomicUsize::new(0));

        let task = {
            let keep_alive = Arc::clone(&keep_alive);
            let cancel = cancel.clone();
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                keep_alive
                    .run(&cancel, || {
                        pings.fetch_add(1, Ordering::SeqCst);
                        // answer every ping right away
                        keep_alive.on_pong();
                        async { Ok(()) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(45)).await;
        cancel.cancel();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(pings.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_extends_pong_deadline() {
        let keep_alive = Arc::new(KeepAlive::new(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let pings = Arc::new(AtomicUsize::new(0));

        let task = {
            let keep_alive = Arc::clone(&keep_alive);
            let cancel = cancel.clone();
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                keep_alive
                    .run(&cancel, || {
                        pings.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            })
        };

        // ping at 10s, the reader is busy from 12s to 27s, pong read at 27s
        tokio::time::sleep(Duration::from_secs(12)).await;
        let hold = keep_alive.hold();
        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(hold);
        keep_alive.on_pong();

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!task.is_finished());
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        // the next ping at 37s goes unanswered
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(task.is_finished());
        assert!(matches!(
            task.await.unwrap(),
            Err(WebSocketError::PongTimeout)
        ));
        assert_eq!(pings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsolicited_pong_is_ignored() {
        let keep_alive = KeepAlive::new(Duration::from_secs(1));
        keep_alive.on_pong();
        assert!(!keep_alive.awaiting.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping() {
        let keep_alive = KeepAlive::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let res = keep_alive
            .run(&cancel, || async { Err(WebSocketError::ConnectionClosed) })
            .await;
        assert!(matches!(res, Err(WebSocketError::ConnectionClosed)));
    }
}
