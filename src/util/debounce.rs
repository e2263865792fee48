// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Quiet-period debouncer over a `watch` channel.
//!
//! A value is reported only after the channel has stayed unchanged for the
//! quiet period, and only if it differs from the last reported value. A
//! connectivity flap (online, offline, online inside the window) therefore
//! reports nothing.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

pub struct Debouncer<T> {
    rx: watch::Receiver<T>,
    quiet: Duration,
    last: T,
    pending: bool,
}

impl<T> Debouncer<T>
where
    T: Clone + PartialEq + Send + Sync,
{
    pub fn new(mut rx: watch::Receiver<T>, quiet: Duration) -> Self {
        let last = rx.borrow_and_update().clone();
        Self { rx, quiet, last, pending: false }
    }

    /// Last value reported (or the initial one).
    #[must_use]
    pub fn current(&self) -> &T {
        &self.last
    }

    /// Next settled value. `None` once the sender is dropped and nothing is pending.
    ///
    /// Cancel-safe: a change observed before cancellation is kept for the next call.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if !self.pending {
                if self.rx.changed().await.is_err() {
                    return None;
                }
                self.pending = true;
            }

            loop {
                tokio::select! {
                    res = self.rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = sleep(self.quiet) => break,
                }
            }

            self.pending = false;
            let value = self.rx.borrow_and_update().clone();
            if value != self.last {
                self.last = value.clone();
                return Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reports_settled_change() {
        let (tx, rx) = watch::channel(false);
        let mut d = Debouncer::new(rx, Duration::from_millis(500));

        tx.send_replace(true);
        assert_eq!(d.next().await, Some(true));
        assert_eq!(*d.current(), true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_is_swallowed() {
        let (tx, rx) = watch::channel(true);
        let mut d = Debouncer::new(rx, Duration::from_millis(500));

        let flapper = tokio::spawn(async move {
            tx.send_replace(false);
            sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
            sleep(Duration::from_millis(100)).await;
            tx.send_replace(false);
            sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
            sleep(Duration::from_secs(5)).await;
            tx.send_replace(false);
            tx
        });

        // Only the final, settled offline transition comes through
        assert_eq!(d.next().await, Some(false));
        let tx = flapper.await.unwrap();
        drop(tx);
        assert_eq!(d.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_reports_last_value_once() {
        let (tx, rx) = watch::channel(0u32);
        let mut d = Debouncer::new(rx, Duration::from_millis(200));

        for i in 1..=5 {
            tx.send_replace(i);
        }
        assert_eq!(d.next().await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_drop_ends_stream() {
        let (tx, rx) = watch::channel(false);
        let mut d = Debouncer::new(rx, Duration::from_millis(200));
        drop(tx);
        assert_eq!(d.next().await, None);
    }
}
