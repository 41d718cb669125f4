//! Implements an asynchronous heartbeat

use std::{task::Poll, time::Duration};

use futures_util::Stream;
use pin_project_lite::pin_project;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    /// A wrapper over an `Option<IntervalStream>` which will never tick ready if the underlying
    /// `Interval` is `None`
    #[derive(Debug)]
    pub(crate) struct HeartBeat {
        #[pin]
        interval: Option<IntervalStream>
    }
}

impl HeartBeat {
    /// A [`HeartBeat`] that will never yield `Poll::Ready(_)` with `StreamExt::next()`
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// Empty frames are due at half the idle timeout advertised by the peer
    pub fn for_remote_idle_timeout(remote_idle_timeout: Option<Duration>) -> Self {
        match remote_idle_timeout {
            Some(timeout) if !timeout.is_zero() => Self::new(timeout / 2),
            _ => Self::never(),
        }
    }

    /// A [`HeartBeat`] that will yield `Poll::Ready(_)` per the given interval with `StreamExt::next()`.
    ///
    /// The first tick is one period from now
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }
}

impl Stream for HeartBeat {
    type Item = Instant;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(stream) => stream.poll_next(cx),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::HeartBeat;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_half_the_remote_idle_timeout() {
        let mut heartbeat = HeartBeat::for_remote_idle_timeout(Some(Duration::from_millis(1000)));
        let start = tokio::time::Instant::now();
        heartbeat.next().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ticks_without_timeout() {
        let mut heartbeat = HeartBeat::for_remote_idle_timeout(None);
        let result = tokio::time::timeout(Duration::from_secs(60), heartbeat.next()).await;
        assert!(result.is_err());
    }
}
