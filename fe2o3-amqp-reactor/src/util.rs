//! Common utilities

use futures_util::Future;
use std::{pin::Pin, task::Poll, time::Duration};
use tokio::time::{Instant, Sleep};

/// Whether an event loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// A resettable timer that fires once no activity has been observed for `duration`
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

/// Waits until `deadline`, or forever if there is none
pub(crate) async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures_util::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::IdleTimeout;

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_after_duration() {
        let mut timeout = IdleTimeout::new(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        timeout.reset();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(futures_util::poll!(&mut timeout).is_pending());
        tokio::time::advance(Duration::from_millis(50)).await;
        (&mut timeout).await;
    }
}
