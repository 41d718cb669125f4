//! Endpoint rotation and backoff schedule used to (re)connect

use std::time::Duration;

use url::Url;

use super::options::ReconnectOptions;

/// Yields the endpoint to try next and how long to wait before trying it.
///
/// A round tries every endpoint once, in order, without waiting in between. Rounds are
/// separated by a delay that grows by `multiplier` up to `max_delay`.
#[derive(Debug)]
pub(crate) struct Backoff {
    endpoints: Vec<Url>,
    options: Option<ReconnectOptions>,
    attempts: u32,
    index: usize,
    delay: Duration,
}

impl Backoff {
    pub fn new(endpoints: Vec<Url>, options: Option<ReconnectOptions>) -> Self {
        let delay = options
            .as_ref()
            .map(|options| options.delay)
            .unwrap_or_default();
        Self {
            endpoints,
            options,
            attempts: 0,
            index: 0,
            delay,
        }
    }

    /// Whether a lost transport is followed by a reconnect
    pub fn is_enabled(&self) -> bool {
        self.options.is_some()
    }

    /// Starts over from the primary endpoint, e.g. after a connection was established
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.index = 0;
        if let Some(options) = &self.options {
            self.delay = options.delay;
        }
    }

    /// Number of attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The next endpoint and the delay before connecting, or `None` once attempts are
    /// exhausted
    pub fn next_attempt(&mut self) -> Option<(Url, Duration)> {
        if self.endpoints.is_empty() {
            return None;
        }

        let options = match &self.options {
            Some(options) => options,
            None => {
                // A single attempt at the primary endpoint
                if self.attempts > 0 {
                    return None;
                }
                self.attempts += 1;
                return Some((self.endpoints[0].clone(), Duration::ZERO));
            }
        };

        if options.max_attempts > 0 && self.attempts >= options.max_attempts {
            return None;
        }

        let round = self.attempts as usize / self.endpoints.len();
        let wait = match (round, self.index) {
            (0, _) | (_, 1..) => Duration::ZERO,
            (_, 0) => {
                let wait = self.delay;
                // Out of range or non finite products saturate at max_delay
                let next = Duration::try_from_secs_f64(self.delay.as_secs_f64() * options.multiplier)
                    .unwrap_or(options.max_delay);
                self.delay = next.min(options.max_delay);
                wait
            }
        };

        let url = self.endpoints[self.index].clone();
        self.index = (self.index + 1) % self.endpoints.len();
        self.attempts += 1;
        Some((url, wait))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use crate::connection::options::ReconnectOptions;

    use super::Backoff;

    fn endpoints() -> Vec<Url> {
        vec![
            Url::parse("amqp://localhost:5672").unwrap(),
            Url::parse("amqp://localhost:5673").unwrap(),
        ]
    }

    #[test]
    fn test_single_attempt_without_reconnect() {
        let mut backoff = Backoff::new(endpoints(), None);
        let (url, wait) = backoff.next_attempt().unwrap();
        assert_eq!(url.port(), Some(5672));
        assert_eq!(wait, Duration::ZERO);
        assert!(backoff.next_attempt().is_none());
        assert!(!backoff.is_enabled());
    }

    #[test]
    fn test_rounds_back_off_up_to_max_delay() {
        let options = ReconnectOptions::default()
            .delay(Duration::from_millis(10))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(30))
            .max_attempts(8);
        let mut backoff = Backoff::new(endpoints(), Some(options));

        let schedule: Vec<(u16, u64)> = std::iter::from_fn(|| backoff.next_attempt())
            .map(|(url, wait)| (url.port().unwrap(), wait.as_millis() as u64))
            .collect();
        assert_eq!(
            schedule,
            vec![
                (5672, 0),
                (5673, 0),
                (5672, 10),
                (5673, 0),
                (5672, 20),
                (5673, 0),
                (5672, 30),
                (5673, 0),
            ]
        );
    }

    #[test]
    fn test_delay_growth_saturates_instead_of_overflowing() {
        let options = ReconnectOptions::default()
            .delay(Duration::from_secs(u64::MAX / 4))
            .multiplier(1e12)
            .max_delay(Duration::MAX)
            .max_attempts(0);
        let mut backoff = Backoff::new(endpoints(), Some(options));

        let waits: Vec<Duration> = std::iter::from_fn(|| backoff.next_attempt())
            .map(|(_, wait)| wait)
            .take(8)
            .collect();
        assert_eq!(waits[2], Duration::from_secs(u64::MAX / 4));
        assert_eq!(waits[4], Duration::MAX);
        assert_eq!(waits[6], Duration::MAX);

        let options = ReconnectOptions {
            multiplier: f64::NAN,
            ..Default::default()
        }
        .delay(Duration::from_millis(10))
        .max_delay(Duration::from_secs(1));
        let mut backoff = Backoff::new(endpoints(), Some(options));
        let waits: Vec<Duration> = std::iter::from_fn(|| backoff.next_attempt())
            .map(|(_, wait)| wait)
            .take(6)
            .collect();
        assert_eq!(waits[2], Duration::from_millis(10));
        assert_eq!(waits[4], Duration::from_secs(1));
    }

    #[test]
    fn test_reset_starts_from_primary() {
        let mut backoff = Backoff::new(endpoints(), Some(ReconnectOptions::default()));
        backoff.next_attempt();
        backoff.next_attempt();
        backoff.next_attempt();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let (url, wait) = backoff.next_attempt().unwrap();
        assert_eq!(url.port(), Some(5672));
        assert_eq!(wait, Duration::ZERO);
    }
}
