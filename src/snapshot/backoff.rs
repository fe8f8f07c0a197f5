use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffOptions {
    /// Total attempts, including the first one.
    pub invocation_count: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Relative jitter; 0.1 spreads each backoff over [0.9, 1.1] of its nominal value.
    pub jitter: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        BackoffOptions {
            invocation_count: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Exponential backoff: min·multiplier^n, clamped to max, with multiplicative jitter.
///
/// ```text
/// let mut backoff = BackoffStrategy::new(options);
/// loop {
///     match attempt() { Ok(v) => break v, Err(_) if backoff.next() => sleep(backoff.backoff()), Err(e) => fail(e) }
/// }
/// ```
pub struct BackoffStrategy {
    options: BackoffOptions,
    invocation_index: u32,
    backoff: Duration,
    backoff_with_jitter: Duration,
}

impl BackoffStrategy {
    pub fn new(options: BackoffOptions) -> Self {
        let mut strategy = BackoffStrategy {
            backoff: options.min_backoff,
            backoff_with_jitter: options.min_backoff,
            options,
            invocation_index: 0,
        };
        strategy.restart();
        strategy
    }

    pub fn restart(&mut self) {
        self.invocation_index = 0;
        self.backoff = self.options.min_backoff;
        self.apply_jitter();
    }

    /// Advances to the next attempt. Returns false once the invocation budget is spent.
    pub fn next(&mut self) -> bool {
        if self.invocation_index > 0 {
            let grown = self.backoff.as_secs_f64() * self.options.multiplier;
            self.backoff = std::cmp::min(Duration::from_secs_f64(grown), self.options.max_backoff);
            self.apply_jitter();
        }
        self.invocation_index += 1;
        self.invocation_index < self.options.invocation_count
    }

    pub fn invocation_index(&self) -> u32 {
        self.invocation_index
    }

    /// How long to wait before the current attempt.
    pub fn backoff(&self) -> Duration {
        self.backoff_with_jitter
    }

    fn apply_jitter(&mut self) {
        let jitter = self.options.jitter.max(0.0).min(1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        self.backoff_with_jitter = Duration::from_secs_f64(self.backoff.as_secs_f64() * factor);
    }
}
