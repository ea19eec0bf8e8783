use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window byte-rate limiter shared by the upload and download paths.
#[derive(Debug)]
pub struct Throttle {
    max_size: u64,
    window: Duration,
    samples: StdMutex<Vec<Sample>>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: Instant,
    size: u64,
}

impl Throttle {
    pub fn new(max_size: u64, window: Duration) -> Self {
        Self {
            max_size,
            window,
            samples: StdMutex::new(Vec::new()),
        }
    }

    pub fn add(&self, size: u64) {
        self.samples.lock().unwrap().push(Sample {
            time: Instant::now(),
            size,
        });
    }

    pub fn is_throttled(&self) -> bool {
        let mut samples = self.samples.lock().unwrap();

        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            samples.retain(|sample| sample.time >= cutoff);
        }

        samples.iter().map(|sample| sample.size).sum::<u64>() >= self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::Throttle;
    use std::time::Duration;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn window_sum() {
        let throttle = Throttle::new(100, Duration::from_secs(1));

        throttle.add(60);
        assert!(!throttle.is_throttled());

        throttle.add(50);
        assert!(throttle.is_throttled());

        advance(Duration::from_millis(1100)).await;
        assert!(!throttle.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn exact_limit_throttles() {
        let throttle = Throttle::new(100, Duration::from_secs(1));

        throttle.add(99);
        assert!(!throttle.is_throttled());

        throttle.add(1);
        assert!(throttle.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_expire_gradually() {
        let throttle = Throttle::new(100, Duration::from_secs(1));

        throttle.add(70);
        advance(Duration::from_millis(600)).await;
        throttle.add(70);
        assert!(throttle.is_throttled());

        // first sample falls out of the window, second remains
        advance(Duration::from_millis(600)).await;
        assert!(!throttle.is_throttled());
    }
}
