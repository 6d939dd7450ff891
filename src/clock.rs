use std::sync::Mutex;
use std::time::Duration;

pub trait SleeperLike: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the calling thread. The reconciler owns no other work while it waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl SleeperLike for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl SleeperLike for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}
