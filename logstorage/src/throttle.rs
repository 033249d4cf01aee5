//! Process-wide throttling of repetitive warnings

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default suppression window for throttled warnings.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

lazy_static! {
    static ref LAST_EMIT: Mutex<HashMap<&'static str, Instant>> = Mutex::new(HashMap::new());
}

/// Returns true at most once per `period` for the given reason key.
///
/// Dropped-row warnings can fire once per ingested row; call sites gate
/// the actual log macro on this so a misbehaving client cannot flood
/// the log.
pub fn should_log(reason: &'static str, period: Duration) -> bool {
    let now = Instant::now();
    let mut last_emit = LAST_EMIT.lock().unwrap();
    match last_emit.get(reason) {
        Some(last) if now.duration_since(*last) < period => false,
        _ => {
            last_emit.insert(reason, now);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn suppresses_within_the_period() {
        let period = Duration::from_secs(3600);
        assert!(should_log("test_reason_a", period));
        assert!(!should_log("test_reason_a", period));
        // an unrelated reason key has its own window
        assert!(should_log("test_reason_b", period));
    }

    #[test]
    #[serial]
    fn emits_again_after_the_period() {
        let period = Duration::from_millis(10);
        assert!(should_log("test_reason_c", period));
        std::thread::sleep(Duration::from_millis(20));
        assert!(should_log("test_reason_c", period));
    }
}
