use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, as captured on the producer thread.
///
/// The value is recorded into every dynamic record before the ring
/// reservation is made, so consumer-side delays never skew it.
#[inline]
pub fn unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        // Clock before the epoch: report a negative interval.
        Err(err) => -(err.duration().as_millis() as i64),
    }
}
