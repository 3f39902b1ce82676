use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the first call into the runtime.
pub fn now_ms() -> i64 {
    epoch().elapsed().as_millis() as i64
}

/// Monotonic microseconds since the first call into the runtime.
pub fn now_us() -> i64 {
    epoch().elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let x = now_us();
        let y = now_us();
        assert!(x >= 0);
        assert!(x <= y);
    }

    #[test]
    fn ms_tracks_us() {
        let ms = now_ms();
        let us = now_us();
        assert!(us / 1000 >= ms);
    }
}
