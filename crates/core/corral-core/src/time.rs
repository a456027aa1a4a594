//! Monotonic timestamp counter.
//!
//! The machine model's TSC: nanoseconds since the first read, taken from
//! the host monotonic clock. One tick is one nanosecond, so the reported
//! frequency is 1 GHz and the usual sec/usec/nsec conversions are exact.

use std::sync::OnceLock;
use std::time::Instant;

/// Ticks per second of the model TSC.
pub const TSC_FREQ: u64 = 1_000_000_000;

fn boot_instant() -> &'static Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    BOOT.get_or_init(Instant::now)
}

/// Reads the current TSC value. Monotonic across all threads.
pub fn read_tsc() -> u64 {
    u64::try_from(boot_instant().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Converts whole seconds to TSC ticks.
pub const fn sec2tsc(sec: u64) -> u64 {
    sec * TSC_FREQ
}

/// Converts microseconds to TSC ticks.
pub const fn usec2tsc(usec: u64) -> u64 {
    usec * (TSC_FREQ / 1_000_000)
}

/// Converts milliseconds to TSC ticks.
pub const fn msec2tsc(msec: u64) -> u64 {
    msec * (TSC_FREQ / 1_000)
}

/// Converts TSC ticks to whole microseconds.
pub const fn tsc2usec(tsc: u64) -> u64 {
    tsc / (TSC_FREQ / 1_000_000)
}

/// Converts TSC ticks to whole milliseconds.
pub const fn tsc2msec(tsc: u64) -> u64 {
    tsc / (TSC_FREQ / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_is_monotonic() {
        let a = read_tsc();
        let b = read_tsc();
        assert!(b >= a);
    }

    #[test]
    fn conversions_round_trip() {
        assert_eq!(tsc2usec(usec2tsc(1234)), 1234);
        assert_eq!(tsc2msec(msec2tsc(56)), 56);
        assert_eq!(sec2tsc(1), TSC_FREQ);
    }

    #[test]
    fn elapsed_tracks_wall_time() {
        let start = read_tsc();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = read_tsc() - start;
        assert!(elapsed >= msec2tsc(9));
    }
}
