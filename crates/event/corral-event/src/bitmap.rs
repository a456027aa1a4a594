//! Bitmap mailbox: one sticky bit per event type.
//!
//! The cheapest discipline. Posting sets bit `ev_type`; repeated posts of
//! the same type coalesce into a single observation and the payload is
//! dropped. Never allocates, never overflows.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use corral_core::config::NR_EVENT_TYPES;

use crate::EventMsg;

const WORDS: usize = NR_EVENT_TYPES.div_ceil(64);

/// A fixed array of per-type event bits.
pub struct EvBitmap {
    bits: [AtomicU64; WORDS],
    /// Fast-path hint: set on every post, cleared when a full scan comes
    /// up empty. Spurious `true` is harmless.
    check_bits: AtomicBool,
}

impl Default for EvBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl EvBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self {
            bits: [const { AtomicU64::new(0) }; WORDS],
            check_bits: AtomicBool::new(false),
        }
    }

    /// Records that an event of `ev_type` occurred.
    pub fn post(&self, ev_type: u16) {
        let t = usize::from(ev_type) % NR_EVENT_TYPES;
        self.bits[t / 64].fetch_or(1 << (t % 64), Ordering::Release);
        self.check_bits.store(true, Ordering::Release);
    }

    /// Clears and returns the lowest pending event type as a payload-free
    /// message, or `None` if no bit is set.
    pub fn extract_one(&self) -> Option<EventMsg> {
        if !self.check_bits.load(Ordering::Acquire) {
            return None;
        }
        for (w, word) in self.bits.iter().enumerate() {
            loop {
                let cur = word.load(Ordering::Acquire);
                if cur == 0 {
                    break;
                }
                let bit = cur.trailing_zeros();
                let mask = 1u64 << bit;
                // Clear just our bit; another consumer may be racing for
                // a different one in the same word.
                let prev = word.fetch_and(!mask, Ordering::AcqRel);
                if prev & mask != 0 {
                    #[expect(clippy::cast_possible_truncation, reason = "type fits NR_EVENT_TYPES")]
                    return Some(EventMsg::of_type((w * 64 + bit as usize) as u16));
                }
                // Lost the race for that bit; rescan the word.
            }
        }
        // Full scan found nothing; drop the hint. A concurrent post will
        // re-raise it after setting its bit.
        self.check_bits.store(false, Ordering::Release);
        None
    }

    /// Returns `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posts_of_same_type_coalesce() {
        let bm = EvBitmap::new();
        bm.post(7);
        bm.post(7);
        bm.post(7);
        assert_eq!(bm.extract_one().unwrap().ev_type, 7);
        assert!(bm.extract_one().is_none());
    }

    #[test]
    fn extract_returns_lowest_first() {
        let bm = EvBitmap::new();
        bm.post(9);
        bm.post(3);
        bm.post(40);
        assert_eq!(bm.extract_one().unwrap().ev_type, 3);
        assert_eq!(bm.extract_one().unwrap().ev_type, 9);
        assert_eq!(bm.extract_one().unwrap().ev_type, 40);
        assert!(bm.is_empty());
    }

    #[test]
    fn payload_is_dropped() {
        let bm = EvBitmap::new();
        bm.post(2);
        let msg = bm.extract_one().unwrap();
        assert_eq!(msg.ev_arg3, 0);
        assert_eq!(msg.ev_arg2, 0);
    }
}
