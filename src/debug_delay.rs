use std::cell::Cell;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// Upper bound of a pause, in microseconds.
static MAX_PAUSE_MICROS: LazyLock<u64> = LazyLock::new(|| {
    std::env::var("MCACHE_MOCK_DELAY_INTENSITY")
        .ok()
        .and_then(|intensity| intensity.parse().ok())
        .unwrap_or(100)
});

/// Paces a mock write transaction as it begins or finishes. With other
/// writers around, it now and then sleeps briefly and otherwise yields half
/// of the time, so tests see writers admitted and retired in varied orders.
/// A lone writer is never slowed down.
pub(crate) fn pace_write(other_writers: usize) {
    if other_writers == 0 {
        return;
    }

    match roll(64) {
        0 => thread::sleep(Duration::from_micros(roll(MAX_PAUSE_MICROS.saturating_add(1)))),
        n if n % 2 == 0 => thread::yield_now(),
        _ => {}
    }
}

/// A per-thread splitmix64 draw in `0..n`.
fn roll(n: u64) -> u64 {
    static SEEDS: AtomicU64 = AtomicU64::new(GAMMA);

    thread_local! {
        static STATE: Cell<u64> = Cell::new(SEEDS.fetch_add(GAMMA, Ordering::Relaxed));
    }

    STATE
        .try_with(|state| {
            let mut z = state.get().wrapping_add(GAMMA);
            state.set(z);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            (z ^ (z >> 31)) % n.max(1)
        })
        .unwrap_or(0)
}
