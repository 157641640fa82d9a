use crossbeam_utils::Backoff;

/// Poll `ready` until it returns true, spinning briefly and then yielding
/// the thread between checks. No timeout.
///
/// Returns the number of failed polls, mostly useful for tracing.
pub fn spin_until(mut ready: impl FnMut() -> bool) -> usize {
    let backoff = Backoff::new();
    let mut polls = 0;
    while !ready() {
        polls += 1;
        backoff.snooze();
    }
    polls
}
