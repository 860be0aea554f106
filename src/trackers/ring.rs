use std::collections::VecDeque;

/// Fixed-capacity sample window with gap awareness.
///
/// Pushing beyond capacity overwrites the oldest sample. A `None` sample is a
/// "gap": the entity existed but could not be observed that tick. Gaps stay
/// in the window so absence is visible to eviction logic, but they are
/// excluded from both the running sum and the sample count, so the average
/// covers real observations only.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    buf: VecDeque<Option<u64>>,
    capacity: usize,
    sum: u64,
    real: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
            real: 0,
        }
    }

    /// Append a sample, dropping the oldest one once the window is full.
    pub fn push(&mut self, sample: Option<u64>) {
        if self.buf.len() == self.capacity {
            if let Some(Some(old)) = self.buf.pop_front() {
                self.sum -= old;
                self.real -= 1;
            }
        }
        if let Some(v) = sample {
            self.sum += v;
            self.real += 1;
        }
        self.buf.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of real (non-gap) samples currently in the window.
    pub fn real_count(&self) -> usize {
        self.real
    }

    /// Number of gap samples currently in the window.
    pub fn gap_count(&self) -> usize {
        self.buf.len() - self.real
    }

    /// Average over real samples only. `None` when every slot is a gap.
    pub fn average(&self) -> Option<f64> {
        if self.real == 0 {
            None
        } else {
            Some(self.sum as f64 / self.real as f64)
        }
    }

    /// Largest real sample currently in the window. `None` when every slot
    /// is a gap.
    pub fn real_max(&self) -> Option<u64> {
        self.buf.iter().flatten().copied().max()
    }

    /// Most recent sample, if any was pushed.
    pub fn last(&self) -> Option<Option<u64>> {
        self.buf.back().copied()
    }

    /// Length of the run of consecutive gaps ending at the newest sample.
    pub fn trailing_gap_run(&self) -> usize {
        self.buf.iter().rev().take_while(|s| s.is_none()).count()
    }
}

/// Fixed-capacity delta ring with two rolling sums.
///
/// Each push stores one tick's delta and maintains a sum over the most recent
/// `short` slots and over the whole ring, by adding the new delta and
/// subtracting the delta falling out of each window. Slots start at zero, so
/// the sums are exact from the first push onward.
#[derive(Debug, Clone)]
pub struct DeltaRing {
    buf: Vec<u64>,
    cursor: usize,
    short: usize,
    sum_short: u64,
    sum_full: u64,
}

impl DeltaRing {
    pub fn new(capacity: usize, short: usize) -> Self {
        assert!(short > 0 && short < capacity);
        Self {
            buf: vec![0; capacity],
            cursor: 0,
            short,
            sum_short: 0,
            sum_full: 0,
        }
    }

    pub fn push(&mut self, delta: u64) {
        let capacity = self.buf.len();
        // The slot under the cursor holds the delta from `capacity` ticks
        // ago; the slot `short` behind it holds the one leaving the short
        // window.
        let leaving_full = self.buf[self.cursor];
        let short_idx = (self.cursor + capacity - self.short) % capacity;
        let leaving_short = self.buf[short_idx];

        self.sum_full = self.sum_full + delta - leaving_full;
        self.sum_short = self.sum_short + delta - leaving_short;

        self.buf[self.cursor] = delta;
        self.cursor = (self.cursor + 1) % capacity;
    }

    /// Sum of the most recent `short` deltas divided by `short`.
    pub fn load_short(&self) -> f64 {
        self.sum_short as f64 / self.short as f64
    }

    /// Sum of all buffered deltas divided by the ring capacity.
    pub fn load_full(&self) -> f64 {
        self.sum_full as f64 / self.buf.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_average_excludes_gaps() {
        let mut w = SampleWindow::new(10);
        w.push(Some(4));
        w.push(None);
        w.push(Some(8));
        w.push(None);
        assert_eq!(w.len(), 4);
        assert_eq!(w.real_count(), 2);
        assert_eq!(w.gap_count(), 2);
        assert_eq!(w.average(), Some(6.0));
    }

    #[test]
    fn test_window_average_none_when_all_gaps() {
        let mut w = SampleWindow::new(4);
        w.push(None);
        w.push(None);
        assert_eq!(w.average(), None);
    }

    #[test]
    fn test_window_overwrite_adjusts_sum_and_count() {
        let mut w = SampleWindow::new(3);
        w.push(Some(10));
        w.push(Some(20));
        w.push(Some(30));
        // Evicts the 10.
        w.push(Some(40));
        assert_eq!(w.len(), 3);
        assert_eq!(w.real_count(), 3);
        assert_eq!(w.average(), Some(30.0));
        // Evicts the 20 with a gap; sum drops, count drops.
        w.push(None);
        assert_eq!(w.real_count(), 2);
        assert_eq!(w.average(), Some(35.0));
    }

    #[test]
    fn test_window_average_matches_naive_over_long_sequence() {
        let mut w = SampleWindow::new(300);
        let mut naive: Vec<Option<u64>> = Vec::new();
        for i in 0..1000u64 {
            let s = if i % 7 == 0 { None } else { Some(i % 13) };
            w.push(s);
            naive.push(s);
        }
        let tail = &naive[naive.len() - 300..];
        let sum: u64 = tail.iter().flatten().sum();
        let count = tail.iter().flatten().count();
        assert_eq!(w.real_count(), count);
        assert_eq!(w.average(), Some(sum as f64 / count as f64));
    }

    #[test]
    fn test_window_trailing_gap_run() {
        let mut w = SampleWindow::new(8);
        w.push(Some(1));
        w.push(None);
        w.push(None);
        assert_eq!(w.trailing_gap_run(), 2);
        w.push(Some(2));
        assert_eq!(w.trailing_gap_run(), 0);
    }

    #[test]
    fn test_window_max_follows_eviction() {
        let mut w = SampleWindow::new(3);
        assert_eq!(w.real_max(), None);
        w.push(Some(50));
        w.push(Some(1));
        w.push(None);
        assert_eq!(w.real_max(), Some(50));
        // Evicts the 50; the max falls back to what remains.
        w.push(Some(2));
        assert_eq!(w.real_max(), Some(2));
    }

    #[test]
    fn test_window_last() {
        let mut w = SampleWindow::new(2);
        assert_eq!(w.last(), None);
        w.push(Some(5));
        assert_eq!(w.last(), Some(Some(5)));
        w.push(None);
        assert_eq!(w.last(), Some(None));
    }

    #[test]
    fn test_ring_constant_delta_converges_to_delta() {
        let mut r = DeltaRing::new(900, 300);
        for _ in 0..300 {
            r.push(7);
        }
        assert!((r.load_short() - 7.0).abs() < f64::EPSILON);
        for _ in 0..600 {
            r.push(7);
        }
        assert!((r.load_full() - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ring_short_window_forgets_old_deltas() {
        let mut r = DeltaRing::new(900, 300);
        for _ in 0..300 {
            r.push(10);
        }
        for _ in 0..300 {
            r.push(0);
        }
        // Short window saw only zeros; full window still remembers the burst.
        assert_eq!(r.load_short(), 0.0);
        assert!((r.load_full() - 10.0 * 300.0 / 900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ring_wraps_without_drift() {
        let mut r = DeltaRing::new(10, 3);
        let mut pushed: Vec<u64> = Vec::new();
        for i in 0..57u64 {
            r.push(i % 5);
            pushed.push(i % 5);
        }
        let full: u64 = pushed[pushed.len() - 10..].iter().sum();
        let short: u64 = pushed[pushed.len() - 3..].iter().sum();
        assert!((r.load_full() - full as f64 / 10.0).abs() < f64::EPSILON);
        assert!((r.load_short() - short as f64 / 3.0).abs() < f64::EPSILON);
    }
}
