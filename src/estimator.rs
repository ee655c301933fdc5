//! Drop-counter fold.
//!
//! Each drop event carries the cumulative number of undelivered posts since
//! the capture's connection was (re)established. A value below its
//! predecessor means the connection was reset and the counter restarted.

/// How the first observed track value is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// The first value is a baseline and contributes nothing.
    Standalone,
    /// The fold continues from `prior`, the last value known before the
    /// sequence. `prior: 0` means the connection started with a zero counter,
    /// so the first value counts in full.
    Continued { prior: u64 },
}

impl Continuity {
    pub const FROM_ZERO: Continuity = Continuity::Continued { prior: 0 };

    pub fn carried(prior: Option<u64>) -> Self {
        Continuity::Continued {
            prior: prior.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFold {
    previous: Option<u64>,
    total: u64,
    observed: u64,
}

impl TrackFold {
    pub fn new(continuity: Continuity) -> Self {
        let previous = match continuity {
            Continuity::Standalone => None,
            Continuity::Continued { prior } => Some(prior),
        };
        Self {
            previous,
            total: 0,
            observed: 0,
        }
    }

    pub fn push(&mut self, value: u64) {
        let increment = match self.previous {
            None => 0,
            Some(previous) if value >= previous => value - previous,
            // reconnect: the counter restarted and `value` is all new drops
            Some(_) => value,
        };
        self.total = self.total.saturating_add(increment);
        self.previous = Some(value);
        self.observed += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of values pushed, excluding the seed.
    pub fn observed(&self) -> u64 {
        self.observed
    }
}

impl Default for TrackFold {
    fn default() -> Self {
        Self::new(Continuity::FROM_ZERO)
    }
}

impl Extend<u64> for TrackFold {
    fn extend<I: IntoIterator<Item = u64>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

pub fn estimate_missing<I>(tracks: I, continuity: Continuity) -> u64
where
    I: IntoIterator<Item = u64>,
{
    let mut fold = TrackFold::new(continuity);
    fold.extend(tracks);
    fold.total()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_sequence() {
        assert_eq!(estimate_missing([5, 12, 20], Continuity::Standalone), 15);
        assert_eq!(estimate_missing([5, 12, 20], Continuity::FROM_ZERO), 20);
    }

    #[test]
    fn reset_adds_new_value() {
        // baseline 50, reset to 10 (+10), then 10 -> 30 (+20)
        assert_eq!(estimate_missing([50, 10, 30], Continuity::Standalone), 30);
        assert_eq!(estimate_missing([50, 10, 30], Continuity::FROM_ZERO), 80);
    }

    #[test]
    fn carried_seed_spans_bucket_boundary() {
        // previous bucket ended at 100
        assert_eq!(estimate_missing([130, 160], Continuity::carried(Some(100))), 60);
        // reconnect right after the boundary
        assert_eq!(estimate_missing([4, 9], Continuity::carried(Some(100))), 9);
        assert_eq!(estimate_missing([4, 9], Continuity::carried(None)), 9);
    }

    #[test]
    fn empty_and_repeated_values() {
        assert_eq!(estimate_missing([], Continuity::FROM_ZERO), 0);
        assert_eq!(estimate_missing([7], Continuity::Standalone), 0);
        assert_eq!(estimate_missing([7, 7, 7], Continuity::FROM_ZERO), 7);
    }

    #[test]
    fn fold_counts_pushed_values() {
        let mut fold = TrackFold::new(Continuity::carried(Some(3)));
        assert_eq!(fold.observed(), 0);
        fold.push(8);
        fold.push(2);
        assert_eq!(fold.total(), 7);
        assert_eq!(fold.observed(), 2);
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        assert_eq!(estimate_missing([u64::MAX, 1, u64::MAX], Continuity::FROM_ZERO), u64::MAX);
    }
}
