//! Utilities for adding a bit of jitter to reduce stampeding

use tollgate_clock::UnixTime;

/// A type that provides some jittering of time
pub trait JitterSource {
    /// Jitters a given input time
    fn jitter(&mut self, time: UnixTime) -> UnixTime;
}

impl<J: JitterSource + ?Sized> JitterSource for Box<J> {
    #[inline]
    fn jitter(&mut self, time: UnixTime) -> UnixTime {
        (**self).jitter(time)
    }
}

/// A jitter source that does not do any jittering of time
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, time: UnixTime) -> UnixTime {
        time
    }
}

#[cfg(feature = "rand")]
mod random {
    use rand::{Rng, SeedableRng};
    use tollgate_clock::{DurationSecs, UnixTime};

    /// Jitters a value earlier by a random amount
    ///
    /// Times jittered by this type will have a value with a uniform distribution
    /// in the interval `(time - max_jitter, time]`.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: DurationSecs,
        rand_source: R,
    }

    impl RandomEarlyJitter<rand::rngs::StdRng> {
        /// Constructs a new instance that will jitter times early up to `max_jitter`.
        pub fn new(max_jitter: DurationSecs) -> Self {
            Self {
                max_jitter,
                rand_source: rand::rngs::StdRng::from_entropy(),
            }
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Constructs an instance drawing from a caller-supplied generator
        pub fn with_rng(max_jitter: DurationSecs, rand_source: R) -> Self {
            Self {
                max_jitter,
                rand_source,
            }
        }
    }

    impl<R: Rng> super::JitterSource for RandomEarlyJitter<R> {
        fn jitter(&mut self, time: UnixTime) -> UnixTime {
            if self.max_jitter.0 == 0 {
                return time;
            }
            let jitter = self.rand_source.gen_range(0..(self.max_jitter.0));
            time - DurationSecs(jitter)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::super::JitterSource;
        use super::*;

        #[test]
        fn jitter_only_moves_times_earlier_within_bound() {
            let mut jitter =
                RandomEarlyJitter::with_rng(DurationSecs(30), rand::rngs::StdRng::seed_from_u64(7));
            for _ in 0..100 {
                let t = jitter.jitter(UnixTime(1_000));
                assert!(t <= UnixTime(1_000) && t > UnixTime(970), "{:?}", t);
            }
        }

        #[test]
        fn zero_jitter_is_identity() {
            let mut jitter = RandomEarlyJitter::new(DurationSecs(0));
            assert_eq!(jitter.jitter(UnixTime(42)), UnixTime(42));
        }
    }
}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
