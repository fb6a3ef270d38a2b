use std::sync::{PoisonError, RwLock};

/// One committed ingest result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub counter: i64,
    pub random: f64,
    pub derived: f64,
}

/// Latest-value cache shared by the ingest producer and the two consumers.
///
/// All fields live behind a single lock so a reader always sees the values of
/// exactly one `update` call.
#[derive(Debug, Default)]
pub struct SharedSnapshot {
    inner: RwLock<Sample>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, counter: i64, random: f64, derived: f64) {
        // a poisoned guard still holds a whole Sample, the write is a plain copy
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Sample {
            counter,
            random,
            derived,
        };
    }

    pub fn read_derived(&self) -> f64 {
        self.sample().derived
    }

    /// Counter and random value, taken from the same update.
    pub fn read_counts(&self) -> (i64, f64) {
        let sample = self.sample();
        (sample.counter, sample.random)
    }

    pub fn sample(&self) -> Sample {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}
