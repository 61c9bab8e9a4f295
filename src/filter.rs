use std::{collections::VecDeque, time::Duration};

const PREALLOCATED_SAMPLES: usize = 64;

/// Moving average over the last `window / poll_interval` temperature samples.
#[derive(Debug, Clone)]
pub struct TemperatureFilter {
    samples: VecDeque<f32>,
    capacity: usize,
    sum: f64,
}

impl TemperatureFilter {
    pub fn new(window: Duration, poll_interval: Duration) -> Self {
        let capacity = Self::capacity_for(window, poll_interval);
        Self {
            samples: VecDeque::with_capacity(capacity.min(PREALLOCATED_SAMPLES)),
            capacity,
            sum: 0.0,
        }
    }

    /// `ceil(window / poll_interval)`, never less than one.
    pub fn capacity_for(window: Duration, poll_interval: Duration) -> usize {
        let poll = poll_interval.as_millis().max(1);
        let samples = window.as_millis().div_ceil(poll).max(1);
        usize::try_from(samples).unwrap_or(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Pushes `sample` and returns the mean of the retained samples.
    pub fn filter(&mut self, sample: f32) -> f32 {
        if self.samples.len() == self.capacity
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= f64::from(oldest);
        }
        self.samples.push_back(sample);
        self.sum += f64::from(sample);

        (self.sum / self.samples.len() as f64) as f32
    }

    /// Mean of the retained samples, if any.
    #[cfg(test)]
    pub fn current(&self) -> Option<f32> {
        (!self.samples.is_empty()).then(|| (self.sum / self.samples.len() as f64) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn capacity_rounds_up_and_is_at_least_one() {
        assert_eq!(TemperatureFilter::capacity_for(ms(6000), ms(3000)), 2);
        assert_eq!(TemperatureFilter::capacity_for(ms(6000), ms(4000)), 2);
        assert_eq!(TemperatureFilter::capacity_for(ms(6000), ms(7000)), 1);
        assert_eq!(TemperatureFilter::capacity_for(ms(0), ms(500)), 1);
    }

    #[test]
    fn huge_window_saturates_without_allocating() {
        let filter = TemperatureFilter::new(Duration::MAX, ms(1));
        assert_eq!(filter.capacity(), usize::MAX);
        assert!(filter.samples.capacity() < 1024);
    }

    #[test]
    fn running_mean_over_three_samples() {
        let mut filter = TemperatureFilter::new(ms(3000), ms(1000));
        assert_eq!(filter.capacity(), 3);
        assert_eq!(filter.current(), None);

        assert_eq!(filter.filter(10.0), 10.0);
        assert_eq!(filter.filter(20.0), 15.0);
        assert_eq!(filter.filter(30.0), 20.0);
    }

    #[test]
    fn oldest_sample_is_evicted() {
        let mut filter = TemperatureFilter::new(ms(2000), ms(1000));

        filter.filter(10.0);
        filter.filter(20.0);
        assert_eq!(filter.filter(40.0), 30.0);
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.current(), Some(30.0));
    }

    proptest! {
        #[test]
        fn mean_matches_recomputed_window(samples in prop::collection::vec(0.0f32..120.0, 1..64), capacity in 1u64..8) {
            let mut filter = TemperatureFilter::new(ms(capacity * 1000), ms(1000));
            let mut last = 0.0;
            for sample in &samples {
                last = filter.filter(*sample);
            }

            let window = &samples[samples.len().saturating_sub(capacity as usize)..];
            let expected = window.iter().map(|s| f64::from(*s)).sum::<f64>() / window.len() as f64;
            prop_assert!((f64::from(last) - expected).abs() < 1e-3);
        }
    }
}
