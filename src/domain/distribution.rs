//! Histogram accumulation for distribution-valued metrics.
//!
//! A distribution has `n + 1` ordered boundaries `b0 < b1 < ... < bn` and
//! `n + 2` bucket counts:
//!
//! ```text
//! bucket 0      (-inf, b0)        underflow
//! bucket i      [b(i-1), b(i))    finite, 1 <= i <= n
//! bucket n + 1  [bn, +inf)        overflow
//! ```
//!
//! Every sample lands in exactly one bucket. Nothing is dropped at the edges.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error returned when a bucket specification is invalid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BucketError {
    /// Linear and exponential layouts need at least one finite bucket
    #[error("number of finite buckets must be greater than 0")]
    ZeroBuckets,
    /// Linear bucket width must be positive and finite
    #[error("linear bucket width must be positive, got {0}")]
    NonPositiveWidth(f64),
    /// Exponential growth factor must exceed 1
    #[error("exponential growth factor must be greater than 1, got {0}")]
    GrowthFactorTooSmall(f64),
    /// Exponential scale must be positive and finite
    #[error("exponential scale must be positive, got {0}")]
    NonPositiveScale(f64),
    /// Explicit layouts need at least one boundary
    #[error("explicit bucket bounds must not be empty")]
    EmptyBounds,
    /// Explicit bounds must be finite and strictly increasing
    #[error("explicit bucket bounds must be finite and strictly increasing (index {0})")]
    UnorderedBounds(usize),
    /// Computed boundaries overflowed to a non-finite value
    #[error("bucket layout produces non-finite boundaries")]
    NonFiniteBoundary,
    /// Computed boundaries stopped increasing after rounding
    #[error("bucket layout produces non-increasing boundaries (index {0})")]
    DegenerateBounds(usize),
}

/// Declared bucket layout of a distribution metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BucketSpec {
    /// Boundaries at `offset + width * i` for `i` in `0..=num_finite_buckets`.
    Linear {
        num_finite_buckets: u32,
        width: f64,
        offset: f64,
    },
    /// Boundaries at `scale * growth_factor^i` for `i` in `0..=num_finite_buckets`.
    Exponential {
        num_finite_buckets: u32,
        growth_factor: f64,
        scale: f64,
    },
    /// Boundaries given verbatim.
    Explicit { bounds: Vec<f64> },
}

impl BucketSpec {
    /// Linear layout.
    pub fn linear(num_finite_buckets: u32, width: f64, offset: f64) -> Self {
        BucketSpec::Linear {
            num_finite_buckets,
            width,
            offset,
        }
    }

    /// Exponential layout.
    pub fn exponential(num_finite_buckets: u32, growth_factor: f64, scale: f64) -> Self {
        BucketSpec::Exponential {
            num_finite_buckets,
            growth_factor,
            scale,
        }
    }

    /// Explicit layout.
    pub fn explicit(bounds: Vec<f64>) -> Self {
        BucketSpec::Explicit { bounds }
    }

    /// Check the layout and compute its boundaries.
    pub fn boundaries(&self) -> Result<Vec<f64>, BucketError> {
        let bounds = match self {
            BucketSpec::Linear {
                num_finite_buckets,
                width,
                offset,
            } => {
                if *num_finite_buckets == 0 {
                    return Err(BucketError::ZeroBuckets);
                }
                if !(width.is_finite() && *width > 0.0) {
                    return Err(BucketError::NonPositiveWidth(*width));
                }
                (0..=*num_finite_buckets)
                    .map(|i| offset + width * f64::from(i))
                    .collect::<Vec<_>>()
            }
            BucketSpec::Exponential {
                num_finite_buckets,
                growth_factor,
                scale,
            } => {
                if *num_finite_buckets == 0 {
                    return Err(BucketError::ZeroBuckets);
                }
                if !(growth_factor.is_finite() && *growth_factor > 1.0) {
                    return Err(BucketError::GrowthFactorTooSmall(*growth_factor));
                }
                if !(scale.is_finite() && *scale > 0.0) {
                    return Err(BucketError::NonPositiveScale(*scale));
                }
                let mut bounds = Vec::with_capacity(*num_finite_buckets as usize + 1);
                let mut bound = *scale;
                for _ in 0..=*num_finite_buckets {
                    bounds.push(bound);
                    bound *= growth_factor;
                }
                bounds
            }
            BucketSpec::Explicit { bounds } => {
                if bounds.is_empty() {
                    return Err(BucketError::EmptyBounds);
                }
                for (i, b) in bounds.iter().enumerate() {
                    if !b.is_finite() || (i > 0 && *b <= bounds[i - 1]) {
                        return Err(BucketError::UnorderedBounds(i));
                    }
                }
                bounds.clone()
            }
        };

        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(BucketError::NonFiniteBoundary);
        }
        // Large offsets or tiny scales can round neighbouring bounds together.
        if let Some(i) = bounds.windows(2).position(|w| w[1] <= w[0]) {
            return Err(BucketError::DegenerateBounds(i + 1));
        }
        Ok(bounds)
    }
}

/// Point-in-time view of a distribution, ready for the remote metric format.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionSnapshot {
    /// Declared layout
    pub spec: BucketSpec,
    /// Bucket boundaries (`bucket_counts.len() == bounds.len() + 1`)
    pub bounds: Arc<[f64]>,
    /// Per-bucket counts, underflow first and overflow last
    pub bucket_counts: Vec<u64>,
    /// Number of samples
    pub count: u64,
    /// Arithmetic mean, 0 when empty
    pub mean: f64,
    /// Smallest sample, 0 when empty
    pub minimum: f64,
    /// Largest sample, 0 when empty
    pub maximum: f64,
    /// Sum of squared deviations from the mean
    pub sum_of_squared_deviation: f64,
}

impl DistributionSnapshot {
    /// Sum of all bucket counts.
    pub fn total(&self) -> u64 {
        self.bucket_counts.iter().sum()
    }
}

/// Accumulates raw samples into buckets.
///
/// Not internally synchronized. The report aggregator serializes access
/// per key.
#[derive(Debug, Clone)]
pub struct DistributionBuilder {
    spec: BucketSpec,
    bounds: Arc<[f64]>,
    bucket_counts: Vec<u64>,
    count: u64,
    mean: f64,
    minimum: f64,
    maximum: f64,
    sum_of_squared_deviation: f64,
}

impl DistributionBuilder {
    /// Create an empty builder for the given layout.
    ///
    /// # Errors
    /// Returns `BucketError` if the layout is invalid.
    pub fn new(spec: BucketSpec) -> Result<Self, BucketError> {
        let bounds: Arc<[f64]> = spec.boundaries()?.into();
        let bucket_counts = vec![0; bounds.len() + 1];
        Ok(Self {
            spec,
            bounds,
            bucket_counts,
            count: 0,
            mean: 0.0,
            minimum: 0.0,
            maximum: 0.0,
            sum_of_squared_deviation: 0.0,
        })
    }

    /// Fold one sample in.
    ///
    /// Binary search over the boundaries: O(log n) per sample.
    pub fn add(&mut self, sample: f64) {
        let index = self.bucket_index(sample);
        self.bucket_counts[index] += 1;

        if self.count == 0 {
            self.minimum = sample;
            self.maximum = sample;
        } else {
            self.minimum = self.minimum.min(sample);
            self.maximum = self.maximum.max(sample);
        }

        // Welford's online update
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_of_squared_deviation += delta * (sample - self.mean);
    }

    /// Index of the bucket owning `sample`.
    pub fn bucket_index(&self, sample: f64) -> usize {
        self.bounds.partition_point(|bound| *bound <= sample)
    }

    /// Number of samples since the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Bucket boundaries.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Current bucket counts.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.bucket_counts
    }

    /// Copy out the current state.
    pub fn snapshot(&self) -> DistributionSnapshot {
        DistributionSnapshot {
            spec: self.spec.clone(),
            bounds: Arc::clone(&self.bounds),
            bucket_counts: self.bucket_counts.clone(),
            count: self.count,
            mean: self.mean,
            minimum: self.minimum,
            maximum: self.maximum,
            sum_of_squared_deviation: self.sum_of_squared_deviation,
        }
    }

    /// Zero all counts and statistics. Boundaries are kept.
    pub fn reset(&mut self) {
        self.bucket_counts.iter_mut().for_each(|c| *c = 0);
        self.count = 0;
        self.mean = 0.0;
        self.minimum = 0.0;
        self.maximum = 0.0;
        self.sum_of_squared_deviation = 0.0;
    }

    /// Snapshot and reset in one step.
    pub fn take(&mut self) -> DistributionSnapshot {
        let snapshot = self.snapshot();
        self.reset();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_bounds_partition() {
        let mut dist = DistributionBuilder::new(BucketSpec::explicit(vec![0.0, 10.0, 100.0]))
            .unwrap();
        for sample in [1.0, 5.0, 5.0, 20.0] {
            dist.add(sample);
        }

        // (-inf,0) [0,10) [10,100) [100,inf)
        assert_eq!(dist.bucket_counts(), &[0, 3, 1, 0]);
        assert_eq!(dist.snapshot().total(), 4);
    }

    #[test]
    fn test_edge_samples_land_in_edge_buckets() {
        let mut dist = DistributionBuilder::new(BucketSpec::explicit(vec![0.0, 10.0, 100.0]))
            .unwrap();
        dist.add(-5.0);
        dist.add(100.0);
        dist.add(1e12);
        dist.add(0.0);
        dist.add(10.0);

        assert_eq!(dist.bucket_counts(), &[1, 1, 1, 2]);
        assert_eq!(dist.count(), 5);
    }

    #[test]
    fn test_lower_bound_inclusive_upper_exclusive() {
        let dist = DistributionBuilder::new(BucketSpec::explicit(vec![1.0, 2.0])).unwrap();
        assert_eq!(dist.bucket_index(0.999), 0);
        assert_eq!(dist.bucket_index(1.0), 1);
        assert_eq!(dist.bucket_index(1.999), 1);
        assert_eq!(dist.bucket_index(2.0), 2);
    }

    #[test]
    fn test_linear_boundaries() {
        let bounds = BucketSpec::linear(4, 2.5, -5.0).boundaries().unwrap();
        assert_eq!(bounds, vec![-5.0, -2.5, 0.0, 2.5, 5.0]);
    }

    #[test]
    fn test_exponential_boundaries() {
        let bounds = BucketSpec::exponential(3, 10.0, 1.0).boundaries().unwrap();
        assert_eq!(bounds, vec![1.0, 10.0, 100.0, 1000.0]);

        let mut dist = DistributionBuilder::new(BucketSpec::exponential(3, 10.0, 1.0)).unwrap();
        assert_eq!(dist.bucket_counts().len(), 5);
        dist.add(0.5);
        dist.add(50.0);
        dist.add(5000.0);
        assert_eq!(dist.bucket_counts(), &[1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert_eq!(
            BucketSpec::linear(0, 1.0, 0.0).boundaries(),
            Err(BucketError::ZeroBuckets)
        );
        assert_eq!(
            BucketSpec::linear(3, 0.0, 0.0).boundaries(),
            Err(BucketError::NonPositiveWidth(0.0))
        );
        assert_eq!(
            BucketSpec::exponential(3, 1.0, 1.0).boundaries(),
            Err(BucketError::GrowthFactorTooSmall(1.0))
        );
        assert_eq!(
            BucketSpec::exponential(3, 2.0, -1.0).boundaries(),
            Err(BucketError::NonPositiveScale(-1.0))
        );
        assert_eq!(
            BucketSpec::explicit(vec![]).boundaries(),
            Err(BucketError::EmptyBounds)
        );
        assert_eq!(
            BucketSpec::explicit(vec![1.0, 1.0]).boundaries(),
            Err(BucketError::UnorderedBounds(1))
        );
        assert_eq!(
            BucketSpec::explicit(vec![1.0, f64::NAN]).boundaries(),
            Err(BucketError::UnorderedBounds(1))
        );
        assert_eq!(
            BucketSpec::exponential(2000, 10.0, 1.0).boundaries(),
            Err(BucketError::NonFiniteBoundary)
        );
    }

    #[test]
    fn test_computed_bounds_that_collapse_are_rejected() {
        // 1e17 + 1.0 rounds back to 1e17.
        assert_eq!(
            BucketSpec::linear(3, 1.0, 1e17).boundaries(),
            Err(BucketError::DegenerateBounds(1))
        );
        assert_eq!(
            BucketSpec::exponential(3, 1.1, f64::from_bits(1)).boundaries(),
            Err(BucketError::DegenerateBounds(1))
        );
        assert!(DistributionBuilder::new(BucketSpec::linear(3, 1.0, 1e17)).is_err());
        assert!(BucketSpec::linear(3, 1.0, 1e15).boundaries().is_ok());
    }

    #[test]
    fn test_statistics() {
        let mut dist = DistributionBuilder::new(BucketSpec::explicit(vec![0.0])).unwrap();
        for sample in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            dist.add(sample);
        }
        let snap = dist.snapshot();
        assert_eq!(snap.count, 8);
        assert!((snap.mean - 5.0).abs() < 1e-9);
        assert_eq!(snap.minimum, 2.0);
        assert_eq!(snap.maximum, 9.0);
        // population variance 4 => squared deviation sum 32
        assert!((snap.sum_of_squared_deviation - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_take_resets_but_keeps_bounds() {
        let mut dist = DistributionBuilder::new(BucketSpec::linear(2, 1.0, 0.0)).unwrap();
        dist.add(0.5);
        dist.add(1.5);

        let first = dist.take();
        assert_eq!(first.total(), 2);
        assert_eq!(dist.count(), 0);
        assert_eq!(dist.bucket_counts(), &[0, 0, 0, 0]);
        assert_eq!(dist.bounds(), &[0.0, 1.0, 2.0]);

        dist.add(1.5);
        let second = dist.take();
        assert_eq!(second.total(), 1);
        assert_eq!(second.minimum, 1.5);
    }

    #[test]
    fn test_empty_snapshot() {
        let dist = DistributionBuilder::new(BucketSpec::explicit(vec![1.0])).unwrap();
        let snap = dist.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.mean, 0.0);
        assert_eq!(snap.bucket_counts, vec![0, 0]);
    }
}
