use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use crate::config::{BucketType, Histogram};

/// Bucket layout of one configured histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSpec {
    pub bucket_type: BucketType,
    pub bucket_min: u64,
    pub bucket_max: u64,
    pub bucket_multiplier: f64,
}

impl From<&Histogram> for HistogramSpec {
    fn from(histogram: &Histogram) -> Self {
        Self {
            bucket_type: histogram.bucket_type,
            bucket_min: histogram.bucket_min,
            bucket_max: histogram.bucket_max,
            bucket_multiplier: histogram.bucket_multiplier,
        }
    }
}

/// Most buckets one histogram may expose.
pub const MAX_BUCKETS: u64 = 1024;

impl HistogramSpec {
    /// Number of bounds `raw_bounds` yields, without building them.
    fn bucket_count(&self) -> u64 {
        match self.bucket_type {
            BucketType::Exp2 => {
                let mut count = 0;
                let mut bound = self.bucket_min;
                if bound == 0 {
                    count += 1;
                    bound = 1;
                }
                while bound <= self.bucket_max {
                    count += 1;
                    match bound.checked_mul(2) {
                        Some(next) => bound = next,
                        None => break,
                    }
                }
                count
            }
            BucketType::Linear if self.bucket_min > self.bucket_max => 0,
            BucketType::Linear => (self.bucket_max - self.bucket_min).saturating_add(1),
        }
    }

    /// Upper bounds in raw key units, ascending, none above `bucket_max`.
    fn raw_bounds(&self) -> Vec<u64> {
        let mut bounds = Vec::new();
        match self.bucket_type {
            BucketType::Exp2 => {
                // 0 * 2^i never grows, so a zero minimum gets its own bucket.
                let mut bound = self.bucket_min;
                if bound == 0 {
                    bounds.push(0);
                    bound = 1;
                }
                while bound <= self.bucket_max {
                    bounds.push(bound);
                    match bound.checked_mul(2) {
                        Some(next) => bound = next,
                        None => break,
                    }
                }
            }
            BucketType::Linear => bounds.extend(self.bucket_min..=self.bucket_max),
        }
        bounds
    }
}

/// A reconstructed cumulative histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// (upper bound, cumulative count), ascending by bound.
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    /// Always zero: per-bucket counters carry no sum.
    pub sum: f64,
}

/// Turn per-bucket counts from a kernel map into cumulative buckets.
///
/// A bucket's count includes every raw key at or below its bound. The total
/// count covers every raw key, including keys above the last bound.
pub fn reconstruct(raw: &BTreeMap<u64, u64>, spec: &HistogramSpec) -> HistogramSnapshot {
    let count = raw.values().fold(0u64, |acc, v| acc.saturating_add(*v));
    let buckets = spec
        .raw_bounds()
        .into_iter()
        .map(|bound| {
            let cumulative = raw
                .range(..=bound)
                .fold(0u64, |acc, (_, v)| acc.saturating_add(*v));
            (bound as f64 * spec.bucket_multiplier, cumulative)
        })
        .collect();

    HistogramSnapshot {
        buckets,
        count,
        sum: 0.0,
    }
}

/// Parse a bucket label as an unsigned integer, decimal or `0x` hex.
pub fn parse_bucket_key(label: &str) -> Result<u64> {
    let label = label.trim();
    let parsed = match label.strip_prefix("0x").or_else(|| label.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => label.parse::<u64>(),
    };
    parsed.with_context(|| format!("bucket key {label:?} is not an unsigned integer"))
}

/// Rows of one histogram table grouped by label prefix, the last label of
/// each row being its bucket key.
#[derive(Debug, Default)]
pub struct HistogramGroups {
    groups: BTreeMap<Vec<String>, Result<BTreeMap<u64, u64>>>,
}

impl HistogramGroups {
    pub fn add(&mut self, labels: &[String], value: u64) {
        let Some((bucket, prefix)) = labels.split_last() else {
            return;
        };
        let key = parse_bucket_key(bucket);
        let entry = self
            .groups
            .entry(prefix.to_vec())
            .or_insert_with(|| Ok(BTreeMap::new()));
        match key {
            Ok(key) => {
                if let Ok(buckets) = entry {
                    let slot = buckets.entry(key).or_insert(0);
                    *slot = slot.saturating_add(value);
                }
            }
            Err(err) => {
                if entry.is_ok() {
                    *entry = Err(err);
                }
            }
        }
    }

    /// Each label prefix with its reconstruction, or the reason it was skipped.
    pub fn reconstruct(
        self,
        spec: HistogramSpec,
    ) -> impl Iterator<Item = (Vec<String>, Result<HistogramSnapshot>)> {
        self.groups.into_iter().map(move |(labels, buckets)| {
            let snapshot = buckets.map(|buckets| reconstruct(&buckets, &spec));
            (labels, snapshot)
        })
    }
}

/// Reject layouts that would produce no buckets, or more than `MAX_BUCKETS`.
pub fn validate(spec: &HistogramSpec) -> Result<()> {
    if spec.bucket_multiplier <= 0.0 || !spec.bucket_multiplier.is_finite() {
        bail!("bucket_multiplier must be a positive number");
    }
    match spec.bucket_count() {
        0 => bail!(
            "no buckets between bucket_min {} and bucket_max {}",
            spec.bucket_min,
            spec.bucket_max
        ),
        count if count > MAX_BUCKETS => bail!(
            "bucket_min {} to bucket_max {} spans {count} buckets, limit is {MAX_BUCKETS}",
            spec.bucket_min,
            spec.bucket_max
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(bucket_type: BucketType, min: u64, max: u64, multiplier: f64) -> HistogramSpec {
        HistogramSpec {
            bucket_type,
            bucket_min: min,
            bucket_max: max,
            bucket_multiplier: multiplier,
        }
    }

    #[test]
    fn exp2_buckets_are_cumulative() {
        let raw = BTreeMap::from([(1, 5), (2, 3), (4, 2)]);
        let snapshot = reconstruct(&raw, &spec(BucketType::Exp2, 1, 8, 1.0));
        assert_eq!(
            snapshot.buckets,
            vec![(1.0, 5), (2.0, 8), (4.0, 10), (8.0, 10)]
        );
        assert_eq!(snapshot.count, 10);
        assert_eq!(snapshot.sum, 0.0);
    }

    #[test]
    fn linear_buckets_apply_multiplier_to_bounds() {
        let raw = BTreeMap::from([(2, 1), (3, 4)]);
        let snapshot = reconstruct(&raw, &spec(BucketType::Linear, 1, 4, 0.5));
        assert_eq!(
            snapshot.buckets,
            vec![(0.5, 0), (1.0, 1), (1.5, 5), (2.0, 5)]
        );
        assert_eq!(snapshot.count, 5);
    }

    #[test]
    fn total_count_includes_keys_above_last_bound() {
        let raw = BTreeMap::from([(1, 1), (64, 9)]);
        let snapshot = reconstruct(&raw, &spec(BucketType::Exp2, 1, 8, 1.0));
        assert_eq!(snapshot.buckets.last(), Some(&(8.0, 1)));
        assert_eq!(snapshot.count, 10);
    }

    #[test]
    fn exp2_with_zero_minimum_keeps_zero_bucket() {
        let raw = BTreeMap::from([(0, 2), (1, 1)]);
        let snapshot = reconstruct(&raw, &spec(BucketType::Exp2, 0, 4, 1.0));
        assert_eq!(
            snapshot.buckets,
            vec![(0.0, 2), (1.0, 3), (2.0, 3), (4.0, 3)]
        );
    }

    #[test]
    fn bucket_keys_parse_decimal_and_hex() {
        assert_eq!(parse_bucket_key("16").unwrap(), 16);
        assert_eq!(parse_bucket_key("0x10").unwrap(), 16);
        assert!(parse_bucket_key("-1").is_err());
        assert!(parse_bucket_key("1ms").is_err());
    }

    #[test]
    fn bad_bucket_key_only_skips_its_own_instance() {
        let mut groups = HistogramGroups::default();
        let row = |labels: &[&str]| labels.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        groups.add(&row(&["sda", "read", "1"]), 3);
        groups.add(&row(&["sda", "read", "2"]), 1);
        groups.add(&row(&["sdb", "write", "1"]), 2);
        groups.add(&row(&["sdb", "write", "oops"]), 7);
        groups.add(&row(&["sdb", "write", "2"]), 2);

        let spec = spec(BucketType::Exp2, 1, 2, 1.0);
        let results: Vec<_> = groups.reconstruct(spec).collect();
        assert_eq!(results.len(), 2);

        let (labels, sda) = &results[0];
        assert_eq!(labels, &row(&["sda", "read"]));
        assert_eq!(sda.as_ref().unwrap().buckets, vec![(1.0, 3), (2.0, 4)]);

        let (labels, sdb) = &results[1];
        assert_eq!(labels, &row(&["sdb", "write"]));
        assert!(sdb.is_err());
    }

    #[test]
    fn validate_rejects_empty_layouts() {
        assert!(validate(&spec(BucketType::Linear, 1, 4, 1.0)).is_ok());
        assert!(validate(&spec(BucketType::Exp2, 5, 4, 1.0)).is_err());
        assert!(validate(&spec(BucketType::Exp2, 1, 4, 0.0)).is_err());
    }

    #[test]
    fn validate_caps_bucket_count() {
        let widest = spec(BucketType::Linear, 0, MAX_BUCKETS - 1, 1.0);
        assert_eq!(widest.bucket_count(), MAX_BUCKETS);
        assert!(validate(&widest).is_ok());
        assert!(validate(&spec(BucketType::Linear, 0, MAX_BUCKETS, 1.0)).is_err());
        // Rejected by arithmetic alone; building these bounds would not fit in memory.
        assert!(validate(&spec(BucketType::Linear, 0, u64::MAX, 1.0)).is_err());
        assert!(validate(&spec(BucketType::Linear, 1, u64::MAX, 1.0)).is_err());

        let full_exp2 = spec(BucketType::Exp2, 0, u64::MAX, 1.0);
        assert_eq!(full_exp2.bucket_count(), 65);
        assert_eq!(full_exp2.raw_bounds().len(), 65);
        assert!(validate(&full_exp2).is_ok());
    }

    #[test]
    fn bucket_count_matches_bounds() {
        for layout in [
            spec(BucketType::Exp2, 1, 8, 1.0),
            spec(BucketType::Exp2, 3, 100, 1.0),
            spec(BucketType::Exp2, 5, 4, 1.0),
            spec(BucketType::Linear, 1, 4, 1.0),
            spec(BucketType::Linear, 7, 7, 1.0),
            spec(BucketType::Linear, 9, 2, 1.0),
        ] {
            assert_eq!(layout.bucket_count(), layout.raw_bounds().len() as u64, "{layout:?}");
        }
    }
}
