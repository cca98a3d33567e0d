// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use nes_types::FieldValue;

/// The set of supported aggregation functions, dispatched once per task via `match`
/// rather than per record (spec §9 "Polymorphism ... Pipelines dispatch on the
/// variant tag once per task, not per record"). The host crate reaches for
/// `enum_dispatch` on its `Block`/`BlockAPI` hierarchy, but that pattern exists to let
/// an open set of block kinds share one interface; this operator set is closed and
/// small, so a plain tagged enum with `match` arms reads more directly and is used
/// here instead (documented in DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    Median,
}

/// Partial aggregate state held inside a slice, shaped per `AggregateOp` (spec §4.6
/// "Partial-aggregate shapes per operator").
#[derive(Clone, Debug, PartialEq)]
pub enum PartialAggregate {
    Sum(f64),
    Count(u64),
    Min(f64),
    Max(f64),
    Avg { sum: f64, count: u64 },
    /// Unbounded sample list; bounded/approximate medians are out of scope for the
    /// core (spec §4.6 "unbounded for this core; bounded variants out of scope").
    Median(Vec<f64>),
}

impl AggregateOp {
    pub fn identity(self) -> PartialAggregate {
        match self {
            AggregateOp::Sum => PartialAggregate::Sum(0.0),
            AggregateOp::Count => PartialAggregate::Count(0),
            AggregateOp::Min => PartialAggregate::Min(f64::INFINITY),
            AggregateOp::Max => PartialAggregate::Max(f64::NEG_INFINITY),
            AggregateOp::Avg => PartialAggregate::Avg { sum: 0.0, count: 0 },
            AggregateOp::Median => PartialAggregate::Median(Vec::new()),
        }
    }

    /// Folds one input value into a partial aggregate (the build-phase upsert, spec
    /// §4.6 "applying the aggregate's combine function").
    pub fn combine(self, state: &mut PartialAggregate, value: &FieldValue) {
        let v = value.as_f64().unwrap_or_default();
        match state {
            PartialAggregate::Sum(sum) => *sum += v,
            PartialAggregate::Count(count) => *count += 1,
            PartialAggregate::Min(min) => *min = min.min(v),
            PartialAggregate::Max(max) => *max = max.max(v),
            PartialAggregate::Avg { sum, count } => {
                *sum += v;
                *count += 1;
            }
            PartialAggregate::Median(samples) => samples.push(v),
        }
    }

    /// Merges two partial aggregates from different slices of the same window (spec
    /// §4.6 "merge partial aggregates across the window's constituent slices").
    /// Commutative and associative, as required by §5's ordering guarantees.
    pub fn merge(self, left: &PartialAggregate, right: &PartialAggregate) -> PartialAggregate {
        match (left, right) {
            (PartialAggregate::Sum(a), PartialAggregate::Sum(b)) => PartialAggregate::Sum(a + b),
            (PartialAggregate::Count(a), PartialAggregate::Count(b)) => PartialAggregate::Count(a + b),
            (PartialAggregate::Min(a), PartialAggregate::Min(b)) => PartialAggregate::Min(a.min(*b)),
            (PartialAggregate::Max(a), PartialAggregate::Max(b)) => PartialAggregate::Max(a.max(*b)),
            (
                PartialAggregate::Avg { sum: sa, count: ca },
                PartialAggregate::Avg { sum: sb, count: cb },
            ) => PartialAggregate::Avg {
                sum: sa + sb,
                count: ca + cb,
            },
            (PartialAggregate::Median(a), PartialAggregate::Median(b)) => {
                let mut merged = a.clone();
                merged.extend_from_slice(b);
                PartialAggregate::Median(merged)
            }
            _ => self.identity(),
        }
    }

    /// Produces the final emitted value for a completed window (spec §4.6 "emit
    /// (windowStart, windowEnd, key, finalAggregate...)").
    pub fn finalize(self, state: &PartialAggregate) -> f64 {
        match state {
            PartialAggregate::Sum(sum) => *sum,
            PartialAggregate::Count(count) => *count as f64,
            PartialAggregate::Min(min) => *min,
            PartialAggregate::Max(max) => *max,
            PartialAggregate::Avg { sum, count } => {
                if *count == 0 {
                    0.0
                } else {
                    sum / *count as f64
                }
            }
            PartialAggregate::Median(samples) => {
                let mut sorted = samples.clone();
                sorted.sort_by(|a, b| a.total_cmp(b));
                match sorted.len() {
                    0 => 0.0,
                    len if len % 2 == 1 => sorted[len / 2],
                    len => (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(AggregateOp::Sum, vec![5.0, 7.0, 2.0], 14.0)]
    #[case(AggregateOp::Count, vec![5.0, 7.0, 2.0], 3.0)]
    #[case(AggregateOp::Min, vec![5.0, 7.0, 2.0], 2.0)]
    #[case(AggregateOp::Max, vec![5.0, 7.0, 2.0], 7.0)]
    #[case(AggregateOp::Avg, vec![5.0, 7.0, 2.0], 14.0 / 3.0)]
    #[case(AggregateOp::Median, vec![5.0, 7.0, 2.0], 5.0)]
    fn combine_then_finalize_matches_expected(#[case] op: AggregateOp, #[case] inputs: Vec<f64>, #[case] expected: f64) {
        let mut state = op.identity();
        for input in inputs {
            op.combine(&mut state, &FieldValue::Float64(input));
        }
        assert!((op.finalize(&state) - expected).abs() < 1e-9);
    }

    #[test]
    fn merge_is_commutative_for_sum() {
        let op = AggregateOp::Sum;
        let mut a = op.identity();
        op.combine(&mut a, &FieldValue::UInt64(3));
        let mut b = op.identity();
        op.combine(&mut b, &FieldValue::UInt64(4));

        let merged_ab = op.merge(&a, &b);
        let merged_ba = op.merge(&b, &a);
        assert_eq!(op.finalize(&merged_ab), op.finalize(&merged_ba));
    }

    fn build(op: AggregateOp, values: &[i32]) -> PartialAggregate {
        let mut state = op.identity();
        for &v in values {
            op.combine(&mut state, &FieldValue::Int32(v));
        }
        state
    }

    proptest! {
        #[test]
        fn splitting_a_batch_and_merging_matches_combining_it_whole(values in proptest::collection::vec(-1000i32..1000, 0..30), split in 0usize..30) {
            let split = split.min(values.len());
            let (left, right) = values.split_at(split);

            for op in [AggregateOp::Sum, AggregateOp::Count, AggregateOp::Min, AggregateOp::Max, AggregateOp::Avg] {
                let whole = build(op, &values);
                let merged = op.merge(&build(op, left), &build(op, right));
                let expected = op.finalize(&whole);
                let actual = op.finalize(&merged);
                if expected.is_finite() {
                    prop_assert!((expected - actual).abs() < 1e-6, "{op:?}: {expected} vs {actual}");
                } else {
                    prop_assert_eq!(expected.is_infinite(), actual.is_infinite());
                }
            }
        }
    }
}
