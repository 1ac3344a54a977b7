//! Predicate evaluation.
//!
//! Comparison is exact: both sides are rescaled to the larger decimal count
//! and compared as integers, which is equivalent to comparing the rationals
//! `value * 10^-decimals`. No floats anywhere near an outcome.

use crate::models::{MetricValue, Outcome, Predicate, PredicateOp};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use std::cmp::Ordering;

pub fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u8).pow(exp)
}

/// Rescale a fixed-point integer from `from` decimals to `to` decimals.
/// `to` must be >= `from`; scaling up is always exact.
fn rescale(value: &BigInt, from: u8, to: u8) -> BigInt {
    debug_assert!(to >= from);
    value * pow10(u32::from(to - from))
}

/// Compare two fixed-point rationals exactly.
pub fn cmp_decimal(a: &BigInt, a_decimals: u8, b: &BigInt, b_decimals: u8) -> Ordering {
    let scale = a_decimals.max(b_decimals);
    rescale(a, a_decimals, scale).cmp(&rescale(b, b_decimals, scale))
}

/// Integer division rounded half-to-even (banker's rounding). `den` must be
/// positive; the numerator may be negative.
pub fn div_round_half_even(num: &BigInt, den: &BigInt) -> BigInt {
    assert!(den.is_positive(), "denominator must be positive");

    let quotient = num / den;
    let remainder = num % den;
    if remainder.is_zero() {
        return quotient;
    }

    let twice = remainder.abs() * 2i32;
    let round_away = match twice.cmp(den) {
        Ordering::Greater => true,
        Ordering::Less => false,
        // Exactly halfway: round toward the even quotient.
        Ordering::Equal => (&quotient % 2) != BigInt::zero(),
    };

    if round_away {
        if num.is_negative() {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

/// Pure evaluation: `(MetricValue, Predicate) -> Outcome`.
pub fn evaluate(value: &MetricValue, pred: &Predicate) -> Outcome {
    let ord = cmp_decimal(
        &value.value,
        value.decimals,
        &pred.threshold,
        pred.value_decimals,
    );

    let yes = match pred.op {
        PredicateOp::Gt => ord == Ordering::Greater,
        PredicateOp::Gte => ord != Ordering::Less,
        PredicateOp::Lt => ord == Ordering::Less,
        PredicateOp::Lte => ord != Ordering::Greater,
        PredicateOp::Eq => ord == Ordering::Equal,
        PredicateOp::Neq => ord != Ordering::Equal,
    };
    Outcome::from_bool(yes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(value: i64, decimals: u8) -> MetricValue {
        MetricValue {
            value: BigInt::from(value),
            decimals,
            observed_at: 1_700_000_000,
            source_id: "TEST".to_string(),
        }
    }

    fn pred(op: PredicateOp, threshold: i64, decimals: u8) -> Predicate {
        Predicate {
            op,
            threshold: BigInt::from(threshold),
            value_decimals: decimals,
        }
    }

    #[test]
    fn operators_map_directly() {
        let v = metric(51_234_0000_0000, 8); // 51234.0 at 8 decimals

        assert_eq!(evaluate(&v, &pred(PredicateOp::Gt, 50_000_0000_0000, 8)), Outcome::Yes);
        assert_eq!(evaluate(&v, &pred(PredicateOp::Lt, 50_000_0000_0000, 8)), Outcome::No);
        assert_eq!(evaluate(&v, &pred(PredicateOp::Gte, 51_234_0000_0000, 8)), Outcome::Yes);
        assert_eq!(evaluate(&v, &pred(PredicateOp::Lte, 51_234_0000_0000, 8)), Outcome::Yes);
        assert_eq!(evaluate(&v, &pred(PredicateOp::Eq, 51_234_0000_0000, 8)), Outcome::Yes);
        assert_eq!(evaluate(&v, &pred(PredicateOp::Neq, 51_234_0000_0000, 8)), Outcome::No);
    }

    #[test]
    fn comparison_is_scale_invariant() {
        // 1.5 at 1 decimal vs 1.50 at 2 decimals: equal as rationals.
        assert_eq!(cmp_decimal(&BigInt::from(15), 1, &BigInt::from(150), 2), Ordering::Equal);
        // 1.5 vs 1.49
        assert_eq!(
            cmp_decimal(&BigInt::from(15), 1, &BigInt::from(149), 2),
            Ordering::Greater
        );
        // Value at 6 decimals vs threshold at 18: same rational.
        let v = BigInt::from(2_500_000i64); // 2.5 at 6
        let t = BigInt::from(2_500_000_000_000_000_000i64); // 2.5 at 18
        assert_eq!(cmp_decimal(&v, 6, &t, 18), Ordering::Equal);
    }

    #[test]
    fn evaluation_honors_mixed_decimals() {
        // 2.5 at 6 decimals vs threshold 2.4999 at 4 decimals.
        let v = metric(2_500_000, 6);
        let p = pred(PredicateOp::Gt, 24_999, 4);
        assert_eq!(evaluate(&v, &p), Outcome::Yes);
    }

    #[test]
    fn half_even_division() {
        let div = |n: i64, d: i64| div_round_half_even(&BigInt::from(n), &BigInt::from(d));

        assert_eq!(div(10, 4), BigInt::from(2)); // 2.5 -> 2 (even)
        assert_eq!(div(14, 4), BigInt::from(4)); // 3.5 -> 4 (even)
        assert_eq!(div(11, 4), BigInt::from(3)); // 2.75 -> 3
        assert_eq!(div(9, 4), BigInt::from(2)); // 2.25 -> 2
        assert_eq!(div(8, 4), BigInt::from(2)); // exact
        assert_eq!(div(-10, 4), BigInt::from(-2)); // -2.5 -> -2 (even)
        assert_eq!(div(-14, 4), BigInt::from(-4)); // -3.5 -> -4 (even)
        assert_eq!(div(-11, 4), BigInt::from(-3)); // -2.75 -> -3
    }
}
