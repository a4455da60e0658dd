//! Type-aware value equality across the two engines.

use chrono::Timelike;
use rust_decimal::prelude::ToPrimitive;

use crate::core::SqlValue;

/// Below this magnitude numbers are compared with an absolute epsilon.
const ABSOLUTE_BELOW: f64 = 0.01;

fn as_i64(v: &SqlValue) -> Option<i64> {
    match v {
        SqlValue::I16(n) => Some((*n).into()),
        SqlValue::I32(n) => Some((*n).into()),
        SqlValue::I64(n) => Some(*n),
        _ => None,
    }
}

fn as_f64(v: &SqlValue) -> Option<f64> {
    match v {
        SqlValue::F32(n) => Some((*n).into()),
        SqlValue::F64(n) => Some(*n),
        SqlValue::Decimal(d) => d.to_f64(),
        other => as_i64(other).map(|n| n as f64),
    }
}

fn numbers_close(a: f64, b: f64, epsilon: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    if scale < ABSOLUTE_BELOW {
        (a - b).abs() <= epsilon
    } else {
        (a - b).abs() / scale <= epsilon
    }
}

/// Compare a source value with its target counterpart.
///
/// Numbers match within `epsilon`, timestamps at whole-second precision,
/// fixed-width text ignoring trailing blanks, uuids ignoring case.
pub fn values_equal(source: &SqlValue, target: &SqlValue, epsilon: f64) -> bool {
    use SqlValue::*;

    match (source, target) {
        (Null(_), Null(_)) => true,
        (Null(_), _) | (_, Null(_)) => false,

        (Decimal(a), Decimal(b)) if a == b => true,
        (a, b) if as_i64(a).is_some() && as_i64(b).is_some() => as_i64(a) == as_i64(b),
        (a, b) if as_f64(a).is_some() && as_f64(b).is_some() => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => numbers_close(x, y, epsilon),
            _ => false,
        },

        (DateTime(a), DateTime(b)) => a.with_nanosecond(0) == b.with_nanosecond(0),
        (DateTimeOffset(a), DateTimeOffset(b)) => a.timestamp() == b.timestamp(),
        (Date(a), DateTime(b)) | (DateTime(b), Date(a)) => {
            b.date() == *a && b.time() == chrono::NaiveTime::default()
        }
        (Time(a), Time(b)) => a.with_nanosecond(0) == b.with_nanosecond(0),

        (Text(a), Text(b)) => a.trim_end_matches(' ') == b.trim_end_matches(' '),
        (Uuid(a), Uuid(b)) => a == b,
        (Uuid(u), Text(t)) | (Text(t), Uuid(u)) => t.trim().eq_ignore_ascii_case(&u.to_string()),

        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ValueKind;
    use chrono::{NaiveDate, TimeZone};
    use std::str::FromStr;

    fn dec(s: &str) -> SqlValue {
        SqlValue::Decimal(rust_decimal::Decimal::from_str(s).unwrap())
    }

    #[test]
    fn test_nulls() {
        assert!(values_equal(
            &SqlValue::Null(ValueKind::I32),
            &SqlValue::Null(ValueKind::I32),
            1e-4
        ));
        assert!(!values_equal(&SqlValue::Null(ValueKind::I32), &SqlValue::I32(0), 1e-4));
    }

    #[test]
    fn test_decimal_scale_and_epsilon() {
        assert!(values_equal(&dec("12.50"), &dec("12.5000"), 0.0));
        assert!(values_equal(&dec("1000.00"), &dec("1000.05"), 1e-4));
        assert!(!values_equal(&dec("1000.00"), &dec("1001.00"), 1e-4));
        // Tiny values use the absolute rule.
        assert!(values_equal(&dec("0.00001"), &dec("0.00002"), 1e-4));
    }

    #[test]
    fn test_integers_across_widths() {
        assert!(values_equal(&SqlValue::I16(7), &SqlValue::I64(7), 0.0));
        assert!(!values_equal(&SqlValue::I32(7), &SqlValue::I32(8), 0.5));
    }

    #[test]
    fn test_float_vs_decimal() {
        assert!(values_equal(&SqlValue::F64(0.1 + 0.2), &dec("0.3"), 1e-9));
    }

    #[test]
    fn test_timestamps_truncate_subsecond() {
        let a = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(10, 0, 0, 997)
            .unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(10, 0, 0, 123)
            .unwrap();
        assert!(values_equal(&SqlValue::DateTime(a), &SqlValue::DateTime(b), 0.0));
        let c = b + chrono::Duration::seconds(1);
        assert!(!values_equal(&SqlValue::DateTime(a), &SqlValue::DateTime(c), 0.0));
    }

    #[test]
    fn test_offsets_compare_as_instants() {
        let paris = chrono::FixedOffset::east_opt(3600).unwrap();
        let utc = chrono::FixedOffset::east_opt(0).unwrap();
        let a = paris.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let b = utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert!(values_equal(
            &SqlValue::DateTimeOffset(a),
            &SqlValue::DateTimeOffset(b),
            0.0
        ));
    }

    #[test]
    fn test_char_padding_and_uuid_case() {
        assert!(values_equal(&"AB   ".into(), &"AB".into(), 0.0));
        assert!(!values_equal(&"AB".into(), &"ab".into(), 0.0));
        let id = uuid::Uuid::from_str("a1b2c3d4-0000-4000-8000-00000000000f").unwrap();
        assert!(values_equal(
            &SqlValue::Uuid(id),
            &"A1B2C3D4-0000-4000-8000-00000000000F".into(),
            0.0
        ));
    }

    #[test]
    fn test_bytes_exact() {
        assert!(values_equal(&SqlValue::Bytes(vec![]), &SqlValue::Bytes(vec![]), 0.0));
        assert!(!values_equal(
            &SqlValue::Bytes(vec![1]),
            &SqlValue::Bytes(vec![1, 0]),
            0.0
        ));
    }
}
