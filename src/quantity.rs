//! Kubernetes resource quantity parsing: binary suffixes (Ki, Mi, Gi, Ti,
//! Pi, Ei), decimal suffixes (k, M, G, T, P, E), bare integers, and
//! exponential notation (`1e2`). Modeled after the `QuantityParser` trait
//! pattern used for CPU/memory quantities elsewhere in the storage-operator
//! ecosystem, generalized to the full suffix table §4.C requires.

use crate::error::DiskError;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: &[(&str, u128)] = &[
    ("Ki", 1024),
    ("Mi", 1024u128.pow(2)),
    ("Gi", 1024u128.pow(3)),
    ("Ti", 1024u128.pow(4)),
    ("Pi", 1024u128.pow(5)),
    ("Ei", 1024u128.pow(6)),
];

const DECIMAL_SUFFIXES: &[(&str, u128)] = &[
    ("k", 1000),
    ("M", 1000u128.pow(2)),
    ("G", 1000u128.pow(3)),
    ("T", 1000u128.pow(4)),
    ("P", 1000u128.pow(5)),
    ("E", 1000u128.pow(6)),
];

/// Parses a Kubernetes `Quantity` string into a byte count. Accepts
/// `Ki/Mi/Gi/Ti/Pi/Ei`, `k/M/G/T/P/E`, bare integers, and exponential
/// notation (`1e2`). Returns `i128` because exbibyte-scale quantities
/// (`55Ei`) overflow `i64`.
pub fn parse_quantity_bytes(q: &Quantity) -> Result<i128, DiskError> {
    parse_quantity_str(&q.0)
}

pub fn parse_quantity_str(raw: &str) -> Result<i128, DiskError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid(raw));
    }

    for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(amount_str) = raw.strip_suffix(suffix) {
            let amount: i128 = amount_str.parse().map_err(|_| invalid(raw))?;
            return amount
                .checked_mul(*multiplier as i128)
                .ok_or_else(|| invalid(raw));
        }
    }

    // Exponential or bare decimal/integer notation, e.g. "1e2", "100".
    if let Ok(i) = raw.parse::<i128>() {
        return Ok(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() && f >= 0.0 {
            return Ok(f.round() as i128);
        }
    }

    Err(invalid(raw))
}

fn invalid(raw: &str) -> DiskError {
    DiskError::Validation(format!("invalid resource quantity: {raw:?}"))
}
