//! Kubernetes resource quantities ("100m", "1Gi", "2e3").
//!
//! `k8s_openapi` carries quantities as opaque strings, so anything that must
//! validate or compare them goes through [`parse_quantity`].

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024_f64),
    ("Mi", 1_048_576_f64),
    ("Gi", 1_073_741_824_f64),
    ("Ti", 1_099_511_627_776_f64),
    ("Pi", 1_125_899_906_842_624_f64),
    ("Ei", 1_152_921_504_606_846_976_f64),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parses a quantity string into its numeric value in base units.
///
/// Returns `None` for anything the API server would reject.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let number_end = raw
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(number_end);

    let value = parse_number(number)?;
    let multiplier = parse_suffix(suffix)?;
    Some(value * multiplier)
}

/// Wraps `raw` as a [`Quantity`] if it parses.
pub fn to_quantity(raw: &str) -> Option<Quantity> {
    parse_quantity(raw).map(|_| Quantity(raw.trim().to_string()))
}

/// Two quantity strings denote the same amount.
pub fn same_amount(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
        _ => false,
    }
}

fn parse_number(number: &str) -> Option<f64> {
    let digits = number.trim_start_matches(['+', '-']);
    if digits.is_empty() || digits == "." || digits.matches('.').count() > 1 {
        return None;
    }
    number.parse().ok()
}

fn parse_suffix(suffix: &str) -> Option<f64> {
    if suffix.is_empty() {
        return Some(1.0);
    }
    if let Some((_, m)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(*m);
    }
    if let Some((_, m)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(*m);
    }
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    let digits = exponent.trim_start_matches(['+', '-']);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    exponent.parse::<i32>().ok().map(|e| 10_f64.powi(e))
}
