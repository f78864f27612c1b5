//! Kubernetes resource quantity parsing.
//!
//! `k8s_openapi`'s `Quantity` is an unchecked string wrapper, so sizes are
//! validated here before they reach the API server.

/// Binary suffixes, powers of 1024.
const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

/// Decimal suffixes, powers of 10.
const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantity {0:?} has no numeric part")]
    MissingNumber(String),

    #[error("quantity {quantity:?} has unknown suffix {suffix:?}")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} must not be negative")]
    Negative(String),
}

/// Parse a Kubernetes quantity (`10Gi`, `500m`, `1e3`) into its value.
///
/// The value is returned in base units (bytes for storage); fractional
/// results are kept so `500m` parses to `0.5`.
pub fn parse_quantity(input: &str) -> Result<f64, QuantityError> {
    let quantity = input.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::MissingNumber(quantity.to_string()))?;
    if value < 0.0 {
        return Err(QuantityError::Negative(quantity.to_string()));
    }

    let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
        quantity: quantity.to_string(),
        suffix: suffix.to_string(),
    })?;

    Ok(value * multiplier)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    if suffix.is_empty() {
        return Some(1.0);
    }
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(1024f64.powi(*power as i32));
    }
    if let Some((_, exponent)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some(10f64.powi(*exponent));
    }

    // Decimal exponent form: 1e3, 2E-2.
    let exponent = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    if exponent.is_empty() {
        return None;
    }
    exponent.parse::<i32>().ok().map(|e| 10f64.powi(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_suffix() {
        assert_eq!(parse_quantity("10Gi").unwrap(), 10.0 * 1024f64.powi(3));
        assert_eq!(parse_quantity("512Mi").unwrap(), 512.0 * 1024f64.powi(2));
    }

    #[test]
    fn test_decimal_suffix_and_milli() {
        assert_eq!(parse_quantity("1G").unwrap(), 1e9);
        assert_eq!(parse_quantity("500m").unwrap(), 0.5);
    }

    #[test]
    fn test_exponent_form() {
        assert_eq!(parse_quantity("1e3").unwrap(), 1000.0);
        assert_eq!(parse_quantity("1E3").unwrap(), 1000.0);
    }

    #[test]
    fn test_plain_number() {
        assert_eq!(parse_quantity("1024").unwrap(), 1024.0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            parse_quantity("ten"),
            Err(QuantityError::MissingNumber(_))
        ));
        assert!(matches!(
            parse_quantity("10Gb"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert_eq!(parse_quantity("  "), Err(QuantityError::Empty));
        assert!(matches!(
            parse_quantity("-1Gi"),
            Err(QuantityError::Negative(_))
        ));
    }
}
