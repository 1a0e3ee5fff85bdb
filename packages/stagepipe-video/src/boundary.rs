//! Boundary resolution for out-of-range sequence indices
//!
//! Maps an index outside `[start, end)` onto an in-range index, the constant
//! sentinel `-1`, or an error, depending on the pad mode.

use crate::error::BoundaryError;
use serde::{Deserialize, Serialize};

/// Returned for indices that should be filled with a constant frame
pub const CONSTANT_SENTINEL: i64 = -1;

/// Pad mode for out-of-range indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BoundaryType {
    /// Clamp to the nearest edge
    #[serde(rename = "clamp")]
    Clamp,
    /// Fill with a caller-provided constant value
    #[serde(rename = "constant")]
    Constant,
    /// Mirror, repeating the edge sample: `cba|abcd|dcb`
    #[serde(rename = "reflect_1001")]
    Reflect1001,
    /// Mirror without repeating the edge sample: `dcb|abcd|cba`
    #[serde(rename = "reflect_101")]
    Reflect101,
    /// Out-of-range access is an error
    #[default]
    #[serde(rename = "isolated", alias = "none")]
    Isolated,
}

impl BoundaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clamp => "clamp",
            Self::Constant => "constant",
            Self::Reflect1001 => "reflect_1001",
            Self::Reflect101 => "reflect_101",
            Self::Isolated => "isolated",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, BoundaryError> {
        match s.to_lowercase().as_str() {
            "clamp" | "edge" => Ok(Self::Clamp),
            "constant" => Ok(Self::Constant),
            "reflect_1001" | "symmetric" => Ok(Self::Reflect1001),
            "reflect_101" | "reflect" => Ok(Self::Reflect101),
            "isolated" | "none" => Ok(Self::Isolated),
            other => Err(BoundaryError::UnknownType(other.to_string())),
        }
    }
}

impl std::fmt::Display for BoundaryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mirror `idx` into `[lo, hi)` without repeating the edge sample.
///
/// A single-element range always resolves to its only element.
pub fn idx_reflect_101(idx: i64, lo: i64, hi: i64) -> i64 {
    let n = hi - lo;
    if n < 2 {
        return hi - 1;
    }
    let period = 2 * (n - 1);
    let mut x = (idx - lo).rem_euclid(period);
    if x >= n {
        x = period - x;
    }
    lo + x
}

/// Mirror `idx` into `[lo, hi)`, repeating the edge sample.
pub fn idx_reflect_1001(idx: i64, lo: i64, hi: i64) -> i64 {
    let n = hi - lo;
    if n < 1 {
        return hi - 1;
    }
    let period = 2 * n;
    let mut x = (idx - lo).rem_euclid(period);
    if x >= n {
        x = period - 1 - x;
    }
    lo + x
}

/// Resolve `index` against `[start, end)` under `boundary`.
///
/// In-range indices are returned unchanged. `Constant` yields
/// [`CONSTANT_SENTINEL`]; `Isolated` rejects the index.
pub fn resolve(boundary: BoundaryType, index: i64, start: i64, end: i64) -> Result<i64, BoundaryError> {
    if end <= start {
        return Err(BoundaryError::EmptyRange { start, end });
    }
    if index >= start && index < end {
        return Ok(index);
    }
    match boundary {
        BoundaryType::Clamp => Ok(index.clamp(start, end - 1)),
        BoundaryType::Constant => Ok(CONSTANT_SENTINEL),
        BoundaryType::Reflect1001 => Ok(idx_reflect_1001(index, start, end)),
        BoundaryType::Reflect101 => Ok(idx_reflect_101(index, start, end)),
        BoundaryType::Isolated => Err(BoundaryError::OutOfBounds {
            index,
            start,
            end,
            len: end - start,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_is_unchanged() {
        for b in [
            BoundaryType::Clamp,
            BoundaryType::Constant,
            BoundaryType::Reflect1001,
            BoundaryType::Reflect101,
            BoundaryType::Isolated,
        ] {
            assert_eq!(resolve(b, 3, 0, 5).unwrap(), 3);
        }
    }

    #[test]
    fn test_clamp() {
        assert_eq!(resolve(BoundaryType::Clamp, -4, 0, 5).unwrap(), 0);
        assert_eq!(resolve(BoundaryType::Clamp, 9, 0, 5).unwrap(), 4);
        assert_eq!(resolve(BoundaryType::Clamp, 1, 2, 5).unwrap(), 2);
    }

    #[test]
    fn test_constant_sentinel() {
        assert_eq!(resolve(BoundaryType::Constant, -1, 0, 5).unwrap(), -1);
        assert_eq!(resolve(BoundaryType::Constant, 5, 0, 5).unwrap(), -1);
    }

    #[test]
    fn test_reflect_101() {
        // dcb|abcd|cba over [0, 4)
        let got: Vec<i64> = (-3..7)
            .map(|i| resolve(BoundaryType::Reflect101, i, 0, 4).unwrap())
            .collect();
        assert_eq!(got, vec![3, 2, 1, 0, 1, 2, 3, 2, 1, 0]);
    }

    #[test]
    fn test_reflect_1001() {
        // cba|abcd|dcb over [0, 4)
        let got: Vec<i64> = (-3..7)
            .map(|i| resolve(BoundaryType::Reflect1001, i, 0, 4).unwrap())
            .collect();
        assert_eq!(got, vec![2, 1, 0, 0, 1, 2, 3, 3, 2, 1]);
    }

    #[test]
    fn test_reflect_single_element() {
        assert_eq!(resolve(BoundaryType::Reflect101, 7, 0, 1).unwrap(), 0);
        assert_eq!(resolve(BoundaryType::Reflect1001, -7, 0, 1).unwrap(), 0);
    }

    #[test]
    fn test_reflect_offset_range() {
        assert_eq!(resolve(BoundaryType::Reflect101, 1, 2, 6).unwrap(), 3);
        assert_eq!(resolve(BoundaryType::Reflect1001, 1, 2, 6).unwrap(), 2);
    }

    #[test]
    fn test_isolated_rejects() {
        let err = resolve(BoundaryType::Isolated, 10, 0, 10).unwrap_err();
        assert_eq!(
            err,
            BoundaryError::OutOfBounds {
                index: 10,
                start: 0,
                end: 10,
                len: 10
            }
        );
    }

    #[test]
    fn test_empty_range() {
        assert!(resolve(BoundaryType::Clamp, 0, 3, 3).is_err());
    }

    #[test]
    fn test_boundary_type_roundtrip() {
        for b in [
            BoundaryType::Clamp,
            BoundaryType::Constant,
            BoundaryType::Reflect1001,
            BoundaryType::Reflect101,
            BoundaryType::Isolated,
        ] {
            assert_eq!(BoundaryType::from_str(b.as_str()).unwrap(), b);
        }
        assert_eq!(BoundaryType::from_str("none").unwrap(), BoundaryType::Isolated);
        assert!(BoundaryType::from_str("wrap").is_err());
    }
}
