//! Video quality codes used by the remote service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Quality ladder of the remote service, identified by its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Quality {
    P360,
    P480,
    P720,
    P1080,
    P1080Plus,
    P1080Fps60,
    P4K,
}

impl Quality {
    /// Numeric code used on the wire.
    pub fn code(self) -> u32 {
        match self {
            Quality::P360 => 16,
            Quality::P480 => 32,
            Quality::P720 => 64,
            Quality::P1080 => 80,
            Quality::P1080Plus => 112,
            Quality::P1080Fps60 => 116,
            Quality::P4K => 120,
        }
    }

    /// Map a wire code back to a known quality, if recognized.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            16 => Some(Quality::P360),
            32 => Some(Quality::P480),
            64 => Some(Quality::P720),
            80 => Some(Quality::P1080),
            112 => Some(Quality::P1080Plus),
            116 => Some(Quality::P1080Fps60),
            120 => Some(Quality::P4K),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P1080Plus => "1080p+",
            Quality::P1080Fps60 => "1080p60",
            Quality::P4K => "4k",
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::P480
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u32> for Quality {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Quality::from_code(code).ok_or_else(|| format!("unknown quality code {code}"))
    }
}

impl From<Quality> for u32 {
    fn from(q: Quality) -> u32 {
        q.code()
    }
}

/// Pick the best available quality code not exceeding `requested`.
///
/// Falls back to the lowest available code when nothing fits; callers log
/// the downgrade. Returns `None` only when `available` is empty.
pub fn select_quality(available: &[u32], requested: Quality) -> Option<SelectedQuality> {
    let best_fit = available
        .iter()
        .copied()
        .filter(|&code| code <= requested.code())
        .max();
    if let Some(code) = best_fit {
        return Some(SelectedQuality {
            code,
            downgraded: false,
        });
    }
    available.iter().copied().min().map(|code| SelectedQuality {
        code,
        downgraded: true,
    })
}

/// Outcome of quality selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedQuality {
    /// Chosen wire code.
    pub code: u32,
    /// True when no stream at or below the requested quality existed.
    pub downgraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for q in [
            Quality::P360,
            Quality::P480,
            Quality::P720,
            Quality::P1080,
            Quality::P4K,
        ] {
            assert_eq!(Quality::from_code(q.code()), Some(q));
        }
        assert_eq!(Quality::from_code(999), None);
    }

    #[test]
    fn test_select_best_at_or_below_requested() {
        let selected = select_quality(&[16, 32, 64, 80], Quality::P720).unwrap();
        assert_eq!(selected.code, 64);
        assert!(!selected.downgraded);
    }

    #[test]
    fn test_select_exact_match() {
        let selected = select_quality(&[16, 32], Quality::P480).unwrap();
        assert_eq!(selected.code, 32);
        assert!(!selected.downgraded);
    }

    #[test]
    fn test_select_falls_back_to_lowest() {
        let selected = select_quality(&[80, 116], Quality::P360).unwrap();
        assert_eq!(selected.code, 80);
        assert!(selected.downgraded);
    }

    #[test]
    fn test_select_empty() {
        assert_eq!(select_quality(&[], Quality::P480), None);
    }
}
