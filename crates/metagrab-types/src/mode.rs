use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ScrapeError;

/// Extraction depth requested for a URL.
///
/// Each mode has its own queue and its own queue-length signal; the mode
/// also selects which DOM script the extractor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Canonical OG fields (title, description, image) plus the page URL.
    #[default]
    Simple,
    /// All meta tags (bounded), og/twitter submaps, image/video inventories.
    Full,
    /// `Full` plus article text and JSON-LD payloads.
    Super,
}

impl Mode {
    /// All modes, in queue-polling order.
    pub const ALL: [Mode; 3] = [Mode::Simple, Mode::Full, Mode::Super];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Simple => "simple",
            Mode::Full => "full",
            Mode::Super => "super",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Mode::Simple),
            "full" => Ok(Mode::Full),
            "super" => Ok(Mode::Super),
            other => Err(ScrapeError::InvalidInput(format!(
                "unknown mode {other:?} (expected simple, full or super)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Super).unwrap(), "\"super\"");
        let parsed: Mode = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(parsed, Mode::Full);
    }
}
