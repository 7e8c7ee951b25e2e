//! Enumeration types shared across the Waypost workspace.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::keys::KeyParseError;

// ---------------------------------------------------------------------------
// Radio technology
// ---------------------------------------------------------------------------

/// Radio technology of a cell tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Radio {
    /// 2G GSM.
    Gsm,
    /// 2G/3G CDMA.
    Cdma,
    /// 3G UMTS / WCDMA.
    Umts,
    /// 4G LTE.
    Lte,
}

impl Radio {
    /// Lowercase name used in canonical keys and storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gsm => "gsm",
            Self::Cdma => "cdma",
            Self::Umts => "umts",
            Self::Lte => "lte",
        }
    }
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Radio {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gsm" => Ok(Self::Gsm),
            "cdma" => Ok(Self::Cdma),
            "umts" | "wcdma" => Ok(Self::Umts),
            "lte" => Ok(Self::Lte),
            other => Err(KeyParseError::Radio(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Station kinds
// ---------------------------------------------------------------------------

/// The family a station belongs to.
///
/// Cells and WiFi access points share the same aggregate record shape and
/// the same update pipeline; the kind selects the storage partition, the
/// work queue and the kind-specific thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationKind {
    /// A cell tower.
    Cell,
    /// A WiFi access point.
    Wifi,
}

impl StationKind {
    /// Lowercase name used in storage rows and queue names.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cell => "cell",
            Self::Wifi => "wifi",
        }
    }
}

impl fmt::Display for StationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Position provenance
// ---------------------------------------------------------------------------

/// Which positioning source produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Aggregated from individual cell towers.
    Cell,
    /// Taken from a cell location area.
    CellArea,
    /// Aggregated from WiFi access points.
    Wifi,
}

/// Tag marking a result as a coarse fallback rather than a precise fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fallback {
    /// Location area code fallback.
    #[serde(rename = "lacf")]
    Lacf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_roundtrips_through_str() {
        for radio in [Radio::Gsm, Radio::Cdma, Radio::Umts, Radio::Lte] {
            assert_eq!(radio.as_str().parse::<Radio>(), Ok(radio));
        }
        assert_eq!("wcdma".parse::<Radio>(), Ok(Radio::Umts));
        assert!("nr".parse::<Radio>().is_err());
    }

    #[test]
    fn fallback_serializes_as_lacf() {
        let json = serde_json::to_string(&Fallback::Lacf).unwrap_or_default();
        assert_eq!(json, "\"lacf\"");
    }
}
