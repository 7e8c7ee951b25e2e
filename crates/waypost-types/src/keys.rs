//! Station identity keys.
//!
//! Every station is addressed by a strongly-typed key so cell and WiFi
//! identities can never be mixed at compile time. Keys render to a
//! canonical string used as the storage and queue identity.
//!
//! | Key | Canonical form |
//! |-----|----------------|
//! | [`CellKey`] | `gsm:208:1:2:1234` |
//! | [`CellAreaKey`] | `gsm:208:1:2` |
//! | [`MacAddr`] | `a1b2c3d4e5f6` |

use core::fmt;
use core::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::enums::{Radio, StationKind};

/// Errors raised when parsing a canonical key string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    /// The key has the wrong number of `:`-separated fields.
    #[error("expected {expected} fields in key {input:?}")]
    FieldCount {
        /// Number of fields the key type requires.
        expected: usize,
        /// The rejected input.
        input: String,
    },

    /// A numeric field could not be parsed.
    #[error("invalid {field} in key {input:?}")]
    Field {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected input.
        input: String,
    },

    /// The radio type is unknown.
    #[error("unknown radio type: {0}")]
    Radio(String),

    /// The MAC address is not 12 hex digits.
    #[error("invalid MAC address: {0}")]
    Mac(String),
}

/// Implements string-form serde for a key type via `Display` / `FromStr`.
macro_rules! string_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Behaviour shared by the keys of every station kind.
///
/// The station pipeline and the storage layer are generic over this trait,
/// so cells and WiFi access points run the same control flow.
pub trait StationKey:
    Clone
    + Ord
    + fmt::Debug
    + fmt::Display
    + FromStr<Err = KeyParseError>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The station family this key addresses.
    const KIND: StationKind;

    /// The parent area whose aggregate depends on this station, if any.
    fn area(&self) -> Option<CellAreaKey>;
}

fn parse_field<T: FromStr>(value: &str, field: &'static str, input: &str) -> Result<T, KeyParseError> {
    value.parse().ok().ok_or_else(|| KeyParseError::Field {
        field,
        input: input.to_owned(),
    })
}

// =========================================================================
// Cells
// =========================================================================

/// Identity of a single cell tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    /// Radio technology.
    pub radio: Radio,
    /// Mobile country code.
    pub mcc: u16,
    /// Mobile network code.
    pub mnc: u16,
    /// Location area code (LAC or TAC).
    pub lac: u32,
    /// Cell identifier.
    pub cid: u32,
}

impl CellKey {
    /// The location area this cell belongs to.
    pub const fn area_key(&self) -> CellAreaKey {
        CellAreaKey {
            radio: self.radio,
            mcc: self.mcc,
            mnc: self.mnc,
            lac: self.lac,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.radio, self.mcc, self.mnc, self.lac, self.cid
        )
    }
}

impl FromStr for CellKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [radio, mcc, mnc, lac, cid] = fields.as_slice() else {
            return Err(KeyParseError::FieldCount {
                expected: 5,
                input: s.to_owned(),
            });
        };
        Ok(Self {
            radio: radio.parse()?,
            mcc: parse_field(mcc, "mcc", s)?,
            mnc: parse_field(mnc, "mnc", s)?,
            lac: parse_field(lac, "lac", s)?,
            cid: parse_field(cid, "cid", s)?,
        })
    }
}

string_serde!(CellKey);

impl StationKey for CellKey {
    const KIND: StationKind = StationKind::Cell;

    fn area(&self) -> Option<CellAreaKey> {
        Some(self.area_key())
    }
}

/// Identity of a cell location area (all cells sharing a LAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellAreaKey {
    /// Radio technology.
    pub radio: Radio,
    /// Mobile country code.
    pub mcc: u16,
    /// Mobile network code.
    pub mnc: u16,
    /// Location area code.
    pub lac: u32,
}

impl fmt::Display for CellAreaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.radio, self.mcc, self.mnc, self.lac)
    }
}

impl FromStr for CellAreaKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [radio, mcc, mnc, lac] = fields.as_slice() else {
            return Err(KeyParseError::FieldCount {
                expected: 4,
                input: s.to_owned(),
            });
        };
        Ok(Self {
            radio: radio.parse()?,
            mcc: parse_field(mcc, "mcc", s)?,
            mnc: parse_field(mnc, "mnc", s)?,
            lac: parse_field(lac, "lac", s)?,
        })
    }
}

string_serde!(CellAreaKey);

// =========================================================================
// WiFi
// =========================================================================

/// A 48-bit WiFi BSSID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Build an address from the low 48 bits of `value`.
    pub const fn from_u64(value: u64) -> Self {
        let [_, _, a, b, c, d, e, f] = value.to_be_bytes();
        Self([a, b, c, d, e, f])
    }

    /// The address as an integer, most significant octet first.
    pub const fn as_u64(self) -> u64 {
        let [a, b, c, d, e, f] = self.0;
        u64::from_be_bytes([0, 0, a, b, c, d, e, f])
    }

    /// Whether the group bit of the first octet is set.
    pub const fn is_multicast(self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Whether the locally-administered bit of the first octet is set.
    ///
    /// Virtual interfaces on one physical device usually differ from the
    /// burned-in address only in this bit.
    pub const fn is_locally_administered(self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// `ff:ff:ff:ff:ff:ff`.
    pub const fn is_broadcast(self) -> bool {
        self.as_u64() == 0xffff_ffff_ffff
    }

    /// `00:00:00:00:00:00`.
    pub const fn is_zero(self) -> bool {
        self.as_u64() == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.as_u64())
    }
}

impl FromStr for MacAddr {
    type Err = KeyParseError;

    /// Accepts `a1b2c3d4e5f6`, `a1:b2:c3:d4:e5:f6` and `a1-b2-c3-d4-e5-f6`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| !matches!(c, ':' | '-' | '.')).collect();
        if hex.len() != 12 {
            return Err(KeyParseError::Mac(s.to_owned()));
        }
        u64::from_str_radix(&hex, 16)
            .ok()
            .map(Self::from_u64)
            .ok_or_else(|| KeyParseError::Mac(s.to_owned()))
    }
}

string_serde!(MacAddr);

impl StationKey for MacAddr {
    const KIND: StationKind = StationKind::Wifi;

    fn area(&self) -> Option<CellAreaKey> {
        None
    }
}
