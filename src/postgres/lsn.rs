use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use crate::Error;

/// A log sequence number: a byte position in the server's write-ahead log.
///
/// LSNs are totally ordered and only ever move forward as observed by a
/// client over the life of a stream. Adding a byte count to an LSN yields
/// the LSN just past those bytes, which is how the confirmed position is
/// advanced after a WAL-data frame is processed.
///
/// PostgreSQL renders LSNs as two hex halves separated by a slash, e.g.
/// `16/B374D848`; [`Lsn::parse`] and [`fmt::Display`] use that form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero position, meaning "start wherever the slot is".
    pub const ZERO: Lsn = Lsn(0);

    /// Parse the `X/X` textual form used by the server.
    pub fn parse(s: &str) -> Result<Lsn, Error> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| Error::InvalidLsn(s.into()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| Error::InvalidLsn(s.into()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| Error::InvalidLsn(s.into()))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(Error::InvalidLsn(s.into()));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Lsn::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::Lsn;

    #[test]
    fn parse_roundtrip() {
        let s = "16/B374D848";
        let lsn = Lsn::parse(s).unwrap();
        assert_eq!(lsn.to_string(), s);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Lsn::parse("").is_err());
        assert!(Lsn::parse("16").is_err());
        assert!(Lsn::parse("zz/10").is_err());
        assert!(Lsn::parse("1/FFFFFFFF0").is_err());
    }

    #[test]
    fn byte_arithmetic() {
        let lsn = Lsn(0xFFFF_FFF0);
        assert_eq!(lsn + 0x20, Lsn(0x1_0000_0010));
        assert_eq!((lsn + 0x20).to_string(), "1/10");
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(Lsn::parse("0/FFFFFFFF").unwrap() < Lsn::parse("1/0").unwrap());
    }

    #[test]
    fn serde_uses_textual_form() {
        let lsn = Lsn::parse("A/BCDEF012").unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"A/BCDEF012\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
