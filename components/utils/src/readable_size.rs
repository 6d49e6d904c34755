// Copyright (c) 2017-present, PingCAP, Inc. Licensed under Apache-2.0.

//! Human readable byte sizes, used for heap and segment sizes in config
//! files, CLI flags and status output.

use std::{
    fmt::{self, Debug, Display},
    ops::{Div, Mul},
    str::FromStr,
};

use serde::{
    de::{self, Unexpected, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

pub const B: u64 = 1;
pub const KIB: u64 = B << 10;
pub const MIB: u64 = KIB << 10;
pub const GIB: u64 = MIB << 10;
pub const TIB: u64 = GIB << 10;

const UNITS: [(u64, &str); 4] = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];

#[derive(Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default, Hash)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize { ReadableSize(count * KIB) }

    pub const fn mb(count: u64) -> ReadableSize { ReadableSize(count * MIB) }

    pub const fn gb(count: u64) -> ReadableSize { ReadableSize(count * GIB) }

    pub const fn as_bytes(self) -> u64 { self.0 }

    pub const fn as_bytes_usize(self) -> usize { self.0 as usize }
}

impl Div<u64> for ReadableSize {
    type Output = ReadableSize;

    fn div(self, rhs: u64) -> ReadableSize { ReadableSize(self.0 / rhs) }
}

impl Mul<u64> for ReadableSize {
    type Output = ReadableSize;

    fn mul(self, rhs: u64) -> ReadableSize { ReadableSize(self.0 * rhs) }
}

impl Serialize for ReadableSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let size = self.0;
        for (unit, suffix) in UNITS {
            if size != 0 && size % unit == 0 {
                return serializer.serialize_str(&format!("{}{}", size / unit, suffix));
            }
        }
        serializer.serialize_u64(size)
    }
}

impl FromStr for ReadableSize {
    type Err = String;

    // Units are binary: "1K" and "1KiB" are both 1024 bytes.
    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() || !size_str.is_ascii() {
            return Err(format!("{:?} is not a valid size", s));
        }

        let split = size_str
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(size_str.len());
        let (size, unit) = size_str.split_at(split);

        let unit = match unit.trim() {
            "K" | "KB" | "KiB" => KIB,
            "M" | "MB" | "MiB" => MIB,
            "G" | "GB" | "GiB" => GIB,
            "T" | "TB" | "TiB" => TIB,
            "B" | "" => B,
            _ => {
                return Err(format!(
                    "only B, KB, KiB, MB, MiB, GB, GiB, TB and TiB are supported: {:?}",
                    s
                ));
            }
        };

        match size.parse::<f64>() {
            Ok(n) => Ok(ReadableSize((n * unit as f64) as u64)),
            Err(_) => Err(format!("invalid size string: {:?}", s)),
        }
    }
}

impl Debug for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self) }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, suffix) in UNITS {
            if self.0 >= unit {
                return write!(f, "{:.1}{}", self.0 as f64 / unit as f64, suffix);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D>(deserializer: D) -> Result<ReadableSize, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SizeVisitor;

        impl<'de> Visitor<'de> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("valid size")
            }

            fn visit_i64<E>(self, size: i64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                if size >= 0 {
                    self.visit_u64(size as u64)
                } else {
                    Err(E::invalid_value(Unexpected::Signed(size), &self))
                }
            }

            fn visit_u64<E>(self, size: u64) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                Ok(ReadableSize(size))
            }

            fn visit_str<E>(self, size_str: &str) -> Result<ReadableSize, E>
            where
                E: de::Error,
            {
                size_str.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("256".parse::<ReadableSize>().unwrap(), ReadableSize(256));
        assert_eq!("4KiB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(4));
        assert_eq!(" 8M ".parse::<ReadableSize>().unwrap(), ReadableSize::mb(8));
        assert_eq!("1.5G".parse::<ReadableSize>().unwrap(), ReadableSize(3 * GIB / 2));
        assert!("12 parsecs".parse::<ReadableSize>().is_err());
        assert!("".parse::<ReadableSize>().is_err());

        assert_eq!(ReadableSize(100).to_string(), "100B");
        assert_eq!(ReadableSize::kb(2).to_string(), "2.0KiB");
        assert_eq!(ReadableSize(3 * MIB / 2).to_string(), "1.5MiB");
    }

    #[test]
    fn serde_roundtrip() {
        let json = serde_json::to_string(&ReadableSize::mb(64)).unwrap();
        assert_eq!(json, "\"64MiB\"");
        let back: ReadableSize = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReadableSize::mb(64));
        let raw: ReadableSize = serde_json::from_str("1000").unwrap();
        assert_eq!(raw, ReadableSize(1000));
    }
}
