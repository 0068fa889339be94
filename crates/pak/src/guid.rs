use std::{
    fmt::{self, Debug, Display, LowerHex, UpperHex},
    num::ParseIntError,
    str::FromStr,
};

use serde::{
    de::{Error, Unexpected},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// 64-bit content identifier of an asset.
///
/// Usually derived from the asset's logical path with [`Guid::from_path`].
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Guid(pub u64);

impl Guid {
    pub const fn new(value: u64) -> Self {
        Guid(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Stores GUID into `buf` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if GUID does not fit into `buf` at `offset`.
    pub fn encode_at(&self, buf: &mut [u8], offset: usize) {
        buf[offset..][..8].copy_from_slice(&self.0.to_le_bytes());
    }

    /// Hashes asset path into GUID the same way the runtime does.
    ///
    /// Path is processed 4 bytes at a time.
    /// `\` is treated as `/` and ASCII letters are case-folded,
    /// so `Texture\Foo.rpak` and `texture/foo.rpak` share a GUID.
    pub fn from_path(path: &str) -> Guid {
        const MUL_WORD: u64 = 0xFB8C4D96501;
        const MUL_HASH: u64 = 0x633D5F1;
        const MUL_LEN: u64 = 0xAE502812AA7333;

        let bytes = path.as_bytes();
        let word = |index: usize| {
            let mut buf = [0u8; 4];
            if let Some(rest) = bytes.get(index * 4..) {
                let n = rest.len().min(4);
                buf[..n].copy_from_slice(&rest[..n]);
            }
            u32::from_le_bytes(buf)
        };

        let mut hash = 0u64;
        let mut consumed = 0u32;
        let mut index = 0;

        let mut raw = word(0);
        let mut folded = fold_word(raw);
        let mut nul = zero_bytes(raw);

        while nul == 0 {
            let mixed = (MUL_WORD.wrapping_mul(u64::from(folded)) >> 24)
                .wrapping_add(MUL_HASH.wrapping_mul(hash));
            hash = (mixed >> 61) ^ mixed;

            index += 1;
            consumed = consumed.wrapping_add(4);

            raw = word(index);
            folded = fold_word(raw);
            nul = zero_bytes(raw);
        }

        // Bits of the bytes preceding the terminator in the last word.
        let tail_mask = (nul & nul.wrapping_neg()).wrapping_sub(1);
        let tail_bits = match tail_mask {
            0 => -1,
            mask => 31 - mask.leading_zeros() as i32,
        };
        let len = consumed.wrapping_add((tail_bits / 8) as u32);

        let tail = MUL_WORD.wrapping_mul(u64::from(folded & tail_mask)) >> 24;

        Guid(
            MUL_HASH
                .wrapping_mul(hash)
                .wrapping_add(tail)
                .wrapping_sub(MUL_LEN.wrapping_mul(u64::from(len))),
        )
    }
}

/// Replaces `\` bytes with `/` and clears the ASCII case bit.
fn fold_word(word: u32) -> u32 {
    let x = word ^ 0x5C5C_5C5C;
    let backslashes = (!x >> 7) & (x.wrapping_sub(0x0101_0101) >> 7) & 0x0101_0101;
    word.wrapping_sub(backslashes.wrapping_mul(45)) & 0xDFDF_DFDF
}

/// High bit set for zero bytes. The lowest set bit marks the first zero byte.
fn zero_bytes(word: u32) -> u32 {
    !word & word.wrapping_sub(0x0101_0101) & 0x8080_8080
}

impl From<u64> for Guid {
    fn from(value: u64) -> Self {
        Guid(value)
    }
}

impl FromStr for Guid {
    type Err = ParseIntError;

    fn from_str(mut s: &str) -> Result<Self, ParseIntError> {
        if s.starts_with("0x") || s.starts_with("0X") {
            s = &s[2..];
        }
        u64::from_str_radix(s, 16).map(Guid)
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl LowerHex for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

impl Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

struct GuidVisitor;

impl<'de> serde::de::Visitor<'de> for GuidVisitor {
    type Value = Guid;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a 64-bit integer or a hex string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Guid, E>
    where
        E: Error,
    {
        Ok(Guid(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Guid, E>
    where
        E: Error,
    {
        if v < 0 {
            Err(E::invalid_value(Unexpected::Signed(v), &self))
        } else {
            Ok(Guid(v as u64))
        }
    }

    fn visit_str<E>(self, v: &str) -> Result<Guid, E>
    where
        E: Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Guid, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(GuidVisitor)
    }
}

/// Four character code identifying the asset type, e.g. `txtr` or `matl`.
///
/// Stored as little-endian `u32`, so the characters appear in order in the file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AssetType(pub u32);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Asset type must be exactly 4 ASCII characters, got '{0}'")]
pub struct ParseAssetTypeError(String);

impl AssetType {
    pub const fn from_code(code: [u8; 4]) -> Self {
        AssetType(u32::from_le_bytes(code))
    }

    pub const fn code(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl FromStr for AssetType {
    type Err = ParseAssetTypeError;

    fn from_str(s: &str) -> Result<Self, ParseAssetTypeError> {
        match <[u8; 4]>::try_from(s.as_bytes()) {
            Ok(code) if code.is_ascii() => Ok(AssetType::from_code(code)),
            _ => Err(ParseAssetTypeError(s.to_owned())),
        }
    }
}

impl Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.code() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl Debug for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

impl Serialize for AssetType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssetType {
    fn deserialize<D>(deserializer: D) -> Result<AssetType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_hash_folds_case_and_separators() {
        let a = Guid::from_path("texture/models/humans/pilot_col.rpak");
        let b = Guid::from_path("Texture\\Models\\Humans\\PILOT_COL.rpak");
        assert_eq!(a, b);
    }

    #[test]
    fn path_hash_known_values() {
        assert_eq!(Guid::from_path(""), Guid(0));
        assert_eq!(Guid::from_path("a"), Guid(0xff51afd7f15376c8));
        assert_eq!(Guid::from_path("abcd"), Guid(0x4a706cf3235fd74e));
        assert_eq!(
            Guid::from_path("texture/models/humans/pilot_col.rpak"),
            Guid(0xc6e3d5a0582c3ae7)
        );
    }

    #[test]
    fn path_hash_distinguishes_paths() {
        let paths = [
            "a",
            "b",
            "ab",
            "abcd",
            "abcde",
            "texture/foo.rpak",
            "texture/bar.rpak",
            "texture/foo.rpa",
            "material/foo.rpak",
        ];

        for (i, a) in paths.iter().enumerate() {
            for b in &paths[i + 1..] {
                assert_ne!(Guid::from_path(a), Guid::from_path(b), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn extra_word_changes_hash() {
        assert_ne!(Guid::from_path("abcd"), Guid::from_path("abcd\u{1}\u{1}\u{1}\u{1}"));
    }

    #[test]
    fn guid_parse_and_format() {
        let guid: Guid = "0x00000000deadbeef".parse().unwrap();
        assert_eq!(guid, Guid(0xdeadbeef));
        assert_eq!(guid.to_string(), "00000000deadbeef");

        let mut buf = [0u8; 10];
        guid.encode_at(&mut buf, 2);
        assert_eq!(buf[2..], [0xef, 0xbe, 0xad, 0xde, 0, 0, 0, 0]);
    }

    #[test]
    fn asset_type_codes() {
        let ty: AssetType = "txtr".parse().unwrap();
        assert_eq!(ty.code(), *b"txtr");
        assert_eq!(ty.0, 0x7274_7874);
        assert_eq!(ty.to_string(), "txtr");

        assert!("tex".parse::<AssetType>().is_err());
        assert!("texture".parse::<AssetType>().is_err());
    }
}
