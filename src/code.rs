use once_cell::sync::Lazy;
use qu::ick_use::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt, hash,
    str::{self, FromStr},
};

/// The longest code we will store. Real ICD-10 codes are at most 6 characters, the extra room is
/// for local extensions.
pub const MAX_CODE_LEN: usize = 8;

/// Markers that some sources append to a code (e.g. dagger/asterisk conventions).
const TRAILING_MARKERS: &[char] = &['*', '|', '~'];

static ICD10_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]\d{2}[0-9X]?[0-9]?$").expect("valid regex"));

/// An ICD-10 code.
///
/// ICD-10 is a prefix hierarchy: `E1112` is a child of `E111`, which is a child of `E11`. Codes
/// are stored inline, so they are `Copy`, and they order exactly like their string forms, which
/// means all descendants of a code sort directly after it.
#[derive(Copy, Clone)]
pub struct Icd10Code {
    len: u8,
    bytes: [u8; MAX_CODE_LEN],
}

impl Icd10Code {
    pub fn from_bytes(v: &[u8]) -> Result<Self> {
        ensure!(
            !v.is_empty() && v.len() <= MAX_CODE_LEN,
            "expected a code between 1 and {} characters long, found {}",
            MAX_CODE_LEN,
            v.len()
        );
        ensure!(
            v.iter().all(|ch| ch.is_ascii_alphanumeric()),
            "ICD-10 codes contain characters [A-Z0-9], found \"{}\"",
            String::from_utf8_lossy(v)
        );
        let mut bytes = [0; MAX_CODE_LEN];
        for (out, ch) in bytes.iter_mut().zip(v) {
            *out = ch.to_ascii_uppercase();
        }
        Ok(Icd10Code {
            len: v.len() as u8,
            bytes,
        })
    }

    /// Parse a code exactly, without the cleanup `from_raw` does.
    pub fn from_code_str(v: &str) -> Result<Self> {
        Self::from_bytes(v.as_bytes())
    }

    /// Parse a code as it appears in input files: surrounding whitespace and trailing markers
    /// (`*`, `|`, `~`) are removed.
    pub fn from_raw(v: &str) -> Result<Self> {
        let trimmed = v.trim().trim_end_matches(TRAILING_MARKERS).trim_end();
        Self::from_code_str(trimmed).with_context(|| format!("invalid code \"{}\"", v))
    }

    pub fn len(self) -> usize {
        self.len as usize
    }

    pub fn as_str(&self) -> &str {
        // only ascii alphanumerics are ever stored
        str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    pub fn starts_with(self, prefix: Icd10Code) -> bool {
        self.as_bytes().starts_with(prefix.as_bytes())
    }

    /// `self` is strictly longer than `parent` and starts with it.
    pub fn is_descendant_of(self, parent: Icd10Code) -> bool {
        self.len > parent.len && self.starts_with(parent)
    }

    pub fn is_parent_of(self, child: Icd10Code) -> bool {
        child.is_descendant_of(self)
    }

    pub fn ends_with_x(self) -> bool {
        self.as_bytes().last() == Some(&b'X')
    }

    /// The code with `X` appended, or `None` if it already ends in `X` (or there is no room).
    pub fn x_padded(self) -> Option<Icd10Code> {
        if self.ends_with_x() || self.len() == MAX_CODE_LEN {
            return None;
        }
        let mut out = self;
        out.bytes[out.len()] = b'X';
        out.len += 1;
        Some(out)
    }
}

/// Whether a string looks like an ICD-10 code: a capital letter, two digits, then optionally a
/// digit or `X` and one more digit.
pub fn is_icd10_code(code: &str) -> bool {
    ICD10_FORMAT.is_match(code)
}

impl PartialEq for Icd10Code {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Icd10Code {}

impl hash::Hash for Icd10Code {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl PartialOrd for Icd10Code {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Icd10Code {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Debug for Icd10Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Icd10Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'a> TryFrom<&'a str> for Icd10Code {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::from_raw(s)
    }
}

impl FromStr for Icd10Code {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_raw(s)
    }
}

impl AsRef<str> for Icd10Code {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<[u8]> for Icd10Code {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Serialize for Icd10Code {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Icd10Code {
    fn deserialize<D>(deserializer: D) -> Result<Icd10Code, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(Icd10CodeVisitor)
    }
}

struct Icd10CodeVisitor;

impl<'de> serde::de::Visitor<'de> for Icd10CodeVisitor {
    type Value = Icd10Code;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an ICD-10 code")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Icd10Code::from_raw(v).map_err(serde::de::Error::custom)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Icd10Code::from_bytes(v).map_err(serde::de::Error::custom)
    }
}
