use crate::Icd10Code;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_set, BTreeSet},
    fmt,
    io::prelude::*,
    iter, ops,
    sync::Arc,
};

/// A set of codes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSet {
    codes: Arc<BTreeSet<Icd10Code>>,
}

impl CodeSet {
    /// Duplicates will be removed.
    fn new(codes: BTreeSet<Icd10Code>) -> Self {
        Self {
            codes: Arc::new(codes),
        }
    }

    fn update<T>(&mut self, f: impl FnOnce(&mut BTreeSet<Icd10Code>) -> T) -> T {
        f(Arc::make_mut(&mut self.codes))
    }

    /// Parse a downloaded codelist.
    ///
    /// Returns `None` if no column holding codes could be found. Codes that aren't valid are
    /// skipped with a warning.
    pub fn from_csv(reader: impl Read) -> Result<Option<Self>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let column = match find_code_column(reader.headers()?) {
            Some(column) => column,
            None => return Ok(None),
        };
        let mut codes = BTreeSet::new();
        for record in reader.into_records() {
            let record = record?;
            let raw = record.get(column).unwrap_or("").trim();
            if raw.is_empty() {
                continue;
            }
            match Icd10Code::from_raw(raw) {
                Ok(code) => {
                    codes.insert(code);
                }
                Err(e) => event!(Level::WARN, "skipping codelist entry: {}", e),
            }
        }
        Ok(Some(CodeSet::new(codes)))
    }

    pub fn contains(&self, code: Icd10Code) -> bool {
        self.codes.contains(&code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> iter::Copied<btree_set::Iter<'_, Icd10Code>> {
        self.codes.iter().copied()
    }

    pub fn insert(&mut self, code: Icd10Code) {
        self.update(|codes| codes.insert(code));
    }

    /// A version of `CodeSet` that can match code prefixes quickly.
    pub fn into_matcher(self) -> PrefixMatcher {
        PrefixMatcher::new(self)
    }
}

/// Find the column that holds codes, trying the common names exactly first and then ignoring
/// case.
pub fn find_code_column(headers: &csv::StringRecord) -> Option<usize> {
    const EXACT: &[&str] = &["code", "icd10_code", "icd", "ICD_code"];
    const ANY_CASE: &[&str] = &["code", "icd10_code", "icd", "icd_code"];

    if let Some(idx) = EXACT
        .iter()
        .find_map(|name| headers.iter().position(|h| h == *name))
    {
        return Some(idx);
    }
    ANY_CASE.iter().find_map(|name| {
        headers
            .iter()
            .position(|h| h.to_ascii_lowercase() == *name)
    })
}

impl FromIterator<Icd10Code> for CodeSet {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Icd10Code>,
    {
        Self::new(iter.into_iter().collect())
    }
}

impl From<BTreeSet<Icd10Code>> for CodeSet {
    fn from(f: BTreeSet<Icd10Code>) -> Self {
        Self::new(f)
    }
}

impl fmt::Display for CodeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut codes = self.codes.iter();
        if let Some(code) = codes.next() {
            write!(f, "{}", code)?;
        }
        for code in codes {
            write!(f, ", {}", code)?;
        }
        write!(f, "}}")
    }
}

// CodeSet with a matcher

/// Matches codes that start with any code in the set (including the codes themselves).
pub struct PrefixMatcher {
    code_set: CodeSet,
    matcher: AhoCorasick,
}

impl PrefixMatcher {
    fn new(code_set: CodeSet) -> Self {
        let matcher = AhoCorasickBuilder::new()
            .anchored(true)
            .build(code_set.iter());
        Self { code_set, matcher }
    }

    pub fn matches_prefix(&self, code: Icd10Code) -> bool {
        self.matcher.is_match(code)
    }

    pub fn into_inner(self) -> CodeSet {
        self.code_set
    }
}

impl ops::Deref for PrefixMatcher {
    type Target = CodeSet;

    fn deref(&self) -> &Self::Target {
        &self.code_set
    }
}
