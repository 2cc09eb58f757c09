//! Classify codelist members by how many of their descendants the codelist also contains.

use crate::{codelist::CodeSet, universe::CodeUniverse, Icd10Code};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    /// All descendants are in the codelist (or there are none).
    Complete,
    /// Some, but not all, descendants are in the codelist.
    Partial,
    /// The code has descendants, and the codelist contains none of them.
    None,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Complete => "COMPLETE",
            Classification::Partial => "PARTIAL",
            Classification::None => "NONE",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "COMPLETE" => Classification::Complete,
            "PARTIAL" => Classification::Partial,
            "NONE" => Classification::None,
            other => bail!("unknown classification \"{}\"", other),
        })
    }
}

/// The code lengths that carry meaning when classifying codes and widening codelists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixPolicy {
    /// Length of a category code (e.g. `E10`). Prefix matching on a category admits all its
    /// descendants.
    pub category_len: usize,
    /// Length of a category plus one digit or `X` filler (e.g. `E101`, `A33X`). Codes of this
    /// length are treated as leaves of the reference dictionary.
    pub padded_len: usize,
}

impl Default for PrefixPolicy {
    fn default() -> Self {
        PrefixPolicy {
            category_len: 3,
            padded_len: 4,
        }
    }
}

impl PrefixPolicy {
    pub fn classify(
        &self,
        code: Icd10Code,
        codelist: &CodeSet,
        hierarchy: &CodeUniverse,
    ) -> Classification {
        if code.len() == self.padded_len {
            return Classification::Complete;
        }
        let (mut total, mut included) = (0, 0);
        for descendant in hierarchy.iter_descendants(code) {
            total += 1;
            if codelist.contains(descendant) {
                included += 1;
            }
        }
        if included == total {
            // includes the leaf case where there are no descendants
            Classification::Complete
        } else if included == 0 {
            Classification::None
        } else {
            Classification::Partial
        }
    }

    /// Whether widening `parent` by prefix matching should pick up `child`.
    ///
    /// Category parents admit all descendants, padded parents admit only the longer extension
    /// codes. Other parents admit nothing.
    pub fn admits(&self, parent: Icd10Code, child: Icd10Code) -> bool {
        if !child.is_descendant_of(parent) {
            return false;
        }
        if parent.len() == self.category_len {
            true
        } else if parent.len() == self.padded_len {
            child.len() > self.padded_len
        } else {
            false
        }
    }
}

/// All codes in `universe` that strictly extend `code`.
pub fn get_descendants(code: Icd10Code, universe: &CodeUniverse) -> BTreeSet<Icd10Code> {
    universe.iter_descendants(code).collect()
}

/// Classify `code` using the default length policy.
pub fn classify(code: Icd10Code, codelist: &CodeSet, hierarchy: &CodeUniverse) -> Classification {
    PrefixPolicy::default().classify(code, codelist, hierarchy)
}

/// Memoizes classifications for the members of a single codelist.
///
/// A classification depends on the whole codelist, so a classifier must never be shared between
/// codelists.
pub struct Classifier<'a> {
    codelist: &'a CodeSet,
    hierarchy: &'a CodeUniverse,
    policy: PrefixPolicy,
    memo: HashMap<Icd10Code, Classification>,
}

impl<'a> Classifier<'a> {
    pub fn new(codelist: &'a CodeSet, hierarchy: &'a CodeUniverse, policy: PrefixPolicy) -> Self {
        Classifier {
            codelist,
            hierarchy,
            policy,
            memo: HashMap::new(),
        }
    }

    pub fn get(&mut self, code: Icd10Code) -> Classification {
        let (codelist, hierarchy, policy) = (self.codelist, self.hierarchy, self.policy);
        *self
            .memo
            .entry(code)
            .or_insert_with(|| policy.classify(code, codelist, hierarchy))
    }
}
