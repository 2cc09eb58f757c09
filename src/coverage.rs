//! Coverage of a single codelist against the reference dictionary and observed usage.

use crate::{
    classify::{Classification, Classifier, PrefixPolicy},
    codelist::Codelist,
    universe::CodeUniverse,
    usage::{UsageKey, UsageTable},
    Icd10Code,
};
use qu::ick_use::*;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct CoverageResult {
    pub codelist: Codelist,
    /// Classification of every member. Members outside the hierarchy have no descendants there,
    /// so they classify as leaves.
    pub classifications: BTreeMap<Icd10Code, Classification>,
    /// Members the hierarchy doesn't contain.
    pub outside_hierarchy: BTreeSet<Icd10Code>,
    /// Usage summed over exactly the codelist's members.
    pub actual_usage: BTreeMap<UsageKey, u64>,
    /// Used codes extending a member that the source universe doesn't know about.
    pub missing_descendants: BTreeSet<Icd10Code>,
    /// Usage summed over `missing_descendants`.
    pub potential_usage: BTreeMap<UsageKey, u64>,
}

/// Analyze one codelist.
///
/// `universe` is the universe of the data source the usage comes from. `hierarchy` decides the
/// descendants of a code, and should be the true ICD-10 hierarchy rather than a padded view of
/// it.
pub fn analyze(
    codelist: &Codelist,
    universe: &CodeUniverse,
    usage: &UsageTable,
    hierarchy: &CodeUniverse,
    policy: PrefixPolicy,
) -> CoverageResult {
    let mut classifier = Classifier::new(&codelist.codes, hierarchy, policy);
    let classifications = codelist
        .codes
        .iter()
        .map(|code| (code, classifier.get(code)))
        .collect();
    let outside_hierarchy: BTreeSet<Icd10Code> = codelist
        .codes
        .iter()
        .filter(|code| !hierarchy.contains(*code))
        .collect();
    if !outside_hierarchy.is_empty() {
        event!(
            Level::DEBUG,
            "{}: {} codes not in the hierarchy",
            codelist.id,
            outside_hierarchy.len()
        );
    }

    let actual_usage = usage.sum_over(codelist.codes.iter());

    let missing_descendants: BTreeSet<Icd10Code> = codelist
        .codes
        .iter()
        .flat_map(|code| usage.iter_descendants(code))
        .filter(|code| !universe.contains(*code))
        .collect();
    let potential_usage = usage.sum_over(missing_descendants.iter().copied());

    CoverageResult {
        codelist: codelist.clone(),
        classifications,
        outside_hierarchy,
        actual_usage,
        missing_descendants,
        potential_usage,
    }
}
