//! What a codelist's usage would be if prefix matching widened it in different ways.
//!
//! Scenarios are computed from a coverage report. Each `EXTRA` row is attributed to at most one
//! member (the first qualifying one in code order), so no used code is counted twice.

use crate::{
    classify::{Classification, PrefixPolicy},
    codelist::{CodeSet, CodelistId, CreationMethod},
    report::{CoverageRow, Status},
    usage::{DataSource, UsageTotals},
    ArcStr, Icd10Code,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt, fs,
    io::{self, prelude::*},
    path::Path,
};

/// The report columns holding each diagnosis field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioColumns {
    pub primary: ArcStr,
    pub secondary: ArcStr,
    /// Mortality data has no "all diagnoses" count.
    pub all: Option<ArcStr>,
}

impl ScenarioColumns {
    pub fn for_source(source: DataSource) -> Self {
        match source {
            DataSource::Apcs => ScenarioColumns {
                primary: "apcs_primary_count".into(),
                secondary: "apcs_secondary_count".into(),
                all: Some("apcs_all_count".into()),
            },
            DataSource::OnsDeaths => ScenarioColumns {
                primary: "ons_primary_count".into(),
                secondary: "ons_contributing_count".into(),
                all: None,
            },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Field {
    Primary,
    Secondary,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Field::Primary => "primary",
            Field::Secondary => "secondary",
        })
    }
}

/// A way of widening a codelist.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scenario {
    /// Only the codelist's own codes.
    Baseline,
    /// Plus descendants of `COMPLETE` members.
    Strict,
    /// Plus descendants of `COMPLETE` members, and of `PARTIAL` category members.
    Partial,
    /// Plus descendants of `NONE` category members. Only uploaded codelists are widened.
    Lax,
}

impl Scenario {
    pub fn label(self) -> &'static str {
        match self {
            Scenario::Baseline => "Baseline",
            Scenario::Strict => "Strict",
            Scenario::Partial => "Partial",
            Scenario::Lax => "Lax",
        }
    }
}

/// Scenario totals for a single codelist. One row of the scenario CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub codelist_id: CodelistId,
    pub creation_method: CreationMethod,
    pub baseline_primary: u64,
    pub strict_primary: u64,
    pub partial_primary: u64,
    /// Usage of the extra codes alone, not including the baseline.
    pub none_primary: u64,
    pub baseline_secondary: u64,
    pub strict_secondary: u64,
    pub partial_secondary: u64,
    pub none_secondary: u64,
    pub baseline_all: u64,
    pub with_partial_children_all: u64,
}

impl ScenarioResult {
    fn empty(codelist_id: CodelistId, creation_method: CreationMethod) -> Self {
        ScenarioResult {
            codelist_id,
            creation_method,
            baseline_primary: 0,
            strict_primary: 0,
            partial_primary: 0,
            none_primary: 0,
            baseline_secondary: 0,
            strict_secondary: 0,
            partial_secondary: 0,
            none_secondary: 0,
            baseline_all: 0,
            with_partial_children_all: 0,
        }
    }

    pub fn total(&self, field: Field, scenario: Scenario) -> u64 {
        match (field, scenario) {
            (Field::Primary, Scenario::Baseline) => self.baseline_primary,
            (Field::Primary, Scenario::Strict) => self.strict_primary,
            (Field::Primary, Scenario::Partial) => self.partial_primary,
            (Field::Primary, Scenario::Lax) => self.baseline_primary + self.none_primary,
            (Field::Secondary, Scenario::Baseline) => self.baseline_secondary,
            (Field::Secondary, Scenario::Strict) => self.strict_secondary,
            (Field::Secondary, Scenario::Partial) => self.partial_secondary,
            (Field::Secondary, Scenario::Lax) => self.baseline_secondary + self.none_secondary,
        }
    }

    /// The usage added by the lax scenario, for uploaded codelists only.
    pub fn lax_extra(&self, field: Field) -> Option<u64> {
        if self.creation_method != CreationMethod::Uploaded {
            return None;
        }
        Some(match field {
            Field::Primary => self.none_primary,
            Field::Secondary => self.none_secondary,
        })
    }

    /// Check that widening never loses usage.
    pub fn verify(&self) -> Result {
        for field in [Field::Primary, Field::Secondary] {
            let baseline = self.total(field, Scenario::Baseline);
            let strict = self.total(field, Scenario::Strict);
            let partial = self.total(field, Scenario::Partial);
            ensure!(
                baseline <= strict && strict <= partial,
                "{}: {} scenarios out of order (baseline {}, strict {}, partial {})",
                self.codelist_id,
                field,
                baseline,
                strict,
                partial
            );
        }
        ensure!(
            self.baseline_all <= self.with_partial_children_all,
            "{}: all-diagnoses total shrank from {} to {}",
            self.codelist_id,
            self.baseline_all,
            self.with_partial_children_all
        );
        Ok(())
    }
}

/// Split report rows by codelist, keeping the order codelists first appear in.
pub fn group_by_codelist(rows: Vec<CoverageRow>) -> Vec<Vec<CoverageRow>> {
    let mut index: HashMap<CodelistId, usize> = HashMap::new();
    let mut groups: Vec<Vec<CoverageRow>> = vec![];
    for row in rows {
        let idx = *index.entry(row.codelist_id.clone()).or_insert_with(|| {
            groups.push(vec![]);
            groups.len() - 1
        });
        groups[idx].push(row);
    }
    groups
}

/// Compute the scenarios for the report rows of one codelist.
pub fn compute_scenarios(
    rows: &[CoverageRow],
    columns: &ScenarioColumns,
    policy: PrefixPolicy,
) -> Result<ScenarioResult> {
    let first = rows.first().context("no rows for codelist")?;
    ensure!(
        rows.iter().all(|row| row.codelist_id == first.codelist_id),
        "rows for more than one codelist passed to compute_scenarios"
    );
    let mut result = ScenarioResult::empty(first.codelist_id.clone(), first.creation_method.clone());
    let uploaded = first.creation_method == CreationMethod::Uploaded;
    let all_value = |row: &CoverageRow| columns.all.as_deref().map(|c| row.value(c)).unwrap_or(0);

    let mut complete = BTreeSet::new();
    let mut partial = BTreeSet::new();
    let mut none = BTreeSet::new();
    for row in rows {
        match row.status {
            Status::Member(class) => {
                match class {
                    Classification::Complete => complete.insert(row.code),
                    Classification::Partial => partial.insert(row.code),
                    Classification::None => none.insert(row.code),
                };
                result.baseline_primary += row.value(&columns.primary);
                result.baseline_secondary += row.value(&columns.secondary);
                result.baseline_all += all_value(row);
            }
            Status::Extra => (),
        }
    }

    let is_category_parent =
        |parent: &Icd10Code, code: Icd10Code| parent.len() == policy.category_len && code.is_descendant_of(*parent);

    let (mut strict_primary, mut strict_secondary) = (0, 0);
    let (mut partial_primary, mut partial_secondary) = (0, 0);
    let mut partial_children_all = 0;
    for row in rows.iter().filter(|row| row.status == Status::Extra) {
        let code = row.code;
        let primary = row.value(&columns.primary);
        let secondary = row.value(&columns.secondary);

        if complete.iter().any(|parent| policy.admits(*parent, code)) {
            strict_primary += primary;
            strict_secondary += secondary;
            partial_primary += primary;
            partial_secondary += secondary;
        } else if partial.iter().any(|parent| is_category_parent(parent, code)) {
            partial_primary += primary;
            partial_secondary += secondary;
        }

        if uploaded && none.iter().any(|parent| is_category_parent(parent, code)) {
            result.none_primary += primary;
            result.none_secondary += secondary;
        }

        if partial.iter().any(|parent| code.is_descendant_of(*parent)) {
            partial_children_all += all_value(row);
        }
    }

    result.strict_primary = result.baseline_primary + strict_primary;
    result.strict_secondary = result.baseline_secondary + strict_secondary;
    result.partial_primary = result.baseline_primary + partial_primary;
    result.partial_secondary = result.baseline_secondary + partial_secondary;
    result.with_partial_children_all = result.baseline_all + partial_children_all;
    result.verify()?;
    Ok(result)
}

/// Compute scenarios for every codelist in a coverage report.
pub fn compute_all(
    rows: Vec<CoverageRow>,
    columns: &ScenarioColumns,
    policy: PrefixPolicy,
) -> Result<Vec<ScenarioResult>> {
    group_by_codelist(rows)
        .iter()
        .map(|rows| compute_scenarios(rows, columns, policy))
        .collect()
}

pub fn write_scenarios(writer: impl Write, results: &[ScenarioResult]) -> Result {
    let mut writer = csv::Writer::from_writer(writer);
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_scenarios(reader: impl Read) -> Result<Vec<ScenarioResult>> {
    let mut reader = csv::Reader::from_reader(reader);
    Ok(reader.deserialize().collect::<Result<_, _>>()?)
}

pub fn save_scenarios(path: impl AsRef<Path>, results: &[ScenarioResult]) -> Result {
    fn inner(path: &Path, results: &[ScenarioResult]) -> Result {
        let file = fs::File::create(path)?;
        write_scenarios(io::BufWriter::new(file), results)
    }

    let path = path.as_ref();
    inner(path, results).with_context(|| format!("writing scenarios to \"{}\"", path.display()))
}

pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<ScenarioResult>> {
    fn inner(path: &Path) -> Result<Vec<ScenarioResult>> {
        let file = fs::File::open(path)?;
        read_scenarios(io::BufReader::new(file))
    }

    let path = path.as_ref();
    inner(path).with_context(|| format!("reading scenarios from \"{}\"", path.display()))
}

// Summaries

/// Percentage increase of `total` over `baseline`, 0 when there is no baseline.
pub fn percent_increase(baseline: u64, total: u64) -> f64 {
    if baseline == 0 {
        0.
    } else {
        (total as f64 - baseline as f64) * 100. / baseline as f64
    }
}

/// A scenario summed over a set of codelists.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScenarioTotal {
    pub label: &'static str,
    pub baseline: u64,
    pub total: u64,
}

impl ScenarioTotal {
    pub fn difference(&self) -> u64 {
        self.total.saturating_sub(self.baseline)
    }

    pub fn percent_increase(&self) -> f64 {
        percent_increase(self.baseline, self.total)
    }
}

/// Sum each of `scenarios` over `results`.
pub fn scenario_totals<'a>(
    results: impl IntoIterator<Item = &'a ScenarioResult>,
    field: Field,
    scenarios: &[Scenario],
) -> Vec<ScenarioTotal> {
    let mut baseline = 0;
    let mut totals = vec![0; scenarios.len()];
    for result in results {
        baseline += result.total(field, Scenario::Baseline);
        for (total, scenario) in totals.iter_mut().zip(scenarios) {
            *total += result.total(field, *scenario);
        }
    }
    scenarios
        .iter()
        .zip(totals)
        .map(|(scenario, total)| ScenarioTotal {
            label: scenario.label(),
            baseline,
            total,
        })
        .collect()
}

/// The all-diagnoses field, with descendants of `PARTIAL` members picked up by prefix matching.
pub fn all_field_total<'a>(results: impl IntoIterator<Item = &'a ScenarioResult>) -> ScenarioTotal {
    let (baseline, total) = results.into_iter().fold((0, 0), |(b, t), r| {
        (b + r.baseline_all, t + r.with_partial_children_all)
    });
    ScenarioTotal {
        label: "With PARTIAL descendants",
        baseline,
        total,
    }
}

/// How many codelists a scenario leaves unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Unaffected {
    pub unaffected: usize,
    pub total: usize,
}

impl Unaffected {
    pub fn count<'a>(
        results: impl IntoIterator<Item = &'a ScenarioResult>,
        field: Field,
        scenario: Scenario,
    ) -> Self {
        results.into_iter().fold(Unaffected::default(), |acc, r| Unaffected {
            unaffected: acc.unaffected
                + usize::from(r.total(field, Scenario::Baseline) == r.total(field, scenario)),
            total: acc.total + 1,
        })
    }
}

impl fmt::Display for Unaffected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.total == 0 {
            return f.write_str("-");
        }
        let pct = self.unaffected as f64 / self.total as f64 * 100.;
        write!(f, "{}/{} ({:.1}%)", self.unaffected, self.total, pct)
    }
}

/// The results with the given creation method.
pub fn with_method<'a>(
    results: &'a [ScenarioResult],
    method: &'a CreationMethod,
) -> impl Iterator<Item = &'a ScenarioResult> + Clone + 'a {
    results.iter().filter(move |r| r.creation_method == *method)
}

// Usage scenarios over code totals

/// Report-year primary usage of a codelist under three matching rules.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UsageScenarios {
    /// Only the codes as written.
    pub exact: u64,
    /// Every used code starting with a codelist code, each counted once.
    pub with_prefix: u64,
    /// The codes as written, plus each code with an `X` appended.
    pub with_x_padding: u64,
}

pub fn usage_scenarios(codes: &CodeSet, totals: &UsageTotals) -> UsageScenarios {
    if codes.is_empty() {
        return UsageScenarios::default();
    }
    let in_year = |code: Icd10Code| totals.get(code).map(|t| t.primary_in_year).unwrap_or(0);

    let exact: u64 = codes.iter().map(in_year).sum();
    let padding: u64 = codes.iter().filter_map(Icd10Code::x_padded).map(in_year).sum();
    let matcher = codes.clone().into_matcher();
    let with_prefix = totals
        .iter()
        .filter(|(code, _)| matcher.matches_prefix(*code))
        .map(|(_, t)| t.primary_in_year)
        .sum();

    UsageScenarios {
        exact,
        with_prefix,
        with_x_padding: exact + padding,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageScenarioRow {
    pub codelist_id: CodelistId,
    pub exact_match: u64,
    pub with_prefix: u64,
    pub with_x_padding: u64,
}

pub fn save_usage_scenarios(path: impl AsRef<Path>, rows: &[UsageScenarioRow]) -> Result {
    fn inner(path: &Path, rows: &[UsageScenarioRow]) -> Result {
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    let path = path.as_ref();
    inner(path, rows).with_context(|| format!("writing usage scenarios to \"{}\"", path.display()))
}
