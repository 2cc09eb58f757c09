//! Which projects would see different results if prefix matching were switched on.

use crate::{catalog::ConsumerIndex, codelist::CodelistId, scenario::ScenarioResult, ArcStr};
use qu::ick_use::*;
use serde::Serialize;
use std::{fmt, fs, io, io::prelude::*, path::Path};

/// Repository name used for codelists no known project uses.
pub const NOT_FOUND: &str = "(not found in repos)";

/// Change relative to a baseline.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PercentChange {
    Finite(f64),
    /// The baseline was zero.
    Infinite,
}

impl PercentChange {
    pub fn between(baseline: u64, total: u64) -> Self {
        if baseline == 0 {
            PercentChange::Infinite
        } else {
            PercentChange::Finite((total as f64 - baseline as f64) * 100. / baseline as f64)
        }
    }
}

impl fmt::Display for PercentChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // halves round to even
            PercentChange::Finite(pct) => write!(f, "{}%", pct.round_ties_even()),
            PercentChange::Infinite => f.write_str("Infinite"),
        }
    }
}

impl Serialize for PercentChange {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.collect_str(self)
    }
}

/// A codelist whose primary diagnosis usage changes under prefix matching.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub codelist_id: CodelistId,
    pub baseline: u64,
    /// The larger of the strict and lax totals.
    pub with_prefix: u64,
    pub change: PercentChange,
}

/// Find the codelists whose usage changes in the strict or lax scenario.
pub fn discrepancies(results: &[ScenarioResult]) -> Vec<Discrepancy> {
    results
        .iter()
        .filter_map(|result| {
            let baseline = result.baseline_primary;
            let lax = baseline + result.none_primary;
            let with_prefix = result.strict_primary.max(lax);
            if with_prefix == baseline {
                return None;
            }
            Some(Discrepancy {
                codelist_id: result.codelist_id.clone(),
                baseline,
                with_prefix,
                change: PercentChange::between(baseline, with_prefix),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRow {
    pub repo: ArcStr,
    pub codelist: CodelistId,
    pub current_event_count: u64,
    pub event_count_with_prefix_matching: u64,
    pub percentage_increase: PercentChange,
}

/// One row per (repository, codelist), sorted by repository then codelist.
pub fn map_to_consumers(discrepancies: &[Discrepancy], index: &ConsumerIndex) -> Vec<ConsumerRow> {
    let not_found: ArcStr = NOT_FOUND.into();
    let mut rows = vec![];
    for discrepancy in discrepancies {
        let mut repos: Vec<ArcStr> = index.repos(&discrepancy.codelist_id).cloned().collect();
        if repos.is_empty() {
            repos.push(not_found.clone());
        }
        rows.extend(repos.into_iter().map(|repo| ConsumerRow {
            repo,
            codelist: discrepancy.codelist_id.clone(),
            current_event_count: discrepancy.baseline,
            event_count_with_prefix_matching: discrepancy.with_prefix,
            percentage_increase: discrepancy.change,
        }));
    }
    rows.sort_by(|a, b| (&a.repo, &a.codelist).cmp(&(&b.repo, &b.codelist)));
    rows
}

pub fn write_consumers(writer: impl Write, rows: &[ConsumerRow]) -> Result {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_consumers(path: impl AsRef<Path>, rows: &[ConsumerRow]) -> Result {
    fn inner(path: &Path, rows: &[ConsumerRow]) -> Result {
        let file = fs::File::create(path)?;
        write_consumers(io::BufWriter::new(file), rows)
    }

    let path = path.as_ref();
    inner(path, rows).with_context(|| format!("writing repo mapping to \"{}\"", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codelist::CreationMethod;

    fn result(id: &str, method: CreationMethod, baseline: u64, strict: u64, none: u64) -> ScenarioResult {
        ScenarioResult {
            codelist_id: CodelistId::new(id),
            creation_method: method,
            baseline_primary: baseline,
            strict_primary: strict,
            partial_primary: strict,
            none_primary: none,
            baseline_secondary: 0,
            strict_secondary: 0,
            partial_secondary: 0,
            none_secondary: 0,
            baseline_all: 0,
            with_partial_children_all: 0,
        }
    }

    #[test]
    fn percent_change() {
        assert_eq!(PercentChange::between(0, 5).to_string(), "Infinite");
        assert_eq!(PercentChange::between(200, 205).to_string(), "2%");
        assert_eq!(PercentChange::between(200, 203).to_string(), "2%");
        assert_eq!(PercentChange::between(200, 207).to_string(), "4%");
        assert_eq!(PercentChange::between(10, 10).to_string(), "0%");
    }

    #[test]
    fn finds_discrepancies() {
        let results = vec![
            result("/same/", CreationMethod::Builder, 10, 10, 0),
            result("/strict/", CreationMethod::Builder, 10, 15, 0),
            result("/lax/", CreationMethod::Uploaded, 10, 12, 8),
            result("/zero/", CreationMethod::Builder, 0, 4, 0),
        ];
        let found = discrepancies(&results);
        let summary: Vec<_> = found
            .iter()
            .map(|d| (d.codelist_id.to_string(), d.with_prefix, d.change.to_string()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("/strict/".into(), 15, "50%".into()),
                ("/lax/".into(), 18, "80%".into()),
                ("/zero/".into(), 4, "Infinite".into()),
            ]
        );
    }

    #[test]
    fn maps_to_repos() {
        let results = vec![
            result("/a/", CreationMethod::Builder, 10, 15, 0),
            result("/b/", CreationMethod::Builder, 0, 4, 0),
        ];
        let index: ConsumerIndex = vec![
            (CodelistId::new("/a/"), ArcStr::from("opensafely/zeta")),
            (CodelistId::new("/a/"), ArcStr::from("opensafely/alpha")),
        ]
        .into_iter()
        .collect();
        let rows = map_to_consumers(&discrepancies(&results), &index);
        let repos: Vec<_> = rows.iter().map(|r| (&*r.repo, r.codelist.as_str())).collect();
        assert_eq!(
            repos,
            vec![
                (NOT_FOUND, "/b/"),
                ("opensafely/alpha", "/a/"),
                ("opensafely/zeta", "/a/"),
            ]
        );

        let mut out = vec![];
        write_consumers(&mut out, &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("repo,codelist,current_event_count,event_count_with_prefix_matching,percentage_increase")
        );
        assert_eq!(lines.next(), Some("(not found in repos),/b/,0,4,Infinite"));
        assert_eq!(lines.next(), Some("opensafely/alpha,/a/,10,15,50%"));
    }
}
