//! The coverage report: one row per codelist member, plus `EXTRA` rows for used codes
//! that prefix matching on a member would pick up.

use crate::{
    classify::Classification,
    codelist::{CodelistId, CreationMethod},
    coverage::CoverageResult,
    usage::{Count, DataSource, FinancialYear, UsageKey, UsageTable},
    ArcStr, Icd10Code,
};
use qu::ick_use::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    io::{self, prelude::*},
    path::Path,
    str::FromStr,
};

const FIXED_COLUMNS: [&str; 5] = [
    "codelist_id",
    "creation_method",
    "Exists in ehrQL repo",
    "icd10_code",
    "status",
];

/// The status column of a report row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Member(Classification),
    /// A used code that isn't in the codelist, but descends from a member.
    Extra,
}

impl Status {
    pub fn classification(self) -> Option<Classification> {
        match self {
            Status::Member(c) => Some(c),
            Status::Extra => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Member(c) => fmt::Display::fmt(c, f),
            Status::Extra => f.write_str("EXTRA"),
        }
    }
}

impl FromStr for Status {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "EXTRA" {
            Ok(Status::Extra)
        } else {
            Ok(Status::Member(s.parse()?))
        }
    }
}

/// The rows to write for one codelist, keyed (and so ordered) by code.
///
/// Used codes that strictly extend a member become `EXTRA` rows when that member is `COMPLETE`
/// or `PARTIAL`, or, for uploaded codelists, `NONE`. Each used code is written at most once.
pub fn report_rows(result: &CoverageResult, usage: &UsageTable) -> BTreeMap<Icd10Code, Status> {
    let codelist = &result.codelist;
    let uploaded = codelist.creation_method == CreationMethod::Uploaded;
    let mut rows: BTreeMap<Icd10Code, Status> = result
        .classifications
        .iter()
        .map(|(code, class)| (*code, Status::Member(*class)))
        .collect();

    for (parent, class) in &result.classifications {
        let qualifies = *class != Classification::None || uploaded;
        if !qualifies {
            continue;
        }
        for code in usage.iter_descendants(*parent) {
            if !codelist.codes.contains(code) {
                rows.entry(code).or_insert(Status::Extra);
            }
        }
    }
    rows
}

/// Write the report for one data source.
///
/// Usage columns are the source's count columns with data in `year`, showing the values as they
/// appeared in the data. Codelists referenced from ehrQL come first, then the rest, each ordered
/// by id.
pub fn write_coverage_report(
    writer: impl Write,
    results: &[CoverageResult],
    usage: &UsageTable,
    source: DataSource,
    year: FinancialYear,
) -> Result {
    let usage_columns: Vec<ArcStr> = usage
        .categories_in(year)
        .into_iter()
        .filter(|category| category.starts_with(source.column_prefix()))
        .collect();
    let keys: Vec<UsageKey> = usage_columns
        .iter()
        .map(|category| UsageKey::new(category.clone(), year))
        .collect();

    let mut ordered: Vec<&CoverageResult> = results.iter().collect();
    ordered.sort_by(|a, b| {
        (!a.codelist.from_ehrql, &a.codelist.id).cmp(&(!b.codelist.from_ehrql, &b.codelist.id))
    });

    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(
        FIXED_COLUMNS
            .iter()
            .copied()
            .chain(usage_columns.iter().map(|c| &**c)),
    )?;
    for result in ordered {
        let codelist = &result.codelist;
        let id = codelist.id.to_string();
        let method = codelist.creation_method.to_string();
        let in_ehrql = if codelist.from_ehrql { "Y" } else { "N" };
        for (code, status) in report_rows(result, usage) {
            let mut record = vec![
                id.clone(),
                method.clone(),
                in_ehrql.to_owned(),
                code.to_string(),
                status.to_string(),
            ];
            record.extend(keys.iter().map(|key| {
                usage
                    .count(code, key)
                    .map(|count| count.raw().to_owned())
                    .unwrap_or_default()
            }));
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn save_coverage_report(
    path: impl AsRef<Path>,
    results: &[CoverageResult],
    usage: &UsageTable,
    source: DataSource,
    year: FinancialYear,
) -> Result {
    fn inner(
        path: &Path,
        results: &[CoverageResult],
        usage: &UsageTable,
        source: DataSource,
        year: FinancialYear,
    ) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        write_coverage_report(io::BufWriter::new(file), results, usage, source, year)
    }

    let path = path.as_ref();
    inner(path, results, usage, source, year)
        .with_context(|| format!("writing coverage report to \"{}\"", path.display()))
}

/// A row of a coverage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageRow {
    pub codelist_id: CodelistId,
    pub creation_method: CreationMethod,
    pub from_ehrql: bool,
    pub code: Icd10Code,
    pub status: Status,
    /// Usage column to value.
    pub counts: BTreeMap<ArcStr, Count>,
}

impl CoverageRow {
    /// The numeric value in a usage column, 0 if absent or suppressed.
    pub fn value(&self, column: &str) -> u64 {
        self.counts.get(column).map(Count::value).unwrap_or(0)
    }
}

/// Read a coverage report back, row by row.
pub fn read_coverage_report(
    reader: impl Read,
) -> Result<impl Iterator<Item = Result<CoverageRow>>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    ensure!(
        headers.len() >= FIXED_COLUMNS.len()
            && headers.iter().zip(FIXED_COLUMNS).all(|(a, b)| a == b),
        "not a coverage report: expected columns {:?}",
        FIXED_COLUMNS
    );
    let usage_columns: Vec<ArcStr> = headers
        .iter()
        .skip(FIXED_COLUMNS.len())
        .map(ArcStr::from)
        .collect();

    Ok(reader.into_records().map(move |record| {
        let record = record?;
        let field = |idx: usize| record.get(idx).unwrap_or("");
        let counts = usage_columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                (
                    column.clone(),
                    Count::parse(field(FIXED_COLUMNS.len() + idx)),
                )
            })
            .collect();
        Ok(CoverageRow {
            codelist_id: CodelistId::new(field(0)),
            creation_method: CreationMethod::from(field(1)),
            from_ehrql: field(2) == "Y",
            code: Icd10Code::from_raw(field(3))?,
            status: field(4).parse()?,
            counts,
        })
    }))
}

pub fn load_coverage_report(path: impl AsRef<Path>) -> Result<Vec<CoverageRow>> {
    fn inner(path: &Path) -> Result<Vec<CoverageRow>> {
        let file = fs::File::open(path)?;
        read_coverage_report(io::BufReader::new(file))?.collect()
    }

    let path = path.as_ref();
    inner(path).with_context(|| format!("reading coverage report \"{}\"", path.display()))
}

/// The member codes (not `EXTRA` rows) of each codelist in a report.
pub fn member_codes(rows: &[CoverageRow]) -> BTreeMap<CodelistId, BTreeSet<Icd10Code>> {
    let mut out: BTreeMap<CodelistId, BTreeSet<Icd10Code>> = BTreeMap::new();
    for row in rows {
        let codes = out.entry(row.codelist_id.clone()).or_default();
        if row.status != Status::Extra {
            codes.insert(row.code);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        classify::PrefixPolicy,
        codelist::Codelist,
        coverage::analyze,
        scenario::{compute_all, Field, Scenario, ScenarioColumns, ScenarioResult},
        universe::CodeUniverse,
    };

    fn code(s: &str) -> Icd10Code {
        Icd10Code::from_code_str(s).unwrap()
    }

    fn fy() -> FinancialYear {
        FinancialYear::starting(2024)
    }

    fn usage() -> UsageTable {
        let mut table = UsageTable::new();
        let rows = [
            ("E10", "5", "1"),
            ("E101", "10", "2"),
            ("E1012", "<15", "3"),
            ("E102", "20", "4"),
            ("G35", "7", "0"),
            ("G351", "8", "0"),
        ];
        for (c, primary, secondary) in rows {
            table.insert(code(c), UsageKey::new("apcs_primary_count", fy()), Count::parse(primary));
            table.insert(
                code(c),
                UsageKey::new("apcs_secondary_count", fy()),
                Count::parse(secondary),
            );
            // other years and sources don't get columns
            table.insert(
                code(c),
                UsageKey::new("apcs_all_count", FinancialYear::starting(2023)),
                Count::parse("1"),
            );
            table.insert(code(c), UsageKey::new("ons_primary_count", fy()), Count::parse("1"));
        }
        table
    }

    fn hierarchy() -> CodeUniverse {
        ["E10", "E101", "E102", "G35", "G351"]
            .into_iter()
            .map(code)
            .collect()
    }

    fn result(id: &str, codes: &[&str], method: CreationMethod, from_ehrql: bool) -> CoverageResult {
        let codelist = Codelist {
            id: CodelistId::new(id),
            codes: codes.iter().map(|c| code(c)).collect(),
            creation_method: method,
            from_ehrql,
        };
        let h = hierarchy();
        analyze(&codelist, &h, &usage(), &h, PrefixPolicy::default())
    }

    #[test]
    fn extra_rows() {
        let usage = usage();
        let builder = result("/b/", &["E10", "E101", "G35"], CreationMethod::Builder, false);
        let rows = report_rows(&builder, &usage);
        let got: Vec<_> = rows.iter().map(|(c, s)| (c.to_string(), s.to_string())).collect();
        assert_eq!(
            got,
            vec![
                ("E10".into(), "PARTIAL".into()),
                ("E101".into(), "COMPLETE".into()),
                ("E1012".into(), "EXTRA".into()),
                ("E102".into(), "EXTRA".into()),
                ("G35".into(), "NONE".into()),
            ]
        );

        // uploaded codelists also widen NONE members
        let uploaded = result("/u/", &["G35"], CreationMethod::Uploaded, false);
        let rows = report_rows(&uploaded, &usage);
        assert_eq!(rows.get(&code("G351")), Some(&Status::Extra));
    }

    #[test]
    fn round_trip() {
        let usage = usage();
        let results = vec![
            result("/z/", &["G35"], CreationMethod::Uploaded, true),
            result("/a/", &["E10", "E101"], CreationMethod::Builder, false),
        ];
        let mut out = vec![];
        write_coverage_report(&mut out, &results, &usage, DataSource::Apcs, fy()).unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("codelist_id,creation_method,Exists in ehrQL repo,icd10_code,status,apcs_primary_count,apcs_secondary_count")
        );
        assert_eq!(lines.next(), Some("/z/,Uploaded,Y,G35,NONE,7,0"));
        assert_eq!(lines.next(), Some("/z/,Uploaded,Y,G351,EXTRA,8,0"));
        assert_eq!(lines.next(), Some("/a/,Builder,N,E10,PARTIAL,5,1"));

        let rows: Vec<CoverageRow> = read_coverage_report(out.as_slice())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2 + 4);
        let e1012 = rows.iter().find(|r| r.code == code("E1012")).unwrap();
        assert_eq!(e1012.status, Status::Extra);
        assert_eq!(e1012.counts["apcs_primary_count"].raw(), "<15");
        assert_eq!(e1012.value("apcs_primary_count"), 0);
        assert_eq!(e1012.value("apcs_all_count"), 0);

        // every classified member comes back with its classification
        for result in &results {
            for (code, class) in &result.classifications {
                let row = rows
                    .iter()
                    .find(|r| r.codelist_id == result.codelist.id && r.code == *code)
                    .unwrap();
                assert_eq!(row.status, Status::Member(*class));
                assert_eq!(row.creation_method, result.codelist.creation_method);
                assert_eq!(row.from_ehrql, result.codelist.from_ehrql);
            }
        }

        let members = member_codes(&rows);
        assert_eq!(members[&CodelistId::new("/a/")].len(), 2);
    }

    /// Report then scenarios, for one codelist with primary usage only.
    fn pipeline(
        codes: &[&str],
        method: CreationMethod,
        hierarchy: &[&str],
        primary: &[(&str, &str)],
    ) -> (String, Vec<ScenarioResult>) {
        let mut usage = UsageTable::new();
        for (c, n) in primary {
            usage.insert(code(c), UsageKey::new("apcs_primary_count", fy()), Count::parse(n));
        }
        let hierarchy: CodeUniverse = hierarchy.iter().map(|c| code(c)).collect();
        let codelist = Codelist {
            id: CodelistId::new("/test/list/v1/"),
            codes: codes.iter().map(|c| code(c)).collect(),
            creation_method: method,
            from_ehrql: true,
        };
        let result = analyze(&codelist, &hierarchy, &usage, &hierarchy, PrefixPolicy::default());
        let mut out = vec![];
        write_coverage_report(&mut out, &[result], &usage, DataSource::Apcs, fy()).unwrap();
        let rows: Vec<CoverageRow> = read_coverage_report(out.as_slice())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let scenarios = compute_all(
            rows,
            &ScenarioColumns::for_source(DataSource::Apcs),
            PrefixPolicy::default(),
        )
        .unwrap();
        (String::from_utf8(out).unwrap(), scenarios)
    }

    fn primary_totals(result: &ScenarioResult) -> [u64; 4] {
        [
            Scenario::Baseline,
            Scenario::Strict,
            Scenario::Partial,
            Scenario::Lax,
        ]
        .map(|scenario| result.total(Field::Primary, scenario))
    }

    #[test]
    fn partial_category_widens_to_used_children() {
        let (_, results) = pipeline(
            &["E10", "E100"],
            CreationMethod::Builder,
            &["E10", "E100", "E101"],
            &[("E10", "5"), ("E100", "3"), ("E101", "20")],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(primary_totals(&results[0]), [8, 8, 28, 8]);
    }

    #[test]
    fn complete_category_picks_up_padding() {
        let (_, results) = pipeline(
            &["A33"],
            CreationMethod::Builder,
            &["A33"],
            &[("A33", "2"), ("A33X", "40")],
        );
        assert_eq!(primary_totals(&results[0]), [2, 42, 42, 2]);
    }

    #[test]
    fn empty_codelist_has_no_rows() {
        let (report, results) = pipeline(&[], CreationMethod::Builder, &["E10"], &[("E10", "5")]);
        assert_eq!(report.lines().count(), 1);
        assert!(results.is_empty());
    }

    #[test]
    fn member_outside_hierarchy_counts_in_baseline() {
        let (report, results) = pipeline(
            &["E10", "E1012"],
            CreationMethod::Builder,
            &["E10", "E101"],
            &[("E10", "5"), ("E1012", "50")],
        );
        assert!(report.contains("/test/list/v1/,Builder,Y,E1012,COMPLETE,50"));
        assert_eq!(primary_totals(&results[0]), [55, 55, 55, 55]);

        // uploaded codelists still widen the NONE category around it
        let (_, results) = pipeline(
            &["E10", "E1012"],
            CreationMethod::Uploaded,
            &["E10", "E101"],
            &[("E10", "5"), ("E1012", "50"), ("E101", "9")],
        );
        assert_eq!(primary_totals(&results[0]), [55, 55, 55, 64]);
    }

    #[test]
    fn rejects_other_csv() {
        assert!(read_coverage_report("a,b\n1,2\n".as_bytes()).is_err());
    }
}
