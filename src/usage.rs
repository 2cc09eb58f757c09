//! Counts of how often each code is used, per dataset, count column and financial year.

mod gaps;
pub use gaps::{write_combined_usage, CodeGaps};
mod source;
pub use source::{
    ingest_usage_csv, ChainOutcome, LocalArchive, LocalDirectory, RemoteArchive, SourceChain,
    SourceOutcome, UsageArchive, UsageSource,
};

use crate::{ArcStr, Icd10Code};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet},
    fmt, fs,
    io::prelude::*,
    ops::Bound,
    path::Path,
    str::FromStr,
};

/// The datasets usage is counted in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum DataSource {
    /// Admitted patient care spells (hospital admissions).
    Apcs,
    /// ONS mortality data.
    OnsDeaths,
}

impl DataSource {
    pub const ALL: [DataSource; 2] = [DataSource::Apcs, DataSource::OnsDeaths];

    /// The name used in file names.
    pub fn name(self) -> &'static str {
        match self {
            DataSource::Apcs => "apcs",
            DataSource::OnsDeaths => "ons_deaths",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DataSource::Apcs => "APCS",
            DataSource::OnsDeaths => "ONS Deaths",
        }
    }

    /// All count columns for this source start with this.
    pub fn column_prefix(self) -> &'static str {
        match self {
            DataSource::Apcs => "apcs_",
            DataSource::OnsDeaths => "ons_",
        }
    }

    /// Pairs of (column in the per-year extract, column in combined usage files).
    pub fn count_columns(self) -> &'static [(&'static str, &'static str)] {
        match self {
            DataSource::Apcs => &[
                ("primary_count", "apcs_primary_count"),
                ("secondary_count", "apcs_secondary_count"),
                ("all_count", "apcs_all_count"),
            ],
            DataSource::OnsDeaths => &[
                ("primary_cause_count", "ons_primary_count"),
                ("contributing_cause_count", "ons_contributing_count"),
            ],
        }
    }

    pub fn categories(self) -> impl Iterator<Item = &'static str> {
        self.count_columns().iter().map(|(_, category)| *category)
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataSource {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "apcs" => DataSource::Apcs,
            "ons_deaths" => DataSource::OnsDeaths,
            other => bail!("unknown data source \"{}\"", other),
        })
    }
}

/// A financial year, e.g. `2024-25`, stored as its starting calendar year.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FinancialYear(u16);

impl FinancialYear {
    pub fn starting(year: u16) -> Self {
        FinancialYear(year)
    }

    pub fn start_year(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FinancialYear {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:02}", self.0, (self.0 % 100 + 1) % 100)
    }
}

/// Accepts `2024-25`, `2024_25` and `202425`.
impl FromStr for FinancialYear {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = s.chars().filter(|ch| !matches!(ch, '-' | '_')).collect();
        ensure!(
            digits.len() == 6 && digits.chars().all(|ch| ch.is_ascii_digit()),
            "expected a financial year like 2024-25, found \"{}\"",
            s
        );
        let start: u16 = digits[..4].parse()?;
        let end: u16 = digits[4..].parse()?;
        ensure!(
            (start + 1) % 100 == end,
            "financial year \"{}\" does not span consecutive years",
            s
        );
        Ok(FinancialYear(start))
    }
}

impl TryFrom<String> for FinancialYear {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FinancialYear> for String {
    fn from(year: FinancialYear) -> String {
        year.to_string()
    }
}

/// A count column in a given financial year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub category: ArcStr,
    pub year: FinancialYear,
}

impl UsageKey {
    pub fn new(category: impl Into<ArcStr>, year: FinancialYear) -> Self {
        UsageKey {
            category: category.into(),
            year,
        }
    }
}

/// A count as it appeared in the data, with its numeric value.
///
/// Small counts are suppressed in the source data as e.g. `<15`. These (and anything else that
/// isn't a number) count as 0, but the original text is kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Count {
    raw: ArcStr,
    value: u64,
}

impl Count {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        Count {
            value: parse_value(raw).unwrap_or(0),
            raw: raw.into(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_suppressed(&self) -> bool {
        self.raw.starts_with('<')
    }

    /// Combine two counts for the same code and key.
    ///
    /// Values are added. If either side was a real number the text becomes the sum, otherwise
    /// the first marker is kept.
    pub fn merge(&mut self, other: &Count) {
        let numeric = parse_value(&self.raw).is_some() || parse_value(&other.raw).is_some();
        self.value += other.value;
        if numeric {
            self.raw = self.value.to_string().into();
        } else if self.raw.is_empty() {
            self.raw = other.raw.clone();
        }
    }
}

fn parse_value(raw: &str) -> Option<u64> {
    if raw.is_empty() || raw.starts_with('<') {
        return None;
    }
    raw.parse().ok()
}

/// Usage counts for every code seen in a dataset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsageTable {
    codes: BTreeMap<Icd10Code, BTreeMap<UsageKey, Count>>,
}

impl UsageTable {
    const CODE_COLUMN: &'static str = "icd10_code";
    const YEAR_COLUMN: &'static str = "financial_year";
    const IGNORED_COLUMNS: &'static [&'static str] = &["in_opencodelists"];

    pub fn new() -> Self {
        Self::default()
    }

    /// Read a combined usage file.
    ///
    /// Every column other than the code, the year and `in_opencodelists` is a count column.
    /// Repeated rows for the same code and year are added together.
    pub fn from_csv(reader: impl Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| format_err!("missing column \"{}\"", name))
        };
        let code_idx = column(Self::CODE_COLUMN)?;
        let year_idx = column(Self::YEAR_COLUMN)?;
        let categories: Vec<(usize, ArcStr)> = headers
            .iter()
            .enumerate()
            .filter(|(idx, name)| {
                *idx != code_idx && *idx != year_idx && !Self::IGNORED_COLUMNS.contains(name)
            })
            .map(|(idx, name)| (idx, ArcStr::from(name)))
            .collect();

        let mut table = UsageTable::new();
        for record in reader.into_records() {
            let record = record?;
            let raw_code = record.get(code_idx).unwrap_or("");
            let code = match Icd10Code::from_raw(raw_code) {
                Ok(code) => code,
                Err(e) => {
                    event!(Level::WARN, "skipping usage row: {}", e);
                    continue;
                }
            };
            let year: FinancialYear = record.get(year_idx).unwrap_or("").parse()?;
            for (idx, category) in &categories {
                let count = Count::parse(record.get(*idx).unwrap_or(""));
                table.insert(code, UsageKey::new(category.clone(), year), count);
            }
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<UsageTable> {
            UsageTable::from_csv(fs::File::open(path)?)
        }

        let path = path.as_ref();
        inner(path).with_context(|| format!("loading usage from \"{}\"", path.display()))
    }

    /// Add a count, merging with any count already there.
    pub fn insert(&mut self, code: Icd10Code, key: UsageKey, count: Count) {
        match self.codes.entry(code).or_default().entry(key) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(count);
            }
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().merge(&count),
        }
    }

    /// Add a count, failing if there already is one.
    pub(crate) fn insert_new(&mut self, code: Icd10Code, key: UsageKey, count: Count) -> Result {
        match self.codes.entry(code).or_default().entry(key) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(count);
                Ok(())
            }
            btree_map::Entry::Occupied(entry) => bail!(
                "duplicate {} for code {} in {}",
                entry.key().category,
                code,
                entry.key().year
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn contains(&self, code: Icd10Code) -> bool {
        self.codes.contains_key(&code)
    }

    pub fn codes(&self) -> impl Iterator<Item = Icd10Code> + '_ {
        self.codes.keys().copied()
    }

    pub fn get(&self, code: Icd10Code) -> Option<&BTreeMap<UsageKey, Count>> {
        self.codes.get(&code)
    }

    pub fn count(&self, code: Icd10Code, key: &UsageKey) -> Option<&Count> {
        self.codes.get(&code)?.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Icd10Code, &BTreeMap<UsageKey, Count>)> + '_ {
        self.codes.iter().map(|(code, counts)| (*code, counts))
    }

    /// Used codes that strictly extend `parent`.
    pub fn iter_descendants(&self, parent: Icd10Code) -> impl Iterator<Item = Icd10Code> + '_ {
        self.codes
            .range((Bound::Excluded(parent), Bound::Unbounded))
            .map(|(code, _)| *code)
            .take_while(move |code| code.starts_with(parent))
    }

    /// The count columns that have data in `year`.
    pub fn categories_in(&self, year: FinancialYear) -> BTreeSet<ArcStr> {
        self.codes
            .values()
            .flat_map(|counts| counts.keys())
            .filter(|key| key.year == year)
            .map(|key| key.category.clone())
            .collect()
    }

    /// Every financial year with data for `code`.
    pub fn years(&self, code: Icd10Code) -> BTreeSet<FinancialYear> {
        self.get(code)
            .map(|counts| counts.keys().map(|key| key.year).collect())
            .unwrap_or_default()
    }

    /// Sum the numeric values for each key over some codes.
    pub fn sum_over(&self, codes: impl IntoIterator<Item = Icd10Code>) -> BTreeMap<UsageKey, u64> {
        let mut totals = BTreeMap::new();
        for code in codes {
            if let Some(counts) = self.get(code) {
                for (key, count) in counts {
                    *totals.entry(key.clone()).or_insert(0) += count.value();
                }
            }
        }
        totals
    }
}

/// Per-code totals of hospital usage.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CodeTotals {
    pub all_total: u64,
    pub primary_total: u64,
    /// Primary diagnosis count in the report year.
    pub primary_in_year: u64,
}

#[derive(Debug, Default, Clone)]
pub struct UsageTotals {
    totals: BTreeMap<Icd10Code, CodeTotals>,
}

impl UsageTotals {
    const ALL: &'static str = "apcs_all_count";
    const PRIMARY: &'static str = "apcs_primary_count";

    /// Total the hospital usage per code across every year, and for `year`.
    pub fn from_table(table: &UsageTable, year: FinancialYear) -> Self {
        let mut totals = BTreeMap::new();
        for (code, counts) in table.iter() {
            let entry: &mut CodeTotals = totals.entry(code).or_default();
            for (key, count) in counts {
                match &*key.category {
                    Self::ALL => entry.all_total += count.value(),
                    Self::PRIMARY => {
                        entry.primary_total += count.value();
                        if key.year == year {
                            entry.primary_in_year += count.value();
                        }
                    }
                    _ => (),
                }
            }
        }
        UsageTotals { totals }
    }

    pub fn get(&self, code: Icd10Code) -> Option<&CodeTotals> {
        self.totals.get(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Icd10Code, &CodeTotals)> + '_ {
        self.totals.iter().map(|(code, totals)| (*code, totals))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn code(s: &str) -> Icd10Code {
        Icd10Code::from_code_str(s).unwrap()
    }

    fn fy() -> FinancialYear {
        "2024-25".parse().unwrap()
    }

    #[test]
    fn financial_years() {
        assert_eq!(fy().to_string(), "2024-25");
        assert_eq!("2024_25".parse::<FinancialYear>().unwrap(), fy());
        assert_eq!("202425".parse::<FinancialYear>().unwrap(), fy());
        assert_eq!("1999-00".parse::<FinancialYear>().unwrap().to_string(), "1999-00");
        assert!("2024-26".parse::<FinancialYear>().is_err());
        assert!("24-25".parse::<FinancialYear>().is_err());
        assert_eq!(FinancialYear::starting(u16::MAX).to_string(), "65535-36");
    }

    #[test]
    fn suppression_coercion() {
        let c = Count::parse("<15");
        assert_eq!(c.value(), 0);
        assert_eq!(c.raw(), "<15");
        assert!(c.is_suppressed());
        assert_eq!(Count::parse("").value(), 0);
        assert_eq!(Count::parse("abc").value(), 0);
        assert_eq!(Count::parse(" 42 ").value(), 42);
    }

    #[test]
    fn merging() {
        let mut c = Count::parse("<15");
        c.merge(&Count::parse("<15"));
        assert_eq!((c.raw(), c.value()), ("<15", 0));
        c.merge(&Count::parse("20"));
        assert_eq!((c.raw(), c.value()), ("20", 20));
        let mut c = Count::parse("5");
        c.merge(&Count::parse("7"));
        assert_eq!((c.raw(), c.value()), ("12", 12));
    }

    #[test]
    fn read_table() {
        let input = "icd10_code,financial_year,apcs_primary_count,apcs_all_count,in_opencodelists\n\
                     E10,2024-25,<15,100,yes\n\
                     E101,2024-25,30,40,no\n\
                     E101,2023-24,5,6,no\n\
                     E10,2024-25,10,1,yes\n";
        let table = UsageTable::from_csv(input.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        let primary = UsageKey::new("apcs_primary_count", fy());
        let e10 = table.count(code("E10"), &primary).unwrap();
        assert_eq!((e10.raw(), e10.value()), ("10", 10));
        let all = UsageKey::new("apcs_all_count", fy());
        assert_eq!(table.count(code("E10"), &all).unwrap().value(), 101);
        assert!(table
            .count(code("E10"), &UsageKey::new("in_opencodelists", fy()))
            .is_none());
        assert_eq!(
            table.categories_in(fy()).into_iter().collect::<Vec<_>>(),
            vec![ArcStr::from("apcs_all_count"), ArcStr::from("apcs_primary_count")]
        );
        assert_eq!(table.years(code("E101")).len(), 2);

        let descendants: Vec<_> = table.iter_descendants(code("E10")).collect();
        assert_eq!(descendants, vec![code("E101")]);

        let sums = table.sum_over([code("E10"), code("E101")]);
        assert_eq!(sums[&primary], 40);
    }

    #[test]
    fn missing_year_column_is_an_error() {
        let input = "icd10_code,apcs_primary_count\nE10,5\n";
        assert!(UsageTable::from_csv(input.as_bytes()).is_err());
    }

    #[test]
    fn totals() {
        let mut table = UsageTable::new();
        let last_year = FinancialYear::starting(2023);
        table.insert(code("A33X"), UsageKey::new("apcs_primary_count", fy()), Count::parse("7"));
        table.insert(
            code("A33X"),
            UsageKey::new("apcs_primary_count", last_year),
            Count::parse("3"),
        );
        table.insert(code("A33X"), UsageKey::new("apcs_all_count", fy()), Count::parse("<15"));
        table.insert(code("A33X"), UsageKey::new("apcs_all_count", last_year), Count::parse("9"));
        let totals = UsageTotals::from_table(&table, fy());
        assert_eq!(
            totals.get(code("A33X")),
            Some(&CodeTotals {
                all_total: 9,
                primary_total: 10,
                primary_in_year: 7,
            })
        );
    }
}
