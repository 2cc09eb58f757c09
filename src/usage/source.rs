//! Where usage extracts come from: a zip of per-year CSV files published by the job server, or
//! the same files on disk.

use super::{Count, DataSource, FinancialYear, UsageKey, UsageTable};
use crate::{
    codelist::{Fetch, Fetched},
    Icd10Code,
};
use once_cell::sync::Lazy;
use qu::ick_use::*;
use regex::Regex;
use std::{
    fs,
    io::{self, prelude::*},
    path::{Path, PathBuf},
};

static EXTRACT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^icd10_(apcs|ons_deaths)_([0-9]{4}_[0-9]{2}).*\.csv$").expect("valid regex")
});

/// Usage from every extract, per data source.
#[derive(Debug, Default, Clone)]
pub struct UsageArchive {
    pub apcs: UsageTable,
    pub ons_deaths: UsageTable,
}

impl UsageArchive {
    pub fn get(&self, source: DataSource) -> &UsageTable {
        match source {
            DataSource::Apcs => &self.apcs,
            DataSource::OnsDeaths => &self.ons_deaths,
        }
    }

    fn get_mut(&mut self, source: DataSource) -> &mut UsageTable {
        match source {
            DataSource::Apcs => &mut self.apcs,
            DataSource::OnsDeaths => &mut self.ons_deaths,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.apcs.is_empty() && self.ons_deaths.is_empty()
    }
}

/// Work out the data source and financial year from an extract's file name (e.g.
/// `icd10_apcs_2024_25.csv`). Directories in the name are ignored.
pub fn parse_extract_name(name: &str) -> Option<(DataSource, FinancialYear)> {
    let file_name = name.rsplit('/').next()?;
    let caps = EXTRACT_NAME.captures(file_name)?;
    let source = caps.get(1)?.as_str().parse().ok()?;
    let year = caps.get(2)?.as_str().parse().ok()?;
    Some((source, year))
}

/// Read one per-year extract into `archive`.
///
/// Every row must have a code, and a code may only appear once per extract.
pub fn ingest_usage_csv(archive: &mut UsageArchive, name: &str, reader: impl Read) -> Result {
    fn inner(archive: &mut UsageArchive, name: &str, reader: impl Read) -> Result {
        let (source, year) = parse_extract_name(name)
            .ok_or_else(|| format_err!("could not work out source and year from file name"))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let idx = |name: &str| headers.iter().position(|h| h == name);
        let code_idx = idx("icd10_code").ok_or_else(|| format_err!("missing icd10_code column"))?;
        let columns: Vec<(Option<usize>, &str)> = source
            .count_columns()
            .iter()
            .map(|&(raw, category)| (idx(raw), category))
            .collect();

        let table = archive.get_mut(source);
        for (row, record) in reader.into_records().enumerate() {
            let record = record?;
            let raw_code = record.get(code_idx).unwrap_or("");
            ensure!(!raw_code.is_empty(), "empty icd10_code on row {}", row + 1);
            let code = Icd10Code::from_raw(raw_code)?;
            for (col, category) in &columns {
                let raw = col.and_then(|col| record.get(col)).unwrap_or("");
                table.insert_new(code, UsageKey::new(*category, year), Count::parse(raw))?;
            }
        }
        Ok(())
    }

    inner(archive, name, reader).with_context(|| format!("reading usage extract \"{}\"", name))
}

/// The result of trying one place to get usage from.
#[derive(Debug)]
pub enum SourceOutcome {
    Loaded(UsageArchive),
    /// The source couldn't be used, with the reason. This is not an error: the next source is
    /// tried.
    Unavailable(String),
}

pub trait UsageSource {
    fn name(&self) -> &str;
    /// Load usage. Errors are for data that was found but is wrong.
    fn load(&mut self) -> Result<SourceOutcome>;
}

/// Read every extract in a zip archive.
fn load_zip(reader: impl Read + io::Seek) -> Result<SourceOutcome> {
    let mut zip = match zip::ZipArchive::new(reader) {
        Ok(zip) => zip,
        Err(e) => return Ok(SourceOutcome::Unavailable(format!("bad zip archive: {}", e))),
    };
    let mut has_csv = false;
    for i in 0..zip.len() {
        if zip.by_index(i)?.name().ends_with(".csv") {
            has_csv = true;
            break;
        }
    }
    if !has_csv {
        return Ok(SourceOutcome::Unavailable(
            "no CSV files found in archive".into(),
        ));
    }

    let mut archive = UsageArchive::default();
    for i in 0..zip.len() {
        let file = zip.by_index(i)?;
        let name = file.name().to_owned();
        if !name.ends_with(".csv") {
            continue;
        }
        if parse_extract_name(&name).is_none() {
            event!(Level::INFO, "skipping unexpected file {}", name);
            continue;
        }
        ingest_usage_csv(&mut archive, &name, file)?;
    }
    Ok(SourceOutcome::Loaded(archive))
}

/// The latest outputs of the usage job, downloaded as a zip.
pub struct RemoteArchive<F> {
    url: String,
    fetcher: F,
}

impl<F: Fetch> RemoteArchive<F> {
    pub fn new(url: impl Into<String>, fetcher: F) -> Self {
        RemoteArchive {
            url: url.into(),
            fetcher,
        }
    }
}

impl<F: Fetch> UsageSource for RemoteArchive<F> {
    fn name(&self) -> &str {
        "remote-archive"
    }

    fn load(&mut self) -> Result<SourceOutcome> {
        event!(Level::INFO, "downloading usage from {}", self.url);
        match self.fetcher.fetch(&self.url) {
            Fetched::Body(body) => load_zip(io::Cursor::new(body)),
            Fetched::RateLimited => Ok(SourceOutcome::Unavailable("rate limited".into())),
            Fetched::Failed(reason) => Ok(SourceOutcome::Unavailable(reason)),
        }
    }
}

/// A zip of the job outputs saved on disk.
pub struct LocalArchive {
    path: PathBuf,
}

impl LocalArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalArchive { path: path.into() }
    }
}

impl UsageSource for LocalArchive {
    fn name(&self) -> &str {
        "local-archive"
    }

    fn load(&mut self) -> Result<SourceOutcome> {
        match fs::File::open(&self.path) {
            Ok(file) => load_zip(io::BufReader::new(file))
                .with_context(|| format!("reading \"{}\"", self.path.display())),
            Err(e) => Ok(SourceOutcome::Unavailable(format!(
                "opening \"{}\": {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// A directory of extracts, as written when running the usage job locally.
pub struct LocalDirectory {
    dir: PathBuf,
}

impl LocalDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalDirectory { dir: dir.into() }
    }

    fn extract_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_extract = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("icd10_") && name.ends_with(".csv"))
                .unwrap_or(false);
            if is_extract {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl UsageSource for LocalDirectory {
    fn name(&self) -> &str {
        "local-directory"
    }

    fn load(&mut self) -> Result<SourceOutcome> {
        let paths = match Self::extract_paths(&self.dir) {
            Ok(paths) => paths,
            Err(e) => {
                return Ok(SourceOutcome::Unavailable(format!(
                    "reading \"{}\": {}",
                    self.dir.display(),
                    e
                )))
            }
        };
        let mut archive = UsageArchive::default();
        for path in paths {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_owned();
            if parse_extract_name(&name).is_none() {
                event!(Level::INFO, "skipping unexpected file {}", path.display());
                continue;
            }
            let file = fs::File::open(&path)
                .with_context(|| format!("opening \"{}\"", path.display()))?;
            ingest_usage_csv(&mut archive, &name, io::BufReader::new(file))?;
        }
        if archive.is_empty() {
            return Ok(SourceOutcome::Unavailable(format!(
                "no usage extracts in \"{}\"",
                self.dir.display()
            )));
        }
        Ok(SourceOutcome::Loaded(archive))
    }
}

/// The sources to try, in order.
#[derive(Default)]
pub struct SourceChain {
    sources: Vec<Box<dyn UsageSource>>,
}

/// Usage loaded by a chain, and how we got it.
#[derive(Debug)]
pub struct ChainOutcome {
    pub archive: UsageArchive,
    /// The name of the source that worked.
    pub strategy: String,
    /// (source name, reason) for every source tried before it.
    pub fallbacks: Vec<(String, String)>,
}

impl ChainOutcome {
    pub fn fell_back(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    /// Lines recording where the usage came from when the preferred source wasn't used.
    pub fn provenance(&self) -> Vec<String> {
        if !self.fell_back() {
            return vec![];
        }
        let mut lines = vec![format!("WARNING: usage loaded from {}", self.strategy)];
        lines.extend(
            self.fallbacks
                .iter()
                .map(|(name, reason)| format!("{} unavailable: {}", name, reason)),
        );
        lines
    }
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl UsageSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn load(&mut self) -> Result<ChainOutcome> {
        let mut fallbacks = vec![];
        for source in self.sources.iter_mut() {
            let name = source.name().to_owned();
            match source.load()? {
                SourceOutcome::Loaded(archive) => {
                    event!(Level::INFO, "loaded usage from {}", name);
                    return Ok(ChainOutcome {
                        archive,
                        strategy: name,
                        fallbacks,
                    });
                }
                SourceOutcome::Unavailable(reason) => {
                    event!(Level::WARN, "{} unavailable: {}", name, reason);
                    fallbacks.push((name, reason));
                }
            }
        }
        let reasons = fallbacks
            .iter()
            .map(|(name, reason)| format!("{}: {}", name, reason))
            .collect::<Vec<_>>()
            .join("; ");
        bail!("no usage source was available ({})", reasons)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codelist::StubFetcher;
    use std::io::Write;

    const APCS: &str = "icd10_code,primary_count,secondary_count,all_count\n\
                        A33X,<15,3,20\n\
                        E101,100,50,150\n";
    const ONS: &str = "icd10_code,primary_cause_count,contributing_cause_count\nI10,7,<15\n";

    fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = io::Cursor::new(vec![]);
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for (name, contents) in files {
                zip.start_file(*name, zip::write::FileOptions::default())
                    .unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn fy() -> FinancialYear {
        FinancialYear::starting(2024)
    }

    #[test]
    fn extract_names() {
        assert_eq!(
            parse_extract_name("icd10_apcs_2024_25.csv"),
            Some((DataSource::Apcs, fy()))
        );
        assert_eq!(
            parse_extract_name("output/icd10_ons_deaths_2024_25_part1.csv"),
            Some((DataSource::OnsDeaths, fy()))
        );
        assert_eq!(parse_extract_name("icd10_other_2024_25.csv"), None);
        assert_eq!(parse_extract_name("notes.csv"), None);
    }

    #[test]
    fn ingest_maps_columns() {
        let mut archive = UsageArchive::default();
        ingest_usage_csv(&mut archive, "icd10_apcs_2024_25.csv", APCS.as_bytes()).unwrap();
        ingest_usage_csv(&mut archive, "icd10_ons_deaths_2024_25.csv", ONS.as_bytes()).unwrap();
        let code = Icd10Code::from_code_str("A33X").unwrap();
        let primary = archive
            .apcs
            .count(code, &UsageKey::new("apcs_primary_count", fy()))
            .unwrap();
        assert_eq!(primary.raw(), "<15");
        let i10 = Icd10Code::from_code_str("I10").unwrap();
        let contributing = archive
            .ons_deaths
            .count(i10, &UsageKey::new("ons_contributing_count", fy()))
            .unwrap();
        assert_eq!(contributing.raw(), "<15");
    }

    #[test]
    fn ingest_rejects_duplicates_and_empty_codes() {
        let mut archive = UsageArchive::default();
        let dup = "icd10_code,primary_count\nE10,1\nE10,2\n";
        assert!(ingest_usage_csv(&mut archive, "icd10_apcs_2024_25.csv", dup.as_bytes()).is_err());
        let mut archive = UsageArchive::default();
        let empty = "icd10_code,primary_count\n,1\n";
        assert!(
            ingest_usage_csv(&mut archive, "icd10_apcs_2024_25.csv", empty.as_bytes()).is_err()
        );
    }

    #[test]
    fn remote_archive() {
        let bytes = zip_of(&[
            ("icd10_apcs_2024_25.csv", APCS),
            ("icd10_ons_deaths_2024_25.csv", ONS),
            ("README.csv", "nothing"),
        ]);
        let stub = StubFetcher::default().respond("remote", Fetched::Body(bytes));
        let mut source = RemoteArchive::new("remote", stub);
        match source.load().unwrap() {
            SourceOutcome::Loaded(archive) => {
                assert_eq!(archive.apcs.len(), 2);
                assert_eq!(archive.ons_deaths.len(), 1);
            }
            other => panic!("expected usage, got {:?}", other),
        }
    }

    #[test]
    fn archive_without_csvs_is_unavailable() {
        let bytes = zip_of(&[("log.txt", "hello")]);
        let stub = StubFetcher::default().respond("remote", Fetched::Body(bytes));
        let mut source = RemoteArchive::new("remote", stub);
        assert!(matches!(source.load().unwrap(), SourceOutcome::Unavailable(_)));

        let stub = StubFetcher::default().respond("remote", Fetched::Body(b"not a zip".to_vec()));
        let mut source = RemoteArchive::new("remote", stub);
        assert!(matches!(source.load().unwrap(), SourceOutcome::Unavailable(_)));
    }

    #[test]
    fn chain_falls_back_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("icd10_apcs_2024_25.csv"), APCS).unwrap();
        fs::write(dir.path().join("icd10_unexpected.csv"), "x").unwrap();

        let mut chain = SourceChain::new()
            .with_source(RemoteArchive::new("remote", StubFetcher::default()))
            .with_source(LocalArchive::new(dir.path().join("missing.zip")))
            .with_source(LocalDirectory::new(dir.path()));
        let outcome = chain.load().unwrap();
        assert_eq!(outcome.strategy, "local-directory");
        assert!(outcome.fell_back());
        let names: Vec<_> = outcome.fallbacks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["remote-archive", "local-archive"]);
        assert_eq!(outcome.archive.apcs.len(), 2);
        let provenance = outcome.provenance();
        assert_eq!(provenance[0], "WARNING: usage loaded from local-directory");
        assert!(provenance[1].starts_with("remote-archive unavailable: "));
        assert_eq!(provenance.len(), 3);
    }

    #[test]
    fn chain_with_nothing_available_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = SourceChain::new().with_source(LocalDirectory::new(dir.path()));
        assert!(chain.load().is_err());
    }
}
