use super::{DataSource, FinancialYear, UsageArchive, UsageKey, UsageTable};
use crate::{universe::CodeUniverse, Icd10Code};
use qu::ick_use::*;
use std::{
    collections::BTreeSet,
    fs,
    io::{self, prelude::*},
    path::Path,
};

/// Write the usage for one data source in the combined format read by `UsageTable::load`.
///
/// Raw values are written as they were found, so suppressed counts stay suppressed. Counts that
/// are absent are written as `0`.
pub fn write_combined_usage(
    writer: impl Write,
    table: &UsageTable,
    source: DataSource,
    universe: &CodeUniverse,
) -> Result {
    let mut writer = csv::Writer::from_writer(writer);
    let mut header = vec!["icd10_code", "financial_year"];
    header.extend(source.categories());
    header.push("in_opencodelists");
    writer.write_record(&header)?;

    for (code, _) in table.iter() {
        let in_universe = if universe.contains(code) { "yes" } else { "no" };
        for year in table.years(code) {
            let mut record = vec![code.to_string(), year.to_string()];
            record.extend(source.categories().map(|category| {
                table
                    .count(code, &UsageKey::new(category, year))
                    .map(|count| count.raw().to_owned())
                    .unwrap_or_else(|| "0".into())
            }));
            record.push(in_universe.into());
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Codes used in practice but not in the reference dictionary, and the other way round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeGaps {
    pub missing: BTreeSet<Icd10Code>,
    pub unused: BTreeSet<Icd10Code>,
}

impl CodeGaps {
    pub fn find(archive: &UsageArchive, reference: &CodeUniverse) -> Self {
        let used: BTreeSet<Icd10Code> = archive
            .apcs
            .codes()
            .chain(archive.ons_deaths.codes())
            .collect();
        CodeGaps {
            missing: used
                .iter()
                .copied()
                .filter(|code| !reference.contains(*code))
                .collect(),
            unused: reference.iter().filter(|code| !used.contains(code)).collect(),
        }
    }

    /// Write the missing codes with their counts for both data sources.
    ///
    /// `provenance` lines are written first as `#` comments.
    pub fn write_missing(
        &self,
        mut writer: impl Write,
        archive: &UsageArchive,
        provenance: &[String],
    ) -> Result {
        write_provenance(&mut writer, provenance)?;
        let mut writer = csv::Writer::from_writer(writer);
        let mut header = vec!["icd10_code", "financial_year"];
        for source in DataSource::ALL {
            header.extend(source.categories());
        }
        writer.write_record(&header)?;

        for code in &self.missing {
            let years: BTreeSet<FinancialYear> = DataSource::ALL
                .iter()
                .flat_map(|source| archive.get(*source).years(*code))
                .collect();
            for year in years {
                let mut record = vec![code.to_string(), year.to_string()];
                for source in DataSource::ALL {
                    let table = archive.get(source);
                    record.extend(source.categories().map(|category| {
                        table
                            .count(*code, &UsageKey::new(category, year))
                            .map(|count| count.raw().to_owned())
                            .unwrap_or_else(|| "0".into())
                    }));
                }
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_unused(&self, mut writer: impl Write, provenance: &[String]) -> Result {
        write_provenance(&mut writer, provenance)?;
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(["icd10_code"])?;
        for code in &self.unused {
            writer.write_record([code.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write both files into `dir`.
    pub fn save(&self, dir: &Path, archive: &UsageArchive, provenance: &[String]) -> Result {
        let missing = dir.join("missing_codes.csv");
        let file = fs::File::create(&missing)
            .with_context(|| format!("creating \"{}\"", missing.display()))?;
        self.write_missing(io::BufWriter::new(file), archive, provenance)?;

        let unused = dir.join("unused_codes.csv");
        let file = fs::File::create(&unused)
            .with_context(|| format!("creating \"{}\"", unused.display()))?;
        self.write_unused(io::BufWriter::new(file), provenance)
    }
}

fn write_provenance(writer: &mut impl Write, provenance: &[String]) -> io::Result<()> {
    for line in provenance {
        writeln!(writer, "# {}", line)?;
    }
    Ok(())
}
