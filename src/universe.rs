//! The dictionary of valid codes, and the two views of it used by the hospital and mortality
//! datasets.

use crate::{usage::DataSource, Icd10Code};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    io::{self, prelude::*},
    ops::Bound,
    path::Path,
    sync::Arc,
};

/// An immutable set of codes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeUniverse {
    codes: Arc<BTreeSet<Icd10Code>>,
}

impl CodeUniverse {
    fn new(codes: BTreeSet<Icd10Code>) -> Self {
        Self {
            codes: Arc::new(codes),
        }
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

    pub fn iter(&self) -> impl Iterator<Item = Icd10Code> + '_ {
        self.codes.iter().copied()
    }

    // Relies on `Icd10Code` ordering like its string form, so every code starting with `parent`
    // sits in one run directly after it.
    pub fn iter_descendants(&self, parent: Icd10Code) -> impl Iterator<Item = Icd10Code> + '_ {
        self.codes
            .range((Bound::Excluded(parent), Bound::Unbounded))
            .copied()
            .take_while(move |code| code.starts_with(parent))
    }

    pub fn has_descendants(&self, parent: Icd10Code) -> bool {
        self.iter_descendants(parent).next().is_some()
    }
}

impl FromIterator<Icd10Code> for CodeUniverse {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Icd10Code>,
    {
        Self::new(iter.into_iter().collect())
    }
}

impl From<BTreeSet<Icd10Code>> for CodeUniverse {
    fn from(f: BTreeSet<Icd10Code>) -> Self {
        Self::new(f)
    }
}

/// Checks that the reference dictionary looks complete before anything is built on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceChecks {
    pub min_codes: usize,
    pub sentinels: Vec<Icd10Code>,
}

impl Default for ReferenceChecks {
    fn default() -> Self {
        let sentinels = ["A00", "B99", "C341", "E119", "I10", "J459", "Z992"]
            .into_iter()
            .filter_map(|code| Icd10Code::from_code_str(code).ok())
            .collect();
        ReferenceChecks {
            min_codes: 12_000,
            sentinels,
        }
    }
}

impl ReferenceChecks {
    pub fn verify(&self, codes: &CodeUniverse) -> Result {
        ensure!(
            codes.len() >= self.min_codes,
            "loaded too few codes from the reference dictionary ({} < {})",
            codes.len(),
            self.min_codes
        );
        for sentinel in &self.sentinels {
            ensure!(
                codes.contains(*sentinel),
                "known code {} missing from the reference dictionary",
                sentinel
            );
        }
        Ok(())
    }
}

/// Read the reference dictionary: one code per line.
///
/// Lines containing `-` are code ranges and are ignored, as are blank lines.
pub fn parse_reference_codes(reader: impl BufRead) -> Result<CodeUniverse> {
    let mut codes = BTreeSet::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.contains('-') {
            continue;
        }
        match Icd10Code::from_raw(line) {
            Ok(code) => {
                codes.insert(code);
            }
            Err(e) => event!(Level::WARN, "skipping line {}: {}", idx + 1, e),
        }
    }
    Ok(CodeUniverse::new(codes))
}

/// The code universes for each data source.
#[derive(Debug, Clone)]
pub struct Universes {
    /// The reference dictionary verbatim. This is also the true ICD-10 hierarchy.
    pub ons_deaths: CodeUniverse,
    /// Hospital data pads 3 character codes without children with an `X`, and never uses the
    /// bare 3 character form.
    pub apcs: CodeUniverse,
}

impl Universes {
    pub fn build(reference: CodeUniverse) -> Self {
        let apcs = reference
            .iter()
            .filter_map(|code| {
                if code.len() != 3 {
                    Some(code)
                } else if reference.has_descendants(code) {
                    None
                } else {
                    code.x_padded()
                }
            })
            .collect();
        Universes {
            ons_deaths: reference,
            apcs,
        }
    }

    /// Load the reference dictionary, check it, and build both universes.
    pub fn load(path: impl AsRef<Path>, checks: &ReferenceChecks) -> Result<Self> {
        fn inner(path: &Path, checks: &ReferenceChecks) -> Result<Universes> {
            let file = fs::File::open(path)?;
            let reference = parse_reference_codes(io::BufReader::new(file))?;
            checks.verify(&reference)?;
            Ok(Universes::build(reference))
        }

        let path = path.as_ref();
        inner(path, checks).with_context(|| {
            format!(
                "loading the reference dictionary from \"{}\"",
                path.display()
            )
        })
    }

    pub fn get(&self, source: DataSource) -> &CodeUniverse {
        match source {
            DataSource::Apcs => &self.apcs,
            DataSource::OnsDeaths => &self.ons_deaths,
        }
    }

    /// The universe used to decide the descendants of a code.
    pub fn hierarchy(&self) -> &CodeUniverse {
        &self.ons_deaths
    }
}
