//! Codelists, and getting hold of them from the local cache or OpenCodelists.

mod codeset;
pub use codeset::{find_code_column, CodeSet, PrefixMatcher};
mod fetch;
pub use fetch::{Fetch, Fetched, HttpFetcher, RateLimited};
#[cfg(test)]
pub(crate) use fetch::test::StubFetcher;

use crate::{util, ArcStr};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Identifies a codelist.
///
/// Named codelists use their versioned slug (e.g. `/opensafely/asthma/2024-05-01/`). Codelists
/// written directly into analysis code have a synthetic id `<inline>:` followed by a short hash
/// of their codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodelistId(ArcStr);

impl CodelistId {
    pub const INLINE_PREFIX: &'static str = "<inline>";

    pub fn new(id: impl Into<ArcStr>) -> Self {
        CodelistId(id.into())
    }

    pub fn inline(hash: &str) -> Self {
        CodelistId(format!("{}:{}", Self::INLINE_PREFIX, hash).into())
    }

    pub fn is_inline(&self) -> bool {
        self.0.starts_with(Self::INLINE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name of the file this codelist is cached in.
    pub fn cache_file_name(&self) -> String {
        format!("{}.csv", self.0.trim_matches('/').replace('/', "_"))
    }

    /// The last segment of the slug, which for hash-versioned codelists is the hash.
    pub fn last_segment(&self) -> Option<&str> {
        self.0.trim_matches('/').rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl fmt::Display for CodelistId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CodelistId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a codelist was made.
///
/// Builder codelists include children of selected codes unless they are explicitly excluded.
/// Uploaded and inline codelists contain exactly what their author wrote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CreationMethod {
    Builder,
    Uploaded,
    Inline,
    #[default]
    Unknown,
    Other(ArcStr),
}

impl fmt::Display for CreationMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CreationMethod::Builder => f.write_str("Builder"),
            CreationMethod::Uploaded => f.write_str("Uploaded"),
            CreationMethod::Inline => f.write_str("Inline"),
            CreationMethod::Unknown => Ok(()),
            CreationMethod::Other(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CreationMethod {
    fn from(s: &str) -> Self {
        match s.trim() {
            "Builder" => CreationMethod::Builder,
            "Uploaded" => CreationMethod::Uploaded,
            "Inline" => CreationMethod::Inline,
            "" => CreationMethod::Unknown,
            other => CreationMethod::Other(other.into()),
        }
    }
}

impl FromStr for CreationMethod {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CreationMethod::from(s))
    }
}

impl Serialize for CreationMethod {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CreationMethod {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(d)?;
        Ok(CreationMethod::from(s.as_str()))
    }
}

/// A codelist and what we know about where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codelist {
    pub id: CodelistId,
    pub codes: CodeSet,
    pub creation_method: CreationMethod,
    /// Whether the codelist is referenced from ehrQL code in a project repository.
    pub from_ehrql: bool,
}

/// Loads codelists from a directory of cached downloads, downloading anything missing.
///
/// Each codelist is downloaded at most once per store, even if the download fails.
pub struct CodelistStore<F> {
    cache_dir: PathBuf,
    base_url: String,
    fetcher: F,
    attempted: HashSet<CodelistId>,
}

impl<F: Fetch> CodelistStore<F> {
    pub fn new(cache_dir: impl Into<PathBuf>, base_url: impl Into<String>, fetcher: F) -> Self {
        CodelistStore {
            cache_dir: cache_dir.into(),
            base_url: base_url.into(),
            fetcher,
            attempted: HashSet::new(),
        }
    }

    pub fn cache_path(&self, id: &CodelistId) -> PathBuf {
        self.cache_dir.join(id.cache_file_name())
    }

    pub fn download_url(&self, id: &CodelistId) -> String {
        format!("{}{}download.csv", self.base_url, id)
    }

    /// Load the codes of a codelist.
    ///
    /// Failures are logged and give `None`: one bad codelist shouldn't stop a run.
    pub fn load(&mut self, id: &CodelistId) -> Option<CodeSet> {
        let path = self.cache_path(id);
        match util::path_exists(&path) {
            Ok(true) => (),
            Ok(false) => {
                if !self.download(id, &path) {
                    return None;
                }
            }
            Err(e) => {
                event!(Level::WARN, "checking cache for {}: {}", id, e);
                return None;
            }
        }
        match parse_cached(&path) {
            Ok(Some(codes)) => Some(codes),
            Ok(None) => {
                event!(Level::WARN, "no code column found in codelist {}", id);
                None
            }
            Err(e) => {
                event!(Level::WARN, "error loading codelist {}: {:#}", id, e);
                None
            }
        }
    }

    pub fn into_fetcher(self) -> F {
        self.fetcher
    }

    fn download(&mut self, id: &CodelistId, path: &Path) -> bool {
        if !self.attempted.insert(id.clone()) {
            return false;
        }
        let url = self.download_url(id);
        event!(Level::INFO, "downloading {}", url);
        match self.fetcher.fetch(&url) {
            Fetched::Body(body) => match save(path, &body) {
                Ok(()) => true,
                Err(e) => {
                    event!(Level::WARN, "caching codelist {}: {:#}", id, e);
                    false
                }
            },
            Fetched::RateLimited => {
                event!(Level::WARN, "still rate limited downloading {}, skipping", id);
                false
            }
            Fetched::Failed(reason) => {
                event!(Level::WARN, "error downloading {}: {}", id, reason);
                false
            }
        }
    }
}

fn parse_cached(path: &Path) -> Result<Option<CodeSet>> {
    let file = fs::File::open(path)
        .with_context(|| format!("opening cached codelist \"{}\"", path.display()))?;
    CodeSet::from_csv(file)
}

fn save(path: &Path, body: &[u8]) -> Result {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)
        .with_context(|| format!("writing codelist to \"{}\"", path.display()))
}
