//! What we know about codelists from outside: the OpenCodelists catalogue export, and the
//! codelists referenced from ehrQL code in project repositories.

use crate::{
    code::is_icd10_code,
    codelist::{CodeSet, Codelist, CodelistId, CreationMethod},
    ArcStr, Icd10Code,
};
use blake2::{Blake2s256, Digest};
use itertools::Itertools;
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs, io,
    path::Path,
};

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }

    inner(path).with_context(|| format!("loading \"{}\"", path.display()))
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    coding_system: String,
    #[serde(default)]
    versions: Vec<CatalogVersion>,
}

#[derive(Debug, Deserialize)]
struct CatalogVersion {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    creation_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodelistMeta {
    pub coding_system: ArcStr,
    pub creation_method: CreationMethod,
}

impl CodelistMeta {
    pub fn is_icd10(&self) -> bool {
        self.coding_system.eq_ignore_ascii_case("icd10")
    }
}

/// The codelist catalogue, indexed by tagged slug (`/{slug}/{tag}/`) and by version hash.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    by_key: HashMap<ArcStr, CodelistMeta>,
    icd10_versions: Vec<CodelistId>,
}

impl Catalog {
    pub fn from_json(reader: impl io::Read) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_reader(reader)?;
        Self::from_entries(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_entries(load_json(path.as_ref())?)
            .with_context(|| format!("indexing catalogue \"{}\"", path.as_ref().display()))
    }

    fn from_entries(entries: Vec<CatalogEntry>) -> Result<Self> {
        let mut by_key = HashMap::new();
        let mut icd10_versions = vec![];
        for entry in entries {
            let coding_system = ArcStr::from(entry.coding_system.as_str());
            for version in entry.versions {
                let meta = CodelistMeta {
                    coding_system: coding_system.clone(),
                    creation_method: version
                        .creation_method
                        .as_deref()
                        .map(CreationMethod::from)
                        .unwrap_or_default(),
                };
                if let Some(tag) = version.tag.filter(|t| !t.is_empty()) {
                    by_key.insert(format!("/{}/{}/", entry.slug, tag).into(), meta.clone());
                }
                if let Some(hash) = version.hash.filter(|h| !h.is_empty()) {
                    ensure!(
                        !by_key.contains_key(hash.as_str()),
                        "duplicate hash {}",
                        hash
                    );
                    by_key.insert(hash.into(), meta);
                }
                if entry.coding_system == "icd10" {
                    if let Some(slug) = version.slug.filter(|s| !s.is_empty()) {
                        icd10_versions.push(CodelistId::new(format!("/{}/", slug)));
                    }
                }
            }
        }
        Ok(Catalog {
            by_key,
            icd10_versions,
        })
    }

    /// Look up a codelist by id, falling back to the last segment of the id (the version hash).
    pub fn lookup(&self, id: &CodelistId) -> Option<&CodelistMeta> {
        self.by_key
            .get(id.as_str())
            .or_else(|| self.by_key.get(id.last_segment()?))
    }

    /// Every ICD-10 codelist version in the catalogue.
    pub fn icd10_versions(&self) -> &[CodelistId] {
        &self.icd10_versions
    }
}

/// Codelists referenced from ehrQL code.
///
/// `signatures` maps a file hash to file names, then variable names, then a list of codelist
/// references. The first element of a reference is the codelist id. For inline codelists it is
/// `<inline>` and the fourth element holds the codes as `values=A|B|C`. `projects` maps each
/// repository to the file hash at each commit.
#[derive(Debug, Default, Deserialize)]
pub struct Signatures {
    #[serde(default)]
    signatures: BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<Vec<Value>>>>>,
    #[serde(default)]
    projects: BTreeMap<String, Value>,
}

impl Signatures {
    pub fn from_json(reader: impl io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// (file hash, codelist reference) for every reference.
    fn references(&self) -> impl Iterator<Item = (&str, &[Value])> + '_ {
        self.signatures.iter().flat_map(|(hash, files)| {
            files
                .values()
                .flat_map(|variables| variables.values())
                .flatten()
                .map(move |entry| (hash.as_str(), entry.as_slice()))
        })
    }

    /// Ids of named codelists.
    pub fn named_ids(&self) -> BTreeSet<CodelistId> {
        self.references()
            .filter_map(|(_, entry)| entry.first()?.as_str())
            .filter(|id| !id.is_empty() && *id != CodelistId::INLINE_PREFIX)
            .map(CodelistId::new)
            .collect()
    }

    /// The codes of each distinct inline codelist, sorted.
    pub fn inline_code_lists(&self) -> BTreeSet<Vec<String>> {
        let mut out = BTreeSet::new();
        for (_, entry) in self.references() {
            if entry.first().and_then(Value::as_str) != Some(CodelistId::INLINE_PREFIX) {
                continue;
            }
            let values = entry
                .get(3)
                .and_then(Value::as_str)
                .and_then(|v| v.strip_prefix("values="));
            match values {
                Some(values) => {
                    out.insert(values.split('|').map(|c| c.trim().to_owned()).sorted().collect());
                }
                None => event!(Level::WARN, "inline codelist without values: {:?}", entry),
            }
        }
        out
    }

    /// Which repositories use each named codelist.
    pub fn consumer_index(&self) -> ConsumerIndex {
        let mut repos_by_hash: HashMap<&str, BTreeSet<ArcStr>> = HashMap::new();
        for (repo, commits) in &self.projects {
            if let Some(commits) = commits.as_object() {
                for file_hash in commits.values().filter_map(Value::as_str) {
                    repos_by_hash
                        .entry(file_hash)
                        .or_default()
                        .insert(repo.as_str().into());
                }
            }
        }

        let mut repos: BTreeMap<CodelistId, BTreeSet<ArcStr>> = BTreeMap::new();
        for (hash, entry) in self.references() {
            let id = match entry.first().and_then(Value::as_str) {
                Some(id) if !id.is_empty() && id != CodelistId::INLINE_PREFIX => id,
                _ => continue,
            };
            let set = repos.entry(CodelistId::new(id)).or_default();
            if let Some(hash_repos) = repos_by_hash.get(hash) {
                set.extend(hash_repos.iter().cloned());
            }
        }
        ConsumerIndex { repos }
    }
}

/// Make an inline codelist from its codes.
///
/// Returns `None` unless every code looks like ICD-10. The id is built from a hash of the sorted
/// codes, so the same inline codelist always gets the same id.
pub fn inline_codelist(codes: &[String]) -> Option<Codelist> {
    if codes.is_empty() || !codes.iter().all(|c| is_icd10_code(c)) {
        return None;
    }
    let sorted = codes.iter().sorted().join("|");
    let digest = Blake2s256::digest(sorted.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    let codes: CodeSet = codes
        .iter()
        .filter_map(|c| Icd10Code::from_code_str(c).ok())
        .collect();
    Some(Codelist {
        id: CodelistId::inline(&hash),
        codes,
        creation_method: CreationMethod::Inline,
        from_ehrql: true,
    })
}

/// Codelist id to the repositories whose ehrQL code uses it.
#[derive(Debug, Default, Clone)]
pub struct ConsumerIndex {
    repos: BTreeMap<CodelistId, BTreeSet<ArcStr>>,
}

impl ConsumerIndex {
    pub fn repos(&self, id: &CodelistId) -> impl Iterator<Item = &ArcStr> + '_ {
        self.repos.get(id).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

impl FromIterator<(CodelistId, ArcStr)> for ConsumerIndex {
    fn from_iter<T: IntoIterator<Item = (CodelistId, ArcStr)>>(iter: T) -> Self {
        let mut repos: BTreeMap<CodelistId, BTreeSet<ArcStr>> = BTreeMap::new();
        for (id, repo) in iter {
            repos.entry(id).or_default().insert(repo);
        }
        ConsumerIndex { repos }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CATALOG: &str = r#"[
        {"slug": "opensafely/asthma", "coding_system": "icd10", "versions": [
            {"tag": "2020-01-01", "hash": "aaaa1111", "slug": "opensafely/asthma/2020-01-01", "creation_method": "Builder"},
            {"tag": null, "hash": "bbbb2222", "slug": "opensafely/asthma/bbbb2222", "creation_method": "Uploaded"}
        ]},
        {"slug": "opensafely/statins", "coding_system": "dmd", "versions": [
            {"tag": "v1", "hash": "cccc3333", "slug": "opensafely/statins/v1"}
        ]}
    ]"#;

    const SIGNATURES: &str = r#"{
        "signatures": {
            "h1": {"analysis/dataset.py": {
                "asthma": [["/opensafely/asthma/2020-01-01/", "x"]],
                "diabetes": [["<inline>", "", "", "values=E11|E10"]],
                "other": [["<inline>", "", "", "values=1234|E10"]]
            }},
            "h2": {"analysis/other.py": {
                "asthma": [["/opensafely/asthma/2020-01-01/"]],
                "copd": [["/user/someone/copd/dddd4444/"]],
                "same": [["<inline>", "", "", "values=E10|E11"]]
            }}
        },
        "projects": {
            "repo-a": {"c1": "h1", "c2": "h2"},
            "repo-b": {"c3": "h2"},
            "broken": "not-a-dict"
        }
    }"#;

    fn id(s: &str) -> CodelistId {
        CodelistId::new(s)
    }

    #[test]
    fn catalog_lookup() {
        let catalog = Catalog::from_json(CATALOG.as_bytes()).unwrap();
        let meta = catalog.lookup(&id("/opensafely/asthma/2020-01-01/")).unwrap();
        assert_eq!(meta.creation_method, CreationMethod::Builder);
        assert!(meta.is_icd10());
        // falls back to the version hash
        let meta = catalog.lookup(&id("/opensafely/asthma/bbbb2222/")).unwrap();
        assert_eq!(meta.creation_method, CreationMethod::Uploaded);
        assert!(!catalog.lookup(&id("/opensafely/statins/v1/")).unwrap().is_icd10());
        assert!(catalog.lookup(&id("/nobody/nothing/")).is_none());
        assert_eq!(
            catalog.icd10_versions(),
            &[
                id("/opensafely/asthma/2020-01-01/"),
                id("/opensafely/asthma/bbbb2222/")
            ]
        );
    }

    #[test]
    fn duplicate_hash_is_an_error() {
        let json = r#"[{"slug": "a", "coding_system": "icd10", "versions": [{"hash": "x"}, {"hash": "x"}]}]"#;
        assert!(Catalog::from_json(json.as_bytes()).is_err());
    }

    #[test]
    fn signature_ids() {
        let sigs = Signatures::from_json(SIGNATURES.as_bytes()).unwrap();
        let named: Vec<_> = sigs.named_ids().into_iter().collect();
        assert_eq!(
            named,
            vec![id("/opensafely/asthma/2020-01-01/"), id("/user/someone/copd/dddd4444/")]
        );
        let inline: Vec<_> = sigs.inline_code_lists().into_iter().collect();
        assert_eq!(inline.len(), 2);
        assert!(inline.contains(&vec!["E10".to_owned(), "E11".to_owned()]));
    }

    #[test]
    fn inline_ids() {
        let a = inline_codelist(&["E11".into(), "E10".into()]).unwrap();
        let b = inline_codelist(&["E10".into(), "E11".into()]).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.is_inline());
        assert_eq!(a.id.as_str().len(), "<inline>:".len() + 8);
        assert_eq!(a.creation_method, CreationMethod::Inline);
        assert!(a.from_ehrql);
        assert_eq!(a.codes.len(), 2);
        assert!(inline_codelist(&["1234".into(), "E10".into()]).is_none());
    }

    #[test]
    fn consumers() {
        let sigs = Signatures::from_json(SIGNATURES.as_bytes()).unwrap();
        let index = sigs.consumer_index();
        let asthma: Vec<_> = index
            .repos(&id("/opensafely/asthma/2020-01-01/"))
            .map(|r| r.to_string())
            .collect();
        assert_eq!(asthma, ["repo-a", "repo-b"]);
        let copd: Vec<_> = index
            .repos(&id("/user/someone/copd/dddd4444/"))
            .map(|r| r.to_string())
            .collect();
        assert_eq!(copd, ["repo-a", "repo-b"]);
        assert_eq!(index.repos(&id("/unknown/")).count(), 0);
    }
}
