//! Everything a run needs, loaded once up front.

use crate::{
    catalog::{inline_codelist, Catalog, ConsumerIndex, Signatures},
    codelist::{Codelist, CodelistId, CodelistStore, Fetch, HttpFetcher, RateLimited},
    config::Config,
    coverage::{analyze, CoverageResult},
    universe::Universes,
    usage::{DataSource, LocalArchive, LocalDirectory, RemoteArchive, SourceChain, UsageTable},
};
use qu::ick_use::*;
use std::collections::{BTreeMap, BTreeSet};

/// The rate limited HTTP client used for all outbound calls.
pub type DefaultFetcher = RateLimited<HttpFetcher>;

pub fn http_fetcher(config: &Config, timeout: std::time::Duration) -> Result<DefaultFetcher> {
    Ok(RateLimited::new(
        HttpFetcher::new(&config.user_agent, timeout)?,
        config.fetch.delay(),
        config.fetch.backoff(),
    ))
}

/// The places usage extracts are looked for, in order of preference.
///
/// When `offline` the remote archive is skipped.
pub fn usage_chain(config: &Config, offline: bool) -> Result<SourceChain> {
    let mut chain = SourceChain::new();
    if !offline {
        let fetcher = http_fetcher(config, config.fetch.archive_timeout())?;
        chain = chain.with_source(RemoteArchive::new(config.usage_archive_url.clone(), fetcher));
    }
    if let Some(archive) = &config.local_usage_archive {
        chain = chain.with_source(LocalArchive::new(archive));
    }
    Ok(chain.with_source(LocalDirectory::new(&config.local_usage_dir)))
}

/// The reference universes, the codelist catalogue, and what ehrQL code references.
pub struct AnalysisContext<F = DefaultFetcher> {
    pub config: Config,
    pub universes: Universes,
    pub catalog: Catalog,
    pub consumers: ConsumerIndex,
    /// Named codelists to analyze, with whether ehrQL code references them.
    named: Vec<(CodelistId, bool)>,
    inline: Vec<Codelist>,
    store: CodelistStore<F>,
}

impl AnalysisContext {
    pub fn init(config: Config) -> Result<Self> {
        let fetcher = http_fetcher(&config, config.fetch.codelist_timeout())?;
        Self::with_fetcher(config, fetcher)
    }
}

impl<F: Fetch> AnalysisContext<F> {
    pub fn with_fetcher(config: Config, fetcher: F) -> Result<Self> {
        let universes = Universes::load(config.reference_codes_path(), &config.reference)?;
        event!(
            Level::INFO,
            "{} reference codes ({} in hospital data form)",
            universes.ons_deaths.len(),
            universes.apcs.len()
        );
        let catalog = Catalog::load(config.catalog_path())?;
        let signatures = Signatures::load(config.signatures_path())?;
        let consumers = signatures.consumer_index();

        let mut ehrql = BTreeSet::new();
        for id in signatures.named_ids() {
            match catalog.lookup(&id) {
                Some(meta) if meta.is_icd10() => {
                    ehrql.insert(id);
                }
                Some(_) => (),
                None => event!(Level::WARN, "codelist {} not found in the catalogue", id),
            }
        }
        let mut named: Vec<(CodelistId, bool)> =
            ehrql.iter().map(|id| (id.clone(), true)).collect();
        let from_ehrql = ehrql.len();
        let mut seen = ehrql;
        for id in catalog.icd10_versions() {
            if seen.insert(id.clone()) {
                named.push((id.clone(), false));
            }
        }

        let mut inline = BTreeMap::new();
        for codes in signatures.inline_code_lists() {
            match inline_codelist(&codes) {
                Some(codelist) => {
                    inline.entry(codelist.id.clone()).or_insert(codelist);
                }
                None => event!(
                    Level::WARN,
                    "skipping inline codelist that isn't ICD-10: {}",
                    codes.join("|")
                ),
            }
        }
        event!(
            Level::INFO,
            "{} named codelists ({} from ehrQL), {} inline",
            named.len(),
            from_ehrql,
            inline.len()
        );

        let store = CodelistStore::new(config.cache_dir(), config.codelist_base_url.clone(), fetcher);
        Ok(AnalysisContext {
            config,
            universes,
            catalog,
            consumers,
            named,
            inline: inline.into_values().collect(),
            store,
        })
    }

    /// Load every codelist that can be loaded, named ones first.
    ///
    /// Codelists that can't be found or downloaded are skipped.
    pub fn load_codelists(&mut self) -> Vec<Codelist> {
        let mut out = vec![];
        for (id, from_ehrql) in &self.named {
            let codes = match self.store.load(id) {
                Some(codes) => codes,
                None => continue,
            };
            let creation_method = self
                .catalog
                .lookup(id)
                .map(|meta| meta.creation_method.clone())
                .unwrap_or_default();
            out.push(Codelist {
                id: id.clone(),
                codes,
                creation_method,
                from_ehrql: *from_ehrql,
            });
        }
        let skipped = self.named.len() - out.len();
        if skipped > 0 {
            event!(Level::WARN, "{} codelists could not be loaded", skipped);
        }
        out.extend(self.inline.iter().cloned());
        out
    }

    /// Analyze each codelist against one data source.
    pub fn analyze(
        &self,
        codelists: &[Codelist],
        usage: &UsageTable,
        source: DataSource,
    ) -> Vec<CoverageResult> {
        let universe = self.universes.get(source);
        let hierarchy = self.universes.hierarchy();
        codelists
            .iter()
            .map(|codelist| analyze(codelist, universe, usage, hierarchy, self.config.policy))
            .collect()
    }

    /// Read the combined usage file written by the usage build.
    pub fn load_usage(&self, source: DataSource) -> Result<UsageTable> {
        UsageTable::load(self.config.combined_usage_path(source))
    }

    pub fn into_fetcher(self) -> F {
        self.store.into_fetcher()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        classify::Classification,
        codelist::{CreationMethod, Fetched, StubFetcher},
        universe::ReferenceChecks,
        Icd10Code,
    };
    use std::{fs, path::Path};

    const CATALOG: &str = r#"[
        {"slug": "opensafely/asthma", "coding_system": "icd10", "versions": [
            {"tag": "v1", "hash": "aaa111", "slug": "opensafely/asthma/aaa111", "creation_method": "Builder"}
        ]},
        {"slug": "opensafely/ms", "coding_system": "icd10", "versions": [
            {"tag": "v2", "hash": "bbb222", "slug": "opensafely/ms/bbb222", "creation_method": "Uploaded"}
        ]},
        {"slug": "opensafely/snomed", "coding_system": "snomedct", "versions": [
            {"tag": "v1", "hash": "ccc333", "slug": "opensafely/snomed/ccc333", "creation_method": "Builder"}
        ]}
    ]"#;

    const SIGNATURES: &str = r#"{
        "signatures": {
            "f1": {"analysis/dataset.py": {
                "asthma": [["/opensafely/asthma/v1/"]],
                "snomed": [["/opensafely/snomed/v1/"]],
                "unknown": [["/someone/else/v9/"]],
                "inline": [["<inline>", null, null, "values=J45|J451"], ["<inline>", null, null, "values=123|456"]]
            }}
        },
        "projects": {"opensafely/study": {"c0ffee": "f1"}}
    }"#;

    fn setup(dir: &Path) -> Config {
        fs::write(dir.join("ocl_icd10_codes.txt"), "G35\nJ45\nJ450\nJ451\nA00-B99\n").unwrap();
        fs::write(dir.join("rsi-codelists-analysis.json"), CATALOG).unwrap();
        fs::write(dir.join("ehrql_codelists.json"), SIGNATURES).unwrap();
        fs::create_dir(dir.join("codelist_cache")).unwrap();
        fs::write(
            dir.join("codelist_cache/opensafely_asthma_v1.csv"),
            "code,term\nJ45,Asthma\nJ450,Allergic asthma\n",
        )
        .unwrap();
        Config {
            data_dir: dir.to_owned(),
            output_dir: dir.join("out"),
            reference: ReferenceChecks {
                min_codes: 4,
                sentinels: vec![],
            },
            ..Config::default()
        }
    }

    #[test]
    fn loads_and_analyzes_codelists() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let url = "https://www.opencodelists.org/codelist/opensafely/ms/bbb222/download.csv";
        let fetcher = StubFetcher::default().respond(url, Fetched::Body(b"code\nG35\n".to_vec()));
        let mut ctx = AnalysisContext::with_fetcher(config, fetcher).unwrap();
        // G35 becomes G35X, J45 has children so is dropped
        assert_eq!(ctx.universes.apcs.len(), 3);
        assert_eq!(
            ctx.consumers
                .repos(&CodelistId::new("/opensafely/asthma/v1/"))
                .map(|r| &**r)
                .collect::<Vec<_>>(),
            ["opensafely/study"]
        );

        let codelists = ctx.load_codelists();
        let ids: Vec<_> = codelists.iter().map(|c| c.id.to_string()).collect();
        // the asthma version slug isn't cached and can't be downloaded
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "/opensafely/asthma/v1/");
        assert_eq!(ids[1], "/opensafely/ms/bbb222/");
        assert!(ids[2].starts_with("<inline>:"));

        assert!(codelists[0].from_ehrql);
        assert_eq!(codelists[0].creation_method, CreationMethod::Builder);
        assert!(!codelists[1].from_ehrql);
        assert_eq!(codelists[1].creation_method, CreationMethod::Uploaded);
        assert_eq!(codelists[2].creation_method, CreationMethod::Inline);
        // downloaded codelists are cached
        assert!(dir.path().join("codelist_cache/opensafely_ms_bbb222.csv").exists());

        let results = ctx.analyze(&codelists, &UsageTable::new(), DataSource::OnsDeaths);
        let j45 = Icd10Code::from_code_str("J45").unwrap();
        assert_eq!(results[0].classifications[&j45], Classification::Partial);
        assert_eq!(results[2].classifications[&j45], Classification::Partial);

        let calls = ctx.into_fetcher().calls;
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn sanity_checks_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = setup(dir.path());
        config.reference.min_codes = 12_000;
        assert!(AnalysisContext::with_fetcher(config, StubFetcher::default()).is_err());
    }
}
