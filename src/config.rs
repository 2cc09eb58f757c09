use crate::{
    classify::PrefixPolicy,
    universe::ReferenceChecks,
    usage::{DataSource, FinancialYear},
};
use qu::ick_use::*;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Settings for a run. Every field has a default, so a config file only needs what differs.
///
/// Relative file names are resolved against `data_dir` (inputs) or `output_dir` (outputs).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Where the usage job writes its extracts when run locally.
    pub local_usage_dir: PathBuf,
    /// A downloaded copy of the usage job outputs.
    pub local_usage_archive: Option<PathBuf>,
    pub reference_codes: PathBuf,
    pub codelist_catalog: PathBuf,
    pub ehrql_signatures: PathBuf,
    pub codelist_cache: PathBuf,
    pub usage_archive_url: String,
    pub codelist_base_url: String,
    pub user_agent: String,
    /// The financial year reported on.
    pub report_year: FinancialYear,
    pub fetch: FetchConfig,
    pub reference: ReferenceChecks,
    pub policy: PrefixPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Minimum time between two requests.
    pub delay_ms: u64,
    /// How long to wait before retrying a rate limited request.
    pub rate_limit_backoff_secs: u64,
    pub codelist_timeout_secs: u64,
    pub archive_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "reporting/data".into(),
            output_dir: "reporting/outputs".into(),
            local_usage_dir: "output".into(),
            local_usage_archive: None,
            reference_codes: "ocl_icd10_codes.txt".into(),
            codelist_catalog: "rsi-codelists-analysis.json".into(),
            ehrql_signatures: "ehrql_codelists.json".into(),
            codelist_cache: "codelist_cache".into(),
            usage_archive_url: "https://jobs.opensafely.org/opensafely-internal/tpp-code-counts/outputs/latest/download/".into(),
            codelist_base_url: "https://www.opencodelists.org/codelist".into(),
            user_agent: "opensafely/tpp-code-counts/1.0".into(),
            report_year: FinancialYear::starting(2024),
            fetch: FetchConfig::default(),
            reference: ReferenceChecks::default(),
            policy: PrefixPolicy::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            delay_ms: 2000,
            rate_limit_backoff_secs: 60,
            codelist_timeout_secs: 30,
            archive_timeout_secs: 20,
        }
    }
}

impl FetchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_backoff_secs)
    }

    pub fn codelist_timeout(&self) -> Duration {
        Duration::from_secs(self.codelist_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Config> {
            let text = fs::read_to_string(path)?;
            Config::from_toml(&text)
        }

        let path = path.as_ref();
        inner(path).with_context(|| format!("loading config from \"{}\"", path.display()))
    }

    /// Load the config at `path` if given, otherwise use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn reference_codes_path(&self) -> PathBuf {
        self.data_dir.join(&self.reference_codes)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(&self.codelist_catalog)
    }

    pub fn signatures_path(&self) -> PathBuf {
        self.data_dir.join(&self.ehrql_signatures)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join(&self.codelist_cache)
    }

    pub fn combined_usage_path(&self, source: DataSource) -> PathBuf {
        self.output_dir
            .join(format!("code_usage_combined_{}.csv", source.name()))
    }

    pub fn coverage_report_path(&self, source: DataSource) -> PathBuf {
        self.output_dir
            .join(format!("codelist_coverage_detail_{}.csv", source.name()))
    }

    /// Hospital data is the main subject of the prefix matching outputs, so only other sources
    /// get a suffix.
    fn prefix_matching_path(&self, stem: &str, source: DataSource) -> PathBuf {
        match source {
            DataSource::Apcs => self.output_dir.join(format!("{}.csv", stem)),
            other => self.output_dir.join(format!("{}_{}.csv", stem, other.name())),
        }
    }

    pub fn scenarios_path(&self, source: DataSource) -> PathBuf {
        self.prefix_matching_path("prefix_matching_analysis", source)
    }

    pub fn consumers_path(&self, source: DataSource) -> PathBuf {
        self.prefix_matching_path("prefix_matching_repos", source)
    }

    pub fn usage_scenarios_path(&self) -> PathBuf {
        self.output_dir.join("prefix_matching_usage_scenarios.csv")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config() {
        let config = Config::from_toml(
            r#"
            data_dir = "/data"
            report_year = "2023-24"

            [fetch]
            delay_ms = 0

            [reference]
            min_codes = 10

            [policy]
            padded_len = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.report_year.to_string(), "2023-24");
        assert_eq!(config.fetch.delay(), Duration::ZERO);
        assert_eq!(config.fetch.rate_limit_backoff_secs, 60);
        assert_eq!(config.reference.min_codes, 10);
        assert_eq!(config.reference.sentinels.len(), 7);
        assert_eq!(config.policy.category_len, 3);
        assert_eq!(config.policy.padded_len, 5);
        assert_eq!(
            config.reference_codes_path(),
            PathBuf::from("/data/ocl_icd10_codes.txt")
        );
        assert_eq!(
            config.coverage_report_path(DataSource::OnsDeaths),
            PathBuf::from("reporting/outputs/codelist_coverage_detail_ons_deaths.csv")
        );
        assert_eq!(
            config.scenarios_path(DataSource::Apcs),
            PathBuf::from("reporting/outputs/prefix_matching_analysis.csv")
        );
        assert_eq!(
            config.consumers_path(DataSource::OnsDeaths),
            PathBuf::from("reporting/outputs/prefix_matching_repos_ons_deaths.csv")
        );
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(Config::from_toml("data_dri = \"x\"").is_err());
        assert!(Config::from_toml("report_year = \"2024-26\"").is_err());
    }
}
