use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "licitar.toml";

/// How artifact files are named inside `pages_html/` and `pages_png/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactNaming {
    /// `{n}.html` / `{n}.png`, n = 1-based fetch order. Re-runs overwrite.
    Index,
    /// `{run_stamp}-{md5(url)}`, unique per run and URL.
    UrlHash,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub root_url: String,
    pub listing_link_text: String,
    pub pager_selector: String,
    pub pager_skip_labels: Vec<String>,
    pub detail_path_prefix: String,

    pub base_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub db_path: PathBuf,
    pub journal_dir: PathBuf,
    pub fallback_journal: bool,

    pub discovery_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub settle_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,

    pub artifact_naming: ArtifactNaming,
    pub chrome_executable: Option<PathBuf>,
    pub remote_debugging_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            root_url: "https://obraspublicas.corrientes.gob.ar/".into(),
            listing_link_text: "Licitaciones".into(),
            pager_selector: ".pagination a".into(),
            pager_skip_labels: vec!["Siguiente".into(), "Último".into()],
            detail_path_prefix: "/noticia/".into(),
            base_dir: PathBuf::from("."),
            docs_dir: PathBuf::from("docs"),
            db_path: PathBuf::from("db/licitar.db"),
            journal_dir: PathBuf::from("db"),
            fallback_journal: false,
            discovery_timeout_secs: 60,
            fetch_timeout_secs: 30,
            settle_ms: 500,
            max_retries: 3,
            base_backoff_ms: 2000,
            artifact_naming: ArtifactNaming::Index,
            chrome_executable: None,
            remote_debugging_url: None,
        }
    }
}

impl Settings {
    /// Defaults, then `licitar.toml` (or `path`), then `LICITAR_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("LICITAR")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pager_skip_labels"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn db_file(&self) -> PathBuf {
        self.base_dir.join(&self.db_path)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.base_dir.join(&self.journal_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_target_site() {
        let s = Settings::default();
        assert_eq!(s.root_url, "https://obraspublicas.corrientes.gob.ar/");
        assert_eq!(s.detail_path_prefix, "/noticia/");
        assert_eq!(s.artifact_naming, ArtifactNaming::Index);
        assert_eq!(s.fetch_timeout(), Duration::from_secs(30));
        assert!(!s.fallback_journal);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "db_path = \"out/test.db\"\nartifact_naming = \"url-hash\"\nmax_retries = 1\n",
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.db_path, PathBuf::from("out/test.db"));
        assert_eq!(s.artifact_naming, ArtifactNaming::UrlHash);
        assert_eq!(s.max_retries, 1);
        // untouched keys keep their defaults
        assert_eq!(s.listing_link_text, "Licitaciones");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
