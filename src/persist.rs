//! Persistence stage: one run, its pages and their artifacts, committed
//! atomically to SQLite, with the JSONL journal as an opt-in degraded mode.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::db::{self, ArtifactRow, RunDetailRow, RunMetrics, RunStatus};
use crate::discovery::Discovery;
use crate::fetch::{FetchFailure, FetchedPage};
use crate::journal;

/// Everything the stage needs to record one run.
pub struct RunInput<'a> {
    pub discovery: &'a Discovery,
    pub pages: &'a [FetchedPage],
    pub failures: &'a [FetchFailure],
    /// When the pipeline started; becomes `runs.started_at`.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub licitacion_ids: Vec<i64>,
    pub metrics: RunMetrics,
    pub duration_secs: f64,
    pub status: RunStatus,
}

#[derive(Debug)]
pub enum PersistOutcome {
    Committed(RunReport),
    /// Primary store failed; the run went to the journal instead.
    Degraded {
        report: RunReport,
        cause: anyhow::Error,
    },
    Failed(anyhow::Error),
}

pub fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Completion instant, never earlier than one microsecond after `started_at`.
pub(crate) fn finish_time(started_at: DateTime<Utc>) -> (DateTime<Utc>, f64) {
    let finished_at = Utc::now().max(started_at + chrono::Duration::microseconds(1));
    let micros = (finished_at - started_at).num_microseconds().unwrap_or(i64::MAX);
    (finished_at, micros as f64 / 1_000_000.0)
}

/// Size and location of an artifact as found on disk right now.
pub(crate) struct FileMeta {
    pub relative: String,
    pub absolute: String,
    pub size: u64,
    pub md5: Option<String>,
}

pub(crate) fn inspect_artifact(base_dir: &Path, relative: &Path, hash: bool) -> Option<FileMeta> {
    let path = base_dir.join(relative);
    if !path.is_file() {
        warn!("Artifact missing at persist time: {:?}", path);
        return None;
    }
    let (size, md5) = if hash {
        match std::fs::read(&path) {
            Ok(bytes) => (bytes.len() as u64, Some(format!("{:x}", md5::compute(&bytes)))),
            Err(e) => {
                warn!("Cannot read {:?}: {}", path, e);
                return None;
            }
        }
    } else {
        match std::fs::metadata(&path) {
            Ok(m) => (m.len(), None),
            Err(e) => {
                warn!("Cannot stat {:?}: {}", path, e);
                return None;
            }
        }
    };
    let absolute = path.canonicalize().unwrap_or(path);
    Some(FileMeta {
        relative: relative.to_string_lossy().into_owned(),
        absolute: absolute.to_string_lossy().into_owned(),
        size,
        md5,
    })
}

pub(crate) fn metrics_for(
    input: &RunInput,
    created: usize,
    html_files: usize,
    png_files: usize,
) -> RunMetrics {
    let processed = input.pages.len();
    RunMetrics {
        paginas_procesadas: processed,
        paginas_exitosas: created,
        paginas_con_error: processed - created,
        archivos_html_creados: html_files,
        archivos_png_creados: png_files,
        paginas_descartadas: input.failures.len(),
    }
}

/// Record one run in the relational store inside a single transaction.
pub fn persist(db_path: &Path, base_dir: &Path, input: &RunInput) -> Result<RunReport> {
    let conn = db::connect(db_path)?;
    db::init_schema(&conn)?;

    let tx = conn.unchecked_transaction()?;
    let run_id = db::insert_run(&tx, &timestamp(input.started_at))?;

    let d = input.discovery;
    db::insert_run_details(
        &tx,
        &RunDetailRow {
            run_id,
            url_principal: &d.listing_url,
            numero_paginas: d.page_count,
            total_licitaciones: d.total_links,
            urls_paginas: &d.listing_page_urls,
        },
    )
    .context("run_details")?;

    let mut licitacion_ids = Vec::with_capacity(input.pages.len());
    let mut html_files = 0;
    let mut png_files = 0;
    for page in input.pages {
        let scraped_at = timestamp(Utc::now());
        let id = db::insert_licitacion(&tx, run_id, &page.url, page.title.as_deref(), &scraped_at)
            .with_context(|| format!("licitacion {}", page.url))?;
        licitacion_ids.push(id);

        if let Some(html) = inspect_artifact(base_dir, &page.html_path, true) {
            let row = ArtifactRow {
                licitacion_id: id,
                path_relativo: &html.relative,
                path_absoluto: &html.absolute,
                tamano_bytes: html.size,
            };
            db::insert_html_file(&tx, &row, html.md5.as_deref().unwrap_or_default())?;
            html_files += 1;
        }
        if let Some(png) = inspect_artifact(base_dir, &page.png_path, false) {
            let row = ArtifactRow {
                licitacion_id: id,
                path_relativo: &png.relative,
                path_absoluto: &png.absolute,
                tamano_bytes: png.size,
            };
            db::insert_png_file(&tx, &row)?;
            png_files += 1;
        }
    }

    for f in input.failures {
        let at = timestamp(Utc::now());
        db::insert_scraping_error(&tx, run_id, &f.url, f.kind.as_str(), &f.message, &at)?;
    }

    let metrics = metrics_for(input, licitacion_ids.len(), html_files, png_files);
    db::insert_metrics(&tx, run_id, &metrics).context("metricas_ejecucion")?;

    let (finished_at, duration_secs) = finish_time(input.started_at);
    db::finish_run(
        &tx,
        run_id,
        &timestamp(finished_at),
        input.pages.len(),
        duration_secs,
    )?;
    tx.commit()?;

    info!(
        "Run {} committed: {} licitaciones, {} html, {} png in {:.1}s",
        run_id,
        licitacion_ids.len(),
        html_files,
        png_files,
        duration_secs
    );
    Ok(RunReport {
        run_id,
        licitacion_ids,
        metrics,
        duration_secs,
        status: RunStatus::Completed,
    })
}

/// Try the relational store; on failure, write the journal if enabled.
pub fn persist_with_fallback(settings: &Settings, input: &RunInput) -> PersistOutcome {
    let cause = match persist(&settings.db_file(), &settings.base_dir, input) {
        Ok(report) => return PersistOutcome::Committed(report),
        Err(e) => e,
    };
    error!("Persisting run failed: {:#}", cause);
    if !settings.fallback_journal {
        return PersistOutcome::Failed(cause);
    }

    let dir = settings.journal_path();
    warn!("Writing run to fallback journal in {:?}", dir);
    match journal::write_run(&dir, &settings.base_dir, input) {
        Ok(report) => PersistOutcome::Degraded { report, cause },
        Err(j) => PersistOutcome::Failed(cause.context(format!("journal fallback failed: {:#}", j))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use rusqlite::Connection;

    use super::*;
    use crate::config::ArtifactNaming;
    use crate::fetch::{fetch_all, FetchOptions};
    use crate::render::testing::FakeRenderer;

    pub(crate) fn discovery_for(urls: &[String]) -> Discovery {
        Discovery {
            listing_url: "https://obras.example.gob.ar/home/licitaciones--5/categorias".into(),
            page_count: 1,
            listing_page_urls: vec![
                "https://obras.example.gob.ar/home/licitaciones--5/categorias".into(),
            ],
            per_page_links: BTreeMap::from([(1, urls.to_vec())]),
            total_links: urls.len(),
        }
    }

    pub(crate) fn urls(n: usize) -> Vec<String> {
        (1..=n)
            .map(|i| format!("https://obras.example.gob.ar/noticia/lp-{}", i))
            .collect()
    }

    /// Run the fetch stage against canned pages, optionally timing out some.
    pub(crate) async fn fetched(base: &Path, list: &[String], timeouts: &[usize]) -> crate::fetch::FetchReport {
        let mut r = list.iter().fold(FakeRenderer::new(), |r, u| {
            r.page(u, &format!("<html><head><title>T {}</title></head></html>", u))
        });
        for &i in timeouts {
            r = r.timeout(&list[i]);
        }
        let opts = FetchOptions {
            base_dir: base.to_path_buf(),
            docs_dir: PathBuf::from("docs"),
            naming: ArtifactNaming::Index,
            run_stamp: "stamp".into(),
            timeout: Duration::from_secs(30),
            deadline: None,
        };
        fetch_all(&r, list, &opts).await.unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[tokio::test]
    async fn timed_out_page_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(3);
        let report = fetched(dir.path(), &list, &[1]).await;
        assert_eq!(report.pages.len(), 2);

        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };
        let db_path = dir.path().join("db/licitar.db");
        let out = persist(&db_path, dir.path(), &input).unwrap();

        assert_eq!(out.licitacion_ids.len(), 2);
        assert_eq!(out.metrics.paginas_procesadas, 2);
        assert_eq!(
            out.metrics.paginas_exitosas + out.metrics.paginas_con_error,
            out.metrics.paginas_procesadas
        );
        assert_eq!(out.metrics.archivos_html_creados, 2);
        assert_eq!(out.metrics.archivos_png_creados, 2);
        assert_eq!(out.metrics.paginas_descartadas, 1);
        assert_eq!(out.status, RunStatus::Completed);

        let conn = db::connect(&db_path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM licitaciones"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM scraping_errors WHERE stage = 'html'"), 1);
        assert_eq!(count(&conn, "SELECT total_pages FROM runs"), 2);
        let title: String = conn
            .query_row("SELECT title FROM licitaciones ORDER BY id LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, format!("T {}", list[0]));
    }

    #[tokio::test]
    async fn completed_run_timestamps_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(1);
        let report = fetched(dir.path(), &list, &[]).await;
        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };
        let db_path = dir.path().join("licitar.db");
        let out = persist(&db_path, dir.path(), &input).unwrap();
        assert!(out.duration_secs > 0.0);

        let conn = db::connect(&db_path).unwrap();
        let (started, finished, status): (String, String, String) = conn
            .query_row("SELECT started_at, finished_at, status FROM runs", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert!(finished > started);
        assert_eq!(status, "completed");
        let urls_json: String = conn
            .query_row("SELECT urls_paginas FROM run_details", [], |r| r.get(0))
            .unwrap();
        let urls: Vec<String> = serde_json::from_str(&urls_json).unwrap();
        assert_eq!(urls, d.listing_page_urls);
    }

    #[tokio::test]
    async fn repeated_runs_never_merge() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(2);
        let report = fetched(dir.path(), &list, &[]).await;
        let d = discovery_for(&list);
        let db_path = dir.path().join("licitar.db");

        let mut runs = Vec::new();
        for _ in 0..2 {
            let input = RunInput {
                discovery: &d,
                pages: &report.pages,
                failures: &report.failures,
                started_at: Utc::now(),
            };
            runs.push(persist(&db_path, dir.path(), &input).unwrap());
        }

        assert!(runs[1].run_id > runs[0].run_id);
        assert!(runs[0]
            .licitacion_ids
            .iter()
            .all(|id| !runs[1].licitacion_ids.contains(id)));
        let conn = db::connect(&db_path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM runs"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM licitaciones"), 4);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM archivos_html"), 4);
    }

    #[tokio::test]
    async fn artifacts_follow_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(2);
        let report = fetched(dir.path(), &list, &[]).await;
        // cleaned between fetch and persist
        std::fs::remove_file(dir.path().join(&report.pages[0].png_path)).unwrap();

        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };
        let db_path = dir.path().join("licitar.db");
        let out = persist(&db_path, dir.path(), &input).unwrap();
        assert_eq!(out.metrics.archivos_html_creados, 2);
        assert_eq!(out.metrics.archivos_png_creados, 1);

        let conn = db::connect(&db_path).unwrap();
        let first = out.licitacion_ids[0];
        let pngs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM archivos_png WHERE licitacion_id = ?1",
                [first],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pngs, 0);

        let (rel, size, hash): (String, i64, String) = conn
            .query_row(
                "SELECT path_relativo, tamano_bytes, hash_md5 FROM archivos_html WHERE licitacion_id = ?1",
                [first],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        let bytes = std::fs::read(dir.path().join(&rel)).unwrap();
        assert_eq!(rel, "docs/pages_html/1.html");
        assert_eq!(size as usize, bytes.len());
        assert_eq!(hash, format!("{:x}", md5::compute(&bytes)));
    }

    #[tokio::test]
    async fn failed_step_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(2);
        let report = fetched(dir.path(), &list, &[]).await;
        let db_path = dir.path().join("licitar.db");
        {
            let conn = db::connect(&db_path).unwrap();
            db::init_schema(&conn).unwrap();
            conn.execute_batch(
                "CREATE TRIGGER no_metrics BEFORE INSERT ON metricas_ejecucion
                 BEGIN SELECT RAISE(ABORT, 'disk says no'); END;",
            )
            .unwrap();
        }

        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };
        let err = persist(&db_path, dir.path(), &input).unwrap_err();
        assert!(format!("{:#}", err).contains("disk says no"));

        let conn = db::connect(&db_path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM runs"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM licitaciones"), 0);
    }

    fn broken_store_settings(base: &Path, fallback: bool) -> Settings {
        // a directory where the database file should be
        std::fs::create_dir_all(base.join("db/licitar.db")).unwrap();
        Settings {
            base_dir: base.to_path_buf(),
            fallback_journal: fallback,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn fallback_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(1);
        let report = fetched(dir.path(), &list, &[]).await;
        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };

        let settings = broken_store_settings(dir.path(), false);
        assert!(matches!(
            persist_with_fallback(&settings, &input),
            PersistOutcome::Failed(_)
        ));
        assert!(!dir.path().join("db/runs.jsonl").exists());

        let settings = broken_store_settings(dir.path(), true);
        match persist_with_fallback(&settings, &input) {
            PersistOutcome::Degraded { report, .. } => {
                assert_eq!(report.run_id, 1);
                assert_eq!(report.licitacion_ids, vec![1]);
            }
            other => panic!("expected degraded write, got {:?}", other),
        }
        assert!(dir.path().join("db/runs.jsonl").exists());
    }

    #[tokio::test]
    async fn healthy_store_commits() {
        let dir = tempfile::tempdir().unwrap();
        let list = urls(1);
        let report = fetched(dir.path(), &list, &[]).await;
        let d = discovery_for(&list);
        let input = RunInput {
            discovery: &d,
            pages: &report.pages,
            failures: &report.failures,
            started_at: Utc::now(),
        };
        let settings = Settings {
            base_dir: dir.path().to_path_buf(),
            fallback_journal: true,
            ..Settings::default()
        };
        assert!(matches!(
            persist_with_fallback(&settings, &input),
            PersistOutcome::Committed(_)
        ));
        assert!(!dir.path().join("db/runs.jsonl").exists());
    }
}
