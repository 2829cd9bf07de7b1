use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Open (creating if needed) the store for writing.
pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Open an existing store for reporting. A missing file is an error.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        bail!("Database not found: {:?}. Run 'init' first.", path);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open {:?}", path))?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            other => bail!("unknown run status {:?}", other),
        }
    }
}

// ── Writes ──

pub fn insert_run(conn: &Connection, started_at: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO runs (started_at, status) VALUES (?1, ?2)",
        params![started_at, RunStatus::Running.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct RunDetailRow<'a> {
    pub run_id: i64,
    pub url_principal: &'a str,
    pub numero_paginas: u32,
    pub total_licitaciones: usize,
    pub urls_paginas: &'a [String],
}

pub fn insert_run_details(conn: &Connection, row: &RunDetailRow) -> Result<()> {
    conn.execute(
        "INSERT INTO run_details (run_id, url_principal, numero_paginas, total_licitaciones, urls_paginas)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.run_id,
            row.url_principal,
            row.numero_paginas,
            row.total_licitaciones as i64,
            serde_json::to_string(row.urls_paginas)?,
        ],
    )?;
    Ok(())
}

pub fn insert_licitacion(
    conn: &Connection,
    run_id: i64,
    url: &str,
    title: Option<&str>,
    scraped_at: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO licitaciones (run_id, url, title, scraped_at) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, url, title, scraped_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct ArtifactRow<'a> {
    pub licitacion_id: i64,
    pub path_relativo: &'a str,
    pub path_absoluto: &'a str,
    pub tamano_bytes: u64,
}

pub fn insert_html_file(conn: &Connection, row: &ArtifactRow, hash_md5: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO archivos_html (licitacion_id, path_relativo, path_absoluto, tamano_bytes, hash_md5)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.licitacion_id,
            row.path_relativo,
            row.path_absoluto,
            row.tamano_bytes as i64,
            hash_md5,
        ],
    )?;
    Ok(())
}

pub fn insert_png_file(conn: &Connection, row: &ArtifactRow) -> Result<()> {
    conn.execute(
        "INSERT INTO archivos_png (licitacion_id, path_relativo, path_absoluto, tamano_bytes)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            row.licitacion_id,
            row.path_relativo,
            row.path_absoluto,
            row.tamano_bytes as i64,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMetrics {
    pub paginas_procesadas: usize,
    pub paginas_exitosas: usize,
    pub paginas_con_error: usize,
    pub archivos_html_creados: usize,
    pub archivos_png_creados: usize,
    /// URLs discovered but dropped by the fetch stage.
    pub paginas_descartadas: usize,
}

pub fn insert_metrics(conn: &Connection, run_id: i64, m: &RunMetrics) -> Result<()> {
    conn.execute(
        "INSERT INTO metricas_ejecucion
         (run_id, paginas_procesadas, paginas_exitosas, paginas_con_error,
          archivos_html_creados, archivos_png_creados, paginas_descartadas)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            m.paginas_procesadas as i64,
            m.paginas_exitosas as i64,
            m.paginas_con_error as i64,
            m.archivos_html_creados as i64,
            m.archivos_png_creados as i64,
            m.paginas_descartadas as i64,
        ],
    )?;
    Ok(())
}

pub fn insert_scraping_error(
    conn: &Connection,
    run_id: i64,
    url: &str,
    stage: &str,
    message: &str,
    occurred_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO scraping_errors (run_id, url, stage, message, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, url, stage, message, occurred_at],
    )?;
    Ok(())
}

pub fn finish_run(
    conn: &Connection,
    run_id: i64,
    finished_at: &str,
    total_pages: usize,
    execution_time_seconds: f64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE runs
         SET finished_at = ?2, status = ?3, total_pages = ?4, execution_time_seconds = ?5
         WHERE id = ?1",
        params![
            run_id,
            finished_at,
            RunStatus::Completed.as_str(),
            total_pages as i64,
            execution_time_seconds,
        ],
    )?;
    if updated != 1 {
        bail!("run {} not found", run_id);
    }
    Ok(())
}

// ── Reads ──

pub struct Stats {
    pub runs: usize,
    pub completed_runs: usize,
    pub licitaciones: usize,
    pub html_files: usize,
    pub png_files: usize,
    pub errors: usize,
    pub timing: Option<TimingStats>,
}

pub struct TimingStats {
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let timing = conn.query_row(
        "SELECT AVG(execution_time_seconds), MIN(execution_time_seconds), MAX(execution_time_seconds)
         FROM runs
         WHERE status = 'completed' AND execution_time_seconds > 0",
        [],
        |r| {
            let avg: Option<f64> = r.get(0)?;
            let min: Option<f64> = r.get(1)?;
            let max: Option<f64> = r.get(2)?;
            Ok(match (avg, min, max) {
                (Some(avg_secs), Some(min_secs), Some(max_secs)) => Some(TimingStats {
                    avg_secs,
                    min_secs,
                    max_secs,
                }),
                _ => None,
            })
        },
    )?;

    Ok(Stats {
        runs: count("SELECT COUNT(*) FROM runs")?,
        completed_runs: count("SELECT COUNT(*) FROM runs WHERE status = 'completed'")?,
        licitaciones: count("SELECT COUNT(*) FROM licitaciones")?,
        html_files: count("SELECT COUNT(*) FROM archivos_html")?,
        png_files: count("SELECT COUNT(*) FROM archivos_png")?,
        errors: count("SELECT COUNT(*) FROM scraping_errors")?,
        timing,
    })
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub total_pages: i64,
    pub execution_time_seconds: Option<f64>,
}

const RUN_COLUMNS: &str =
    "id, started_at, finished_at, status, total_pages, execution_time_seconds";

fn run_from_row(row: &rusqlite::Row) -> rusqlite::Result<RunRow> {
    let status: String = row.get(3)?;
    Ok(RunRow {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: status.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?,
        total_pages: row.get(4)?,
        execution_time_seconds: row.get(5)?,
    })
}

pub fn fetch_recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let sql = format!(
        "SELECT {} FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
        RUN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit as i64], run_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct LicitacionRow {
    pub id: i64,
    pub run_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub scraped_at: String,
}

pub fn fetch_recent_licitaciones(conn: &Connection, limit: usize) -> Result<Vec<LicitacionRow>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, r.id, l.url, l.title, l.scraped_at
         FROM licitaciones l
         JOIN runs r ON l.run_id = r.id
         ORDER BY l.scraped_at DESC, l.id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(LicitacionRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                url: row.get(2)?,
                title: row.get(3)?,
                scraped_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct RunDetail {
    pub url_principal: String,
    pub numero_paginas: i64,
    pub total_licitaciones: i64,
    pub urls_paginas: Vec<String>,
}

pub struct LastRun {
    pub run: RunRow,
    pub detail: Option<RunDetail>,
    pub metrics: Option<RunMetrics>,
}

pub fn fetch_last_run(conn: &Connection) -> Result<Option<LastRun>> {
    let sql = format!(
        "SELECT {} FROM runs ORDER BY started_at DESC, id DESC LIMIT 1",
        RUN_COLUMNS
    );
    let Some(run) = conn.query_row(&sql, [], run_from_row).optional()? else {
        return Ok(None);
    };

    let detail = conn
        .query_row(
            "SELECT url_principal, numero_paginas, total_licitaciones, urls_paginas
             FROM run_details WHERE run_id = ?1",
            [run.id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?
        .map(|(url_principal, numero_paginas, total_licitaciones, urls)| {
            Ok::<_, anyhow::Error>(RunDetail {
                url_principal,
                numero_paginas,
                total_licitaciones,
                urls_paginas: serde_json::from_str(&urls).context("run_details.urls_paginas")?,
            })
        })
        .transpose()?;

    let metrics = conn
        .query_row(
            "SELECT paginas_procesadas, paginas_exitosas, paginas_con_error,
                    archivos_html_creados, archivos_png_creados, paginas_descartadas
             FROM metricas_ejecucion WHERE run_id = ?1",
            [run.id],
            |r| {
                Ok(RunMetrics {
                    paginas_procesadas: r.get(0)?,
                    paginas_exitosas: r.get(1)?,
                    paginas_con_error: r.get(2)?,
                    archivos_html_creados: r.get(3)?,
                    archivos_png_creados: r.get(4)?,
                    paginas_descartadas: r.get(5)?,
                })
            },
        )
        .optional()?;

    Ok(Some(LastRun {
        run,
        detail,
        metrics,
    }))
}

// ── Schema inspection ──

pub struct SchemaReport {
    pub tables: Vec<String>,
    pub views: Vec<String>,
    pub indexes: Vec<String>,
    pub integrity: String,
    pub foreign_keys: bool,
    pub sqlite_version: String,
}

pub fn inspect_schema(conn: &Connection) -> Result<SchemaReport> {
    let names = |kind: &str| -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = ?1 AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map([kind], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    };

    Ok(SchemaReport {
        tables: names("table")?,
        views: names("view")?,
        indexes: names("index")?,
        integrity: conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?,
        foreign_keys: conn.query_row("PRAGMA foreign_keys", [], |r| r.get::<_, i64>(0))? == 1,
        sqlite_version: conn.query_row("SELECT sqlite_version()", [], |r| r.get(0))?,
    })
}
