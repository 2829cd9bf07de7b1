//! Append-only JSONL journal, one file per table.
//!
//! Only used when the relational store is unavailable and
//! `fallback_journal` is on. Ids are derived by scanning each file for its
//! highest `id`, so a single writer is assumed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::RunStatus;
use crate::discovery::Discovery;
use crate::persist::{finish_time, inspect_artifact, metrics_for, timestamp, RunInput, RunReport};

pub const RUNS: &str = "runs.jsonl";
pub const RUN_DETAILS: &str = "run_details.jsonl";
pub const LICITACIONES: &str = "licitaciones.jsonl";
pub const ARCHIVOS_HTML: &str = "archivos_html.jsonl";
pub const ARCHIVOS_PNG: &str = "archivos_png.jsonl";
pub const METRICAS: &str = "metricas_ejecucion.jsonl";

#[derive(Serialize)]
struct RunRecord<'a> {
    id: i64,
    started_at: &'a str,
    finished_at: Option<&'a str>,
    status: &'a str,
    total_pages: usize,
    execution_time_seconds: Option<f64>,
}

#[derive(Serialize)]
struct RunDetailRecord<'a> {
    id: i64,
    run_id: i64,
    details: &'a Discovery,
}

#[derive(Serialize)]
struct LicitacionRecord<'a> {
    id: i64,
    run_id: i64,
    url: &'a str,
    title: Option<&'a str>,
    scraped_at: &'a str,
}

#[derive(Serialize)]
struct ArtifactRecord<'a> {
    id: i64,
    licitacion_id: i64,
    path_relativo: &'a str,
    path_absoluto: &'a str,
    tamano_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash_md5: Option<&'a str>,
}

#[derive(Serialize)]
struct MetricsRecord {
    id: i64,
    run_id: i64,
    paginas_procesadas: usize,
    paginas_exitosas: usize,
    paginas_con_error: usize,
    archivos_html_creados: usize,
    archivos_png_creados: usize,
    paginas_descartadas: usize,
}

/// One past the highest `id` in `path`; 1 for a missing or empty file.
/// Lines that are not JSON objects with an integer `id` are skipped.
pub fn next_id(path: &Path) -> Result<i64> {
    if !path.exists() {
        return Ok(1);
    }
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut max_id = 0;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(v) => {
                if let Some(id) = v.get("id").and_then(Value::as_i64) {
                    max_id = max_id.max(id);
                }
            }
            Err(e) => warn!("Skipping malformed line {} of {:?}: {}", n + 1, path, e),
        }
    }
    Ok(max_id + 1)
}

fn append<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

/// Rewrite the `runs` record `run_id` in place with its final state.
/// Every other line, malformed ones included, is copied through as is.
fn finish_run(path: &Path, run_id: i64, finished_at: &str, total_pages: usize, secs: f64) -> Result<()> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let tmp = path.with_extension("jsonl.tmp");
    let mut found = false;
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record = serde_json::from_str::<Value>(line)
                .ok()
                .filter(|r| r.get("id").and_then(Value::as_i64) == Some(run_id));
            match record {
                Some(mut record) => {
                    record["finished_at"] = finished_at.into();
                    record["status"] = RunStatus::Completed.as_str().into();
                    record["total_pages"] = total_pages.into();
                    record["execution_time_seconds"] = secs.into();
                    writeln!(out, "{}", record)?;
                    found = true;
                }
                None => writeln!(out, "{}", line)?,
            }
        }
        out.flush()?;
    }
    if !found {
        let _ = fs::remove_file(&tmp);
        bail!("run {} not found in {:?}", run_id, path);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write one run to the journal under `dir`, mirroring the relational rows.
pub fn write_run(dir: &Path, base_dir: &Path, input: &RunInput) -> Result<RunReport> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    let runs = dir.join(RUNS);

    let run_id = next_id(&runs)?;
    let started_at = timestamp(input.started_at);
    append(
        &runs,
        &RunRecord {
            id: run_id,
            started_at: &started_at,
            finished_at: None,
            status: RunStatus::Running.as_str(),
            total_pages: 0,
            execution_time_seconds: None,
        },
    )?;

    let details = dir.join(RUN_DETAILS);
    append(
        &details,
        &RunDetailRecord {
            id: next_id(&details)?,
            run_id,
            details: input.discovery,
        },
    )?;

    let lic_file = dir.join(LICITACIONES);
    let html_file = dir.join(ARCHIVOS_HTML);
    let png_file = dir.join(ARCHIVOS_PNG);
    let mut lic_id = next_id(&lic_file)?;
    let mut html_id = next_id(&html_file)?;
    let mut png_id = next_id(&png_file)?;

    let mut licitacion_ids = Vec::with_capacity(input.pages.len());
    let (mut html_files, mut png_files) = (0, 0);
    for page in input.pages {
        let scraped_at = timestamp(Utc::now());
        append(
            &lic_file,
            &LicitacionRecord {
                id: lic_id,
                run_id,
                url: &page.url,
                title: page.title.as_deref(),
                scraped_at: &scraped_at,
            },
        )?;
        licitacion_ids.push(lic_id);

        if let Some(html) = inspect_artifact(base_dir, &page.html_path, true) {
            append(
                &html_file,
                &ArtifactRecord {
                    id: html_id,
                    licitacion_id: lic_id,
                    path_relativo: &html.relative,
                    path_absoluto: &html.absolute,
                    tamano_bytes: html.size,
                    hash_md5: html.md5.as_deref(),
                },
            )?;
            html_id += 1;
            html_files += 1;
        }
        if let Some(png) = inspect_artifact(base_dir, &page.png_path, false) {
            append(
                &png_file,
                &ArtifactRecord {
                    id: png_id,
                    licitacion_id: lic_id,
                    path_relativo: &png.relative,
                    path_absoluto: &png.absolute,
                    tamano_bytes: png.size,
                    hash_md5: None,
                },
            )?;
            png_id += 1;
            png_files += 1;
        }
        lic_id += 1;
    }

    let metrics = metrics_for(input, licitacion_ids.len(), html_files, png_files);
    let metrics_file = dir.join(METRICAS);
    append(
        &metrics_file,
        &MetricsRecord {
            id: next_id(&metrics_file)?,
            run_id,
            paginas_procesadas: metrics.paginas_procesadas,
            paginas_exitosas: metrics.paginas_exitosas,
            paginas_con_error: metrics.paginas_con_error,
            archivos_html_creados: metrics.archivos_html_creados,
            archivos_png_creados: metrics.archivos_png_creados,
            paginas_descartadas: metrics.paginas_descartadas,
        },
    )?;

    let (finished_at, duration_secs) = finish_time(input.started_at);
    finish_run(&runs, run_id, &timestamp(finished_at), input.pages.len(), duration_secs)?;

    info!("Run {} written to journal {:?}", run_id, dir);
    Ok(RunReport {
        run_id,
        licitacion_ids,
        metrics,
        duration_secs,
        status: RunStatus::Completed,
    })
}
