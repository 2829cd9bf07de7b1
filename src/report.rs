//! Read-only reports over the store, rendered to plain text.

use chrono::DateTime;

use crate::db::{LastRun, LicitacionRow, RunRow, Stats};

const URL_WIDTH: usize = 65;

/// `YYYY-MM-DD HH:MM:SS` for an RFC 3339 timestamp; the first 19 chars otherwise.
pub fn short_time(ts: &str) -> String {
    match DateTime::parse_from_rfc3339(ts) {
        Ok(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) if ts.is_empty() => "N/A".into(),
        Err(_) => ts.chars().take(19).collect(),
    }
}

/// Cut to `max` chars and append `...`, leaving strings within `max + 3` alone.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max + 3 {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn secs(v: Option<f64>) -> String {
    v.map(|s| format!("{:.1}s", s)).unwrap_or_else(|| "N/A".into())
}

pub fn stats(s: &Stats) -> String {
    let mut lines = vec!["Statistics".to_string(), "=".repeat(50)];
    for (label, n) in [
        ("Runs", s.runs),
        ("Completed runs", s.completed_runs),
        ("Licitaciones", s.licitaciones),
        ("HTML files", s.html_files),
        ("PNG files", s.png_files),
        ("Recorded errors", s.errors),
    ] {
        lines.push(format!("{:.<30} {:>6}", label, n));
    }
    if let Some(t) = &s.timing {
        lines.push(String::new());
        lines.push("Execution time".into());
        lines.push(format!("  Average: {:.1}s", t.avg_secs));
        lines.push(format!("  Min:     {:.1}s", t.min_secs));
        lines.push(format!("  Max:     {:.1}s", t.max_secs));
    }
    lines.join("\n")
}

pub fn runs(rows: &[RunRow], limit: usize) -> String {
    let mut lines = vec![format!("Last {} runs", limit), "=".repeat(58)];
    if rows.is_empty() {
        lines.push("No runs recorded.".into());
        return lines.join("\n");
    }
    lines.push(format!(
        "{:<5} {:<20} {:<10} {:>6} {:>10}",
        "ID", "Started", "Status", "Pages", "Time"
    ));
    lines.push("-".repeat(58));
    for r in rows {
        lines.push(format!(
            "{:<5} {:<20} {:<10} {:>6} {:>10}",
            r.id,
            short_time(&r.started_at),
            r.status,
            r.total_pages,
            secs(r.execution_time_seconds)
        ));
    }
    lines.join("\n")
}

pub fn licitaciones(rows: &[LicitacionRow], limit: usize) -> String {
    let mut lines = vec![format!("Last {} licitaciones", limit), "=".repeat(100)];
    if rows.is_empty() {
        lines.push("No licitaciones recorded.".into());
        return lines.join("\n");
    }
    lines.push(format!("{:<5} {:<5} {:<20} {}", "ID", "Run", "Scraped", "URL"));
    lines.push("-".repeat(100));
    for r in rows {
        lines.push(format!(
            "{:<5} {:<5} {:<20} {}",
            r.id,
            r.run_id,
            short_time(&r.scraped_at),
            truncate(&r.url, URL_WIDTH)
        ));
    }
    lines.join("\n")
}

pub fn last(last: Option<&LastRun>) -> String {
    let mut lines = vec!["Last run".to_string(), "=".repeat(50)];
    let Some(last) = last else {
        lines.push("No runs recorded.".into());
        return lines.join("\n");
    };

    let r = &last.run;
    lines.push(format!("Run:      {}", r.id));
    lines.push(format!("Status:   {}", r.status));
    lines.push(format!("Started:  {}", r.started_at));
    lines.push(format!(
        "Finished: {}",
        r.finished_at.as_deref().unwrap_or("in progress")
    ));
    lines.push(format!("Pages:    {}", r.total_pages));
    lines.push(format!("Time:     {}", secs(r.execution_time_seconds)));

    if let Some(d) = &last.detail {
        lines.push(String::new());
        lines.push("Details".into());
        lines.push(format!("  Listing URL:   {}", d.url_principal));
        lines.push(format!("  Listing pages: {}", d.numero_paginas));
        lines.push(format!("  Links found:   {}", d.total_licitaciones));
        for url in &d.urls_paginas {
            lines.push(format!("    {}", url));
        }
    }

    if let Some(m) = &last.metrics {
        lines.push(String::new());
        lines.push("Metrics".into());
        lines.push(format!("  Processed:  {}", m.paginas_procesadas));
        lines.push(format!("  Succeeded:  {}", m.paginas_exitosas));
        lines.push(format!("  Failed:     {}", m.paginas_con_error));
        lines.push(format!("  Discarded:  {}", m.paginas_descartadas));
        lines.push(format!("  HTML files: {}", m.archivos_html_creados));
        lines.push(format!("  PNG files:  {}", m.archivos_png_creados));
    }
    lines.join("\n")
}
