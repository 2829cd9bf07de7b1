use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use scraper::{Html, Selector};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{ArtifactNaming, Settings};
use crate::render::{render_html, render_screenshot, Renderer, WaitUntil};

pub const HTML_DIR: &str = "pages_html";
pub const PNG_DIR: &str = "pages_png";

pub struct FetchOptions {
    /// Directory relative paths are resolved against.
    pub base_dir: PathBuf,
    /// Artifact root, relative to `base_dir`.
    pub docs_dir: PathBuf,
    pub naming: ArtifactNaming,
    /// Prefix for [`ArtifactNaming::UrlHash`] file names.
    pub run_stamp: String,
    pub timeout: Duration,
    pub deadline: Option<Instant>,
}

impl FetchOptions {
    pub fn from_settings(settings: &Settings, run_stamp: String, deadline: Option<Instant>) -> Self {
        FetchOptions {
            base_dir: settings.base_dir.clone(),
            docs_dir: settings.docs_dir.clone(),
            naming: settings.artifact_naming,
            run_stamp,
            timeout: settings.fetch_timeout(),
            deadline,
        }
    }
}

/// A detail page whose HTML and screenshot were both written.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    /// Relative to the base directory, e.g. `docs/pages_html/3.html`.
    pub html_path: PathBuf,
    pub png_path: PathBuf,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Html,
    Screenshot,
    /// Not attempted: the pipeline deadline had passed.
    Deadline,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Html => "html",
            FailureKind::Screenshot => "screenshot",
            FailureKind::Deadline => "deadline",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub index: usize,
    pub url: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub pages: Vec<FetchedPage>,
    pub failures: Vec<FetchFailure>,
}

/// File name (without extension) for the `index`-th URL.
pub fn artifact_stem(naming: ArtifactNaming, index: usize, url: &str, run_stamp: &str) -> String {
    match naming {
        ArtifactNaming::Index => index.to_string(),
        ArtifactNaming::UrlHash => {
            let digest = format!("{:x}", md5::compute(url.as_bytes()));
            format!("{}-{}", run_stamp, &digest[..16])
        }
    }
}

/// Fetch every URL in order, one browser session per capture.
///
/// Only URLs with both artifacts on disk make it into `pages`; everything
/// else is logged and reported in `failures`.
pub async fn fetch_all<R: Renderer>(
    renderer: &R,
    urls: &[String],
    opts: &FetchOptions,
) -> Result<FetchReport> {
    let html_rel = opts.docs_dir.join(HTML_DIR);
    let png_rel = opts.docs_dir.join(PNG_DIR);
    for dir in [&html_rel, &png_rel] {
        let abs = opts.base_dir.join(dir);
        tokio::fs::create_dir_all(&abs)
            .await
            .with_context(|| format!("Failed to create {:?}", abs))?;
    }

    let total = urls.len();
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut report = FetchReport::default();

    for (i, url) in urls.iter().enumerate() {
        let index = i + 1;

        if opts.deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("Deadline reached; skipping {} remaining page(s)", total - i);
            report
                .failures
                .extend(urls[i..].iter().enumerate().map(|(j, u)| FetchFailure {
                    index: index + j,
                    url: u.clone(),
                    kind: FailureKind::Deadline,
                    message: "pipeline deadline exceeded".into(),
                }));
            break;
        }

        info!("Fetching {}/{}: {}", index, total, url);
        let stem = artifact_stem(opts.naming, index, url, &opts.run_stamp);
        let html_path = html_rel.join(format!("{}.html", stem));
        let png_path = png_rel.join(format!("{}.png", stem));

        // independent captures: a failed HTML grab still attempts the screenshot
        let html = capture_html(renderer, url, &opts.base_dir.join(&html_path), opts.timeout).await;
        let png = capture_png(renderer, url, &opts.base_dir.join(&png_path), opts.timeout).await;

        let (kind, message) = match (html, png) {
            (Ok(title), Ok(())) => {
                report.pages.push(FetchedPage {
                    url: url.clone(),
                    html_path,
                    png_path,
                    title,
                });
                pb.inc(1);
                continue;
            }
            (Err(h), Err(p)) => (FailureKind::Html, format!("{:#}; {:#}", h, p)),
            (Err(h), Ok(())) => (FailureKind::Html, format!("{:#}", h)),
            (Ok(_), Err(p)) => (FailureKind::Screenshot, format!("{:#}", p)),
        };
        warn!("Dropping {} ({} failed): {}", url, kind, message);
        report.failures.push(FetchFailure {
            index,
            url: url.clone(),
            kind,
            message,
        });
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Fetched {} of {} pages ({} dropped)",
        report.pages.len(),
        total,
        report.failures.len()
    );
    Ok(report)
}

async fn capture_html<R: Renderer>(
    renderer: &R,
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<Option<String>> {
    let html = render_html(renderer, url, WaitUntil::DomContentLoaded, timeout).await?;
    tokio::fs::write(dest, html.as_bytes())
        .await
        .with_context(|| format!("Failed to write {:?}", dest))?;
    Ok(page_title(&html))
}

async fn capture_png<R: Renderer>(
    renderer: &R,
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<()> {
    let png = render_screenshot(renderer, url, WaitUntil::DomContentLoaded, timeout).await?;
    tokio::fs::write(dest, &png)
        .await
        .with_context(|| format!("Failed to write {:?}", dest))?;
    Ok(())
}

pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("title").ok()?;
    doc.select(&sel)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}
