use std::collections::BTreeMap;
use std::time::Duration;

use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::config::Settings;
use crate::error::{DiscoveryError, RenderError};
use crate::render::{render_html, Renderer, WaitUntil};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Knobs for the discovery stage, lifted from [`Settings`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub root_url: String,
    pub listing_link_text: String,
    pub pager_selector: String,
    pub pager_skip_labels: Vec<String>,
    pub detail_path_prefix: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl DiscoveryOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        DiscoveryOptions {
            root_url: settings.root_url.clone(),
            listing_link_text: settings.listing_link_text.clone(),
            pager_selector: settings.pager_selector.clone(),
            pager_skip_labels: settings.pager_skip_labels.clone(),
            detail_path_prefix: settings.detail_path_prefix.clone(),
            timeout: settings.discovery_timeout(),
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
        }
    }
}

/// Everything found while walking the tender listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discovery {
    #[serde(rename = "urlPrincipal")]
    pub listing_url: String,
    #[serde(rename = "numeroPaginas")]
    pub page_count: u32,
    #[serde(rename = "urlsPaginas")]
    pub listing_page_urls: Vec<String>,
    /// 1-based listing page -> detail URLs in first-seen order.
    #[serde(rename = "licitaciones")]
    pub per_page_links: BTreeMap<u32, Vec<String>>,
    #[serde(rename = "totalLicitaciones")]
    pub total_links: usize,
}

impl Discovery {
    /// Detail URLs of all listing pages, page by page.
    pub fn all_links(&self) -> Vec<String> {
        self.per_page_links.values().flatten().cloned().collect()
    }
}

pub async fn discover<R: Renderer>(
    renderer: &R,
    opts: &DiscoveryOptions,
) -> Result<Discovery, DiscoveryError> {
    let root = parse_url(&opts.root_url)?;

    info!("Looking for {:?} on {}", opts.listing_link_text, root);
    let home = load(renderer, root.as_str(), opts).await?;
    let href = find_link_by_text(&home, &opts.listing_link_text).ok_or_else(|| {
        DiscoveryError::ListingLinkMissing {
            url: root.to_string(),
            text: opts.listing_link_text.clone(),
        }
    })?;
    let listing_url = resolve(&root, &href)?;

    let first = load(renderer, &listing_url, opts).await?;
    let page_count = parse_page_count(&first, &opts.pager_selector, &opts.pager_skip_labels)?;
    let listing_page_urls = listing_page_urls(&listing_url, page_count);
    info!("Listing {} has {} page(s)", listing_url, page_count);

    let origin = parse_url(&listing_url)?;
    let mut per_page_links = BTreeMap::new();
    let mut total_links = 0;
    for (i, page_url) in listing_page_urls.iter().enumerate() {
        // page 1 was already rendered for the pager
        let html = if i == 0 {
            first.clone()
        } else {
            load(renderer, page_url, opts).await?
        };
        let links = extract_detail_links(&html, &origin, &opts.detail_path_prefix)?;
        info!("Page {}/{}: {} tender link(s)", i + 1, page_count, links.len());
        total_links += links.len();
        per_page_links.insert(i as u32 + 1, links);
    }

    Ok(Discovery {
        listing_url,
        page_count,
        listing_page_urls,
        per_page_links,
        total_links,
    })
}

/// Render `url` with bounded retries, exponential backoff between attempts.
async fn load<R: Renderer>(
    renderer: &R,
    url: &str,
    opts: &DiscoveryOptions,
) -> Result<String, DiscoveryError> {
    let mut attempt = 0;
    loop {
        match render_html(renderer, url, WaitUntil::NetworkIdle, opts.timeout).await {
            Ok(html) => return Ok(html),
            Err(e) if attempt < opts.max_retries && retryable(&e) => {
                let backoff = backoff_for(opts.base_backoff, attempt);
                warn!(
                    "Loading {} failed (attempt {}/{}): {}; retrying in {:.1}s",
                    url,
                    attempt + 1,
                    opts.max_retries.saturating_add(1),
                    e,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(DiscoveryError::Render {
                    url: url.to_string(),
                    attempts: attempt.saturating_add(1),
                    source: e,
                })
            }
        }
    }
}

/// `base * 2^attempt`, saturating, capped at [`MAX_BACKOFF`].
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn retryable(e: &RenderError) -> bool {
    matches!(e, RenderError::Timeout { .. } | RenderError::Navigation { .. })
}

fn parse_url(raw: &str) -> Result<Url, DiscoveryError> {
    Url::parse(raw).map_err(|e| DiscoveryError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

fn resolve(base: &Url, href: &str) -> Result<String, DiscoveryError> {
    base.join(href)
        .map(String::from)
        .map_err(|e| DiscoveryError::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
}

fn selector(css: &str) -> Result<Selector, DiscoveryError> {
    Selector::parse(css).map_err(|e| DiscoveryError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn text_of(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// `href` of the first anchor whose visible text contains `text`
/// (case-insensitive).
pub fn find_link_by_text(html: &str, text: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").ok()?;
    let needle = text.to_lowercase();
    doc.select(&anchors)
        .find(|a| text_of(*a).to_lowercase().contains(&needle))
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

/// Highest numeric pager entry, ignoring labelled entries ("next", "last")
/// and anything that is not a number. Defaults to 1.
pub fn parse_page_count(
    html: &str,
    pager_selector: &str,
    skip_labels: &[String],
) -> Result<u32, DiscoveryError> {
    let doc = Html::parse_document(html);
    let sel = selector(pager_selector)?;
    let max = doc
        .select(&sel)
        .map(text_of)
        .filter(|t| !skip_labels.iter().any(|label| t.contains(label.as_str())))
        .filter_map(|t| t.parse::<u32>().ok())
        .fold(1, u32::max);
    Ok(max)
}

/// Page 1 is the listing URL itself; pages 2..=n add a `page` parameter.
pub fn listing_page_urls(listing_url: &str, page_count: u32) -> Vec<String> {
    let sep = if listing_url.contains('?') { '&' } else { '?' };
    std::iter::once(listing_url.to_string())
        .chain((2..=page_count).map(|n| format!("{}{}page={}", listing_url, sep, n)))
        .collect()
}

/// Absolute URLs of anchors whose `href` starts with `prefix`, deduplicated,
/// first occurrence wins.
pub fn extract_detail_links(
    html: &str,
    origin: &Url,
    prefix: &str,
) -> Result<Vec<String>, DiscoveryError> {
    let doc = Html::parse_document(html);
    let sel = selector(&format!("a[href^=\"{}\"]", prefix))?;
    let mut links: Vec<String> = Vec::new();
    for a in doc.select(&sel) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let url = resolve(origin, href)?;
        if !links.contains(&url) {
            links.push(url);
        }
    }
    Ok(links)
}
