//! Render the target page and dump what the extractor sees.

use anyhow::{Context, Result};
use clap::Parser;
use scraper::{Html, Selector};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use screening_watchbot::config;
use screening_watchbot::consent;
use screening_watchbot::extract::{self, normalize::absolute_http_url};
use screening_watchbot::model::Field;
use screening_watchbot::render::chrome::ChromeDriver;
use screening_watchbot::render::RenderEngine;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Page to render instead of `target.url`
    #[arg(long)]
    url: Option<String>,

    /// Number of links to list
    #[arg(long, default_value_t = 40)]
    links: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let url = args.url.unwrap_or_else(|| cfg.target.url.clone());

    let engine = RenderEngine::new(Arc::new(ChromeDriver), cfg.browser.clone(), None);
    let mut doc = engine.render(&url).await?;
    let consent = consent::resolve(&mut doc, &cfg.consent).await;
    println!("Consent: {:?}", consent);

    let html = doc.snapshot().await.context("failed to read page")?;
    let page_url = doc.url().to_string();
    drop(doc);

    println!("URL: {}", page_url);
    let (text, links) = {
        let parsed = Html::parse_document(&html);
        let base = Url::parse(&page_url).ok();
        let sel = Selector::parse("a[href]").expect("valid selector");
        let links: Vec<(String, String)> = parsed
            .select(&sel)
            .filter_map(|a| {
                let href = absolute_http_url(a.value().attr("href")?, base.as_ref())?;
                let text = a.text().collect::<Vec<_>>().join(" ");
                Some((text.split_whitespace().collect::<Vec<_>>().join(" "), href))
            })
            .take(args.links)
            .collect();
        (extract::page_text(&parsed), links)
    };

    println!("\n--- text ---\n{}", text);
    println!("\n--- links ---");
    for (text, href) in links {
        println!("  {} -> {}", text, href);
    }

    let (record, diagnostics) = extract::extract_from_html(
        &html,
        &page_url,
        chrono::Local::now().fixed_offset(),
        cfg.target.default_location.as_deref(),
    );
    println!("\n--- extraction ---");
    for field in Field::ALL {
        let tier = diagnostics
            .strategy_used_per_field
            .get(&field)
            .copied()
            .unwrap_or("-");
        println!("  {:<20} [{}] {}", field.as_str(), tier, record.get(field));
    }
    if !diagnostics.missing_fields.is_empty() {
        println!("  missing: {:?}", diagnostics.missing_fields);
    }
    Ok(())
}
