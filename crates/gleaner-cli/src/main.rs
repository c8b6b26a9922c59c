use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gleaner_client::{ClientFetcherFactory, HtmlQuery, HttpFetcher};
use gleaner_core::{
    DedupStore, FieldSelector, JobOrchestrator, JobStatus, OrchestratorConfig, PaginationConfig,
    ScrapeConfig, ScrapeManager, Selector,
};
use gleaner_db::{Database, DatabaseConfig, HistoryRepository};

mod output;

use output::OutputFormat;

type CliManager = ScrapeManager<ClientFetcherFactory, HtmlQuery, Option<HistoryRepository>>;

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Declarative CSS/XPath scraping engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scrape job and print the extracted records
    Scrape {
        /// JSON job configuration, in the shape the HTTP API accepts
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target URL (overrides the one in --config)
        #[arg(short, long)]
        url: Option<String>,

        /// Field as NAME=CSS, or NAME=CSS@ATTR to extract an attribute. Repeatable.
        #[arg(short, long = "field")]
        fields: Vec<String>,

        /// Container CSS selector; switches to item mode
        #[arg(long)]
        container: Option<String>,

        /// Page range START-END, appended to the URL as ?page=N
        #[arg(long)]
        pages: Option<String>,

        /// Skip records already seen by earlier incremental runs
        #[arg(long, default_value_t = false)]
        incremental: bool,

        /// Render pages with headless Chromium (needs the `browser` feature)
        #[arg(long, default_value_t = false)]
        render: bool,

        /// Fingerprint file used by incremental runs
        #[arg(long, env = "GLEANER_DEDUP_FILE", default_value = ".gleaner-dedup.json")]
        dedup_file: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Write records to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pages fetched concurrently
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Evaluate one selector against a live page
    TestSelector {
        #[arg(short, long)]
        url: String,

        /// Selector expression (CSS unless --xpath)
        #[arg(short, long)]
        selector: String,

        #[arg(long, default_value_t = false)]
        xpath: bool,

        /// Extract this attribute instead of text (CSS only)
        #[arg(short, long)]
        attribute: Option<String>,

        #[arg(long, default_value_t = false)]
        render: bool,
    },

    /// Check that a URL is reachable
    ValidateUrl {
        #[arg(short, long)]
        url: String,
    },

    /// Show finished jobs, newest first (requires DATABASE_URL)
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Forget every fingerprint recorded by incremental runs
    ClearDedup {
        #[arg(long, env = "GLEANER_DEDUP_FILE", default_value = ".gleaner-dedup.json")]
        dedup_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gleaner=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            config,
            url,
            fields,
            container,
            pages,
            incremental,
            render,
            dedup_file,
            format,
            output,
            concurrency,
        } => {
            let mut scrape = load_config(config.as_deref(), url)?;
            apply_flags(&mut scrape, &fields, container, pages.as_deref())?;
            scrape.incremental_scraping |= incremental;
            scrape.use_javascript_rendering |= render;

            let dedup = DedupStore::open(&dedup_file)
                .await
                .with_context(|| format!("Failed to load dedup file {}", dedup_file.display()))?;
            let history = connect_history().await?;
            let manager = build_manager(history, dedup, concurrency);
            cmd_scrape(&manager, scrape, format, output.as_deref()).await?;
        }
        Commands::TestSelector {
            url,
            selector,
            xpath,
            attribute,
            render,
        } => {
            let mut selector = if xpath {
                Selector::xpath(selector)
            } else {
                Selector::css(selector)
            };
            selector.attribute = attribute;
            let manager = build_manager(None, DedupStore::new(), 1);
            let preview = manager
                .test_selector(&url, selector, render)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::ValidateUrl { url } => {
            let manager = build_manager(None, DedupStore::new(), 1);
            let check = manager
                .validate_url(&url)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.accessible {
                bail!("{url} is not accessible");
            }
        }
        Commands::History { limit, offset } => {
            let repo = connect_db().await?;
            cmd_history(&repo, limit, offset).await?;
        }
        Commands::ClearDedup { dedup_file } => {
            let dedup = DedupStore::open(&dedup_file)
                .await
                .with_context(|| format!("Failed to load dedup file {}", dedup_file.display()))?;
            let manager = build_manager(None, dedup, 1);
            let dropped = manager
                .clear_dedup()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Cleared {dropped} fingerprints from {}", dedup_file.display());
        }
    }

    Ok(())
}

/// The CLI talks to whatever the user points it at, local hosts included.
fn build_manager(
    history: Option<HistoryRepository>,
    dedup: DedupStore,
    concurrency: usize,
) -> CliManager {
    let factory = ClientFetcherFactory::new(HttpFetcher::new().allow_private_urls());
    ScrapeManager::new(JobOrchestrator::new(
        factory,
        HtmlQuery,
        history,
        Arc::new(dedup),
        OrchestratorConfig::default().with_page_concurrency(concurrency),
    ))
}

/// History is recorded only when DATABASE_URL is configured.
async fn connect_history() -> Result<Option<HistoryRepository>> {
    if std::env::var("DATABASE_URL").is_err() {
        tracing::debug!("DATABASE_URL not set, job history disabled");
        return Ok(None);
    }
    Ok(Some(connect_db().await?))
}

async fn connect_db() -> Result<HistoryRepository> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.history_repo())
}

fn load_config(path: Option<&Path>, url: Option<String>) -> Result<ScrapeConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str::<ScrapeConfig>(&raw).context("Invalid JSON job configuration")?
        }
        None => {
            let Some(url) = url.clone() else {
                bail!("either --config or --url is required");
            };
            ScrapeConfig::new(url)
        }
    };
    if let Some(url) = url {
        config.url = url;
    }
    Ok(config)
}

/// Layer `--field`, `--container` and `--pages` over the loaded config.
fn apply_flags(
    config: &mut ScrapeConfig,
    fields: &[String],
    container: Option<String>,
    pages: Option<&str>,
) -> Result<()> {
    let fields = fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<Vec<_>>>()?;

    match container {
        Some(container) => {
            *config = config.clone().with_items(Selector::css(container), fields);
        }
        None if config.item_scraping.enabled => {
            config.item_scraping.field_selectors.extend(fields);
        }
        None => config.selectors.extend(fields),
    }

    if let Some(pages) = pages {
        let (start, end) = parse_pages(pages)?;
        config.pagination = Some(PaginationConfig::query("page", start, end));
    }
    Ok(())
}

/// `NAME=CSS` or `NAME=CSS@ATTR`; a leading `!` on NAME marks the field required.
fn parse_field(raw: &str) -> Result<FieldSelector> {
    let Some((name, expression)) = raw.split_once('=') else {
        bail!("invalid field '{raw}': expected NAME=SELECTOR");
    };
    let (name, required) = match name.trim().strip_prefix('!') {
        Some(name) => (name, true),
        None => (name.trim(), false),
    };
    if name.is_empty() || expression.trim().is_empty() {
        bail!("invalid field '{raw}': name and selector must not be empty");
    }

    let selector = match expression.rsplit_once('@') {
        Some((css, attr)) if !attr.is_empty() && !attr.contains(']') => {
            Selector::css(css.trim()).with_attribute(attr.trim())
        }
        _ => Selector::css(expression.trim()),
    };
    let field = FieldSelector::new(name, selector);
    Ok(if required { field.required() } else { field })
}

fn parse_pages(raw: &str) -> Result<(u32, u32)> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .with_context(|| format!("invalid page number '{s}'"))
    };
    match raw.split_once('-') {
        Some((start, end)) => Ok((parse(start)?, parse(end)?)),
        None => {
            let page = parse(raw)?;
            Ok((page, page))
        }
    }
}

async fn cmd_scrape(
    manager: &CliManager,
    config: ScrapeConfig,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<()> {
    let id = manager.submit(config).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(job_id = %id, "Job submitted");

    let snapshot = tokio::select! {
        done = manager.wait(id) => done.map_err(|e| anyhow::anyhow!(e))?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(job_id = %id, "Interrupted, cancelling job");
            manager.cancel(id).map_err(|e| anyhow::anyhow!(e))?;
            manager.wait(id).await.map_err(|e| anyhow::anyhow!(e))?
        }
    };

    let records = snapshot.records.clone().unwrap_or_default();
    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            output::write_records(&records, format, BufWriter::new(file))?;
            tracing::info!(path = %path.display(), records = records.len(), "Records written");
        }
        None => output::write_records(&records, format, io::stdout().lock())?,
    }

    let stats = &snapshot.stats;
    tracing::info!(
        job_id = %id,
        status = %snapshot.status,
        pages = stats.successful_pages,
        failed_pages = stats.failed_pages,
        items = stats.total_items,
        skipped = stats.skipped_items,
        duplicates = stats.duplicate_items,
        images = stats.images_found,
        duration_secs = stats.duration_secs().unwrap_or_default(),
        "Scrape finished"
    );
    for failure in &stats.failures {
        tracing::warn!(
            page = failure.page_index,
            url = %failure.url,
            attempts = failure.attempts,
            status = ?failure.status,
            "Page failed: {}",
            failure.error
        );
    }

    if snapshot.status == JobStatus::Failed {
        bail!(
            "Job {id} failed: {}",
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_history(repo: &HistoryRepository, limit: usize, offset: usize) -> Result<()> {
    let entries = repo
        .list(limit, offset)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let total = repo.count().await.map_err(|e| anyhow::anyhow!(e))?;

    if entries.is_empty() {
        println!("No scrape history");
        return Ok(());
    }

    println!("Scrape history:\n");
    for entry in &entries {
        let outcome = match &entry.error_message {
            Some(error) => format!("{} ({error})", entry.status),
            None => entry.status.to_string(),
        };
        println!(
            "  {}  {}  {:>5} records  {:>4} images  {:>7.1}s  {}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.job_id,
            entry.result_count,
            entry.images_count,
            entry.duration_secs,
            outcome,
            entry.url,
        );
    }
    println!(
        "\nShowing {}-{} of {total} jobs",
        offset + 1,
        offset + entries.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::SelectorLanguage;

    #[test]
    fn test_parse_field_text_and_attribute() {
        let title = parse_field("title=h1.title").unwrap();
        assert_eq!(title.name, "title");
        assert_eq!(title.selector.expression, "h1.title");
        assert_eq!(title.selector.attribute, None);
        assert!(!title.required);

        let link = parse_field("!link=a.more@href").unwrap();
        assert_eq!(link.name, "link");
        assert_eq!(link.selector.expression, "a.more");
        assert_eq!(link.selector.attribute.as_deref(), Some("href"));
        assert_eq!(link.selector.language, SelectorLanguage::Css);
        assert!(link.required);
    }

    #[test]
    fn test_parse_field_keeps_at_inside_attribute_selector() {
        let field = parse_field("mail=a[href^='mailto:x@y']").unwrap();
        assert_eq!(field.selector.expression, "a[href^='mailto:x@y']");
        assert_eq!(field.selector.attribute, None);
    }

    #[test]
    fn test_parse_field_rejects_malformed() {
        assert!(parse_field("no-selector").is_err());
        assert!(parse_field("=h1").is_err());
        assert!(parse_field("title=").is_err());
    }

    #[test]
    fn test_parse_pages() {
        assert_eq!(parse_pages("1-5").unwrap(), (1, 5));
        assert_eq!(parse_pages("3").unwrap(), (3, 3));
        assert!(parse_pages("a-2").is_err());
    }

    #[test]
    fn test_flags_switch_to_item_mode() {
        let mut config = ScrapeConfig::new("https://books.example/");
        let fields = vec!["!name=h3 a@title".to_string(), "price=p.price".to_string()];
        apply_flags(&mut config, &fields, Some("article".into()), Some("1-3")).unwrap();

        assert!(config.item_scraping.enabled);
        assert_eq!(config.item_scraping.container_selector, "article");
        assert_eq!(config.item_scraping.field_selectors.len(), 2);
        let pagination = config.pagination.unwrap();
        assert_eq!((pagination.start_page, pagination.end_page), (1, 3));
    }

    #[test]
    fn test_url_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"url": "https://old.example/", "selectors": [{"name": "title", "selector": "h1"}]}"#,
        )
        .unwrap();

        let config = load_config(Some(&path), Some("https://new.example/".into())).unwrap();
        assert_eq!(config.url, "https://new.example/");
        assert_eq!(config.selectors.len(), 1);
    }

    #[test]
    fn test_config_or_url_required() {
        assert!(load_config(None, None).is_err());
    }
}
