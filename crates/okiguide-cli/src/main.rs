use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use okiguide_core::{FilterInputs, FilterSpec};
use okiguide_storage::{BookmarkStore, FetchOutcome, GuideSource, JsonFileGuideSource};
use okiguide_sync::{
    GuideCollection, GuideListDriver, GuideListOrchestrator, RenderFrame, RenderTarget, SyncConfig,
    UiCommand, ViewState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "okiguide")]
#[command(about = "Okinawa local guide directory")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the guide API and the htmx directory pages.
    Serve,
    /// Print one filtered page of guides and exit.
    Browse(BrowseArgs),
    /// Keep a live guide list in the terminal, polling the API in the background.
    Watch(SourceArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Read guides from a JSON file instead of the API.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BrowseArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// budget, premium or luxury
    #[arg(long)]
    price: Option<String>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => okiguide_web::serve_from_env().await?,
        Commands::Browse(args) => browse(args).await?,
        Commands::Watch(args) => watch(args).await?,
    }

    Ok(())
}

fn guide_source(args: &SourceArgs, config: &SyncConfig) -> Result<Arc<dyn GuideSource>> {
    Ok(match &args.file {
        Some(path) => Arc::new(JsonFileGuideSource::new(path)),
        None => Arc::new(config.http_source()?),
    })
}

async fn browse(args: BrowseArgs) -> Result<()> {
    let config = SyncConfig::from_env();
    let source = guide_source(&args.source, &config)?;
    let snapshot = match source.fetch_outcome().await {
        FetchOutcome::Loaded(snapshot) => snapshot,
        FetchOutcome::Unavailable(reason) => {
            bail!("guide list unavailable from {}: {reason}", source.describe())
        }
    };

    let mut collection = GuideCollection::new();
    collection.set_full_list(snapshot.into_guides());
    let spec = FilterSpec::from_inputs(&FilterInputs {
        location: args.location,
        language: args.language,
        price: args.price,
        keyword: args.keyword,
    });
    if !spec.is_empty() {
        collection.apply_filter(spec);
    }
    collection.go_to_page(args.page);

    let bookmarks = load_bookmarks(&BookmarkStore::new(&config.bookmarks_path)).await;
    let mut renderer = TerminalRenderer::new(std::io::stdout(), bookmarks);
    renderer.render(&RenderFrame::settled(&collection));
    Ok(())
}

async fn watch(args: SourceArgs) -> Result<()> {
    let config = SyncConfig::from_env();
    let source = guide_source(&args, &config)?;
    let store = BookmarkStore::new(&config.bookmarks_path);
    let bookmarks = load_bookmarks(&store).await;

    let renderer = TerminalRenderer::new(std::io::stdout(), bookmarks.clone());
    let orchestrator = GuideListOrchestrator::new(renderer).with_bookmarks(bookmarks);
    let driver = GuideListDriver::new(orchestrator, source, config.fetch_timeout, config.poll)
        .with_bookmark_store(store);

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(read_commands(tx));
    eprintln!("{HELP}");

    let orchestrator = driver.run(rx).await;
    info!(
        guides = orchestrator.collection().full_list().len(),
        bookmarks = orchestrator.bookmarks().len(),
        "watch finished"
    );
    Ok(())
}

async fn load_bookmarks(store: &BookmarkStore) -> BTreeSet<String> {
    match store.load().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(error = %err, path = %store.path().display(), "ignoring unreadable bookmarks");
            BTreeSet::new()
        }
    }
}

const HELP: &str = "commands: next | prev | page N | search key=value... | reset | bookmark ID | reload | quit";

async fn read_commands(tx: mpsc::Sender<UiCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(cmd) => {
                let shutdown = cmd == UiCommand::Shutdown;
                if tx.send(cmd).await.is_err() || shutdown {
                    return;
                }
            }
            Err(err) => eprintln!("{err:#}\n{HELP}"),
        }
    }
    let _ = tx.send(UiCommand::Shutdown).await;
}

fn parse_command(line: &str) -> Result<UiCommand> {
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default().to_lowercase();
    let cmd = match head.as_str() {
        "next" | "n" => UiCommand::NextPage,
        "prev" | "p" => UiCommand::PrevPage,
        "page" => {
            let raw = words.next().context("page needs a number")?;
            UiCommand::GoToPage(raw.parse().with_context(|| format!("not a page number: {raw}"))?)
        }
        "search" | "s" => {
            let mut inputs = FilterInputs::default();
            let mut last_key: Option<&str> = None;
            for word in words.by_ref() {
                // A bare word continues the previous value: `keyword=sunset kayak`.
                let Some((key, value)) = word.split_once('=') else {
                    let key = last_key.with_context(|| format!("expected key=value, got {word}"))?;
                    if let Some(text) = search_slot(&mut inputs, key)? {
                        text.push(' ');
                        text.push_str(word);
                    }
                    continue;
                };
                *search_slot(&mut inputs, key)? = Some(value.to_string());
                last_key = Some(key);
            }
            UiCommand::Search(inputs)
        }
        "reset" => UiCommand::ResetFilters,
        "bookmark" | "b" => {
            let id = words.next().context("bookmark needs a guide id")?;
            UiCommand::ToggleBookmark(id.to_string())
        }
        "reload" | "r" => UiCommand::Reload,
        "quit" | "q" | "exit" => UiCommand::Shutdown,
        other => bail!("unknown command: {other}"),
    };
    Ok(cmd)
}

fn search_slot<'a>(inputs: &'a mut FilterInputs, key: &str) -> Result<&'a mut Option<String>> {
    Ok(match key {
        "location" => &mut inputs.location,
        "language" => &mut inputs.language,
        "price" => &mut inputs.price,
        "keyword" => &mut inputs.keyword,
        other => bail!("unknown search field: {other}"),
    })
}

/// Plain-text painter for the live list.
struct TerminalRenderer<W> {
    out: W,
    bookmarks: BTreeSet<String>,
}

impl<W: Write> TerminalRenderer<W> {
    fn new(out: W, bookmarks: BTreeSet<String>) -> Self {
        Self { out, bookmarks }
    }

    fn paint(&mut self, frame: &RenderFrame<'_>) -> std::io::Result<()> {
        match frame.state {
            ViewState::Loading => writeln!(self.out, "Loading guides... / 読み込み中...")?,
            ViewState::NoResults => {
                writeln!(self.out, "No guides found / 該当するガイドが見つかりませんでした")?
            }
            ViewState::Results => {
                writeln!(
                    self.out,
                    "{}  page {}/{}{}",
                    frame.range.label(),
                    frame.page,
                    frame.total_pages,
                    if frame.filtered { "  (filtered)" } else { "" }
                )?;
                for guide in frame.items {
                    let mark = if self.bookmarks.contains(&guide.id) { "*" } else { " " };
                    writeln!(
                        self.out,
                        "[{mark}] {:<10} {:<24} {:<12} ¥{:<7} {}",
                        guide.id,
                        guide.name,
                        guide.location,
                        guide.session_rate,
                        guide.languages.join(", ")
                    )?;
                }
            }
        }
        self.out.flush()
    }
}

impl<W: Write> RenderTarget for TerminalRenderer<W> {
    fn render(&mut self, frame: &RenderFrame<'_>) {
        if let Err(err) = self.paint(frame) {
            warn!(error = %err, "terminal render failed");
        }
    }

    fn mark_bookmark(&mut self, guide_id: &str, bookmarked: bool) {
        if bookmarked {
            self.bookmarks.insert(guide_id.to_string());
        } else {
            self.bookmarks.remove(guide_id);
        }
        let verb = if bookmarked { "bookmarked" } else { "removed bookmark" };
        if let Err(err) = writeln!(self.out, "{verb} {guide_id}") {
            warn!(error = %err, "terminal render failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okiguide_core::{ExtensionPolicy, Guide, GuideStatus};

    fn guide(id: &str, rate: u32) -> Guide {
        Guide {
            id: id.to_string(),
            name: format!("Guide {id}"),
            location: "Naha".to_string(),
            languages: vec!["English".to_string()],
            specialties: Vec::new(),
            introduction: String::new(),
            session_rate: rate,
            extension_policy: ExtensionPolicy::Ask,
            late_night_policy: false,
            status: GuideStatus::Approved,
            registered_at: None,
        }
    }

    #[test]
    fn parses_pager_and_bookmark_commands() {
        assert_eq!(parse_command("next").unwrap(), UiCommand::NextPage);
        assert_eq!(parse_command(" P ").unwrap(), UiCommand::PrevPage);
        assert_eq!(parse_command("page 3").unwrap(), UiCommand::GoToPage(3));
        assert_eq!(
            parse_command("bookmark g7").unwrap(),
            UiCommand::ToggleBookmark("g7".to_string())
        );
        assert_eq!(parse_command("quit").unwrap(), UiCommand::Shutdown);
    }

    #[test]
    fn parses_search_fields() {
        let cmd = parse_command("search location=naha price=budget").unwrap();
        assert_eq!(
            cmd,
            UiCommand::Search(FilterInputs {
                location: Some("naha".to_string()),
                price: Some("budget".to_string()),
                ..FilterInputs::default()
            })
        );
        assert_eq!(parse_command("search").unwrap(), UiCommand::Search(FilterInputs::default()));
    }

    #[test]
    fn search_values_may_span_several_words() {
        let cmd = parse_command("search keyword=sunset kayak location=naha").unwrap();
        assert_eq!(
            cmd,
            UiCommand::Search(FilterInputs {
                keyword: Some("sunset kayak".to_string()),
                location: Some("naha".to_string()),
                ..FilterInputs::default()
            })
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("page two").is_err());
        assert!(parse_command("page").is_err());
        assert!(parse_command("search colour=red").is_err());
        assert!(parse_command("search naha").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn terminal_renderer_prints_range_and_bookmark_marks() {
        let mut collection = GuideCollection::new();
        collection.set_full_list(vec![guide("g1", 8000), guide("g2", 9000)]);
        let bookmarks = BTreeSet::from(["g2".to_string()]);
        let mut renderer = TerminalRenderer::new(Vec::new(), bookmarks);

        renderer.render(&RenderFrame::settled(&collection));
        renderer.mark_bookmark("g1", true);

        let text = String::from_utf8(renderer.out).unwrap();
        assert!(text.contains("1-2 of 2  page 1/1"));
        assert!(text.contains("[*] g2"));
        assert!(text.contains("[ ] g1"));
        assert!(text.ends_with("bookmarked g1\n"));
    }

    #[test]
    fn terminal_renderer_prints_no_results() {
        let mut collection = GuideCollection::new();
        collection.set_full_list(vec![guide("g1", 8000)]);
        collection.apply_filter(FilterSpec {
            keyword: Some("nobody".to_string()),
            ..FilterSpec::default()
        });
        let mut renderer = TerminalRenderer::new(Vec::new(), BTreeSet::new());
        renderer.render(&RenderFrame::settled(&collection));
        let text = String::from_utf8(renderer.out).unwrap();
        assert!(text.starts_with("No guides found"));
    }
}
