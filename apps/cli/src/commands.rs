//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use pagescribe_core::{
    AssembleConfig, ProgressReporter, StageReport, assemble_book, capture_book, transcribe_book,
};
use pagescribe_reader::BridgeSurface;
use pagescribe_shared::{
    AppConfig, BOOK_ID_ENV, BackendKind, CaptureConfig, TranscribeConfig, init_config, load_config,
};
use pagescribe_store::BookStore;
use pagescribe_transcribe::{CancelFlag, build_backend};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// pagescribe — capture, transcribe and reassemble e-books you can read.
#[derive(Parser)]
#[command(
    name = "pagescribe",
    version,
    about = "Capture a book from a web reader, transcribe each page, and reassemble its chapters.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Which book, and where its artifacts live.
#[derive(clap::Args)]
pub(crate) struct BookArgs {
    /// Book identifier (e.g. the reader's ASIN).
    #[arg(long, env = BOOK_ID_ENV)]
    pub book: String,

    /// Output root (defaults to `defaults.output_dir` from the config).
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Walk the reader and store one image per page.
    Capture {
        #[command(flatten)]
        book: BookArgs,

        /// Start over instead of resuming, overwriting existing captures.
        #[arg(long)]
        force: bool,

        /// Leave the reader where the capture ended.
        #[arg(long)]
        no_restore: bool,
    },

    /// Transcribe captured pages and write content.json.
    Transcribe {
        #[command(flatten)]
        book: BookArgs,

        /// Re-transcribe pages that already have a transcript.
        #[arg(long)]
        force: bool,

        /// Maximum in-flight requests (1-16).
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=16))]
        concurrency: Option<u32>,

        /// Transcription backend: openai or ollama.
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Stitch transcripts into chapters and write book.md / chapters.json.
    Assemble {
        #[command(flatten)]
        book: BookArgs,

        /// Keep back-matter chapters (acknowledgements, previews, ...).
        #[arg(long)]
        include_back_matter: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "pagescribe=info",
        1 => "pagescribe=debug",
        _ => "pagescribe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Capture {
            book,
            force,
            no_restore,
        } => cmd_capture(&book, force, no_restore).await,
        Command::Transcribe {
            book,
            force,
            concurrency,
            backend,
        } => cmd_transcribe(&book, force, concurrency, backend).await,
        Command::Assemble {
            book,
            include_back_matter,
        } => cmd_assemble(&book, include_back_matter),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

fn open_store(config: &AppConfig, args: &BookArgs) -> Result<BookStore> {
    let root = args
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    BookStore::open(&root, &args.book)
        .wrap_err_with(|| format!("cannot open output folder for book '{}'", args.book))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_capture(args: &BookArgs, force: bool, no_restore: bool) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config, args)?;
    let capture = CaptureConfig {
        force,
        restore_position: config.capture.restore_position && !no_restore,
        ..CaptureConfig::from(&config)
    };

    info!(book = %args.book, force, "starting capture");
    let mut surface = BridgeSurface::spawn(&config.surface, &args.book)
        .await
        .wrap_err("failed to start the reader driver")?;

    let reporter = CliProgress::new();
    let result = capture_book(&mut surface, &store, capture, &reporter).await;
    reporter.finish();
    if let Err(e) = surface.shutdown().await {
        warn!(error = %e, "reader driver did not shut down cleanly");
    }
    let summary = result?;

    println!();
    println!("  Capture finished ({}).", summary.reason);
    println!("  Book:     {}", summary.book_id);
    println!("  Captures: {} ({} new)", summary.captures, summary.new_captures);
    if let Some(from) = summary.resumed_from {
        println!("  Resumed:  after page {from}");
    }
    println!("  Last content page: {}", summary.last_content_page);
    println!("  Path:     {}", store.root().display());
    println!("  Time:     {:.1}s", summary.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_transcribe(
    args: &BookArgs,
    force: bool,
    concurrency: Option<u32>,
    backend: Option<BackendKind>,
) -> Result<()> {
    let mut config = load_config()?;
    if let Some(kind) = backend {
        config.transcribe.backend = kind;
    }
    if let Some(n) = concurrency {
        config.transcribe.concurrency = n;
    }
    let store = open_store(&config, args)?;
    let backend = build_backend(&config)?;
    let transcribe = TranscribeConfig {
        force,
        ..TranscribeConfig::from(&config)
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight pages");
                cancel.cancel();
            }
        });
    }

    info!(
        book = %args.book,
        backend = %config.transcribe.backend,
        concurrency = transcribe.concurrency,
        force,
        "starting transcription"
    );
    let reporter = CliProgress::new();
    let result = transcribe_book(&store, backend, transcribe, cancel, &reporter).await;
    reporter.finish();
    let summary = result?;

    println!();
    println!("  Transcription complete.");
    println!("  Pages:  {} ({} cached)", summary.chunks, summary.cached);
    println!("  Path:   {}", store.path_of("content.json").display());
    println!("  Time:   {:.1}s", summary.elapsed.as_secs_f64());
    println!();

    Ok(())
}

fn cmd_assemble(args: &BookArgs, include_back_matter: bool) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config, args)?;
    let reporter = CliProgress::new();
    let result = assemble_book(&store, &AssembleConfig { include_back_matter }, &reporter);
    reporter.finish();
    let summary = result?;

    println!();
    println!("  Book assembled.");
    println!("  Chapters: {} ({} dropped)", summary.chapters, summary.dropped);
    println!("  Markdown: {}", summary.book_md.display());
    println!("  Chapters: {}", summary.chapters_json.display());
    println!();

    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_captured(&self, page: u32, last_content_page: u32, captures: usize) {
        self.spinner
            .set_message(format!("Captured page {page}/{last_content_page} ({captures} images)"));
    }

    fn page_transcribed(&self, page: u32, done: usize, total: usize) {
        self.spinner
            .set_message(format!("Transcribing [{done}/{total}] page {page}"));
    }

    fn done(&self, _report: &StageReport) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcribe_flags() {
        let cli = Cli::try_parse_from([
            "pagescribe",
            "-vv",
            "transcribe",
            "--book",
            "B00TEST",
            "--concurrency",
            "4",
            "--backend",
            "ollama",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Transcribe {
                book,
                force,
                concurrency,
                backend,
            } => {
                assert_eq!(book.book, "B00TEST");
                assert!(force);
                assert_eq!(concurrency, Some(4));
                assert_eq!(backend, Some(BackendKind::Ollama));
            }
            _ => panic!("expected transcribe"),
        }
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let result = Cli::try_parse_from([
            "pagescribe",
            "transcribe",
            "--book",
            "B00TEST",
            "--concurrency",
            "32",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_capture_and_assemble() {
        let cli = Cli::try_parse_from(["pagescribe", "capture", "--book", "B1", "--no-restore", "-o", "books"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Capture { no_restore: true, force: false, ref book } if book.out == Some(PathBuf::from("books"))
        ));

        let cli = Cli::try_parse_from(["pagescribe", "assemble", "--book", "B1", "--include-back-matter"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Assemble { include_back_matter: true, .. }
        ));
    }
}
