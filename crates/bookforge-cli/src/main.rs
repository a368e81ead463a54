//! CLI binary for generating, inspecting, and compiling books.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use bookforge_llm::{GenerationParams, LlmClient, UsageTrackingMiddleware};
use bookforge_pipeline::{
    validate_book_id, BatchController, BookRequest, CancellationFlag, CheckpointStore, Compiler,
    FileCheckpointStore, PipelineConfig, PipelineController, PollPolicy, ProgressObserver,
    ProgressSignal, SequentialController,
};

#[derive(Parser)]
#[command(name = "bookforge", version, about = "Resumable, checkpointed book generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding one folder per book
    #[arg(short, long, global = true, default_value = "books")]
    output: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Page by page, checkpointing every page
    Sequential,
    /// One batch job with a task per chapter
    Batch,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a book, resuming from its checkpoint if one exists
    Generate {
        /// Book identifier (directory name under --output)
        book_id: String,

        /// Theme for a new book (ignored when resuming)
        #[arg(short, long, default_value = "")]
        theme: String,

        #[arg(short, long, default_value = "10")]
        chapters: u32,

        /// Pages per chapter
        #[arg(short, long, default_value = "5")]
        pages: u32,

        #[arg(short, long, value_enum, default_value = "sequential")]
        mode: Mode,

        /// Target language (batch mode): en, es, fr, de, it, ja, zh
        #[arg(short, long, default_value = "en")]
        language: String,

        #[arg(long, default_value = "")]
        author: String,

        #[arg(long, default_value = "")]
        genre: String,

        #[arg(long, default_value = "gpt-4o")]
        model: String,

        #[arg(long, default_value = "0.8")]
        temperature: f32,

        #[arg(long, default_value = "4096")]
        max_tokens: u32,

        /// Seconds between batch status checks
        #[arg(long, default_value = "30")]
        poll_interval: u64,

        /// Give up on a batch job after this many seconds (default: wait indefinitely)
        #[arg(long)]
        max_wait: Option<u64>,

        /// Skip writing per-page JSON and document files
        #[arg(long)]
        no_unit_artifacts: bool,
    },

    /// Show the checkpointed progress of a book
    Status {
        book_id: String,

        /// Print the raw checkpoint JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a book from its checkpoint without generating anything
    Compile { book_id: String },

    /// Delete a book's checkpoint
    Delete {
        book_id: String,

        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = FileCheckpointStore::new(&cli.output);

    match cli.command {
        Commands::Generate {
            book_id,
            theme,
            chapters,
            pages,
            mode,
            language,
            author,
            genre,
            model,
            temperature,
            max_tokens,
            poll_interval,
            max_wait,
            no_unit_artifacts,
        } => {
            let request = BookRequest::new(book_id, theme, chapters, pages)
                .with_language(language)
                .with_author(author)
                .with_genre(genre);
            let params = GenerationParams::new(model)
                .with_temperature(temperature)
                .with_max_tokens(max_tokens);
            let config = PipelineConfig::new(&cli.output)
                .with_params(params)
                .with_unit_artifacts(!no_unit_artifacts);
            let mut poll = PollPolicy::fixed(Duration::from_secs(poll_interval));
            if let Some(secs) = max_wait {
                poll = poll.with_max_wait(Duration::from_secs(secs));
            }
            cmd_generate(store, config, request, mode, poll).await?;
        }
        Commands::Status { book_id, json } => {
            cmd_status(&store, &book_id, json).await?;
        }
        Commands::Compile { book_id } => {
            cmd_compile(&store, &cli.output, &book_id).await?;
        }
        Commands::Delete { book_id, yes } => {
            cmd_delete(&store, &book_id, yes).await?;
        }
    }

    Ok(())
}

/// Prints each unit as it starts and stops at the next boundary after Ctrl-C.
struct ConsoleObserver {
    flag: CancellationFlag,
}

impl ProgressObserver for ConsoleObserver {
    fn before_unit(&self, chapter: u32, page: u32) -> ProgressSignal {
        let signal = self.flag.before_unit(chapter, page);
        if signal == ProgressSignal::Continue {
            println!("  chapter {chapter}, page {page}");
        }
        signal
    }
}

async fn cmd_generate(
    store: FileCheckpointStore,
    config: PipelineConfig,
    request: BookRequest,
    mode: Mode,
    poll: PollPolicy,
) -> anyhow::Result<()> {
    let usage = UsageTrackingMiddleware::new();
    let client = LlmClient::from_env()?.with_middleware(usage.clone());
    let service = Arc::new(client);
    let store = Arc::new(store);

    let controller: Box<dyn PipelineController> = match mode {
        Mode::Sequential => Box::new(SequentialController::new(service, store, config)),
        Mode::Batch => Box::new(BatchController::new(service, store, config).with_poll_policy(poll)),
    };

    let flag = CancellationFlag::new();
    let on_interrupt = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping after the current unit...");
            on_interrupt.cancel();
        }
    });

    println!(
        "Generating '{}' ({} mode): {} chapters x {} pages",
        request.book_id,
        controller.mode(),
        request.chapters,
        request.pages_per_chapter
    );

    let observer = ConsoleObserver { flag };
    let outcome = controller.run(&request, &observer).await;
    println!(
        "Tokens used: {} in, {} out",
        usage.total_input_tokens(),
        usage.total_output_tokens()
    );

    match outcome {
        Ok(report) => {
            println!("\nBook completed");
            if report.resumed {
                println!("Resumed from checkpoint");
            }
            println!("Units generated this run: {}", report.units_generated);
            println!("Compiled: {}", report.artifacts.document_path.display());
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            println!("\n{e}. Progress is saved; run the same command again to resume.");
            Ok(())
        }
        Err(e) => {
            eprintln!("\nGeneration stopped. Progress up to the last completed page is saved.");
            Err(e.into())
        }
    }
}

async fn cmd_status(store: &FileCheckpointStore, book_id: &str, json: bool) -> anyhow::Result<()> {
    validate_book_id(book_id)?;
    let Some(state) = store.load(book_id).await? else {
        println!("No checkpoint for '{book_id}'");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let progress = &state.progress;
    println!("Book: {book_id}");
    if !state.metadata.title.is_empty() {
        println!("Title: {}", state.metadata.title);
    }
    println!("Status: {:?}", progress.status);
    println!(
        "Last completed: chapter {}, page {}",
        progress.last_completed_chapter, progress.last_completed_page
    );
    println!("Pages written: {}", state.page_count());
    println!("Characters: {}", state.characters.len());
    println!("Plot points: {}", state.plot_points.len());
    if let Some(cover) = &state.metadata.cover_image {
        println!("Cover: {cover}");
    }
    if let Some(saved_at) = state.saved_at {
        println!(
            "Saved: {}",
            saved_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_compile(store: &FileCheckpointStore, output: &Path, book_id: &str) -> anyhow::Result<()> {
    validate_book_id(book_id)?;
    let state = store
        .load(book_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No checkpoint for '{book_id}'"))?;

    let compiler = Compiler::default();
    let book = compiler.compile(&state);
    let artifacts = compiler.write(&book, &output.join(book_id)).await?;

    println!("Compiled {} chapters, {} pages", book.chapters.len(), book.page_count());
    println!("JSON: {}", artifacts.json_path.display());
    println!("Document: {}", artifacts.document_path.display());
    Ok(())
}

async fn cmd_delete(store: &FileCheckpointStore, book_id: &str, yes: bool) -> anyhow::Result<()> {
    validate_book_id(book_id)?;
    if !yes {
        anyhow::bail!("Refusing to delete '{book_id}' without --yes");
    }
    store.delete(book_id).await?;
    println!("Deleted checkpoint for '{book_id}'");
    Ok(())
}
