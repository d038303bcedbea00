//! CLI entry point: wires the credential, upstream, fetch, and catalog
//! subsystems together and maps errors to process exit codes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zshelf::auth::store::{self, ConfigError};
use zshelf::auth::{CredentialError, CredentialManager, ProbeOutcome, RotationStateFile};
use zshelf::catalog::{BookFilters, BookWithAuthors, CatalogError, CatalogService};
use zshelf::cli::{
    BrowseArgs, Cli, Command, DbCommand, DownloadAllArgs, DownloadArgs, ExportArgs, ExportFormat,
    SearchArgs,
};
use zshelf::db::{Database, DbError};
use zshelf::fetch::{FetchConfig, FetchEngine, FetchError};
use zshelf::upstream::{
    RemoteBook, SearchFilters, SessionPool, UpstreamClient, UpstreamConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}

/// Maps the error taxonomy to the documented exit codes.
fn exit_code(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if let Some(credential) = error.downcast_ref::<CredentialError>() {
        return match credential {
            CredentialError::AllCredentialsExhausted => 4,
            CredentialError::NoCredentials | CredentialError::NoValidCredentials => 3,
        };
    }
    if error.downcast_ref::<CatalogError>().is_some() || error.downcast_ref::<DbError>().is_some() {
        return 5;
    }
    if let Some(fetch) = error.downcast_ref::<FetchError>() {
        return match fetch {
            FetchError::Cancelled => 6,
            FetchError::Credentials(CredentialError::AllCredentialsExhausted) => 4,
            FetchError::Credentials(_) => 3,
            FetchError::Catalog(_) => 5,
            _ => 1,
        };
    }
    1
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "zshelf=info",
        1 => "zshelf=debug",
        _ => "zshelf=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Validate => validate_credentials().await,
        Command::Search(args) => search(args).await,
        Command::Download(args) => download(args).await,
        Command::DownloadAll(args) => download_all(args).await,
        Command::Db { command } => {
            let catalog = open_catalog().await?;
            db_command(&catalog, command).await
        }
    }
}

/// Builds the credential manager and session pool from configuration.
fn build_pool() -> Result<SessionPool> {
    let source = store::detect_source(Path::new("."))?;
    let loaded = store::load(&source)?;
    info!(
        enabled = loaded.credentials.len(),
        disabled = loaded.disabled,
        "credentials loaded"
    );

    if loaded.credentials.is_empty() {
        return Err(CredentialError::NoCredentials.into());
    }

    let state_path = loaded.state_file.clone().unwrap_or_else(default_state_path);
    let manager = CredentialManager::new(loaded.credentials, RotationStateFile::new(state_path));
    let client = UpstreamClient::new(upstream_config()?);
    Ok(SessionPool::new(client, manager))
}

async fn build_engine(catalog: CatalogService) -> Result<FetchEngine> {
    let pool = build_pool()?;
    Ok(FetchEngine::new(pool, catalog, FetchConfig::default()))
}

async fn open_catalog() -> Result<CatalogService> {
    let db = Database::open_default().await?;
    Ok(CatalogService::new(db))
}

fn upstream_config() -> Result<UpstreamConfig> {
    let mut config = UpstreamConfig::default();
    if let Ok(raw) = std::env::var("ZSHELF_BASE_URL")
        && !raw.is_empty()
    {
        config.base_url = raw
            .parse()
            .with_context(|| format!("invalid ZSHELF_BASE_URL '{raw}'"))?;
    }
    if let Ok(raw) = std::env::var("ZSHELF_TIMEOUT_SECS")
        && !raw.is_empty()
    {
        let secs: u64 = raw
            .parse()
            .with_context(|| format!("invalid ZSHELF_TIMEOUT_SECS '{raw}'"))?;
        config.timeout = std::time::Duration::from_secs(secs);
    }
    Ok(config)
}

fn default_state_path() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map_or_else(
            || PathBuf::from(".rotation-state"),
            |home| {
                PathBuf::from(home)
                    .join(".zlibrary")
                    .join("rotation_state.json")
            },
        )
}

/// Cancellation token wired to Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested");
            trigger.cancel();
        }
    });
    cancel
}

async fn validate_credentials() -> Result<()> {
    let mut pool = build_pool()?;
    let outcomes = pool.validate_all().await;

    for (identity, outcome) in &outcomes {
        let label = match outcome {
            ProbeOutcome::Valid { downloads_left } => match downloads_left {
                Some(left) => format!("valid ({left} downloads left)"),
                None => "valid".to_string(),
            },
            ProbeOutcome::Rejected { reason } => format!("invalid ({reason})"),
            ProbeOutcome::Exhausted => "exhausted".to_string(),
            ProbeOutcome::Unreachable { reason } => format!("unreachable ({reason})"),
        };
        println!("{identity}: {label}");
    }

    if !pool.manager().has_available() {
        return Err(CredentialError::NoValidCredentials.into());
    }
    println!(
        "{} of {} credential(s) available",
        pool.manager()
            .credentials()
            .iter()
            .filter(|c| c.is_available())
            .count(),
        pool.manager().len()
    );
    Ok(())
}

fn filters_from_args(args: &SearchArgs) -> SearchFilters {
    SearchFilters {
        year_from: args.year_from,
        year_to: args.year_to,
        language: args.language.clone(),
        extension: args.format.clone(),
        order: args.order.map(Into::into),
        page: args.page,
        limit: args.limit,
    }
}

async fn search(args: SearchArgs) -> Result<()> {
    let catalog = open_catalog().await?;
    let mut engine = build_engine(catalog).await?;
    let cancel = cancel_on_ctrl_c();
    let filters = filters_from_args(&args);

    let books = if args.all_pages {
        engine
            .search_all_pages(&args.query, &filters, args.save, &cancel)
            .await?
    } else {
        engine
            .search(&args.query, &filters, args.save, &cancel)
            .await?
    };

    if books.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for book in &books {
        println!(
            "{} | {} | {} | {} | {}",
            book.id,
            book.title,
            book.author.as_deref().unwrap_or("-"),
            book.year.as_deref().unwrap_or("-"),
            book.extension.as_deref().unwrap_or("-"),
        );
    }
    println!("{} result(s)", books.len());
    if args.save {
        println!("Results stored in the catalog.");
    }
    Ok(())
}

async fn download(args: DownloadArgs) -> Result<()> {
    let catalog = open_catalog().await?;
    let entry = catalog.show(&args.book_id).await?;
    let mut engine = build_engine(catalog).await?;
    let cancel = cancel_on_ctrl_c();

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("cannot create output directory '{}'", args.output.display()))?;

    let remote = remote_from_catalog(&entry);
    let outcome = engine.download(&remote, &args.output, &cancel).await?;
    println!(
        "Downloaded {} ({} bytes) to {}",
        outcome.filename,
        outcome.bytes,
        outcome.path.display()
    );
    Ok(())
}

async fn download_all(args: DownloadAllArgs) -> Result<()> {
    let catalog = open_catalog().await?;
    let mut engine = build_engine(catalog).await?;
    let cancel = cancel_on_ctrl_c();

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("cannot create output directory '{}'", args.output.display()))?;

    let filters = SearchFilters {
        year_from: args.year_from,
        year_to: args.year_to,
        language: args.language.clone(),
        extension: args.format.clone(),
        order: args.order.map(Into::into),
        page: None,
        limit: args.limit,
    };

    let outcomes = engine
        .download_all_pages(&args.query, &filters, &args.output, &cancel)
        .await?;

    for outcome in &outcomes {
        println!("{} -> {}", outcome.book_id, outcome.path.display());
    }
    println!("Downloaded {} book(s)", outcomes.len());
    Ok(())
}

/// Rebuilds the upstream record shape from a catalog row.
fn remote_from_catalog(entry: &BookWithAuthors) -> RemoteBook {
    let authors: Vec<String> = entry.authors.iter().map(|a| a.name.clone()).collect();
    RemoteBook {
        id: entry.book.id.clone(),
        hash: entry.book.hash.clone(),
        title: entry.book.title.clone(),
        author: (!authors.is_empty()).then(|| authors.join(", ")),
        year: entry.book.year.clone(),
        publisher: entry.book.publisher.clone(),
        language: entry.book.language.clone(),
        extension: entry.book.extension.clone(),
        size: entry.book.size.clone(),
        filesize: entry.book.filesize,
        cover: entry.book.cover_url.clone(),
        description: entry.book.description.clone(),
        isbn: entry.book.isbn.clone(),
        edition: entry.book.edition.clone(),
        pages: entry.book.pages,
    }
}

fn print_book_row(entry: &BookWithAuthors) {
    let authors = if entry.authors.is_empty() {
        "-".to_string()
    } else {
        entry
            .authors
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!(
        "{} | {} | {} | {} | {}",
        entry.book.id,
        entry.book.title,
        authors,
        entry.book.year.as_deref().unwrap_or("-"),
        entry.book.extension.as_deref().unwrap_or("-"),
    );
}

#[allow(clippy::too_many_lines)]
async fn db_command(catalog: &CatalogService, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::Browse(args) => browse(catalog, args).await,
        DbCommand::Show { book_id } => {
            let entry = catalog.show(&book_id).await?;
            println!("ID:        {}", entry.book.id);
            println!("Title:     {}", entry.book.title);
            if !entry.authors.is_empty() {
                let names: Vec<&str> = entry.authors.iter().map(|a| a.name.as_str()).collect();
                println!("Authors:   {}", names.join(", "));
            }
            for (label, value) in [
                ("Year:     ", entry.book.year.as_deref()),
                ("Publisher:", entry.book.publisher.as_deref()),
                ("Language: ", entry.book.language.as_deref()),
                ("Format:   ", entry.book.extension.as_deref()),
                ("Size:     ", entry.book.size.as_deref()),
                ("ISBN:     ", entry.book.isbn.as_deref()),
                ("Edition:  ", entry.book.edition.as_deref()),
            ] {
                if let Some(value) = value {
                    println!("{label} {value}");
                }
            }
            if let Some(pages) = entry.book.pages {
                println!("Pages:     {pages}");
            }
            if let Some(description) = entry.book.description.as_deref() {
                println!("\n{description}");
            }
            Ok(())
        }
        DbCommand::Save {
            book_id,
            notes,
            tags,
            priority,
        } => {
            catalog
                .save_book(&book_id, notes.as_deref(), tags.as_deref(), priority)
                .await?;
            println!("Saved book {book_id}");
            Ok(())
        }
        DbCommand::Unsave { book_id } => {
            if catalog.unsave_book(&book_id).await? {
                println!("Removed bookmark for {book_id}");
            } else {
                println!("Book {book_id} was not bookmarked");
            }
            Ok(())
        }
        DbCommand::Saved => {
            let saved = catalog.saved_books().await?;
            if saved.is_empty() {
                println!("No saved books.");
                return Ok(());
            }
            for entry in &saved {
                print_book_row(&BookWithAuthors {
                    book: entry.book.clone(),
                    authors: entry.authors.clone(),
                });
                if let Some(notes) = entry.saved.notes.as_deref() {
                    println!("  notes: {notes}");
                }
                if let Some(tags) = entry.saved.tags.as_deref() {
                    println!("  tags: {tags}");
                }
                if entry.saved.priority != 0 {
                    println!("  priority: {}", entry.saved.priority);
                }
            }
            Ok(())
        }
        DbCommand::Lists => {
            let lists = catalog.all_lists().await?;
            if lists.is_empty() {
                println!("No reading lists.");
                return Ok(());
            }
            for (list, count) in &lists {
                match list.description.as_deref() {
                    Some(description) => {
                        println!("{} ({count} books) - {description}", list.name);
                    }
                    None => println!("{} ({count} books)", list.name),
                }
            }
            Ok(())
        }
        DbCommand::ListCreate { name, description } => {
            let list = catalog.create_list(&name, description.as_deref()).await?;
            println!("Created reading list '{}'", list.name);
            Ok(())
        }
        DbCommand::ListShow { name } => {
            let (list, books) = catalog.list_with_books(&name).await?;
            println!("{} ({} books)", list.name, books.len());
            if let Some(description) = list.description.as_deref() {
                println!("{description}");
            }
            for entry in &books {
                print_book_row(entry);
            }
            Ok(())
        }
        DbCommand::ListAdd { name, book_id } => {
            catalog.add_to_list(&name, &book_id).await?;
            println!("Added {book_id} to '{name}'");
            Ok(())
        }
        DbCommand::ListRemove { name, book_id } => {
            if catalog.remove_from_list(&name, &book_id).await? {
                println!("Removed {book_id} from '{name}'");
            } else {
                println!("Book {book_id} was not in '{name}'");
            }
            Ok(())
        }
        DbCommand::ListDelete { name } => {
            catalog.delete_list(&name).await?;
            println!("Deleted reading list '{name}'");
            Ok(())
        }
        DbCommand::Downloads { limit } => {
            let downloads = catalog.recent_downloads(limit).await?;
            if downloads.is_empty() {
                println!("No downloads recorded.");
                return Ok(());
            }
            for record in &downloads {
                println!(
                    "{} | {} | {} | {} | {}",
                    record.downloaded_at,
                    record.book_id,
                    record.status_str,
                    record.credential_identity.as_deref().unwrap_or("-"),
                    record.filename,
                );
            }
            Ok(())
        }
        DbCommand::History { limit } => {
            let searches = catalog.recent_searches(limit).await?;
            if searches.is_empty() {
                println!("No searches recorded.");
                return Ok(());
            }
            for record in &searches {
                match record.search_filters.as_deref() {
                    Some(filters) => {
                        println!("{} | {} | {filters}", record.found_at, record.search_query);
                    }
                    None => println!("{} | {}", record.found_at, record.search_query),
                }
            }
            Ok(())
        }
        DbCommand::Stats => {
            let stats = catalog.stats().await?;
            println!("Books:     {}", stats.total_books);
            println!("Languages: {}", stats.distinct_languages);
            println!("Formats:   {}", stats.distinct_formats);
            println!("Downloads: {}", stats.total_downloads);
            println!("DB size:   {} bytes", stats.db_file_size);
            Ok(())
        }
        DbCommand::Export(ExportArgs { format, output }) => {
            let payload = match format {
                ExportFormat::Json => catalog.export_json().await?,
                ExportFormat::Csv => catalog.export_csv().await?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, payload)
                        .with_context(|| format!("cannot write '{}'", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => print!("{payload}"),
            }
            Ok(())
        }
        DbCommand::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read '{}'", file.display()))?;
            let imported = catalog.import_json(&raw).await?;
            println!("Imported {imported} book(s)");
            Ok(())
        }
        DbCommand::Vacuum => {
            catalog.vacuum().await?;
            println!("Catalog compacted.");
            Ok(())
        }
    }
}

async fn browse(catalog: &CatalogService, args: BrowseArgs) -> Result<()> {
    let filters = BookFilters {
        title: args.query,
        language: args.language,
        extension: args.format,
        year_from: args.year_from,
        year_to: args.year_to,
        author: args.author,
    };

    let total = catalog.count(&filters).await?;
    let page = catalog.browse(&filters, args.limit, args.offset).await?;

    if page.is_empty() {
        println!("No books found.");
        return Ok(());
    }
    for entry in &page {
        print_book_row(entry);
    }
    println!("{} of {total} book(s)", page.len());
    Ok(())
}
