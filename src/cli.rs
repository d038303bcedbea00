//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand, ValueEnum};

use crate::upstream::SortOrder;

/// Batch search-and-download client with credential rotation and a local
/// book catalog.
#[derive(Parser, Debug)]
#[command(name = "zshelf")]
#[command(author, version, about)]
#[command(
    after_help = "Exit codes:\n  0 = success\n  2 = configuration error\n  3 = no valid credentials\n  4 = all credentials exhausted\n  5 = catalog error\n  6 = cancelled"
)]
pub struct Cli {
    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Validate every configured credential against the upstream service.
    Validate,
    /// Search the upstream service.
    Search(SearchArgs),
    /// Download a book from the local catalog by id.
    Download(DownloadArgs),
    /// Search every page, store the results, and download each book.
    DownloadAll(DownloadAllArgs),
    /// Local catalog commands.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

/// Result ordering flag values.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderArg {
    Popular,
    Year,
    Title,
}

impl From<OrderArg> for SortOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Popular => Self::Popular,
            OrderArg::Year => Self::Year,
            OrderArg::Title => Self::Title,
        }
    }
}

/// Arguments for `zshelf search`.
#[derive(ClapArgs, Debug, PartialEq)]
pub struct SearchArgs {
    /// Search query.
    pub query: String,

    /// Earliest publication year.
    #[arg(long)]
    pub year_from: Option<i32>,

    /// Latest publication year.
    #[arg(long)]
    pub year_to: Option<i32>,

    /// Language filter.
    #[arg(long)]
    pub language: Option<String>,

    /// File extension filter (pdf, epub, ...).
    #[arg(long)]
    pub format: Option<String>,

    /// Result ordering.
    #[arg(long, value_enum)]
    pub order: Option<OrderArg>,

    /// Page to fetch (ignored with --all-pages).
    #[arg(long)]
    pub page: Option<u32>,

    /// Results per page (1-100).
    #[arg(long)]
    pub limit: Option<u32>,

    /// Store results in the local catalog.
    #[arg(long)]
    pub save: bool,

    /// Fetch every page until the upstream runs dry.
    #[arg(long)]
    pub all_pages: bool,
}

/// Arguments for `zshelf download`.
#[derive(ClapArgs, Debug, PartialEq)]
pub struct DownloadArgs {
    /// External id of a book already in the catalog.
    pub book_id: String,

    /// Directory to save the file into.
    #[arg(long, short, default_value = ".")]
    pub output: PathBuf,
}

/// Arguments for `zshelf download-all`.
#[derive(ClapArgs, Debug, PartialEq)]
pub struct DownloadAllArgs {
    /// Search query.
    pub query: String,

    /// Earliest publication year.
    #[arg(long)]
    pub year_from: Option<i32>,

    /// Latest publication year.
    #[arg(long)]
    pub year_to: Option<i32>,

    /// Language filter.
    #[arg(long)]
    pub language: Option<String>,

    /// File extension filter (pdf, epub, ...).
    #[arg(long)]
    pub format: Option<String>,

    /// Result ordering.
    #[arg(long, value_enum)]
    pub order: Option<OrderArg>,

    /// Results per page (1-100).
    #[arg(long)]
    pub limit: Option<u32>,

    /// Directory to save files into.
    #[arg(long, short, default_value = ".")]
    pub output: PathBuf,
}

/// Catalog subcommands.
#[derive(Subcommand, Debug, PartialEq)]
pub enum DbCommand {
    /// Browse books in the catalog.
    Browse(BrowseArgs),
    /// Show one book with full details.
    Show {
        /// External book id.
        book_id: String,
    },
    /// Bookmark a book.
    Save {
        /// External book id.
        book_id: String,
        /// Free-form notes.
        #[arg(long)]
        notes: Option<String>,
        /// Free-form tags.
        #[arg(long)]
        tags: Option<String>,
        /// Priority; higher lists first.
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Remove a bookmark.
    Unsave {
        /// External book id.
        book_id: String,
    },
    /// List bookmarks.
    Saved,
    /// List reading lists.
    Lists,
    /// Create a reading list.
    ListCreate {
        /// Unique list name.
        name: String,
        /// Optional description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Show a reading list and its books.
    ListShow {
        /// List name.
        name: String,
    },
    /// Add a book to a reading list.
    ListAdd {
        /// List name.
        name: String,
        /// External book id.
        book_id: String,
    },
    /// Remove a book from a reading list.
    ListRemove {
        /// List name.
        name: String,
        /// External book id.
        book_id: String,
    },
    /// Delete a reading list.
    ListDelete {
        /// List name.
        name: String,
    },
    /// Show recent downloads.
    Downloads {
        /// Maximum rows to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show recent searches.
    History {
        /// Maximum rows to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show catalog statistics.
    Stats,
    /// Export the catalog.
    Export(ExportArgs),
    /// Import a JSON export into the catalog.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },
    /// Compact the catalog database.
    Vacuum,
}

/// Arguments for `zshelf db browse`.
#[derive(ClapArgs, Debug, PartialEq, Default)]
pub struct BrowseArgs {
    /// Substring match on title.
    pub query: Option<String>,

    /// Substring match on author name.
    #[arg(long)]
    pub author: Option<String>,

    /// Exact language.
    #[arg(long)]
    pub language: Option<String>,

    /// Exact file extension.
    #[arg(long)]
    pub format: Option<String>,

    /// Lower year bound.
    #[arg(long)]
    pub year_from: Option<String>,

    /// Upper year bound.
    #[arg(long)]
    pub year_to: Option<String>,

    /// Maximum rows to show.
    #[arg(long, default_value_t = 50)]
    pub limit: i64,

    /// Rows to skip.
    #[arg(long, default_value_t = 0)]
    pub offset: i64,
}

/// Export format flag values.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Arguments for `zshelf db export`.
#[derive(ClapArgs, Debug, PartialEq)]
pub struct ExportArgs {
    /// Output serialization.
    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    pub format: ExportFormat,

    /// File to write; stdout when omitted.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}
