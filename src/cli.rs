use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a bookmark
    Add {
        /// a url
        #[clap(allow_hyphen_values = true)]
        url: Option<String>,

        /// Bookmark title
        #[clap(short, long)]
        title: Option<String>,

        /// Bookmark description
        #[clap(short, long)]
        description: Option<String>,

        /// Bookmark category
        #[clap(short, long)]
        category: Option<String>,

        /// Bookmark tags
        #[clap(short = 'g', long)]
        tags: Option<String>,

        /// Attach a file (pdf, docx, plain text). Repeatable.
        #[clap(short, long = "file")]
        files: Vec<PathBuf>,
    },
    /// Edit a bookmark
    Edit {
        id: u64,

        /// a url, empty to clear
        #[clap(short, long)]
        url: Option<String>,

        /// Bookmark title
        #[clap(short, long)]
        title: Option<String>,

        /// Bookmark description
        #[clap(short, long)]
        description: Option<String>,

        /// Bookmark category, empty to clear
        #[clap(short, long)]
        category: Option<String>,

        /// Replace tags
        #[clap(long)]
        tags: Option<String>,

        /// Appends tags
        #[clap(short = 'a', long)]
        append_tags: Option<String>,

        /// Attach a file. Repeatable.
        #[clap(short, long = "file")]
        files: Vec<PathBuf>,

        /// Detach a file by name. Repeatable.
        #[clap(long = "detach")]
        detach: Vec<String>,
    },
    /// Delete a bookmark
    Delete {
        id: u64,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Show a bookmark
    Show { id: u64 },
    /// Search bookmarks by keyword, title, category or tags
    Search {
        /// Keywords matched against every field
        keyword: Option<String>,

        /// Bookmark title
        #[clap(short, long)]
        title: Option<String>,

        /// Bookmark category
        #[clap(short, long)]
        category: Option<String>,

        /// Bookmark tags
        #[clap(short = 'g', long, allow_hyphen_values = true)]
        tags: Option<String>,

        /// id
        #[clap(short, long)]
        id: Option<u64>,

        /// Exact search. False by default.
        #[clap(short, long, default_value = "false")]
        exact: bool,

        /// Maximum number of results
        #[clap(short = 'n', long)]
        limit: Option<usize>,

        /// Print the count
        #[clap(long, default_value = "false")]
        count: bool,
    },
    /// Search bookmarks by meaning
    Semantic {
        query: String,

        /// Number of results, defaults to `semantic_search.default_limit`
        #[clap(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Rebuild the semantic index from all bookmarks
    Reindex {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// Show recent semantic searches
    History {
        /// Forget all recorded searches
        #[clap(long, default_value = "false")]
        clear: bool,
    },
    /// Show bookmark and index statistics
    Stats,
}
