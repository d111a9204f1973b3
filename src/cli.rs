use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory (config, exhibit store, vector index).
    /// Falls back to $ARCHIVIO_DIR, then ./data.
    #[clap(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API server
    Daemon {},

    /// Archive one URL and print the resulting exhibit
    Archive {
        /// The URL to look up in the snapshot index
        url: String,

        /// Earliest acceptable capture date (YYYYMMDD)
        #[clap(long)]
        from: Option<String>,

        /// Latest acceptable capture date (YYYYMMDD)
        #[clap(long)]
        to: Option<String>,
    },

    /// Semantic search over archived exhibits
    Search {
        query: String,

        #[clap(short, long, default_value = "10")]
        limit: usize,

        /// Only exhibits from this domain
        #[clap(long)]
        domain: Option<String>,

        /// Only captures from this year onward
        #[clap(long)]
        year_from: Option<u16>,

        /// Only captures up to this year
        #[clap(long)]
        year_to: Option<u16>,
    },

    /// Print (generating if needed) the context narrative for an exhibit
    Context {
        exhibit_id: String,
    },
}
