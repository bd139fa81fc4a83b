use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "quayside",
    version,
    about = "OCI Distribution registry: content-addressable blob/manifest store with resumable uploads and referrer indexing",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the registry HTTP server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 5000)]
        port: u16,

        #[arg(long, help = "Answer blob/manifest DELETE with 405 Method Not Allowed")]
        disable_delete: bool,

        #[arg(
            long,
            help = "Satisfy cross-repository mounts without a `from` repository by searching all repositories"
        )]
        auto_mount_discovery: bool,

        #[arg(
            long,
            help = "Return unfiltered referrers lists and leave artifactType filtering to clients"
        )]
        no_referrer_filtering: bool,
    },
}
