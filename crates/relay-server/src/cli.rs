use clap::Parser;

/// Command-line flags for the relay binary, following the same shape as
/// the teacher stack's own mint daemon: a single optional config-file
/// override, everything else lives in the file/environment.
#[derive(Parser)]
#[command(about = "A pub/sub relay", author = env!("CARGO_PKG_AUTHORS"), version = env!("CARGO_PKG_VERSION"))]
pub struct CliArgs {
    /// Path to a TOML config file. Defaults to `./relay.toml` if present.
    #[arg(short, long)]
    pub config: Option<String>,
}
