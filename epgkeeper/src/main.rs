mod dump;
mod reset;
mod serve;

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use epgkeeper_core::tracing_ext::init_tracing;
use epgkeeper_core::tracing_ext::LogFormat;
use epgkeeper_core::*;

#[derive(Parser)]
#[command(author, version, about)]
struct CommandLine {
    /// Path to a configuration file in a YAML format.
    ///
    /// The EPGKEEPER_CONFIG environment variable is used if this option is not
    /// specified.
    #[arg(short, long, env = "EPGKEEPER_CONFIG")]
    config: PathBuf,

    /// Logging format: text or json.
    #[arg(long, env = "EPGKEEPER_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Keep program guides up to date (default).
    Serve,

    /// Print persisted tables and their tags in JSON lines.
    Dump(dump::CommandLine),

    /// Delete all persisted data.
    Reset(reset::CommandLine),
}

#[tokio::main]
async fn main() {
    let cl = CommandLine::parse();

    init_tracing(cl.log_format);

    let config = config::load(&cl.config);

    match cl.command {
        None | Some(Command::Serve) => serve::main(config).await,
        Some(Command::Dump(ref dump_cl)) => dump::main(&config, dump_cl),
        Some(Command::Reset(ref reset_cl)) => reset::main(config, reset_cl).await,
    }
}
