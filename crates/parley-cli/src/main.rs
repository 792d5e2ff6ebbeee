//! parley - terminal chat client.
//!
//! This is the entry point for the `parley` binary. Input lines are read
//! from stdin; runtime events are printed to stdout as they arrive. Logs go
//! to stderr.

mod app;
mod command;

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use parley_engine::builtin::DEFAULT_SEARCH_URL;
use parley_engine::DEFAULT_OLLAMA_HOST;
use parley_runtime::{ChatRuntime, RuntimeConfig};

use app::App;

/// parley - streaming, tool-augmented chat in the terminal.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the thread database.
    #[arg(long, env = "PARLEY_DATA_DIR", default_value = ".parley")]
    data_dir: PathBuf,

    /// Local model server.
    #[arg(long, env = "PARLEY_OLLAMA_HOST", default_value = DEFAULT_OLLAMA_HOST)]
    ollama_host: String,

    /// Search endpoint used by the web search tool.
    #[arg(long, env = "PARLEY_SEARCH_URL", default_value = DEFAULT_SEARCH_URL)]
    search_url: String,

    /// Proxy prefix for the web fetch tool.
    #[arg(long, env = "PARLEY_FETCH_PROXY")]
    fetch_proxy: Option<String>,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

impl Args {
    fn runtime_config(self) -> RuntimeConfig {
        RuntimeConfig {
            data_dir: self.data_dir,
            ollama_host: self.ollama_host,
            search_url: self.search_url,
            fetch_proxy: self.fetch_proxy,
            ..RuntimeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = args.runtime_config();
    tracing::debug!(data_dir = %config.data_dir.display(), "Starting");
    let (runtime, worker) = ChatRuntime::launch(config).await?;

    let mut app = App::new(runtime);
    app.print_banner();
    run_repl(&mut app).await?;

    // Dropping the runtime closes the command channel and stops the worker.
    drop(app);
    tokio::task::spawn_blocking(move || worker.join()).await??;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "info,parley=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Interleave stdin lines with runtime events until `/quit`, end of input
/// or worker shutdown.
async fn run_repl(app: &mut App) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => app.handle_line(&line).await,
                None => break,
            },
            event = app.runtime_mut().next_event() => match event {
                Some(event) => app.handle_event(event),
                None => {
                    tracing::warn!("Worker stopped");
                    break;
                }
            },
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}
