mod agent;
mod ai_sdk;
mod client;
mod consumer;
mod platform;
mod protocol;
mod server;
mod speech;
mod tools;
mod ui;

use agent::{AgentConfig, DEFAULT_API_BASE, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaychat", about = "Streaming chat relay and terminal client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay endpoint in front of the model provider.
    Serve {
        #[arg(long, env = "RELAYCHAT_LISTEN", default_value = "127.0.0.1:3000")]
        listen: String,
        #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
        api_key: String,
        #[arg(long, env = "RELAYCHAT_MODEL", default_value = DEFAULT_MODEL)]
        model: String,
        #[arg(long, env = "RELAYCHAT_API_BASE", default_value = DEFAULT_API_BASE)]
        api_base: String,
        #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
        max_output_tokens: u32,
        /// Upper bound on a whole upstream call, streaming included.
        #[arg(long, default_value_t = 60)]
        upstream_timeout_secs: u64,
    },
    /// Chat through a running relay.
    Chat {
        #[arg(long, env = "RELAYCHAT_URL", default_value = "http://127.0.0.1:3000")]
        url: String,
        /// Start with the speaker muted.
        #[arg(long)]
        mute: bool,
        /// Text-to-speech program, e.g. "espeak" or "say".
        #[arg(long, env = "RELAYCHAT_SPEECH_COMMAND")]
        speech_command: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "relaychat=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            listen,
            api_key,
            model,
            api_base,
            max_output_tokens,
            upstream_timeout_secs,
        } => {
            init_tracing();
            let config = server::ServerConfig {
                listen,
                agent: AgentConfig {
                    api_key,
                    model,
                    api_base,
                    max_output_tokens,
                    timeout: Duration::from_secs(upstream_timeout_secs),
                },
            };
            server::run(config).await
        }
        Commands::Chat {
            url,
            mute,
            speech_command,
        } => {
            // The TUI owns the terminal; only log when asked to.
            if std::env::var_os("RUST_LOG").is_some() {
                init_tracing();
            }
            ui::run_tui(ui::ChatConfig {
                url,
                muted: mute,
                speech_command,
            })
        }
    }
}
