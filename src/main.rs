//! `speakd` command line: run the server, or talk to a running one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use speakd::client::Client;
use speakd::config::{Config, LogFormat, parse_port};
use speakd::server::{ConnectionOptions, Server};
use speakd::speech::SpeechService;

#[derive(Parser, Debug)]
#[command(name = "speakd", version, about = "Local text-to-speech daemon")]
struct Cli {
    /// Config file (defaults to the per-user config dir)
    #[arg(long, short, global = true, env = "SPEAKD_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long, global = true, env = "SPEAKD_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, short, global = true, env = "SPEAKD_PORT", value_parser = parse_port)]
    port: Option<u16>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the speech server
    Serve {
        /// Synthesis backend: mock, voicevox or elevenlabs
        #[arg(long, env = "SPEAKD_BACKEND")]
        backend: Option<String>,

        /// Directory for synthesized WAV files
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Check that the server is up
    Ping,
    /// Print the server state as JSON
    State,
    /// Speak text
    Say {
        /// Text to speak; joined with spaces
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Stream stdin to the server line by line
    Stream {
        /// Session id to request
        #[arg(long)]
        id: Option<String>,

        /// Return once finished instead of waiting for playback
        #[arg(long)]
        no_wait: bool,
    },
    /// Stop playback
    Stop {
        /// Also drop everything queued and abort streams
        #[arg(long)]
        clear: bool,
    },
    /// Change the voice
    Voice { voice: String },
    /// Play a WAV file through the server
    Play {
        path: PathBuf,

        /// Stop the current item and drop the queue first
        #[arg(long)]
        interrupt: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config);

    let client = Client::new(config.server.addr());
    match cli.command {
        Command::Serve {
            backend,
            output_dir,
        } => {
            if let Some(backend) = backend {
                config.backend.provider = backend;
            }
            if let Some(dir) = output_dir {
                config.synthesis.output_dir = Some(dir);
            }
            serve(config).await
        }
        Command::Ping => {
            client.ping().await?;
            println!("ok");
            Ok(())
        }
        Command::State => {
            let state = client.state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::Say { text } => {
            let accepted = client.speak(&text.join(" ")).await?;
            println!("accepted {accepted}");
            Ok(())
        }
        Command::Stream { id, no_wait } => stream_stdin(&client, id.as_deref(), no_wait).await,
        Command::Stop { clear } => {
            if clear {
                client.stop_and_clear().await
            } else {
                client.stop_all().await
            }
        }
        Command::Voice { voice } => client.set_voice(&voice).await,
        Command::Play { path, interrupt } => {
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            client.play(&path.display().to_string(), interrupt).await
        }
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("speakd={}", config.logging.level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Pretty => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: Config) -> Result<()> {
    let service = Arc::new(SpeechService::from_config(&config)?);
    let server = Server::bind(
        &config.server.addr(),
        service.clone(),
        ConnectionOptions::from_config(&config.server)?,
    )
    .await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            signal.cancel();
        }
    });

    server.run(shutdown).await?;
    service.shutdown().await;
    Ok(())
}

/// Push each stdin line as it arrives, then finish and optionally wait
/// for the server to play everything.
async fn stream_stdin(client: &Client, id: Option<&str>, no_wait: bool) -> Result<()> {
    let mut stream = client.begin_stream(id).await?;
    eprintln!("stream {}", stream.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        stream.push(&format!("{line}\n"));
    }
    stream.finish(Duration::from_secs(1)).await;

    if !no_wait {
        stream.wait(None).await?;
    }
    Ok(())
}
