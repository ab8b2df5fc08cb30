use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use live_agent::agent::Agent;
use live_agent::audio::CpalDevices;
use live_agent::classification::{GeminiClassifier, TextClassifier};
use live_agent::effects::SessionDeps;
use live_agent::record::CallRecord;
use live_agent::settings::{api_key_from_env, load_settings};
use live_agent::store::JsonStore;
use live_agent::streaming::GeminiLiveConnector;
use live_agent::{LiveAgent, UiState, UiStatus};

const AGENTS_FILE: &str = "agents.json";
const CALLS_FILE: &str = "calls.json";

/// Talk to a realtime voice agent from the terminal
#[derive(Parser, Debug)]
#[command(name = "live-agent", version, about)]
struct Args {
    /// Agent id from the agents store (default: built-in demo agent)
    #[arg(long)]
    agent: Option<String>,

    /// Directory holding agents.json, calls.json and recordings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Start with the microphone muted
    #[arg(long)]
    muted: bool,

    /// Connect right away instead of waiting for `c`
    #[arg(long)]
    connect: bool,
}

fn init_logging() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

fn print_help() {
    println!("Commands: c = connect, d = disconnect, m = mute/unmute, l = recent calls, q = quit");
}

fn render(state: &UiState) -> String {
    let status = match &state.status {
        UiStatus::Disconnected => "disconnected".to_string(),
        UiStatus::Connecting => "connecting".to_string(),
        UiStatus::Live { elapsed_secs } => {
            format!("live {:02}:{:02}", elapsed_secs / 60, elapsed_secs % 60)
        }
        UiStatus::Error {
            message,
            needs_credential,
        } => {
            if *needs_credential {
                format!("error: {} (set GEMINI_API_KEY)", message)
            } else {
                format!("error: {}", message)
            }
        }
    };
    let mute = if state.muted { " [muted]" } else { "" };
    format!("[{}{}] mic {:>3.0}", status, mute, state.volume)
}

fn print_calls(calls: &JsonStore<CallRecord>) {
    let records = calls.list();
    if records.is_empty() {
        println!("No calls yet");
        return;
    }
    for record in records.iter().take(10) {
        println!(
            "{}  {:<28} {:>7}  {:?}",
            record.started_at.format("%Y-%m-%d %H:%M"),
            record.participant_label,
            record.duration_display(),
            record.sentiment
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    init_logging();

    // tokio-tungstenite uses rustls; pick the ring provider explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(dir) = &args.data_dir {
        settings.data_dir = Some(dir.clone());
    }

    let data_dir = settings
        .resolved_data_dir()
        .context("Could not determine data directory; pass --data-dir")?;
    let recordings_dir = settings
        .resolved_recordings_dir()
        .context("Could not determine recordings directory")?;

    let agents = JsonStore::<Agent>::open(data_dir.join(AGENTS_FILE))?;
    let calls = Arc::new(JsonStore::<CallRecord>::open(data_dir.join(CALLS_FILE))?);

    let agent = match &args.agent {
        Some(id) => Some(
            agents
                .get(id)
                .with_context(|| format!("No agent with id {:?} in {:?}", id, agents.path()))?,
        ),
        None => None,
    };

    let classifier: Option<Arc<dyn TextClassifier>> = api_key_from_env().map(|key| {
        Arc::new(GeminiClassifier::new(key, settings.classifier_model.clone()))
            as Arc<dyn TextClassifier>
    });

    let engine = LiveAgent::start(SessionDeps {
        connector: Arc::new(GeminiLiveConnector::new()),
        devices: Arc::new(CpalDevices::new()),
        classifier,
        sink: calls.clone(),
        credential: Arc::new(api_key_from_env),
        settings,
        agent,
        recordings_dir,
    });

    // Status line printer
    let mut ui = engine.ui();
    tokio::spawn(async move {
        let mut last_log = None;
        while ui.changed().await.is_ok() {
            let state = ui.borrow_and_update().clone();
            if let Some(line) = state.logs.last() {
                if last_log.as_ref() != Some(line) {
                    println!("> {}", line);
                    last_log = Some(line.clone());
                }
            }
            println!("{}", render(&state));
        }
    });

    print_help();
    if args.connect {
        engine.connect().await?;
    }
    if args.muted {
        engine.toggle_mute().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "c" => engine.connect().await?,
                    "d" => engine.disconnect().await?,
                    "m" => engine.toggle_mute().await?,
                    "l" => print_calls(&calls),
                    "q" => break,
                    "" => {}
                    _ => print_help(),
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
