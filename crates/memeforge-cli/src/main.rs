use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use memeforge_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use memeforge_contracts::plan::{LayoutKind, ResolutionBounds};
use memeforge_contracts::session::history::{ChatHistory, HistoryEntry, TurnKind};
use memeforge_engine::config::{MemeConfig, ProviderMode};
use memeforge_engine::{error_chain_text, ChatTurn, MemeEngine};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "memeforge", version, about = "Chat-driven meme generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat: describe a meme, or just talk.
    Chat(ChatArgs),
    /// Generate one meme and print where it was written.
    Run(RunArgs),
    /// Print the chat history stored in a session directory.
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Session directory: history, events, summary and artifacts.
    #[arg(long)]
    out: PathBuf,
    /// Offline providers; no API keys or network needed.
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// TrueType font for captions.
    #[arg(long)]
    font: Option<PathBuf>,
    /// Force background removal on for every meme.
    #[arg(long, conflicts_with = "no_bg")]
    bg: bool,
    /// Force background removal off for every meme.
    #[arg(long)]
    no_bg: bool,
    /// Panel layout override: single, grid, vertical or horizontal.
    #[arg(long)]
    layout: Option<LayoutKind>,
    #[arg(long)]
    max_width: Option<u32>,
    #[arg(long)]
    max_height: Option<u32>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    out: PathBuf,
    /// Print raw JSON entries instead of a listing.
    #[arg(long)]
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init()
        .ok();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("memeforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Run(args) => run_once(args),
        Command::History(args) => run_history(args),
    }
}

fn build_config(args: &SessionArgs) -> MemeConfig {
    let mut config = MemeConfig::from_env();
    if args.dryrun {
        config.mode = ProviderMode::Dryrun;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    if let Some(font) = &args.font {
        config.font_path = Some(font.clone());
    }
    if args.max_width.is_some() || args.max_height.is_some() {
        config.resolution = ResolutionBounds::new(
            args.max_width.unwrap_or(config.resolution.max_width),
            args.max_height.unwrap_or(config.resolution.max_height),
        );
    }
    config
}

fn background_override(args: &SessionArgs) -> Option<bool> {
    match (args.bg, args.no_bg) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn open_engine(args: &SessionArgs) -> Result<MemeEngine> {
    let config = build_config(args);
    for warning in credential_warnings(&config) {
        eprintln!("warning: {warning}");
    }
    let mut engine = MemeEngine::new(config, &args.out)?;
    engine.set_background_removal(background_override(args));
    engine.set_layout(args.layout);
    Ok(engine)
}

fn credential_warnings(config: &MemeConfig) -> Vec<String> {
    if config.mode == ProviderMode::Dryrun {
        return Vec::new();
    }
    let mut warnings = Vec::new();
    if let Err(err) = config.require_groq_key() {
        warnings.push(format!(
            "{err}; meme requests will use your words as the caption"
        ));
    }
    if let Err(err) = config.require_xai_key() {
        warnings.push(format!(
            "{err}; captions stay unpolished and #play-it-safe replies will apologise"
        ));
    }
    if let Err(err) = config.require_search_credentials() {
        warnings.push(format!(
            "{err}; meme requests will fail until image search is set up"
        ));
    }
    warnings
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut engine = open_engine(&args.session)?;
    let stdin = io::stdin();
    let mut line = String::new();

    println!("MemeForge chat started. Type /help for commands.");
    println!("End a message with #play-it-safe for a real answer, or a meme if you ask for one.");
    println!("Without it, expect maximum sass. /meme <text> always makes a meme.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => continue,
            "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
            "meme" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                print_turn(&engine.meme_turn(&prompt));
            }
            "message" => {
                let prompt = intent.prompt.clone().unwrap_or_default();
                print_turn(&engine.respond(&prompt));
            }
            "set_background_removal" => {
                let enabled = toggled_background(&intent, engine.background_removal());
                engine.set_background_removal(Some(enabled));
                println!("Background removal {}", if enabled { "on" } else { "off" });
            }
            "set_layout" => {
                let layout = intent
                    .command_args
                    .get("layout")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<LayoutKind>().ok());
                engine.set_layout(layout);
                println!("Layout: {}", layout.map(LayoutKind::as_str).unwrap_or("auto"));
            }
            "history" => {
                if engine.history().is_empty() {
                    println!("No history yet.");
                }
                for (idx, entry) in engine.history().iter().enumerate() {
                    println!("{}", format_history_entry(idx, entry));
                }
            }
            "clear_history" => {
                engine.clear_history()?;
                println!("History cleared.");
            }
            "quit" => break,
            "invalid" => {
                let message = intent
                    .command_args
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Invalid command.");
                println!("{message}");
            }
            "unknown" => {
                let command = intent
                    .command_args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            other => tracing::debug!(action = other, "unhandled chat action"),
        }
    }

    let summary = engine.finish()?;
    println!(
        "Session saved to {}: {} memes, {} replies, {} failed.",
        engine.out_dir().display(),
        summary.memes,
        summary.replies,
        summary.failures
    );
    Ok(0)
}

fn run_once(args: RunArgs) -> Result<i32> {
    let mut engine = open_engine(&args.session)?;
    let code = match engine.submit(&args.prompt) {
        Ok(artifact) => {
            for warning in &artifact.warnings {
                eprintln!("note: {warning}");
            }
            println!("{}", artifact.output_path.display());
            0
        }
        Err(err) => {
            eprintln!("{}", err.friendly_message());
            eprintln!("memeforge error: {}", error_chain_text(&err, 512));
            1
        }
    };
    engine.finish()?;
    Ok(code)
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let path = history_path(&args.out);
    let history = ChatHistory::load(&path);
    if args.json {
        println!("{}", serde_json::to_string_pretty(history.entries())?);
        return Ok(0);
    }
    if history.entries().is_empty() {
        println!("No history in {}", path.display());
        return Ok(0);
    }
    for (idx, entry) in history.entries().iter().enumerate() {
        println!("{}", format_history_entry(idx, entry));
    }
    Ok(0)
}

fn history_path(out: &Path) -> PathBuf {
    out.join("history.json")
}

/// `/bg` without an argument flips the current setting.
fn toggled_background(intent: &Intent, current: Option<bool>) -> bool {
    intent
        .command_args
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(!current.unwrap_or(false))
}

fn print_turn(turn: &ChatTurn) {
    match turn {
        ChatTurn::Meme {
            reply,
            artifact_path,
            warnings,
        } => {
            println!("{reply}");
            println!("Saved {}", artifact_path.display());
            for warning in warnings {
                println!("  note: {warning}");
            }
        }
        ChatTurn::Reply { text } => println!("{text}"),
        ChatTurn::Failed { message } => println!("{message}"),
    }
}

fn format_history_entry(idx: usize, entry: &HistoryEntry) -> String {
    let marker = match entry.kind {
        TurnKind::Meme => "meme",
        TurnKind::Reply => "chat",
        TurnKind::Failed => "FAILED",
    };
    let mut lines = vec![
        format!("{:>3}. [{marker}] {}", idx + 1, entry.request.raw.trim()),
        format!("     {}", entry.reply),
    ];
    if let Some(path) = &entry.artifact_path {
        lines.push(format!("     image: {path}"));
    }
    if let Some(error) = &entry.error {
        lines.push(format!("     error: {error}"));
    }
    lines.join("\n")
}
