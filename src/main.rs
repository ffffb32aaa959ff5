//! Threadmind CLI
//!
//! A plain terminal chat with threaded memory and a shared entity graph.

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use threadmind::{ChatAgent, FileStore, OpenAiClient, ThreadmindConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Threadmind - chat with an assistant that remembers
#[derive(Parser, Debug)]
#[command(name = "threadmind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding config.toml and the memory store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Model name, overrides config.toml
    #[arg(short, long)]
    model: Option<String>,

    /// Thread to open instead of the most recent one
    #[arg(short, long)]
    thread: Option<String>,

    /// Verbose output: debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Send one message, print the reply and exit
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,
}

/// REPL input
#[derive(Debug, PartialEq)]
enum Command {
    New(Option<String>),
    Threads,
    Switch(String),
    Rename(String),
    Delete(Option<String>),
    Entities,
    Summary,
    Help,
    Quit,
    Say(String),
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Say(line.to_string()));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };

        Some(match (name, arg) {
            ("new", arg) => Self::New(arg),
            ("threads", _) => Self::Threads,
            ("switch", Some(id)) => Self::Switch(id),
            ("rename", Some(name)) => Self::Rename(name),
            ("delete", arg) => Self::Delete(arg),
            ("entities", _) => Self::Entities,
            ("summary", _) => Self::Summary,
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            (other, _) => Self::Unknown(other.to_string()),
        })
    }
}

const HELP: &str = "Commands:
  /new [name]      start a new thread and switch to it
  /threads         list threads
  /switch <id>     switch thread (id prefix is enough)
  /rename <name>   rename the current thread
  /delete [id]     delete a thread (default: current)
  /entities        show remembered entities
  /summary         show the current thread's summary
  /quit            exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => get_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir).await?;

    let mut config = ThreadmindConfig::load(&data_dir).await?;
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }

    info!("Starting Threadmind");
    info!("Data directory: {:?}", data_dir);

    let store = Arc::new(FileStore::new(config.store_dir()).await?);
    let llm = Arc::new(OpenAiClient::new(&config.llm)?);
    info!("Store: {:?}", store.root());
    info!("Model: {}", llm.model());
    let agent = ChatAgent::new(config, llm, store).await?;

    if let Some(thread) = cli.thread {
        let id = resolve_thread(&agent, &thread).await?;
        agent.switch_thread(&id).await?;
    }

    if !cli.prompt.is_empty() {
        let thread_id = agent.current_thread_id().await;
        let reply = agent.send_turn(&thread_id, &cli.prompt.join(" ")).await?;
        println!("{}", reply);
        agent.shutdown().await?;
        return Ok(());
    }

    run_repl(&agent).await?;
    agent.shutdown().await?;
    Ok(())
}

async fn run_repl(agent: &ChatAgent) -> anyhow::Result<()> {
    print_current(agent).await;
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        match handle(agent, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}

/// Run one REPL command. Returns false when the user asked to quit.
async fn handle(agent: &ChatAgent, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Say(text) => {
            let thread_id = agent.current_thread_id().await;
            let reply = agent.send_turn(&thread_id, &text).await?;
            println!("{}\n", reply);
        }
        Command::New(name) => {
            let thread = agent.create_thread(name.as_deref().unwrap_or("")).await?;
            agent.switch_thread(&thread.id).await?;
            print_current(agent).await;
        }
        Command::Threads => {
            let current = agent.current_thread_id().await;
            for thread in agent.list_threads().await {
                let marker = if thread.id == current { "*" } else { " " };
                println!(
                    "{} {}  {}  ({} messages, last {})",
                    marker,
                    short_id(&thread.id),
                    thread.name,
                    thread.message_count,
                    thread.last_message_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Switch(prefix) => {
            let id = resolve_thread(agent, &prefix).await?;
            agent.switch_thread(&id).await?;
            print_current(agent).await;
        }
        Command::Rename(name) => {
            let id = agent.current_thread_id().await;
            agent.rename_thread(&id, &name).await?;
            println!("Renamed to {}", name);
        }
        Command::Delete(prefix) => {
            let id = match prefix {
                Some(prefix) => resolve_thread(agent, &prefix).await?,
                None => agent.current_thread_id().await,
            };
            agent.delete_thread(&id).await?;
            println!("Deleted {}", short_id(&id));
            print_current(agent).await;
        }
        Command::Entities => {
            let graph = agent.entities().await;
            if graph.is_empty() {
                println!("No entities remembered yet.");
            }
            for node in graph.nodes.values() {
                println!("{} [{}] {}: {}", node.id, node.entity_type, node.name, node.description);
                for rel in &node.relationships {
                    println!("    -[{}]-> {} ({:.2})", rel.relationship, rel.target_id, rel.strength);
                }
            }
        }
        Command::Summary => {
            match agent.current_summary().await {
                Some(summary) => println!(
                    "{}\n(covers {} messages, updated {})",
                    summary.summary,
                    summary.message_count,
                    summary.last_updated.format("%Y-%m-%d %H:%M")
                ),
                None => println!("No summary yet."),
            }
            let stats = agent.summarizer_stats();
            println!(
                "Summarizer: {} runs, {} skipped, {} failed, {} unparsed entity blocks",
                stats.runs(),
                stats.skipped(),
                stats.failures(),
                stats.parse_failures()
            );
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
        Command::Unknown(name) => println!("Unknown command /{}. Type /help.", name),
    }
    Ok(true)
}

async fn print_current(agent: &ChatAgent) {
    let current = agent.current_thread_id().await;
    let threads = agent.list_threads().await;
    if let Some(thread) = threads.iter().find(|t| t.id == current) {
        println!(
            "Thread {} \"{}\" ({} messages)",
            short_id(&thread.id),
            thread.name,
            thread.message_count
        );
    }
}

/// Resolve a full id or unique id prefix
async fn resolve_thread(agent: &ChatAgent, prefix: &str) -> anyhow::Result<String> {
    let matches: Vec<String> = agent
        .list_threads()
        .await
        .into_iter()
        .map(|t| t.id)
        .filter(|id| id.starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(anyhow::anyhow!("No thread matches {}", prefix)),
        _ => Err(anyhow::anyhow!("Thread prefix {} is ambiguous", prefix)),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Get the Threadmind data directory
fn get_data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(home) = std::env::var("THREADMIND_HOME") {
        return Ok(PathBuf::from(home));
    }

    // Default to ~/.threadmind
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".threadmind"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir() {
        let result = get_data_dir();
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse("hello there"), Some(Command::Say("hello there".into())));
        assert_eq!(Command::parse("/new"), Some(Command::New(None)));
        assert_eq!(
            Command::parse("/new Trip to Rome"),
            Some(Command::New(Some("Trip to Rome".into())))
        );
        assert_eq!(Command::parse("/switch ab12"), Some(Command::Switch("ab12".into())));
        assert_eq!(Command::parse("/switch"), Some(Command::Unknown("switch".into())));
        assert_eq!(Command::parse("/delete"), Some(Command::Delete(None)));
        assert_eq!(Command::parse("/quit"), Some(Command::Quit));
        assert_eq!(Command::parse("/bogus"), Some(Command::Unknown("bogus".into())));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
