use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use meta_strip::config::Config;
use meta_strip::orchestrator::{
    Operation, OrchestratorContext, Phase, Snapshot, UploadError, UploadOrchestrator,
};
use meta_strip::picker::{DropboxPicker, FilePicker, GoogleDrivePicker, LocalFilePicker};
use meta_strip::service::ImageMetadata;

#[derive(Parser, Debug)]
#[command(
    name = "meta-strip",
    version,
    about = "Inspect and strip image metadata through a remote service, with a resumable session"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Select a local image
    Open {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Select an image from Google Drive (needs cloud.google_access_token)
    Drive {
        #[arg(value_name = "FILE_ID")]
        file_id: String,
        /// File name to use for the selection
        #[arg(long)]
        name: String,
        /// MIME type reported by Drive, if known
        #[arg(long)]
        mime: Option<String>,
    },
    /// Select an image from a Dropbox direct link
    Dropbox {
        #[arg(value_name = "LINK")]
        link: String,
        /// File name to use for the selection
        #[arg(long)]
        name: String,
    },
    /// Show the metadata embedded in the selected image
    Inspect,
    /// Download a copy of the selected image without metadata
    Strip,
    /// Show the current session
    Show,
    /// Forget the selected image
    Reset,
    /// Check that the metadata service is reachable
    Health,
    /// Interactive session; rate limits apply across commands
    Shell,
}

/// One line typed into the shell.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Handle --init
    if cli.init {
        let config = Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("No command specified. Use --help for usage.");
    };

    let config = Config::load(cli.config.as_deref())?;
    let orchestrator = UploadOrchestrator::start(OrchestratorContext::from_config(&config)?).await;

    match command {
        Command::Shell => run_shell(&orchestrator, &config, cli.json).await,
        command => {
            if !run_command(&orchestrator, &config, command, cli.json).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Run one command. Returns `false` when it failed in a way already
/// reported to the user.
async fn run_command(
    orchestrator: &UploadOrchestrator,
    config: &Config,
    command: Command,
    json: bool,
) -> Result<bool> {
    let outcome = match command {
        Command::Open { path } => select(orchestrator, &LocalFilePicker::new(path), json).await,
        Command::Drive {
            file_id,
            name,
            mime,
        } => {
            let picker = GoogleDrivePicker::new(
                file_id,
                name,
                mime,
                config.cloud.google_access_token.clone(),
            );
            select(orchestrator, &picker, json).await
        }
        Command::Dropbox { link, name } => {
            select(orchestrator, &DropboxPicker::new(link, name), json).await
        }
        Command::Inspect => match orchestrator.inspect().await {
            Ok(metadata) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&metadata)?);
                } else {
                    print_metadata(&metadata);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Strip => match orchestrator.strip().await {
            Ok(path) => {
                if json {
                    println!("{}", serde_json::json!({ "saved": path.display().to_string() }));
                } else {
                    println!("{GREEN}Saved clean copy:{RESET} {}", path.display());
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Show => {
            let snapshot = orchestrator.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot_json(orchestrator, &snapshot))?);
            } else {
                print_snapshot(orchestrator, &snapshot);
            }
            Ok(())
        }
        Command::Reset => {
            orchestrator.reset().await;
            if !json {
                println!("Session cleared");
            }
            Ok(())
        }
        Command::Health => match orchestrator.health().await {
            Ok(text) => {
                println!("{GREEN}●{RESET} {}", text.trim());
                Ok(())
            }
            Err(e) => {
                log::error!("{e}");
                return Ok(false);
            }
        },
        Command::Shell => {
            log::warn!("Already in a shell");
            Ok(())
        }
    };

    match outcome {
        Ok(()) => Ok(true),
        Err(e) => {
            report(orchestrator, &e, json);
            Ok(false)
        }
    }
}

async fn select(
    orchestrator: &UploadOrchestrator,
    picker: &dyn FilePicker,
    json: bool,
) -> Result<(), UploadError> {
    if !orchestrator.select_from(picker).await? {
        if json {
            println!("{}", cancelled_json());
        } else {
            println!("{DIM}No file selected{RESET}");
        }
        return Ok(());
    }
    if let Some(file) = orchestrator.current_file() {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "name": file.name,
                    "type": file.mime_type,
                    "size": file.size(),
                })
            );
        } else {
            println!(
                "{GREEN}Selected:{RESET} {} {DIM}({}, {}){RESET}",
                file.name,
                file.mime_type,
                format_size(file.size())
            );
        }
    }
    Ok(())
}

/// Show a failure. User-facing errors are dismissed once shown so they
/// don't linger into the next command.
fn report(orchestrator: &UploadOrchestrator, err: &UploadError, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "error": err.to_string() }));
    } else if err.is_user_facing() {
        log::error!("{err}");
    } else {
        log::warn!("{err}");
    }
    if err.is_user_facing() {
        orchestrator.dismiss_error();
    }
}

async fn run_shell(orchestrator: &UploadOrchestrator, config: &Config, json: bool) -> Result<()> {
    println!("{BOLD}meta-strip shell{RESET} {DIM}(type `help` for commands, `quit` to exit){RESET}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(prompt(orchestrator.phase()).as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit" | "exit"] => break,
            ["dismiss"] => orchestrator.dismiss_error(),
            _ => match ShellLine::try_parse_from(words.iter().copied()) {
                Ok(ShellLine { command }) => {
                    run_command(orchestrator, config, command, json).await?;
                }
                Err(e) => {
                    // clap renders help and usage errors itself
                    let _ = e.print();
                }
            },
        }
    }

    Ok(())
}

fn prompt(phase: Phase) -> String {
    let label = match phase {
        Phase::Empty => "empty",
        Phase::Selected => "selected",
        Phase::Inspecting => "inspecting",
        Phase::Stripping => "stripping",
    };
    format!("{DIM}[{label}]{RESET} > ")
}

/// What `--json` prints when the user backs out of a picker.
fn cancelled_json() -> serde_json::Value {
    serde_json::json!({ "selected": null })
}

fn snapshot_json(orchestrator: &UploadOrchestrator, snapshot: &Snapshot) -> serde_json::Value {
    let inspect = orchestrator.rate_status(Operation::Inspect);
    let strip = orchestrator.rate_status(Operation::Strip);
    serde_json::json!({
        "phase": format!("{:?}", snapshot.phase),
        "file": snapshot.file.as_ref().map(|f| serde_json::json!({
            "name": f.name,
            "type": f.mime_type,
            "size": f.size,
            "lastModified": f.last_modified,
        })),
        "metadata": snapshot.metadata,
        "error": snapshot.error.as_ref().map(|e| e.to_string()),
        "limits": {
            "inspect": { "remaining": inspect.remaining, "retryAfter": inspect.retry_after },
            "strip": { "remaining": strip.remaining, "retryAfter": strip.retry_after },
        },
    })
}

// ANSI color codes
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

fn print_snapshot(orchestrator: &UploadOrchestrator, snapshot: &Snapshot) {
    println!();
    match &snapshot.file {
        Some(file) => {
            println!("{BOLD}File:{RESET} {}", file.name);
            println!("{DIM}{}{RESET}", "═".repeat(72));
            print_row("Type", &file.mime_type);
            print_row("Size", &format_size(file.size));
            print_row("State", &format!("{:?}", snapshot.phase));
        }
        None => println!("  {DIM}(no file selected){RESET}"),
    }

    for (label, op) in [("Inspect", Operation::Inspect), ("Strip", Operation::Strip)] {
        let status = orchestrator.rate_status(op);
        let value = if status.remaining > 0 {
            format!("{} left", status.remaining)
        } else {
            format!("none left, retry in {}s", status.retry_after)
        };
        print_row(&format!("{label} requests"), &value);
    }

    if let Some(err) = &snapshot.error {
        print_row("Error", &err.to_string());
    }
    println!();

    if let Some(metadata) = &snapshot.metadata {
        print_metadata(metadata);
    }
}

/// Print an inspect result, one section per metadata group.
fn print_metadata(metadata: &ImageMetadata) {
    println!();
    println!("{BOLD}File:{RESET} {}", metadata.file_name);
    println!("{DIM}{}{RESET}", "═".repeat(72));

    if !metadata.has_metadata {
        println!("  {DIM}(no metadata found){RESET}");
        println!();
        return;
    }

    if metadata.has_location() {
        println!("  {YELLOW}! This image contains location data{RESET}");
        println!();
    }

    let mut shown = 0;
    for group in metadata.groups() {
        println!("  {BOLD}{}{RESET}", group.group_name);
        println!("  {DIM}{}{RESET}", "─".repeat(70));
        for (tag, val) in &group.data {
            print_row(display_tag(tag), val);
        }
        println!();
        shown += 1;
    }

    // Service reported tags but filed none of them under a group
    if shown == 0 {
        println!("  {BOLD}All Tags{RESET}");
        println!("  {DIM}{}{RESET}", "─".repeat(70));
        for (tag, val) in &metadata.exif_data {
            print_row(display_tag(tag), val);
        }
        println!();
    }

    println!("  {DIM}{} field(s) total{RESET}", metadata.exif_data.len());
    println!();
}

/// Tags arrive as `"<directory> - <tag>"`; the directory is noise here.
fn display_tag(key: &str) -> &str {
    key.split_once(" - ").map_or(key, |(_, tag)| tag)
}

fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{bytes} B")
    } else if b < KIB * KIB {
        format!("{:.1} KB", b / KIB)
    } else {
        format!("{:.1} MB", b / (KIB * KIB))
    }
}

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print a single row in the metadata table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
