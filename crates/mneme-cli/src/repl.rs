//! REPL – Read-Eval-Print Loop for the mneme interactive shell.
//!
//! Supported slash-commands:
//!   /store obs <text>                 – store an observation
//!   /store act <type[:target]> <text> – store a successful action
//!   /store wf <name> <text>           – store a successful workflow
//!   /search <query>                   – semantic search across all kinds
//!   /get <id> | /delete <id> | /pin <id>
//!   /stats | /quota | /retain         – usage and retention
//!   /session [new|end|<id>]           – show or switch the active session
//!   /settings                         – edit `~/.mneme/config.toml`
//!   /help
//!   /quit | /exit                     – close the store and exit

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mneme_kernel::AuditLog;
use mneme_memory::{MemoryManager, SearchResults};
use mneme_types::{ActionSpec, MemoryId, Metadata, RecordKind, Source, keys};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;

use crate::config::{self, Config, EmbedderKind};

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum StoreKind {
    Observation,
    Action(ActionSpec),
    Workflow(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Store { kind: StoreKind, text: String },
    Search(String),
    Get(MemoryId),
    Delete(MemoryId),
    Pin(MemoryId),
    Stats,
    Quota,
    Retain,
    Session(SessionCommand),
    Settings,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Show,
    New,
    End,
    Resume(String),
}

/// Parse one input line. Errors are user-facing messages.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let id = |usage: &str| -> Result<MemoryId, String> {
        if rest.is_empty() {
            return Err(format!("usage: {usage} <id>"));
        }
        rest.parse::<MemoryId>().map_err(|e| e.to_string())
    };

    match cmd {
        "/store" => parse_store(rest),
        "/search" if rest.is_empty() => Err("usage: /search <query>".into()),
        "/search" => Ok(Command::Search(rest.to_string())),
        "/get" => id("/get").map(Command::Get),
        "/delete" => id("/delete").map(Command::Delete),
        "/pin" => id("/pin").map(Command::Pin),
        "/stats" => Ok(Command::Stats),
        "/quota" => Ok(Command::Quota),
        "/retain" => Ok(Command::Retain),
        "/session" => Ok(Command::Session(match rest {
            "" => SessionCommand::Show,
            "new" => SessionCommand::New,
            "end" => SessionCommand::End,
            id => SessionCommand::Resume(id.to_string()),
        })),
        "/settings" => Ok(Command::Settings),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

fn parse_store(rest: &str) -> Result<Command, String> {
    const USAGE: &str = "usage: /store <obs|act|wf> ...";
    let (kind, rest) = rest.split_once(char::is_whitespace).ok_or(USAGE)?;
    let rest = rest.trim();

    let (kind, text) = match kind {
        "obs" => (StoreKind::Observation, rest),
        "act" => {
            let (spec, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: /store act <type[:target]> <text>")?;
            let action = match spec.split_once(':') {
                Some((action_type, target)) if !target.is_empty() => {
                    ActionSpec::new(action_type).with_target(target)
                }
                Some((action_type, _)) => ActionSpec::new(action_type),
                None => ActionSpec::new(spec),
            };
            (StoreKind::Action(action), text.trim())
        }
        "wf" => {
            let (name, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: /store wf <name> <text>")?;
            (StoreKind::Workflow(name.to_string()), text.trim())
        }
        _ => return Err(USAGE.into()),
    };
    if text.is_empty() {
        return Err(USAGE.into());
    }
    Ok(Command::Store {
        kind,
        text: text.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the command handlers need.
pub struct Shell {
    pub runtime: Runtime,
    pub manager: Arc<MemoryManager>,
    pub audit: Arc<AuditLog>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shell: Shell, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "mneme>".bold().cyan());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "⚠  Ctrl-C received – closing memory store …".yellow().bold());
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => shell.dispatch(command),
            Err(e) => println!("{} Type {} for available commands.", e.red(), "/help".bold()),
        }
    }

    shell.manager.close();
}

impl Shell {
    fn dispatch(&self, command: Command) {
        match command {
            Command::Store { kind, text } => self.cmd_store(kind, text),
            Command::Search(query) => self.cmd_search(&query),
            Command::Get(id) => self.cmd_get(&id),
            Command::Delete(id) => self.cmd_delete(&id),
            Command::Pin(id) => self.cmd_pin(&id),
            Command::Stats => self.cmd_stats(),
            Command::Quota => self.cmd_quota(),
            Command::Retain => self.cmd_retain(),
            Command::Session(session) => self.cmd_session(session),
            Command::Settings => cmd_settings(),
            Command::Help => cmd_help(),
            Command::Quit => {}
        }
    }

    // ── Command handlers ─────────────────────────────────────────────────────

    fn cmd_store(&self, kind: StoreKind, text: String) {
        let metadata = Metadata::new().with(keys::SOURCE, Source::Manual.as_str());
        let kind = match kind {
            StoreKind::Observation => RecordKind::observation(),
            StoreKind::Action(action) => RecordKind::Action { action, success: true },
            StoreKind::Workflow(name) => RecordKind::Workflow {
                name,
                steps: Vec::new(),
                success: true,
                duration_secs: 0.0,
            },
        };
        match self.runtime.block_on(self.manager.store(text, kind, metadata)) {
            Ok(id) if id.is_disabled() => {
                println!("{}", "Memory is disabled; nothing stored.".yellow())
            }
            Ok(id) => println!("{} {}", "✓ Stored".green(), id.to_string().bold()),
            Err(e) => println!("{}: {}", "Store failed".red(), e),
        }
    }

    fn cmd_search(&self, query: &str) {
        let q = self.manager.query(query);
        match self.runtime.block_on(self.manager.search(&q)) {
            Ok(results) => print_results(&results),
            Err(e) => println!("{}: {}", "Search failed".red(), e),
        }
    }

    fn cmd_get(&self, id: &MemoryId) {
        match self.runtime.block_on(self.manager.get(id)) {
            Ok(Some(record)) => {
                println!("{}", record.id.to_string().bold());
                println!("  {}", record.content);
                println!("  {} {}", "kind:".dimmed(), record.partition());
                for (key, value) in record.metadata.iter() {
                    println!("  {} {}", format!("{key}:").dimmed(), value);
                }
            }
            Ok(None) => println!("{} {}", "Not found:".yellow(), id),
            Err(e) => println!("{}: {}", "Lookup failed".red(), e),
        }
    }

    fn cmd_delete(&self, id: &MemoryId) {
        match self.runtime.block_on(self.manager.delete(id)) {
            Ok(true) => println!("{} {}", "✓ Deleted".green(), id),
            Ok(false) => println!("{} {}", "Not found:".yellow(), id),
            Err(e) => println!("{}: {}", "Delete failed".red(), e),
        }
    }

    fn cmd_pin(&self, id: &MemoryId) {
        match self.runtime.block_on(self.manager.pin(id)) {
            Ok(true) => println!("{} {}", "✓ Pinned".green(), id),
            Ok(false) => println!("{} {}", "Not found:".yellow(), id),
            Err(e) => println!("{}: {}", "Pin failed".red(), e),
        }
    }

    fn cmd_stats(&self) {
        let stats = match self.runtime.block_on(self.manager.stats()) {
            Ok(stats) => stats,
            Err(e) => {
                println!("{}: {}", "Stats failed".red(), e);
                return;
            }
        };
        println!("{}", "Memory Stats".bold().underline());
        let state = if stats.enabled { "enabled".green() } else { "disabled".red() };
        println!("  Status   : {}", state);
        for (partition, count) in &stats.counts_by_kind {
            println!("  {:<9}: {}", partition.to_string(), count);
        }
        println!("  Total    : {}", stats.total.to_string().bold());
        println!(
            "  Size     : {} ({:.1}% of quota)",
            format_bytes(stats.size_estimate),
            stats.quota_usage_percent
        );
        println!(
            "  Cache    : {}/{} entries, {} hits / {} misses",
            stats.cache.size, stats.cache.capacity, stats.cache.hits, stats.cache.misses
        );
        println!("  Session  : {}", stats.session.as_deref().unwrap_or("(none)"));

        let security = self.audit.security_summary();
        println!(
            "  Security : {} audit entries, {} security events",
            security.total_events, security.security_events
        );
    }

    fn cmd_quota(&self) {
        match self.runtime.block_on(self.manager.check_quota()) {
            Ok(quota) => {
                println!("{}", "Storage Quota".bold().underline());
                println!(
                    "  {} of {} ({:.1}%)",
                    format_bytes(quota.used_bytes),
                    format_bytes(quota.limit_bytes),
                    quota.usage_percent
                );
                if let Some(warning) = &quota.warning {
                    println!("  {} {}", "⚠".yellow(), warning.yellow());
                }
                if quota.should_cleanup {
                    println!("  Run {} to free space.", "/retain".bold().cyan());
                }
            }
            Err(e) => println!("{}: {}", "Quota check failed".red(), e),
        }
    }

    fn cmd_retain(&self) {
        print!("  Running retention … ");
        io::stdout().flush().ok();
        match self.runtime.block_on(self.manager.run_retention()) {
            Ok(summary) => {
                println!("{}", "OK".green());
                println!(
                    "  Deleted {} record(s), freed ~{} in {:.0?}",
                    summary.deleted_count.to_string().bold(),
                    format_bytes(summary.freed_estimate),
                    summary.duration
                );
                println!(
                    "  {}",
                    format!(
                        "age {} · duplicates {} · tier quota {} · size cap {}",
                        summary.age_deleted,
                        summary.dedup_deleted,
                        summary.quota_deleted,
                        summary.size_deleted
                    )
                    .dimmed()
                );
            }
            Err(e) => println!("{}: {}", "FAILED".red(), e),
        }
    }

    fn cmd_session(&self, command: SessionCommand) {
        match command {
            SessionCommand::Show => match self.manager.current_session() {
                Some(id) => println!("  Active session: {}", id.bold()),
                None => println!("  No active session; the next store starts one."),
            },
            SessionCommand::New => {
                let id = self.manager.start_session(None);
                println!("{} {}", "✓ Started session".green(), id.bold());
            }
            SessionCommand::End => match self.manager.end_session() {
                Some(id) => println!("{} {}", "✓ Ended session".green(), id.bold()),
                None => println!("  No active session."),
            },
            SessionCommand::Resume(id) => {
                let id = self.manager.start_session(Some(id));
                println!("{} {}", "✓ Active session".green(), id.bold());
            }
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "mneme Commands".bold().underline());
    println!("  {}  – store an observation", "/store obs <text>".bold().cyan());
    println!(
        "  {}  – store a successful action",
        "/store act <type[:target]> <text>".bold().cyan()
    );
    println!("  {}  – store a successful workflow", "/store wf <name> <text>".bold().cyan());
    println!("  {}  – semantic search", "/search <query>".bold().cyan());
    println!("  {}  – show, delete or pin a record", "/get  /delete  /pin <id>".bold().cyan());
    println!("  {}  – usage, quota and retention", "/stats  /quota  /retain".bold().cyan());
    println!("  {}  – show or switch the session", "/session [new|end|<id>]".bold().cyan());
    println!("  {}  – edit ~/.mneme/config.toml", "/settings".bold().cyan());
    println!("  {}  – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_settings() {
    let mut cfg = match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    println!("  Embedder       : {} (hashing / ollama)", cfg.embedder.to_string().yellow());
    let embedder = prompt_str(
        &format!("  Embedder       [{}]: ", cfg.embedder),
        &cfg.embedder.to_string(),
    );
    cfg.embedder = match embedder.to_lowercase().as_str() {
        "ollama" => EmbedderKind::Ollama,
        _ => EmbedderKind::Hashing,
    };

    if cfg.embedder == EmbedderKind::Ollama {
        cfg.ollama_url =
            prompt_str(&format!("  Ollama URL     [{}]: ", cfg.ollama_url), &cfg.ollama_url);
        cfg.embed_model =
            prompt_str(&format!("  Embed model    [{}]: ", cfg.embed_model), &cfg.embed_model);
    }

    let quota = cfg.memory.storage.max_size_mb;
    cfg.memory.storage.max_size_mb = prompt_parse(&format!("  Quota (MB)     [{quota}]: "), quota);

    match config::save(&cfg) {
        Ok(()) => {
            println!(
                "{} {}",
                "✓ Settings saved to".green(),
                config::config_path().display().to_string().bold()
            );
            println!("  {}", "Restart mneme to apply embedder changes.".dimmed());
        }
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn print_results(results: &SearchResults) {
    if results.degraded {
        println!("  {}", "embedding service unavailable – keyword matches only".yellow());
    }
    if results.hits.is_empty() {
        println!("  No matches ({:.1} ms).", results.search_time_ms);
        return;
    }
    for hit in &results.hits {
        println!(
            "  {:.3}  {}  {}",
            hit.score,
            hit.record.id.to_string().bold(),
            preview(&hit.record.content, 60)
        );
    }
    println!(
        "  {}",
        format!(
            "{} of {} match(es), {:.1} ms",
            results.hits.len(),
            results.total_count,
            results.search_time_ms
        )
        .dimmed()
    );
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() { format!("{head}…") } else { head }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn prompt_parse<T: std::str::FromStr + std::fmt::Display + Copy>(msg: &str, default: T) -> T {
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            println!("  {} '{}' is not valid, keeping {}", "Warning:".yellow(), raw, default);
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() { default.to_string() } else { trimmed }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mneme_types::Partition;

    // ── parse ────────────────────────────────────────────────────────────────

    #[test]
    fn parses_store_variants() {
        assert_eq!(
            parse("/store obs Login form with email field").unwrap(),
            Command::Store {
                kind: StoreKind::Observation,
                text: "Login form with email field".into()
            }
        );
        assert_eq!(
            parse("/store act click:#login pressed the login button").unwrap(),
            Command::Store {
                kind: StoreKind::Action(ActionSpec::new("click").with_target("#login")),
                text: "pressed the login button".into()
            }
        );
        assert_eq!(
            parse("/store wf login_flow  open page, type, submit").unwrap(),
            Command::Store {
                kind: StoreKind::Workflow("login_flow".into()),
                text: "open page, type, submit".into()
            }
        );
    }

    #[test]
    fn store_without_text_is_usage_error() {
        assert!(parse("/store obs").is_err());
        assert!(parse("/store act click").is_err());
        assert!(parse("/store note hello").unwrap_err().starts_with("usage"));
    }

    #[test]
    fn parses_id_commands() {
        let id = MemoryId::generate(Partition::Action);
        assert_eq!(parse(&format!("/get {id}")).unwrap(), Command::Get(id.clone()));
        assert_eq!(parse(&format!("/pin   {id}")).unwrap(), Command::Pin(id.clone()));
        assert!(parse("/delete").unwrap_err().contains("usage"));
        assert!(parse("/get not-an-id").is_err());
    }

    #[test]
    fn parses_session_forms() {
        assert_eq!(parse("/session").unwrap(), Command::Session(SessionCommand::Show));
        assert_eq!(parse("/session new").unwrap(), Command::Session(SessionCommand::New));
        assert_eq!(parse("/session end").unwrap(), Command::Session(SessionCommand::End));
        assert_eq!(
            parse("/session session_abc").unwrap(),
            Command::Session(SessionCommand::Resume("session_abc".into()))
        );
    }

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse("/stats").unwrap(), Command::Stats);
        assert_eq!(parse("  /quota ").unwrap(), Command::Quota);
        assert_eq!(parse("/retain").unwrap(), Command::Retain);
        assert_eq!(parse("/exit").unwrap(), Command::Quit);
        assert!(parse("/search").is_err());
        assert!(parse("/launch").unwrap_err().contains("Unknown command"));
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(500 * 1024 * 1024), "500.0 MB");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("ééééé", 3), "ééé…");
    }
}
