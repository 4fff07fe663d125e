//! `mneme-cli` – mneme Command Line Interface
//!
//! This binary is the operator's window into a memory store. It:
//!
//! 1. Checks for `~/.mneme/config.toml`; runs a **First-Run Wizard** when the
//!    file is absent.
//! 2. Checks the configured Ollama instance when the Ollama embedder is
//!    selected and warns if the embedding model is missing.
//! 3. Opens the [`MemoryManager`] behind the kernel's validation gate.
//! 4. Drops the user into an **interactive REPL** with slash-commands
//!    (`/store`, `/search`, `/stats`, `/retain`, `/help`, ...).
//! 5. Intercepts **Ctrl-C** to close the store before exiting.

mod config;
mod ollama;
mod repl;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use mneme_kernel::{ActionRateLimiter, AuditLog, KernelGate, SecurityValidator};
use mneme_memory::{Embedder, HashingEmbedder, MemoryManager};
use mneme_runtime::OllamaEmbedder;
use tracing::warn;

use crate::config::{Config, EmbedderKind};

fn main() {
    // Set MNEME_LOG_FORMAT=json for log aggregators; user-facing output
    // still goes through println!.
    let _telemetry = mneme_runtime::init_tracing("mneme");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    if cfg.embedder == EmbedderKind::Ollama {
        check_ollama(&cfg);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let audit = Arc::new(open_audit_log(&cfg));
    let manager = match open_manager(&cfg, audit.clone()) {
        Ok(manager) => {
            let location = match &cfg.memory.storage.path {
                Some(path) => path.display().to_string(),
                None => "in-memory".to_string(),
            };
            println!("  Memory store: {}", location.bold());
            Arc::new(manager)
        }
        Err(e) => {
            println!("{}: {}", "Memory unavailable".red(), e);
            println!("  Continuing with memory disabled.");
            Arc::new(MemoryManager::disabled())
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // Fires while a command is running; at the prompt the line editor
    // reports Ctrl-C itself.
    let manager_for_ctrlc = manager.clone();
    let shutdown_for_ctrlc = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – closing memory store …".yellow().bold());
        manager_for_ctrlc.close();
        shutdown_for_ctrlc.store(true, Ordering::SeqCst);
        println!("{}", "  ✓ Exiting mneme.".green());
        std::process::exit(130);
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; the store will not be closed on Ctrl-C"
        );
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(
        repl::Shell {
            runtime,
            manager,
            audit,
        },
        shutdown,
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

fn open_audit_log(cfg: &Config) -> AuditLog {
    let Some(path) = &cfg.audit_log else {
        return AuditLog::default();
    };
    AuditLog::default().with_file(path).unwrap_or_else(|e| {
        warn!(
            path = %path.display(),
            error = %e,
            "audit file unavailable; keeping audit entries in memory only"
        );
        AuditLog::default()
    })
}

fn open_manager(cfg: &Config, audit: Arc<AuditLog>) -> Result<MemoryManager, String> {
    let dimension = cfg.memory.storage.dimension;
    let embedder: Arc<dyn Embedder> = match cfg.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(dimension)),
        EmbedderKind::Ollama => Arc::new(
            OllamaEmbedder::new(&cfg.ollama_url, &cfg.embed_model, dimension)
                .with_timeout(cfg.memory.embedding.timeout()),
        ),
    };

    let validator =
        SecurityValidator::with_defaults(cfg.security.clone()).map_err(|e| e.to_string())?;
    let gate = KernelGate::new(validator, audit)
        .with_rate_limiter(ActionRateLimiter::new(&cfg.rate_limit));

    let manager = MemoryManager::open(cfg.memory.clone(), embedder).map_err(|e| e.to_string())?;
    Ok(manager.with_validator(Arc::new(gate)))
}

fn check_ollama(cfg: &Config) {
    print!("\n  Probing Ollama at {} … ", cfg.ollama_url.dimmed());
    match ollama::fetch_models(&cfg.ollama_url) {
        Ok(models) if ollama::has_model(&models, &cfg.embed_model) => {
            println!("{} (model {} ready)", "online".green(), cfg.embed_model.bold());
        }
        Ok(_) => {
            println!("{}", "online".green());
            println!(
                "  {} Run `{}` first; until then searches fall back to keyword matching.",
                format!("Model '{}' is not installed.", cfg.embed_model).yellow(),
                format!("ollama pull {}", cfg.embed_model).bold()
            );
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}  Run `{}` to enable embeddings.",
                "No Ollama instance detected.".dimmed(),
                "ollama serve".bold()
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        mneme First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up mneme.\n");

    let mut cfg = Config::default();

    println!("  How should text be embedded?");
    println!("    1) Offline hashing embedder  (default, no server)");
    println!("    2) Local model via Ollama");
    let choice = repl::prompt_str("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.embedder = EmbedderKind::Ollama;
        cfg.ollama_url =
            repl::prompt_str(&format!("  Ollama URL [{}]: ", cfg.ollama_url), &cfg.ollama_url);
        cfg.embed_model = repl::prompt_str(
            &format!("  Embedding model [{}]: ", cfg.embed_model),
            &cfg.embed_model,
        );
        let dim = cfg.memory.storage.dimension;
        let raw = repl::prompt_str(&format!("  Embedding dimension [{dim}]: "), &dim.to_string());
        if let Ok(d) = raw.trim().parse::<usize>() {
            cfg.memory.storage.dimension = d;
        }
    }

    let quota = cfg.memory.storage.max_size_mb;
    let raw = repl::prompt_str(&format!("  Storage quota in MB [{quota}]: "), &quota.to_string());
    if let Ok(mb) = raw.trim().parse::<u64>() {
        cfg.memory.storage.max_size_mb = mb;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __ _  ___  ___ __ _  ___ "#.bold().cyan());
    println!("{}", r#"  /  ' \/ _ \/ -_)  ' \/ -_)"#.bold().cyan());
    println!("{}", r#" /_/_/_/_//_/\__/_/_/_/\__/ "#.bold().cyan());
    println!();
    println!("  {} {}", "mneme".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Semantic memory for autonomous agents");
    println!();
}
