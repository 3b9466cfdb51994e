//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use console::{Style, style};
use serde::Serialize;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved scheduler configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./lapse.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Effective settings for JSON output.
#[derive(Debug, Serialize)]
struct ResolvedOutput {
    idle_timeout_ms: Option<u64>,
    max_entries: Option<usize>,
    log_level: String,
    json_logs: bool,
    sources: Vec<PathBuf>,
    warnings: Vec<String>,
}

const TEMPLATE: &str = r#"# Lapse Configuration

# Idle-timeout expiration. Negative values keep entries forever.
[expiration]
idle_timeout_ms = 300000

# LRU capacity eviction. Negative values leave the cache unbounded.
[eviction]
max_entries = 10000

[logging]
level = "info"
json = false
"#;

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Init { local } => cmd_init(local, ctx),
        ConfigCommand::Path => cmd_path(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    let config = &loaded.config;

    if ctx.json_output {
        let output = ResolvedOutput {
            idle_timeout_ms: config.idle_timeout().map(|t| t.as_millis() as u64),
            max_entries: config.max_entries(),
            log_level: config.log_level().to_string(),
            json_logs: config.json_logs(),
            sources: loaded
                .loaded_from()
                .into_iter()
                .map(|p| p.to_path_buf())
                .collect(),
            warnings: loaded.warnings.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!("{}", style("Lapse Configuration").bold());
    println!();

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    println!("Scheduler:");
    match config.idle_timeout() {
        Some(timeout) => println!(
            "  {} {}ms",
            dim.apply_to("idle timeout:"),
            timeout.as_millis()
        ),
        None => println!("  {} immortal", dim.apply_to("idle timeout:")),
    }
    match config.max_entries() {
        Some(max) => println!("  {} {}", dim.apply_to("max entries: "), max),
        None => println!("  {} unbounded", dim.apply_to("max entries: ")),
    }
    println!();

    println!("Logging:");
    println!("  {} {}", dim.apply_to("level:"), config.log_level());
    println!("  {} {}", dim.apply_to("json: "), config.json_logs());
    println!();

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;

    println!("Config file search order (later overrides earlier):\n");
    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'lapse config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    Ok(())
}

fn cmd_init(local: bool, ctx: &Context) -> Result<()> {
    let path = if local {
        PathBuf::from("lapse.toml")
    } else {
        user_config_dir(ctx)?.join("config.toml")
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, TEMPLATE)?;

    println!("✓ Created config file: {}", path.display());
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let path = user_config_dir(ctx)?.join("config.toml");
    println!("{}", path.display());
    Ok(())
}

fn user_config_dir(ctx: &Context) -> Result<PathBuf> {
    ctx.config_dir
        .clone()
        .or_else(lapse_config::xdg_config_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}
