
use anyhow::{Context, Result};
use console::style;
use std::fmt::Write as _;

use super::Config;

/// Print the effective configuration, never including secrets
#[inline]
pub fn show_config(config: &Config) -> Result<()> {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();
    eprint!("{}", render_config(config)?);

    eprintln!();
    match config.ollama_url() {
        Ok(url) => eprintln!("Embedding service: {}", style(url).cyan()),
        Err(e) => eprintln!("Embedding service: {} ({})", style("Invalid").red(), e),
    }

    eprintln!(
        "API keys: GEMINI_API_KEY {}, SERPAPI_KEY {}",
        key_status("GEMINI_API_KEY"),
        key_status("SERPAPI_KEY")
    );
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

/// Render the configuration as TOML preceded by the resolved data paths
#[inline]
pub fn render_config(config: &Config) -> Result<String> {
    let mut out = String::new();
    let toml = toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;

    writeln!(out, "# base_dir = {}", config.get_base_dir().display())?;
    writeln!(out, "# knowledge = {}", config.knowledge_dir().display())?;
    writeln!(out, "# index = {}", config.index_dir().display())?;
    writeln!(out)?;
    out.push_str(&toml);

    Ok(out)
}

fn key_status(name: &str) -> console::StyledObject<&'static str> {
    if std::env::var(name).is_ok_and(|v| !v.trim().is_empty()) {
        style("set").green()
    } else {
        style("missing").yellow()
    }
}
