//! List Accounts Tool - Shows the SMTP accounts in a configuration file

use anyhow::Result;
use clap::Parser;
use smtp_forward_proxy::config::Config;
use std::path::PathBuf;

/// List configured SMTP accounts
#[derive(Parser, Debug)]
#[command(name = "smtp-forward-accounts")]
#[command(about = "List the SMTP accounts of an smtp-forward-proxy configuration")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show detailed information
    #[arg(short, long)]
    verbose: bool,
}

/// Keep the ends of a secret, hide the rest
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "*".repeat(chars.len())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        println!("No configuration at {}", args.config.display());
        println!("Create one with: smtp-forward-proxy --example-config > config.yaml");
        return Ok(());
    };

    if config.accounts.is_empty() {
        println!("No accounts configured");
        return Ok(());
    }

    let selected = config.account(&config.intercept.account_type);

    println!("Accounts ({}):", config.accounts.len());
    println!("{}", "-".repeat(60));

    for account in &config.accounts {
        let in_use = selected.is_some_and(|s| std::ptr::eq(s, account));
        let marker = if in_use { " [intercept]" } else { "" };

        if args.verbose {
            println!("\n  {}:{}", account.username, marker);
            println!("    Type: {}", account.account_type);
            println!("    Password: {}", mask(&account.password));
            println!("    Server: {}", account.server());
            println!("    TLS: {:?}", account.tls);
            if let Some(ca_file) = &account.ca_file {
                println!("    CA file: {}", ca_file);
            }
        } else {
            println!(
                "  {} ({}, {}){}",
                account.username,
                account.account_type,
                account.server(),
                marker
            );
        }
    }

    if selected.is_none() {
        println!();
        println!(
            "Warning: no account of type '{}' for {}{}",
            config.intercept.account_type, config.intercept.webserver, config.intercept.path
        );
    }

    if !args.verbose {
        println!();
        println!("Use -v for detailed information");
    }

    Ok(())
}
