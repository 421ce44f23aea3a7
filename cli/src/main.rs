//! chainmux CLI — watch live marketplace events from the terminal.
//!
//! Usage:
//! ```bash
//! # Stream floor-ask updates for a collection on Ethereum
//! chainmux watch --chain 1 --contract 0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d
//!
//! # List configured chains
//! chainmux chains --config chains.json
//!
//! # Print the canonical subscription key for a spec
//! chainmux key --event token.updated --filter contract=0xabc --changed price
//! ```

mod logging;

use std::env;
use std::process;

use chainmux_core::{ChainId, MuxConfig, SubscriptionSpec};
use chainmux_ws::{token_updates, Multiplexer};
use tracing::info;

use logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    match log_config(rest) {
        Ok(config) => init_tracing(&config),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }

    let result = match args[1].as_str() {
        "watch" => cmd_watch(rest).await,
        "chains" => cmd_chains(rest),
        "key" => cmd_key(rest),
        "version" | "--version" | "-V" => {
            println!("chainmux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainmux {}", env!("CARGO_PKG_VERSION"));
    println!("Watch live marketplace events over shared WebSocket subscriptions\n");
    println!("USAGE:");
    println!("    chainmux <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch      Stream floor-ask updates for a collection");
    println!("    chains     List configured chains and endpoints");
    println!("    key        Print the canonical subscription key for a spec");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("WATCH FLAGS:");
    println!("    --chain <ID>        Chain id  [default: 1]");
    println!("    --contract <ADDR>   Collection contract  [required]");
    println!("    --config <FILE>     JSON config (chains, reconnect, api_key)");
    println!("    --api-key <KEY>     API key appended to every endpoint");
    println!("    --json              JSON log output\n");
    println!("LOG FLAGS (any command):");
    println!("    --log-level <LEVEL>        Default level  [default: info]");
    println!("    --log <CRATE=LEVEL>        Per-crate level, repeatable (e.g. chainmux-ws=debug)\n");
    println!("KEY FLAGS:");
    println!("    --event <NAME>      Event name  [required]");
    println!("    --filter <K=V>      Filter, repeatable");
    println!("    --changed <FIELD>   Watched field");
}

fn log_config(args: &[String]) -> Result<LogConfig, String> {
    let mut config = LogConfig {
        json: has_flag(args, "--json"),
        ..LogConfig::default()
    };
    if let Some(level) = parse_flag(args, "--log-level") {
        config.level = level;
    }
    for directive in parse_flag_all(args, "--log") {
        let (component, level) = directive
            .split_once('=')
            .ok_or_else(|| format!("--log expects CRATE=LEVEL, got {directive}"))?;
        config.components.insert(component.to_string(), level.to_string());
    }
    Ok(config)
}

fn load_config(args: &[String]) -> Result<MuxConfig, String> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => MuxConfig::from_file(&path).map_err(|e| e.to_string())?,
        None => MuxConfig::default(),
    };
    if let Some(key) = parse_flag(args, "--api-key").or_else(|| env::var("CHAINMUX_API_KEY").ok()) {
        config = config.with_api_key(key);
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

async fn cmd_watch(args: &[String]) -> Result<(), String> {
    let contract = parse_flag(args, "--contract").ok_or("--contract is required")?;
    let chain: ChainId = parse_flag(args, "--chain")
        .unwrap_or_else(|| "1".into())
        .parse()
        .map_err(|e: chainmux_core::MuxError| e.to_string())?;

    let config = load_config(args)?;
    let mux = Multiplexer::connect(config).map_err(|e| e.to_string())?;
    mux.on_status_change(chain, move |state| info!(chain = %chain, %state, "connection state"))
        .map_err(|e| e.to_string())?;
    let mut updates = token_updates(&mux, chain, &contract).map_err(|e| e.to_string())?;

    eprintln!("Watching {contract} on chain {chain} (Ctrl-C to stop)");
    loop {
        tokio::select! {
            frame = updates.next() => match frame {
                Some(frame) => println!(
                    "{}",
                    serde_json::to_string(&frame).map_err(|e| e.to_string())?
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(updates);
    mux.shutdown();
    Ok(())
}

fn cmd_chains(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    println!("Configured chains:\n");
    for chain in &config.chains {
        println!("  {:<10} {:>8}  {}", chain.name, chain.id.0, chain.ws_url);
    }
    Ok(())
}

fn cmd_key(args: &[String]) -> Result<(), String> {
    let event = parse_flag(args, "--event").ok_or("--event is required")?;
    let mut spec = SubscriptionSpec::new(event);
    for filter in parse_flag_all(args, "--filter") {
        let (name, value) = filter
            .split_once('=')
            .ok_or_else(|| format!("--filter expects NAME=VALUE, got {filter}"))?;
        spec = spec.filter(name, value);
    }
    if let Some(changed) = parse_flag(args, "--changed") {
        spec = spec.changed(changed);
    }
    println!("{}", spec.key());
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_flag_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
