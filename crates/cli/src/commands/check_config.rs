//! `check-config`: load the layered configuration, validate it and print the
//! effective values.

use anyhow::Result;
use clap::Args;
use updown_core::{AppConfig, ConfigLoader, DEFAULT_CONFIG_PATH};

#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Profile overlay (loads `<stem>.<profile>.toml` on top of the base file)
    #[arg(long, env = "UPDOWN_PROFILE")]
    pub profile: Option<String>,

    /// Print the effective configuration as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = match &args.profile {
        Some(profile) => ConfigLoader::load_with_profile(&args.config, profile)?,
        None => ConfigLoader::load_from(&args.config)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print_summary(&args.config, &config);
    }
    Ok(())
}

fn print_summary(path: &str, config: &AppConfig) {
    let strategy = &config.strategy;
    let lifecycle = &config.lifecycle;

    println!("\n{}", "=".repeat(60));
    println!("Configuration OK: {path}");
    println!("{}", "=".repeat(60));
    println!("{:<32} {:>26}", "Strategy enabled", strategy.enabled);
    println!(
        "{:<32} {:>26}",
        "Entry price",
        format!("{} (limit {})", strategy.entry_threshold(), strategy.entry_limit_price())
    );
    println!("{:<32} {:>26}", "Profit target", strategy.profit_target());
    println!("{:<32} {:>26}", "Stop loss", strategy.stop_loss());
    println!("{:<32} {:>26}", "Trade size", strategy.trade_size);
    println!(
        "{:<32} {:>26}",
        "Min price difference",
        display_optional(strategy.price_difference)
    );
    println!(
        "{:<32} {:>26}",
        "Flip guard (pending / filled)",
        format!(
            "{} / {}",
            display_optional(strategy.flip_guard_pending_distance),
            display_optional(strategy.flip_guard_filled_distance)
        )
    );
    println!(
        "{:<32} {:>26}",
        "Entry window",
        format!("last {}s", strategy.entry_time_remaining_max_secs)
    );
    println!("{}", "-".repeat(60));
    println!("{:<32} {:>26}", "Max consecutive failures", lifecycle.max_consecutive_failures);
    println!("{:<32} {:>26}", "Max exposure fraction", lifecycle.max_exposure_fraction);
    println!("{:<32} {:>26}", "Entry tie-break", lifecycle.entry_tie_break);
    println!("{:<32} {:>26}", "Tick interval (ms)", lifecycle.tick_interval_ms);
    println!(
        "{:<32} {:>26}",
        "Redemption",
        if config.redemption.enabled {
            format!("every {}s", config.redemption.interval_secs)
        } else {
            "disabled".to_string()
        }
    );
    println!("{}", "=".repeat(60));
}

fn display_optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "off".to_string(), |v| v.to_string())
}
