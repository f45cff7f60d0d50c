//! `paper-replay`: drive the lifecycle manager from a JSONL file of recorded
//! market frames against the in-process paper gateway.
//!
//! Each line is one tick:
//!
//! ```json
//! {"current_price":"65000","price_to_beat":"64950","time_remaining_secs":150,
//!  "market":{"id":"m1","token_ids":["up","down"],"end_timestamp":"2026-01-01T00:15:00Z","condition_id":"c1"},
//!  "quotes":{"down":{"bid":"0.03","ask":"0.04"}}}
//! ```
//!
//! A frame may also carry `"resolve":{"market_id":"m1","winner":"UP"}` to settle a
//! market on the paper book. Blank lines and lines starting with `#` are ignored.

use anyhow::{Context, Result};
use clap::Args;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use updown_core::{AppConfig, ConfigLoader, ConfigWatcher, Direction, DEFAULT_CONFIG_PATH};
use updown_lifecycle::{
    LifecycleManager, LifecycleStatus, MarketDescriptor, MarketSnapshot, Operation, PaperGateway,
    RedemptionMonitor, RedemptionPass, TickReport,
};

#[derive(Args, Debug, Clone)]
pub struct PaperReplayArgs {
    /// JSONL file of market frames
    pub frames: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Force the strategy on regardless of the config file
    #[arg(long)]
    pub enable: bool,

    /// Run a redemption pass every N frames (0 disables periodic passes)
    #[arg(long, default_value = "10")]
    pub redeem_every: usize,

    /// Write the trade journal as JSON to this file
    #[arg(long)]
    pub trades_out: Option<PathBuf>,

    /// Watch the config file and apply strategy changes between frames
    #[arg(long)]
    pub watch: bool,

    /// Log file path (logs to stdout if not specified)
    #[arg(long)]
    pub log_file: Option<String>,
}

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameQuote {
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub bid_depth: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameResolution {
    pub market_id: String,
    pub winner: Direction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayFrame {
    pub current_price: Decimal,
    pub price_to_beat: Decimal,
    pub time_remaining_secs: u64,
    #[serde(default)]
    pub market: Option<MarketDescriptor>,
    #[serde(default)]
    pub quotes: HashMap<String, FrameQuote>,
    #[serde(default)]
    pub resolve: Option<FrameResolution>,
}

impl ReplayFrame {
    fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot::new(
            self.current_price,
            self.price_to_beat,
            self.market.clone(),
            self.time_remaining_secs,
        )
    }
}

/// Parses frames from JSONL text.
///
/// # Errors
///
/// Returns an error naming the offending line if any frame fails to parse.
pub fn parse_frames(text: &str) -> Result<Vec<ReplayFrame>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid frame on line {}", idx + 1))
        })
        .collect()
}

fn load_frames(path: &Path) -> Result<Vec<ReplayFrame>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read frames from {}", path.display()))?;
    parse_frames(&text)
}

// =============================================================================
// Replay
// =============================================================================

type PaperManager = LifecycleManager<PaperGateway>;
type PaperMonitor = RedemptionMonitor<PaperGateway, PaperGateway, PaperManager>;

pub async fn run_paper_replay(args: PaperReplayArgs) -> Result<()> {
    let mut config = ConfigLoader::load_from(&args.config)?;
    if args.enable {
        config.strategy.enabled = true;
    }
    let frames = load_frames(&args.frames)?;

    info!(
        frames = frames.len(),
        config = %args.config,
        enabled = config.strategy.enabled,
        "Starting paper replay"
    );

    let mut config_rx = if args.watch {
        let (watcher, rx) = ConfigWatcher::new(&args.config, config.clone());
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                warn!(error = %e, "Config watcher stopped");
            }
        });
        Some(rx)
    } else {
        None
    };

    let gateway = Arc::new(PaperGateway::new(config.paper.clone()));
    let manager = Arc::new(PaperManager::new(
        Arc::clone(&gateway),
        config.strategy.clone(),
        config.lifecycle.clone(),
    ));
    let mut monitor = PaperMonitor::new(Arc::clone(&gateway), Arc::clone(&gateway), Arc::clone(&manager))
        .with_journal(manager.journal());

    manager.start_trading()?;

    let mut registered: HashSet<String> = HashSet::new();
    for (index, frame) in frames.iter().enumerate() {
        if let Some(rx) = config_rx.as_mut() {
            apply_config_change(&manager, rx, args.enable);
        }

        if let Some(market) = &frame.market {
            if registered.insert(market.id.clone()) {
                gateway.register_market(market.clone());
            }
        }
        for (token_id, quote) in &frame.quotes {
            match quote.bid_depth {
                Some(depth) => gateway.set_quote_with_depth(token_id, quote.bid, quote.ask, depth),
                None => gateway.set_quote(token_id, quote.bid, quote.ask),
            }
        }

        let matched = gateway.match_resting_orders();
        if !matched.is_empty() {
            info!(frame = index, fills = matched.len(), "Resting paper orders filled");
        }

        manager.set_balance(Some(gateway.balance()));
        manager.update_market_data(frame.snapshot());
        let report = manager.on_tick().await;
        log_report(index, &report);

        if let Some(resolution) = &frame.resolve {
            gateway.resolve_market(&resolution.market_id, resolution.winner);
            info!(market_id = %resolution.market_id, winner = %resolution.winner, "Market resolved");
        }

        if config.redemption.enabled && args.redeem_every > 0 && (index + 1) % args.redeem_every == 0 {
            run_redemption(&manager, &mut monitor).await;
        }
    }

    if config.redemption.enabled {
        run_redemption(&manager, &mut monitor).await;
    }

    manager.set_balance(Some(gateway.balance()));
    print_status(&manager.get_status());

    if let Some(path) = &args.trades_out {
        let json = manager.journal().read().to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write trades to {}", path.display()))?;
        info!(path = %path.display(), "Trade journal written");
    }

    manager.stop_trading();
    Ok(())
}

fn apply_config_change(
    manager: &PaperManager,
    rx: &mut tokio::sync::watch::Receiver<AppConfig>,
    force_enable: bool,
) {
    if !rx.has_changed().unwrap_or(false) {
        return;
    }
    let mut strategy = rx.borrow_and_update().strategy.clone();
    if force_enable {
        strategy.enabled = true;
    }
    match manager.update_config(strategy) {
        Ok(()) => info!("Strategy config updated from file"),
        Err(e) => warn!(error = %e, "Rejected config update"),
    }
}

async fn run_redemption(manager: &PaperManager, monitor: &mut PaperMonitor) {
    let pass: RedemptionPass = monitor.run_once().await;
    for group in &pass.redeemed {
        info!(
            market_id = %group.market_id,
            index_set = group.index_set,
            positions = group.position_ids.len(),
            amount = ?group.amount,
            "Redeemed positions"
        );
    }
    for error in &pass.errors {
        warn!(error = %error, "Redemption failed");
        manager.record_external_error(Operation::Redemption, error.to_string());
    }
}

fn log_report(frame: usize, report: &TickReport) {
    if !report.rolled_over.is_empty() {
        info!(frame, orders = ?report.rolled_over, "Entry orders cancelled on rollover");
    }
    if !report.entry_fills.is_empty() {
        info!(frame, positions = ?report.entry_fills, "Entry fills");
    }
    if !report.exit_fills.is_empty() {
        info!(frame, orders = ?report.exit_fills, "Exit fills");
    }
    tracing::debug!(frame, exit = ?report.exit, entry = ?report.entry, "Tick");
    for error in &report.errors {
        warn!(frame, operation = %error.operation, message = %error.message, "Tick error");
    }
}

fn print_status(status: &LifecycleStatus) {
    let journal = &status.journal;

    println!("\n{}", "=".repeat(80));
    println!("PAPER REPLAY SUMMARY");
    println!("{}", "=".repeat(80));
    println!(
        "{:<28} {:>20}",
        "Balance",
        status.balance.map_or_else(|| "-".to_string(), |b| b.round_dp(4).to_string())
    );
    println!("{:<28} {:>20}", "Journal records", journal.trades);
    println!("{:<28} {:>20}", "Failed records", journal.failed);
    println!("{:<28} {:>20}", "Wins / losses", format!("{} / {}", journal.wins, journal.losses));
    println!("{:<28} {:>20}", "Failed orders", status.failed_orders);
    println!("{:<28} {:>20}", "Realized P&L", journal.realized_pnl.round_dp(4));
    println!("{:<28} {:>20}", "Fees", journal.fees.round_dp(4));
    println!("{:<28} {:>20}", "Unrealized P&L", status.unrealized_pnl.round_dp(4));
    println!("{:<28} {:>20}", "Open exposure", status.total_exposure.round_dp(4));
    println!("{:<28} {:>20}", "Breaker tripped", status.breaker_tripped);
    println!("{}", "=".repeat(80));

    if !status.positions.is_empty() {
        println!(
            "{:<38} {:<10} {:>10} {:>10} {:>10}",
            "Position", "Side", "Shares", "Entry", "Mark"
        );
        println!("{}", "-".repeat(80));
        for position in &status.positions {
            println!(
                "{:<38} {:<10} {:>10} {:>10} {:>10}",
                position.id,
                position.direction.to_string(),
                position.size.round_dp(2),
                position.entry_price.round_dp(4),
                position.current_price.round_dp(4)
            );
        }
        println!("{}", "=".repeat(80));
    }

    for (operation, message) in &status.last_errors {
        println!("Last {operation} error: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== Frame Parsing Tests ====================

    #[test]
    fn test_parse_frames_skips_blank_and_comment_lines() {
        let text = r##"
# warmup
{"current_price":"65000","price_to_beat":"64950","time_remaining_secs":150}

{"current_price":"65010","price_to_beat":"64950","time_remaining_secs":140,"quotes":{"down":{"bid":"0.03","ask":"0.04"}}}
"##;

        let frames = parse_frames(text).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].market.is_none());
        assert!(frames[0].quotes.is_empty());
        assert_eq!(frames[1].quotes["down"].ask, dec!(0.04));
        assert_eq!(frames[1].quotes["down"].bid_depth, None);
    }

    #[test]
    fn test_parse_frames_reads_market_and_resolution() {
        let text = r#"{"current_price":"65000","price_to_beat":"64950","time_remaining_secs":0,"market":{"id":"m1","token_ids":["up","down"],"end_timestamp":"2026-01-01T00:15:00Z","condition_id":"c1"},"resolve":{"market_id":"m1","winner":"UP"}}"#;

        let frames = parse_frames(text).unwrap();
        let market = frames[0].market.as_ref().unwrap();
        assert_eq!(market.id, "m1");
        assert!(!market.resolved);
        assert_eq!(
            frames[0].resolve,
            Some(FrameResolution {
                market_id: "m1".to_string(),
                winner: Direction::Up,
            })
        );

        let snapshot = frames[0].snapshot();
        assert_eq!(snapshot.distance(), dec!(50));
        assert_eq!(snapshot.market_id(), Some("m1"));
    }

    #[test]
    fn test_parse_frames_reports_line_number() {
        let text = "{\"current_price\":\"1\",\"price_to_beat\":\"1\",\"time_remaining_secs\":1}\nnot json\n";
        let err = parse_frames(text).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    // ==================== Replay Tests ====================

    #[tokio::test]
    async fn test_replay_writes_trade_journal() {
        let dir = tempfile::tempdir().unwrap();
        let frames_path = dir.path().join("frames.jsonl");
        let trades_path = dir.path().join("trades.json");
        let market = r#""market":{"id":"m1","token_ids":["up","down"],"end_timestamp":"2026-01-01T00:15:00Z","condition_id":"c1"}"#;
        let lines = [
            format!(r#"{{"current_price":"65000","price_to_beat":"64950","time_remaining_secs":150,{market},"quotes":{{"up":{{"bid":"0.95","ask":"0.96"}},"down":{{"bid":"0.03","ask":"0.04"}}}}}}"#),
            format!(r#"{{"current_price":"65000","price_to_beat":"64950","time_remaining_secs":140,{market},"quotes":{{"up":{{"bid":"0.94","ask":"0.95"}}}}}}"#),
            format!(r#"{{"current_price":"65000","price_to_beat":"64950","time_remaining_secs":0,{market},"resolve":{{"market_id":"m1","winner":"UP"}}}}"#),
        ];
        std::fs::write(&frames_path, lines.join("\n")).unwrap();

        let args = PaperReplayArgs {
            frames: frames_path,
            config: dir.path().join("Config.toml").display().to_string(),
            enable: true,
            redeem_every: 0,
            trades_out: Some(trades_path.clone()),
            watch: false,
            log_file: None,
        };

        run_paper_replay(args).await.unwrap();

        let written = std::fs::read_to_string(&trades_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert!(parsed.is_array());
    }
}
