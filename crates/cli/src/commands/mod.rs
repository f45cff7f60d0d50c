//! CLI commands.

pub mod check_config;
pub mod paper_replay;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use paper_replay::{run_paper_replay, PaperReplayArgs};
