//! Kestrel bot: a headless scripted player.
//!
//! Connects to a server (`--server`, `--port`), or with `--local N` runs N
//! bots against an in-process server over the simulated link described by
//! the `link` section of the config.

use std::process::ExitCode;

use clap::Parser;
use kestrel_config::CliArgs;
use kestrel_server::{Bot, init_logging, load_config, run_local};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kestrel-bot", about = "Kestrel headless bot client")]
struct BotArgs {
    #[command(flatten)]
    common: CliArgs,

    /// Run this many bots against an in-process server instead.
    #[arg(long)]
    local: Option<usize>,

    /// Frames simulated in local mode.
    #[arg(long, default_value_t = 3600)]
    frames: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = BotArgs::parse();
    let (config, config_dir) = load_config(&args.common);
    init_logging(&config, config_dir.as_ref());

    if let Some(bots) = args.local {
        return match run_local(&config, bots, args.frames) {
            Ok(report) => {
                info!(
                    "Server reached tick {:?}: {} inputs, {} late",
                    report.last_tick, report.server.inputs_accepted, report.server.late_inputs
                );
                for bot in report.bots {
                    info!(
                        "{} {:?}: {} matches, {} corrections, {} hard snaps, {} stale",
                        bot.id,
                        bot.status,
                        bot.stats.matches,
                        bot.stats.corrections,
                        bot.stats.hard_snaps,
                        bot.stats.stale_discards
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Local session failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let bot = match Bot::connect(&config).await {
        Ok(bot) => bot,
        Err(e) => {
            error!("Failed to connect: {e}");
            return ExitCode::FAILURE;
        }
    };
    let stats = bot
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    info!(
        "Done: {} matches, {} corrections, {} hard snaps",
        stats.matches, stats.corrections, stats.hard_snaps
    );
    ExitCode::SUCCESS
}
