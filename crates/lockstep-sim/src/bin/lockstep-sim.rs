#![forbid(unsafe_code)]

use std::env;

use anyhow::{Result, bail};
use clap::Parser;
use lockstep_sim::{CampaignConfig, replay_seed, run_campaign};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Run seeded fault-injection campaigns against lockstep.
#[derive(Debug, Parser)]
#[command(name = "lockstep-sim", version)]
struct Args {
    /// First seed of the campaign.
    #[arg(long, default_value_t = 0)]
    seed_start: u64,

    /// Number of seeds to run.
    #[arg(long, default_value_t = 20)]
    seeds: u64,

    /// Operations per seed.
    #[arg(long, default_value_t = 40)]
    steps: u32,

    /// Percent of steps whose unit body fails after touching both sides.
    #[arg(long, default_value_t = 10)]
    body_failure: u8,

    /// Percent of steps run with a rejecting pre-commit hook.
    #[arg(long, default_value_t = 5)]
    hook_failure: u8,

    /// Percent of steps run with an already expired deadline.
    #[arg(long, default_value_t = 5)]
    expired_deadline: u8,

    /// Replay one seed and print its trace instead of running a campaign.
    #[arg(long, conflicts_with_all = ["seed_start", "seeds"])]
    replay: Option<u64>,

    /// Emit JSON instead of a summary line.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOCKSTEP_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "lockstep=debug,info"
        } else {
            "lockstep=info,warn"
        })
    });
    let format = env::var("LOCKSTEP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = CampaignConfig {
        seed_range: args.seed_start..args.seed_start.saturating_add(args.seeds),
        steps: args.steps,
        fault_body_percent: args.body_failure,
        fault_hook_percent: args.hook_failure,
        fault_deadline_percent: args.expired_deadline,
        ..CampaignConfig::default()
    };

    if let Some(seed) = args.replay {
        let result = replay_seed(seed, &config)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            for event in &result.trace {
                println!(
                    "{:>4} {:<16} {:?} {:?}",
                    event.step,
                    format!("{:?}", event.fault),
                    event.operation,
                    event.outcome
                );
            }
            for violation in &result.oracle.violations {
                println!("violation: {violation}");
            }
        }
        if !result.oracle.passed {
            bail!("seed {seed} violated {} invariant(s)", result.oracle.violations.len());
        }
        return Ok(());
    }

    let report = run_campaign(&config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} commits={} rollbacks={}",
            report.seeds_run, report.seeds_passed, report.commits, report.rollbacks
        );
        for failure in &report.failures {
            println!("seed {} failed:", failure.seed);
            for violation in &failure.violations {
                println!("  {violation}");
            }
        }
    }
    if let Some(seed) = report.first_failure {
        bail!("campaign failed; replay with --replay {seed}");
    }
    Ok(())
}
