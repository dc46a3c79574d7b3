use anyhow::Context;
use backtrace::Backtrace;
use clap::{value_parser, Arg, ArgAction, Command};

use std::path::PathBuf;

mod agent;
mod common;
mod ctl;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    let matches = Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Periodic hardware telemetry sampler.\n\n\
            Samples timing, perf, model specific register and board-management \
            counters at a fixed period into a bounded in-memory history, and \
            serves start/stop, period and history access over http.",
        )
        .subcommand_negates_reqs(true)
        .arg(
            Arg::new("CONFIG")
                .help("Agent configuration file")
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new("VERBOSE")
                .long("verbose")
                .short('v')
                .help("Increase verbosity")
                .action(ArgAction::Count),
        )
        .subcommand(ctl::command())
        .get_matches();

    let result = match matches.subcommand() {
        Some(("ctl", args)) => {
            let config = ctl::Config::try_from(args).unwrap_or_else(|e| {
                eprintln!("{e}");
                std::process::exit(1);
            });
            ctl::run(config)
        }
        _ => {
            let verbose = matches.get_count("VERBOSE");
            match matches.get_one::<PathBuf>("CONFIG") {
                Some(path) => agent::Config::load(path)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("failed to load config {}", path.display()))
                    .and_then(|config| agent::run(config, verbose)),
                None => Err(anyhow::anyhow!("no configuration file given")),
            }
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
