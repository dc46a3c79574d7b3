//! `nodestat ctl`: a blocking client for the agent's control surface.

use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:4241";

/// ctl subcommand configuration
pub struct Config {
    addr: SocketAddr,
    attr: String,
    value: Option<String>,
}

impl TryFrom<&ArgMatches> for Config {
    type Error = String;

    fn try_from(args: &ArgMatches) -> Result<Self, String> {
        let addr = args
            .get_one::<SocketAddr>("ADDR")
            .copied()
            .ok_or_else(|| "missing agent address".to_string())?;

        let attr = args
            .get_one::<String>("ATTR")
            .cloned()
            .ok_or_else(|| "missing attribute name".to_string())?;

        if attr.is_empty() || attr.contains('/') {
            return Err(format!("invalid attribute name: {attr:?}"));
        }

        Ok(Config {
            addr,
            attr,
            value: args.get_one::<String>("VALUE").cloned(),
        })
    }
}

impl Config {
    fn url(&self) -> String {
        format!("http://{}/{}", self.addr, self.attr)
    }
}

/// Create the ctl subcommand
pub fn command() -> Command {
    Command::new("ctl")
        .about("Read or write an attribute of a running agent")
        .arg(
            Arg::new("ADDR")
                .long("addr")
                .short('a')
                .help("Agent control listener")
                .value_parser(clap::value_parser!(SocketAddr))
                .default_value(DEFAULT_ADDR),
        )
        .arg(
            Arg::new("ATTR")
                .help("Attribute name, eg: ctrl, period, stat, last0")
                .required(true),
        )
        .arg(Arg::new("VALUE").help("Value to write. Reads the attribute when omitted"))
}

/// Reads or writes one attribute and prints the response body.
pub fn run(config: Config) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build http client")?;

    let url = config.url();

    let request = match &config.value {
        Some(value) => client.put(&url).body(value.clone()),
        None => client.get(&url),
    };

    let response = request
        .send()
        .with_context(|| format!("failed to reach agent at {}", config.addr))?;

    let status = response.status();
    let body = response.text().context("failed to read response")?;

    if !status.is_success() {
        bail!("{}: {}", status, body.trim_end());
    }

    print!("{body}");

    Ok(())
}
