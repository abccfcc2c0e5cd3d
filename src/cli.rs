use std::collections::BTreeMap;

use clap::{Arg, ArgAction, ArgMatches, Command};

pub fn build_cli() -> Command {
    let count = Arg::new("count")
        .long("count")
        .num_args(1)
        .value_parser(clap::value_parser!(u32).range(1..=1000))
        .default_value("1")
        .help("Submit the request this many times");
    let param = Arg::new("param")
        .long("param")
        .short('p')
        .num_args(1)
        .action(ArgAction::Append)
        .help("Query parameter as key=value (repeatable)");
    let body = Arg::new("body")
        .long("body")
        .num_args(1)
        .help("JSON request body");
    let include_rate = Arg::new("include-rate")
        .long("include-rate")
        .action(ArgAction::SetTrue)
        .help("Attach the bucket's rate limit state to each result");

    Command::new("twitch-bridge")
        .about("Twitch v5 REST client driven from a single-threaded event loop")
        .disable_version_flag(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .global(true)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("endpoints").about("List the endpoint table"))
        .subcommand(
            Command::new("call")
                .about("Call an endpoint from the table")
                .arg(Arg::new("endpoint").required(true))
                .arg(
                    Arg::new("arg")
                        .long("arg")
                        .short('a')
                        .num_args(1)
                        .action(ArgAction::Append)
                        .help("Path argument as key=value (repeatable)"),
                )
                .arg(param.clone())
                .arg(body.clone())
                .arg(count.clone())
                .arg(include_rate.clone()),
        )
        .subcommand(
            Command::new("raw")
                .about("Send an arbitrary request relative to the API base URL")
                .arg(Arg::new("method").required(true))
                .arg(Arg::new("path").required(true))
                .arg(param)
                .arg(body)
                .arg(count)
                .arg(include_rate),
        )
}

/// Parse repeated `key=value` options.
pub fn pairs(matches: &ArgMatches, id: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    if let Some(values) = matches.get_many::<String>(id) {
        for raw in values {
            let (k, v) = raw
                .split_once('=')
                .ok_or_else(|| format!("--{} expects key=value, got {:?}", id, raw))?;
            out.insert(k.trim().to_string(), v.to_string());
        }
    }
    Ok(out)
}

pub fn init_logging(level: Option<&str>) {
    // Respect explicit level, else default to info, allow env override via RUST_LOG
    if let Some(lvl) = level {
        std::env::set_var("RUST_LOG", lvl);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
