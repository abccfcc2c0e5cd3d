mod cli;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::ArgMatches;
use log::info;
use reqwest::Method;
use twitch_bridge::endpoints::{self, ENDPOINTS};
use twitch_bridge::{ClientBuilder, Config, Outcome, Request};

// The main thread plays the part of the GUI loop: it owns the client and
// every callback runs here.
fn main() -> anyhow::Result<()> {
    let matches = cli::build_cli().get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    cli::init_logging(log_level.as_deref());

    if matches.get_flag("version") {
        println!("twitch-bridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (request, sub) = match matches.subcommand() {
        Some(("endpoints", _)) => {
            print_endpoints();
            return Ok(());
        }
        Some(("call", sub)) => {
            let id = sub
                .get_one::<String>("endpoint")
                .ok_or_else(|| anyhow!("missing endpoint"))?;
            let template = endpoints::lookup(id)
                .ok_or_else(|| anyhow!("unknown endpoint `{}` (see `twitch-bridge endpoints`)", id))?;
            let args = cli::pairs(sub, "arg").map_err(anyhow::Error::msg)?;
            let params = cli::pairs(sub, "param").map_err(anyhow::Error::msg)?;
            (template.bind(&args, params)?, sub)
        }
        Some(("raw", sub)) => {
            let method = sub
                .get_one::<String>("method")
                .ok_or_else(|| anyhow!("missing method"))?;
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method {:?}", method))?;
            let path = sub
                .get_one::<String>("path")
                .ok_or_else(|| anyhow!("missing path"))?;
            let mut request = Request::new(method, path.as_str());
            request.params = cli::pairs(sub, "param").map_err(anyhow::Error::msg)?;
            (request, sub)
        }
        _ => {
            cli::build_cli().print_help()?;
            return Ok(());
        }
    };

    let request = match sub.get_one::<String>("body") {
        Some(raw) => request.with_body(serde_json::from_str(raw).context("--body is not valid JSON")?),
        None => request,
    };
    let count = sub.get_one::<u32>("count").copied().unwrap_or(1);
    let include_rate = sub.get_flag("include-rate");

    let failed = run(request, count, include_rate)?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_endpoints() {
    for e in ENDPOINTS {
        let line = serde_json::json!({
            "id": e.id,
            "method": e.method.as_str(),
            "path": e.path,
            "bucket": e.bucket,
            "paged": e.paged,
            "description": e.description,
        });
        println!("{}", line);
    }
}

/// Submit `count` copies and pump events until every callback has run.
/// Returns whether any request failed.
fn run(request: Request, count: u32, include_rate: bool) -> anyhow::Result<bool> {
    let cfg = Config::from_env()?;
    let bucket = request.bucket.clone();
    let mut client = ClientBuilder::new(cfg).build()?;

    let finished: Rc<RefCell<Vec<(u32, Outcome)>>> = Rc::default();
    for n in 1..=count {
        let finished = finished.clone();
        client.submit(request.clone(), move |outcome| {
            finished.borrow_mut().push((n, outcome));
        });
    }
    info!("submitted {} request(s) to {}", count, request.route_key());

    let mut failed = false;
    while client.pending() > 0 {
        client.wait_for_events(Duration::from_millis(100));
        let rate = if include_rate {
            client.rate_limit(&bucket)
        } else {
            None
        };
        for (n, outcome) in finished.borrow_mut().drain(..) {
            let mut line = match outcome {
                Ok(payload) => serde_json::json!({
                    "request": n,
                    "status": payload.status,
                    "body": payload.body,
                }),
                Err(e) => {
                    failed = true;
                    serde_json::json!({ "request": n, "error": e.to_info() })
                }
            };
            if let (Some(rate), Some(obj)) = (&rate, line.as_object_mut()) {
                obj.insert("rate".to_string(), serde_json::to_value(rate)?);
            }
            println!("{}", line);
        }
    }
    Ok(failed)
}
