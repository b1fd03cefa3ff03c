use std::process;

use anyhow::Context;
use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use bookr_bridge::{Dispatcher, DispatcherConfig, Record, Value};

const DEFAULT_REQUEST: &str = "resources";

#[derive(Debug, PartialEq)]
struct Args {
    request: String,
    fields: Record,
    program: Option<String>,
    program_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();

    let args = match parse_args(&argv) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: bookr-bridge [--request <id>] [--field <key>=<value>]... [<program> [args...]]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <program>             Child program [default: $BOOKR_BIN or bookr]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --request <id>        Request id to send [default: {DEFAULT_REQUEST}]");
            eprintln!("  --field <key>=<value> Payload field, may be repeated");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Log to stderr. `RUST_LOG` takes a full filter directive; otherwise
/// `BOOKR_LOG` sets this crate's level (default `info`). `LOG_FORMAT=json`
/// switches to one JSON object per event.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("BOOKR_LOG")
            .ok()
            .and_then(|level| level.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::INFO);
        EnvFilter::new(format!("bookr_bridge={level}"))
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let output = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(output.json()).try_init()
    } else {
        registry.with(output).try_init()
    };
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut request = DEFAULT_REQUEST.to_string();
    let mut fields = Record::new();
    let mut program = None;
    let mut program_args = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        if program.is_some() {
            program_args.push(args[i].clone());
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--request" => {
                i += 1;
                request = args.get(i).ok_or("--request requires a value")?.clone();
            }
            "--field" => {
                i += 1;
                let pair = args.get(i).ok_or("--field requires a value")?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("--field expects key=value, got '{pair}'"))?;
                fields.insert(key.to_string(), Value::from(value));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => program = Some(arg.to_string()),
        }
        i += 1;
    }

    Ok(Args {
        request,
        fields,
        program,
        program_args,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = DispatcherConfig::from_env();
    if let Some(program) = args.program {
        config = config.with_command(program, args.program_args);
    }

    tracing::info!("bookr-bridge {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Starting backend");
    let dispatcher = Dispatcher::start(config).context("failed starting backend")?;

    let response = dispatcher
        .call(args.request.as_str(), args.fields)
        .await
        .with_context(|| format!("request '{}' failed", args.request))?;
    println!("{}", serde_json::to_string_pretty(&*response)?);

    tracing::info!("Stopping backend");
    if let Some(status) = dispatcher.stop().await?
        && !status.success()
    {
        tracing::warn!(%status, "Backend exited unsuccessfully");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("bookr-bridge")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.request, "resources");
        assert!(args.fields.is_empty());
        assert!(args.program.is_none());
    }

    #[test]
    fn request_fields_and_program() {
        let args = parse_args(&argv(&[
            "--request",
            "lookup",
            "--field",
            "title=Dune",
            "--field",
            "note=a=b",
            "./bookr",
            "--verbose",
            "data",
        ]))
        .unwrap();

        assert_eq!(args.request, "lookup");
        assert_eq!(args.fields.get("title"), Some(&Value::from("Dune")));
        assert_eq!(args.fields.get("note"), Some(&Value::from("a=b")));
        assert_eq!(args.program.as_deref(), Some("./bookr"));
        assert_eq!(args.program_args, ["--verbose", "data"]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&["--request"])).is_err());
        assert!(parse_args(&argv(&["--field", "novalue"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert_eq!(parse_args(&argv(&["--help"])), Err(String::new()));
    }
}
