use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use podtail_k8s::LabelSelector;
use podtail_output::OutputFormat;
use podtail_types::ResourceId;

/// Podtail - Follow the logs of every pod matching a selection
#[derive(Parser, Debug)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Namespace to follow (repeatable)
    #[arg(short = 'n', long = "ns", value_name = "NAMESPACE")]
    pub namespaces: Vec<String>,

    /// Pod to follow (repeatable)
    #[arg(short = 'p', long = "pod", value_name = "[NAMESPACE/]NAME")]
    pub pods: Vec<ResourceId>,

    /// Label selector pods must match (repeatable, ANDed)
    #[arg(short = 'l', long = "label", value_name = "SELECTOR")]
    pub labels: Vec<LabelSelector>,

    /// Label selector of pods to skip [default: podtail.ignore=true]
    #[arg(long = "ignore", value_name = "SELECTOR")]
    pub ignore: Vec<LabelSelector>,

    /// Node the pods run on (repeatable)
    #[arg(long = "node", value_name = "NAME")]
    pub nodes: Vec<String>,

    /// Service whose pods to follow (repeatable)
    #[arg(long = "svc", value_name = "[NAMESPACE/]NAME")]
    pub services: Vec<ResourceId>,

    /// Replication controller whose pods to follow (repeatable)
    #[arg(long = "rc", value_name = "[NAMESPACE/]NAME")]
    pub rcs: Vec<ResourceId>,

    /// Replica set whose pods to follow (repeatable)
    #[arg(long = "rs", value_name = "[NAMESPACE/]NAME")]
    pub rss: Vec<ResourceId>,

    /// Daemon set whose pods to follow (repeatable)
    #[arg(long = "ds", value_name = "[NAMESPACE/]NAME")]
    pub dss: Vec<ResourceId>,

    /// Deployment whose pods to follow (repeatable)
    #[arg(short = 'd', long = "deploy", value_name = "[NAMESPACE/]NAME")]
    pub deployments: Vec<ResourceId>,

    /// Only follow these containers (comma separated)
    #[arg(short = 'c', long = "containers", value_name = "NAME", value_delimiter = ',')]
    pub containers: Vec<String>,

    /// Kubernetes context name (defaults to the current context)
    #[arg(long)]
    pub context: Option<String>,

    /// Lookback for the first read of each container, e.g. 5s, 2m, 1.5h or 2h45m [default: 1s]
    #[arg(long, value_parser = parse_since)]
    pub since: Option<Duration>,

    /// Prefix every line with its timestamp
    #[arg(long)]
    pub timestamps: bool,

    /// Output format: default, raw, json, json-pretty
    #[arg(short = 'o', long)]
    pub output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Capacity of the event queue; lines beyond it are dropped [default: 500]
    #[arg(long)]
    pub buffer: Option<usize>,

    /// Print the containers that would be followed and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Log level or filter directive for diagnostics on stderr [default: error]
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// TOML file with default settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Parse a duration made of `<number><unit>` parts, e.g. `1.5h` or `2h45m`
///
/// Numbers may carry a fraction; units are `h`, `m`, `s`, `ms`, `us` and
/// `ns`. A bare `0` is accepted.
pub fn parse_since(s: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration '{s}', expected e.g. 10s, 1.5h or 2h45m");

    let text = s.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = text.strip_prefix('+').unwrap_or(text);
    if rest.is_empty() {
        return Err(invalid());
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    while !rest.is_empty() {
        let (number, tail) = rest.split_at(rest.find(|c| !is_number(c)).unwrap_or(rest.len()));
        let (unit, tail) = tail.split_at(tail.find(is_number).unwrap_or(tail.len()));
        let value: f64 = number.parse().map_err(|_| invalid())?;
        total += match unit {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1e3,
            "us" | "µs" => value / 1e6,
            "ns" => value / 1e9,
            _ => return Err(invalid()),
        };
        rest = tail;
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
