use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use surge_core::duration::parse_duration;
use surge_core::options::{OptField, Options};
use surge_core::source::SourceType;

fn parse_duration_arg(input: &str) -> Result<Duration, String> {
    parse_duration(input)
}

fn parse_source_type(input: &str) -> Result<SourceType, String> {
    input.parse()
}

#[derive(Debug, Parser)]
#[command(
    name = "surge",
    author,
    version,
    about = "Scriptable load testing tool",
    long_about = "surge drives a configurable population of concurrent virtual users against a\ntarget and records per-iteration metrics, user-defined checks and thresholds.\n\nThe target is `-` (stdin), a URL, a script file, or inline script code. While\na test runs, a REST control API on --address allows pausing, resuming and\nscaling the pool.",
    after_help = "Examples:\n  surge https://example.test/ --vus 10 --duration 30s\n  surge script.lua --vus 50 --max 100 --duration 1m\n  surge 'check(\"ok\", true)' --type script --duration 5s\n  surge script.lua --config base.yaml --out json=samples.ndjson"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start running a load test
    #[command(
        long_about = "Construct a runner from the target and the --type flag, merge options\n(runner defaults, config files, CLI flags, in that precedence) and run the\ntest. Initial status parameters (vus, max, duration) behave exactly like a\nlive API patch applied at startup."
    )]
    Run(RunArgs),

    /// Merge and print the effective test configuration
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Test target: `-` for stdin, a URL, a filename, or inline script code
    pub target: String,

    /// Virtual users to simulate
    #[arg(long, short = 'u')]
    pub vus: Option<i64>,

    /// Max number of virtual users, if more than --vus
    #[arg(long, short = 'm')]
    pub max: Option<i64>,

    /// Test duration (e.g. 10s, 1m), 0 to run until cancelled
    #[arg(long, short = 'd', value_parser = parse_duration_arg)]
    pub duration: Option<Duration>,

    /// Acceptable margin of failed checks before the run is reported over
    /// budget
    #[arg(long, short = 'a')]
    pub acceptance: Option<f64>,

    /// Start the test in a paused state
    #[arg(long, short = 'p')]
    pub paused: bool,

    /// Input type, one of: auto, url, script
    #[arg(long = "type", short = 't', default_value = "auto", value_parser = parse_source_type)]
    pub source_type: SourceType,

    /// Keep the process (and control API) alive after test completion
    #[arg(long, short = 'l')]
    pub linger: bool,

    /// Abort immediately if the test gets tainted
    #[arg(long)]
    pub abort_on_taint: bool,

    /// Follow at most n redirects
    #[arg(long)]
    pub max_redirects: Option<i64>,

    /// Output metrics to an external data store (`<kind>=<destination>`,
    /// kinds: influxdb, json)
    #[arg(long, short = 'o', value_name = "KIND=DEST")]
    pub out: Option<String>,

    /// Read additional config files (repeatable, applied in order)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Bind address for the REST control API
    #[arg(long, default_value = "127.0.0.1:6565")]
    pub address: SocketAddr,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Test target: `-` for stdin, a URL, a filename, or inline script code
    pub target: String,

    /// Input type, one of: auto, url, script
    #[arg(long = "type", short = 't', default_value = "auto", value_parser = parse_source_type)]
    pub source_type: SourceType,

    /// Read additional config files (repeatable, applied in order)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Vec<PathBuf>,
}

impl RunArgs {
    /// Options layer contributed by explicitly-passed CLI flags. Flags left
    /// at their clap defaults stay invalid so lower layers shine through.
    pub fn options(&self) -> Options {
        let mut opts = Options::default();
        if let Some(vus) = self.vus {
            opts.vus = OptField::some(vus);
        }
        if let Some(max) = self.max {
            opts.vus_max = OptField::some(max);
        }
        if let Some(duration) = self.duration {
            opts.duration = OptField::some(duration);
        }
        if let Some(acceptance) = self.acceptance {
            opts.acceptance = OptField::some(acceptance);
        }
        if let Some(max_redirects) = self.max_redirects {
            opts.max_redirects = OptField::some(max_redirects);
        }
        if self.paused {
            opts.paused = OptField::some(true);
        }
        if self.linger {
            opts.linger = OptField::some(true);
        }
        if self.abort_on_taint {
            opts.abort_on_taint = OptField::some(true);
        }
        opts
    }
}
