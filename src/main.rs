use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use adaptyst::config::{Config, PerfPaths};
use adaptyst::cpu;
use adaptyst::errors::SessionError;
use adaptyst::event::{CaptureMode, ExtraEvent};
use adaptyst::filter::{FilterMode, FilterPattern, StackFilter};
use adaptyst::roofline;
use adaptyst::session::{run_session, CodesDst, SessionConfig};
use adaptyst::utils::split_unix;

const FOOTER: &str = "\
If you want to change the paths of the system-wide and local configuration
files, set the environment variables ADAPTYST_CONFIG and ADAPTYST_LOCAL_CONFIG
respectively to values of your choice. Similarly, you can set the
ADAPTYST_SCRIPT_DIR environment variable to change the path where the
processing scripts are looked up.";

#[derive(Debug, Parser)]
#[command(
    name = "adaptyst",
    about = "adaptyst: a performance analysis tool",
    disable_version_flag = true,
    after_help = FOOTER
)]
struct Cli {
    /// Print version and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Sampling frequency per second for on-CPU time profiling
    #[arg(short = 'F', long, default_value_t = 10, value_name = "UINT>0",
          value_parser = clap::value_parser!(u32).range(1..))]
    freq: u32,

    /// Buffer up to this number of events before sending data for
    /// processing (1 effectively disables buffering)
    #[arg(short = 'B', long, default_value_t = 1, value_name = "UINT>0",
          value_parser = clap::value_parser!(u32).range(1..))]
    buffer: u32,

    /// Sampling frequency per second for off-CPU time profiling (0 disables
    /// off-CPU profiling, -1 captures *all* off-CPU events)
    #[arg(short = 'f', long, default_value_t = 1000, value_name = "UINT or -1",
          value_parser = clap::value_parser!(i64).range(-1..))]
    off_cpu_freq: i64,

    /// Buffer up to this number of off-CPU events before sending data for
    /// processing (0 leaves the default adaptive buffering)
    #[arg(short = 'b', long, default_value_t = 0, value_name = "UINT")]
    off_cpu_buffer: u32,

    /// Number of threads isolated from the profiled command to use for
    /// profilers and processing. Use 0 to disable isolation (NOT
    /// RECOMMENDED).
    #[arg(short = 'p', long, default_value_t = 1, value_name = "UINT")]
    post_process: u32,

    /// Delegate processing to another machine running the ingest server.
    /// All results will be stored on that machine.
    #[arg(short = 'a', long, value_name = "ADDRESS:PORT")]
    address: Option<String>,

    /// Send the newline-separated list of detected source code files to
    /// "srv" (archive on the server), "file:<path>", or "fd:<number>"
    /// rather than packing the files on this machine
    #[arg(short = 'c', long, value_name = "TYPE[:ARG]")]
    codes: Option<String>,

    /// Communication buffer size in bytes for the internal ingest server.
    /// Not to be used with -a.
    #[arg(short = 's', long, default_value_t = 1024, value_name = "UINT>0",
          conflicts_with = "address",
          value_parser = clap::value_parser!(u32).range(1..))]
    server_buffer: u32,

    /// Warmup time in seconds between the ingest server signalling
    /// readiness and starting the profiled program. Increase this value if
    /// you see missing information after profiling.
    #[arg(short = 'w', long, default_value_t = 1, value_name = "UINT>0",
          value_parser = clap::value_parser!(u32).range(1..))]
    warmup: u32,

    /// Extra perf event to be used for sampling with a given period,
    /// displayed under the title TITLE. Repeat for multiple events.
    #[arg(short = 'e', long = "event", value_name = "EVENT,PERIOD,TITLE")]
    event: Vec<String>,

    /// Run also cache-aware roofline profiling with the specified sampling
    /// frequency per second (x86 only)
    #[arg(short = 'r', long, value_name = "UINT>0",
          value_parser = clap::value_parser!(u32).range(1..))]
    roofline: Option<u32>,

    /// Stack trace filtering: deny:<FILE>, allow:<FILE> (use - for stdin),
    /// or python:<FILE>
    #[arg(short = 'i', long, value_name = "TYPE:FILE")]
    filter: Option<String>,

    /// When -i is used, mark filtered out stack trace elements as "(cut)"
    /// rather than deleting them completely
    #[arg(short = 'k', long, requires = "filter")]
    mark: bool,

    /// Capture only kernel, only user (i.e. non-kernel), or both stack
    /// trace types
    #[arg(short = 'm', long, default_value = "user", value_name = "kernel|user|both")]
    mode: String,

    /// Do not print anything (if set, check the exit code for any errors)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Command to be profiled (required). Either one pre-split argv after
    /// `--` or a single string split with shell-like rules.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    // Flag violations are user errors (exit 3), not clap's default exit 2;
    // --help and the like still exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { 3 } else { 0 };
        }
    };

    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    if !cli.quiet {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    match build_and_run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            err.exit_code()
        }
    }
}

fn build_and_run(cli: Cli) -> Result<i32, SessionError> {
    let hw = cpu::hw_threads();
    let max_post_process = cpu::max_post_process(hw);
    if cli.post_process > max_post_process {
        return Err(SessionError::User(format!(
            "-p must not be greater than {} on this machine",
            max_post_process
        )));
    }

    let capture_mode = CaptureMode::parse(&cli.mode)?;
    let remote = cli.address.as_deref().map(parse_address).transpose()?;
    let codes_dst = cli.codes.as_deref().map(parse_codes).transpose()?.unwrap_or_default();
    let filter = build_filter(cli.filter.as_deref(), cli.mark)?;
    let command = build_command(&cli.command)?;

    let mut extra_events = cli
        .event
        .iter()
        .map(|arg| ExtraEvent::parse(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let config = Config::load()?;
    let paths = PerfPaths::resolve(&config)?;

    if let Some(roofline_freq) = cli.roofline {
        if !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            return Err(SessionError::User(
                "roofline profiling is only available on x86 machines".to_string(),
            ));
        }
        let vendor = roofline::detect_vendor()?;
        let csv = roofline::benchmark_csv(&config)?;
        info!("using roofline benchmark results from {}", csv.display());
        extra_events.extend(roofline::carm_events(vendor, roofline_freq));
    }

    let session = SessionConfig {
        freq: cli.freq,
        buffer: cli.buffer,
        off_cpu_freq: cli.off_cpu_freq,
        off_cpu_buffer: cli.off_cpu_buffer,
        post_process: cli.post_process,
        capture_mode,
        warmup: cli.warmup,
        extra_events,
        filter,
        remote,
        codes_dst,
        server_buffer: cli.server_buffer as usize,
        file_timeout: Duration::from_secs(30),
        command,
    };

    run_session(&session, &paths)
}

fn parse_address(arg: &str) -> Result<(String, u16), SessionError> {
    let bad = || {
        SessionError::User(format!(
            "the value of -a must be in form of \"<address>:<port>\", not {:?}",
            arg
        ))
    };
    let (host, port) = arg.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port: u16 = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

fn parse_codes(arg: &str) -> Result<CodesDst, SessionError> {
    if arg == "srv" {
        return Ok(CodesDst::Server);
    }
    if let Some(path) = arg.strip_prefix("file:") {
        if !path.is_empty() {
            return Ok(CodesDst::File(PathBuf::from(path)));
        }
    }
    if let Some(fd) = arg.strip_prefix("fd:") {
        if let Ok(fd) = fd.parse::<i32>() {
            return Ok(CodesDst::Fd(fd));
        }
    }
    Err(SessionError::User(format!(
        "the value of -c must be in form of \"srv\", \"file:<path>\", or \"fd:<number>\", \
         not {:?}",
        arg
    )))
}

fn build_filter(arg: Option<&str>, mark: bool) -> Result<StackFilter, SessionError> {
    let Some(arg) = arg else {
        return Ok(StackFilter::default());
    };

    let re = Regex::new(r"^(deny|allow|python):(.+)$").unwrap();
    let Some(caps) = re.captures(arg) else {
        return Err(SessionError::User(format!(
            "the value of -i must be one of the following: deny:<FILE>, allow:<FILE>, \
             python:<FILE>, not {:?}",
            arg
        )));
    };
    let kind = &caps[1];
    let source = &caps[2];

    if kind == "python" {
        if source == "-" {
            return Err(SessionError::User(
                "stdin is not accepted for python filtering".to_string(),
            ));
        }
        let script = std::fs::canonicalize(source).map_err(|_| {
            SessionError::User(format!("cannot read the filter script {:?}", source))
        })?;
        return Ok(StackFilter {
            mode: FilterMode::Script(script),
            mark,
        });
    }

    let text = if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|err| SessionError::User(format!("cannot read stdin: {}", err)))?;
        text
    } else {
        std::fs::read_to_string(source)
            .map_err(|_| SessionError::User(format!("cannot read {:?}", source)))?
    };

    let pattern = FilterPattern::parse(&text)?;
    let mode = if kind == "allow" {
        FilterMode::Allow(pattern)
    } else {
        FilterMode::Deny(pattern)
    };
    Ok(StackFilter { mode, mark })
}

/// Command given after `--` is a pre-split argv; otherwise every positional
/// is tokenized with shell-like splitting rules and concatenated.
fn build_command(parts: &[String]) -> Result<Vec<String>, SessionError> {
    if parts.is_empty() {
        return Err(SessionError::User(
            "you need to provide the command to be profiled".to_string(),
        ));
    }

    if std::env::args().any(|arg| arg == "--") {
        return Ok(parts.to_vec());
    }

    let mut command = Vec::new();
    for part in parts {
        command.extend(split_unix(part)?);
    }
    if command.is_empty() {
        return Err(SessionError::User(
            "the command you have provided is not a valid one".to_string(),
        ));
    }
    Ok(command)
}
