use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::icmp::IpVersion;

#[derive(Debug, Clone, Default)]
pub struct PingArgs {
    /// Falls back to the saved default host when absent.
    pub target: Option<String>,
    pub continuous: bool,
    pub resolve_addresses: bool,
    pub count: Option<u32>,
    pub size: Option<u32>,
    pub ttl: Option<u32>,
    pub timeout: Option<u32>,
    pub interval: Option<u64>,
    pub source_address: Option<IpAddr>,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
    pub trace: bool,
    pub engine: Option<String>,
    pub list_engines: bool,
    pub config: Option<PathBuf>,
    pub save_config: bool,
}

impl PingArgs {
    /// Family forced on the command line, if any.
    pub fn ip_version(&self) -> Option<IpVersion> {
        if self.force_ipv6 {
            Some(IpVersion::V6)
        } else if self.force_ipv4 {
            Some(IpVersion::V4)
        } else {
            None
        }
    }
}

pub fn build_cli() -> Command {
    Command::new("routeping")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ping and route discovery over pluggable ICMP engines")
        .arg(
            Arg::new("target")
                .help("Target hostname or IP address")
                .index(1)
        )
        .arg(
            Arg::new("continuous")
                .short('t')
                .help("Ping the specified host until stopped")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("resolve")
                .short('a')
                .help("Resolve addresses to hostnames")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("count")
                .short('n')
                .help("Number of echo requests to send")
                .value_name("count")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("size")
                .short('l')
                .help("Send buffer size")
                .value_name("size")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("ttl")
                .short('i')
                .help("Time To Live")
                .value_name("TTL")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("timeout")
                .short('w')
                .help("Timeout in milliseconds to wait for each reply")
                .value_name("timeout")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Milliseconds between echo requests")
                .value_name("ms")
                .value_parser(clap::value_parser!(u64).range(1..))
        )
        .arg(
            Arg::new("source_address")
                .short('S')
                .help("Source address to use")
                .value_name("srcaddr")
                .value_parser(clap::value_parser!(IpAddr))
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .help("Discover the route to the target hop by hop")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("engine")
                .long("engine")
                .help("Ping engine factory to use")
                .value_name("id")
        )
        .arg(
            Arg::new("list_engines")
                .long("list-engines")
                .help("List the available ping engines and exit")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("Settings file to read and write")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf))
        )
        .arg(
            Arg::new("save_config")
                .long("save-config")
                .help("Store the target, engine and interval as the new defaults")
                .action(ArgAction::SetTrue)
        )
}

pub fn parse_args() -> anyhow::Result<PingArgs> {
    from_matches(&build_cli().get_matches())
}

pub fn parse_args_from<I, T>(args: I) -> anyhow::Result<PingArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    from_matches(&build_cli().try_get_matches_from(args)?)
}

fn from_matches(matches: &ArgMatches) -> anyhow::Result<PingArgs> {
    let mut args = PingArgs {
        target: matches.get_one::<String>("target").cloned(),
        continuous: matches.get_flag("continuous"),
        resolve_addresses: matches.get_flag("resolve"),
        count: matches.get_one::<u32>("count").copied(),
        size: matches.get_one::<u32>("size").copied(),
        ttl: matches.get_one::<u32>("ttl").copied(),
        timeout: matches.get_one::<u32>("timeout").copied(),
        interval: matches.get_one::<u64>("interval").copied(),
        source_address: matches.get_one::<IpAddr>("source_address").copied(),
        force_ipv4: matches.get_flag("force_ipv4"),
        force_ipv6: matches.get_flag("force_ipv6"),
        trace: matches.get_flag("trace"),
        engine: matches.get_one::<String>("engine").cloned(),
        list_engines: matches.get_flag("list_engines"),
        config: matches.get_one::<PathBuf>("config").cloned(),
        save_config: matches.get_flag("save_config"),
    };

    // Validation
    if args.force_ipv4 && args.force_ipv6 {
        return Err(anyhow::anyhow!("Cannot force both IPv4 and IPv6"));
    }

    if let (Some(version), Some(source)) = (args.ip_version(), args.source_address) {
        if !version.matches(&source) {
            return Err(anyhow::anyhow!("Source address {} is not an {} address", source, version));
        }
    }

    if args.trace && args.continuous {
        return Err(anyhow::anyhow!("--trace cannot be combined with -t"));
    }

    if args.continuous {
        args.count = None; // Continuous mode overrides count
    } else if args.count.is_none() && !args.trace {
        args.count = Some(4);
    }

    Ok(args)
}
