// SPDX-License-Identifier: PMPL-1.0-or-later

//! chaos-agent: inject and recover host faults from the command line.
//!
//! Fault flags are declared by each injector, so the `inject` and `recover`
//! trees are assembled from the registry at startup rather than derived.

use anyhow::{anyhow, Context, Result};
use chaos_agent::config::AgentConfig;
use chaos_agent::host::Host;
use chaos_agent::injector::{FaultDomain, Info, Injector, Registry};
use clap::{value_parser, Arg, ArgMatches, Command};
use colored::Colorize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init(); // RUST_LOG=debug shows every tc/kill invocation

    let registry = Registry::builtin();
    // Flags only need an instance to declare themselves; the real host is
    // built once the config flag has been read.
    let declaring = Host::system(&AgentConfig::default())?;
    let matches = build_cli(&registry, &declaring).get_matches();

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    }
    .with_env();
    let host = Host::system(&config)?;

    match matches.subcommand() {
        Some(("list", _)) => {
            println!("Registered faults:");
            for (domain, fault) in registry.faults() {
                println!("  {}/{}", domain, fault);
            }
            Ok(())
        }
        Some(("inject", sub)) => {
            let (domain, fault, fault_matches) = fault_selection(sub)?;
            run_inject(&registry, host, domain, fault, fault_matches)
        }
        Some(("recover", sub)) => {
            let (domain, fault, fault_matches) = fault_selection(sub)?;
            run_recover(&registry, host, domain, fault, fault_matches)
        }
        _ => Err(anyhow!("no command given, see --help")),
    }
}

fn build_cli(registry: &Registry, host: &Host) -> Command {
    let mut inject = Command::new("inject")
        .about("Inject a fault")
        .subcommand_required(true);
    let mut recover = Command::new("recover")
        .about("Recover a fault from its uid and arguments")
        .subcommand_required(true);

    let mut domains: Vec<FaultDomain> = registry.faults().map(|(domain, _)| domain).collect();
    domains.dedup();

    for domain in domains {
        let mut inject_domain = Command::new(domain.as_str()).subcommand_required(true);
        let mut recover_domain = Command::new(domain.as_str()).subcommand_required(true);

        for fault in registry
            .faults()
            .filter(|(d, _)| *d == domain)
            .map(|(_, fault)| fault)
        {
            let Some(sample) = registry.create(domain, fault, Info::default(), host.clone())
            else {
                continue;
            };

            let inject_fault = sample.set_option(
                Command::new(fault)
                    .about(format!("Inject {}/{}", domain, fault))
                    .arg(
                        Arg::new("uid")
                            .short('u')
                            .long("uid")
                            .help("fault instance id (generated when omitted)"),
                    )
                    .arg(
                        Arg::new("timeout")
                            .short('t')
                            .long("timeout")
                            .help("recover automatically after this long, eg: 30s, 5m"),
                    ),
            );
            let recover_fault = sample.set_option(
                Command::new(fault)
                    .about(format!("Recover {}/{}", domain, fault))
                    .arg(
                        Arg::new("uid")
                            .short('u')
                            .long("uid")
                            .required(true)
                            .help("fault instance id used at injection"),
                    )
                    .arg(
                        Arg::new("args")
                            .long("args")
                            .help("fault arguments as JSON, instead of flags"),
                    )
                    .arg(
                        Arg::new("after")
                            .long("after")
                            .value_parser(value_parser!(u64))
                            .hide(true)
                            .help("seconds to wait before recovering"),
                    ),
            );

            inject_domain = inject_domain.subcommand(inject_fault);
            recover_domain = recover_domain.subcommand(recover_fault);
        }

        inject = inject.subcommand(inject_domain);
        recover = recover.subcommand(recover_domain);
    }

    Command::new("chaos-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Single-host fault injection: disk I/O burn and network delay")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("agent config file (.json, .yaml)"),
        )
        .subcommand(Command::new("list").about("List registered faults"))
        .subcommand(inject)
        .subcommand(recover)
}

fn fault_selection(matches: &ArgMatches) -> Result<(FaultDomain, String, &ArgMatches)> {
    let (domain, domain_matches) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("no fault domain given"))?;
    let (fault, fault_matches) = domain_matches
        .subcommand()
        .ok_or_else(|| anyhow!("no fault given for domain {}", domain))?;
    let domain: FaultDomain = domain.parse().map_err(|err: String| anyhow!(err))?;
    Ok((domain, fault.to_string(), fault_matches))
}

fn create(
    registry: &Registry,
    host: Host,
    domain: FaultDomain,
    fault: &str,
    info: Info,
) -> Result<Box<dyn Injector>> {
    registry
        .create(domain, fault, info, host)
        .ok_or_else(|| anyhow!("unknown fault {}/{}", domain, fault))
}

fn run_inject(
    registry: &Registry,
    host: Host,
    domain: FaultDomain,
    fault: String,
    matches: &ArgMatches,
) -> Result<()> {
    let info = Info {
        uid: matches.get_one::<String>("uid").cloned().unwrap_or_default(),
        timeout: matches.get_one::<String>("timeout").cloned(),
        ..Info::default()
    };
    let mut injector = create(registry, host, domain, &fault, info)?;

    injector.bind_options(matches);
    injector.set_default();
    injector
        .validate()
        .with_context(|| format!("validating {}/{}", domain, fault))?;
    injector
        .inject()
        .with_context(|| format!("injecting {}/{}", domain, fault))?;

    let timeout = injector.base().timeout_secs();
    if timeout > 0 {
        if let Err(err) = injector.delay_recover(timeout) {
            if let Err(undo_err) = injector.recover() {
                log::error!("uid={} recover error: {}", injector.info().uid, undo_err);
            }
            return Err(err).context("scheduling recovery");
        }
    }

    let info = injector.info();
    let record = serde_json::json!({
        "uid": info.uid,
        "domain": domain,
        "fault": fault,
        "timeout": info.timeout,
        "created_at": info.created_at,
        "args": injector.args(),
        "runtime": injector.runtime(),
    });
    println!("{} {}/{} injected", "[OK]".green(), domain, fault);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run_recover(
    registry: &Registry,
    host: Host,
    domain: FaultDomain,
    fault: String,
    matches: &ArgMatches,
) -> Result<()> {
    let uid = matches
        .get_one::<String>("uid")
        .cloned()
        .ok_or_else(|| anyhow!("--uid is required"))?;

    if let Some(after) = matches.get_one::<u64>("after").copied() {
        log::info!("uid={} recovering in {}s", uid, after);
        thread::sleep(Duration::from_secs(after));
    }

    let mut injector = create(registry, host, domain, &fault, Info::new(uid.clone()))?;
    match matches.get_one::<String>("args") {
        Some(raw) => {
            let args = serde_json::from_str(raw).context("parsing --args")?;
            injector.load_args(args)?;
        }
        None => injector.bind_options(matches),
    }
    injector.set_default();

    if let Err(err) = injector.recover() {
        log::error!("uid={} recover error: {}", uid, err);
        println!("{} {}/{} uid={}", "[ERR]".red(), domain, fault, uid);
        return Err(err.into());
    }

    println!("{} {}/{} uid={} recovered", "[OK]".green(), domain, fault, uid);
    Ok(())
}
