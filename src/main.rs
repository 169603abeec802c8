use std::io::{self, Write};
use std::path::PathBuf;

use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use log::*;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use memflow_kstate::config::SessionConfig;
use memflow_kstate::kernel::{default_walk_limit, LockWaiterWalker};
use memflow_kstate::report::{write_lock_report, write_snapshot, SnapshotReporter, TaskFilter};
use memflow_kstate::Result;

const DEFAULT_MUTEX: &str = "rtnl_mutex";

fn cli() -> Command {
    command!()
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("TOML session configuration"),
        )
        .arg(
            Arg::new("connector")
                .long("connector")
                .help("memflow connector name (default: kcore)"),
        )
        .arg(
            Arg::new("connector-args")
                .long("connector-args")
                .help("arguments passed to the connector"),
        )
        .arg(
            Arg::new("dtb")
                .long("dtb")
                .help("physical address of the kernel page table root"),
        )
        .arg(
            Arg::new("system-map")
                .long("system-map")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("vmlinux")
                .long("vmlinux")
                .value_parser(value_parser!(PathBuf))
                .help("read symbols from the kernel ELF instead of System.map"),
        )
        .arg(
            Arg::new("schema")
                .long("schema")
                .value_parser(value_parser!(PathBuf))
                .help("TOML type schema of the inspected kernel"),
        )
        .arg(Arg::new("kaslr-offset").long("kaslr-offset"))
        .arg(
            Arg::new("max-steps")
                .long("max-steps")
                .global(true)
                .value_parser(value_parser!(usize))
                .help("upper bound on nodes visited per list walk"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("ps")
                .about("list tasks with their memory usage")
                .arg(
                    Arg::new("kthread")
                        .short('k')
                        .long("kthread")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("uthread")
                        .short('u')
                        .long("uthread")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("active")
                        .short('a')
                        .long("active")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("threads")
                        .short('t')
                        .long("threads")
                        .num_args(1..)
                        .value_parser(value_parser!(i32)),
                )
                .arg(
                    Arg::new("childs")
                        .short('c')
                        .long("childs")
                        .num_args(1..)
                        .value_parser(value_parser!(i32)),
                ),
        )
        .subcommand(
            Command::new("mutex")
                .about("show the owner and waiters of a global mutex")
                .arg(Arg::new("name").default_value(DEFAULT_MUTEX)),
        )
}

fn session_config(matches: &ArgMatches) -> Result<SessionConfig> {
    let file = match matches.get_one::<PathBuf>("config") {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let string = |id: &str| matches.get_one::<String>(id).cloned();
    let path = |id: &str| matches.get_one::<PathBuf>(id).cloned();

    Ok(file.merge(SessionConfig {
        connector: string("connector"),
        connector_args: string("connector-args"),
        dtb: string("dtb"),
        kaslr_offset: string("kaslr-offset"),
        system_map: path("system-map"),
        vmlinux: path("vmlinux"),
        schema: path("schema"),
        max_list_steps: matches.get_one::<usize>("max-steps").copied(),
    }))
}

fn task_filter(matches: &ArgMatches) -> TaskFilter {
    let pids = |id: &str| {
        matches
            .get_many::<i32>(id)
            .map(|v| v.copied().collect())
            .unwrap_or_default()
    };

    TaskFilter {
        kernel_only: matches.get_flag("kthread"),
        user_only: matches.get_flag("uthread"),
        active_only: matches.get_flag("active"),
        threads: pids("threads"),
        children_of: pids("childs"),
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let config = session_config(matches)?;
    let mut session = config.open_session()?;

    let limit = match config.max_list_steps {
        Some(limit) => limit,
        None => default_walk_limit(&mut session),
    };
    debug!("list walk limit: {}", limit);

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match matches.subcommand() {
        Some(("ps", sub)) => {
            let filter = task_filter(sub);
            if !filter.is_empty() {
                debug!("task filters are not applied yet: {:?}", filter);
            }

            let reporter = SnapshotReporter::new(&mut session, limit)?;
            let rows = reporter.collect(&mut session)?;
            write_snapshot(&mut out, &rows)?;
        }
        Some(("mutex", sub)) => {
            let name = sub
                .get_one::<String>("name")
                .map(String::as_str)
                .unwrap_or(DEFAULT_MUTEX);

            let walker = LockWaiterWalker::new(&session, limit)?;
            let report = walker.inspect_global(&mut session, name)?;
            write_lock_report(&mut out, &report)?;
        }
        _ => unreachable!("subcommand is required"),
    }

    out.flush()?;
    session.close();
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    if let Err(err) = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ) {
        eprintln!("kstate: logging disabled: {}", err);
    }

    if let Err(err) = run(&matches) {
        error!("{}", err);
        std::process::exit(1);
    }
}
