use anyhow::{Context, anyhow};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use capture_stats::{
    ArchiveConfig, BufferedDecoder, CaptureDecoder, StatsService, StreamingDecoder, to_pretty_json,
};

fn load_config(matches: &ArgMatches) -> anyhow::Result<ArchiveConfig> {
    let mut config = match matches.value_of("CONFIG") {
        Some(path) => ArchiveConfig::load(Path::new(path))
            .with_context(|| format!("failed to load config from {path}"))?,
        None => ArchiveConfig::default(),
    };

    if let Some(dir) = matches.value_of("DATA_DIR") {
        config.data_dir = dir.into();
    }
    if let Some(fragments) = matches.values_of("EXCLUDE") {
        config.blacklist.extend(fragments.map(String::from));
    }
    if let Some(workers) = matches.value_of("WORKERS") {
        let workers = workers
            .parse::<usize>()
            .with_context(|| format!("invalid worker count {workers:?}"))?;
        config.workers = Some(workers);
    }

    Ok(config)
}

fn print_json<T: Serialize + ?Sized>(value: &T, compact: bool) -> anyhow::Result<()> {
    let rendered = if compact {
        serde_json::to_string(value)?
    } else {
        to_pretty_json(value)?
    };
    println!("{rendered}");
    Ok(())
}

fn not_found(what: &str) -> ! {
    eprintln!("{what} not found");
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("statshark")
        .about("Kill and death statistics from recorded mission captures")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("DATA_DIR")
                .help("Directory containing the .gz capture files")
                .short("d")
                .long("data")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("EXCLUDE")
                .help("Skip captures whose name contains this fragment (case-insensitive)")
                .short("x")
                .long("exclude")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .global(true),
        )
        .arg(
            Arg::with_name("WORKERS")
                .help("Number of captures decoded in parallel")
                .short("j")
                .long("workers")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("TOML config file; command line flags take precedence")
                .short("c")
                .long("config")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("TIMEOUT")
                .help("Give up on archive queries after this many seconds")
                .long("timeout")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("BUFFERED")
                .help("Parse each capture as a whole document instead of streaming it")
                .long("buffered")
                .global(true),
        )
        .arg(
            Arg::with_name("COMPACT")
                .help("Print single-line JSON")
                .long("compact")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("all").about("Merged statistics for every player in the archive"),
        )
        .subcommand(
            SubCommand::with_name("player")
                .about("Merged statistics for one player, matched by name")
                .arg(
                    Arg::with_name("NAME")
                        .help("Player name or a fragment of it")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("capture")
                .about("Per-player statistics for a single capture")
                .arg(
                    Arg::with_name("NAME")
                        .help("Capture file name without the .gz extension")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(SubCommand::with_name("config").about("Print a commented default config file"))
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (command, sub_matches) = matches.subcommand();
    let Some(sub_matches) = sub_matches else {
        return Err(anyhow!("no command given"));
    };

    if command == "config" {
        print!("{}", ArchiveConfig::generate_default_toml());
        return Ok(());
    }

    let config = load_config(sub_matches)?;
    let compact = sub_matches.is_present("COMPACT");
    let timeout = sub_matches
        .value_of("TIMEOUT")
        .map(|secs| {
            secs.parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(|| anyhow!("invalid timeout {secs:?}"))
        })
        .transpose()?;
    let decoder: Arc<dyn CaptureDecoder> = if sub_matches.is_present("BUFFERED") {
        Arc::new(BufferedDecoder)
    } else {
        Arc::new(StreamingDecoder)
    };

    debug!("using data directory {}", config.data_dir.display());
    let service = StatsService::with_decoder(config, decoder);

    match command {
        "all" => {
            let players = match timeout {
                Some(timeout) => service.get_all_stats_within(timeout)?,
                None => service.get_all_stats()?,
            };
            info!("{} players in archive", players.len());
            print_json(&players, compact)?;
        }
        "player" => {
            let name = sub_matches.value_of("NAME").unwrap_or_default();
            let player = match timeout {
                Some(timeout) => service.get_stats_by_name_within(name, timeout)?,
                None => service.get_stats_by_name(name)?,
            };
            match player {
                Some(player) => print_json(&player, compact)?,
                None => not_found(&format!("player {name:?}")),
            }
        }
        "capture" => {
            let name = sub_matches.value_of("NAME").unwrap_or_default();
            let players = service
                .get_stats_for_capture(name)
                .with_context(|| format!("failed to process capture {name}"))?;
            match players {
                Some(players) => print_json(&players, compact)?,
                None => not_found(&format!("capture {name:?}")),
            }
        }
        other => return Err(anyhow!("unknown command {other}")),
    }

    Ok(())
}
