use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::ArgEnum;
use env_logger;
use log;

use twikwak::config::DEFAULT_CONFIG_LOCATION;
use twikwak::lines;
use twikwak::phases::PLAN;
use twikwak::sort::{PartitionFormat, SorterKind};
use twikwak::{Config, ConfigError, PhaseId, Pipeline, PipelineError, SessionState};

fn main() {
    let arg_parser = build_arg_parser();

    let (command, args) = match arg_parser.subcommand() {
        Some((command, args)) => (command, args),
        None => {
            eprintln!("no command given, see --help");
            process::exit(1);
        }
    };

    let log_level: LogLevel = args.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let result = match command {
        "sample" => sample(args),
        "phases" => run(args, &args.values_of_t_or_exit::<PhaseId>("phases")),
        _ => run(args, &PLAN),
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn config_path(args: &clap::ArgMatches) -> PathBuf {
    args.value_of("config")
        .map(PathBuf::from)
        .or_else(Config::default_path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_LOCATION))
}

fn run(args: &clap::ArgMatches, selection: &[PhaseId]) -> Result<(), PipelineError> {
    let config_path = config_path(args);

    let quiet = if args.is_present("quiet") {
        Some(true)
    } else if args.is_present("verbose") {
        Some(false)
    } else {
        None
    };

    let overrides = Config {
        twitter7_dpath: args.value_of("tpath").map(PathBuf::from),
        kwak10_dpath: args.value_of("kpath").map(PathBuf::from),
        output_dpath: args.value_of("output").map(PathBuf::from),
        quiet,
        min_available_memory: args.value_of("min_memory").map(str::to_string),
        spill_record_limit: args
            .is_present("spill_limit")
            .then(|| args.value_of_t_or_exit("spill_limit")),
        sorter: args.is_present("sorter").then(|| args.value_of_t_or_exit::<SorterKind>("sorter")),
        threads: args.is_present("threads").then(|| args.value_of_t_or_exit("threads")),
        classifier_command: args.value_of("classifier").map(str::to_string),
        partition_format: args
            .is_present("partition_format")
            .then(|| args.value_of_t_or_exit::<PartitionFormat>("partition_format")),
        tmp_dpath: args.value_of("tmp_dir").map(PathBuf::from),
        ..Config::default()
    };
    let settings = Config::load(&config_path)?
        .with_overrides(overrides)
        .resolve(&config_path)?;

    let mut pipeline = match args.value_of("resume") {
        Some(session_path) => {
            let session_path = PathBuf::from(session_path);
            let session = SessionState::load(&session_path)?;
            log::info!(
                "resuming session started at {} with arguments {:?}",
                session.start_time,
                session.original_arguments
            );
            Pipeline::with_session_path(settings, session, session_path)?
        }
        None => Pipeline::new(settings, SessionState::new(std::env::args().collect()))?,
    };
    log::info!("session file: {}", pipeline.session_path().display());

    let executed: Vec<String> = pipeline.run(selection)?.iter().map(PhaseId::to_string).collect();
    log::info!("executed units: [{}]", executed.join(", "));

    return Ok(());
}

fn sample(args: &clap::ArgMatches) -> Result<(), PipelineError> {
    let size: u64 = args.value_of_t_or_exit("size");

    if let Some(fpath) = args.value_of("fpath") {
        let source = PathBuf::from(fpath);
        let target = match args.value_of("output") {
            Some(output) => PathBuf::from(output),
            None => {
                let dir = lines::default_sample_dir(source.parent().unwrap_or_else(|| Path::new(".")), size);
                fs::create_dir_all(&dir)?;
                dir.join(source.file_name().unwrap_or_default())
            }
        };
        log::info!("sampling {} tweets from {} into {}", size, source.display(), target.display());
        let stats = lines::sample_archive_file(&source, &target, size)?;
        log::info!("{} tweets written ({} lines read)", stats.tweets, stats.lines_read);
        return Ok(());
    }

    let source = match args.value_of("tpath") {
        Some(tpath) => PathBuf::from(tpath),
        None => {
            let config_path = config_path(args);
            match Config::load(&config_path)?.twitter7_dpath {
                Some(dir) => dir,
                None => {
                    return Err(PipelineError::Config(ConfigError::Missing {
                        key: "twitter7_dpath",
                        config_path,
                    }))
                }
            }
        }
    };
    let target = args
        .value_of("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| lines::default_sample_dir(&source, size));

    log::info!("sampling {} tweets per archive file from {} into {}", size, source.display(), target.display());
    let sampled = lines::sample_archive_dir(&source, &target, size)?;
    let tweets: u64 = sampled.iter().map(|(_, stats)| stats.tweets).sum();
    log::info!("{} tweets written to {} files", tweets, sampled.len());

    return Ok(());
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn common_args() -> Vec<clap::Arg<'static>> {
    vec![
        clap::Arg::new("tpath")
            .short('t')
            .long("tpath")
            .help("path to the twitter7 dataset directory")
            .takes_value(true),
        clap::Arg::new("kpath")
            .short('k')
            .long("kpath")
            .help("path to the kwak10 dataset directory")
            .takes_value(true),
        clap::Arg::new("output")
            .short('o')
            .long("output")
            .help("output directory")
            .takes_value(true),
        clap::Arg::new("quiet")
            .short('q')
            .long("quiet")
            .help("do not log progress messages (reports are still written)")
            .conflicts_with("verbose"),
        clap::Arg::new("verbose")
            .long("verbose")
            .help("log progress messages"),
        clap::Arg::new("config")
            .short('c')
            .long("config")
            .help("configuration file (default: $HOME/.config/twikwak17/cfg.json)")
            .takes_value(true),
        clap::Arg::new("resume")
            .long("resume")
            .help("session file of an interrupted run to resume")
            .takes_value(true),
        clap::Arg::new("sorter")
            .long("sorter")
            .help("backend used for whole-file sorts")
            .takes_value(true)
            .possible_values(["native", "external"]),
        clap::Arg::new("partition_format")
            .long("partition-format")
            .help("encoding of spilled partitions")
            .takes_value(true)
            .possible_values(["text", "msgpack"]),
        clap::Arg::new("min_memory")
            .short('m')
            .long("min-memory")
            .help("spill once available memory drops below this size")
            .takes_value(true)
            .validator(|v| match v.parse::<bytesize::ByteSize>() {
                Ok(_) => Ok(()),
                Err(err) => Err(format!("Memory size format incorrect: {}", err)),
            }),
        clap::Arg::new("spill_limit")
            .long("spill-limit")
            .help("spill once an accumulator holds more distinct keys than this")
            .takes_value(true),
        clap::Arg::new("threads")
            .long("threads")
            .help("number of threads to use for parallel accumulation and sorting")
            .takes_value(true),
        clap::Arg::new("tmp_dir")
            .short('d')
            .long("tmp-dir")
            .help("directory to be used to store temporary data")
            .takes_value(true),
        clap::Arg::new("classifier")
            .long("classifier")
            .help("gender classifier command (reads one text per line, answers one label per line)")
            .takes_value(true),
        log_level_arg(),
    ]
}

fn log_level_arg() -> clap::Arg<'static> {
    clap::Arg::new("log_level")
        .short('l')
        .long("loglevel")
        .help("logging level")
        .takes_value(true)
        .default_value("info")
        .possible_values(LogLevel::possible_values())
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("twikwak")
        .about("links the twitter7 and kwak10 datasets into a gender-annotated social graph")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            clap::App::new("run")
                .about("run the full pipeline")
                .args(common_args()),
        )
        .subcommand(
            clap::App::new("phases")
                .about("run the given phases or subphases, e.g. `1.2 3`")
                .arg(
                    clap::Arg::new("phases")
                        .help("phase or subphase identifiers")
                        .required(true)
                        .takes_value(true)
                        .multiple_values(true)
                        .validator(|v| v.parse::<PhaseId>().map(|_| ())),
                )
                .args(common_args()),
        )
        .subcommand(
            clap::App::new("sample")
                .about("write the first tweets of a twitter7 archive file, or of every archive file of a directory")
                .arg(
                    clap::Arg::new("size")
                        .help("number of tweets to keep per file")
                        .required(true)
                        .takes_value(true)
                        .validator(|v| v.parse::<u64>().map(|_| ())),
                )
                .arg(
                    clap::Arg::new("fpath")
                        .short('f')
                        .long("fpath")
                        .help("twitter7 archive file to sample")
                        .takes_value(true)
                        .conflicts_with("tpath"),
                )
                .arg(
                    clap::Arg::new("tpath")
                        .short('t')
                        .long("tpath")
                        .help("twitter7 dataset directory to sample (default: twitter7_dpath of the configuration)")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("sample file or directory (default: a sample_<size> directory next to the input)")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("config")
                        .short('c')
                        .long("config")
                        .help("configuration file (default: $HOME/.config/twikwak17/cfg.json)")
                        .takes_value(true),
                )
                .arg(log_level_arg()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
