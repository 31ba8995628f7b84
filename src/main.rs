use clap::{arg, command, error::ErrorKind, value_parser, ArgAction, ArgMatches, Command};
use log::debug;
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tempfrag::{
    collaborators::{DirectoryStorage, MemoryKeyStore},
    errors::Result,
    models::placement::{Candidate, Tier},
    placement, Engine, EngineConfig, LocationId,
};

fn parse_location(raw: &str) -> std::result::Result<Candidate, String> {
    let (name, ms) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected NAME:MILLIS, got {:?}", raw))?;
    if name.is_empty() {
        return Err("location name is empty".to_string());
    }
    let ms: u64 = ms
        .parse()
        .map_err(|e| format!("bad latency in {:?}: {}", raw, e))?;
    Ok(Candidate::new(name, Duration::from_millis(ms)))
}

fn shape_args(cmd: Command) -> Command {
    cmd.arg(
        arg!(-n --fragments <COUNT>)
            .required(true)
            .value_parser(value_parser!(u8))
            .action(ArgAction::Set),
    )
    .arg(
        arg!(-k --threshold <COUNT>)
            .required(true)
            .value_parser(value_parser!(u8))
            .action(ArgAction::Set),
    )
    .arg(
        arg!(--"ttl-ms" <MILLIS>)
            .required(true)
            .value_parser(value_parser!(u64))
            .action(ArgAction::Set),
    )
    .arg(
        arg!(--location <SPEC> "storage location as NAME:LATENCY_MS")
            .required(true)
            .value_parser(parse_location)
            .action(ArgAction::Append),
    )
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut cmd = command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(shape_args(
            Command::new("roundtrip")
                .about("Fragment a file, optionally wait, then reconstruct it.")
                .arg(arg!(--infile <FILE>).required(true).action(ArgAction::Set))
                .arg(arg!(--outfile <FILE>).required(true).action(ArgAction::Set))
                .arg(arg!(--store <DIR>).required(true).action(ArgAction::Set))
                .arg(
                    arg!(--"hold-ms" <MILLIS>)
                        .value_parser(value_parser!(u64))
                        .default_value("0")
                        .action(ArgAction::Set),
                )
                .arg(
                    arg!(--"deadline-ms" <MILLIS>)
                        .value_parser(value_parser!(u64))
                        .default_value("1000")
                        .action(ArgAction::Set),
                )
                .arg(arg!(--"destroy-on-read").action(ArgAction::SetTrue)),
        ))
        .subcommand(shape_args(
            Command::new("plan").about("Show where fragments would be placed."),
        ));
    let matches = cmd.get_matches_mut();

    match matches.subcommand() {
        Some(("roundtrip", sub_matches)) => {
            let input_file = Path::new(sub_matches.get_one::<String>("infile").unwrap());
            let output_file = Path::new(sub_matches.get_one::<String>("outfile").unwrap());
            let store_dir = Path::new(sub_matches.get_one::<String>("store").unwrap());

            if !input_file.is_file() {
                cmd.error(ErrorKind::ValueValidation, "Input file does not exist.")
                    .exit();
            }
            if output_file.exists() && !output_file.is_file() {
                cmd.error(
                    ErrorKind::ValueValidation,
                    "Specified output exists but is not a file.",
                )
                .exit();
            }
            if store_dir.exists() && !store_dir.is_dir() {
                cmd.error(
                    ErrorKind::ValueValidation,
                    "Specified store exists but is not a directory.",
                )
                .exit();
            }

            match handle_roundtrip(sub_matches, input_file, output_file, store_dir).await {
                Ok(()) => println!("reconstruction successful"),
                Err(e) => {
                    eprintln!("roundtrip failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Some(("plan", sub_matches)) => {
            if let Err(e) = handle_plan(sub_matches) {
                eprintln!("planning failed: {}", e);
                std::process::exit(1);
            }
        }
        _ => unreachable!("invalid subcommand"),
    }
}

fn shape(sub_matches: &ArgMatches) -> (usize, usize, Duration, Vec<Candidate>) {
    let n: u8 = *sub_matches.get_one("fragments").unwrap();
    let k: u8 = *sub_matches.get_one("threshold").unwrap();
    let ttl: u64 = *sub_matches.get_one("ttl-ms").unwrap();
    let locations: Vec<Candidate> = sub_matches
        .get_many::<Candidate>("location")
        .map(|vals| vals.cloned().collect())
        .unwrap_or_default();
    (n as usize, k as usize, Duration::from_millis(ttl), locations)
}

fn handle_plan(sub_matches: &ArgMatches) -> Result<()> {
    let (n, k, ttl, candidates) = shape(sub_matches);
    let config = EngineConfig::default();
    let plan = placement::plan(n, k, ttl, &candidates, &config.placement_policy())?;

    println!(
        "{} fragments, threshold {}, latency bound {:?}",
        n, k, plan.latency_bound
    );
    for p in &plan.placements {
        let tier = match p.tier {
            Tier::Primary => "primary",
            Tier::Backup => "backup",
        };
        println!("fragment {:>3} -> {} ({:?}, {})", p.index, p.location, p.latency, tier);
    }
    Ok(())
}

async fn handle_roundtrip(
    sub_matches: &ArgMatches,
    input_path: &Path,
    output_path: &Path,
    store_path: &Path,
) -> Result<()> {
    let (n, k, ttl, candidates) = shape(sub_matches);
    let hold: u64 = *sub_matches.get_one("hold-ms").unwrap();
    let deadline: u64 = *sub_matches.get_one("deadline-ms").unwrap();

    fs::create_dir_all(store_path)?;
    let mut storage = DirectoryStorage::new(store_path);
    for c in &candidates {
        storage = storage.with_location(c.location.as_str(), c.latency);
    }

    let config = EngineConfig {
        destroy_on_read: sub_matches.get_flag("destroy-on-read"),
        locations: candidates
            .iter()
            .map(|c| c.location.clone())
            .collect::<Vec<LocationId>>(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, Arc::new(storage), Arc::new(MemoryKeyStore::new()))?;

    // grab the plaintext to be fragmented
    let mut input_file = File::open(input_path)?;
    let mut plaintext = Vec::new();
    input_file.read_to_end(&mut plaintext)?;

    let handle = engine.fragment(&plaintext, n, k, ttl).await?;
    println!("fragmented {} bytes as {}", plaintext.len(), handle);
    debug!("{:?}", engine.status(handle)?);

    if hold > 0 {
        tokio::time::sleep(Duration::from_millis(hold)).await;
    }

    let recovered = engine
        .reconstruct(handle, Duration::from_millis(deadline))
        .await?;

    let mut out_file = File::create(output_path)?;
    out_file.write_all(&recovered)?;

    let status = engine.status(handle)?;
    println!(
        "{}: {:?}, {} of {} fragments readable",
        handle, status.state, status.readable, status.total
    );
    Ok(())
}
