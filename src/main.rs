#![allow(dead_code)]

mod alfs;
mod device;
mod error;
mod f2fs;
mod geometry;

use anyhow::{bail, Context, Result};
use clap::{App, Arg, ArgMatches, SubCommand};
use log::LevelFilter;

use crate::device::Device;
use crate::f2fs::{check, format_device, FormatParams, F2FS_FEATURE_ENCRYPT, F2FS_FEATURE_HMSMR};

fn main() {
    let matches = App::new("alfs-tools")
        .version("0.1.0")
        .about("Format and check a meta-logging flash filesystem")
        .subcommand(
            SubCommand::with_name("format")
                .about("Lay out the filesystem with an append-only meta-log")
                .arg(Arg::with_name("heap").short("a").takes_value(true).help("heap-based allocation [default:1]"))
                .arg(Arg::with_name("debug").short("d").takes_value(true).help("debug level [default:0]"))
                .arg(Arg::with_name("extlist").short("e").takes_value(true).help("extension list e.g. \"mp3,gif,mov\""))
                .arg(Arg::with_name("label").short("l").takes_value(true).help("volume label"))
                .arg(Arg::with_name("overprov").short("o").takes_value(true).help("overprovision ratio [default:5]"))
                .arg(Arg::with_name("feature").short("O").takes_value(true).help("set feature"))
                .arg(Arg::with_name("quiet").short("q").help("quiet mode"))
                .arg(Arg::with_name("segs_per_sec").short("s").takes_value(true).help("# of segments per section [default:1]"))
                .arg(Arg::with_name("secs_per_zone").short("z").takes_value(true).help("# of sections per zone [default:1]"))
                .arg(Arg::with_name("trim").short("t").takes_value(true).help("0: nodiscard, 1: discard [default:1]"))
                .arg(Arg::with_name("smr").short("m").help("support SMR device"))
                .arg(Arg::with_name("device").required(true))
                .arg(Arg::with_name("sectors").help("number of sectors [default: determined by device size]")),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("Rebuild and verify the meta-log mapping of a formatted device")
                .arg(Arg::with_name("debug").short("d").takes_value(true).help("debug level [default:0]"))
                .arg(Arg::with_name("quiet").short("q").help("quiet mode"))
                .arg(Arg::with_name("device").required(true)),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("format", Some(sub)) => run_format(sub),
        ("check", Some(sub)) => run_check(sub),
        _ => {
            eprintln!("{}", matches.usage());
            std::process::exit(1);
        }
    };

    if let Err(reason) = result {
        eprintln!("Error: {:#}", reason);
        std::process::exit(1);
    }
}

fn init_logging(matches: &ArgMatches) -> Result<()> {
    let level = if matches.is_present("quiet") {
        LevelFilter::Error
    } else {
        match matches.value_of("debug").unwrap_or("0").parse::<u8>().context("invalid debug level")? {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env().filter_level(level).init();
    Ok(())
}

fn run_format(matches: &ArgMatches) -> Result<()> {
    init_logging(matches)?;

    let mut params = FormatParams::default();
    if let Some(heap) = matches.value_of("heap") {
        params.heap = heap.parse::<u8>().context("invalid heap flag")? != 0;
    }
    if let Some(label) = matches.value_of("label") {
        params.label = label.to_string();
    }
    if let Some(extlist) = matches.value_of("extlist") {
        params.extensions = extlist.split(',').map(str::to_string).collect();
    }
    if let Some(overprov) = matches.value_of("overprov") {
        params.overprovision = overprov.parse().context("invalid overprovision ratio")?;
    }
    if let Some(feature) = matches.value_of("feature") {
        params.features |= parse_feature(feature)?;
    }
    if let Some(segs) = matches.value_of("segs_per_sec") {
        params.segs_per_sec = segs.parse().context("invalid segments per section")?;
    }
    if let Some(secs) = matches.value_of("secs_per_zone") {
        params.secs_per_zone = secs.parse().context("invalid sections per zone")?;
    }
    if let Some(trim) = matches.value_of("trim") {
        params.trim = trim.parse::<u8>().context("invalid trim flag")? != 0;
    }
    if matches.is_present("smr") {
        params.features |= F2FS_FEATURE_HMSMR;
    }
    if let Some(sectors) = matches.value_of("sectors") {
        params.total_sectors = Some(sectors.parse().context("invalid sector count")?);
    }

    let mut dev = Device::open(matches.value_of("device").unwrap())?;
    format_device(&mut dev, &params)
}

fn run_check(matches: &ArgMatches) -> Result<()> {
    init_logging(matches)?;
    let dev = Device::open(matches.value_of("device").unwrap())?;
    check::check_device(&dev)
}

fn parse_feature(feature: &str) -> Result<u32> {
    match feature {
        "encrypt" => Ok(F2FS_FEATURE_ENCRYPT),
        _ => bail!("unknown feature {:?}", feature),
    }
}
