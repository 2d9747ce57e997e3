// Copyright 2025 ikvmd Authors
// SPDX-License-Identifier: Apache-2.0

//! ikvmd CLI entry point

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use ikvmd::manager::sanitize_frame_rate;
use ikvmd::{gadget, Config, Error, Manager, ScreenshotState};

const GADGET_NAME: &str = "obmc_hid";
const SYSFS_ROOT: &str = "/sys";

fn main() {
    let matches = Command::new("ikvmd")
        .version("0.1.0")
        .about("KVM-over-IP daemon: V4L2 capture over RFB with USB HID gadget input")
        // unknown flags are tolerated for wrappers written against the
        // original daemon's pass-through argument handling
        .ignore_errors(true)
        .arg(
            Arg::new("frameRate")
                .short('f')
                .long("frameRate")
                .value_name("FPS")
                .default_value("30")
                .help("Capture frame rate (1-60)"),
        )
        .arg(
            Arg::new("subsampling")
                .short('s')
                .long("subsampling")
                .value_name("0|1")
                .default_value("0")
                .help("JPEG chroma subsampling: 0 = 4:4:4, 1 = 4:2:0"),
        )
        .arg(
            Arg::new("pixelformat")
                .short('m')
                .long("pixelformat")
                .value_name("0|1")
                .default_value("0")
                .help("Capture format: 0 = driver default, 1 = hextile"),
        )
        .arg(
            Arg::new("keyboard")
                .short('k')
                .long("keyboard")
                .value_name("PATH")
                .default_value("/dev/hidg0")
                .help("HID keyboard gadget device"),
        )
        .arg(
            Arg::new("mouse")
                .short('p')
                .long("mouse")
                .value_name("PATH")
                .default_value("/dev/hidg1")
                .help("HID mouse gadget device"),
        )
        .arg(
            Arg::new("udcName")
                .short('u')
                .long("udcName")
                .value_name("NAME")
                .help("UDC that the HID gadget will connect to"),
        )
        .arg(
            Arg::new("videoDevice")
                .short('v')
                .long("videoDevice")
                .value_name("PATH")
                .default_value("/dev/video0")
                .help("V4L2 capture device"),
        )
        .arg(
            Arg::new("calcCRC")
                .short('c')
                .long("calcCRC")
                .action(ArgAction::SetTrue)
                .help("Checksum each frame to skip identical updates"),
        )
        .arg(
            Arg::new("port")
                .short('P')
                .long("port")
                .value_name("PORT")
                .default_value("5900")
                .help("RFB listen port"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .arg(
            Arg::new("passthrough")
                .num_args(0..)
                .allow_hyphen_values(true)
                .trailing_var_arg(true)
                .hide(true),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::new().with_level(log_level).init() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Some(ignored) = matches.get_many::<String>("passthrough") {
        let ignored: Vec<&String> = ignored.collect();
        if !ignored.is_empty() {
            warn!("ignoring unrecognized arguments: {ignored:?}");
        }
    }

    let config = Config {
        frame_rate: sanitize_frame_rate(parse_arg(&matches, "frameRate")),
        subsampling: clamp_binary(parse_arg(&matches, "subsampling")),
        pixel_format: clamp_binary(parse_arg(&matches, "pixelformat")),
        keyboard_path: PathBuf::from(matches.get_one::<String>("keyboard").unwrap()),
        pointer_path: PathBuf::from(matches.get_one::<String>("mouse").unwrap()),
        udc_name: matches.get_one::<String>("udcName").cloned(),
        video_path: PathBuf::from(matches.get_one::<String>("videoDevice").unwrap()),
        calc_frame_crc: matches.get_flag("calcCRC"),
        port: parse_arg(&matches, "port").clamp(0, u16::MAX as i64) as u16,
    };

    if let Err(e) = run(config) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(mut config: Config) -> ikvmd::Result<()> {
    let sysfs_root = Path::new(SYSFS_ROOT);
    let gadget_dir = sysfs_root.join(gadget::GADGET_BASE).join(GADGET_NAME);

    if !gadget_dir.exists() {
        gadget::create_hid(&gadget_dir)?;
        info!("created HID gadget {}", gadget_dir.display());
    }

    // resolve the controller up front when none was configured, so the
    // first bind does not depend on the virtual-hub fallback
    if config.udc_name.is_none() {
        config.udc_name = gadget::find_free_udc(sysfs_root);
        if let Some(udc) = &config.udc_name {
            info!("selected free UDC {udc}");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Config(format!("failed to install signal handler: {e}")))?;

    let screenshot = Arc::new(ScreenshotState::new());

    let result = Manager::new(&config, screenshot, running).map(|manager| {
        info!(
            "ikvmd running: {} at {} fps, RFB port {}",
            config.video_path.display(),
            config.frame_rate,
            config.port
        );
        manager.run();
    });

    if let Err(e) = gadget::destroy_hid(&gadget_dir) {
        warn!("gadget teardown incomplete: {e}");
    }

    result
}

fn parse_arg(matches: &clap::ArgMatches, name: &str) -> i64 {
    matches
        .get_one::<String>(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn clamp_binary(value: i64) -> u32 {
    if value == 1 {
        1
    } else {
        0
    }
}
