//! plcvm-upload: load a module onto the device and run it.
//!
//! ```text
//! plcvm-upload prog.plcm                   # upload, run 2s, stop
//! plcvm-upload prog.plcm --capture 1.5     # run with verbose trace capture
//! plcvm-upload prog.plcm --port /dev/ttyACM0
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use plcvm::config::Config;
use plcvm::module::Module;
use plcvm::transport::{last_sp, last_tos, DeviceLink, TraceEvent};

fn usage() -> ! {
    eprintln!("Usage: plcvm-upload <file.plcm> [--capture <secs>] [--wait <secs>] [--port <port>]");
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    let mut input: Option<PathBuf> = None;
    let mut port: Option<String> = None;
    let mut capture: Option<f64> = None;
    let mut wait: f64 = 2.0;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                if i >= args.len() {
                    usage();
                }
                port = Some(args[i].clone());
            }
            "--capture" => {
                i += 1;
                if i >= args.len() {
                    usage();
                }
                capture = Some(args[i].parse().unwrap_or_else(|_| usage()));
            }
            "--wait" => {
                i += 1;
                if i >= args.len() {
                    usage();
                }
                wait = args[i].parse().unwrap_or_else(|_| usage());
            }
            "-h" | "--help" => usage(),
            arg if arg.starts_with('-') => usage(),
            arg => {
                if input.is_some() {
                    usage();
                }
                input = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let Some(input) = input else { usage() };
    let data =
        std::fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;

    match Module::parse(&data) {
        Ok(module) => log::info!(
            "module v{}.{}, {} segment(s), entry 0x{:04X}",
            module.version.0,
            module.version.1,
            module.segments.len(),
            module.entry_point
        ),
        Err(e) => log::warn!("not a module container ({e}); uploading as-is"),
    }

    let mut config = Config::get().clone();
    if port.is_some() {
        config.port = port;
    }

    let mut link = DeviceLink::open(&config)?;
    link.reset()?;
    link.upload(&data)?;

    if let Some(secs) = capture {
        let events = link.start_and_capture(Duration::from_secs_f64(secs))?;
        link.stop()?;

        println!("Captured {} trace event(s)", events.len());
        for event in &events {
            if let TraceEvent::Error { code, msg, pc } = event {
                println!("  VM error {code} at 0x{pc:04X}: {msg}");
            }
        }
        if let Some(tos) = last_tos(&events) {
            println!("Last TOS: {tos}");
        }
        if let Some(sp) = last_sp(&events) {
            println!("Last SP: {sp}");
        }
    } else {
        link.start_and_wait(Duration::from_secs_f64(wait))?;
        println!("Ran for {wait}s and stopped");
    }

    link.close();
    Ok(())
}
