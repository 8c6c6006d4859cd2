//! Interactive serial console for the mount.
//!
//! Single-letter commands drive the firmware directly; the alignment
//! commands build up points, solve, and start celestial tracking. Targets
//! can be given as `RA_hours Dec_degrees` or as one of the named bright
//! stars in [`STAR_TABLE`].

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use align::{AlignmentPoint, AlignmentStore, Observer, Tracker};
use mount::{LinkArgs, MountClient, MountEvent};
use wire::messages::{Axis, PositionReport};

/// A few bright alignment stars (J2000). Purely a console convenience; the
/// control core takes arbitrary coordinates.
const STAR_TABLE: [(&str, f64, f64); 10] = [
    ("sirius", 6.7525, -16.716),
    ("canopus", 6.3992, -52.696),
    ("arcturus", 14.2610, 19.182),
    ("vega", 18.6156, 38.784),
    ("capella", 5.2782, 45.998),
    ("rigel", 5.2423, -8.202),
    ("procyon", 7.6550, 5.225),
    ("altair", 19.8464, 8.868),
    ("aldebaran", 4.5987, 16.509),
    ("polaris", 2.5303, 89.264),
];

/// How long to wait for the position reply when capturing an alignment point.
const POSITION_WAIT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "mount_console")]
#[command(about = "Interactive console for the telescope mount controller")]
struct Args {
    #[command(flatten)]
    link: LinkArgs,

    /// Observer latitude in degrees, north positive.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
    latitude: f64,

    /// Observer longitude in degrees, east positive.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
    longitude: f64,
}

fn print_help() {
    println!("Commands:");
    println!("  1            ping the firmware");
    println!("  2 / 3        pause / resume motors");
    println!("  5            stop all movement");
    println!("  p            request current positions");
    println!("  x|y|z <as>   move axis to absolute arcseconds");
    println!("  r <axis> <as> move axis by relative arcseconds");
    println!("  l <x> <y> <z> linear rates in arcsec/s");
    println!("  a <target>   capture an alignment point on the target");
    println!("  s            solve the alignment and report quality");
    println!("  g <target>   approximate goto");
    println!("  c <target>   start celestial tracking");
    println!("  clear        drop all alignment points");
    println!("  h            this help");
    println!("  q            quit");
    println!("Targets: `<ra_hours> <dec_degrees>` or a star name (e.g. vega).");
}

/// Resolve `words` as either explicit coordinates or a named star.
fn parse_target(words: &[&str]) -> Result<(f64, f64)> {
    match words {
        [ra, dec] => Ok((
            ra.parse().context("bad RA (hours)")?,
            dec.parse().context("bad Dec (degrees)")?,
        )),
        [name] => {
            let lower = name.to_lowercase();
            STAR_TABLE
                .iter()
                .find(|entry| entry.0 == lower)
                .map(|&(_, ra, dec)| (ra, dec))
                .with_context(|| format!("unknown star '{name}'"))
        }
        _ => bail!("expected `<ra_hours> <dec_degrees>` or a star name"),
    }
}

fn report_result(what: &str, ok: bool) {
    if ok {
        println!("{what}: ok");
    } else {
        println!("{what}: FAILED (no ACK from firmware)");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let observer = Observer {
        latitude_deg: args.latitude,
        longitude_deg: args.longitude,
    };

    let client = Arc::new(MountClient::connect(&args.link).context("failed to connect")?);
    let tracker = Tracker::new(Arc::clone(&client), observer);
    let mut store = AlignmentStore::new();

    // Track the most recent position report for alignment captures.
    let last_position: Arc<Mutex<Option<PositionReport>>> = Arc::default();
    {
        let last_position = Arc::clone(&last_position);
        client.subscribe(move |event| match event {
            MountEvent::Position(report) => {
                println!(
                    "Positions: X={}, Y={}, Z={} arcseconds",
                    report.x, report.y, report.z
                );
                *last_position.lock().unwrap() = Some(*report);
            }
            MountEvent::Status(status) => {
                println!(
                    "Status: Temp={:.2}C, Positions: X={}, Y={}, Z={}, {}, {}, tracking={}, Fan={}%",
                    status.temp_c,
                    status.x,
                    status.y,
                    status.z,
                    if status.enabled { "ENABLED" } else { "DISABLED" },
                    if status.paused { "PAUSED" } else { "RUNNING" },
                    status.celestial_tracking,
                    status.fan_pct
                );
            }
            MountEvent::ReferenceLost => {
                warn!("Mount reference LOST - re-align before tracking");
            }
        });
    }

    print_help();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, rest)) = words.split_first() else {
            continue;
        };

        match command {
            "q" | "quit" => break,
            "h" | "help" => print_help(),
            "1" => report_result("ping", client.ping().is_ok()),
            "2" => report_result("pause", client.pause().is_ok()),
            "3" => report_result("resume", client.resume().is_ok()),
            "5" => report_result("stop", client.stop().is_ok()),
            "p" => report_result("get positions", client.get_positions().is_ok()),
            "x" | "y" | "z" => match rest {
                [value] => match value.parse::<i32>() {
                    Ok(arcsec) => {
                        let axis = match command {
                            "x" => Axis::X,
                            "y" => Axis::Y,
                            _ => Axis::Z,
                        };
                        println!("Moving {axis} to {arcsec} arcseconds...");
                        report_result("move", client.move_static(axis, arcsec).is_ok());
                    }
                    Err(_) => println!("Bad position; expected arcseconds"),
                },
                _ => println!("Usage: {command} <arcseconds>"),
            },
            "r" => match rest {
                [axis, value] => {
                    let axis = match *axis {
                        "x" => Some(Axis::X),
                        "y" => Some(Axis::Y),
                        "z" => Some(Axis::Z),
                        _ => None,
                    };
                    match (axis, value.parse::<i32>()) {
                        (Some(axis), Ok(delta)) => {
                            report_result("move", client.move_relative(axis, delta).is_ok())
                        }
                        _ => println!("Usage: r <x|y|z> <arcseconds>"),
                    }
                }
                _ => println!("Usage: r <x|y|z> <arcseconds>"),
            },
            "l" => {
                let rates: Vec<f32> = rest.iter().filter_map(|w| w.parse().ok()).collect();
                match rates[..] {
                    [x, y, z] => {
                        println!("Linear rates: X={x}, Y={y}, Z={z} arcsec/s");
                        report_result("move linear", client.move_linear(x, y, z).is_ok());
                    }
                    _ => println!("Usage: l <x_rate> <y_rate> <z_rate>"),
                }
            }
            "a" => match parse_target(rest) {
                Ok((ra_hours, dec_deg)) => {
                    // Ask for fresh encoder positions and give the reply a
                    // moment to arrive.
                    if client.get_positions().is_err() {
                        println!("Could not query positions");
                        continue;
                    }
                    thread::sleep(POSITION_WAIT);
                    match *last_position.lock().unwrap() {
                        Some(position) => {
                            store.add(AlignmentPoint {
                                ra_hours,
                                dec_deg,
                                mount_x: position.x,
                                mount_y: position.y,
                                mount_z: position.z,
                                captured_at: Utc::now(),
                            });
                            println!("Alignment point {} captured", store.len());
                        }
                        None => println!("No position report received; point not captured"),
                    }
                }
                Err(e) => println!("{e:#}"),
            },
            "s" => match align::solve(store.points(), Utc::now()) {
                Ok(alignment) => println!(
                    "Alignment: {:?} ({} of {} points, avg residual {:.3} deg, pair mismatch {:.3} deg)",
                    alignment.quality,
                    alignment.used.len(),
                    store.len(),
                    alignment.avg_residual_deg,
                    alignment.max_pair_sep_diff_deg
                ),
                Err(e) => println!("Solve failed: {e}"),
            },
            "g" => match parse_target(rest) {
                Ok((ra, dec)) => match tracker.goto_approximate(&store, ra, dec) {
                    Ok(()) => println!("Approximate goto issued"),
                    Err(e) => println!("Goto failed: {e}"),
                },
                Err(e) => println!("{e:#}"),
            },
            "c" => match parse_target(rest) {
                Ok((ra, dec)) => match tracker.start_tracking(&store, ra, dec) {
                    Ok(start) => println!(
                        "Tracking started ({:?} alignment, predicted altitude {:.1} deg)",
                        start.alignment.quality, start.predicted_alt_deg
                    ),
                    Err(e) => println!("Tracking refused: {e}"),
                },
                Err(e) => println!("{e:#}"),
            },
            "clear" => {
                store.clear();
                println!("Alignment points cleared");
            }
            other => println!("Unknown command '{other}'; type h for help"),
        }
    }

    client.shutdown();
    Ok(())
}
