use clap::Parser;
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dispr::recording::{build_index_file, free_capture_path, CaptureFiles, StopReason};
use dispr::{Cli, Command, Config, Controller, VERSION};
use dispr_core::{SessionEvent, SessionState};

const PUMP_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    info!("dispr {} starting", VERSION);

    match &args.command {
        Command::Record {
            out,
            seconds,
            overwrite,
            ..
        } => record(&args.config().into_diagnostic()?, out, *seconds, *overwrite),
        Command::Play {
            file,
            reverse,
            fast,
            looping,
            count,
            start,
        } => {
            let config = args.config().into_diagnostic()?;
            let mut controller = Controller::from_config(&config).into_diagnostic()?;
            controller.load(file).into_diagnostic()?;
            controller.set_looping(*looping);
            controller.set_count(*count);
            play(&mut controller, *reverse, *fast, *start)
        }
        Command::Reindex { file, force } => reindex(file, *force),
        Command::List { file, json } => list(file, *json),
    }
}

fn record(config: &Config, out: &Path, seconds: Option<u64>, overwrite: bool) -> Result<()> {
    let mut controller = Controller::from_config(config).into_diagnostic()?;
    controller.add_received_listener(Arc::new(|_: &dispr::Capture, total: usize| {
        if total % 1000 == 0 {
            info!("{} PDUs captured", total);
        }
    }));

    controller.handle(SessionEvent::Record).into_diagnostic()?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));

    while controller.state() == SessionState::Recording {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            controller.handle(SessionEvent::RecordStop).into_diagnostic()?;
            break;
        }
        controller.pump_timeout(PUMP_INTERVAL).into_diagnostic()?;
    }

    let out = if out.exists() && !overwrite {
        let dir = out.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = out
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("capture")
            .to_string();
        let free = free_capture_path(&dir, &stem);
        warn!("{} exists, saving to {}", out.display(), free.display());
        free
    } else {
        out.to_path_buf()
    };

    let count = controller.capture().map_or(0, |c| c.len());
    let saved = controller.save(&out).into_diagnostic()?;
    println!("{} records saved to {}", count, saved.data.display());
    Ok(())
}

fn play(controller: &mut Controller, reverse: bool, fast: bool, start: Option<u64>) -> Result<()> {
    controller.add_stopped_listener(Arc::new(|reason: &StopReason| {
        info!("Replay stopped: {}", reason);
    }));

    if let Some(start) = start {
        controller.select(start);
    }

    let event = match (reverse, fast) {
        (false, false) => SessionEvent::Play,
        (false, true) => SessionEvent::FastForward,
        (true, false) => SessionEvent::ReversePlay,
        (true, true) => SessionEvent::FastReverse,
    };
    controller.handle(event).into_diagnostic()?;

    while controller.state().is_playing() {
        controller.pump_timeout(PUMP_INTERVAL).into_diagnostic()?;
    }
    Ok(())
}

fn reindex(file: &Path, force: bool) -> Result<()> {
    let files = CaptureFiles::for_data(file);
    if files.has_index() && !force {
        println!("{} already exists, use --force to rebuild", files.index.display());
        return Ok(());
    }
    let count = build_index_file(&files).into_diagnostic()?;
    println!("{} records written to {}", count, files.index.display());
    Ok(())
}

fn list(file: &Path, json: bool) -> Result<()> {
    let files = CaptureFiles::for_data(file);
    let records = files.read_records().into_diagnostic()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records).into_diagnostic()?);
        return Ok(());
    }

    println!("{:>8} {:>4} {:>12} {:>16} {:>6}", "record", "type", "offset", "time (ns)", "length");
    for (n, record) in records.iter().enumerate() {
        println!(
            "{:>8} {:>4} {:>12} {:>16} {:>6}",
            n,
            record.pdu_type(),
            record.offset,
            record.timestamp_ns,
            record.length
        );
    }
    Ok(())
}
