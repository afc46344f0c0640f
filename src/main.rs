//! Iris Codec Encoder - encode whole slide images into `.iris` files.
//!
//! This binary parses the CLI configuration, dispatches the encoder and
//! renders a progress bar until the run completes.

use std::io::Write;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iris_codec::{Encoder, EncoderCli, EncoderStatus};

fn main() -> ExitCode {
    let cli = EncoderCli::parse();

    init_logging(cli.verbose);

    if let Err(message) = cli.validate() {
        error!("Configuration error: {}", message);
        return ExitCode::FAILURE;
    }

    // Create the output directory up front so dispatch can land the file.
    if let Some(ref outdir) = cli.outdir {
        if !outdir.is_dir() {
            if let Err(e) = std::fs::create_dir_all(outdir) {
                error!("Failed to create output directory {}: {}", outdir.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    let encoder = match Encoder::new(cli.into_options()) {
        Ok(encoder) => encoder,
        Err(e) => {
            error!("Failed to create a slide encoder: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Dispatch returns immediately; encoding continues on worker threads.
    if let Err(e) = encoder.dispatch() {
        error!("Encoder failed to begin encoding: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Encoding slide file: {}", encoder.dst_path().display());
    let start = Instant::now();
    let mut best = 0.001f32;

    loop {
        let progress = encoder.progress();
        match progress.status {
            EncoderStatus::Active => {
                best = best.max(progress.progress);
                render_progress_bar(best, start);
                std::thread::sleep(Duration::from_secs(1));
            }
            EncoderStatus::Inactive => break,
            EncoderStatus::Error | EncoderStatus::Shutdown => {
                eprintln!();
                error!("Error during slide encoding: {}", progress.error_msg.trim());
                return ExitCode::FAILURE;
            }
        }
    }

    encoder.wait();
    let progress = encoder.progress();
    if progress.status == EncoderStatus::Error {
        error!("Error during slide encoding: {}", progress.error_msg.trim());
        return ExitCode::FAILURE;
    }

    eprintln!();
    info!(
        "Iris encoder completed {} in {:.1}s",
        progress.dst_path.display(),
        start.elapsed().as_secs_f32()
    );
    ExitCode::SUCCESS
}

/// Initialize tracing with an env-filter; `-v` raises the default to
/// debug level.
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "iris_codec=debug,iris_encode=debug"
    } else {
        "iris_codec=info,iris_encode=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Draw a single-line progress bar with an elapsed / remaining estimate.
fn render_progress_bar(fraction: f32, start: Instant) {
    const BAR_WIDTH: usize = 40;

    let filled = ((BAR_WIDTH as f32) * fraction) as usize;
    let elapsed = start.elapsed().as_secs();
    let remaining = if fraction > 0.0 {
        ((elapsed as f32 / fraction) as u64).saturating_sub(elapsed)
    } else {
        0
    };

    let mut line = String::with_capacity(BAR_WIDTH + 48);
    line.push('[');
    for index in 0..BAR_WIDTH {
        line.push(if index < filled { '#' } else { '.' });
    }
    line.push_str(&format!(
        "] {:5.1}%  {:02}:{:02} elapsed, {:02}:{:02} remaining",
        fraction * 100.0,
        elapsed / 60,
        elapsed % 60,
        remaining / 60,
        remaining % 60,
    ));

    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "\x1b[2K\r{line}");
    let _ = stderr.flush();
}
