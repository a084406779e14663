//! Headless demo: run a Rhai script against a paced host for N frames and print
//! every drained instruction batch as a JSON line.
//!
//! Run with: cargo run --example headless -- --frames 30 --transport message-passing

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::Mutex;

use frameport::logging::{self, LogLevel};
use frameport::{
    BridgeConfig, DrawInstruction, Envelope, FrameChannel, FramePacer, HostCapabilities, HostFrameState,
    IsolatedContext, Key, RefreshDriver, RuntimeEvent, TransportMode, create_channel_pair, host_frame_callback,
    rhai_factory,
};

const DEFAULT_SCRIPT: &str = r#"
// Bouncing ball. Space held: red, otherwise white.
fn update(dt) {
    let t = elapsed();
    let x = 160.0 + 120.0 * (t * 2.0).sin();
    let y = 100.0 + 60.0 * (t * 3.0).cos();

    clear();
    if key_down(32) { set_color(255, 64, 64); } else { set_color(255, 255, 255); }
    fill_circle(x, y, 8);
    text(4, 12, "frame " + frame());
}
"#;

#[derive(Parser, Debug)]
#[command(name = "headless", about = "Drive a frameport script without a renderer")]
struct Args {
    /// Rhai script to run (defaults to a built-in demo)
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host frames to run
    #[arg(short, long, default_value_t = 60)]
    frames: u64,

    /// Transport: auto, shared-memory or message-passing
    #[arg(short, long)]
    transport: Option<TransportMode>,

    /// Hold the space key from this frame on
    #[arg(long)]
    press_space_at: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init_with_level(if args.verbose { LogLevel::Debug } else { LogLevel::Warn });

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => {
            let mut config = BridgeConfig::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(mode) = args.transport {
        config.channel.mode = mode;
    }
    let source = match &args.script {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_SCRIPT.to_string(),
    };

    // ===== Isolated side =====
    let pair = create_channel_pair(&config.channel, &HostCapabilities::native())?;
    eprintln!("transport: {}", pair.kind);
    let (host, resource) = pair.into_parts();
    let host = Arc::new(host);

    let context = IsolatedContext::spawn(rhai_factory(config.script.clone()))?;
    context.post(Envelope::initialize(source, resource))?;
    loop {
        match context.events().recv_timeout(Duration::from_secs(5))? {
            RuntimeEvent::Ready => break,
            RuntimeEvent::Error { message, trace } => {
                return Err(format!("script failed to load: {message} {}", trace.unwrap_or_default()).into());
            }
            RuntimeEvent::StateChanged { .. } => {}
        }
    }
    context.post(Envelope::start())?;

    // ===== Host side =====
    let state = Arc::new(Mutex::new(HostFrameState::new()));
    let sink = |frame: u64, batch: Vec<DrawInstruction>| {
        let line = serde_json::json!({ "frame": frame, "instructions": batch });
        println!("{line}");
    };
    let pacer = Arc::new(Mutex::new(FramePacer::new(
        config.pacer.clone(),
        host_frame_callback(host.clone(), state.clone(), sink),
    )));
    pacer.lock().start();
    let driver = RefreshDriver::spawn(pacer.clone())?;

    let started = Instant::now();
    'run: loop {
        let frames = state.lock().frames;
        if frames >= args.frames {
            break;
        }
        if args.press_space_at.is_some_and(|at| frames >= at) {
            state.lock().input.key_down(Key::SPACE);
        }
        while let Ok(event) = context.events().try_recv() {
            eprintln!("event: {}", serde_json::to_string(&event)?);
            if matches!(event, RuntimeEvent::Error { .. }) {
                break 'run;
            }
        }
        thread::sleep(Duration::from_millis(2));
    }

    pacer.lock().dispose();
    drop(driver);
    host.dispose();
    context.join();

    let state = state.lock();
    eprintln!(
        "{} frames, {} batches, {} instructions in {:.2?}",
        state.frames,
        state.batches_presented,
        state.instructions_presented,
        started.elapsed()
    );
    Ok(())
}
