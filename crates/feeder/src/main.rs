use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context as _};
use clap::Parser;
use futures::{
    future::{self, BoxFuture},
    stream::FuturesOrdered,
    FutureExt as _, StreamExt as _, TryFutureExt as _,
};
use indicatif::ProgressBar;
use plotter_control::{sim::Simulator, Driver, Plotter};
use plotter_geom::{Config, Point};
use reedline::{DefaultPrompt, Prompt, Reedline};

use crate::command::{Command, Op};

mod command;
mod illustrate;

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
struct Args {
    /// Commands to run, one per line. Without this, commands are read
    /// interactively.
    script: Option<PathBuf>,

    /// TOML file overriding the default machine constants.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write an SVG of everything the plotter drew.
    #[arg(long)]
    svg: Option<PathBuf>,

    /// How long the simulated device takes to acknowledge each call.
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
enum Outcome {
    Done,
    Position(Point),
    Analog(f64),
    Byte(u8),
    Speed(f64),
    Busy(bool),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => write!(f, "ok"),
            Outcome::Position(p) => write!(f, "at ({:.3}, {:.3})", p.x, p.y),
            Outcome::Analog(v) => write!(f, "{v:.4}"),
            Outcome::Byte(b) => write!(f, "{b:#04x}"),
            Outcome::Speed(v) => write!(f, "speed {v} mm/s"),
            Outcome::Busy(b) => write!(f, "{}", if *b { "busy" } else { "idle" }),
        }
    }
}

type Pending = BoxFuture<'static, plotter_control::Result<Outcome>>;

/// Hands an operation to the plotter. Queued operations are submitted before
/// this returns; the future only reports how they went.
fn submit<D: Driver>(plotter: &Plotter<D>, op: Op) -> Pending {
    let done = |()| Outcome::Done;
    let now = |outcome: Outcome| future::ok::<_, plotter_control::Error>(outcome).boxed();
    match op {
        Op::Enable => plotter.enable().map_ok(done).boxed(),
        Op::Disable => plotter.disable().map_ok(done).boxed(),
        Op::MoveTo(x, y) => plotter.move_to(Point::new(x, y)).map_ok(done).boxed(),
        Op::PenUp => plotter.pen_up().map_ok(done).boxed(),
        Op::PenDown => plotter.pen_down().map_ok(done).boxed(),
        Op::PenHeight(h) => plotter.set_pen_height(h).map_ok(done).boxed(),
        Op::Speed(v) => now(Outcome::Speed(plotter.set_speed(v))),
        Op::Position => plotter.current_position().map_ok(Outcome::Position).boxed(),
        Op::Sync => plotter.sync_position().map_ok(Outcome::Position).boxed(),
        Op::Stop => plotter.stop().map_ok(done).boxed(),
        Op::AnalogConfigure(ch, enabled) => plotter
            .analog_configure(ch, enabled)
            .map_ok(done)
            .boxed(),
        Op::AnalogRead(ch) => plotter.analog_read(ch).map_ok(Outcome::Analog).boxed(),
        Op::Peek(addr) => plotter.memory_read(addr).map_ok(Outcome::Byte).boxed(),
        Op::Busy => now(Outcome::Busy(plotter.is_busy())),
    }
}

fn report(what: &str, outcome: plotter_control::Result<Outcome>) {
    match outcome {
        Ok(outcome) => eprintln!("{what}: {outcome}"),
        Err(e) => eprintln!("{what}: error: {e}"),
    }
}

async fn connect<D: Driver>(plotter: &Plotter<D>) -> anyhow::Result<()> {
    let bar = ProgressBar::new_spinner().with_message("Connecting...");
    bar.enable_steady_tick(TICK);
    plotter.connect().await?;
    bar.finish_with_message("connected!");
    Ok(())
}

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    let s = reed.read_line(prompt)?;
    match s {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

async fn command_mode<D: Driver>(plotter: &Plotter<D>) -> Result<()> {
    let mut reed = Reedline::create();
    let prompt = DefaultPrompt::default();
    eprintln!("{}", command::HELP);
    loop {
        let s = read_cmd(&mut reed, &prompt)?;
        let s = s.trim();
        if s.is_empty() {
            continue;
        }

        let cmd = match s.parse::<Command>() {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("error: {e:#}");
                continue;
            }
        };

        match cmd {
            Command::Quit => break,
            Command::Connect => connect(plotter).await?,
            Command::Disconnect => plotter.disconnect().await?,
            Command::Wait => report(s, plotter.flush().await.map(|()| Outcome::Done)),
            Command::Op(op) => report(s, submit(plotter, op).await),
        }
    }

    Ok(())
}

type Labelled = BoxFuture<'static, (String, plotter_control::Result<Outcome>)>;

async fn drain(outstanding: &mut FuturesOrdered<Labelled>) {
    while let Some((what, outcome)) = outstanding.next().await {
        report(&what, outcome);
    }
}

// Everything in the script is submitted as soon as it's read, so the plotter
// queue sees the whole drawing at once. Results are reported in order.
async fn run_script<D: Driver>(plotter: &Plotter<D>, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut outstanding = FuturesOrdered::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let cmd: Command = line
            .parse()
            .with_context(|| format!("{}:{}", path.display(), idx + 1))?;

        match cmd {
            Command::Quit => break,
            Command::Wait => drain(&mut outstanding).await,
            Command::Connect => {
                drain(&mut outstanding).await;
                connect(plotter).await?;
            }
            Command::Disconnect => {
                drain(&mut outstanding).await;
                plotter.disconnect().await?;
            }
            Command::Op(op) => {
                let what = line.to_owned();
                outstanding.push_back(submit(plotter, op).map(move |res| (what, res)).boxed());
            }
        }
    }

    drain(&mut outstanding).await;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&text).with_context(|| format!("bad config {}", path.display()))?;
    if !(config.min_mm_per_sec > 0.0 && config.min_mm_per_sec <= config.max_mm_per_sec) {
        bail!(
            "bad config {}: speed limits must satisfy 0 < min <= max",
            path.display()
        );
    }
    match config.clamp_speed(config.default_mm_per_sec) {
        Some(speed) => {
            if speed != config.default_mm_per_sec {
                log::warn!(
                    "clamped default speed {} to {speed}",
                    config.default_mm_per_sec
                );
            }
            config.default_mm_per_sec = speed;
        }
        None => bail!("bad config {}: default_mm_per_sec is NaN", path.display()),
    }
    log::info!("loaded config from {}", path.display());
    Ok(config)
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    let sim = Simulator::new(config).with_latency(Duration::from_millis(args.latency_ms));
    let plotter = Plotter::new(sim, config);

    let res = match &args.script {
        Some(path) => run_script(&plotter, path).await.map_err(Error::Err),
        None => command_mode(&plotter).await,
    };
    if let Err(Error::Err(e)) = res {
        eprintln!("error: {e:#}");
    }

    // Don't leave the (simulated) pen hanging mid-drawing.
    if plotter.is_connected() {
        plotter.flush().await?;
        plotter.disconnect().await?;
    }

    if let Some(out) = &args.svg {
        let document = illustrate::illustrate(&plotter.driver().segments());
        svg::save(out, &document)
            .with_context(|| format!("failed to write {}", out.display()))?;
        log::info!("wrote {}", out.display());
    }

    eprintln!("exiting...");
    Ok(())
}
