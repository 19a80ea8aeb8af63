use std::str::FromStr;

use anyhow::{anyhow, bail, Context as _};

/// Something the user typed.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Connect,
    Disconnect,
    /// Wait for everything submitted so far to finish.
    Wait,
    Quit,
    Op(Op),
}

/// A command that goes straight to the plotter.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Enable,
    Disable,
    MoveTo(f64, f64),
    PenUp,
    PenDown,
    PenHeight(f64),
    Speed(f64),
    Position,
    Sync,
    Stop,
    AnalogConfigure(u8, bool),
    AnalogRead(u8),
    Peek(u16),
    Busy,
}

pub const HELP: &str = "\
commands:
  connect | disconnect | enable | disable
  move X Y        straight line to (X, Y) in mm
  up | down       lift or lower the pen
  height H        pen servo height, 0 (lowered) to 1 (raised)
  speed V         drawing speed in mm/s
  pos | sync      query the position (sync also adopts it)
  stop            emergency stop, discarding queued work
  analog-config CH on|off
  analog CH       read an analog channel
  peek ADDR       read a byte of device memory
  busy | wait | quit";

fn arg<T: FromStr>(args: &[&str], idx: usize, what: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s = args
        .get(idx)
        .ok_or_else(|| anyhow!("missing argument: {what}"))?;
    s.parse().with_context(|| format!("bad {what}: {s:?}"))
}

fn address(s: &str) -> anyhow::Result<u16> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("bad address: {s:?}"))
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Command> {
        let words: Vec<&str> = s.split_whitespace().collect();
        let Some((&name, args)) = words.split_first() else {
            bail!("empty command");
        };

        let op = match name {
            "connect" => return Ok(Command::Connect),
            "disconnect" => return Ok(Command::Disconnect),
            "wait" => return Ok(Command::Wait),
            "quit" | "exit" => return Ok(Command::Quit),
            "enable" => Op::Enable,
            "disable" => Op::Disable,
            "move" => Op::MoveTo(arg(args, 0, "x")?, arg(args, 1, "y")?),
            "up" => Op::PenUp,
            "down" => Op::PenDown,
            "height" => Op::PenHeight(arg(args, 0, "height")?),
            "speed" => Op::Speed(arg(args, 0, "speed")?),
            "pos" => Op::Position,
            "sync" => Op::Sync,
            "stop" => Op::Stop,
            "analog-config" => {
                let enabled = match args.get(1).copied() {
                    Some("on") => true,
                    Some("off") => false,
                    _ => bail!("expected on or off"),
                };
                Op::AnalogConfigure(arg(args, 0, "channel")?, enabled)
            }
            "analog" => Op::AnalogRead(arg(args, 0, "channel")?),
            "peek" => Op::Peek(address(
                args.first().ok_or_else(|| anyhow!("missing argument: address"))?,
            )?),
            "busy" => Op::Busy,
            _ => bail!("unknown command {name:?}"),
        };
        Ok(Command::Op(op))
    }
}
