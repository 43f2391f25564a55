//! Command-line front end: loads a program image into a `Machine` and
//! either runs a command script, drops into the debugger REPL, or
//! free-runs to halt/exit-port.

mod renderer;
mod repl;

use std::fs;

use anyhow::{Context, Result};
use argh::FromArgs;
use emu_core::machine::Machine;

/// An 8086/IBM-PC-class machine emulator.
#[derive(FromArgs)]
struct Args {
    /// start the debugger REPL after any -c script runs
    #[argh(switch, short = 'd')]
    debug: bool,

    /// enable instruction trace logging
    #[argh(switch, short = 't')]
    trace: bool,

    /// semicolon-separated debugger command script to run before exiting
    #[argh(option, short = 'c')]
    cmds: Option<String>,

    /// path to the raw program image
    #[argh(positional)]
    bin: String,

    /// load target as <seg:off> in hex, e.g. 0000:7C00
    #[argh(positional)]
    seg_off: String,
}

fn parse_seg_off(s: &str) -> Result<(u16, u16)> {
    let (seg, off) = s
        .split_once(':')
        .with_context(|| format!("expected <seg:off>, got {:?}", s))?;
    let seg = u16::from_str_radix(seg, 16).with_context(|| format!("bad segment {:?}", seg))?;
    let off = u16::from_str_radix(off, 16).with_context(|| format!("bad offset {:?}", off))?;
    Ok((seg, off))
}

fn main() -> Result<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let (seg, off) = parse_seg_off(&args.seg_off)?;
    let image = fs::read(&args.bin).with_context(|| format!("reading {:?}", args.bin))?;

    let mut mb = Machine::new();
    mb.load_program(seg, off, &image);
    mb.trace = args.trace;

    let _renderer = renderer::Renderer::start(mb.cga_mode_handle(), mb.framebuffer_handle());

    if let Some(script) = &args.cmds {
        for cmd in script.split(';') {
            repl::dispatch(&mut mb, cmd.trim());
        }
    }

    if args.debug {
        repl::interactive(&mut mb);
    } else if args.cmds.is_none() {
        mb.run(u64::MAX);
    }

    log::info!(
        "halted at {:04X}:{:04X} after {} instructions",
        mb.cpu_state().cs,
        mb.cpu_state().ip,
        mb.cpu_state().tot_instructions
    );

    if let Some(code) = mb.exit_code() {
        std::process::exit(code.into());
    }

    Ok(())
}
