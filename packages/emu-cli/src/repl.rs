//! The debugger command grammar (§6), shared between the interactive
//! loop and the `-c` script runner- both just feed lines into
//! [`dispatch`].

use std::io::{self, BufRead, Write};

use emu_core::machine::Machine;

/// Parse and run one command line. Unrecognized or empty lines are
/// silently ignored, matching a script runner that tolerates blank
/// entries between semicolons.
pub fn dispatch(mb: &mut Machine, line: &str) {
    let mut parts = line.split_whitespace();
    let cmd = match parts.next() {
        Some(c) => c,
        None => return,
    };
    let arg = parts.next();

    match cmd {
        "run" | "r" => {
            let max = arg.and_then(|a| a.parse::<u64>().ok()).unwrap_or(u64::MAX);
            let retired = mb.run(max);
            println!("ran {} instructions", retired);
        }
        "step" | "s" => {
            mb.step();
            println!("{:04X}:{:04X}", mb.cpu_state().cs, mb.cpu_state().ip);
        }
        "bkpt" | "b" => {
            if let Some(addr) = arg {
                match parse_addr(addr) {
                    Some((seg, off)) => mb.breakpoint = Some((seg, off)),
                    None => println!("bad address {:?}", addr),
                }
            }
        }
        "trace" | "t" => {
            mb.trace = !mb.trace;
            println!("trace: {}", mb.trace);
        }
        other => println!("unknown command: {}", other),
    }
}

/// `<seg:off>` or a bare hex offset (segment defaults to CS at the time
/// the breakpoint is armed is out of scope here- callers pass a full
/// seg:off).
fn parse_addr(s: &str) -> Option<(u16, u16)> {
    let (seg, off) = s.split_once(':')?;
    let seg = u16::from_str_radix(seg, 16).ok()?;
    let off = u16::from_str_radix(off, 16).ok()?;
    Some((seg, off))
}

pub fn interactive(mb: &mut Machine) {
    let stdin = io::stdin();
    loop {
        print!("(emu) ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line == "quit" || line == "q" {
            break;
        }
        dispatch(mb, line);
    }
}
