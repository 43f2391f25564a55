//! 8253 Programmable Interval Timer (§4.5.2): three independent counters,
//! modes 0 (terminal count interrupt) and 3 (square wave), latch and byte
//! order toggling on the data ports.

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum AccessMode {
    LowByte,
    HighByte,
    LowThenHigh { low_sent: bool },
}

struct Counter {
    mode: u8,
    access: AccessMode,
    reload: u16,
    count: u16,
    latched: Option<u16>,
    out: bool,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            mode: 0,
            access: AccessMode::LowThenHigh { low_sent: false },
            reload: 0,
            count: 0,
            latched: None,
            out: false,
        }
    }

    fn set_control(&mut self, access: u8, mode: u8) {
        self.mode = mode;
        self.access = match access {
            0b01 => AccessMode::LowByte,
            0b10 => AccessMode::HighByte,
            _ => AccessMode::LowThenHigh { low_sent: false },
        };
        self.latched = None;
    }

    fn latch(&mut self) {
        self.latched = Some(self.count);
    }

    fn write_data(&mut self, byte: u8) {
        match &mut self.access {
            AccessMode::LowByte => self.reload = (self.reload & 0xFF00) | u16::from(byte),
            AccessMode::HighByte => {
                self.reload = (self.reload & 0x00FF) | (u16::from(byte) << 8)
            }
            AccessMode::LowThenHigh { low_sent } => {
                if *low_sent {
                    self.reload = (self.reload & 0x00FF) | (u16::from(byte) << 8);
                    *low_sent = false;
                } else {
                    self.reload = (self.reload & 0xFF00) | u16::from(byte);
                    *low_sent = true;
                }
            }
        }
        self.count = self.reload;
    }

    fn read_data(&mut self) -> u8 {
        let source = self.latched.unwrap_or(self.count);
        let byte = match &mut self.access {
            AccessMode::LowByte => source as u8,
            AccessMode::HighByte => (source >> 8) as u8,
            AccessMode::LowThenHigh { low_sent } => {
                if *low_sent {
                    *low_sent = false;
                    self.latched = None;
                    (source >> 8) as u8
                } else {
                    *low_sent = true;
                    source as u8
                }
            }
        };
        if matches!(self.access, AccessMode::LowByte | AccessMode::HighByte) {
            self.latched = None;
        }
        byte
    }

    /// Advance one clock, returning whether OUT rose on this tick (the
    /// event a caller wires to IRQ0 for counter 0).
    fn tick(&mut self) -> bool {
        if self.reload == 0 {
            return false;
        }
        let prev_out = self.out;
        self.count = self.count.wrapping_sub(1);
        match self.mode {
            0 => {
                if self.count == 0 {
                    self.out = true;
                }
            }
            3 => {
                // Square wave: decrementing below zero (wrapping to
                // u16::MAX) means the counter just hit terminal count,
                // so it reloads to `reload-1` rather than `reload`. OUT
                // is a level derived from the counter's current value
                // every tick, not a flip-flop latched only at zero.
                if self.count == u16::MAX {
                    self.count = self.reload.wrapping_sub(1);
                }
                self.out = self.count >= self.reload / 2;
            }
            _ => {
                if self.count == 0 {
                    self.count = self.reload;
                }
            }
        }
        self.out && !prev_out
    }
}

/// All three counters of one 8253. Counter 0 drives the system tick
/// (IRQ0); counter 2, gated by the PPI, drives the speaker- not modeled
/// beyond its count register here.
pub struct Pit {
    counters: [Counter; 3],
}

impl Pit {
    pub fn new() -> Pit {
        Pit {
            counters: [Counter::new(), Counter::new(), Counter::new()],
        }
    }

    pub fn port_write(&mut self, port: u16, value: u8) {
        match port {
            0x40 | 0x41 | 0x42 => {
                let idx = (port - 0x40) as usize;
                self.counters[idx].write_data(value);
            }
            0x43 => {
                let channel = (value >> 6) & 0x3;
                if channel == 3 {
                    return; // read-back command, not modeled
                }
                let access = (value >> 4) & 0x3;
                let mode = (value >> 1) & 0x7;
                if access == 0 {
                    self.counters[channel as usize].latch();
                } else {
                    self.counters[channel as usize].set_control(access, mode);
                }
            }
            _ => {}
        }
    }

    pub fn port_read(&mut self, port: u16) -> u8 {
        match port {
            0x40 | 0x41 | 0x42 => {
                let idx = (port - 0x40) as usize;
                self.counters[idx].read_data()
            }
            _ => 0xFF,
        }
    }

    /// Advance every counter by one clock. Returns whether counter 0's
    /// output rose, the system-tick IRQ0 condition.
    pub fn tick(&mut self) -> bool {
        let c1 = self.counters[1].tick();
        let c2 = self.counters[2].tick();
        let c0 = self.counters[0].tick();
        let _ = (c1, c2);
        c0
    }
}

impl Default for Pit {
    fn default() -> Pit {
        Pit::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode0_fires_once_at_terminal_count() {
        let mut pit = Pit::new();
        pit.port_write(0x43, 0b00_11_000_0); // counter 0, lo/hi, mode 0
        pit.port_write(0x40, 3);
        pit.port_write(0x40, 0);
        let fires: Vec<bool> = (0..4).map(|_| pit.tick()).collect();
        assert_eq!(fires, vec![false, false, true, false]);
    }

    #[test]
    fn mode3_square_wave_matches_counter_threshold() {
        let mut pit = Pit::new();
        pit.port_write(0x43, 0b00_11_011_0); // counter 0, lo/hi, mode 3
        pit.port_write(0x40, 2);
        pit.port_write(0x40, 0);
        let outs: Vec<bool> = (0..4).map(|_| pit.tick()).collect();
        assert_eq!(outs, vec![true, false, true, false]);
    }

    #[test]
    fn latch_freezes_value_across_reads() {
        let mut pit = Pit::new();
        pit.port_write(0x43, 0b00_11_000_0);
        pit.port_write(0x40, 10);
        pit.port_write(0x40, 0);
        pit.tick();
        pit.port_write(0x43, 0b00_00_000_0); // latch counter 0
        let before = pit.port_read(0x40);
        pit.tick();
        let latched_low = pit.port_read(0x40);
        assert_eq!(before, latched_low);
    }
}
