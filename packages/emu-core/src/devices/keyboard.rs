//! PC/XT keyboard interface (§4.5.4): an 8-entry scancode FIFO behind
//! the 8255 PPI's port A/B, with the PPI port-B bit 7 "clear keyboard"
//! pulse the BIOS uses to acknowledge each byte.

const FIFO_CAPACITY: usize = 8;

/// The keyboard reset pulse: port-B bit 6 gates the keyboard clock line,
/// and the BIOS resets the interface by pulsing it high then low. Two
/// bits of history are enough to detect the falling edge.
const KBD_CLOCK_ENABLE_BIT: u8 = 1 << 6;
const RESET_PULSE_PATTERN: u8 = 0b10;

pub struct Keyboard {
    fifo: std::collections::VecDeque<u8>,
    port_b: u8,
    latched_scancode: u8,
    reset_shift: u8,
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            fifo: std::collections::VecDeque::with_capacity(FIFO_CAPACITY),
            port_b: 0,
            latched_scancode: 0,
            reset_shift: 0,
        }
    }

    /// Enqueue a scancode from the host input layer. Drops the oldest
    /// byte if the FIFO is already full, matching the real 8042's
    /// overrun behavior rather than blocking the producer.
    pub fn enqueue(&mut self, scancode: u8) {
        if self.fifo.len() == FIFO_CAPACITY {
            self.fifo.pop_front();
        }
        self.fifo.push_back(scancode);
    }

    pub fn has_pending(&self) -> bool {
        !self.fifo.is_empty() && self.port_b & 0x80 == 0
    }

    /// Port 0x60: read the latched scancode. Latching (rather than
    /// popping on every read) lets the BIOS re-read port 0x60 before the
    /// clear pulse on port 0x61 without losing a byte.
    pub fn port_60_read(&mut self) -> u8 {
        if self.port_b & 0x80 == 0 {
            if let Some(code) = self.fifo.pop_front() {
                self.latched_scancode = code;
            }
        }
        self.latched_scancode
    }

    /// Port 0x61 (PPI port B): tracks the clock-enable bit's last two
    /// values and, on a high-then-low pulse, treats it as a keyboard
    /// reset- clearing pending scancodes and re-seeding with the 8042's
    /// self-test-passed code (0xAA).
    pub fn port_61_write(&mut self, value: u8) {
        self.port_b = value;
        let clock_enable = u8::from(value & KBD_CLOCK_ENABLE_BIT != 0);
        self.reset_shift = ((self.reset_shift << 1) | clock_enable) & 0b11;
        if self.reset_shift == RESET_PULSE_PATTERN {
            self.fifo.clear();
            self.enqueue(0xAA);
        }
    }

    pub fn port_61_read(&self) -> u8 {
        self.port_b
    }
}

impl Default for Keyboard {
    fn default() -> Keyboard {
        Keyboard::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_drops_oldest_on_overrun() {
        let mut kbd = Keyboard::new();
        for b in 0..10u8 {
            kbd.enqueue(b);
        }
        assert_eq!(kbd.port_60_read(), 2);
    }

    #[test]
    fn clock_pulse_resets_fifo_and_reseeds_self_test_code() {
        let mut kbd = Keyboard::new();
        kbd.enqueue(0x1E);
        kbd.port_61_write(0x40); // clock enable high
        kbd.port_61_write(0x00); // clock enable low: falling edge
        assert_eq!(kbd.port_60_read(), 0xAA);
    }

    #[test]
    fn clear_bit_suppresses_new_reads() {
        let mut kbd = Keyboard::new();
        kbd.enqueue(0x1E);
        assert_eq!(kbd.port_60_read(), 0x1E);
        kbd.port_61_write(0x80);
        kbd.enqueue(0x1F);
        assert_eq!(kbd.port_60_read(), 0x1E);
    }
}
