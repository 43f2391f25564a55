//! 8237 DMA controller (§4.5.3): four channels with page/address/count
//! registers, a mask register, and the address/count flip-flop shared
//! across all channels' 16-bit port writes.
//!
//! Only register state is modeled; no channel here actually steals bus
//! cycles; a floppy or sound device reading through DMA would need a
//! transfer loop this struct doesn't drive.

#[derive(Default, Clone, Copy)]
pub struct Channel {
    pub base_address: u16,
    pub base_count: u16,
    pub current_address: u16,
    pub current_count: u16,
    pub page: u8,
    pub masked: bool,
    pub auto_init: bool,
    pub decrement: bool,
    pub write_transfer: bool,
}

pub struct Dma {
    channels: [Channel; 4],
    flip_flop: bool,
}

impl Dma {
    pub fn new() -> Dma {
        Dma {
            channels: [Channel::default(); 4],
            flip_flop: false,
        }
    }

    pub fn channel(&self, idx: usize) -> &Channel {
        &self.channels[idx]
    }

    /// Ports 0x00-0x07: per-channel address/count registers, two bytes
    /// each, toggled by the shared flip-flop.
    pub fn port_write(&mut self, port: u16, value: u8) {
        if port <= 0x07 {
            let idx = (port / 2) as usize;
            let is_count = port % 2 == 1;
            let ch = &mut self.channels[idx];
            let target = if is_count {
                &mut ch.base_count
            } else {
                &mut ch.base_address
            };
            if !self.flip_flop {
                *target = (*target & 0xFF00) | u16::from(value);
            } else {
                *target = (*target & 0x00FF) | (u16::from(value) << 8);
            }
            if !is_count {
                ch.current_address = ch.base_address;
            } else {
                ch.current_count = ch.base_count;
            }
            self.flip_flop = !self.flip_flop;
            return;
        }
        match port {
            0x08 => {} // command register, single-controller config not modeled
            0x0A => {
                let idx = (value & 0x3) as usize;
                self.channels[idx].masked = value & 0x04 != 0;
            }
            0x0B => {
                let idx = (value & 0x3) as usize;
                let ch = &mut self.channels[idx];
                ch.write_transfer = (value >> 2) & 0x3 == 0x01;
                ch.auto_init = value & 0x10 != 0;
                ch.decrement = value & 0x20 != 0;
            }
            0x0C => self.flip_flop = false, // clear byte pointer flip-flop
            0x0F => {
                for ch in &mut self.channels {
                    ch.masked = value & 0x0F != 0;
                }
            }
            _ => {}
        }
    }

    pub fn port_read(&mut self, port: u16) -> u8 {
        if port <= 0x07 {
            let idx = (port / 2) as usize;
            let is_count = port % 2 == 1;
            let ch = &self.channels[idx];
            let source = if is_count {
                ch.current_count
            } else {
                ch.current_address
            };
            let byte = if !self.flip_flop {
                source as u8
            } else {
                (source >> 8) as u8
            };
            self.flip_flop = !self.flip_flop;
            byte
        } else {
            0xFF
        }
    }

    /// Page registers (0x81/0x82/0x83/0x87 on the PC/XT, channels 2/3/1/0).
    pub fn page_write(&mut self, port: u16, value: u8) {
        let idx = match port {
            0x87 => 0,
            0x83 => 1,
            0x81 => 2,
            0x82 => 3,
            _ => return,
        };
        self.channels[idx].page = value;
    }

    pub fn page_read(&mut self, port: u16) -> u8 {
        let idx = match port {
            0x87 => 0,
            0x83 => 1,
            0x81 => 2,
            0x82 => 3,
            _ => return 0xFF,
        };
        self.channels[idx].page
    }
}

impl Default for Dma {
    fn default() -> Dma {
        Dma::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_write_toggles_flip_flop() {
        let mut dma = Dma::new();
        dma.port_write(0x00, 0x34);
        dma.port_write(0x00, 0x12);
        assert_eq!(dma.channel(0).base_address, 0x1234);
    }

    #[test]
    fn page_registers_are_independent_of_flip_flop() {
        let mut dma = Dma::new();
        dma.page_write(0x87, 0x0A);
        assert_eq!(dma.page_read(0x87), 0x0A);
    }

    #[test]
    fn mask_bit_set_by_single_channel_mask_register() {
        let mut dma = Dma::new();
        dma.port_write(0x0A, 0x02 | 0x04); // mask channel 2
        assert!(dma.channel(2).masked);
        assert!(!dma.channel(0).masked);
    }
}
