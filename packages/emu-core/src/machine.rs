//! The top-level machine: CPU plus the peripheral set wired onto the
//! port bus, the tick driver (§4.7), and debugger hooks (§4.8).

use crate::bus::{Bus, PortWidth, WithCpu};
use crate::cpu::exec;
use crate::cpu::regs::CpuState;
use crate::devices::{cga::Cga, dma::Dma, keyboard::Keyboard, pic::Pic, pit::Pit};
use crate::io_bus::{self, Device};
use crate::memory::Memory;

/// How many instructions retire between peripheral ticks. The PIT and
/// keyboard don't need attention every instruction; advancing them on
/// alternating instructions is close enough for BIOS/DOS-era timing
/// code and keeps the debugger's single-step granularity at one
/// instruction per `step()`.
const TICK_EVERY_N_INSTRUCTIONS: u64 = 2;

pub struct Machine {
    cpu: CpuState,
    memory: Memory,
    pic: Pic,
    pit: Pit,
    dma: Dma,
    keyboard: Keyboard,
    cga: Cga,

    /// Debugger: a breakpoint on CS:IP, checked before each instruction.
    pub breakpoint: Option<(u16, u16)>,
    /// Debugger: log each retired instruction's address at `trace!`.
    pub trace: bool,

    /// Set by a write to the synthetic exit port 0xFF (§6); once set the
    /// run loop halts and the CLI reports this as the process exit code.
    exit_code: Option<u8>,
}

impl Machine {
    pub fn new() -> Machine {
        Machine {
            cpu: CpuState::new(),
            memory: Memory::new(),
            pic: Pic::new(),
            pit: Pit::new(),
            dma: Dma::new(),
            keyboard: Keyboard::new(),
            cga: Cga::new(),
            breakpoint: None,
            trace: false,
            exit_code: None,
        }
    }

    /// The argument of a write to port 0xFF, if one has happened yet.
    pub fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    /// Load a raw program/ROM image at a physical byte offset and point
    /// CS:IP at it.
    pub fn load_program(&mut self, segment: u16, offset: u16, data: &[u8]) {
        let base = crate::memory::physical_addr(segment, offset);
        self.memory.load_image(base, data);
        self.cpu.cs = segment;
        self.cpu.ip = offset;
    }

    pub fn cga_mode_handle(&self) -> std::sync::Arc<std::sync::Mutex<u8>> {
        self.cga.mode_handle()
    }

    /// The framebuffer bridge (§4.11, component J): a shared, lock-guarded
    /// copy of the CGA text window, refreshed each tick from `Memory`.
    pub fn framebuffer_handle(&self) -> std::sync::Arc<std::sync::RwLock<Vec<u8>>> {
        self.cga.framebuffer_handle()
    }

    pub fn enqueue_scancode(&mut self, scancode: u8) {
        self.keyboard.enqueue(scancode);
    }

    /// Raise an IRQ line on the PIC directly, as an external device
    /// (other than the PIT/keyboard this `Machine` already drives via
    /// `tick_peripherals`) would.
    pub fn raise_irq(&mut self, irq: u8) {
        self.pic.raise(irq);
    }

    /// The PIC's in-service register, for debugger/test inspection.
    pub fn pic_isr(&self) -> u8 {
        self.pic.isr()
    }

    /// Run one instruction. Returns `false` if the CPU is halted and no
    /// interrupt remains pending to wake it, or a breakpoint is hit
    /// before the step (the debugger's run loop stops in that case
    /// without executing the breakpointed instruction).
    pub fn step(&mut self) -> bool {
        if self.cpu.halted || self.exit_code.is_some() {
            return false;
        }
        if let Some((bp_cs, bp_ip)) = self.breakpoint {
            if self.cpu.cs == bp_cs && self.cpu.ip == bp_ip {
                return false;
            }
        }
        if self.trace {
            log::trace!("{:04X}:{:04X}", self.cpu.cs, self.cpu.ip);
        }
        exec::step(self);
        true
    }

    /// Run until halted, a breakpoint is hit, or `max_instructions`
    /// instructions have retired (debugger "run" command, §4.8).
    pub fn run(&mut self, max_instructions: u64) -> u64 {
        let start = self.cpu.tot_instructions;
        while self.cpu.tot_instructions - start < max_instructions {
            if !self.step() {
                break;
            }
        }
        self.cpu.tot_instructions - start
    }

    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_state_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }
}

impl Default for Machine {
    fn default() -> Machine {
        Machine::new()
    }
}

impl WithCpu for Machine {
    fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }
}

impl Bus for Machine {
    fn mem(&self) -> &Memory {
        &self.memory
    }

    fn mem_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    fn cpu_and_mem_mut(&mut self) -> (&mut CpuState, &mut Memory) {
        (&mut self.cpu, &mut self.memory)
    }

    fn port_in(&mut self, port: u16, width: PortWidth) -> u16 {
        match io_bus::match_port(port) {
            Device::Dma => u16::from(self.dma.port_read(port)),
            Device::DmaPage => u16::from(self.dma.page_read(port)),
            Device::Pic => u16::from(self.pic.port_read(port)),
            Device::Pit => u16::from(self.pit.port_read(port)),
            Device::Ppi => match port {
                0x60 => u16::from(self.keyboard.port_60_read()),
                0x61 => u16::from(self.keyboard.port_61_read()),
                _ => 0xFF,
            },
            Device::Cga => u16::from(self.cga.port_read(port)),
            Device::Exit => u16::from(self.exit_code.unwrap_or(0xFF)),
            Device::Unmapped => {
                log::warn!("IN from unregistered port {:#06X}", port);
                match width {
                    PortWidth::Byte => 0xFF,
                    PortWidth::Word => 0xFFFF,
                }
            }
        }
    }

    fn port_out(&mut self, port: u16, _width: PortWidth, value: u16) {
        match io_bus::match_port(port) {
            Device::Dma => self.dma.port_write(port, value as u8),
            Device::DmaPage => self.dma.page_write(port, value as u8),
            Device::Pic => self.pic.port_write(port, value as u8),
            Device::Pit => self.pit.port_write(port, value as u8),
            Device::Ppi => {
                if port == 0x61 {
                    self.keyboard.port_61_write(value as u8);
                }
            }
            Device::Cga => self.cga.port_write(port, value as u8),
            Device::Exit => {
                log::info!("exit port write: code {}", value as u8);
                self.exit_code = Some(value as u8);
            }
            Device::Unmapped => log::warn!("OUT to unregistered port {:#06X}", port),
        }
    }

    fn tick_peripherals(&mut self) {
        if self.cpu.tot_instructions % TICK_EVERY_N_INSTRUCTIONS != 0 {
            return;
        }
        self.cga.sync_framebuffer(&self.memory);
        if self.pit.tick() {
            self.pic.raise(0);
        }
        if self.keyboard.has_pending() {
            self.pic.raise(1);
        }
    }

    fn pic_ack(&mut self) -> Option<u8> {
        self.pic.ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_ax_imm_then_halt_runs_to_completion() {
        let mut mb = Machine::new();
        // mov ax, 0x1234; hlt
        mb.load_program(0, 0, &[0xB8, 0x34, 0x12, 0xF4]);
        let retired = mb.run(10);
        assert_eq!(retired, 2);
        assert_eq!(mb.cpu_state().ax, 0x1234);
        assert!(mb.cpu_state().halted);
    }

    #[test]
    fn exit_port_write_halts_the_run_loop_and_records_the_code() {
        let mut mb = Machine::new();
        // mov al, 0x07; mov dx, 0xFF; out dx, al
        mb.load_program(0, 0, &[0xB0, 0x07, 0xBA, 0xFF, 0x00, 0xEE]);
        let retired = mb.run(10);
        assert_eq!(retired, 3);
        assert_eq!(mb.exit_code(), Some(7));
    }

    #[test]
    fn breakpoint_stops_before_the_marked_instruction() {
        let mut mb = Machine::new();
        mb.load_program(0, 0, &[0x90, 0x90, 0x90]); // nop nop nop
        mb.breakpoint = Some((0, 2));
        let retired = mb.run(10);
        assert_eq!(retired, 2);
        assert_eq!(mb.cpu_state().ip, 2);
    }
}
