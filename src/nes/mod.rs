pub mod blargg;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod error;
pub mod joypad;
pub mod mapper;
pub mod opcodes;
mod palette;
pub mod ppu;
pub mod timing;

use anyhow::Result;
use std::{collections::VecDeque, path::Path, time::Duration};

use cartridge::Cartridge;
use cpu::{Cpu, CpuState};
use error::{CoreError, Diagnostic};
use mapper::{Mapper, create_mapper, mapper_name};
use ppu::{Checkpoint, Ppu};
use timing::{Clocked, CycleBudget, RunReport};

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

const MAX_DEBUG_EVENTS: usize = 512;
const FRAME_GUARD_STEPS: usize = 10_000_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub cpu_steps: u64,
    pub ppu_cycles: u64,
    pub dma_transfers: u64,
    pub nmi_count: u64,
    pub irq_count: u64,
    pub unofficial_opcode_count: u64,
    pub last_unofficial_opcode: Option<(u8, u16)>,
}

pub struct Nes {
    cpu: Cpu,
    ppu: Ppu,
    mapper: Option<Box<dyn Mapper>>,
    mapper_name: String,
    budget: CycleBudget,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            ppu: Ppu::new(),
            mapper: None,
            mapper_name: "No mapper".to_string(),
            budget: CycleBudget::default(),
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn has_rom(&self) -> bool {
        self.mapper.is_some()
    }

    /// Row-major 256x240 `0x00RRGGBB` pixels. Complete after each frame end.
    pub fn frame_buffer(&self) -> &[u32] {
        self.ppu.frame_buffer()
    }

    /// The frame buffer as packed RGB bytes, for texture upload and hashing.
    pub fn frame_rgb(&self) -> Vec<u8> {
        self.ppu
            .frame_buffer()
            .iter()
            .flat_map(|&pixel| palette::to_rgb(pixel))
            .collect()
    }

    pub fn debug_cpu_regs(&self) -> CpuState {
        *self.cpu.regs()
    }

    pub fn debug_total_cycles(&self) -> u64 {
        self.cpu.ticks()
    }

    /// (ctrl, mask, status)
    pub fn debug_ppu_regs(&self) -> (u8, u8, u8) {
        (
            self.ppu.debug_ctrl(),
            self.ppu.debug_mask(),
            self.ppu.debug_status(),
        )
    }

    pub fn debug_ppu_vram_addr(&self) -> u16 {
        self.ppu.debug_vram_addr()
    }

    pub fn debug_ppu_scanline_cycle(&self) -> (u16, u16) {
        self.ppu.scanline_cycle()
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.ppu.debug_peek_oam(index)
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.ppu.debug_peek_palette(index)
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.debug
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    /// Button mask using the `BUTTON_*` bits.
    pub fn set_controller_state(&mut self, state: u8) {
        self.cpu.joypad_mut().set_from_mask(state);
    }

    /// Buttons in read order: A, B, Select, Start, Up, Down, Left, Right.
    pub fn set_buttons(&mut self, buttons: [bool; 8]) {
        self.cpu.joypad_mut().set_buttons(buttons);
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.load_cartridge(cart)
    }

    pub fn load_cartridge(&mut self, cart: Cartridge) -> Result<()> {
        let mapper_id = cart.mapper_id;
        let (mapper, diagnostic) = create_mapper(cart);
        self.mapper = Some(mapper);
        self.mapper_name = format!("{} (mapper {mapper_id})", mapper_name(mapper_id));
        self.cpu = Cpu::new();
        self.ppu = Ppu::new();
        self.reset()?;
        self.push_debug_event(format!("ROM loaded: {}", self.mapper_name));
        if let Some(diagnostic) = diagnostic {
            self.push_debug_event(diagnostic.to_string());
        }
        Ok(())
    }

    /// Reset line: PPU back to its power-on state, CPU through the reset vector.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        let mapper = self.mapper.as_deref_mut().ok_or(CoreError::NoCartridge)?;
        self.ppu.reset();
        self.cpu.reset(&mut self.ppu, mapper)?;
        self.budget.clear();
        self.debug = NesDebugCounters::default();
        self.debug_events.clear();
        let pc = self.cpu.regs().pc;
        self.push_debug_event(format!("CPU reset, PC=${pc:04X}"));
        Ok(())
    }

    /// Moves the entry point, e.g. to 0xC000 for the automated nestest mode.
    pub fn set_pc(&mut self, pc: u16) {
        self.cpu.regs_mut().pc = pc;
    }

    /// Raises the IRQ line once. Returns false when the CPU has IRQs masked.
    pub fn trigger_irq(&mut self) -> Result<bool, CoreError> {
        let mapper = self.mapper.as_deref_mut().ok_or(CoreError::NoCartridge)?;
        let taken = self.cpu.trigger_irq(&mut self.ppu, mapper)?;
        if taken {
            self.debug.irq_count += 1;
            let pc = self.cpu.regs().pc;
            self.push_debug_event(format!("IRQ -> ${pc:04X}"));
        }
        Ok(taken)
    }

    /// One CPU instruction (or stall tick) plus its PPU steps.
    pub fn step_instruction(&mut self) -> Result<u32, CoreError> {
        let mut report = RunReport::default();
        timing::step_once(self, &mut report)
    }

    /// Runs until the PPU reports the end of the visible frame.
    pub fn run_frame(&mut self) -> Result<(), CoreError> {
        if self.mapper.is_none() {
            return Err(CoreError::NoCartridge);
        }

        let mut report = RunReport::default();
        let mut guard: usize = 0;
        while report.frames_completed == 0 {
            timing::step_once(self, &mut report)?;

            guard += 1;
            if guard > FRAME_GUARD_STEPS {
                self.push_debug_event("Frame guard tripped at 10,000,000 CPU steps");
                break;
            }
        }
        Ok(())
    }

    /// Converts `elapsed` wall time into CPU cycles and runs them.
    pub fn run_for(&mut self, elapsed: Duration) -> Result<RunReport, CoreError> {
        if self.mapper.is_none() {
            return Err(CoreError::NoCartridge);
        }

        let mut budget = std::mem::take(&mut self.budget);
        budget.add_elapsed(elapsed);
        let report = budget.run(self);
        self.budget = budget;
        report
    }

    /// Log line for the instruction about to execute.
    pub fn trace_line(&self) -> Result<String, CoreError> {
        let mapper = self.mapper.as_deref().ok_or(CoreError::NoCartridge)?;
        Ok(self.cpu.trace_line(&self.ppu, mapper))
    }

    /// Reads CPU space without side effects. Without a cartridge only RAM is
    /// visible.
    pub fn peek(&self, addr: u16) -> u8 {
        match self.mapper.as_deref() {
            Some(mapper) => self.cpu.peek(&self.ppu, mapper, addr),
            None if addr < 0x2000 => self.cpu.ram()[addr as usize % bus::RAM_SIZE],
            None => 0,
        }
    }

    fn record_diagnostics(&mut self) {
        for diagnostic in self.cpu.take_diagnostics() {
            if let Diagnostic::UnofficialOpcode { opcode, pc, .. } = diagnostic {
                self.debug.unofficial_opcode_count += 1;
                self.debug.last_unofficial_opcode = Some((opcode, pc));
            }
            self.push_debug_event(diagnostic.to_string());
        }
    }
}

impl Clocked for Nes {
    fn step_cpu(&mut self) -> Result<u32, CoreError> {
        let mapper = self.mapper.as_deref_mut().ok_or(CoreError::NoCartridge)?;
        let stalled = self.cpu.stall_cycles() > 0;
        let ticks = self.cpu.step(&mut self.ppu, mapper)?;
        self.debug.cpu_steps += 1;

        if !stalled && self.cpu.stall_cycles() > 0 {
            self.debug.dma_transfers += 1;
            self.push_debug_event(format!("OAM DMA, {} stall cycles", self.cpu.stall_cycles()));
        }
        self.record_diagnostics();
        Ok(ticks)
    }

    fn step_ppu(&mut self) -> Result<Option<Checkpoint>, CoreError> {
        let mapper = self.mapper.as_deref_mut().ok_or(CoreError::NoCartridge)?;
        let checkpoint = self.ppu.step(mapper)?;
        self.debug.ppu_cycles += 1;
        if checkpoint == Some(Checkpoint::FrameEnd) {
            self.debug.frame_count += 1;
        }
        Ok(checkpoint)
    }

    fn nmi_enabled(&self) -> bool {
        self.ppu.nmi_enabled()
    }

    fn trigger_nmi(&mut self) -> Result<(), CoreError> {
        let mapper = self.mapper.as_deref_mut().ok_or(CoreError::NoCartridge)?;
        self.cpu.trigger_nmi(&mut self.ppu, mapper)?;
        self.debug.nmi_count += 1;
        let pc = self.cpu.regs().pc;
        self.push_debug_event(format!("NMI -> ${pc:04X}"));
        Ok(())
    }
}

/// In-memory NROM images for unit tests.
#[cfg(test)]
pub(crate) mod test_rom {
    use super::cartridge::Cartridge;
    use super::mapper::{Mapper0, Mirroring};

    /// Both handlers are a bare RTI.
    pub const NMI_HANDLER: u16 = 0xFF00;
    pub const IRQ_HANDLER: u16 = 0xFF10;

    const PRG_SIZE: usize = 0x4000;

    fn offset(addr: u16) -> usize {
        (addr as usize - 0x8000) % PRG_SIZE
    }

    /// 16 KiB PRG (mirrored at 0xC000) with `program` at `origin`, NOPs
    /// elsewhere, and the reset vector pointing at `origin`.
    pub fn prg(program: &[u8], origin: u16) -> Vec<u8> {
        let mut prg = vec![0xEA; PRG_SIZE];
        let start = offset(origin);
        prg[start..start + program.len()].copy_from_slice(program);
        prg[offset(NMI_HANDLER)] = 0x40;
        prg[offset(IRQ_HANDLER)] = 0x40;
        for (vector, target) in [(0xFFFA, NMI_HANDLER), (0xFFFC, origin), (0xFFFE, IRQ_HANDLER)] {
            let at = offset(vector);
            prg[at..at + 2].copy_from_slice(&target.to_le_bytes());
        }
        prg
    }

    pub fn cartridge(program: &[u8], origin: u16) -> Cartridge {
        Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Vertical,
            has_battery_backed_ram: false,
            prg_rom: prg(program, origin),
            chr_data: vec![0; 0x2000],
            chr_is_ram: true,
        }
    }

    pub fn nrom_mapper(program: &[u8], origin: u16) -> Mapper0 {
        Mapper0::new(cartridge(program, origin))
    }

    /// Full iNES file bytes, one PRG bank and CHR RAM.
    pub fn ines_image(program: &[u8], origin: u16, mapper_id: u8) -> Vec<u8> {
        let mut image = vec![
            b'N',
            b'E',
            b'S',
            0x1A,
            1,
            0,
            (mapper_id & 0x0F) << 4 | 0x01,
            mapper_id & 0xF0,
        ];
        image.resize(16, 0);
        image.extend(prg(program, origin));
        image
    }
}
