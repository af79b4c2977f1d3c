use tracing::debug;

use super::error::CoreError;
use super::joypad::Joypad;
use super::mapper::Mapper;
use super::ppu::Ppu;

pub const RAM_SIZE: usize = 0x800;
pub const OAM_DMA_STALL_CYCLES: u32 = 512;

const OAM_DMA_PORT: u16 = 0x4014;
const JOYPAD_PORT: u16 = 0x4016;
const CARTRIDGE_START: u16 = 0x6000;

/// CPU address space for the duration of one instruction.
///
/// Borrows every device the 6502 can see. Nothing here outlives a
/// [`Cpu::step`](super::cpu::Cpu::step) call.
pub struct CpuBus<'a> {
    ram: &'a mut [u8; RAM_SIZE],
    joypad: &'a mut Joypad,
    stall: &'a mut u32,
    ppu: &'a mut Ppu,
    mapper: &'a mut dyn Mapper,
}

impl<'a> CpuBus<'a> {
    pub fn new(
        ram: &'a mut [u8; RAM_SIZE],
        joypad: &'a mut Joypad,
        stall: &'a mut u32,
        ppu: &'a mut Ppu,
        mapper: &'a mut dyn Mapper,
    ) -> Self {
        Self {
            ram,
            joypad,
            stall,
            ppu,
            mapper,
        }
    }

    pub fn read(&mut self, addr: u16) -> Result<u8, CoreError> {
        match addr {
            0x0000..=0x1FFF => Ok(self.ram[addr as usize % RAM_SIZE]),
            0x2000..=0x3FFF => self.ppu.read_register(ppu_register(addr), self.mapper),
            JOYPAD_PORT => Ok(self.joypad.read()),
            _ if addr < CARTRIDGE_START => Ok(0),
            _ => self.mapper.cpu_read(addr),
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) -> Result<(), CoreError> {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize % RAM_SIZE] = value,
            0x2000..=0x3FFF => self.ppu.write_register(ppu_register(addr), value, self.mapper)?,
            OAM_DMA_PORT => self.oam_dma(value)?,
            JOYPAD_PORT => self.joypad.write(value),
            _ if addr < CARTRIDGE_START => {}
            _ => self.mapper.cpu_write(addr, value),
        }
        Ok(())
    }

    pub fn read_u16(&mut self, addr: u16) -> Result<u16, CoreError> {
        let lo = self.read(addr)? as u16;
        let hi = self.read(addr.wrapping_add(1))? as u16;
        Ok((hi << 8) | lo)
    }

    /// Pointer fetch that stays inside the zero page.
    pub fn read_u16_zero_page(&mut self, ptr: u8) -> Result<u16, CoreError> {
        let lo = self.read(ptr as u16)? as u16;
        let hi = self.read(ptr.wrapping_add(1) as u16)? as u16;
        Ok((hi << 8) | lo)
    }

    /// JMP ($xxFF) fetches its high byte from $xx00, not the next page.
    pub fn read_u16_bug(&mut self, addr: u16) -> Result<u16, CoreError> {
        let lo = self.read(addr)? as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.read(hi_addr)? as u16;
        Ok((hi << 8) | lo)
    }

    fn oam_dma(&mut self, page: u8) -> Result<(), CoreError> {
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (offset, slot) in bytes.iter_mut().enumerate() {
            *slot = self.read(base.wrapping_add(offset as u16))?;
        }
        self.ppu.write_oam_dma(&bytes);
        *self.stall = OAM_DMA_STALL_CYCLES;
        debug!("OAM DMA from page ${page:02X}");
        Ok(())
    }
}

/// Side-effect-free view of CPU space for tracing and debuggers.
pub fn peek(ram: &[u8; RAM_SIZE], joypad: &Joypad, ppu: &Ppu, mapper: &dyn Mapper, addr: u16) -> u8 {
    match addr {
        0x0000..=0x1FFF => ram[addr as usize % RAM_SIZE],
        0x2000..=0x3FFF => ppu.peek_register(ppu_register(addr)),
        JOYPAD_PORT => joypad.peek(),
        _ if addr < CARTRIDGE_START => 0,
        _ => mapper.cpu_peek(addr),
    }
}

fn ppu_register(addr: u16) -> u16 {
    0x2000 + (addr & 0x0007)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::Cartridge;
    use crate::nes::joypad::Button;
    use crate::nes::mapper::{Mapper0, Mirroring};

    struct Rig {
        ram: [u8; RAM_SIZE],
        joypad: Joypad,
        stall: u32,
        ppu: Ppu,
        mapper: Mapper0,
    }

    impl Rig {
        fn new() -> Self {
            let mut prg_rom = vec![0u8; 0x4000];
            prg_rom[0x0010] = 0x5A;
            Self {
                ram: [0; RAM_SIZE],
                joypad: Joypad::new(),
                stall: 0,
                ppu: Ppu::new(),
                mapper: Mapper0::new(Cartridge {
                    mapper_id: 0,
                    mirroring: Mirroring::Vertical,
                    has_battery_backed_ram: false,
                    prg_rom,
                    chr_data: vec![0; 0x2000],
                    chr_is_ram: true,
                }),
            }
        }

        fn bus(&mut self) -> CpuBus<'_> {
            CpuBus::new(
                &mut self.ram,
                &mut self.joypad,
                &mut self.stall,
                &mut self.ppu,
                &mut self.mapper,
            )
        }
    }

    #[test]
    fn ram_mirrors_every_2k() {
        let mut rig = Rig::new();
        let mut bus = rig.bus();
        bus.write(0x0801, 0x42).unwrap();
        assert_eq!(bus.read(0x0001).unwrap(), 0x42);
        assert_eq!(bus.read(0x1801).unwrap(), 0x42);
    }

    #[test]
    fn ppu_registers_mirror_every_8_bytes() {
        let mut rig = Rig::new();
        let mut bus = rig.bus();
        bus.write(0x3FFB, 0x10).unwrap();
        bus.write(0x2004, 0x99).unwrap();
        assert_eq!(rig.ppu.debug_peek_oam(0x10), 0x99);

        let mut bus = rig.bus();
        bus.write(0x3456, 0x3F).unwrap();
        bus.write(0x2006, 0x00).unwrap();
        bus.write(0x3FFF, 0x21).unwrap();
        assert_eq!(rig.ppu.debug_peek_palette(0), 0x21);
    }

    #[test]
    fn unmapped_io_reads_zero_and_ignores_writes() {
        let mut rig = Rig::new();
        let mut bus = rig.bus();
        bus.write(0x4000, 0xFF).unwrap();
        bus.write(0x5FFF, 0xFF).unwrap();
        assert_eq!(bus.read(0x4015).unwrap(), 0);
        assert_eq!(bus.read(0x5FFF).unwrap(), 0);
    }

    #[test]
    fn cartridge_space_is_delegated() {
        let mut rig = Rig::new();
        let mut bus = rig.bus();
        bus.write(0x6000, 0x77).unwrap();
        assert_eq!(bus.read(0x6000).unwrap(), 0x77);
        assert_eq!(bus.read(0x8010).unwrap(), 0x5A);
        assert_eq!(bus.read(0xC010).unwrap(), 0x5A);
    }

    #[test]
    fn joypad_port_round_trip() {
        let mut rig = Rig::new();
        rig.joypad.set_button(Button::Start, true);
        let mut bus = rig.bus();
        bus.write(0x4016, 1).unwrap();
        bus.write(0x4016, 0).unwrap();
        let reads: Vec<u8> = (0..4).map(|_| bus.read(0x4016).unwrap()).collect();
        assert_eq!(reads, vec![0x40, 0x40, 0x40, 0x41]);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls() {
        let mut rig = Rig::new();
        for i in 0..256usize {
            rig.ram[0x200 + i] = i as u8 ^ 0xA5;
        }
        rig.ppu.write_register(0x2003, 0x80, &mut rig.mapper).unwrap();
        let mut bus = rig.bus();
        bus.write(0x4014, 0x02).unwrap();

        assert_eq!(rig.stall, OAM_DMA_STALL_CYCLES);
        assert_eq!(rig.ppu.debug_peek_oam(0), 0xA5);
        assert_eq!(rig.ppu.debug_peek_oam(255), 0xFF ^ 0xA5);
    }

    #[test]
    fn oam_dma_can_source_cartridge_space() {
        let mut rig = Rig::new();
        let mut bus = rig.bus();
        bus.write(0x4014, 0x80).unwrap();
        assert_eq!(rig.ppu.debug_peek_oam(0x10), 0x5A);
    }

    #[test]
    fn jmp_indirect_pointer_wraps_within_page() {
        let mut rig = Rig::new();
        rig.ram[0x02FF] = 0x34;
        rig.ram[0x0200] = 0x12;
        rig.ram[0x0300] = 0x99;
        let mut bus = rig.bus();
        assert_eq!(bus.read_u16_bug(0x02FF).unwrap(), 0x1234);
        assert_eq!(bus.read_u16(0x02FF).unwrap(), 0x9934);
    }

    #[test]
    fn zero_page_pointer_wraps() {
        let mut rig = Rig::new();
        rig.ram[0x00FF] = 0xCD;
        rig.ram[0x0000] = 0xAB;
        let mut bus = rig.bus();
        assert_eq!(bus.read_u16_zero_page(0xFF).unwrap(), 0xABCD);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let mut rig = Rig::new();
        rig.joypad.write(1);
        rig.joypad.write(0);
        let first = peek(&rig.ram, &rig.joypad, &rig.ppu, &rig.mapper, 0x4016);
        let again = peek(&rig.ram, &rig.joypad, &rig.ppu, &rig.mapper, 0x4016);
        assert_eq!(first, again);
        assert_eq!(peek(&rig.ram, &rig.joypad, &rig.ppu, &rig.mapper, 0xC010), 0x5A);
    }
}
