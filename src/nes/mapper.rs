use tracing::warn;

use super::cartridge::Cartridge;
use super::error::{CoreError, Diagnostic};

const PRG_RAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
}

/// Board-side view of a cartridge: CPU space from 0x6000 up and the pattern
/// tables in PPU space.
pub trait Mapper {
    fn cpu_read(&mut self, addr: u16) -> Result<u8, CoreError>;
    fn cpu_write(&mut self, addr: u16, value: u8);
    /// Same as `cpu_read` without board side effects. Unmapped addresses read 0.
    fn cpu_peek(&self, addr: u16) -> u8;
    fn ppu_read(&mut self, addr: u16) -> u8;
    fn ppu_write(&mut self, addr: u16, value: u8);
    fn mirroring(&self) -> Mirroring;
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        7 => "AxROM",
        _ => "Unsupported",
    }
}

/// Builds the board for `cart`. Anything other than NROM is loaded as NROM and
/// reported through the returned diagnostic.
pub fn create_mapper(cart: Cartridge) -> (Box<dyn Mapper>, Option<Diagnostic>) {
    let diagnostic = if cart.mapper_id != 0 {
        warn!(
            mapper_id = cart.mapper_id,
            name = mapper_name(cart.mapper_id),
            "unsupported mapper, falling back to NROM layout"
        );
        Some(Diagnostic::UnsupportedMapper {
            mapper_id: cart.mapper_id,
        })
    } else {
        None
    };
    (Box::new(Mapper0::new(cart)), diagnostic)
}

pub(crate) struct Mapper0 {
    prg_rom: Vec<u8>,
    prg_ram: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    mirroring: Mirroring,
}

impl Mapper0 {
    pub(crate) fn new(cart: Cartridge) -> Self {
        Self {
            prg_rom: cart.prg_rom,
            prg_ram: vec![0; PRG_RAM_SIZE],
            chr: cart.chr_data,
            chr_is_ram: cart.chr_is_ram,
            mirroring: cart.mirroring,
        }
    }

    fn prg_index(&self, addr: u16) -> usize {
        // 16 KiB images repeat at 0xC000.
        (addr as usize - 0x8000) % self.prg_rom.len()
    }

    fn chr_index(&self, addr: u16) -> usize {
        (addr as usize & 0x1FFF) % self.chr.len()
    }
}

impl Mapper for Mapper0 {
    fn cpu_read(&mut self, addr: u16) -> Result<u8, CoreError> {
        match addr {
            0x6000..=0x7FFF => Ok(self.prg_ram[addr as usize - 0x6000]),
            0x8000..=0xFFFF => Ok(self.prg_rom[self.prg_index(addr)]),
            _ => Err(CoreError::UnmappedCartridgeAddress(addr)),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if let 0x6000..=0x7FFF = addr {
            self.prg_ram[addr as usize - 0x6000] = value;
        }
    }

    fn cpu_peek(&self, addr: u16) -> u8 {
        match addr {
            0x6000..=0x7FFF => self.prg_ram[addr as usize - 0x6000],
            0x8000..=0xFFFF => self.prg_rom[self.prg_index(addr)],
            _ => 0,
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        self.chr[self.chr_index(addr)]
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if self.chr_is_ram {
            let idx = self.chr_index(addr);
            self.chr[idx] = value;
        }
    }

    fn mirroring(&self) -> Mirroring {
        self.mirroring
    }
}
