use anyhow::{Context, Result, bail};
use std::{fs, path::Path};

use super::mapper::Mirroring;

const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;

/// Decoded iNES image. Only the fields the NROM board needs are kept.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to parse ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let mapper_id = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let mirroring = if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_battery_backed_ram = (flags6 & 0x02) != 0;
        let trainer_present = (flags6 & 0x04) != 0;

        let prg_rom_size = bytes[4] as usize * PRG_UNIT;
        let chr_rom_size = bytes[5] as usize * CHR_UNIT;
        if prg_rom_size == 0 {
            bail!("invalid PRG ROM: header declares zero banks");
        }

        let mut cursor = HEADER_LEN;
        if trainer_present {
            cursor += TRAINER_LEN;
        }

        let prg_end = cursor + prg_rom_size;
        if bytes.len() < prg_end {
            bail!("ROM truncated: expected {prg_rom_size} PRG bytes but file ended early");
        }
        let prg_rom = bytes[cursor..prg_end].to_vec();

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; CHR_UNIT], true)
        } else {
            let chr_end = prg_end + chr_rom_size;
            if bytes.len() < chr_end {
                bail!("ROM truncated: expected {chr_rom_size} CHR bytes but file ended early");
            }
            (bytes[prg_end..chr_end].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery_backed_ram,
            prg_rom,
            chr_data,
            chr_is_ram,
        })
    }
}
