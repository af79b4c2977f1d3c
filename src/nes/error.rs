use std::fmt;

/// Conditions that mean the emulator itself is wrong, not the guest program.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("PPU address ${0:04X} is outside every mapped range")]
    PpuAddressOutOfRange(u16),
    #[error("cartridge has no backing for CPU address ${0:04X}")]
    UnmappedCartridgeAddress(u16),
    #[error("no cartridge inserted")]
    NoCartridge,
}

/// Recoverable conditions. Execution continues after one is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    UnsupportedMapper {
        mapper_id: u16,
    },
    UnofficialOpcode {
        opcode: u8,
        pc: u16,
        mnemonic: &'static str,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMapper { mapper_id } => {
                write!(f, "mapper {mapper_id} is not supported, running as NROM")
            }
            Self::UnofficialOpcode {
                opcode,
                pc,
                mnemonic,
            } => write!(
                f,
                "unofficial opcode ${opcode:02X} ({mnemonic}) @ ${pc:04X} treated as no-op"
            ),
        }
    }
}
