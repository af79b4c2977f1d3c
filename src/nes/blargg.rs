//! Result protocol used by blargg's self-checking test ROMs.
//!
//! $6000 holds the status (0x80 while running, 0x81 when the ROM asks for a
//! reset, anything else is the final result code), $6001-$6003 hold the
//! signature DE B0 61 and a NUL-terminated message starts at $6004.

use serde::Serialize;
use tracing::debug;

use super::Nes;
use super::error::CoreError;

pub const STATUS_ADDR: u16 = 0x6000;
pub const STATUS_RUNNING: u8 = 0x80;
pub const STATUS_NEEDS_RESET: u8 = 0x81;
pub const SIGNATURE: [u8; 3] = [0xDE, 0xB0, 0x61];

const SIGNATURE_ADDR: u16 = 0x6001;
const MESSAGE_ADDR: u16 = 0x6004;
const MAX_MESSAGE_LEN: u16 = 0x1000;
const POLL_INTERVAL: u64 = 64;
/// Roughly 100 ms of CPU time, the delay the ROMs ask for before a reset.
const RESET_DELAY_CYCLES: u64 = 180_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Signature not written yet.
    NotStarted,
    Running,
    NeedsReset,
    Finished(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// Final result code, `None` when the instruction limit was hit first.
    pub code: Option<u8>,
    pub message: String,
    pub instructions: u64,
}

impl Outcome {
    pub fn passed(&self) -> bool {
        self.code == Some(0)
    }
}

pub fn status(nes: &Nes) -> Status {
    let signed = SIGNATURE
        .iter()
        .enumerate()
        .all(|(i, &byte)| nes.peek(SIGNATURE_ADDR + i as u16) == byte);
    if !signed {
        return Status::NotStarted;
    }
    match nes.peek(STATUS_ADDR) {
        STATUS_RUNNING => Status::Running,
        STATUS_NEEDS_RESET => Status::NeedsReset,
        code => Status::Finished(code),
    }
}

/// Text at $6004 up to the first NUL.
pub fn message(nes: &Nes) -> String {
    let bytes: Vec<u8> = (0..MAX_MESSAGE_LEN)
        .map(|offset| nes.peek(MESSAGE_ADDR + offset))
        .take_while(|&byte| byte != 0)
        .collect();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

/// Steps `nes` until the ROM reports a result or `max_instructions` pass.
pub fn run(nes: &mut Nes, max_instructions: u64) -> Result<Outcome, CoreError> {
    let mut instructions = 0u64;
    let mut reset_at: Option<u64> = None;

    while instructions < max_instructions {
        nes.step_instruction()?;
        instructions += 1;

        if let Some(deadline) = reset_at {
            if nes.debug_total_cycles() >= deadline {
                debug!(instructions, "test ROM requested reset");
                nes.reset()?;
                reset_at = None;
            }
            continue;
        }

        if instructions % POLL_INTERVAL != 0 {
            continue;
        }
        match status(nes) {
            Status::NotStarted | Status::Running => {}
            Status::NeedsReset => {
                reset_at = Some(nes.debug_total_cycles() + RESET_DELAY_CYCLES);
            }
            Status::Finished(code) => {
                return Ok(Outcome {
                    code: Some(code),
                    message: message(nes),
                    instructions,
                });
            }
        }
    }

    Ok(Outcome {
        code: None,
        message: message(nes),
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::test_rom;

    const ORIGIN: u16 = 0x8000;

    /// Writes the signature, a running status, then `code` and "OK\n\0".
    fn reporting_program(code: u8) -> Vec<u8> {
        let mut program = Vec::new();
        let mut store = |value: u8, addr: u16| {
            program.extend_from_slice(&[0xA9, value, 0x8D, addr as u8, (addr >> 8) as u8]);
        };
        store(0xDE, 0x6001);
        store(0xB0, 0x6002);
        store(0x61, 0x6003);
        store(STATUS_RUNNING, STATUS_ADDR);
        for (i, byte) in b"OK\n\0".iter().enumerate() {
            store(*byte, MESSAGE_ADDR + i as u16);
        }
        store(code, STATUS_ADDR);
        // JMP to self
        let here = ORIGIN + program.len() as u16;
        program.extend_from_slice(&[0x4C, here as u8, (here >> 8) as u8]);
        program
    }

    fn nes_running(program: &[u8]) -> Nes {
        let mut nes = Nes::new();
        nes.load_cartridge(test_rom::cartridge(program, ORIGIN)).unwrap();
        nes
    }

    #[test]
    fn status_requires_signature() {
        let nes = nes_running(&[0xEA]);
        assert_eq!(status(&nes), Status::NotStarted);
    }

    #[test]
    fn passing_rom_reports_code_zero_and_message() {
        let mut nes = nes_running(&reporting_program(0));
        let outcome = run(&mut nes, 10_000).unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.message, "OK");
    }

    #[test]
    fn failing_code_is_surfaced() {
        let mut nes = nes_running(&reporting_program(3));
        let outcome = run(&mut nes, 10_000).unwrap();
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.passed());
    }

    #[test]
    fn instruction_limit_yields_no_code() {
        let mut nes = nes_running(&[0x4C, 0x00, 0x80]);
        let outcome = run(&mut nes, 500).unwrap();
        assert_eq!(outcome.code, None);
        assert_eq!(outcome.instructions, 500);
    }
}
