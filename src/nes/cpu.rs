use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use super::bus::{self, CpuBus, RAM_SIZE};
use super::error::{CoreError, Diagnostic};
use super::joypad::Joypad;
use super::mapper::Mapper;
use super::opcodes::{self, AddressingMode, Mnemonic, Opcode};
use super::ppu::Ppu;
use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const STACK_PAGE: u16 = 0x0100;
const SP_RESET: u8 = 0xFD;
const MAX_DIAGNOSTICS: usize = 512;

/// Register file. The status byte is stored packed; bit 5 always reads set
/// and Break only exists in copies pushed to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub p: u8,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: SP_RESET,
            pc: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
        }
    }
}

impl CpuState {
    pub fn status(&self) -> u8 {
        (self.p & !FLAG_BREAK) | FLAG_UNUSED
    }

    /// Loads flags from a status byte, as PLP and RTI do.
    pub fn set_status(&mut self, value: u8) {
        self.p = (value & !FLAG_BREAK) | FLAG_UNUSED;
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p = (self.p & !FLAG_BREAK) | FLAG_UNUSED;
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }
}

/// What an executed instruction did besides touching registers and memory.
#[derive(Debug, Clone, Copy, Default)]
struct Outcome {
    jumped: bool,
    page_crossed: bool,
    branch_taken: bool,
}

pub struct Cpu {
    pub(crate) regs: CpuState,
    pub(crate) ram: [u8; RAM_SIZE],
    pub(crate) joypad: Joypad,
    stall: u32,
    ticks: u64,
    diagnostics: VecDeque<Diagnostic>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: CpuState::default(),
            ram: [0; RAM_SIZE],
            joypad: Joypad::new(),
            stall: 0,
            ticks: 0,
            diagnostics: VecDeque::with_capacity(MAX_DIAGNOSTICS),
        }
    }

    pub fn regs(&self) -> &CpuState {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut CpuState {
        &mut self.regs
    }

    pub fn joypad_mut(&mut self) -> &mut Joypad {
        &mut self.joypad
    }

    /// Total ticks consumed since construction or reset.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn stall_cycles(&self) -> u32 {
        self.stall
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.drain(..).collect()
    }

    fn bus<'a>(&'a mut self, ppu: &'a mut Ppu, mapper: &'a mut dyn Mapper) -> CpuBus<'a> {
        CpuBus::new(&mut self.ram, &mut self.joypad, &mut self.stall, ppu, mapper)
    }

    /// Power-on/reset sequence. RAM keeps its contents.
    pub fn reset(&mut self, ppu: &mut Ppu, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        self.stall = 0;
        self.ticks = 0;
        self.diagnostics.clear();
        let pc = self.bus(ppu, mapper).read_u16(RESET_VECTOR)?;
        self.regs = CpuState {
            pc,
            ..CpuState::default()
        };
        Ok(())
    }

    /// Runs one instruction, or one stalled cycle while a DMA is pending.
    /// Returns the ticks consumed.
    pub fn step(&mut self, ppu: &mut Ppu, mapper: &mut dyn Mapper) -> Result<u32, CoreError> {
        if self.stall > 0 {
            self.stall -= 1;
            self.ticks += 1;
            return Ok(1);
        }

        let pc = self.regs.pc;
        let mut regs = self.regs;
        let mut bus = CpuBus::new(&mut self.ram, &mut self.joypad, &mut self.stall, ppu, mapper);

        let opcode = bus.read(pc)?;
        let op = opcodes::lookup(opcode);
        let mut operand = 0u16;
        for i in 1..op.len as u16 {
            operand |= (bus.read(pc.wrapping_add(i))? as u16) << ((i - 1) * 8);
        }

        let outcome = execute(&mut regs, &mut bus, op, operand)?;
        if !op.mnemonic.is_official() {
            self.record(Diagnostic::UnofficialOpcode {
                opcode,
                pc,
                mnemonic: op.mnemonic.name(),
            });
        }

        if !outcome.jumped {
            regs.pc = pc.wrapping_add(op.len as u16);
        }
        self.regs = regs;

        let mut cycles = op.cycles as u32;
        if op.mnemonic.is_branch() {
            if outcome.branch_taken {
                cycles += 1;
                if outcome.page_crossed {
                    cycles += op.page_cycles as u32;
                }
            }
        } else if outcome.page_crossed {
            cycles += op.page_cycles as u32;
        }
        self.ticks += cycles as u64;
        Ok(cycles)
    }

    /// Non-maskable interrupt entry. Costs no ticks; the caller invokes it
    /// between instructions.
    pub fn trigger_nmi(&mut self, ppu: &mut Ppu, mapper: &mut dyn Mapper) -> Result<(), CoreError> {
        let mut regs = self.regs;
        let return_addr = regs.pc;
        let mut bus = self.bus(ppu, mapper);
        interrupt(&mut regs, &mut bus, return_addr, false, NMI_VECTOR)?;
        self.regs = regs;
        Ok(())
    }

    /// Maskable interrupt entry. Returns false when the I flag held it off.
    pub fn trigger_irq(&mut self, ppu: &mut Ppu, mapper: &mut dyn Mapper) -> Result<bool, CoreError> {
        if self.regs.get_flag(FLAG_INTERRUPT) {
            return Ok(false);
        }
        let mut regs = self.regs;
        let return_addr = regs.pc;
        let mut bus = self.bus(ppu, mapper);
        interrupt(&mut regs, &mut bus, return_addr, false, IRQ_VECTOR)?;
        self.regs = regs;
        Ok(true)
    }

    /// Side-effect-free read of CPU space.
    pub fn peek(&self, ppu: &Ppu, mapper: &dyn Mapper, addr: u16) -> u8 {
        bus::peek(&self.ram, &self.joypad, ppu, mapper, addr)
    }

    /// Log line for the instruction at PC, in the layout of the nestest
    /// reference trace. Columns 0..14 and 48..73 are the comparable ones.
    pub fn trace_line(&self, ppu: &Ppu, mapper: &dyn Mapper) -> String {
        let pc = self.regs.pc;
        let opcode = self.peek(ppu, mapper, pc);
        let op = opcodes::lookup(opcode);
        let operand_byte = |i: u16| {
            if i < op.len as u16 {
                format!("{:02X}", self.peek(ppu, mapper, pc.wrapping_add(i)))
            } else {
                "  ".to_string()
            }
        };
        format!(
            "{:04X}  {:02X} {} {}  {:<32}A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X}",
            pc,
            opcode,
            operand_byte(1),
            operand_byte(2),
            op.mnemonic.name(),
            self.regs.a,
            self.regs.x,
            self.regs.y,
            self.regs.status(),
            self.regs.sp,
        )
    }

    fn record(&mut self, diagnostic: Diagnostic) {
        debug!("{diagnostic}");
        if self.diagnostics.len() >= MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(diagnostic);
    }
}

/// Effective address for `mode`, plus whether indexing crossed a page.
/// `regs.pc` still points at the opcode.
fn resolve(
    regs: &CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
) -> Result<(u16, bool), CoreError> {
    let crossed = |base: u16, addr: u16| (base & 0xFF00) != (addr & 0xFF00);
    let resolved = match op.mode {
        AddressingMode::ZeroPage | AddressingMode::Absolute => (operand, false),
        AddressingMode::ZeroPageX => ((operand as u8).wrapping_add(regs.x) as u16, false),
        AddressingMode::ZeroPageY => ((operand as u8).wrapping_add(regs.y) as u16, false),
        AddressingMode::AbsoluteX => {
            let addr = operand.wrapping_add(regs.x as u16);
            (addr, crossed(operand, addr))
        }
        AddressingMode::AbsoluteY => {
            let addr = operand.wrapping_add(regs.y as u16);
            (addr, crossed(operand, addr))
        }
        AddressingMode::IndexedIndirect => {
            let ptr = (operand as u8).wrapping_add(regs.x);
            (bus.read_u16_zero_page(ptr)?, false)
        }
        AddressingMode::IndirectIndexed => {
            let base = bus.read_u16_zero_page(operand as u8)?;
            let addr = base.wrapping_add(regs.y as u16);
            (addr, crossed(base, addr))
        }
        AddressingMode::Indirect => (bus.read_u16_bug(operand)?, false),
        AddressingMode::Relative => {
            let next = regs.pc.wrapping_add(op.len as u16);
            let addr = next.wrapping_add(operand as u8 as i8 as u16);
            (addr, crossed(next, addr))
        }
        AddressingMode::Implied | AddressingMode::Accumulator | AddressingMode::Immediate => {
            (0, false)
        }
    };
    Ok(resolved)
}

/// Operand value: the immediate byte, A, or a memory read.
fn load(
    regs: &CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
) -> Result<(u8, bool), CoreError> {
    match op.mode {
        AddressingMode::Immediate => Ok((operand as u8, false)),
        AddressingMode::Accumulator => Ok((regs.a, false)),
        _ => {
            let (addr, crossed) = resolve(regs, bus, op, operand)?;
            Ok((bus.read(addr)?, crossed))
        }
    }
}

fn store(
    regs: &CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
    value: u8,
) -> Result<(), CoreError> {
    let (addr, _) = resolve(regs, bus, op, operand)?;
    bus.write(addr, value)
}

fn push(regs: &mut CpuState, bus: &mut CpuBus<'_>, value: u8) -> Result<(), CoreError> {
    bus.write(STACK_PAGE | regs.sp as u16, value)?;
    regs.sp = regs.sp.wrapping_sub(1);
    Ok(())
}

fn pop(regs: &mut CpuState, bus: &mut CpuBus<'_>) -> Result<u8, CoreError> {
    regs.sp = regs.sp.wrapping_add(1);
    bus.read(STACK_PAGE | regs.sp as u16)
}

fn push_u16(regs: &mut CpuState, bus: &mut CpuBus<'_>, value: u16) -> Result<(), CoreError> {
    push(regs, bus, (value >> 8) as u8)?;
    push(regs, bus, value as u8)
}

fn pop_u16(regs: &mut CpuState, bus: &mut CpuBus<'_>) -> Result<u16, CoreError> {
    let lo = pop(regs, bus)? as u16;
    let hi = pop(regs, bus)? as u16;
    Ok((hi << 8) | lo)
}

/// Shared BRK/NMI/IRQ entry: push return address and status, mask IRQs,
/// load the vector.
fn interrupt(
    regs: &mut CpuState,
    bus: &mut CpuBus<'_>,
    return_addr: u16,
    brk: bool,
    vector: u16,
) -> Result<(), CoreError> {
    push_u16(regs, bus, return_addr)?;
    let pushed = if brk {
        regs.status() | FLAG_BREAK
    } else {
        regs.status()
    };
    push(regs, bus, pushed)?;
    regs.set_flag(FLAG_INTERRUPT, true);
    regs.pc = bus.read_u16(vector)?;
    Ok(())
}

fn adc(regs: &mut CpuState, src: u8) {
    let carry = regs.get_flag(FLAG_CARRY) as u16;
    let sum = regs.a as u16 + src as u16 + carry;
    let result = sum as u8;
    regs.set_flag(
        FLAG_OVERFLOW,
        (!(regs.a ^ src) & (regs.a ^ result) & 0x80) != 0,
    );
    regs.set_flag(FLAG_CARRY, sum > 0xFF);
    regs.a = result;
    regs.update_zn(result);
}

fn sbc(regs: &mut CpuState, src: u8) {
    let borrow = 1 - regs.get_flag(FLAG_CARRY) as i16;
    let diff = regs.a as i16 - src as i16 - borrow;
    let result = diff as u8;
    regs.set_flag(
        FLAG_OVERFLOW,
        ((regs.a ^ src) & (regs.a ^ result) & 0x80) != 0,
    );
    regs.set_flag(FLAG_CARRY, diff >= 0);
    regs.a = result;
    regs.update_zn(result);
}

fn compare(regs: &mut CpuState, register: u8, value: u8) {
    regs.set_flag(FLAG_CARRY, register >= value);
    regs.update_zn(register.wrapping_sub(value));
}

/// Shift or rotate on A or memory, picked by the addressing mode.
fn read_modify_write(
    regs: &mut CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
    f: impl FnOnce(&mut CpuState, u8) -> u8,
) -> Result<(), CoreError> {
    if op.mode == AddressingMode::Accumulator {
        let value = regs.a;
        regs.a = f(regs, value);
        return Ok(());
    }
    let (addr, _) = resolve(regs, bus, op, operand)?;
    let value = bus.read(addr)?;
    let result = f(regs, value);
    bus.write(addr, result)
}

fn asl(regs: &mut CpuState, value: u8) -> u8 {
    regs.set_flag(FLAG_CARRY, (value & 0x80) != 0);
    let result = value << 1;
    regs.update_zn(result);
    result
}

fn lsr(regs: &mut CpuState, value: u8) -> u8 {
    regs.set_flag(FLAG_CARRY, (value & 0x01) != 0);
    let result = value >> 1;
    regs.update_zn(result);
    result
}

fn rol(regs: &mut CpuState, value: u8) -> u8 {
    let carry_in = regs.get_flag(FLAG_CARRY) as u8;
    regs.set_flag(FLAG_CARRY, (value & 0x80) != 0);
    let result = (value << 1) | carry_in;
    regs.update_zn(result);
    result
}

fn ror(regs: &mut CpuState, value: u8) -> u8 {
    let carry_in = (regs.get_flag(FLAG_CARRY) as u8) << 7;
    regs.set_flag(FLAG_CARRY, (value & 0x01) != 0);
    let result = (value >> 1) | carry_in;
    regs.update_zn(result);
    result
}

fn inc(regs: &mut CpuState, value: u8) -> u8 {
    let result = value.wrapping_add(1);
    regs.update_zn(result);
    result
}

fn dec(regs: &mut CpuState, value: u8) -> u8 {
    let result = value.wrapping_sub(1);
    regs.update_zn(result);
    result
}

fn branch(
    regs: &mut CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
    condition: bool,
) -> Result<Outcome, CoreError> {
    if !condition {
        return Ok(Outcome::default());
    }
    let (target, page_crossed) = resolve(regs, bus, op, operand)?;
    regs.pc = target;
    Ok(Outcome {
        jumped: true,
        page_crossed,
        branch_taken: true,
    })
}

/// Executes one decoded instruction against `regs`. `regs.pc` points at the
/// opcode on entry; PC is only written here when control flow changes.
fn execute(
    regs: &mut CpuState,
    bus: &mut CpuBus<'_>,
    op: &Opcode,
    operand: u16,
) -> Result<Outcome, CoreError> {
    let mut outcome = Outcome::default();
    match op.mnemonic {
        Mnemonic::Adc => {
            let (value, crossed) = load(regs, bus, op, operand)?;
            adc(regs, value);
            outcome.page_crossed = crossed;
        }
        Mnemonic::Sbc => {
            let (value, crossed) = load(regs, bus, op, operand)?;
            sbc(regs, value);
            outcome.page_crossed = crossed;
        }
        Mnemonic::And | Mnemonic::Ora | Mnemonic::Eor => {
            let (value, crossed) = load(regs, bus, op, operand)?;
            regs.a = match op.mnemonic {
                Mnemonic::And => regs.a & value,
                Mnemonic::Ora => regs.a | value,
                _ => regs.a ^ value,
            };
            regs.update_zn(regs.a);
            outcome.page_crossed = crossed;
        }
        Mnemonic::Cmp | Mnemonic::Cpx | Mnemonic::Cpy => {
            let (value, crossed) = load(regs, bus, op, operand)?;
            let register = match op.mnemonic {
                Mnemonic::Cmp => regs.a,
                Mnemonic::Cpx => regs.x,
                _ => regs.y,
            };
            compare(regs, register, value);
            outcome.page_crossed = crossed;
        }
        Mnemonic::Bit => {
            let (value, _) = load(regs, bus, op, operand)?;
            regs.set_flag(FLAG_ZERO, (regs.a & value) == 0);
            regs.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
            regs.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        }
        Mnemonic::Lda | Mnemonic::Ldx | Mnemonic::Ldy => {
            let (value, crossed) = load(regs, bus, op, operand)?;
            match op.mnemonic {
                Mnemonic::Lda => regs.a = value,
                Mnemonic::Ldx => regs.x = value,
                _ => regs.y = value,
            }
            regs.update_zn(value);
            outcome.page_crossed = crossed;
        }
        Mnemonic::Sta => store(regs, bus, op, operand, regs.a)?,
        Mnemonic::Stx => store(regs, bus, op, operand, regs.x)?,
        Mnemonic::Sty => store(regs, bus, op, operand, regs.y)?,

        Mnemonic::Asl => read_modify_write(regs, bus, op, operand, asl)?,
        Mnemonic::Lsr => read_modify_write(regs, bus, op, operand, lsr)?,
        Mnemonic::Rol => read_modify_write(regs, bus, op, operand, rol)?,
        Mnemonic::Ror => read_modify_write(regs, bus, op, operand, ror)?,
        Mnemonic::Inc => read_modify_write(regs, bus, op, operand, inc)?,
        Mnemonic::Dec => read_modify_write(regs, bus, op, operand, dec)?,

        Mnemonic::Inx => {
            let x = regs.x;
            regs.x = inc(regs, x);
        }
        Mnemonic::Iny => {
            let y = regs.y;
            regs.y = inc(regs, y);
        }
        Mnemonic::Dex => {
            let x = regs.x;
            regs.x = dec(regs, x);
        }
        Mnemonic::Dey => {
            let y = regs.y;
            regs.y = dec(regs, y);
        }

        Mnemonic::Tax => {
            regs.x = regs.a;
            regs.update_zn(regs.x);
        }
        Mnemonic::Tay => {
            regs.y = regs.a;
            regs.update_zn(regs.y);
        }
        Mnemonic::Txa => {
            regs.a = regs.x;
            regs.update_zn(regs.a);
        }
        Mnemonic::Tya => {
            regs.a = regs.y;
            regs.update_zn(regs.a);
        }
        Mnemonic::Tsx => {
            regs.x = regs.sp;
            regs.update_zn(regs.x);
        }
        Mnemonic::Txs => regs.sp = regs.x,

        Mnemonic::Pha => {
            let a = regs.a;
            push(regs, bus, a)?;
        }
        Mnemonic::Php => {
            let status = regs.status() | FLAG_BREAK;
            push(regs, bus, status)?;
        }
        Mnemonic::Pla => {
            regs.a = pop(regs, bus)?;
            regs.update_zn(regs.a);
        }
        Mnemonic::Plp => {
            let status = pop(regs, bus)?;
            regs.set_status(status);
        }

        Mnemonic::Jmp => {
            let (target, _) = resolve(regs, bus, op, operand)?;
            regs.pc = target;
            outcome.jumped = true;
        }
        Mnemonic::Jsr => {
            let return_addr = regs.pc.wrapping_add(2);
            push_u16(regs, bus, return_addr)?;
            regs.pc = operand;
            outcome.jumped = true;
        }
        Mnemonic::Rts => {
            regs.pc = pop_u16(regs, bus)?.wrapping_add(1);
            outcome.jumped = true;
        }
        Mnemonic::Rti => {
            let status = pop(regs, bus)?;
            regs.set_status(status);
            regs.pc = pop_u16(regs, bus)?;
            outcome.jumped = true;
        }
        Mnemonic::Brk => {
            let return_addr = regs.pc.wrapping_add(2);
            interrupt(regs, bus, return_addr, true, IRQ_VECTOR)?;
            outcome.jumped = true;
        }

        Mnemonic::Bcc
        | Mnemonic::Bcs
        | Mnemonic::Bne
        | Mnemonic::Beq
        | Mnemonic::Bpl
        | Mnemonic::Bmi
        | Mnemonic::Bvc
        | Mnemonic::Bvs => {
            let (flag, expected) = match op.mnemonic {
                Mnemonic::Bcc => (FLAG_CARRY, false),
                Mnemonic::Bcs => (FLAG_CARRY, true),
                Mnemonic::Bne => (FLAG_ZERO, false),
                Mnemonic::Beq => (FLAG_ZERO, true),
                Mnemonic::Bpl => (FLAG_NEGATIVE, false),
                Mnemonic::Bmi => (FLAG_NEGATIVE, true),
                Mnemonic::Bvc => (FLAG_OVERFLOW, false),
                _ => (FLAG_OVERFLOW, true),
            };
            let taken = regs.get_flag(flag) == expected;
            outcome = branch(regs, bus, op, operand, taken)?;
        }

        Mnemonic::Clc => regs.set_flag(FLAG_CARRY, false),
        Mnemonic::Sec => regs.set_flag(FLAG_CARRY, true),
        Mnemonic::Cli => regs.set_flag(FLAG_INTERRUPT, false),
        Mnemonic::Sei => regs.set_flag(FLAG_INTERRUPT, true),
        Mnemonic::Cld => regs.set_flag(FLAG_DECIMAL, false),
        Mnemonic::Sed => regs.set_flag(FLAG_DECIMAL, true),
        Mnemonic::Clv => regs.set_flag(FLAG_OVERFLOW, false),

        Mnemonic::Nop => {
            // Indexed NOP encodings still pay the page penalty, but nothing
            // is read so I/O registers see no access.
            if matches!(op.mode, AddressingMode::AbsoluteX | AddressingMode::AbsoluteY) {
                outcome.page_crossed = resolve(regs, bus, op, operand)?.1;
            }
        }

        Mnemonic::Slo
        | Mnemonic::Rla
        | Mnemonic::Sre
        | Mnemonic::Rra
        | Mnemonic::Sax
        | Mnemonic::Lax
        | Mnemonic::Dcp
        | Mnemonic::Isc
        | Mnemonic::Anc
        | Mnemonic::Alr
        | Mnemonic::Arr
        | Mnemonic::Xaa
        | Mnemonic::Axs
        | Mnemonic::Tas
        | Mnemonic::Shx
        | Mnemonic::Shy
        | Mnemonic::Ahx
        | Mnemonic::Las
        | Mnemonic::Kil => {}
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::mapper::Mapper0;
    use crate::nes::test_rom;

    const ORIGIN: u16 = 0x8000;

    struct Machine {
        cpu: Cpu,
        ppu: Ppu,
        mapper: Mapper0,
    }

    impl Machine {
        fn with_program(program: &[u8]) -> Self {
            let mut machine = Self {
                cpu: Cpu::new(),
                ppu: Ppu::new(),
                mapper: test_rom::nrom_mapper(program, ORIGIN),
            };
            machine.cpu.reset(&mut machine.ppu, &mut machine.mapper).unwrap();
            machine
        }

        fn step(&mut self) -> u32 {
            self.cpu.step(&mut self.ppu, &mut self.mapper).unwrap()
        }

        fn regs(&self) -> CpuState {
            self.cpu.regs
        }
    }

    #[test]
    fn reset_loads_vector_and_power_on_state() {
        let machine = Machine::with_program(&[0xEA]);
        let regs = machine.regs();
        assert_eq!(regs.pc, ORIGIN);
        assert_eq!(regs.sp, 0xFD);
        assert_eq!(regs.status(), 0x24);
    }

    #[test]
    fn adc_signed_overflow_boundary() {
        // LDA #$7F; CLC; ADC #$01
        let mut m = Machine::with_program(&[0xA9, 0x7F, 0x18, 0x69, 0x01]);
        m.step();
        m.step();
        m.step();
        let regs = m.regs();
        assert_eq!(regs.a, 0x80);
        assert!(regs.get_flag(FLAG_OVERFLOW));
        assert!(!regs.get_flag(FLAG_CARRY));
        assert!(regs.get_flag(FLAG_NEGATIVE));
        assert!(!regs.get_flag(FLAG_ZERO));
    }

    #[test]
    fn adc_carry_out_and_zero() {
        // LDA #$FF; SEC; ADC #$00
        let mut m = Machine::with_program(&[0xA9, 0xFF, 0x38, 0x69, 0x00]);
        m.step();
        m.step();
        m.step();
        let regs = m.regs();
        assert_eq!(regs.a, 0x00);
        assert!(regs.get_flag(FLAG_CARRY));
        assert!(regs.get_flag(FLAG_ZERO));
        assert!(!regs.get_flag(FLAG_OVERFLOW));
    }

    #[test]
    fn sbc_borrow_boundary() {
        // LDA #$00; SEC; SBC #$01
        let mut m = Machine::with_program(&[0xA9, 0x00, 0x38, 0xE9, 0x01]);
        m.step();
        m.step();
        m.step();
        let regs = m.regs();
        assert_eq!(regs.a, 0xFF);
        assert!(!regs.get_flag(FLAG_CARRY));
        assert!(regs.get_flag(FLAG_NEGATIVE));
        assert!(!regs.get_flag(FLAG_OVERFLOW));
    }

    #[test]
    fn sbc_signed_overflow() {
        // LDA #$80; SEC; SBC #$01 -> 0x7F, V set
        let mut m = Machine::with_program(&[0xA9, 0x80, 0x38, 0xE9, 0x01]);
        m.step();
        m.step();
        m.step();
        let regs = m.regs();
        assert_eq!(regs.a, 0x7F);
        assert!(regs.get_flag(FLAG_OVERFLOW));
        assert!(regs.get_flag(FLAG_CARRY));
    }

    #[test]
    fn compare_sets_carry_when_register_not_smaller() {
        // LDX #$10; CPX #$10; CPY #$01 (Y=0)
        let mut m = Machine::with_program(&[0xA2, 0x10, 0xE0, 0x10, 0xC0, 0x01]);
        m.step();
        m.step();
        assert!(m.regs().get_flag(FLAG_CARRY));
        assert!(m.regs().get_flag(FLAG_ZERO));
        m.step();
        assert!(!m.regs().get_flag(FLAG_CARRY));
        assert!(m.regs().get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn status_round_trip_drops_break_only() {
        for value in 0..=u8::MAX {
            let mut regs = CpuState::default();
            regs.set_status(value);
            assert_eq!(regs.status(), (value & !FLAG_BREAK) | FLAG_UNUSED);
            for flag in [
                FLAG_CARRY,
                FLAG_ZERO,
                FLAG_INTERRUPT,
                FLAG_DECIMAL,
                FLAG_OVERFLOW,
                FLAG_NEGATIVE,
            ] {
                assert_eq!(regs.get_flag(flag), (value & flag) != 0);
            }
            assert!(!regs.get_flag(FLAG_BREAK));
        }
    }

    #[test]
    fn php_pushes_break_and_plp_discards_it() {
        // PHP; PLA; PHA; PLP
        let mut m = Machine::with_program(&[0x08, 0x68, 0x48, 0x28]);
        m.step();
        m.step();
        assert_eq!(m.regs().a, 0x34);
        m.step();
        m.step();
        assert_eq!(m.regs().status(), 0x24);
        assert_eq!(m.regs().sp, 0xFD);
    }

    #[test]
    fn branch_timing() {
        // SEC; BCS +2 (same page); CLC; BCS +0 (not taken)
        let mut m = Machine::with_program(&[0x38, 0xB0, 0x02, 0xEA, 0xEA, 0x18, 0xB0, 0x00]);
        m.step();
        assert_eq!(m.step(), 3);
        assert_eq!(m.regs().pc, ORIGIN + 5);
        m.step();
        assert_eq!(m.step(), 2);
        assert_eq!(m.regs().pc, ORIGIN + 8);
    }

    #[test]
    fn branch_crossing_page_costs_two_extra() {
        // Program fills up to 0x80FB; BNE at 0x80FC jumps forward into 0x8100+.
        let mut program = vec![0xEA; 0xFC];
        program.extend_from_slice(&[0xD0, 0x10]);
        let mut m = Machine::with_program(&program);
        for _ in 0..0xFC {
            m.step();
        }
        assert_eq!(m.regs().pc, 0x80FC);
        assert_eq!(m.step(), 4);
        assert_eq!(m.regs().pc, 0x80FE + 0x10);
    }

    #[test]
    fn backward_branch_uses_signed_offset() {
        // LDX #$03; DEX; BNE -3
        let mut m = Machine::with_program(&[0xA2, 0x03, 0xCA, 0xD0, 0xFD]);
        for _ in 0..7 {
            m.step();
        }
        assert_eq!(m.regs().x, 0);
        assert_eq!(m.regs().pc, ORIGIN + 5);
    }

    #[test]
    fn absolute_indexed_read_pays_page_penalty() {
        // LDX #$FF; LDA $0201,X ; STA $0201,X
        let mut m = Machine::with_program(&[0xA2, 0xFF, 0xBD, 0x01, 0x02, 0x9D, 0x01, 0x02]);
        m.step();
        assert_eq!(m.step(), 5);
        assert_eq!(m.step(), 5);
    }

    #[test]
    fn indirect_indexed_reads_zero_page_pointer() {
        // LDY #$10; LDA ($FF),Y with pointer bytes at $FF/$00
        let mut m = Machine::with_program(&[0xA0, 0x10, 0xB1, 0xFF]);
        m.cpu.ram[0xFF] = 0xF8;
        m.cpu.ram[0x00] = 0x03;
        m.cpu.ram[0x0408] = 0x5C;
        m.step();
        assert_eq!(m.step(), 6);
        assert_eq!(m.regs().a, 0x5C);
    }

    #[test]
    fn indexed_indirect_wraps_in_zero_page() {
        // LDX #$01; LDA ($FE,X) reads pointer at $FF/$00
        let mut m = Machine::with_program(&[0xA2, 0x01, 0xA1, 0xFE]);
        m.cpu.ram[0xFF] = 0x34;
        m.cpu.ram[0x00] = 0x02;
        m.cpu.ram[0x0234] = 0x99;
        m.step();
        m.step();
        assert_eq!(m.regs().a, 0x99);
    }

    #[test]
    fn zero_page_x_wraps() {
        // LDX #$02; LDA $FF,X reads $01
        let mut m = Machine::with_program(&[0xA2, 0x02, 0xB5, 0xFF]);
        m.cpu.ram[0x01] = 0x66;
        m.step();
        m.step();
        assert_eq!(m.regs().a, 0x66);
    }

    #[test]
    fn jmp_indirect_page_wrap_bug() {
        let mut m = Machine::with_program(&[0x6C, 0xFF, 0x02]);
        m.cpu.ram[0x02FF] = 0x00;
        m.cpu.ram[0x0200] = 0x90;
        m.cpu.ram[0x0300] = 0x12;
        assert_eq!(m.step(), 5);
        assert_eq!(m.regs().pc, 0x9000);
    }

    #[test]
    fn jsr_rts_round_trip() {
        // JSR $8005; NOP; NOP; RTS at $8005
        let mut m = Machine::with_program(&[0x20, 0x05, 0x80, 0xEA, 0xEA, 0x60]);
        assert_eq!(m.step(), 6);
        assert_eq!(m.regs().pc, 0x8005);
        assert_eq!(m.cpu.ram[0x01FD], 0x80);
        assert_eq!(m.cpu.ram[0x01FC], 0x02);
        assert_eq!(m.step(), 6);
        assert_eq!(m.regs().pc, 0x8003);
        assert_eq!(m.regs().sp, 0xFD);
    }

    #[test]
    fn stack_wraps_after_256_pushes() {
        // LDX #$FF; TXS; then 256 x PHA
        let mut program = vec![0xA2, 0xFF, 0x9A, 0xA9, 0x00];
        program.extend(std::iter::repeat_n(0x48, 256));
        let mut m = Machine::with_program(&program);
        m.step();
        m.step();
        m.step();
        for _ in 0..256 {
            m.step();
        }
        assert_eq!(m.regs().sp, 0xFF);

        // One more push lands on the first slot again.
        let mut regs = m.cpu.regs;
        let mut bus = m.cpu.bus(&mut m.ppu, &mut m.mapper);
        push(&mut regs, &mut bus, 0xAB).unwrap();
        assert_eq!(m.cpu.ram[0x01FF], 0xAB);
        assert_eq!(regs.sp, 0xFE);
    }

    #[test]
    fn brk_pushes_pc_plus_two_with_break_set() {
        let mut m = Machine::with_program(&[0x00, 0xEA]);
        let irq_handler = m.mapper.cpu_peek(IRQ_VECTOR) as u16
            | (m.mapper.cpu_peek(IRQ_VECTOR + 1) as u16) << 8;
        assert_eq!(m.step(), 7);
        let regs = m.regs();
        assert_eq!(regs.pc, irq_handler);
        assert!(regs.get_flag(FLAG_INTERRUPT));
        assert!(!regs.get_flag(FLAG_BREAK));
        assert_eq!(m.cpu.ram[0x01FD], 0x80);
        assert_eq!(m.cpu.ram[0x01FC], 0x02);
        assert_eq!(m.cpu.ram[0x01FB], 0x34);
    }

    #[test]
    fn rti_restores_status_and_pc() {
        // BRK lands on the IRQ handler, which is a bare RTI.
        let mut m = Machine::with_program(&[0x38, 0x00, 0xEA, 0xEA]);
        m.step();
        m.step();
        assert_eq!(m.step(), 6);
        assert_eq!(m.regs().pc, ORIGIN + 3);
        assert!(m.regs().get_flag(FLAG_CARRY));
        assert!(!m.regs().get_flag(FLAG_BREAK));
        assert_eq!(m.regs().sp, 0xFD);
    }

    #[test]
    fn nmi_pushes_status_without_break_and_costs_nothing() {
        let mut m = Machine::with_program(&[0x58, 0xEA]);
        m.step();
        let ticks = m.cpu.ticks();
        m.cpu.trigger_nmi(&mut m.ppu, &mut m.mapper).unwrap();
        assert_eq!(m.cpu.ticks(), ticks);
        assert_eq!(m.regs().pc, test_rom::NMI_HANDLER);
        assert_eq!(m.cpu.ram[0x01FB] & FLAG_BREAK, 0);
        assert_eq!(m.cpu.ram[0x01FB] & FLAG_UNUSED, FLAG_UNUSED);
        assert!(m.regs().get_flag(FLAG_INTERRUPT));
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        let mut m = Machine::with_program(&[0x58, 0xEA]);
        assert!(!m.cpu.trigger_irq(&mut m.ppu, &mut m.mapper).unwrap());
        m.step();
        assert!(m.cpu.trigger_irq(&mut m.ppu, &mut m.mapper).unwrap());
        assert_eq!(m.regs().pc, test_rom::IRQ_HANDLER);
    }

    #[test]
    fn oam_dma_stalls_for_512_single_ticks() {
        // LDA #$02; STA $4014; NOP
        let mut m = Machine::with_program(&[0xA9, 0x02, 0x8D, 0x14, 0x40, 0xEA]);
        m.step();
        assert_eq!(m.step(), 4);
        assert_eq!(m.cpu.stall_cycles(), 512);
        for _ in 0..512 {
            assert_eq!(m.step(), 1);
        }
        assert_eq!(m.regs().pc, ORIGIN + 5);
        assert_eq!(m.step(), 2);
        assert_eq!(m.regs().pc, ORIGIN + 6);
    }

    #[test]
    fn unofficial_opcode_is_noop_with_diagnostic() {
        // SLO $10 ; NOP
        let mut m = Machine::with_program(&[0x07, 0x10, 0xEA]);
        m.cpu.ram[0x10] = 0x81;
        assert_eq!(m.step(), 5);
        assert_eq!(m.regs().pc, ORIGIN + 2);
        assert_eq!(m.cpu.ram[0x10], 0x81);
        assert_eq!(m.regs().a, 0);
        assert_eq!(
            m.cpu.take_diagnostics(),
            vec![Diagnostic::UnofficialOpcode {
                opcode: 0x07,
                pc: ORIGIN,
                mnemonic: "SLO",
            }]
        );
        assert!(m.cpu.take_diagnostics().is_empty());
    }

    #[test]
    fn alternate_sbc_encoding_behaves_like_sbc() {
        // SEC; LDA #$05; SBC #$03 via 0xEB
        let mut m = Machine::with_program(&[0x38, 0xA9, 0x05, 0xEB, 0x03]);
        m.step();
        m.step();
        m.step();
        assert_eq!(m.regs().a, 0x02);
        assert!(m.cpu.take_diagnostics().is_empty());
    }

    #[test]
    fn shifts_on_memory_and_accumulator() {
        // LDA #$81; ASL A; ROR $20 (mem=0x01, C=1)
        let mut m = Machine::with_program(&[0xA9, 0x81, 0x0A, 0x66, 0x20]);
        m.cpu.ram[0x20] = 0x01;
        m.step();
        m.step();
        assert_eq!(m.regs().a, 0x02);
        assert!(m.regs().get_flag(FLAG_CARRY));
        m.step();
        assert_eq!(m.cpu.ram[0x20], 0x80);
        assert!(m.regs().get_flag(FLAG_CARRY));
        assert!(m.regs().get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn bit_copies_high_bits_into_flags() {
        // LDA #$01; BIT $30
        let mut m = Machine::with_program(&[0xA9, 0x01, 0x24, 0x30]);
        m.cpu.ram[0x30] = 0xC0;
        m.step();
        m.step();
        assert!(m.regs().get_flag(FLAG_ZERO));
        assert!(m.regs().get_flag(FLAG_OVERFLOW));
        assert!(m.regs().get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn trace_line_matches_reference_columns() {
        let m = Machine::with_program(&[0x4C, 0xF5, 0xC5]);
        let line = m.cpu.trace_line(&m.ppu, &m.mapper);
        assert_eq!(&line[0..14], "8000  4C F5 C5");
        assert_eq!(&line[16..19], "JMP");
        assert_eq!(&line[48..73], "A:00 X:00 Y:00 P:24 SP:FD");

        let implied = Machine::with_program(&[0xEA]);
        let line = implied.cpu.trace_line(&implied.ppu, &implied.mapper);
        assert_eq!(&line[0..14], "8000  EA      ");
    }
}
