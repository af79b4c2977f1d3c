//! Static decode table for the 6502 as wired in the NES (no decimal mode).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndexedIndirect,
    IndirectIndexed,
    Relative,
}

impl AddressingMode {
    /// Instruction length in bytes, opcode included.
    pub const fn instruction_len(self) -> u8 {
        match self {
            Self::Implied | Self::Accumulator => 1,
            Self::Immediate
            | Self::ZeroPage
            | Self::ZeroPageX
            | Self::ZeroPageY
            | Self::IndexedIndirect
            | Self::IndirectIndexed
            | Self::Relative => 2,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY | Self::Indirect => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    // Undocumented
    Slo,
    Rla,
    Sre,
    Rra,
    Sax,
    Lax,
    Dcp,
    Isc,
    Anc,
    Alr,
    Arr,
    Xaa,
    Axs,
    Tas,
    Shx,
    Shy,
    Ahx,
    Las,
    Kil,
}

impl Mnemonic {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Adc => "ADC",
            Self::And => "AND",
            Self::Asl => "ASL",
            Self::Bcc => "BCC",
            Self::Bcs => "BCS",
            Self::Beq => "BEQ",
            Self::Bit => "BIT",
            Self::Bmi => "BMI",
            Self::Bne => "BNE",
            Self::Bpl => "BPL",
            Self::Brk => "BRK",
            Self::Bvc => "BVC",
            Self::Bvs => "BVS",
            Self::Clc => "CLC",
            Self::Cld => "CLD",
            Self::Cli => "CLI",
            Self::Clv => "CLV",
            Self::Cmp => "CMP",
            Self::Cpx => "CPX",
            Self::Cpy => "CPY",
            Self::Dec => "DEC",
            Self::Dex => "DEX",
            Self::Dey => "DEY",
            Self::Eor => "EOR",
            Self::Inc => "INC",
            Self::Inx => "INX",
            Self::Iny => "INY",
            Self::Jmp => "JMP",
            Self::Jsr => "JSR",
            Self::Lda => "LDA",
            Self::Ldx => "LDX",
            Self::Ldy => "LDY",
            Self::Lsr => "LSR",
            Self::Nop => "NOP",
            Self::Ora => "ORA",
            Self::Pha => "PHA",
            Self::Php => "PHP",
            Self::Pla => "PLA",
            Self::Plp => "PLP",
            Self::Rol => "ROL",
            Self::Ror => "ROR",
            Self::Rti => "RTI",
            Self::Rts => "RTS",
            Self::Sbc => "SBC",
            Self::Sec => "SEC",
            Self::Sed => "SED",
            Self::Sei => "SEI",
            Self::Sta => "STA",
            Self::Stx => "STX",
            Self::Sty => "STY",
            Self::Tax => "TAX",
            Self::Tay => "TAY",
            Self::Tsx => "TSX",
            Self::Txa => "TXA",
            Self::Txs => "TXS",
            Self::Tya => "TYA",
            Self::Slo => "SLO",
            Self::Rla => "RLA",
            Self::Sre => "SRE",
            Self::Rra => "RRA",
            Self::Sax => "SAX",
            Self::Lax => "LAX",
            Self::Dcp => "DCP",
            Self::Isc => "ISC",
            Self::Anc => "ANC",
            Self::Alr => "ALR",
            Self::Arr => "ARR",
            Self::Xaa => "XAA",
            Self::Axs => "AXS",
            Self::Tas => "TAS",
            Self::Shx => "SHX",
            Self::Shy => "SHY",
            Self::Ahx => "AHX",
            Self::Las => "LAS",
            Self::Kil => "KIL",
        }
    }

    /// False for the undocumented operation classes. Unofficial encodings of
    /// NOP and SBC decode to the official class and report true.
    pub const fn is_official(self) -> bool {
        !matches!(
            self,
            Self::Slo
                | Self::Rla
                | Self::Sre
                | Self::Rra
                | Self::Sax
                | Self::Lax
                | Self::Dcp
                | Self::Isc
                | Self::Anc
                | Self::Alr
                | Self::Arr
                | Self::Xaa
                | Self::Axs
                | Self::Tas
                | Self::Shx
                | Self::Shy
                | Self::Ahx
                | Self::Las
                | Self::Kil
        )
    }

    pub const fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Bcc | Self::Bcs | Self::Beq | Self::Bmi | Self::Bne | Self::Bpl | Self::Bvc | Self::Bvs
        )
    }
}

/// One row of the decode table.
///
/// `page_cycles` is the penalty paid when the effective address crosses a
/// page. For branches it is the extra cycle paid when a taken branch lands on
/// a different page than the fall-through address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub mnemonic: Mnemonic,
    pub mode: AddressingMode,
    pub len: u8,
    pub cycles: u8,
    pub page_cycles: u8,
}

const fn op(mnemonic: Mnemonic, mode: AddressingMode, cycles: u8, page_cycles: u8) -> Opcode {
    Opcode {
        mnemonic,
        mode,
        len: mode.instruction_len(),
        cycles,
        page_cycles,
    }
}

pub fn lookup(opcode: u8) -> &'static Opcode {
    &OPCODES[opcode as usize]
}

pub static OPCODES: [Opcode; 256] = {
    use AddressingMode::{
        Absolute as Abs, AbsoluteX as Abx, AbsoluteY as Aby, Accumulator as Acc,
        Immediate as Imm, Implied as Imp, IndexedIndirect as Izx, Indirect as Ind,
        IndirectIndexed as Izy, Relative as Rel, ZeroPage as Zp, ZeroPageX as Zpx,
        ZeroPageY as Zpy,
    };
    use Mnemonic::*;
    [
        // 00
        op(Brk, Imp, 7, 0), op(Ora, Izx, 6, 0), op(Kil, Imp, 2, 0), op(Slo, Izx, 8, 0),
        op(Nop, Zp, 3, 0), op(Ora, Zp, 3, 0), op(Asl, Zp, 5, 0), op(Slo, Zp, 5, 0),
        op(Php, Imp, 3, 0), op(Ora, Imm, 2, 0), op(Asl, Acc, 2, 0), op(Anc, Imm, 2, 0),
        op(Nop, Abs, 4, 0), op(Ora, Abs, 4, 0), op(Asl, Abs, 6, 0), op(Slo, Abs, 6, 0),
        // 10
        op(Bpl, Rel, 2, 1), op(Ora, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Slo, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(Ora, Zpx, 4, 0), op(Asl, Zpx, 6, 0), op(Slo, Zpx, 6, 0),
        op(Clc, Imp, 2, 0), op(Ora, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Slo, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(Ora, Abx, 4, 1), op(Asl, Abx, 7, 0), op(Slo, Abx, 7, 0),
        // 20
        op(Jsr, Abs, 6, 0), op(And, Izx, 6, 0), op(Kil, Imp, 2, 0), op(Rla, Izx, 8, 0),
        op(Bit, Zp, 3, 0), op(And, Zp, 3, 0), op(Rol, Zp, 5, 0), op(Rla, Zp, 5, 0),
        op(Plp, Imp, 4, 0), op(And, Imm, 2, 0), op(Rol, Acc, 2, 0), op(Anc, Imm, 2, 0),
        op(Bit, Abs, 4, 0), op(And, Abs, 4, 0), op(Rol, Abs, 6, 0), op(Rla, Abs, 6, 0),
        // 30
        op(Bmi, Rel, 2, 1), op(And, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Rla, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(And, Zpx, 4, 0), op(Rol, Zpx, 6, 0), op(Rla, Zpx, 6, 0),
        op(Sec, Imp, 2, 0), op(And, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Rla, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(And, Abx, 4, 1), op(Rol, Abx, 7, 0), op(Rla, Abx, 7, 0),
        // 40
        op(Rti, Imp, 6, 0), op(Eor, Izx, 6, 0), op(Kil, Imp, 2, 0), op(Sre, Izx, 8, 0),
        op(Nop, Zp, 3, 0), op(Eor, Zp, 3, 0), op(Lsr, Zp, 5, 0), op(Sre, Zp, 5, 0),
        op(Pha, Imp, 3, 0), op(Eor, Imm, 2, 0), op(Lsr, Acc, 2, 0), op(Alr, Imm, 2, 0),
        op(Jmp, Abs, 3, 0), op(Eor, Abs, 4, 0), op(Lsr, Abs, 6, 0), op(Sre, Abs, 6, 0),
        // 50
        op(Bvc, Rel, 2, 1), op(Eor, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Sre, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(Eor, Zpx, 4, 0), op(Lsr, Zpx, 6, 0), op(Sre, Zpx, 6, 0),
        op(Cli, Imp, 2, 0), op(Eor, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Sre, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(Eor, Abx, 4, 1), op(Lsr, Abx, 7, 0), op(Sre, Abx, 7, 0),
        // 60
        op(Rts, Imp, 6, 0), op(Adc, Izx, 6, 0), op(Kil, Imp, 2, 0), op(Rra, Izx, 8, 0),
        op(Nop, Zp, 3, 0), op(Adc, Zp, 3, 0), op(Ror, Zp, 5, 0), op(Rra, Zp, 5, 0),
        op(Pla, Imp, 4, 0), op(Adc, Imm, 2, 0), op(Ror, Acc, 2, 0), op(Arr, Imm, 2, 0),
        op(Jmp, Ind, 5, 0), op(Adc, Abs, 4, 0), op(Ror, Abs, 6, 0), op(Rra, Abs, 6, 0),
        // 70
        op(Bvs, Rel, 2, 1), op(Adc, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Rra, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(Adc, Zpx, 4, 0), op(Ror, Zpx, 6, 0), op(Rra, Zpx, 6, 0),
        op(Sei, Imp, 2, 0), op(Adc, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Rra, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(Adc, Abx, 4, 1), op(Ror, Abx, 7, 0), op(Rra, Abx, 7, 0),
        // 80
        op(Nop, Imm, 2, 0), op(Sta, Izx, 6, 0), op(Nop, Imm, 2, 0), op(Sax, Izx, 6, 0),
        op(Sty, Zp, 3, 0), op(Sta, Zp, 3, 0), op(Stx, Zp, 3, 0), op(Sax, Zp, 3, 0),
        op(Dey, Imp, 2, 0), op(Nop, Imm, 2, 0), op(Txa, Imp, 2, 0), op(Xaa, Imm, 2, 0),
        op(Sty, Abs, 4, 0), op(Sta, Abs, 4, 0), op(Stx, Abs, 4, 0), op(Sax, Abs, 4, 0),
        // 90
        op(Bcc, Rel, 2, 1), op(Sta, Izy, 6, 0), op(Kil, Imp, 2, 0), op(Ahx, Izy, 6, 0),
        op(Sty, Zpx, 4, 0), op(Sta, Zpx, 4, 0), op(Stx, Zpy, 4, 0), op(Sax, Zpy, 4, 0),
        op(Tya, Imp, 2, 0), op(Sta, Aby, 5, 0), op(Txs, Imp, 2, 0), op(Tas, Aby, 5, 0),
        op(Shy, Abx, 5, 0), op(Sta, Abx, 5, 0), op(Shx, Aby, 5, 0), op(Ahx, Aby, 5, 0),
        // A0
        op(Ldy, Imm, 2, 0), op(Lda, Izx, 6, 0), op(Ldx, Imm, 2, 0), op(Lax, Izx, 6, 0),
        op(Ldy, Zp, 3, 0), op(Lda, Zp, 3, 0), op(Ldx, Zp, 3, 0), op(Lax, Zp, 3, 0),
        op(Tay, Imp, 2, 0), op(Lda, Imm, 2, 0), op(Tax, Imp, 2, 0), op(Lax, Imm, 2, 0),
        op(Ldy, Abs, 4, 0), op(Lda, Abs, 4, 0), op(Ldx, Abs, 4, 0), op(Lax, Abs, 4, 0),
        // B0
        op(Bcs, Rel, 2, 1), op(Lda, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Lax, Izy, 5, 1),
        op(Ldy, Zpx, 4, 0), op(Lda, Zpx, 4, 0), op(Ldx, Zpy, 4, 0), op(Lax, Zpy, 4, 0),
        op(Clv, Imp, 2, 0), op(Lda, Aby, 4, 1), op(Tsx, Imp, 2, 0), op(Las, Aby, 4, 1),
        op(Ldy, Abx, 4, 1), op(Lda, Abx, 4, 1), op(Ldx, Aby, 4, 1), op(Lax, Aby, 4, 1),
        // C0
        op(Cpy, Imm, 2, 0), op(Cmp, Izx, 6, 0), op(Nop, Imm, 2, 0), op(Dcp, Izx, 8, 0),
        op(Cpy, Zp, 3, 0), op(Cmp, Zp, 3, 0), op(Dec, Zp, 5, 0), op(Dcp, Zp, 5, 0),
        op(Iny, Imp, 2, 0), op(Cmp, Imm, 2, 0), op(Dex, Imp, 2, 0), op(Axs, Imm, 2, 0),
        op(Cpy, Abs, 4, 0), op(Cmp, Abs, 4, 0), op(Dec, Abs, 6, 0), op(Dcp, Abs, 6, 0),
        // D0
        op(Bne, Rel, 2, 1), op(Cmp, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Dcp, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(Cmp, Zpx, 4, 0), op(Dec, Zpx, 6, 0), op(Dcp, Zpx, 6, 0),
        op(Cld, Imp, 2, 0), op(Cmp, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Dcp, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(Cmp, Abx, 4, 1), op(Dec, Abx, 7, 0), op(Dcp, Abx, 7, 0),
        // E0
        op(Cpx, Imm, 2, 0), op(Sbc, Izx, 6, 0), op(Nop, Imm, 2, 0), op(Isc, Izx, 8, 0),
        op(Cpx, Zp, 3, 0), op(Sbc, Zp, 3, 0), op(Inc, Zp, 5, 0), op(Isc, Zp, 5, 0),
        op(Inx, Imp, 2, 0), op(Sbc, Imm, 2, 0), op(Nop, Imp, 2, 0), op(Sbc, Imm, 2, 0),
        op(Cpx, Abs, 4, 0), op(Sbc, Abs, 4, 0), op(Inc, Abs, 6, 0), op(Isc, Abs, 6, 0),
        // F0
        op(Beq, Rel, 2, 1), op(Sbc, Izy, 5, 1), op(Kil, Imp, 2, 0), op(Isc, Izy, 8, 0),
        op(Nop, Zpx, 4, 0), op(Sbc, Zpx, 4, 0), op(Inc, Zpx, 6, 0), op(Isc, Zpx, 6, 0),
        op(Sed, Imp, 2, 0), op(Sbc, Aby, 4, 1), op(Nop, Imp, 2, 0), op(Isc, Aby, 7, 0),
        op(Nop, Abx, 4, 1), op(Sbc, Abx, 4, 1), op(Inc, Abx, 7, 0), op(Isc, Abx, 7, 0),    ]
};
