//! Instruction decoding.

use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{opcode::Opcode, Arch, VmFault};

/// A decoded MIPS instruction.
///
/// The raw word is kept alongside the opcode; operands are extracted on demand since the
/// executor needs different views of the same bits depending on the opcode.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The operation to execute.
    pub opcode: Opcode,
    /// The 32-bit instruction word.
    pub raw: u32,
}

impl Instruction {
    /// Primary opcode, bits 31..26.
    #[must_use]
    #[inline]
    pub const fn op(&self) -> u32 {
        self.raw >> 26
    }

    /// Function field of R-type and SPECIAL2 instructions.
    #[must_use]
    #[inline]
    pub const fn fun(&self) -> u32 {
        self.raw & 0x3F
    }

    #[must_use]
    #[inline]
    pub const fn rs(&self) -> usize {
        ((self.raw >> 21) & 0x1F) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rt(&self) -> usize {
        ((self.raw >> 16) & 0x1F) as usize
    }

    #[must_use]
    #[inline]
    pub const fn rd(&self) -> usize {
        ((self.raw >> 11) & 0x1F) as usize
    }

    /// Shift amount.
    #[must_use]
    #[inline]
    pub const fn sa(&self) -> u32 {
        (self.raw >> 6) & 0x1F
    }

    #[must_use]
    #[inline]
    pub const fn imm(&self) -> u64 {
        (self.raw & 0xFFFF) as u64
    }

    /// Jump target field, bits 25..0.
    #[must_use]
    #[inline]
    pub const fn target(&self) -> u64 {
        (self.raw & 0x03FF_FFFF) as u64
    }

    #[must_use]
    #[inline]
    pub fn is_syscall(&self) -> bool {
        self.opcode == Opcode::SYSCALL
    }

    /// Decodes an instruction word for `arch`.
    ///
    /// Encodings outside the supported subset, and MIPS64 encodings on a 32-bit target, are
    /// rejected with [`VmFault::InvalidInstruction`].
    pub fn decode(arch: Arch, insn: u32) -> Result<Self, VmFault> {
        let op = insn >> 26;
        let fun = insn & 0x3F;
        let rt = (insn >> 16) & 0x1F;
        log::trace!("decode: insn {insn:08X}, opcode {op:#04x}, fun {fun:#04x}");

        let opcode = match op {
            0x00 => match fun {
                0x00 => Opcode::SLL,
                0x02 => Opcode::SRL,
                0x03 => Opcode::SRA,
                0x04 => Opcode::SLLV,
                0x06 => Opcode::SRLV,
                0x07 => Opcode::SRAV,
                0x08 => Opcode::JR,
                0x09 => Opcode::JALR,
                0x0A => Opcode::MOVZ,
                0x0B => Opcode::MOVN,
                0x0C => Opcode::SYSCALL,
                0x0F => Opcode::SYNC,
                0x10 => Opcode::MFHI,
                0x11 => Opcode::MTHI,
                0x12 => Opcode::MFLO,
                0x13 => Opcode::MTLO,
                0x14 => Opcode::DSLLV,
                0x16 => Opcode::DSRLV,
                0x17 => Opcode::DSRAV,
                0x18 => Opcode::MULT,
                0x19 => Opcode::MULTU,
                0x1A => Opcode::DIV,
                0x1B => Opcode::DIVU,
                0x1C => Opcode::DMULT,
                0x1D => Opcode::DMULTU,
                0x1E => Opcode::DDIV,
                0x1F => Opcode::DDIVU,
                0x20 => Opcode::ADD,
                0x21 => Opcode::ADDU,
                0x22 => Opcode::SUB,
                0x23 => Opcode::SUBU,
                0x24 => Opcode::AND,
                0x25 => Opcode::OR,
                0x26 => Opcode::XOR,
                0x27 => Opcode::NOR,
                0x2A => Opcode::SLT,
                0x2B => Opcode::SLTU,
                0x2C => Opcode::DADD,
                0x2D => Opcode::DADDU,
                0x2E => Opcode::DSUB,
                0x2F => Opcode::DSUBU,
                0x38 => Opcode::DSLL,
                0x3A => Opcode::DSRL,
                0x3B => Opcode::DSRA,
                0x3C => Opcode::DSLL32,
                0x3E => Opcode::DSRL32,
                0x3F => Opcode::DSRA32,
                _ => return Err(invalid(insn)),
            },
            0x01 => match rt {
                0x00 => Opcode::BLTZ,
                0x01 => Opcode::BGEZ,
                0x10 => Opcode::BLTZAL,
                0x11 => Opcode::BGEZAL,
                _ => Opcode::BNEVER,
            },
            0x02 => Opcode::J,
            0x03 => Opcode::JAL,
            0x04 => Opcode::BEQ,
            0x05 => Opcode::BNE,
            0x06 => Opcode::BLEZ,
            0x07 => Opcode::BGTZ,
            0x08 => Opcode::ADDI,
            0x09 => Opcode::ADDIU,
            0x0A => Opcode::SLTI,
            0x0B => Opcode::SLTIU,
            0x0C => Opcode::ANDI,
            0x0D => Opcode::ORI,
            0x0E => Opcode::XORI,
            0x0F => Opcode::LUI,
            0x18 => Opcode::DADDI,
            0x19 => Opcode::DADDIU,
            0x1A => Opcode::LDL,
            0x1B => Opcode::LDR,
            0x1C => match fun {
                0x02 => Opcode::MUL,
                0x20 => Opcode::CLZ,
                0x21 => Opcode::CLO,
                _ => return Err(invalid(insn)),
            },
            0x20 => Opcode::LB,
            0x21 => Opcode::LH,
            0x22 => Opcode::LWL,
            0x23 => Opcode::LW,
            0x24 => Opcode::LBU,
            0x25 => Opcode::LHU,
            0x26 => Opcode::LWR,
            0x27 => Opcode::LWU,
            0x28 => Opcode::SB,
            0x29 => Opcode::SH,
            0x2A => Opcode::SWL,
            0x2B => Opcode::SW,
            0x2C => Opcode::SDL,
            0x2D => Opcode::SDR,
            0x2E => Opcode::SWR,
            0x30 => Opcode::LL,
            0x34 => Opcode::LLD,
            0x37 => Opcode::LD,
            0x38 => Opcode::SC,
            0x3C => Opcode::SCD,
            0x3F => Opcode::SD,
            _ => return Err(invalid(insn)),
        };

        if arch.is_mips32() && opcode.is_mips64_only() {
            return Err(invalid(insn));
        }
        Ok(Self { opcode, raw: insn })
    }
}

fn invalid(insn: u32) -> VmFault {
    log::debug!("decode: invalid instruction {insn:08x}");
    VmFault::InvalidInstruction(insn)
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mnemonic = self.opcode.mnemonic();
        let width = 10;
        write!(
            f,
            "{mnemonic:<width$} rs=${:<3} rt=${:<3} rd=${:<3} imm={:#06x} ({:08x})",
            self.rs(),
            self.rt(),
            self.rd(),
            self.imm(),
            self.raw
        )
    }
}
