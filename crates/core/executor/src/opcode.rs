//! Opcodes of the MIPS32/MIPS64 subset executed by Cannon.

use std::fmt::Display;

use enum_map::Enum;
use serde::{Deserialize, Serialize};

/// An opcode (short for "operation code") specifies the operation to be performed by the processor.
///
/// Immediate forms that share semantics with a register form (e.g. `addi` and `add`) keep their
/// own variant so execution reports stay precise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Enum,
)]
#[repr(u8)]
pub enum Opcode {
    // ALU
    ADD,
    ADDU,
    SUB,
    SUBU,
    ADDI,
    ADDIU,
    AND,
    OR,
    XOR,
    NOR,
    ANDI,
    ORI,
    XORI,
    SLT,
    SLTU,
    SLTI,
    SLTIU,
    LUI,
    SLL,
    SRL,
    SRA,
    SLLV,
    SRLV,
    SRAV,
    MUL,
    CLZ,
    CLO,
    // HI/LO
    MFHI,
    MTHI,
    MFLO,
    MTLO,
    MULT,
    MULTU,
    DIV,
    DIVU,
    // Conditional moves
    MOVZ,
    MOVN,
    // MIPS64 ALU
    DADD,
    DADDU,
    DSUB,
    DSUBU,
    DADDI,
    DADDIU,
    DSLL,
    DSRL,
    DSRA,
    DSLL32,
    DSRL32,
    DSRA32,
    DSLLV,
    DSRLV,
    DSRAV,
    DMULT,
    DMULTU,
    DDIV,
    DDIVU,
    // Control flow
    BEQ,
    BNE,
    BLEZ,
    BGTZ,
    BLTZ,
    BGEZ,
    BLTZAL,
    BGEZAL,
    /// A REGIMM encoding with an unassigned `rt`: behaves as a branch that is never taken.
    BNEVER,
    J,
    JAL,
    JR,
    JALR,
    // Memory
    LB,
    LBU,
    LH,
    LHU,
    LW,
    LWL,
    LWR,
    LWU,
    LD,
    LDL,
    LDR,
    SB,
    SH,
    SW,
    SWL,
    SWR,
    SD,
    SDL,
    SDR,
    // Read-modify-write
    LL,
    SC,
    LLD,
    SCD,
    // System
    SYNC,
    SYSCALL,
}

impl Opcode {
    /// Get the mnemonic for the opcode.
    #[must_use]
    pub const fn mnemonic(&self) -> &str {
        match self {
            Opcode::ADD => "add",
            Opcode::ADDU => "addu",
            Opcode::SUB => "sub",
            Opcode::SUBU => "subu",
            Opcode::ADDI => "addi",
            Opcode::ADDIU => "addiu",
            Opcode::AND => "and",
            Opcode::OR => "or",
            Opcode::XOR => "xor",
            Opcode::NOR => "nor",
            Opcode::ANDI => "andi",
            Opcode::ORI => "ori",
            Opcode::XORI => "xori",
            Opcode::SLT => "slt",
            Opcode::SLTU => "sltu",
            Opcode::SLTI => "slti",
            Opcode::SLTIU => "sltiu",
            Opcode::LUI => "lui",
            Opcode::SLL => "sll",
            Opcode::SRL => "srl",
            Opcode::SRA => "sra",
            Opcode::SLLV => "sllv",
            Opcode::SRLV => "srlv",
            Opcode::SRAV => "srav",
            Opcode::MUL => "mul",
            Opcode::CLZ => "clz",
            Opcode::CLO => "clo",
            Opcode::MFHI => "mfhi",
            Opcode::MTHI => "mthi",
            Opcode::MFLO => "mflo",
            Opcode::MTLO => "mtlo",
            Opcode::MULT => "mult",
            Opcode::MULTU => "multu",
            Opcode::DIV => "div",
            Opcode::DIVU => "divu",
            Opcode::MOVZ => "movz",
            Opcode::MOVN => "movn",
            Opcode::DADD => "dadd",
            Opcode::DADDU => "daddu",
            Opcode::DSUB => "dsub",
            Opcode::DSUBU => "dsubu",
            Opcode::DADDI => "daddi",
            Opcode::DADDIU => "daddiu",
            Opcode::DSLL => "dsll",
            Opcode::DSRL => "dsrl",
            Opcode::DSRA => "dsra",
            Opcode::DSLL32 => "dsll32",
            Opcode::DSRL32 => "dsrl32",
            Opcode::DSRA32 => "dsra32",
            Opcode::DSLLV => "dsllv",
            Opcode::DSRLV => "dsrlv",
            Opcode::DSRAV => "dsrav",
            Opcode::DMULT => "dmult",
            Opcode::DMULTU => "dmultu",
            Opcode::DDIV => "ddiv",
            Opcode::DDIVU => "ddivu",
            Opcode::BEQ => "beq",
            Opcode::BNE => "bne",
            Opcode::BLEZ => "blez",
            Opcode::BGTZ => "bgtz",
            Opcode::BLTZ => "bltz",
            Opcode::BGEZ => "bgez",
            Opcode::BLTZAL => "bltzal",
            Opcode::BGEZAL => "bgezal",
            Opcode::BNEVER => "bnever",
            Opcode::J => "j",
            Opcode::JAL => "jal",
            Opcode::JR => "jr",
            Opcode::JALR => "jalr",
            Opcode::LB => "lb",
            Opcode::LBU => "lbu",
            Opcode::LH => "lh",
            Opcode::LHU => "lhu",
            Opcode::LW => "lw",
            Opcode::LWL => "lwl",
            Opcode::LWR => "lwr",
            Opcode::LWU => "lwu",
            Opcode::LD => "ld",
            Opcode::LDL => "ldl",
            Opcode::LDR => "ldr",
            Opcode::SB => "sb",
            Opcode::SH => "sh",
            Opcode::SW => "sw",
            Opcode::SWL => "swl",
            Opcode::SWR => "swr",
            Opcode::SD => "sd",
            Opcode::SDL => "sdl",
            Opcode::SDR => "sdr",
            Opcode::LL => "ll",
            Opcode::SC => "sc",
            Opcode::LLD => "lld",
            Opcode::SCD => "scd",
            Opcode::SYNC => "sync",
            Opcode::SYSCALL => "syscall",
        }
    }

    /// Returns true for encodings that only exist on MIPS64.
    #[must_use]
    pub const fn is_mips64_only(&self) -> bool {
        matches!(
            self,
            Opcode::DADD
                | Opcode::DADDU
                | Opcode::DSUB
                | Opcode::DSUBU
                | Opcode::DADDI
                | Opcode::DADDIU
                | Opcode::DSLL
                | Opcode::DSRL
                | Opcode::DSRA
                | Opcode::DSLL32
                | Opcode::DSRL32
                | Opcode::DSRA32
                | Opcode::DSLLV
                | Opcode::DSRLV
                | Opcode::DSRAV
                | Opcode::DMULT
                | Opcode::DMULTU
                | Opcode::DDIV
                | Opcode::DDIVU
                | Opcode::LWU
                | Opcode::LD
                | Opcode::LDL
                | Opcode::LDR
                | Opcode::SD
                | Opcode::SDL
                | Opcode::SDR
                | Opcode::LLD
                | Opcode::SCD
        )
    }

    /// Returns true for the instructions that go through the HI/LO unit.
    #[must_use]
    pub const fn is_hilo(&self) -> bool {
        matches!(
            self,
            Opcode::MFHI
                | Opcode::MTHI
                | Opcode::MFLO
                | Opcode::MTLO
                | Opcode::MULT
                | Opcode::MULTU
                | Opcode::DIV
                | Opcode::DIVU
                | Opcode::DSLLV
                | Opcode::DSRLV
                | Opcode::DSRAV
                | Opcode::DMULT
                | Opcode::DMULTU
                | Opcode::DDIV
                | Opcode::DDIVU
        )
    }

    #[must_use]
    pub const fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::BEQ
                | Opcode::BNE
                | Opcode::BLEZ
                | Opcode::BGTZ
                | Opcode::BLTZ
                | Opcode::BGEZ
                | Opcode::BLTZAL
                | Opcode::BGEZAL
                | Opcode::BNEVER
        )
    }

    /// Load-linked / store-conditional, handled by the VM rather than the core step.
    #[must_use]
    pub const fn is_rmw(&self) -> bool {
        matches!(self, Opcode::LL | Opcode::SC | Opcode::LLD | Opcode::SCD)
    }

    /// Returns true for instructions that write the word they read back to memory.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(
            self,
            Opcode::SB
                | Opcode::SH
                | Opcode::SW
                | Opcode::SWL
                | Opcode::SWR
                | Opcode::SD
                | Opcode::SDL
                | Opcode::SDR
        )
    }

    /// Returns true for instructions that read a memory word.
    #[must_use]
    pub const fn is_memory(&self) -> bool {
        self.is_store()
            || matches!(
                self,
                Opcode::LB
                    | Opcode::LBU
                    | Opcode::LH
                    | Opcode::LHU
                    | Opcode::LW
                    | Opcode::LWL
                    | Opcode::LWR
                    | Opcode::LWU
                    | Opcode::LD
                    | Opcode::LDL
                    | Opcode::LDR
            )
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
