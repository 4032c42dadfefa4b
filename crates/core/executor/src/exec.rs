//! Instruction semantics shared by every VM flavour.
//!
//! The functions here mutate a CPU, a register file and memory; syscalls and the
//! load-linked/store-conditional pair are left to the VMs since their effects depend on the
//! threading model.

use crate::{
    memory::Memory, state::CpuScalars, tracker::MemoryTracker, Arch, Instruction, Opcode, VmFault,
};

const U32_MASK: u64 = 0xFFFF_FFFF;

/// Fetches and decodes the instruction at `pc`.
pub fn fetch(arch: Arch, memory: &mut Memory, pc: u64) -> Result<Instruction, VmFault> {
    if pc & 3 != 0 {
        return Err(VmFault::InvalidPc(pc));
    }
    let insn = memory.get_u32(pc)?;
    Instruction::decode(arch, insn)
}

/// Advances past a non-branching instruction, writing `val` to `store_reg` if `conditional`.
pub fn handle_rd(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    store_reg: usize,
    val: u64,
    conditional: bool,
) {
    if store_reg != 0 && conditional {
        registers[store_reg] = arch.mask(val);
    }
    cpu.pc = cpu.next_pc;
    cpu.next_pc = arch.mask(cpu.next_pc.wrapping_add(4));
}

pub fn handle_jump(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    link_reg: usize,
    dest: u64,
) -> Result<(), VmFault> {
    if cpu.next_pc != arch.mask(cpu.pc.wrapping_add(4)) {
        return Err(VmFault::JumpInDelaySlot);
    }
    let prev_pc = cpu.pc;
    cpu.pc = cpu.next_pc;
    cpu.next_pc = arch.mask(dest);
    if link_reg != 0 {
        registers[link_reg] = arch.mask(prev_pc.wrapping_add(8));
    }
    Ok(())
}

pub fn handle_branch(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    insn: &Instruction,
    rs: u64,
) -> Result<(), VmFault> {
    if cpu.next_pc != arch.mask(cpu.pc.wrapping_add(4)) {
        return Err(VmFault::BranchInDelaySlot);
    }
    let srs = arch.signed(rs);
    let should_branch = match insn.opcode {
        Opcode::BEQ => rs == registers[insn.rt()],
        Opcode::BNE => rs != registers[insn.rt()],
        Opcode::BLEZ => srs <= 0,
        Opcode::BGTZ => srs > 0,
        Opcode::BLTZ => srs < 0,
        Opcode::BGEZ => srs >= 0,
        Opcode::BLTZAL | Opcode::BGEZAL => {
            // The link register is written whether or not the branch is taken.
            registers[31] = arch.mask(cpu.pc.wrapping_add(8));
            if insn.opcode == Opcode::BLTZAL {
                srs < 0
            } else {
                srs >= 0
            }
        }
        _ => false,
    };

    let prev_pc = cpu.pc;
    cpu.pc = cpu.next_pc;
    cpu.next_pc = if should_branch {
        let offset = arch.sign_extend(insn.imm(), 16) << 2;
        arch.mask(prev_pc.wrapping_add(4).wrapping_add(offset))
    } else {
        arch.mask(cpu.next_pc.wrapping_add(4))
    };
    Ok(())
}

/// Executes the HI/LO unit instructions, plus the 64-bit variable shifts that share its encoding
/// range.
pub fn handle_hi_lo(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    opcode: Opcode,
    rs: u64,
    rt: u64,
    store_reg: usize,
) -> Result<(), VmFault> {
    let mut val = 0u64;
    match opcode {
        Opcode::MFHI => val = cpu.hi,
        Opcode::MTHI => cpu.hi = rs,
        Opcode::MFLO => val = cpu.lo,
        Opcode::MTLO => cpu.lo = rs,
        Opcode::MULT => {
            let acc = (i64::from(rs as u32 as i32) * i64::from(rt as u32 as i32)) as u64;
            cpu.hi = arch.sign_extend(acc >> 32, 32);
            cpu.lo = arch.sign_extend(acc & U32_MASK, 32);
        }
        Opcode::MULTU => {
            let acc = (rs & U32_MASK) * (rt & U32_MASK);
            cpu.hi = arch.sign_extend(acc >> 32, 32);
            cpu.lo = arch.sign_extend(acc & U32_MASK, 32);
        }
        Opcode::DIV => {
            let (a, b) = (rs as u32 as i32, rt as u32 as i32);
            if b == 0 {
                return Err(VmFault::DivideByZero);
            }
            cpu.hi = arch.sign_extend(a.wrapping_rem(b) as u32 as u64, 32);
            cpu.lo = arch.sign_extend(a.wrapping_div(b) as u32 as u64, 32);
        }
        Opcode::DIVU => {
            let (a, b) = (rs as u32, rt as u32);
            if b == 0 {
                return Err(VmFault::DivideByZero);
            }
            cpu.hi = arch.sign_extend(u64::from(a % b), 32);
            cpu.lo = arch.sign_extend(u64::from(a / b), 32);
        }
        Opcode::DSLLV => val = rt << (rs & 0x3F),
        Opcode::DSRLV => val = rt >> (rs & 0x3F),
        Opcode::DSRAV => val = ((rt as i64) >> (rs & 0x3F)) as u64,
        Opcode::DMULT => {
            let acc = i128::from(rs as i64) * i128::from(rt as i64);
            cpu.hi = (acc >> 64) as u64;
            cpu.lo = acc as u64;
        }
        Opcode::DMULTU => {
            let acc = u128::from(rs) * u128::from(rt);
            cpu.hi = (acc >> 64) as u64;
            cpu.lo = acc as u64;
        }
        Opcode::DDIV => {
            if rt == 0 {
                return Err(VmFault::DivideByZero);
            }
            cpu.hi = (rs as i64).wrapping_rem(rt as i64) as u64;
            cpu.lo = (rs as i64).wrapping_div(rt as i64) as u64;
        }
        Opcode::DDIVU => {
            if rt == 0 {
                return Err(VmFault::DivideByZero);
            }
            cpu.hi = rs % rt;
            cpu.lo = rs / rt;
        }
        _ => return Err(VmFault::InvalidInstruction(opcode as u32)),
    }

    if store_reg != 0 {
        registers[store_reg] = arch.mask(val);
    }
    cpu.pc = cpu.next_pc;
    cpu.next_pc = arch.mask(cpu.next_pc.wrapping_add(4));
    Ok(())
}

/// Mask, bit offset and bit length of the `byte_len`-wide field at `addr` within a word.
fn sub_word_mask_and_offset(arch: Arch, addr: u64, byte_len: u64) -> (u64, u32, u32) {
    let bit_len = (byte_len << 3) as u32;
    let data_mask = arch.word_mask() >> (arch.word_bits() - bit_len);
    let byte_index = addr & arch.ext_mask() & !(byte_len - 1);
    let max_byte_shift = arch.word_bytes() - byte_len;
    let bit_offset = ((max_byte_shift - byte_index) << 3) as u32;
    (data_mask, bit_offset, bit_len)
}

/// Extracts the `byte_len`-wide value addressed by `addr` from the word `mem`.
#[must_use]
pub fn select_sub_word(arch: Arch, addr: u64, mem: u64, byte_len: u64, sign_extend: bool) -> u64 {
    let (data_mask, bit_offset, bit_len) = sub_word_mask_and_offset(arch, addr, byte_len);
    let val = (mem >> bit_offset) & data_mask;
    if sign_extend {
        arch.sign_extend(val, bit_len)
    } else {
        val
    }
}

/// Replaces the `byte_len`-wide value addressed by `addr` within the word `mem`.
#[must_use]
pub fn update_sub_word(arch: Arch, addr: u64, mem: u64, byte_len: u64, value: u64) -> u64 {
    let (data_mask, bit_offset, _) = sub_word_mask_and_offset(arch, addr, byte_len);
    let update_mask = data_mask << bit_offset;
    arch.mask(((value & data_mask) << bit_offset) | (!update_mask & mem))
}

/// Executes one instruction other than `syscall` and the LL/SC family.
///
/// Returns the address of the word written to memory, if any.
pub fn exec_core_step(
    arch: Arch,
    cpu: &mut CpuScalars,
    registers: &mut [u64; 32],
    memory: &mut Memory,
    tracker: &mut MemoryTracker,
    insn: &Instruction,
) -> Result<Option<u64>, VmFault> {
    let opcode = insn.opcode;
    if matches!(opcode, Opcode::J | Opcode::JAL) {
        let link_reg = if opcode == Opcode::JAL { 31 } else { 0 };
        // The top bits come from the delay slot's 256 MB region.
        let target = (cpu.next_pc & arch.sign_extend(0xF000_0000, 32)) | (insn.target() << 2);
        handle_jump(arch, cpu, registers, link_reg, target)?;
        return Ok(None);
    }

    let op = insn.op();
    let mut rs = registers[insn.rs()];
    let rt_reg = insn.rt();
    let mut rd_reg = rt_reg;
    let rt = match op {
        0x27 | 0x1A | 0x1B => registers[rt_reg],
        0x00 | 0x1C => {
            rd_reg = insn.rd();
            registers[rt_reg]
        }
        0x0C..=0x0E => insn.imm(),
        _ if op < 0x20 => arch.sign_extend(insn.imm(), 16),
        _ if op >= 0x28 || op == 0x22 || op == 0x26 => registers[rt_reg],
        _ => 0,
    };

    if opcode.is_branch() {
        handle_branch(arch, cpu, registers, insn, rs)?;
        return Ok(None);
    }

    let mut store_addr = None;
    let mut mem = 0;
    if opcode.is_memory() {
        rs = arch.mask(rs.wrapping_add(arch.sign_extend(insn.imm(), 16)));
        let addr = rs & arch.address_mask();
        tracker.track(memory, addr)?;
        mem = memory.get_word(addr)?;
        if opcode.is_store() {
            store_addr = Some(addr);
            rd_reg = 0;
        }
    }

    match opcode {
        Opcode::JR => handle_jump(arch, cpu, registers, 0, rs)?,
        Opcode::JALR => handle_jump(arch, cpu, registers, rd_reg, rs)?,
        Opcode::MOVZ => handle_rd(arch, cpu, registers, rd_reg, rs, rt == 0),
        Opcode::MOVN => handle_rd(arch, cpu, registers, rd_reg, rs, rt != 0),
        _ if opcode.is_hilo() => handle_hi_lo(arch, cpu, registers, opcode, rs, rt, rd_reg)?,
        _ => {
            let val = execute(arch, insn, rs, rt, mem)?;
            if let Some(addr) = store_addr {
                memory.set_word(addr, val)?;
            }
            handle_rd(arch, cpu, registers, rd_reg, val, true);
            return Ok(store_addr);
        }
    }
    Ok(None)
}

/// Computes the value an ALU, load or store instruction produces.
///
/// For loads `rs` is the effective address and `mem` the word containing it; stores return the
/// updated memory word.
fn execute(arch: Arch, insn: &Instruction, rs: u64, rt: u64, mem: u64) -> Result<u64, VmFault> {
    let sa = u64::from(insn.sa());
    let word_bits = u64::from(arch.word_bits());
    let ext_mask = arch.ext_mask();
    let val = match insn.opcode {
        Opcode::SLL => arch.sign_extend((rt << sa) & U32_MASK, 32),
        Opcode::SRL => arch.sign_extend((rt & U32_MASK) >> sa, 32),
        Opcode::SRA => arch.sign_extend((rt & U32_MASK) >> sa, 32 - sa as u32),
        Opcode::SLLV => arch.sign_extend((rt << (rs & 0x1F)) & U32_MASK, 32),
        Opcode::SRLV => arch.sign_extend((rt & U32_MASK) >> (rs & 0x1F), 32),
        Opcode::SRAV => {
            let shamt = rs & 0x1F;
            arch.sign_extend((rt & U32_MASK) >> shamt, 32 - shamt as u32)
        }
        Opcode::SYNC => rs,

        Opcode::ADD | Opcode::ADDU | Opcode::ADDI | Opcode::ADDIU => {
            arch.sign_extend(u64::from((rs as u32).wrapping_add(rt as u32)), 32)
        }
        Opcode::SUB | Opcode::SUBU => {
            arch.sign_extend(u64::from((rs as u32).wrapping_sub(rt as u32)), 32)
        }
        Opcode::AND | Opcode::ANDI => rs & rt,
        Opcode::OR | Opcode::ORI => rs | rt,
        Opcode::XOR | Opcode::XORI => rs ^ rt,
        Opcode::NOR => !(rs | rt),
        Opcode::SLT | Opcode::SLTI => u64::from(arch.signed(rs) < arch.signed(rt)),
        Opcode::SLTU | Opcode::SLTIU => u64::from(rs < rt),
        Opcode::LUI => arch.sign_extend(rt << 16, 32),

        Opcode::DADD | Opcode::DADDU | Opcode::DADDI | Opcode::DADDIU => rs.wrapping_add(rt),
        Opcode::DSUB | Opcode::DSUBU => rs.wrapping_sub(rt),
        Opcode::DSLL => rt << sa,
        Opcode::DSRL => rt >> sa,
        Opcode::DSRA => ((rt as i64) >> sa) as u64,
        Opcode::DSLL32 => rt << (sa + 32),
        Opcode::DSRL32 => rt >> (sa + 32),
        Opcode::DSRA32 => ((rt as i64) >> (sa + 32)) as u64,

        Opcode::MUL => {
            arch.sign_extend(u64::from((rs as u32 as i32).wrapping_mul(rt as u32 as i32) as u32), 32)
        }
        Opcode::CLZ => u64::from((rs as u32).leading_zeros()),
        Opcode::CLO => u64::from((rs as u32).leading_ones()),

        Opcode::LB => {
            let shift = word_bits - 8 - (rs & ext_mask) * 8;
            arch.sign_extend((mem >> shift) & 0xFF, 8)
        }
        Opcode::LBU => (mem >> (word_bits - 8 - (rs & ext_mask) * 8)) & 0xFF,
        Opcode::LH => {
            let shift = word_bits - 16 - (rs & (ext_mask - 1)) * 8;
            arch.sign_extend((mem >> shift) & 0xFFFF, 16)
        }
        Opcode::LHU => (mem >> (word_bits - 16 - (rs & (ext_mask - 1)) * 8)) & 0xFFFF,
        Opcode::LW => select_sub_word(arch, rs, mem, 4, true),
        Opcode::LWU => select_sub_word(arch, rs, mem, 4, false),
        Opcode::LWL => {
            let shift = (rs & 3) * 8;
            let w = if arch.is_mips32() { mem } else { select_sub_word(arch, rs, mem, 4, false) };
            let val = (w << shift) & U32_MASK;
            let mask = U32_MASK << shift;
            arch.sign_extend(((rt & !mask) | val) & U32_MASK, 32)
        }
        Opcode::LWR => {
            let shift = 24 - (rs & 3) * 8;
            let mask = U32_MASK >> shift;
            if arch.is_mips32() {
                arch.sign_extend(((rt & !mask) | (mem >> shift)) & U32_MASK, 32)
            } else {
                let w = select_sub_word(arch, rs, mem, 4, false);
                let merged = ((rt & !mask) | (w >> shift)) & U32_MASK;
                if rs & 3 == 3 {
                    arch.sign_extend(merged, 32)
                } else {
                    // A partial load keeps the upper half of rt.
                    (rt & !U32_MASK) | merged
                }
            }
        }
        Opcode::LD => mem,
        Opcode::LDL => {
            let shift = (rs & 7) << 3;
            (mem << shift) | (rt & !(u64::MAX << shift))
        }
        Opcode::LDR => {
            let shift = 56 - ((rs & 7) << 3);
            let mask = u64::MAX.checked_shl((64 - shift) as u32).unwrap_or(0);
            (mem >> shift) | (rt & mask)
        }

        Opcode::SB => {
            let shift = word_bits - 8 - (rs & ext_mask) * 8;
            (mem & !(0xFF << shift)) | ((rt & 0xFF) << shift)
        }
        Opcode::SH => {
            let shift = word_bits - 16 - (rs & (ext_mask - 1)) * 8;
            (mem & !(0xFFFF << shift)) | ((rt & 0xFFFF) << shift)
        }
        Opcode::SW => update_sub_word(arch, rs, mem, 4, rt),
        Opcode::SWL => {
            let shift = (rs & 3) * 8;
            if arch.is_mips32() {
                let mask = U32_MASK >> shift;
                (mem & !mask) | ((rt & U32_MASK) >> shift)
            } else {
                let half = 32 - ((rs & 4) << 3);
                let val = ((rt & U32_MASK) >> shift) << half;
                let mask = (U32_MASK >> shift) << half;
                (mem & !mask) | val
            }
        }
        Opcode::SWR => {
            let shift = 24 - (rs & 3) * 8;
            let mask = U32_MASK << shift;
            if arch.is_mips32() {
                (mem & !mask) | (rt << shift)
            } else {
                let w = select_sub_word(arch, rs, mem, 4, false);
                let merged = ((w & !mask) | (rt << shift)) & U32_MASK;
                update_sub_word(arch, rs, mem, 4, merged)
            }
        }
        Opcode::SD => rt,
        Opcode::SDL => {
            let shift = (rs & 7) << 3;
            (rt >> shift) | (mem & !(u64::MAX >> shift))
        }
        Opcode::SDR => {
            let shift = 56 - ((rs & 7) << 3);
            (rt << shift) | (mem & !(u64::MAX << shift))
        }
        _ => return Err(VmFault::InvalidInstruction(insn.raw)),
    };
    Ok(arch.mask(val))
}
