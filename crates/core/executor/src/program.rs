//! Loading guest programs into a fresh VM state.

use std::io::{self, Read};

use anyhow::{anyhow, bail, Context, Result};
use elf::{
    abi::{EM_MIPS, ET_EXEC, PT_LOAD},
    endian::BigEndian,
    file::Class,
    ElfBytes,
};

use cannon_primitives::consts::PAGE_SIZE;

use crate::state::{StateVersion, VersionedState};

/// Bytes the Go runtime seeds its fast random generator from (`AT_RANDOM`).
const AT_RANDOM_BYTES: &[u8] = b"4;byfairdiceroll";
const ENVP0: &[u8] = b"GODEBUG=memprofilerate=0\0";
const ARGV0: &[u8] = b"op-program\0";

const AT_PAGESZ: u64 = 6;
const AT_RANDOM: u64 = 25;

/// Parse a big-endian MIPS executable and place its loadable segments into a fresh state of
/// `version`, starting at the ELF entry point.
pub fn load_elf(version: StateVersion, elf_code: &[u8]) -> Result<VersionedState> {
    let arch = version.arch();
    let elf = ElfBytes::<BigEndian>::minimal_parse(elf_code)
        .map_err(|err| anyhow!("elf parse error: {err}"))?;
    let class = if arch.is_mips32() { Class::ELF32 } else { Class::ELF64 };
    if elf.ehdr.class != class {
        bail!("expected a {}-bit ELF for state version {version:?}", arch.word_bits());
    }
    if elf.ehdr.e_machine != EM_MIPS {
        bail!("invalid machine type, must be MIPS");
    }
    if elf.ehdr.e_type != ET_EXEC {
        bail!("invalid ELF type, must be executable");
    }
    let entry = elf.ehdr.e_entry;
    if entry > arch.word_mask() || entry % 4 != 0 {
        bail!("invalid entrypoint {entry:#x}");
    }

    let mut state = VersionedState::new(version, entry);
    let segments = elf.segments().context("missing program header table")?;
    for (i, segment) in segments.iter().enumerate().filter(|(_, s)| s.p_type == PT_LOAD) {
        let (vaddr, file_size, mem_size) = (segment.p_vaddr, segment.p_filesz, segment.p_memsz);
        if file_size > mem_size {
            bail!("segment {i}: file size {file_size} exceeds memory size {mem_size}");
        }
        if mem_size == 0 {
            continue;
        }
        let last = vaddr
            .checked_add(mem_size - 1)
            .filter(|last| *last <= arch.word_mask())
            .with_context(|| format!("segment {i} at {vaddr:#x} exceeds the address space"))?;
        if last >= arch.heap_start() - 1 {
            bail!("segment {i} at {vaddr:#x} overlaps with the heap");
        }

        let offset = usize::try_from(segment.p_offset)?;
        let data = offset
            .checked_add(usize::try_from(file_size)?)
            .and_then(|end| elf_code.get(offset..end))
            .with_context(|| format!("segment {i}: data out of bounds"))?;
        let zeros = io::repeat(0).take(mem_size - file_size);
        state
            .memory_mut()
            .set_memory_range(vaddr, data.chain(zeros))
            .with_context(|| format!("failed to load segment {i}"))?;
        tracing::debug!("loaded segment {i}: vaddr = {vaddr:#x} size = {mem_size:#x}");
    }
    Ok(state)
}

/// Set up an initial stack the Go runtime can start from: `argc`, `argv`, `envp` and an
/// auxiliary vector with `AT_PAGESZ` and `AT_RANDOM`. The stack pointer is placed in `$sp`.
pub fn patch_stack(state: &mut VersionedState) -> Result<()> {
    let arch = state.arch();
    let word = arch.word_bytes();
    let sp = arch.high_memory_start();
    let page_size = PAGE_SIZE as u64;

    let memory = state.memory_mut();
    memory
        .set_memory_range(sp - 4 * page_size, io::repeat(0).take(5 * page_size))
        .context("failed to allocate the stack")?;

    let padded = |bytes: &[u8]| {
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len().next_multiple_of(word as usize), 0);
        padded
    };
    let mut offset = sp + 10 * word;
    let mut push = |bytes: &[u8]| -> io::Result<u64> {
        let bytes = padded(bytes);
        let addr = offset;
        memory.set_memory_range(addr, &bytes[..])?;
        offset += bytes.len() as u64;
        Ok(addr)
    };
    let auxv3 = push(AT_RANDOM_BYTES)?;
    let envp0 = push(ENVP0)?;
    let argv0 = push(ARGV0)?;

    // argc, argv, envp and auxv, each list null-terminated
    let words = [1, argv0, 0, envp0, 0, AT_PAGESZ, page_size, AT_RANDOM, auxv3, 0];
    for (i, value) in words.into_iter().enumerate() {
        memory.set_word(sp + i as u64 * word, value)?;
    }

    state.registers_mut()?[29] = sp;
    Ok(())
}
