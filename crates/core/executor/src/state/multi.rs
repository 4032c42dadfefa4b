use std::io::{Read, Write};

use cannon_primitives::{hash_pair, keccak256, Hash, ZERO_HASHES};

use crate::{memory::Memory, Arch, VmFault};

use super::{state_hash, BinaryReader, BinaryWriter, LlStatus, StateError, ThreadState};

/// State of the multi-threaded VM.
///
/// Threads live on two stacks. `traverse_right` selects the active stack and the thread on top
/// of it is the one being executed.
#[derive(Debug, Clone)]
pub struct MultiThreadedState {
    pub arch: Arch,
    pub memory: Memory,
    pub preimage_key: Hash,
    /// Offset into the length-prefixed preimage.
    pub preimage_offset: u64,
    pub heap: u64,

    pub ll_status: LlStatus,
    /// Effective address of the reservation.
    pub ll_address: u64,
    pub ll_owner: u64,

    pub exit_code: u8,
    pub exited: bool,
    pub step: u64,
    pub steps_since_last_context_switch: u64,

    pub traverse_right: bool,
    pub left_thread_stack: Vec<ThreadState>,
    pub right_thread_stack: Vec<ThreadState>,
    pub next_thread_id: u64,

    /// Buffered bytes of an incomplete hint.
    pub last_hint: Vec<u8>,
}

impl MultiThreadedState {
    /// A single thread with id 0 starting at `pc`, heap pointer at `heap_start`.
    #[must_use]
    pub fn new(arch: Arch, pc: u64, heap_start: u64) -> Self {
        let mut thread = ThreadState::new(0);
        thread.cpu.pc = pc;
        thread.cpu.next_pc = arch.mask(pc.wrapping_add(4));
        Self {
            arch,
            memory: Memory::new(arch),
            preimage_key: [0; 32],
            preimage_offset: 0,
            heap: heap_start,
            ll_status: LlStatus::None,
            ll_address: 0,
            ll_owner: 0,
            exit_code: 0,
            exited: false,
            step: 0,
            steps_since_last_context_switch: 0,
            traverse_right: false,
            left_thread_stack: vec![thread],
            right_thread_stack: Vec::new(),
            next_thread_id: 1,
            last_hint: Vec::new(),
        }
    }

    #[must_use]
    pub fn witness_size(arch: Arch) -> usize {
        // roots: memory, preimage key, left and right stacks
        let words = 5 * arch.word_bytes() as usize;
        4 * 32 + words + 2 * 8 + 4
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.left_thread_stack.len() + self.right_thread_stack.len()
    }

    #[must_use]
    pub fn active_stack(&self) -> &[ThreadState] {
        if self.traverse_right {
            &self.right_thread_stack
        } else {
            &self.left_thread_stack
        }
    }

    pub fn active_stack_mut(&mut self) -> &mut Vec<ThreadState> {
        if self.traverse_right {
            &mut self.right_thread_stack
        } else {
            &mut self.left_thread_stack
        }
    }

    /// The stack the active thread moves to when it is preempted.
    pub fn inactive_stack_mut(&mut self) -> &mut Vec<ThreadState> {
        if self.traverse_right {
            &mut self.left_thread_stack
        } else {
            &mut self.right_thread_stack
        }
    }

    pub fn current_thread(&self) -> Result<&ThreadState, VmFault> {
        self.active_stack().last().ok_or(VmFault::EmptyThreadStack)
    }

    pub fn current_thread_mut(&mut self) -> Result<&mut ThreadState, VmFault> {
        self.active_stack_mut().last_mut().ok_or(VmFault::EmptyThreadStack)
    }

    /// The active thread alongside memory, for executing an instruction.
    pub fn active_thread_and_memory(
        &mut self,
    ) -> Result<(&mut ThreadState, &mut Memory), VmFault> {
        let stack = if self.traverse_right {
            &mut self.right_thread_stack
        } else {
            &mut self.left_thread_stack
        };
        let thread = stack.last_mut().ok_or(VmFault::EmptyThreadStack)?;
        Ok((thread, &mut self.memory))
    }

    /// PC of the active thread.
    pub fn pc(&self) -> Result<u64, VmFault> {
        Ok(self.current_thread()?.cpu.pc)
    }

    /// Hash chain over `threads`, bottom of the stack first.
    #[must_use]
    pub fn thread_stack_root(arch: Arch, threads: &[ThreadState]) -> Hash {
        threads
            .iter()
            .fold(ZERO_HASHES[1], |root, thread| hash_pair(&root, &thread.hash(arch)))
    }

    #[must_use]
    pub fn left_stack_root(&self) -> Hash {
        Self::thread_stack_root(self.arch, &self.left_thread_stack)
    }

    #[must_use]
    pub fn right_stack_root(&self) -> Hash {
        Self::thread_stack_root(self.arch, &self.right_thread_stack)
    }

    /// The active thread followed by the root of the rest of the active stack.
    pub fn encode_thread_proof(&self) -> Result<Vec<u8>, VmFault> {
        let stack = self.active_stack();
        let (active, others) = stack.split_last().ok_or(VmFault::EmptyThreadStack)?;
        let mut out = active.serialize(self.arch);
        out.extend_from_slice(&Self::thread_stack_root(self.arch, others));
        Ok(out)
    }

    /// Witness of the state, with memory and the thread stacks folded into their roots.
    pub fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        let mut out = Vec::with_capacity(Self::witness_size(self.arch));
        out.extend_from_slice(&self.memory.merkle_root());
        out.extend_from_slice(&self.preimage_key);
        let mut w = BinaryWriter::new(self.arch, &mut out);
        let _ = self.encode_scalars(&mut w);
        out.extend_from_slice(&self.left_stack_root());
        out.extend_from_slice(&self.right_stack_root());
        let mut w = BinaryWriter::new(self.arch, &mut out);
        let _ = w.word(self.next_thread_id);
        let hash = state_hash(&out, self.exited, self.exit_code);
        (out, hash)
    }

    fn encode_scalars<W: Write>(&self, w: &mut BinaryWriter<'_, W>) -> std::io::Result<()> {
        w.word(self.preimage_offset)?;
        w.word(self.heap)?;
        w.u8(self.ll_status as u8)?;
        w.word(self.ll_address)?;
        w.word(self.ll_owner)?;
        w.u8(self.exit_code)?;
        w.bool(self.exited)?;
        w.u64(self.step)?;
        w.u64(self.steps_since_last_context_switch)?;
        w.bool(self.traverse_right)
    }

    /// Binary encoding, without the version byte.
    pub fn serialize<W: Write>(&self, out: &mut W) -> Result<(), StateError> {
        self.memory.serialize(out)?;
        let mut w = BinaryWriter::new(self.arch, out);
        w.hash(&self.preimage_key)?;
        self.encode_scalars(&mut w)?;
        w.word(self.next_thread_id)?;
        for stack in [&self.left_thread_stack, &self.right_thread_stack] {
            w.word(stack.len() as u64)?;
            for thread in stack {
                thread.encode(&mut w)?;
            }
        }
        w.bytes(&self.last_hint)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(arch: Arch, input: &mut R) -> Result<Self, StateError> {
        let memory = Memory::deserialize(arch, input)?;
        let mut r = BinaryReader::new(arch, input);
        let preimage_key = r.hash()?;
        let preimage_offset = r.word()?;
        let heap = r.word()?;
        let ll_status = LlStatus::try_from(r.u8()?)?;
        let ll_address = r.word()?;
        let ll_owner = r.word()?;
        let exit_code = r.u8()?;
        let exited = r.bool()?;
        let step = r.u64()?;
        let steps_since_last_context_switch = r.u64()?;
        let traverse_right = r.bool()?;
        let next_thread_id = r.word()?;
        let left_thread_stack = read_stack(&mut r)?;
        let right_thread_stack = read_stack(&mut r)?;
        let last_hint = r.bytes()?;
        Ok(Self {
            arch,
            memory,
            preimage_key,
            preimage_offset,
            heap,
            ll_status,
            ll_address,
            ll_owner,
            exit_code,
            exited,
            step,
            steps_since_last_context_switch,
            traverse_right,
            left_thread_stack,
            right_thread_stack,
            next_thread_id,
            last_hint,
        })
    }
}

fn read_stack<R: Read>(r: &mut BinaryReader<'_, R>) -> Result<Vec<ThreadState>, StateError> {
    let len = r.word()?;
    // Cap the preallocation, the length comes from untrusted input.
    let mut stack = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        stack.push(ThreadState::decode(r)?);
    }
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VmStatus;

    fn sample(arch: Arch) -> MultiThreadedState {
        let mut state = MultiThreadedState::new(arch, 0x1000, arch.heap_start());
        state.memory.set_word(0x1000, 0x2408_0001).unwrap();
        state.preimage_key = [3; 32];
        state.ll_status = LlStatus::Active32;
        state.ll_address = 0x2002;
        state.ll_owner = 1;
        state.step = 500;
        state.steps_since_last_context_switch = 20;
        let mut other = ThreadState::new(1);
        other.cpu.pc = 0x2000;
        other.registers[29] = 0x7000;
        state.right_thread_stack.push(other);
        state.next_thread_id = 2;
        state.last_hint = vec![0, 0];
        state
    }

    #[test]
    fn initial_state() {
        let state = MultiThreadedState::new(Arch::Mips64, 0x1000, 0x20);
        assert_eq!(state.thread_count(), 1);
        let thread = state.current_thread().unwrap();
        assert_eq!((thread.thread_id, thread.cpu.pc, thread.cpu.next_pc), (0, 0x1000, 0x1004));
        assert_eq!(state.next_thread_id, 1);
        assert_eq!(state.right_stack_root(), ZERO_HASHES[1]);
    }

    #[test]
    fn witness_sizes() {
        assert_eq!(MultiThreadedState::witness_size(Arch::Mips32), 168);
        assert_eq!(MultiThreadedState::witness_size(Arch::Mips64), 188);
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut state = sample(arch);
            let (witness, hash) = state.encode_witness();
            assert_eq!(witness.len(), MultiThreadedState::witness_size(arch));
            assert_eq!(hash[0], VmStatus::Unfinished as u8);
            let w = arch.word_bytes() as usize;
            // llStatus follows the offset and heap words
            assert_eq!(witness[64 + 2 * w], 1);
        }
    }

    #[test]
    fn stack_roots_chain_threads() {
        let arch = Arch::Mips32;
        let a = ThreadState::new(0);
        let b = ThreadState::new(1);
        let root = MultiThreadedState::thread_stack_root(arch, &[a.clone(), b.clone()]);
        let expected = hash_pair(&hash_pair(&ZERO_HASHES[1], &a.hash(arch)), &b.hash(arch));
        assert_eq!(root, expected);
        assert_eq!(ZERO_HASHES[1], keccak256(&[0u8; 64]));
    }

    #[test]
    fn thread_proof() {
        let arch = Arch::Mips32;
        let mut state = sample(arch);
        let below = ThreadState::new(5);
        state.left_thread_stack.insert(0, below.clone());

        let proof = state.encode_thread_proof().unwrap();
        let size = ThreadState::serialized_size(arch);
        assert_eq!(proof.len(), size + 32);
        assert_eq!(proof[..size], state.current_thread().unwrap().serialize(arch));
        assert_eq!(proof[size..], MultiThreadedState::thread_stack_root(arch, &[below]));

        state.left_thread_stack.clear();
        assert!(matches!(state.encode_thread_proof(), Err(VmFault::EmptyThreadStack)));
        assert!(matches!(state.pc(), Err(VmFault::EmptyThreadStack)));
    }

    #[test]
    fn binary_round_trip() {
        for arch in [Arch::Mips32, Arch::Mips64] {
            let mut state = sample(arch);
            let mut bytes = Vec::new();
            state.serialize(&mut bytes).unwrap();
            let mut decoded = MultiThreadedState::deserialize(arch, &mut &bytes[..]).unwrap();
            assert_eq!(decoded.encode_witness(), state.encode_witness());
            assert_eq!(decoded.right_thread_stack, state.right_thread_stack);
            assert_eq!(decoded.left_thread_stack, state.left_thread_stack);
            assert_eq!(decoded.last_hint, state.last_hint);
            let mut again = Vec::new();
            decoded.serialize(&mut again).unwrap();
            assert_eq!(again, bytes);
        }
    }

    #[test]
    fn rejects_bad_ll_status() {
        let state = sample(Arch::Mips32);
        let mut bytes = Vec::new();
        state.serialize(&mut bytes).unwrap();
        // memory: count word + one page record
        let status_at = 4 + (4 + 4096) + 32 + 4 + 4;
        assert_eq!(bytes[status_at], 1);
        bytes[status_at] = 9;
        assert!(matches!(
            MultiThreadedState::deserialize(Arch::Mips32, &mut &bytes[..]),
            Err(StateError::Malformed(_))
        ));
    }
}
