use std::io::{self, Write};

use cannon_primitives::Hash;

use crate::{
    exec::{exec_core_step, fetch, handle_rd},
    oracle::{PreimageOracle, TrackingOracle},
    state::SingleThreadedState,
    syscalls::{
        handle_syscall_updates, sys_brk, sys_fcntl, sys_mmap, sys_read, sys_write, SyscallArgs,
        SyscallCode, SyscallContext, SyscallFeatures,
    },
    tracker::MemoryTracker,
    ExecutionError, ExecutionReport, Instruction, Opcode, StepWitness, VmFault,
};

/// The legacy single-threaded 32-bit VM.
///
/// Threading syscalls are answered with fixed values so that a Go runtime boots, and `ll`/`sc`
/// behave as a plain load and an always successful store.
pub struct SingleThreadedVm<O> {
    pub state: SingleThreadedState,
    features: SyscallFeatures,
    tracker: MemoryTracker,
    oracle: TrackingOracle<O>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    report: ExecutionReport,
}

impl<O: PreimageOracle> SingleThreadedVm<O> {
    /// Guest output is discarded until [`SingleThreadedVm::with_output`] is called.
    pub fn new(state: SingleThreadedState, oracle: O, features: SyscallFeatures) -> Self {
        Self {
            state,
            features,
            tracker: MemoryTracker::new(SingleThreadedState::ARCH),
            oracle: TrackingOracle::new(oracle),
            stdout: Box::new(io::sink()),
            stderr: Box::new(io::sink()),
            report: ExecutionReport::default(),
        }
    }

    #[must_use]
    pub fn with_output(
        mut self,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn report(&self) -> &ExecutionReport {
        &self.report
    }

    pub fn oracle(&self) -> &TrackingOracle<O> {
        &self.oracle
    }

    /// Executes one instruction, returning the step witness when `proof` is set.
    pub fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError> {
        self.oracle.reset();
        self.tracker.reset(proof);

        let mut witness = proof.then(|| {
            let (state, state_hash) = self.state.encode_witness();
            let proof_data = self.state.memory.merkle_proof(self.state.cpu.pc);
            StepWitness { state, state_hash, proof_data, ..Default::default() }
        });

        if let Err(fault) = self.mips_step() {
            let (step, pc) = (self.state.step, self.state.cpu.pc);
            tracing::debug!("fault at step {step}, pc {pc:#x}: {fault}");
            return Err(ExecutionError::Fault { fault, witness: witness.map(Box::new) });
        }

        if let Some(witness) = witness.as_mut() {
            witness.proof_data.extend_from_slice(self.tracker.mem_proof());
            if let Some((key, value, offset)) = self.oracle.last_preimage() {
                witness.preimage_key = Some(key);
                witness.preimage_value = Some(value.to_vec());
                witness.preimage_offset = Some(offset);
            }
        }
        Ok(witness)
    }

    pub fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        self.state.encode_witness()
    }

    /// Flushes the guest output writers and fills in the end-of-run counters.
    pub fn finish(&mut self) {
        let _ = self.stdout.flush();
        let _ = self.stderr.flush();
        self.report.pages = self.state.memory.page_count() as u64;
        self.report.preimage_requests = self.oracle.num_requests();
        self.report.preimage_bytes = self.oracle.total_size();
    }

    fn mips_step(&mut self) -> Result<(), VmFault> {
        if self.state.exited {
            return Ok(());
        }
        self.state.step += 1;
        self.report.steps += 1;

        let insn = fetch(SingleThreadedState::ARCH, &mut self.state.memory, self.state.cpu.pc)?;
        self.report.opcode_counts[insn.opcode] += 1;

        match insn.opcode {
            Opcode::SYSCALL => self.handle_syscall(),
            Opcode::LL | Opcode::SC => self.handle_rmw(&insn),
            _ => {
                exec_core_step(
                    SingleThreadedState::ARCH,
                    &mut self.state.cpu,
                    &mut self.state.registers,
                    &mut self.state.memory,
                    &mut self.tracker,
                    &insn,
                )?;
                Ok(())
            }
        }
    }

    fn handle_rmw(&mut self, insn: &Instruction) -> Result<(), VmFault> {
        let arch = SingleThreadedState::ARCH;
        let base = self.state.registers[insn.rs()];
        let rt_reg = insn.rt();
        let addr = arch.mask(base.wrapping_add(arch.sign_extend(insn.imm(), 16)));
        let eff_addr = addr & arch.address_mask();

        self.tracker.track(&mut self.state.memory, eff_addr)?;
        let val = if insn.opcode == Opcode::LL {
            self.state.memory.get_word(eff_addr)?
        } else {
            self.state.memory.set_word(eff_addr, self.state.registers[rt_reg])?;
            1
        };
        handle_rd(arch, &mut self.state.cpu, &mut self.state.registers, rt_reg, val, true);
        Ok(())
    }

    fn handle_syscall(&mut self) -> Result<(), VmFault> {
        let arch = SingleThreadedState::ARCH;
        let args = SyscallArgs::from_registers(&self.state.registers);
        let code = SyscallCode::from_u64(arch, args.number);
        if let Some(code) = code {
            self.report.syscall_counts[code] += 1;
        }

        let (v0, v1) = match code {
            Some(SyscallCode::SYS_MMAP) => {
                let (v0, v1, heap) = sys_mmap(arch, args.a0, args.a1, self.state.heap);
                self.state.heap = heap;
                (v0, v1)
            }
            Some(SyscallCode::SYS_BRK) => sys_brk(arch),
            // Go runtime boots with a single thread.
            Some(SyscallCode::SYS_CLONE) => (1, 0),
            Some(SyscallCode::SYS_EXIT_GROUP) => {
                self.state.exited = true;
                self.state.exit_code = args.a0 as u8;
                tracing::debug!("exit group with code {}", self.state.exit_code);
                return Ok(());
            }
            Some(SyscallCode::SYS_READ) => {
                sys_read(&mut self.syscall_context(), args.a0, args.a1, args.a2)?
            }
            Some(SyscallCode::SYS_WRITE) => {
                sys_write(&mut self.syscall_context(), args.a0, args.a1, args.a2)?
            }
            Some(SyscallCode::SYS_FCNTL) => sys_fcntl(arch, self.features, args.a0, args.a1),
            _ => (0, 0),
        };
        handle_syscall_updates(arch, &mut self.state.cpu, &mut self.state.registers, v0, v1);
        Ok(())
    }

    fn syscall_context(&mut self) -> SyscallContext<'_, O> {
        SyscallContext::new(
            SingleThreadedState::ARCH,
            self.features,
            &mut self.state.memory,
            &mut self.tracker,
            &mut self.oracle,
            &mut self.state.preimage_key,
            &mut self.state.preimage_offset,
            &mut self.state.last_hint,
            &mut *self.stdout,
            &mut *self.stderr,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use cannon_primitives::consts::fd::{FD_PREIMAGE_READ, FD_STDOUT};

    use super::*;
    use crate::{
        exec::tests::{i_type, r_type, SYSCALL},
        oracle::InMemoryOracle,
        Arch,
    };

    const ARCH: Arch = SingleThreadedState::ARCH;

    /// A cloneable writer for capturing guest output.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    fn vm(program: &[u32]) -> SingleThreadedVm<InMemoryOracle> {
        let mut state = SingleThreadedState::new(0, ARCH.heap_start());
        for (i, insn) in program.iter().enumerate() {
            state.memory.set_u32(i as u64 * 4, *insn).unwrap();
        }
        SingleThreadedVm::new(state, InMemoryOracle::new(), SyscallFeatures::default())
    }

    fn number(code: SyscallCode) -> u64 {
        code.number(ARCH).unwrap()
    }

    #[test]
    fn write_then_exit() {
        let mut vm = vm(&[SYSCALL, SYSCALL]);
        let out = SharedBuffer::default();
        vm = vm.with_output(Box::new(out.clone()), Box::new(io::sink()));
        vm.state.memory.set_memory_range(0x1000, &b"hi\n"[..]).unwrap();
        vm.state.registers[2] = number(SyscallCode::SYS_WRITE);
        vm.state.registers[4] = FD_STDOUT;
        vm.state.registers[5] = 0x1000;
        vm.state.registers[6] = 3;

        vm.step(false).unwrap();
        assert_eq!(out.contents(), b"hi\n");
        assert_eq!((vm.state.registers[2], vm.state.registers[7]), (3, 0));
        assert_eq!(vm.state.cpu.pc, 4);

        vm.state.registers[2] = number(SyscallCode::SYS_EXIT_GROUP);
        vm.state.registers[4] = 3;
        vm.step(false).unwrap();
        assert!(vm.state.exited);
        assert_eq!(vm.state.exit_code, 3);
        // The PC is left on the syscall.
        assert_eq!(vm.state.cpu.pc, 4);

        vm.step(false).unwrap();
        assert_eq!(vm.state.step, 2);
        assert_eq!(vm.report().syscall_counts[SyscallCode::SYS_WRITE], 1);
    }

    #[test]
    fn threading_syscalls_are_stubbed() {
        let mut vm = vm(&[SYSCALL, SYSCALL]);
        vm.state.registers[2] = number(SyscallCode::SYS_CLONE);
        vm.step(false).unwrap();
        assert_eq!(vm.state.registers[2], 1);

        vm.state.registers[2] = number(SyscallCode::SYS_GETTID);
        vm.step(false).unwrap();
        assert_eq!((vm.state.registers[2], vm.state.registers[7]), (0, 0));
    }

    #[test]
    fn mmap_moves_the_heap() {
        let mut vm = vm(&[SYSCALL]);
        vm.state.registers[2] = number(SyscallCode::SYS_MMAP);
        vm.state.registers[5] = 0x1001;
        vm.step(false).unwrap();
        assert_eq!(vm.state.registers[2], ARCH.heap_start());
        assert_eq!(vm.state.heap, ARCH.heap_start() + 0x2000);
    }

    #[test]
    fn fcntl_getfd_depends_on_version() {
        for (fcntl_getfd, expected) in [(false, (0xFFFF_FFFF, 0x16)), (true, (0, 0))] {
            let mut vm = vm(&[SYSCALL]);
            vm.features.fcntl_getfd = fcntl_getfd;
            vm.state.registers[2] = number(SyscallCode::SYS_FCNTL);
            vm.state.registers[4] = 1;
            vm.state.registers[5] = 1;
            vm.step(false).unwrap();
            assert_eq!((vm.state.registers[2], vm.state.registers[7]), expected);
        }
    }

    #[test]
    fn ll_sc_always_succeeds() {
        // ll $t0, 4($a0) ; sc $t1, 4($a0)
        let mut vm = vm(&[i_type(0x30, 4, 8, 4), i_type(0x38, 4, 9, 4)]);
        vm.state.registers[4] = 0x2000;
        vm.state.registers[9] = 0x55;
        vm.state.memory.set_word(0x2004, 0x1234).unwrap();

        vm.step(false).unwrap();
        assert_eq!(vm.state.registers[8], 0x1234);
        vm.step(false).unwrap();
        assert_eq!(vm.state.registers[9], 1);
        assert_eq!(vm.state.memory.get_word(0x2004).unwrap(), 0x55);
    }

    #[test]
    fn proof_covers_instruction_and_access() {
        // sw $t1, 0($a0)
        let mut vm = vm(&[i_type(0x2B, 4, 9, 0)]);
        vm.state.registers[4] = 0x3000;
        vm.state.registers[9] = 7;
        let pre_proof = vm.state.memory.merkle_proof(0x3000);
        let insn_proof = vm.state.memory.merkle_proof(0);
        let (pre_state, pre_hash) = vm.encode_witness();

        let witness = vm.step(true).unwrap().unwrap();
        assert_eq!(witness.state, pre_state);
        assert_eq!(witness.state_hash, pre_hash);
        assert_eq!(witness.proof_data.len(), 2 * ARCH.mem_proof_size());
        assert_eq!(witness.proof_data[..ARCH.mem_proof_size()], insn_proof);
        assert_eq!(witness.proof_data[ARCH.mem_proof_size()..], pre_proof);
        assert!(!witness.has_preimage());
    }

    #[test]
    fn proof_carries_preimage() {
        let mut vm = vm(&[SYSCALL]);
        let key = vm.oracle.inner_mut().insert_keccak(vec![1, 2, 3]);
        vm.state.preimage_key = key;
        vm.state.registers[2] = number(SyscallCode::SYS_READ);
        vm.state.registers[4] = FD_PREIMAGE_READ;
        vm.state.registers[5] = 0x4000;
        vm.state.registers[6] = 4;

        let witness = vm.step(true).unwrap().unwrap();
        assert_eq!(witness.preimage_key, Some(key));
        assert_eq!(witness.preimage_value.unwrap(), [0, 0, 0, 0, 0, 0, 0, 3, 1, 2, 3]);
        assert_eq!(witness.preimage_offset, Some(0));
        assert_eq!(vm.state.preimage_offset, 4);
        assert_eq!(vm.state.registers[2], 4);
    }

    #[test]
    fn fault_carries_pre_state() {
        // div $a0, $a1
        let mut vm = vm(&[r_type(4, 5, 0, 0, 0x1A)]);
        let (pre_state, _) = vm.encode_witness();
        match vm.step(true) {
            Err(ExecutionError::Fault { fault: VmFault::DivideByZero, witness: Some(witness) }) => {
                assert_eq!(witness.state, pre_state);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            vm.step(false),
            Err(ExecutionError::Fault { fault: VmFault::DivideByZero, witness: None })
        ));
    }
}
