use std::io::{self, Write};

use cannon_primitives::{
    consts::{
        errno::{MIPS_EAGAIN, MIPS_EBADF, MIPS_EINVAL},
        fd::FD_EVENT_FD,
        futex::{FUTEX_WAIT_PRIVATE, FUTEX_WAKE_PRIVATE},
        EFD_NONBLOCK, SCHED_QUANTUM,
    },
    Hash,
};

use crate::{
    exec::{exec_core_step, fetch, handle_rd, select_sub_word, update_sub_word},
    oracle::{PreimageOracle, TrackingOracle},
    state::{LlStatus, MultiThreadedState, ThreadState},
    syscalls::{
        clone_thread, handle_syscall_updates, sys_brk, sys_clock_gettime, sys_fcntl, sys_mmap,
        sys_read, sys_write, SyscallArgs, SyscallCode, SyscallContext, SyscallFeatures,
    },
    tracker::MemoryTracker,
    ExecutionError, ExecutionReport, Instruction, Opcode, StepWitness, VmFault,
};

/// The multi-threaded VM, 32- or 64-bit.
///
/// Threads are scheduled cooperatively: the active thread runs until it yields, blocks on a
/// futex, exits or exhausts its quantum, then moves to the other stack.
pub struct MultiThreadedVm<O> {
    pub state: MultiThreadedState,
    features: SyscallFeatures,
    tracker: MemoryTracker,
    oracle: TrackingOracle<O>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    report: ExecutionReport,
}

impl<O: PreimageOracle> MultiThreadedVm<O> {
    /// Guest output is discarded until [`MultiThreadedVm::with_output`] is called.
    pub fn new(state: MultiThreadedState, oracle: O) -> Self {
        let arch = state.arch;
        Self {
            state,
            features: SyscallFeatures { fcntl_getfd: true, eventfd: true },
            tracker: MemoryTracker::new(arch),
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

    /// Executes one step, returning the step witness when `proof` is set.
    ///
    /// A step either runs an instruction of the active thread or performs a scheduling action
    /// (popping an exited thread, preempting the active one).
    pub fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError> {
        self.oracle.reset();
        self.tracker.reset(proof);

        let mut witness = if proof {
            let (state, state_hash) = self.state.encode_witness();
            let mut proof_data = match self.state.encode_thread_proof() {
                Ok(proof_data) => proof_data,
                Err(fault) => return Err(ExecutionError::Fault { fault, witness: None }),
            };
            let pc = self.state.current_thread().map(|thread| thread.cpu.pc).unwrap_or_default();
            proof_data.extend_from_slice(&self.state.memory.merkle_proof(pc));
            Some(StepWitness { state, state_hash, proof_data, ..Default::default() })
        } else {
            None
        };

        if let Err(fault) = self.mips_step() {
            tracing::debug!("fault at step {}: {fault}", self.state.step);
            return Err(ExecutionError::Fault { fault, witness: witness.map(Box::new) });
        }

        if let Some(witness) = witness.as_mut() {
            witness.proof_data.extend_from_slice(self.tracker.mem_proof());
            witness.proof_data.extend_from_slice(self.tracker.mem_proof2());
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

        let thread = self.state.current_thread()?;
        let (thread_id, pc) = (thread.thread_id, thread.cpu.pc);
        if thread.exited {
            tracing::trace!("popping exited thread {thread_id}");
            self.pop_thread();
            return Ok(());
        }
        if self.state.steps_since_last_context_switch >= SCHED_QUANTUM {
            tracing::trace!("preempting thread {thread_id}");
            self.report.preemptions += 1;
            self.preempt_thread();
            return Ok(());
        }
        self.state.steps_since_last_context_switch += 1;

        let arch = self.state.arch;
        let insn = fetch(arch, &mut self.state.memory, pc)?;
        self.report.opcode_counts[insn.opcode] += 1;

        if insn.is_syscall() {
            return self.handle_syscall();
        }
        if insn.opcode.is_rmw() {
            return self.handle_rmw(&insn);
        }

        let (thread, memory) = self.state.active_thread_and_memory()?;
        let stored = exec_core_step(
            arch,
            &mut thread.cpu,
            &mut thread.registers,
            memory,
            &mut self.tracker,
            &insn,
        )?;
        if let Some(addr) = stored {
            self.handle_memory_update(addr);
        }
        Ok(())
    }

    /// `ll`, `sc`, `lld` and `scd` against the single reservation.
    fn handle_rmw(&mut self, insn: &Instruction) -> Result<(), VmFault> {
        let arch = self.state.arch;
        let thread = self.state.current_thread()?;
        let thread_id = thread.thread_id;
        let base = thread.registers[insn.rs()];
        let rt_reg = insn.rt();
        let rt = thread.registers[rt_reg];

        let addr = arch.mask(base.wrapping_add(arch.sign_extend(insn.imm(), 16)));
        let eff_addr = addr & arch.address_mask();
        let (byte_len, target_status) = match insn.opcode {
            Opcode::LL | Opcode::SC => (4, LlStatus::Active32),
            _ => (8, LlStatus::Active64),
        };

        let ret_val = match insn.opcode {
            Opcode::LL | Opcode::LLD => {
                self.tracker.track(&mut self.state.memory, eff_addr)?;
                let mem = self.state.memory.get_word(eff_addr)?;
                self.state.ll_status = target_status;
                self.state.ll_address = addr;
                self.state.ll_owner = thread_id;
                select_sub_word(arch, addr, mem, byte_len, true)
            }
            _ if self.state.ll_status == target_status
                && self.state.ll_owner == thread_id
                && self.state.ll_address == addr =>
            {
                self.clear_reservation();
                self.tracker.track(&mut self.state.memory, eff_addr)?;
                let mem = self.state.memory.get_word(eff_addr)?;
                let val = update_sub_word(arch, addr, mem, byte_len, rt);
                self.state.memory.set_word(eff_addr, val)?;
                1
            }
            // failed store-conditional
            _ => 0,
        };

        let thread = self.state.current_thread_mut()?;
        handle_rd(arch, &mut thread.cpu, &mut thread.registers, rt_reg, ret_val, true);
        Ok(())
    }

    /// A store to the reserved word breaks the reservation.
    fn handle_memory_update(&mut self, eff_addr: u64) {
        if eff_addr == self.state.ll_address & self.state.arch.address_mask() {
            self.clear_reservation();
        }
    }

    fn clear_reservation(&mut self) {
        self.state.ll_status = LlStatus::None;
        self.state.ll_address = 0;
        self.state.ll_owner = 0;
    }

    /// Moves the active thread to the bottom-facing end of the other stack.
    fn preempt_thread(&mut self) {
        if let Some(thread) = self.state.active_stack_mut().pop() {
            self.state.inactive_stack_mut().push(thread);
        }
        if self.state.active_stack().is_empty() {
            self.state.traverse_right = !self.state.traverse_right;
        }
        self.state.steps_since_last_context_switch = 0;
    }

    fn push_thread(&mut self, thread: ThreadState) {
        self.state.active_stack_mut().push(thread);
    }

    fn pop_thread(&mut self) {
        self.state.active_stack_mut().pop();
        if self.state.active_stack().is_empty() {
            self.state.traverse_right = !self.state.traverse_right;
        }
        self.state.steps_since_last_context_switch = 0;
    }

    fn handle_syscall(&mut self) -> Result<(), VmFault> {
        let arch = self.state.arch;
        let thread = self.state.current_thread()?;
        let args = SyscallArgs::from_registers(&thread.registers);
        let thread_id = thread.thread_id;

        let code = SyscallCode::from_u64(arch, args.number)
            .ok_or(VmFault::UnimplementedSyscall(args.number))?;
        self.report.syscall_counts[code] += 1;
        tracing::trace!("thread {thread_id}: syscall {code}");

        let (v0, v1) = match code {
            SyscallCode::SYS_MMAP => {
                let (v0, v1, heap) = sys_mmap(arch, args.a0, args.a1, self.state.heap);
                self.state.heap = heap;
                (v0, v1)
            }
            SyscallCode::SYS_BRK => sys_brk(arch),
            SyscallCode::SYS_CLONE => return self.sys_clone(args.a0, args.a1),
            SyscallCode::SYS_EXIT_GROUP => {
                self.state.exited = true;
                self.state.exit_code = args.a0 as u8;
                tracing::debug!("exit group with code {}", self.state.exit_code);
                return Ok(());
            }
            SyscallCode::SYS_EXIT => {
                let last_thread = self.state.thread_count() == 1;
                let thread = self.state.current_thread_mut()?;
                thread.exited = true;
                thread.exit_code = args.a0 as u8;
                if last_thread {
                    self.state.exited = true;
                    self.state.exit_code = args.a0 as u8;
                }
                return Ok(());
            }
            SyscallCode::SYS_READ => {
                self.with_syscall_context(|ctx| sys_read(ctx, args.a0, args.a1, args.a2))?
            }
            SyscallCode::SYS_WRITE => {
                self.with_syscall_context(|ctx| sys_write(ctx, args.a0, args.a1, args.a2))?
            }
            SyscallCode::SYS_FCNTL => sys_fcntl(arch, self.features, args.a0, args.a1),
            SyscallCode::SYS_SCHED_YIELD | SyscallCode::SYS_NANOSLEEP => {
                return self.syscall_yield();
            }
            SyscallCode::SYS_GETTID => (thread_id, 0),
            SyscallCode::SYS_GETPID => (0, 0),
            SyscallCode::SYS_OPEN => (arch.sys_error_signal(), MIPS_EBADF),
            SyscallCode::SYS_FUTEX => match args.a1 {
                FUTEX_WAIT_PRIVATE => {
                    let eff_addr = args.a0 & arch.address_mask();
                    self.tracker.track(&mut self.state.memory, eff_addr)?;
                    let mem = self.state.memory.get_u32(args.a0 & !3)?;
                    if mem != args.a2 as u32 {
                        (arch.sys_error_signal(), MIPS_EAGAIN)
                    } else {
                        return self.syscall_yield();
                    }
                }
                FUTEX_WAKE_PRIVATE => return self.syscall_yield(),
                _ => (arch.sys_error_signal(), MIPS_EINVAL),
            },
            SyscallCode::SYS_CLOCK_GETTIME => {
                let step = self.state.step;
                self.with_syscall_context(|ctx| sys_clock_gettime(ctx, step, args.a0, args.a1))?
            }
            SyscallCode::SYS_EVENTFD2 => {
                // blocking descriptors would deadlock the single scheduler
                if args.a1 & EFD_NONBLOCK == 0 {
                    (arch.sys_error_signal(), MIPS_EINVAL)
                } else {
                    (FD_EVENT_FD, 0)
                }
            }
            code if code.is_noop() => (0, 0),
            _ => return Err(VmFault::UnimplementedSyscall(args.number)),
        };

        let thread = self.state.current_thread_mut()?;
        handle_syscall_updates(arch, &mut thread.cpu, &mut thread.registers, v0, v1);
        Ok(())
    }

    fn sys_clone(&mut self, flags: u64, stack: u64) -> Result<(), VmFault> {
        let arch = self.state.arch;
        let thread_id = self.state.next_thread_id;
        let parent = self.state.current_thread_mut()?;
        let child = clone_thread(arch, parent, thread_id, flags, stack)?;
        handle_syscall_updates(arch, &mut parent.cpu, &mut parent.registers, thread_id, 0);

        tracing::debug!("thread {} cloned thread {thread_id}", parent.thread_id);
        self.push_thread(child);
        self.state.next_thread_id += 1;
        self.state.steps_since_last_context_switch = 0;
        self.report.threads_created += 1;
        Ok(())
    }

    /// Returns success to the active thread and switches to the next one.
    fn syscall_yield(&mut self) -> Result<(), VmFault> {
        let arch = self.state.arch;
        let thread = self.state.current_thread_mut()?;
        handle_syscall_updates(arch, &mut thread.cpu, &mut thread.registers, 0, 0);
        self.preempt_thread();
        Ok(())
    }

    /// Runs an I/O handler, then drops the reservation if it stored to the reserved word.
    fn with_syscall_context<F>(&mut self, f: F) -> Result<(u64, u64), VmFault>
    where
        F: FnOnce(&mut SyscallContext<'_, O>) -> Result<(u64, u64), VmFault>,
    {
        let state = &mut self.state;
        let mut ctx = SyscallContext::new(
            state.arch,
            self.features,
            &mut state.memory,
            &mut self.tracker,
            &mut self.oracle,
            &mut state.preimage_key,
            &mut state.preimage_offset,
            &mut state.last_hint,
            &mut *self.stdout,
            &mut *self.stderr,
        );
        let ret = f(&mut ctx)?;
        for addr in ctx.into_written() {
            self.handle_memory_update(addr);
        }
        Ok(ret)
    }
}
