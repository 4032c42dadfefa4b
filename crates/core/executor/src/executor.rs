use std::io;

use thiserror::Error;

use cannon_primitives::Hash;

use crate::{
    context::CannonContext,
    memory::Memory,
    multi::MultiThreadedVm,
    oracle::PreimageOracle,
    single::SingleThreadedVm,
    state::{StateVersion, VersionedState},
    syscalls::SyscallFeatures,
    ExecutionReport, StepWitness, VmFault,
};

/// Steps between two progress lines of [`Executor::run`].
const LOG_INTERVAL: u64 = 10_000_000;

/// Errors that the [`Executor`] can throw.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The VM faulted. With proofs enabled the witness of the pre-state is attached so the fault
    /// can be proven on-chain.
    #[error("{fault}")]
    Fault { fault: VmFault, witness: Option<Box<StepWitness>> },

    /// The execution failed with an exceeded step limit.
    #[error("exceeded cycle limit of {0}")]
    ExceededCycleLimit(u64),

    /// The execution failed with a non-zero exit code.
    #[error("execution failed with exit code {0}")]
    HaltWithNonZeroExitCode(u8),
}

impl From<VmFault> for ExecutionError {
    fn from(fault: VmFault) -> Self {
        ExecutionError::Fault { fault, witness: None }
    }
}

/// A fault-proof VM: steps a state, optionally producing the witness of each step.
pub trait Fpvm {
    fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError>;

    fn exited(&self) -> bool;

    fn exit_code(&self) -> u8;

    /// Number of steps taken since the state was created.
    fn steps(&self) -> u64;

    /// PC of the running CPU or thread, `None` when no thread is left.
    fn pc(&self) -> Option<u64>;

    fn memory(&self) -> &Memory;

    fn encode_witness(&mut self) -> (Vec<u8>, Hash);

    fn report(&self) -> &ExecutionReport;

    /// Flushes guest output and completes the report.
    fn finish(&mut self);
}

impl<O: PreimageOracle> Fpvm for SingleThreadedVm<O> {
    fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError> {
        SingleThreadedVm::step(self, proof)
    }

    fn exited(&self) -> bool {
        self.state.exited
    }

    fn exit_code(&self) -> u8 {
        self.state.exit_code
    }

    fn steps(&self) -> u64 {
        self.state.step
    }

    fn pc(&self) -> Option<u64> {
        Some(self.state.cpu.pc)
    }

    fn memory(&self) -> &Memory {
        &self.state.memory
    }

    fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        SingleThreadedVm::encode_witness(self)
    }

    fn report(&self) -> &ExecutionReport {
        SingleThreadedVm::report(self)
    }

    fn finish(&mut self) {
        SingleThreadedVm::finish(self);
    }
}

impl<O: PreimageOracle> Fpvm for MultiThreadedVm<O> {
    fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError> {
        MultiThreadedVm::step(self, proof)
    }

    fn exited(&self) -> bool {
        self.state.exited
    }

    fn exit_code(&self) -> u8 {
        self.state.exit_code
    }

    fn steps(&self) -> u64 {
        self.state.step
    }

    fn pc(&self) -> Option<u64> {
        self.state.current_thread().ok().map(|thread| thread.cpu.pc)
    }

    fn memory(&self) -> &Memory {
        &self.state.memory
    }

    fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        MultiThreadedVm::encode_witness(self)
    }

    fn report(&self) -> &ExecutionReport {
        MultiThreadedVm::report(self)
    }

    fn finish(&mut self) {
        MultiThreadedVm::finish(self);
    }
}

/// The VM matching a state version.
pub enum Vm<O> {
    SingleThreaded(SingleThreadedVm<O>),
    MultiThreaded(MultiThreadedVm<O>),
}

impl<O: PreimageOracle> Vm<O> {
    fn as_fpvm(&self) -> &dyn Fpvm {
        match self {
            Vm::SingleThreaded(vm) => vm,
            Vm::MultiThreaded(vm) => vm,
        }
    }

    fn as_fpvm_mut(&mut self) -> &mut dyn Fpvm {
        match self {
            Vm::SingleThreaded(vm) => vm,
            Vm::MultiThreaded(vm) => vm,
        }
    }
}

/// Runs a versioned state to completion or for a bounded number of steps.
pub struct Executor<O> {
    vm: Vm<O>,
    version: StateVersion,

    /// The maximum number of steps for one call to [`Executor::run`].
    pub max_steps: Option<u64>,

    /// Whether a non-zero exit code is reported as an error.
    pub stop_on_non_zero_exit: bool,

    /// Whether we should log the report at the end of a run.
    pub print_report: bool,
}

impl<O: PreimageOracle> Executor<O> {
    /// Create a new [`Executor`] forwarding guest output to the host.
    pub fn new(state: VersionedState, oracle: O) -> Self {
        Self::with_context(state, oracle, CannonContext::default())
    }

    /// Create a new executor from a state, a preimage oracle and a context.
    pub fn with_context(state: VersionedState, oracle: O, context: CannonContext) -> Self {
        let stdout = context.stdout.unwrap_or_else(|| Box::new(io::stdout()));
        let stderr = context.stderr.unwrap_or_else(|| Box::new(io::stderr()));
        let version = state.version();
        let vm = match state {
            VersionedState::SingleThreaded { version, state } => {
                let features = SyscallFeatures {
                    fcntl_getfd: version == StateVersion::SingleThreaded2,
                    eventfd: false,
                };
                Vm::SingleThreaded(
                    SingleThreadedVm::new(state, oracle, features).with_output(stdout, stderr),
                )
            }
            VersionedState::MultiThreaded { state, .. } => {
                Vm::MultiThreaded(MultiThreadedVm::new(state, oracle).with_output(stdout, stderr))
            }
        };
        tracing::debug!("created executor for state version {version:?}");
        Self {
            vm,
            version,
            max_steps: context.max_steps,
            stop_on_non_zero_exit: context.stop_on_non_zero_exit,
            print_report: context.print_report,
        }
    }

    #[must_use]
    pub fn version(&self) -> StateVersion {
        self.version
    }

    pub fn vm(&self) -> &Vm<O> {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm<O> {
        &mut self.vm
    }

    /// Executes a single step. See [`Fpvm::step`].
    pub fn step(&mut self, proof: bool) -> Result<Option<StepWitness>, ExecutionError> {
        self.vm.as_fpvm_mut().step(proof)
    }

    pub fn exited(&self) -> bool {
        self.vm.as_fpvm().exited()
    }

    pub fn exit_code(&self) -> u8 {
        self.vm.as_fpvm().exit_code()
    }

    pub fn steps(&self) -> u64 {
        self.vm.as_fpvm().steps()
    }

    pub fn report(&self) -> &ExecutionReport {
        self.vm.as_fpvm().report()
    }

    /// Witness of the current state and its hash.
    pub fn state_hash(&mut self) -> (Vec<u8>, Hash) {
        self.vm.as_fpvm_mut().encode_witness()
    }

    /// Executes the program until it exits.
    ///
    /// # Errors
    ///
    /// This function will return an error if the VM faults, if the step limit is reached first,
    /// or if the program exits with a non-zero code while `stop_on_non_zero_exit` is set.
    pub fn run(&mut self) -> Result<(), ExecutionError> {
        let span = tracing::info_span!("run", version = ?self.version);
        let _enter = span.enter();

        let result = self.execute();
        let vm = self.vm.as_fpvm_mut();
        vm.finish();
        if self.print_report {
            tracing::info!("execution report:\n{}", vm.report());
        }
        result?;

        let exit_code = vm.exit_code();
        tracing::info!("program exited with code {exit_code} after {} steps", vm.steps());
        if exit_code != 0 && self.stop_on_non_zero_exit {
            return Err(ExecutionError::HaltWithNonZeroExitCode(exit_code));
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), ExecutionError> {
        let max_steps = self.max_steps;
        let vm = self.vm.as_fpvm_mut();
        let start = vm.steps();
        while !vm.exited() {
            if let Some(max_steps) = max_steps {
                if vm.steps() - start >= max_steps {
                    tracing::warn!("stopping at step {}, limit of {max_steps} reached", vm.steps());
                    return Err(ExecutionError::ExceededCycleLimit(max_steps));
                }
            }
            vm.step(false)?;
            if vm.steps() % LOG_INTERVAL == 0 {
                tracing::info!(
                    "step = {} pc = {:#x} pages = {}",
                    vm.steps(),
                    vm.pc().unwrap_or_default(),
                    vm.memory().page_count()
                );
            }
        }
        Ok(())
    }

    /// Consumes the executor, returning the state it ran.
    pub fn into_state(self) -> VersionedState {
        let version = self.version;
        match self.vm {
            Vm::SingleThreaded(vm) => VersionedState::SingleThreaded { version, state: vm.state },
            Vm::MultiThreaded(vm) => VersionedState::MultiThreaded { version, state: vm.state },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use cannon_primitives::consts::fd::FD_STDOUT;

    use super::*;
    use crate::{
        exec::tests::{i_type, SYSCALL},
        oracle::NullOracle,
        single::tests::SharedBuffer,
        syscalls::SyscallCode,
    };

    fn _assert_send<T: Send>() {}

    /// Executor needs to be Send so it can be moved to a worker thread.
    fn _assert_executor_is_send() {
        _assert_send::<Executor<NullOracle>>();
    }

    /// Writes "ok" to stdout and exits with `exit_code`.
    fn exit_program(version: StateVersion, exit_code: u16) -> VersionedState {
        let arch = version.arch();
        let num = |code: SyscallCode| code.number(arch).unwrap() as u16;
        let program = [
            // addiu $v0, $zero, write ; addiu $a0, $zero, 1 ; addiu $a1, $zero, 0x100
            i_type(0x09, 0, 2, num(SyscallCode::SYS_WRITE)),
            i_type(0x09, 0, 4, FD_STDOUT as u16),
            i_type(0x09, 0, 5, 0x100),
            // addiu $a2, $zero, 2 ; syscall
            i_type(0x09, 0, 6, 2),
            SYSCALL,
            // addiu $v0, $zero, exit_group ; addiu $a0, $zero, exit_code ; syscall
            i_type(0x09, 0, 2, num(SyscallCode::SYS_EXIT_GROUP)),
            i_type(0x09, 0, 4, exit_code),
            SYSCALL,
        ];
        let mut state = VersionedState::new(version, 0);
        let memory = state.memory_mut();
        for (i, insn) in program.iter().enumerate() {
            memory.set_u32(i as u64 * 4, *insn).unwrap();
        }
        memory.set_memory_range(0x100, &b"ok"[..]).unwrap();
        state
    }

    fn context(out: &SharedBuffer) -> CannonContext {
        CannonContext::builder().stdout(out.clone()).stderr(io::sink()).build()
    }

    #[test]
    fn runs_every_version_to_exit() {
        for version in [
            StateVersion::SingleThreaded,
            StateVersion::MultiThreaded,
            StateVersion::SingleThreaded2,
            StateVersion::MultiThreaded64,
        ] {
            let out = SharedBuffer::default();
            let mut executor =
                Executor::with_context(exit_program(version, 0), NullOracle, context(&out));
            executor.run().unwrap();
            assert!(executor.exited());
            assert_eq!(executor.exit_code(), 0);
            assert_eq!(executor.steps(), 8);
            assert_eq!(out.contents(), b"ok");
            assert_eq!(executor.report().syscall_counts[SyscallCode::SYS_WRITE], 1);
            assert_eq!(executor.report().pages, 1);

            let state = executor.into_state();
            assert_eq!(state.version(), version);
            assert!(state.exited());
        }
    }

    #[test]
    fn step_limit() {
        let mut context = context(&SharedBuffer::default());
        context.max_steps = Some(3);
        let mut executor =
            Executor::with_context(exit_program(StateVersion::MultiThreaded, 0), NullOracle, context);
        assert!(matches!(executor.run(), Err(ExecutionError::ExceededCycleLimit(3))));
        assert_eq!(executor.steps(), 3);

        // The limit applies per run.
        assert!(matches!(executor.run(), Err(ExecutionError::ExceededCycleLimit(3))));
        executor.run().unwrap();
        assert!(executor.exited());
    }

    #[test]
    fn non_zero_exit() {
        let state = exit_program(StateVersion::SingleThreaded, 1);
        let mut executor =
            Executor::with_context(state.clone(), NullOracle, context(&SharedBuffer::default()));
        executor.run().unwrap();
        assert_eq!(executor.exit_code(), 1);
        let (_, hash) = executor.state_hash();
        assert_eq!(hash[0], crate::state::VmStatus::Invalid as u8);

        let mut context = context(&SharedBuffer::default());
        context.stop_on_non_zero_exit = true;
        let mut executor = Executor::with_context(state, NullOracle, context);
        assert!(matches!(executor.run(), Err(ExecutionError::HaltWithNonZeroExitCode(1))));
    }

    #[test]
    fn fault_stops_the_run() {
        let mut state = VersionedState::new(StateVersion::MultiThreaded, 0);
        // ld does not exist on 32-bit targets
        state.memory_mut().set_u32(0, 0xDFA8_0000).unwrap();
        let mut executor = Executor::new(state, NullOracle);
        let err = executor.run().unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Fault { fault: VmFault::InvalidInstruction(0xDFA8_0000), witness: None }
        ));
    }

    #[test]
    fn proof_steps_match_plain_steps() {
        let mut plain = Executor::with_context(
            exit_program(StateVersion::MultiThreaded, 0),
            NullOracle,
            context(&SharedBuffer::default()),
        );
        let mut proven = Executor::with_context(
            exit_program(StateVersion::MultiThreaded, 0),
            NullOracle,
            context(&SharedBuffer::default()),
        );
        while !plain.exited() {
            let pre = proven.state_hash();
            assert!(plain.step(false).unwrap().is_none());
            let witness = proven.step(true).unwrap().unwrap();
            assert_eq!((witness.state, witness.state_hash), pre);
            assert_eq!(plain.state_hash(), proven.state_hash());
        }
        assert!(proven.exited());
    }
}
