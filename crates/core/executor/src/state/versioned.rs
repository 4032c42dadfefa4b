use std::io::{Read, Write};

use cannon_primitives::Hash;

use crate::{memory::Memory, Arch, VmFault};

use super::{MultiThreadedState, SingleThreadedState, StateError, StateVersion};

/// A state tagged with the version it is encoded as.
///
/// Binary encoding is `[version u8][state]`.
#[derive(Debug, Clone)]
pub enum VersionedState {
    SingleThreaded { version: StateVersion, state: SingleThreadedState },
    MultiThreaded { version: StateVersion, state: MultiThreadedState },
}

impl VersionedState {
    /// Fresh state for `version` starting at `entry` with the default heap start.
    #[must_use]
    pub fn new(version: StateVersion, entry: u64) -> Self {
        let arch = version.arch();
        if version.is_multi_threaded() {
            let state = MultiThreadedState::new(arch, entry, arch.heap_start());
            VersionedState::MultiThreaded { version, state }
        } else {
            let state = SingleThreadedState::new(entry, arch.heap_start());
            VersionedState::SingleThreaded { version, state }
        }
    }

    #[must_use]
    pub fn version(&self) -> StateVersion {
        match self {
            VersionedState::SingleThreaded { version, .. }
            | VersionedState::MultiThreaded { version, .. } => *version,
        }
    }

    #[must_use]
    pub fn arch(&self) -> Arch {
        self.version().arch()
    }

    #[must_use]
    pub fn memory(&self) -> &Memory {
        match self {
            VersionedState::SingleThreaded { state, .. } => &state.memory,
            VersionedState::MultiThreaded { state, .. } => &state.memory,
        }
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        match self {
            VersionedState::SingleThreaded { state, .. } => &mut state.memory,
            VersionedState::MultiThreaded { state, .. } => &mut state.memory,
        }
    }

    /// Registers of the CPU, or of the active thread.
    pub fn registers_mut(&mut self) -> Result<&mut [u64; 32], VmFault> {
        match self {
            VersionedState::SingleThreaded { state, .. } => Ok(&mut state.registers),
            VersionedState::MultiThreaded { state, .. } => {
                Ok(&mut state.current_thread_mut()?.registers)
            }
        }
    }

    #[must_use]
    pub fn exited(&self) -> bool {
        match self {
            VersionedState::SingleThreaded { state, .. } => state.exited,
            VersionedState::MultiThreaded { state, .. } => state.exited,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            VersionedState::SingleThreaded { state, .. } => state.exit_code,
            VersionedState::MultiThreaded { state, .. } => state.exit_code,
        }
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        match self {
            VersionedState::SingleThreaded { state, .. } => state.step,
            VersionedState::MultiThreaded { state, .. } => state.step,
        }
    }

    pub fn encode_witness(&mut self) -> (Vec<u8>, Hash) {
        match self {
            VersionedState::SingleThreaded { state, .. } => state.encode_witness(),
            VersionedState::MultiThreaded { state, .. } => state.encode_witness(),
        }
    }

    pub fn serialize<W: Write>(&self, out: &mut W) -> Result<(), StateError> {
        out.write_all(&[self.version() as u8])?;
        match self {
            VersionedState::SingleThreaded { state, .. } => state.serialize(out),
            VersionedState::MultiThreaded { state, .. } => state.serialize(out),
        }
    }

    pub fn deserialize<R: Read>(input: &mut R) -> Result<Self, StateError> {
        let mut tag = [0u8; 1];
        input.read_exact(&mut tag)?;
        let version = StateVersion::try_from(tag[0])?;
        if version.is_multi_threaded() {
            let state = MultiThreadedState::deserialize(version.arch(), input)?;
            Ok(VersionedState::MultiThreaded { version, state })
        } else {
            let state = SingleThreadedState::deserialize(input)?;
            Ok(VersionedState::SingleThreaded { version, state })
        }
    }

    /// JSON encoding, only defined for the original single-threaded version.
    pub fn to_json(&self) -> Result<String, StateError> {
        match self {
            VersionedState::SingleThreaded { version: StateVersion::SingleThreaded, state } => {
                state.to_json()
            }
            _ => Err(StateError::JsonNotSupported(self.version())),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, StateError> {
        let state = SingleThreadedState::from_json(json)?;
        Ok(VersionedState::SingleThreaded { version: StateVersion::SingleThreaded, state })
    }
}
