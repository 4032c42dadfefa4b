//! An emulator for the MIPS subset executed by the Cannon fault-proof VM.
//!
//! Memory is a sparse set of pages under a binary Merkle tree so that every step can be proven
//! with a witness of the pre-state plus the Merkle proofs of the words it touched.

mod arch;
mod context;
mod exec;
mod executor;
mod fault;
mod instruction;
pub mod memory;
mod multi;
mod opcode;
pub mod oracle;
mod program;
pub mod report;
mod single;
pub mod state;
pub mod syscalls;
mod tracker;
mod utils;
mod witness;

pub use arch::*;
pub use context::*;
pub use executor::*;
pub use fault::*;
pub use instruction::*;
pub use multi::*;
pub use opcode::*;
pub use program::*;
pub use report::*;
pub use single::*;
pub use state::{StateVersion, VersionedState};
pub use utils::*;
pub use witness::*;
