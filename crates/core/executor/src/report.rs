use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    ops::AddAssign,
};

use enum_map::{EnumArray, EnumMap};
use hashbrown::HashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{syscalls::SyscallCode, Opcode};

/// An execution report.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub opcode_counts: Box<EnumMap<Opcode, u64>>,
    pub syscall_counts: Box<EnumMap<SyscallCode, u64>>,
    /// Steps executed, including scheduler-only steps.
    pub steps: u64,
    /// Context switches forced by the scheduling quantum.
    pub preemptions: u64,
    /// Threads created through `clone`.
    pub threads_created: u64,
    pub preimage_requests: u64,
    pub preimage_bytes: u64,
    /// Number of memory pages at the end of execution.
    pub pages: u64,
}

impl ExecutionReport {
    /// Compute the total number of instructions run within the execution.
    #[must_use]
    pub fn total_instruction_count(&self) -> u64 {
        self.opcode_counts.values().sum()
    }

    /// Compute the total number of syscalls made within the execution.
    #[must_use]
    pub fn total_syscall_count(&self) -> u64 {
        self.syscall_counts.values().sum()
    }
}

/// Adds the counters of `rhs` into `lhs`.
fn counts_add_assign<K, V>(lhs: &mut EnumMap<K, V>, rhs: EnumMap<K, V>)
where
    K: EnumArray<V>,
    V: AddAssign,
{
    for (k, v) in rhs {
        lhs[k] += v;
    }
}

impl AddAssign for ExecutionReport {
    fn add_assign(&mut self, rhs: Self) {
        counts_add_assign(&mut self.opcode_counts, *rhs.opcode_counts);
        counts_add_assign(&mut self.syscall_counts, *rhs.syscall_counts);
        self.steps += rhs.steps;
        self.preemptions += rhs.preemptions;
        self.threads_created += rhs.threads_created;
        self.preimage_requests += rhs.preimage_requests;
        self.preimage_bytes += rhs.preimage_bytes;
        self.pages = self.pages.max(rhs.pages);
    }
}

impl Display for ExecutionReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        writeln!(f, "steps: {}", self.steps)?;
        writeln!(f, "opcode counts ({} total instructions):", self.total_instruction_count())?;
        for line in generate_execution_report(self.opcode_counts.as_ref()) {
            writeln!(f, "  {line}")?;
        }
        writeln!(f, "syscall counts ({} total syscall instructions):", self.total_syscall_count())?;
        for line in generate_execution_report(self.syscall_counts.as_ref()) {
            writeln!(f, "  {line}")?;
        }
        writeln!(f, "preemptions: {}", self.preemptions)?;
        writeln!(f, "threads created: {}", self.threads_created)?;
        writeln!(
            f,
            "preimage requests: {} ({} bytes)",
            self.preimage_requests, self.preimage_bytes
        )?;
        write!(f, "pages: {}", self.pages)
    }
}

/// Formats non-zero counters, largest first.
fn generate_execution_report<'a, K: Display + 'a>(
    counts: impl IntoIterator<Item = (K, &'a u64)>,
) -> Vec<String> {
    let entries = counts
        .into_iter()
        .filter(|(_, count)| **count > 0)
        .map(|(key, count)| (key.to_string(), *count))
        .collect::<HashMap<_, _>>();
    let width = entries.values().map(|count| count.to_string().len()).max().unwrap_or(0);
    entries
        .into_iter()
        .sorted_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(label, count)| format!("{count:>width$} {label}"))
        .collect()
}
