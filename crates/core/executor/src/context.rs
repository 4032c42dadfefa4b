use core::mem::take;
use std::io::Write;

/// Context to run a program inside the VM.
#[derive(Default)]
pub struct CannonContext {
    /// The maximum number of steps to execute in one run.
    pub max_steps: Option<u64>,

    /// Destination of guest stdout; `None` forwards to the host's stdout.
    pub stdout: Option<Box<dyn Write + Send>>,

    /// Destination of guest stderr; `None` forwards to the host's stderr.
    pub stderr: Option<Box<dyn Write + Send>>,

    /// Fail the run when the guest exits with a non-zero code.
    pub stop_on_non_zero_exit: bool,

    /// Log the execution report when a run finishes.
    pub print_report: bool,
}

/// A builder for [`CannonContext`].
#[derive(Default)]
pub struct CannonContextBuilder {
    max_steps: Option<u64>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    stop_on_non_zero_exit: bool,
    print_report: bool,
}

impl CannonContext {
    /// Create a new context builder. See [`CannonContextBuilder`] for more details.
    #[must_use]
    pub fn builder() -> CannonContextBuilder {
        CannonContextBuilder::new()
    }
}

impl CannonContextBuilder {
    /// Create a new [`CannonContextBuilder`].
    ///
    /// Prefer using [`CannonContext::builder`].
    #[must_use]
    pub fn new() -> Self {
        CannonContextBuilder::default()
    }

    /// Build and return the [`CannonContext`].
    ///
    /// Clears and resets the builder, allowing it to be reused.
    pub fn build(&mut self) -> CannonContext {
        CannonContext {
            max_steps: take(&mut self.max_steps),
            stdout: take(&mut self.stdout),
            stderr: take(&mut self.stderr),
            stop_on_non_zero_exit: take(&mut self.stop_on_non_zero_exit),
            print_report: take(&mut self.print_report),
        }
    }

    /// Set the maximum number of steps to execute.
    pub fn max_steps(&mut self, max_steps: u64) -> &mut Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Redirect guest stdout.
    pub fn stdout(&mut self, writer: impl Write + Send + 'static) -> &mut Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Redirect guest stderr.
    pub fn stderr(&mut self, writer: impl Write + Send + 'static) -> &mut Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    pub fn stop_on_non_zero_exit(&mut self, stop: bool) -> &mut Self {
        self.stop_on_non_zero_exit = stop;
        self
    }

    pub fn print_report(&mut self, print: bool) -> &mut Self {
        self.print_report = print;
        self
    }
}
