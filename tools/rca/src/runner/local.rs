use super::{run_captured, Execution, ExecutionBackend, RunPlan};
use crate::runtime::{Clock, ProcessRunner};
use crate::types::RunBackend;

/// Runs the test program directly on the host, inheriting the environment.
pub struct LocalBackend<'a> {
    program: &'a str,
    runner: &'a dyn ProcessRunner,
    clock: &'a dyn Clock,
}

impl<'a> LocalBackend<'a> {
    pub fn new(program: &'a str, runner: &'a dyn ProcessRunner, clock: &'a dyn Clock) -> Self {
        Self {
            program,
            runner,
            clock,
        }
    }
}

impl ExecutionBackend for LocalBackend<'_> {
    fn kind(&self) -> RunBackend {
        RunBackend::Local
    }

    fn command(&self, plan: &RunPlan) -> Vec<String> {
        std::iter::once(self.program.to_string())
            .chain(plan.args.iter().cloned())
            .collect()
    }

    fn execute(&self, plan: &RunPlan) -> Execution {
        run_captured(
            self.runner,
            self.clock,
            &self.command(plan),
            &plan.repo,
            plan.env.clone(),
            plan.timeout,
        )
    }
}
