//! Host callbacks used while a macro runs.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::eval::Value;

/// The application embedding the executor.
///
/// The executor calls into the host for `input` prompts and to announce
/// breakpoint hits. Both calls happen on the run task, so an
/// implementation that needs the user must answer asynchronously rather
/// than block the runtime.
#[async_trait]
pub trait MacroHost: Send + Sync {
    /// Ask the user for a string. `None` means the prompt was dismissed.
    async fn ask_input(&self, prompt: &str) -> Option<String>;

    /// Called when a breakpoint is hit, before the executor waits for a
    /// step signal.
    async fn on_breakpoint_hit(&self, _line: usize, _variables: &BTreeMap<String, Value>) {}
}
