//! Terminal host: answers `input` prompts and drives step debugging from
//! stdin.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use keyweave_core::eval::Value;
use keyweave_core::executor::{MacroExecutor, RunStatus};
use keyweave_core::host::MacroHost;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, watch, Mutex};

/// Shared line reader over stdin. Prompts and the debugger never read at
/// the same time, but both need the same buffered reader.
#[derive(Clone)]
pub struct Terminal {
    lines: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }

    /// Next line, or `None` at end of input.
    pub async fn read_line(&self) -> Option<String> {
        self.lines.lock().await.next_line().await.ok().flatten()
    }
}

pub struct TerminalHost {
    terminal: Terminal,
    breakpoint_hits: mpsc::UnboundedSender<usize>,
}

impl TerminalHost {
    pub fn new(terminal: Terminal) -> (Self, mpsc::UnboundedReceiver<usize>) {
        let (breakpoint_hits, rx) = mpsc::unbounded_channel();
        (
            Self {
                terminal,
                breakpoint_hits,
            },
            rx,
        )
    }
}

#[async_trait]
impl MacroHost for TerminalHost {
    async fn ask_input(&self, prompt: &str) -> Option<String> {
        eprint!("{}: ", prompt);
        self.terminal.read_line().await
    }

    async fn on_breakpoint_hit(&self, line: usize, variables: &BTreeMap<String, Value>) {
        eprintln!("Breakpoint at line {}", line);
        for (name, value) in variables {
            eprintln!("  {} = {}", name, value);
        }
        let _ = self.breakpoint_hits.send(line);
    }
}

/// Step through the run from the terminal.
///
/// After each breakpoint hit, an empty line executes one action and `c`
/// continues to the next breakpoint. End of input also continues.
pub async fn debug_console(
    executor: MacroExecutor,
    terminal: Terminal,
    mut hits: mpsc::UnboundedReceiver<usize>,
) {
    let mut status = executor.subscribe_status();
    while hits.recv().await.is_some() {
        while parked(&executor, &mut status).await {
            // A breakpoint reached while stepping is already on screen.
            while hits.try_recv().is_ok() {}
            let state = executor.get_current_state().await;
            eprint!("[line {}] Enter to step, c to continue > ", state.line);
            match terminal.read_line().await {
                Some(answer) if answer.trim().eq_ignore_ascii_case("c") => {
                    executor.continue_execution();
                    break;
                }
                Some(_) => {
                    status.borrow_and_update();
                    executor.step_next();
                    // The stepped action reports Running before it parks again.
                    if status.changed().await.is_err() {
                        break;
                    }
                }
                None => {
                    executor.continue_execution();
                    break;
                }
            }
        }
    }
}

/// Wait until the run is parked at a step, returning `false` if it
/// finished or left step mode instead.
async fn parked(executor: &MacroExecutor, status: &mut watch::Receiver<RunStatus>) -> bool {
    let paused = match status.wait_for(|s| *s != RunStatus::Running).await {
        Ok(current) => *current == RunStatus::Paused,
        Err(_) => false,
    };
    paused && executor.get_current_state().await.step_mode
}
