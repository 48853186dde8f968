//! Action tree execution.
//!
//! [`MacroExecutor`] walks a parsed action tree on a spawned tokio task,
//! dispatching command lines to the command layer and implementing the
//! control-flow, pause, stop and debug-step semantics of the language.
//!
//! The executor is cheap to clone; clones share the same run state, so a
//! UI or signal handler can hold one clone to call [`stop`](MacroExecutor::stop),
//! [`pause`](MacroExecutor::pause) or [`step_next`](MacroExecutor::step_next)
//! while another awaits [`execute`](MacroExecutor::execute).
//!
//! Runtime errors never abort a run. Bad command lines, failing conditions
//! and missing functions are logged and execution moves on. Only a panic
//! inside the run task ends it early, reported as [`RunStatus::Failed`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyweave_core::context::ExecutionContext;
//! use keyweave_core::dry_run::DryRunDriver;
//! use keyweave_core::executor::{MacroExecutor, RunOptions};
//! use keyweave_core::parser::ScriptParser;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut ctx = ExecutionContext::new();
//!     let actions = ScriptParser::new(&mut ctx).parse("echo,hello").unwrap();
//!
//!     let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()));
//!     let report = executor.execute(ctx, actions, RunOptions::default(), None).await;
//!     println!("{:?} after {} commands", report.status, report.commands_executed);
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::action::{Action, Branch, BranchCondition, LoopCount};
use crate::color::Rgb;
use crate::commands::{command_name, CommandEnv, ScriptCommand};
use crate::config::ExecutorSettings;
use crate::context::{ExecutionContext, LOOP_COUNTER};
use crate::driver::InputDriver;
use crate::error::CommandError;
use crate::eval::{evaluate, EvalError, Value};
use crate::host::MacroHost;
use crate::log::{LogSink, RunLog};
use crate::parser::parse_loop_count;

/// Nesting limit for function calls, so runaway recursion is reported
/// instead of overflowing the stack.
const MAX_CALL_DEPTH: usize = 100;

/// Per-run parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    /// Divides every timed wait. Non-positive or non-finite values fall
    /// back to `1.0`.
    pub speed: f64,
    /// How many times the whole tree runs. `0` is treated as `1`.
    pub iterations: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            iterations: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    /// The run task panicked. Carries the panic message.
    Failed(String),
}

/// Outcome of [`MacroExecutor::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub commands_executed: u64,
    pub elapsed: Duration,
}

/// Snapshot returned by [`MacroExecutor::get_current_state`].
#[derive(Debug, Clone, Serialize)]
pub struct DebugState {
    /// Source line of the action most recently reached, `0` before any.
    pub line: usize,
    pub status: RunStatus,
    pub variables: BTreeMap<String, Value>,
    pub breakpoints: Vec<usize>,
    pub debug_mode: bool,
    pub step_mode: bool,
}

/// Control-flow signal returned by the block walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

type FlowFuture<'a> = Pin<Box<dyn Future<Output = Flow> + Send + 'a>>;

struct Shared {
    context: RwLock<ExecutionContext>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    step: Notify,
    debug_mode: AtomicBool,
    step_mode: AtomicBool,
    breakpoints: Mutex<BTreeSet<usize>>,
    current_line: AtomicUsize,
    commands_executed: AtomicU64,
    status: watch::Sender<RunStatus>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_status(&self, status: RunStatus) {
        self.status.send_replace(status);
    }

    fn is_breakpoint(&self, line: usize) -> bool {
        lock(&self.breakpoints).contains(&line)
    }
}

/// Runs action trees against an [`InputDriver`].
///
/// Stop is one-shot: once [`stop`](Self::stop) has been called, any
/// further [`execute`](Self::execute) on this executor (or its clones)
/// returns [`RunStatus::Stopped`] without running anything. Use a fresh
/// executor for the next run.
#[derive(Clone)]
pub struct MacroExecutor {
    driver: Arc<dyn InputDriver>,
    host: Option<Arc<dyn MacroHost>>,
    settings: ExecutorSettings,
    shared: Arc<Shared>,
}

impl MacroExecutor {
    /// Creates a new executor with any [`InputDriver`] backend.
    pub fn new(driver: Arc<dyn InputDriver>) -> Self {
        let (paused, _) = watch::channel(false);
        let (status, _) = watch::channel(RunStatus::Idle);
        Self {
            driver,
            host: None,
            settings: ExecutorSettings::default(),
            shared: Arc::new(Shared {
                context: RwLock::new(ExecutionContext::new()),
                cancel: CancellationToken::new(),
                paused,
                step: Notify::new(),
                debug_mode: AtomicBool::new(false),
                step_mode: AtomicBool::new(false),
                breakpoints: Mutex::new(BTreeSet::new()),
                current_line: AtomicUsize::new(0),
                commands_executed: AtomicU64::new(0),
                status,
            }),
        }
    }

    /// Attach the host that answers `input` prompts and observes
    /// breakpoints. Without one, inputs bind the empty string.
    pub fn with_host(mut self, host: Arc<dyn MacroHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run `actions` against `context` and wait for the run to finish.
    ///
    /// The walk happens on a spawned task, so this future can be raced
    /// against other work, and clones of the executor can control the run
    /// while it is in flight. Every progress message goes to `log` as well
    /// as to `tracing`.
    pub async fn execute(
        &self,
        mut context: ExecutionContext,
        actions: Vec<Action>,
        options: RunOptions,
        log: Option<LogSink>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let log = RunLog::new(log);

        let speed = if options.speed.is_finite() && options.speed > 0.0 {
            options.speed
        } else {
            log.warn(None, format!("Invalid speed {}, using 1.0", options.speed));
            1.0
        };
        let iterations = options.iterations.max(1);

        context.set_special_var("@speed", Value::from(speed));
        context.set_special_var("@iterations", Value::from(i64::from(iterations)));
        *self.shared.context.write().await = context;
        self.shared.commands_executed.store(0, Ordering::SeqCst);
        self.shared.current_line.store(0, Ordering::SeqCst);
        self.shared.set_status(RunStatus::Running);

        let walker = Walker {
            driver: self.driver.clone(),
            host: self.host.clone(),
            settings: self.settings.clone(),
            shared: self.shared.clone(),
            log: log.clone(),
            speed,
            call_depth: 0,
        };
        let span = info_span!("macro_run", %run_id, speed, iterations);
        let handle = tokio::spawn(walker.run(actions, iterations).instrument(span));

        let status = match handle.await {
            Ok(()) if self.shared.cancel.is_cancelled() => {
                log.info(None, "Macro stopped");
                RunStatus::Stopped
            }
            Ok(()) => {
                log.info(None, "Macro completed");
                RunStatus::Completed
            }
            Err(e) => {
                let message = if e.is_panic() {
                    let payload = e.into_panic();
                    payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "run task panicked".to_string())
                } else {
                    "run task was cancelled".to_string()
                };
                log.error(None, format!("Fatal error: {}", message));
                RunStatus::Failed(message)
            }
        };

        self.shared.step_mode.store(false, Ordering::SeqCst);
        self.shared.set_status(status.clone());

        RunReport {
            run_id,
            status,
            commands_executed: self.shared.commands_executed.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
        }
    }

    /// Request the run to stop. Takes effect at the next action boundary
    /// and cuts short any timed wait in progress.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Pause before the next action. The action in progress finishes.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Turning debug mode off also leaves step mode and releases a pending
    /// step wait.
    pub fn enable_debug_mode(&self, enabled: bool) {
        self.shared.debug_mode.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.shared.step_mode.store(false, Ordering::SeqCst);
            self.shared.step.notify_waiters();
        }
    }

    pub fn add_breakpoint(&self, line: usize) {
        lock(&self.shared.breakpoints).insert(line);
    }

    pub fn remove_breakpoint(&self, line: usize) {
        lock(&self.shared.breakpoints).remove(&line);
    }

    pub fn clear_breakpoints(&self) {
        lock(&self.shared.breakpoints).clear();
    }

    /// Release exactly one step wait. If the run is not waiting yet, the
    /// next wait returns immediately.
    pub fn step_next(&self) {
        self.shared.step.notify_one();
    }

    /// Leave step mode and run on until the next breakpoint.
    pub fn continue_execution(&self) {
        self.shared.step_mode.store(false, Ordering::SeqCst);
        self.shared.step.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.shared.status.borrow(),
            RunStatus::Running | RunStatus::Paused
        )
    }

    /// Follow the run status as it changes.
    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.shared.status.subscribe()
    }

    pub async fn get_current_state(&self) -> DebugState {
        let variables = self.shared.context.read().await.get_all_variables();
        DebugState {
            line: self.shared.current_line.load(Ordering::SeqCst),
            status: self.shared.status.borrow().clone(),
            variables,
            breakpoints: lock(&self.shared.breakpoints).iter().copied().collect(),
            debug_mode: self.shared.debug_mode.load(Ordering::SeqCst),
            step_mode: self.shared.step_mode.load(Ordering::SeqCst),
        }
    }
}

/// State owned by one run task.
struct Walker {
    driver: Arc<dyn InputDriver>,
    host: Option<Arc<dyn MacroHost>>,
    settings: ExecutorSettings,
    shared: Arc<Shared>,
    log: RunLog,
    speed: f64,
    call_depth: usize,
}

impl Walker {
    fn stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    async fn run(mut self, actions: Vec<Action>, iterations: u32) {
        for iteration in 1..=iterations {
            if self.stopped() {
                break;
            }
            if iterations > 1 {
                self.log.info(
                    None,
                    format!("=== Iteration {}/{} ===", iteration, iterations),
                );
            }
            self.shared.context.write().await.clear_loop_vars();
            self.execute_block(&actions).await;
        }
    }

    fn execute_block<'a>(&'a mut self, actions: &'a [Action]) -> FlowFuture<'a> {
        Box::pin(async move {
            for action in actions {
                if self.stopped() {
                    return Flow::Normal;
                }
                self.wait_while_paused().await;
                if self.stopped() {
                    return Flow::Normal;
                }

                let line = action.line();
                self.shared.current_line.store(line, Ordering::SeqCst);
                self.debug_gate(line).await;
                if self.stopped() {
                    return Flow::Normal;
                }

                debug!(line, kind = action.kind(), "executing action");
                match self.execute_action(action).await {
                    Flow::Normal => {}
                    flow => return flow,
                }
            }
            Flow::Normal
        })
    }

    fn execute_action<'a>(&'a mut self, action: &'a Action) -> FlowFuture<'a> {
        Box::pin(async move {
            match action {
                Action::Command { text, line } => {
                    self.execute_command(text, *line).await;
                    Flow::Normal
                }
                Action::Assign {
                    name,
                    expression,
                    line,
                } => {
                    let mut ctx = self.shared.context.write().await;
                    ctx.update_system_vars(&*self.driver).await;
                    let value = match evaluate(expression, &*ctx) {
                        Ok(value) => value,
                        Err(e) => {
                            self.log.warn(
                                Some(*line),
                                format!("Could not evaluate '{}': {}, storing as text", expression, e),
                            );
                            Value::Str(expression.clone())
                        }
                    };
                    ctx.set_variable(name.clone(), value);
                    Flow::Normal
                }
                Action::Loop { count, body, line } => {
                    let count = self.resolve_loop_count(count, *line).await;
                    self.execute_loop(count, body).await;
                    Flow::Normal
                }
                Action::While {
                    condition,
                    body,
                    line,
                } => {
                    self.execute_while(condition, body, *line).await;
                    Flow::Normal
                }
                Action::If { branches, .. } => self.execute_if(branches).await,
                Action::Break { .. } => Flow::Break,
                Action::Continue { .. } => Flow::Continue,
                Action::Breakpoint { line } => {
                    if self.shared.debug_mode.load(Ordering::SeqCst) {
                        self.hit_breakpoint(*line).await;
                    }
                    Flow::Normal
                }
                Action::CallFunction { name, line } => {
                    self.call_function(name, *line).await;
                    Flow::Normal
                }
            }
        })
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.shared.paused.subscribe();
        let paused = *rx.borrow_and_update();
        if !paused {
            return;
        }

        self.shared.set_status(RunStatus::Paused);
        self.log.info(None, "Paused");
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let paused = *rx.borrow_and_update();
            if !paused {
                break;
            }
        }
        if !self.stopped() {
            self.shared.set_status(RunStatus::Running);
            self.log.info(None, "Resumed");
        }
    }

    /// Breakpoint check and step wait before an action.
    async fn debug_gate(&self, line: usize) {
        if !self.shared.debug_mode.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.is_breakpoint(line) {
            self.hit_breakpoint(line).await;
        }
        if !self.shared.step_mode.load(Ordering::SeqCst) {
            return;
        }

        let notified = self.shared.step.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // Debug or step mode may have been switched off while we registered.
        if !self.shared.debug_mode.load(Ordering::SeqCst)
            || !self.shared.step_mode.load(Ordering::SeqCst)
        {
            return;
        }

        self.log.debug(Some(line), format!("Paused at line {}", line));
        self.shared.set_status(RunStatus::Paused);
        tokio::select! {
            _ = &mut notified => {}
            _ = self.shared.cancel.cancelled() => {}
        }
        if !self.stopped() {
            self.shared.set_status(RunStatus::Running);
        }
    }

    async fn hit_breakpoint(&self, line: usize) {
        self.shared.step_mode.store(true, Ordering::SeqCst);
        self.log.debug(Some(line), format!("Breakpoint hit at line {}", line));
        if let Some(host) = &self.host {
            let variables = self.shared.context.read().await.get_all_variables();
            host.on_breakpoint_hit(line, &variables).await;
        }
    }

    async fn execute_command(&mut self, raw: &str, line: usize) {
        let text = {
            let mut ctx = self.shared.context.write().await;
            ctx.update_system_vars(&*self.driver).await;
            ctx.substitute(raw)
        };
        self.log.command(line, &text);
        self.shared.commands_executed.fetch_add(1, Ordering::SeqCst);

        let command = match ScriptCommand::parse(&text) {
            Ok(command) => command,
            Err(CommandError::UnknownCommand(name)) => {
                self.log.warn(Some(line), format!("unknown command: {}", name));
                return;
            }
            Err(e) => {
                self.log.error(Some(line), format!("{} -> {}", text, e));
                return;
            }
        };

        match command {
            ScriptCommand::Echo { message } => self.log.echo(line, message),
            ScriptCommand::Input { prompt, .. } => {
                // The target is read from the raw line so a bound variable
                // is not replaced by its value.
                let variable = match ScriptCommand::parse(raw) {
                    Ok(ScriptCommand::Input { variable, .. }) => variable,
                    _ => None,
                };
                self.ask_input(&prompt, variable, line).await;
            }
            command => {
                let env = CommandEnv {
                    driver: &*self.driver,
                    speed: self.speed,
                    type_delay: self.settings.type_delay,
                    cancel: &self.shared.cancel,
                };
                if let Err(e) = command.perform(&env).await {
                    self.log.error(Some(line), format!("{} -> {}", text, e));
                }
            }
        }
    }

    async fn ask_input(&self, prompt: &str, variable: Option<String>, line: usize) {
        let answer = match &self.host {
            Some(host) => tokio::select! {
                answer = host.ask_input(prompt) => answer,
                _ = self.shared.cancel.cancelled() => return,
            },
            None => None,
        }
        .unwrap_or_default();

        match variable {
            Some(name) if name.starts_with('$') => {
                self.log
                    .info(Some(line), format!("[INPUT] {} = {}", name, answer));
                self.shared
                    .context
                    .write()
                    .await
                    .set_variable(name, Value::Str(answer));
            }
            Some(name) => self.log.warn(
                Some(line),
                format!("Input target '{}' is not a $variable, answer discarded", name),
            ),
            None => {}
        }
    }

    /// `None` means infinite.
    async fn resolve_loop_count(&self, count: &LoopCount, line: usize) -> Option<u64> {
        match count {
            LoopCount::Times(n) => Some(*n),
            LoopCount::Infinite => None,
            LoopCount::Variable(raw) => {
                let text = {
                    let mut ctx = self.shared.context.write().await;
                    ctx.update_system_vars(&*self.driver).await;
                    ctx.substitute(raw)
                };
                match parse_loop_count(&text) {
                    LoopCount::Times(n) => Some(n),
                    LoopCount::Infinite => None,
                    LoopCount::Variable(_) => {
                        self.log.error(
                            Some(line),
                            format!("Loop count '{}' is not a number: {}, running once", raw, text),
                        );
                        Some(1)
                    }
                }
            }
        }
    }

    async fn execute_loop(&mut self, count: Option<u64>, body: &[Action]) {
        self.shared.context.write().await.push_loop_scope();
        let mut index: u64 = 0;
        loop {
            if self.stopped() || count.is_some_and(|n| index >= n) {
                break;
            }
            self.shared
                .context
                .write()
                .await
                .set_loop_var(LOOP_COUNTER, Value::Str(index.to_string()));
            if self.execute_block(body).await == Flow::Break {
                break;
            }
            index += 1;
            tokio::task::yield_now().await;
        }
        self.shared.context.write().await.pop_loop_scope();
    }

    async fn execute_while(&mut self, condition: &str, body: &[Action], line: usize) {
        let limit = self.settings.while_iteration_limit;
        let mut iterations: u64 = 0;
        loop {
            if self.stopped() {
                break;
            }
            match self.evaluate_condition(condition).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.log.error(
                        Some(line),
                        format!("Invalid while condition '{}': {}", condition, e),
                    );
                    break;
                }
            }
            if self.execute_block(body).await == Flow::Break {
                break;
            }
            iterations += 1;
            if iterations >= limit {
                self.log.error(
                    Some(line),
                    format!("While loop reached {} iterations, breaking out", limit),
                );
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn execute_if(&mut self, branches: &[Branch]) -> Flow {
        for branch in branches {
            let taken = match &branch.condition {
                BranchCondition::Else => true,
                BranchCondition::When(condition) => {
                    match self.evaluate_condition(condition).await {
                        Ok(taken) => taken,
                        Err(e) => {
                            self.log.error(
                                Some(branch.line),
                                format!("Invalid if condition '{}': {}", condition, e),
                            );
                            false
                        }
                    }
                }
            };
            if taken {
                return self.execute_block(&branch.body).await;
            }
        }
        Flow::Normal
    }

    async fn call_function(&mut self, name: &str, line: usize) {
        let body = self.shared.context.read().await.get_function(name);
        let Some(body) = body else {
            self.log
                .error(Some(line), format!("Function '{}' not found", name));
            return;
        };
        if self.call_depth >= MAX_CALL_DEPTH {
            self.log.error(
                Some(line),
                format!("Function '{}' nested deeper than {} calls, skipped", name, MAX_CALL_DEPTH),
            );
            return;
        }

        self.log.info(Some(line), format!("[FUNCTION] Calling {}()", name));
        self.call_depth += 1;
        // Break and continue do not leak out of a function body.
        let _ = self.execute_block(&body).await;
        self.call_depth -= 1;
    }

    /// Evaluate an `if`/`elseif`/`while` condition.
    ///
    /// `pixel,x,y,#RRGGBB[,tolerance]` samples the screen, `exists,$var`
    /// tests whether a variable is bound, and anything else goes to the
    /// expression evaluator with the merged variable environment.
    async fn evaluate_condition(&self, condition: &str) -> Result<bool, EvalError> {
        let mut ctx = self.shared.context.write().await;
        ctx.update_system_vars(&*self.driver).await;

        match command_name(condition).as_str() {
            "pixel" => {
                let text = ctx.substitute(condition);
                drop(ctx);
                self.check_pixel(&text).await
            }
            "exists" => {
                let name = condition.split(',').nth(1).map(str::trim).unwrap_or("");
                if name.is_empty() {
                    return Err(invalid(condition, "exists needs a variable name"));
                }
                Ok(ctx.variable_exists(name))
            }
            _ => evaluate(condition, &*ctx).map(|value| value.is_truthy()),
        }
    }

    async fn check_pixel(&self, text: &str) -> Result<bool, EvalError> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            return Err(invalid(text, "pixel needs x, y and a #RRGGBB colour"));
        }
        let coord = |s: &str| {
            s.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| v.round() as i32)
                .ok_or_else(|| invalid(text, &format!("bad coordinate '{}'", s)))
        };
        let (x, y) = (coord(parts[1])?, coord(parts[2])?);
        let target: Rgb = parts[3].parse().map_err(|e: String| invalid(text, &e))?;
        let tolerance = match parts.get(4) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| invalid(text, &format!("bad tolerance '{}'", raw)))?,
            None => self.settings.pixel_tolerance,
        };

        match self.driver.pixel_color(x, y).await {
            Ok(actual) => {
                debug!(x, y, %actual, %target, tolerance, "pixel sampled");
                Ok(actual.matches(&target, tolerance))
            }
            Err(e) => {
                self.log
                    .warn(None, format!("Pixel sampling failed at ({}, {}): {}", x, y, e));
                Ok(false)
            }
        }
    }
}

fn invalid(expression: &str, reason: &str) -> EvalError {
    EvalError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunDriver;
    use crate::log::{LogEntry, LogLevel};
    use crate::parser::ScriptParser;
    use tokio::sync::mpsc;

    async fn run_script(script: &str, driver: Arc<DryRunDriver>) -> (RunReport, Vec<LogEntry>) {
        let mut ctx = ExecutionContext::new();
        let actions = ScriptParser::new(&mut ctx).parse(script).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = MacroExecutor::new(driver);
        let report = executor
            .execute(ctx, actions, RunOptions::default(), Some(tx))
            .await;
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        (report, entries)
    }

    fn echoes(entries: &[LogEntry]) -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.level == LogLevel::Echo)
            .map(|e| e.message.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_completed_run_reports_commands() {
        let (report, entries) = run_script("echo,a\necho,b", Arc::new(DryRunDriver::new())).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.commands_executed, 2);
        assert_eq!(echoes(&entries), vec!["a", "b"]);
        assert_eq!(entries.last().map(|e| e.message.as_str()), Some("Macro completed"));
    }

    #[tokio::test]
    async fn test_pixel_condition_uses_driver() {
        let driver = Arc::new(DryRunDriver::new());
        driver.set_pixel(5, 5, Rgb::new(250, 0, 0));
        let script = "if,pixel,5,5,#FF0000\n  echo,red\nif,pixel,5,5,#00FF00\n  echo,green";
        let (_, entries) = run_script(script, driver).await;
        assert_eq!(echoes(&entries), vec!["red"]);
    }

    #[tokio::test]
    async fn test_exists_checks_raw_name() {
        let script = "$a = 1\nif,exists,$a\n  echo,yes\nif,exists,$b\n  echo,no";
        let (_, entries) = run_script(script, Arc::new(DryRunDriver::new())).await;
        assert_eq!(echoes(&entries), vec!["yes"]);
    }

    #[tokio::test]
    async fn test_break_inside_if_leaves_loop() {
        let script = "loop,infinite\n  if,$i == 3\n    break\n  echo,$i";
        let (_, entries) = run_script(script, Arc::new(DryRunDriver::new())).await;
        assert_eq!(echoes(&entries), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_continue_skips_rest_of_body() {
        let script = "loop,4\n  if,$i % 2 == 1\n    continue\n  echo,$i";
        let (_, entries) = run_script(script, Arc::new(DryRunDriver::new())).await;
        assert_eq!(echoes(&entries), vec!["0", "2"]);
    }

    #[tokio::test]
    async fn test_invalid_condition_is_false_for_if_and_ends_while() {
        let script = "if,1 &\n  echo,a\nelse\n  echo,b\nwhile,2 **\n  echo,c";
        let (report, entries) = run_script(script, Arc::new(DryRunDriver::new())).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(echoes(&entries), vec!["b"]);
        let errors = entries.iter().filter(|e| e.level == LogLevel::Error).count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_bad_loop_count_runs_once() {
        let script = "$n = lots\nloop,$n\n  echo,once";
        let (_, entries) = run_script(script, Arc::new(DryRunDriver::new())).await;
        assert_eq!(echoes(&entries), vec!["once"]);
        assert!(entries
            .iter()
            .any(|e| e.level == LogLevel::Error && e.message.contains("not a number")));
    }

    #[tokio::test]
    async fn test_recursive_function_is_bounded() {
        let mut ctx = ExecutionContext::new();
        ctx.register_function(
            "g",
            vec![Action::CallFunction {
                name: "g".into(),
                line: 2,
            }],
        );
        let actions = vec![Action::CallFunction {
            name: "g".into(),
            line: 4,
        }];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = MacroExecutor::new(Arc::new(DryRunDriver::new()))
            .execute(ctx, actions, RunOptions::default(), Some(tx))
            .await;
        assert_eq!(report.status, RunStatus::Completed);
        let mut nested_error = false;
        while let Ok(entry) = rx.try_recv() {
            nested_error |= entry.message.contains("nested deeper");
        }
        assert!(nested_error);
    }

    #[tokio::test]
    async fn test_special_vars_and_invalid_speed() {
        let mut ctx = ExecutionContext::new();
        let actions = ScriptParser::new(&mut ctx)
            .parse("echo,@speed x @iterations")
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()));
        executor
            .execute(
                ctx,
                actions,
                RunOptions {
                    speed: -2.0,
                    iterations: 2,
                },
                Some(tx),
            )
            .await;
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(echoes(&entries), vec!["1 x 2", "1 x 2"]);
        assert!(entries.iter().any(|e| e.message == "=== Iteration 2/2 ==="));
    }

    #[tokio::test]
    async fn test_stop_before_run_returns_stopped() {
        let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()));
        executor.stop();
        let report = executor
            .execute(
                ExecutionContext::new(),
                vec![Action::Command {
                    text: "echo,x".into(),
                    line: 1,
                }],
                RunOptions::default(),
                None,
            )
            .await;
        assert_eq!(report.status, RunStatus::Stopped);
        assert_eq!(report.commands_executed, 0);
    }

    #[tokio::test]
    async fn test_state_reports_breakpoints_sorted() {
        let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()));
        executor.add_breakpoint(9);
        executor.add_breakpoint(3);
        executor.add_breakpoint(5);
        executor.remove_breakpoint(5);
        let state = executor.get_current_state().await;
        assert_eq!(state.breakpoints, vec![3, 9]);
        assert_eq!(state.status, RunStatus::Idle);
        assert!(!state.debug_mode);
        executor.clear_breakpoints();
        assert!(executor.get_current_state().await.breakpoints.is_empty());
    }

    #[tokio::test]
    async fn test_status_subscribers_see_completion() {
        let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()));
        let mut status = executor.subscribe_status();
        assert_eq!(*status.borrow_and_update(), RunStatus::Idle);

        let mut ctx = ExecutionContext::new();
        let actions = ScriptParser::new(&mut ctx).parse("echo,a").unwrap();
        executor
            .execute(ctx, actions, RunOptions::default(), None)
            .await;
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), RunStatus::Completed);
    }

    /// Continues as soon as it is told about a breakpoint.
    struct ContinueOnHit {
        executor: MacroExecutor,
    }

    #[async_trait::async_trait]
    impl MacroHost for ContinueOnHit {
        async fn ask_input(&self, _prompt: &str) -> Option<String> {
            None
        }

        async fn on_breakpoint_hit(&self, _line: usize, _variables: &BTreeMap<String, Value>) {
            self.executor.continue_execution();
        }
    }

    #[tokio::test]
    async fn test_continue_before_step_wait_does_not_block() {
        let base = MacroExecutor::new(Arc::new(DryRunDriver::new()));
        let executor = base.clone().with_host(Arc::new(ContinueOnHit { executor: base }));
        executor.enable_debug_mode(true);
        executor.add_breakpoint(2);

        let mut ctx = ExecutionContext::new();
        let actions = ScriptParser::new(&mut ctx)
            .parse("echo,a\necho,b\necho,c")
            .unwrap();
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(ctx, actions, RunOptions::default(), None),
        )
        .await
        .expect("run should not wait for a step");
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.commands_executed, 3);
        assert!(!executor.get_current_state().await.step_mode);
    }
}
