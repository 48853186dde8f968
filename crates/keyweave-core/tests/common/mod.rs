//! Shared test helpers for keyweave-core integration tests.
//!
//! Scripts are parsed and run against a [`DryRunDriver`]; every log entry
//! the run produces is collected so tests can assert on echoes, warnings
//! and errors.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use keyweave_core::config::ExecutorSettings;
use keyweave_core::context::ExecutionContext;
use keyweave_core::dry_run::DryRunDriver;
use keyweave_core::eval::Value;
use keyweave_core::executor::{MacroExecutor, RunOptions, RunReport};
use keyweave_core::host::MacroHost;
use keyweave_core::log::{LogEntry, LogLevel};
use keyweave_core::parser::ScriptParser;

// ---------------------------------------------------------------------------
// Running whole scripts
// ---------------------------------------------------------------------------

pub struct Outcome {
    pub report: RunReport,
    pub entries: Vec<LogEntry>,
    pub driver: Arc<DryRunDriver>,
}

impl Outcome {
    pub fn echoes(&self) -> Vec<String> {
        messages(&self.entries, LogLevel::Echo)
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<String> {
        messages(&self.entries, level)
    }
}

pub fn messages(entries: &[LogEntry], level: LogLevel) -> Vec<String> {
    entries
        .iter()
        .filter(|e| e.level == level)
        .map(|e| e.message.clone())
        .collect()
}

/// Parse `script` into a fresh context, panicking on a syntax error.
pub fn parse(script: &str) -> (ExecutionContext, Vec<keyweave_core::action::Action>) {
    let mut ctx = ExecutionContext::new();
    let actions = ScriptParser::new(&mut ctx)
        .parse(script)
        .unwrap_or_else(|e| panic!("script should parse: {}", e));
    (ctx, actions)
}

/// Drain everything currently queued on a log receiver.
pub fn drain(rx: &mut UnboundedReceiver<LogEntry>) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        entries.push(entry);
    }
    entries
}

/// Run a script to completion with default options.
pub async fn run_script(script: &str) -> Outcome {
    run_with(script, |d| MacroExecutor::new(d), RunOptions::default()).await
}

/// Run a script with a customised executor.
pub async fn run_with(
    script: &str,
    build: impl FnOnce(Arc<DryRunDriver>) -> MacroExecutor,
    options: RunOptions,
) -> Outcome {
    let driver = Arc::new(DryRunDriver::with_screen_size(1920, 1080));
    let executor = build(driver.clone());
    let (ctx, actions) = parse(script);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let report = executor.execute(ctx, actions, options, Some(tx)).await;
    Outcome {
        report,
        entries: drain(&mut rx),
        driver,
    }
}

pub fn settings_with_while_limit(limit: u64) -> ExecutorSettings {
    ExecutorSettings {
        while_iteration_limit: limit,
        ..ExecutorSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Scripted host
// ---------------------------------------------------------------------------

/// A [`MacroHost`] that answers prompts from a queue and reports breakpoint
/// hits over a channel.
pub struct ScriptedHost {
    answers: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<String>>,
    hits: mpsc::UnboundedSender<(usize, BTreeMap<String, Value>)>,
}

impl ScriptedHost {
    pub fn new(
        answers: Vec<Option<&str>>,
    ) -> (
        Arc<Self>,
        UnboundedReceiver<(usize, BTreeMap<String, Value>)>,
    ) {
        let (hits, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            answers: Mutex::new(answers.into_iter().map(|a| a.map(String::from)).collect()),
            prompts: Mutex::new(Vec::new()),
            hits,
        });
        (host, rx)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MacroHost for ScriptedHost {
    async fn ask_input(&self, prompt: &str) -> Option<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answers.lock().unwrap().pop_front().flatten()
    }

    async fn on_breakpoint_hit(&self, line: usize, variables: &BTreeMap<String, Value>) {
        let _ = self.hits.send((line, variables.clone()));
    }
}
