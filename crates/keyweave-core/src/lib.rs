//! # keyweave-core
//!
//! Parser and execution engine for keyweave, a small line-oriented
//! scripting language for keyboard and mouse macros.
//!
//! A script is parsed into an action tree by [`parser::ScriptParser`],
//! which also fills the function table and top-level variables of an
//! [`context::ExecutionContext`]. [`executor::MacroExecutor`] then walks
//! the tree against an [`driver::InputDriver`], with support for loops,
//! conditionals, functions, pause/resume, stop and step debugging.
//!
//! ## Modules
//!
//! - [`eval`] - Restricted expression evaluator and the [`eval::Value`] type
//! - [`context`] - Variable namespaces, substitution and the function table
//! - [`action`] - The action tree produced by the parser
//! - [`parser`] - Indentation-aware parser, syntax validation and lint
//! - [`executor`] - Async tree walker with pause, stop and debug controls
//! - [`commands`] - Keyboard, mouse and control commands
//! - [`driver`] - The [`driver::InputDriver`] trait and key/button types
//! - [`dry_run`] - In-memory driver that records every input call
//! - [`host`] - Callbacks into the embedding application
//! - [`log`] - Structured run log entries
//! - [`config`] - Persistent user configuration
//! - [`script_file`] - Text and JSON script files
//! - [`recorder`] - Recorded input events to script text
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyweave_core::context::ExecutionContext;
//! use keyweave_core::dry_run::DryRunDriver;
//! use keyweave_core::executor::{MacroExecutor, RunOptions};
//! use keyweave_core::parser::ScriptParser;
//!
//! # async fn demo() {
//! let script = "$n = 3\nloop,$n\n  echo,pass $i\nendloop";
//!
//! let mut ctx = ExecutionContext::new();
//! let actions = ScriptParser::new(&mut ctx).parse(script).expect("syntax error");
//!
//! let driver = Arc::new(DryRunDriver::new());
//! let report = MacroExecutor::new(driver)
//!     .execute(ctx, actions, RunOptions::default(), None)
//!     .await;
//! println!("{:?}", report.status);
//! # }
//! ```

pub mod action;
pub mod color;
pub mod commands;
pub mod config;
pub mod context;
pub mod driver;
pub mod dry_run;
pub mod error;
pub mod eval;
pub mod executor;
pub mod host;
pub mod log;
pub mod parser;
pub mod recorder;
pub mod script_file;
