//! Script text to action tree.
//!
//! Scripts are line oriented. Blocks are delimited by indentation, with
//! optional explicit terminators (`endloop`/`next`, `endwhile`, `endif`,
//! `endfunction`). A terminator closes the innermost open block of its own
//! kind, so an `endloop` inside an `if` body closes the enclosing loop and
//! leaves sibling parsing intact.
//!
//! Indentation counts leading spaces only. Tabs are not expanded.
//!
//! The parser is deliberately permissive: any line it does not recognise
//! becomes an [`Action::Command`] and is reported at run time. [`lint`]
//! gives the stricter view, with warnings for unknown commands and stray
//! terminators.
//!
//! # Example
//!
//! ```
//! use keyweave_core::action::{Action, LoopCount};
//! use keyweave_core::context::ExecutionContext;
//! use keyweave_core::parser::ScriptParser;
//!
//! let mut ctx = ExecutionContext::new();
//! let actions = ScriptParser::new(&mut ctx)
//!     .parse("$n = 3\nloop,$n\n  echo,hi $i\nendloop")
//!     .unwrap();
//!
//! assert_eq!(actions.len(), 1);
//! assert!(matches!(
//!     &actions[0],
//!     Action::Loop { count: LoopCount::Variable(v), .. } if v == "$n"
//! ));
//! ```

use serde::Serialize;
use tracing::debug;

use crate::action::{Action, Branch, BranchCondition, LoopCount};
use crate::commands::{command_name, ScriptCommand, KNOWN_COMMANDS};
use crate::context::ExecutionContext;
use crate::error::{CommandError, SyntaxError};
use crate::eval::{evaluate, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    While,
    If,
    Function,
}

impl BlockKind {
    fn closed_by(cmd: &str) -> Option<Self> {
        match cmd {
            "endloop" | "next" => Some(BlockKind::Loop),
            "endwhile" => Some(BlockKind::While),
            "endif" => Some(BlockKind::If),
            "endfunction" => Some(BlockKind::Function),
            _ => None,
        }
    }

    fn opener(self) -> &'static str {
        match self {
            BlockKind::Loop => "loop",
            BlockKind::While => "while",
            BlockKind::If => "if",
            BlockKind::Function => "function",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A finding reported by [`lint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn warning(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct SourceLine {
    indent: usize,
    text: String,
    number: usize,
}

/// Parses scripts into action trees, registering functions and top-level
/// variables in the context it borrows.
pub struct ScriptParser<'c> {
    context: &'c mut ExecutionContext,
}

impl<'c> ScriptParser<'c> {
    pub fn new(context: &'c mut ExecutionContext) -> Self {
        Self { context }
    }

    /// Parse `script`.
    ///
    /// Declarations outside every block are evaluated immediately against
    /// the variables declared before them; one that fails to evaluate is
    /// stored as its raw text. Declarations inside a block become
    /// [`Action::Assign`] and run each time the block does.
    pub fn parse(&mut self, script: &str) -> Result<Vec<Action>, SyntaxError> {
        let mut parser = Parser::new(script, self.context);
        let actions = parser.parse_block(0)?;
        debug!(actions = actions.len(), "parsed script");
        Ok(actions)
    }

    /// Check `script` without touching this parser's context.
    ///
    /// Returns `(true, "Syntax OK")` or `(false, <error message>)`.
    pub fn validate_syntax(&self, script: &str) -> (bool, String) {
        let mut scratch = self.context.clone();
        match ScriptParser::new(&mut scratch).parse(script) {
            Ok(_) => (true, "Syntax OK".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }
}

/// Report syntax errors and suspicious lines in `script`.
///
/// Errors are the ones [`ScriptParser::parse`] rejects (only the first is
/// reported, since parsing stops there). Warnings cover lines that parse
/// but will misbehave at run time: unknown commands, bad arguments,
/// `name()` with no matching function, and stray terminators.
pub fn lint(script: &str) -> Vec<Diagnostic> {
    let mut context = ExecutionContext::new();
    let mut parser = Parser::new(script, &mut context);
    let result = parser.parse_block(0);
    let mut diagnostics = std::mem::take(&mut parser.diagnostics);

    match result {
        Ok(actions) => {
            lint_actions(&actions, &context, &mut diagnostics);
            for (_, body) in context.functions() {
                lint_actions(body, &context, &mut diagnostics);
            }
        }
        Err(e) => diagnostics.push(Diagnostic {
            line: e.line,
            severity: Severity::Error,
            message: e.message,
        }),
    }

    diagnostics.sort_by_key(|d| d.line);
    diagnostics
}

fn lint_actions(actions: &[Action], context: &ExecutionContext, out: &mut Vec<Diagnostic>) {
    for action in actions {
        if let Action::Command { text, line } = action {
            if let Some(message) = lint_command(text, context) {
                out.push(Diagnostic::warning(*line, message));
            }
        }
        for body in action.children() {
            lint_actions(body, context, out);
        }
    }
}

fn lint_command(text: &str, context: &ExecutionContext) -> Option<String> {
    let name = command_name(text);
    if name.starts_with('$') || name.starts_with('@') {
        return None;
    }
    if !KNOWN_COMMANDS.contains(&name.as_str()) {
        if let Some(callee) = call_target(text) {
            if !context.has_function(callee) {
                return Some(format!("call to undefined function '{}'", callee));
            }
        }
        return Some(format!("unknown command: {}", name));
    }
    // Arguments can only be checked once variables are known.
    if text.contains('$') || text.contains('@') {
        return None;
    }
    match ScriptCommand::parse(text) {
        Ok(_) => None,
        Err(CommandError::UnknownCommand(n)) => Some(format!("unknown command: {}", n)),
        Err(e) => Some(e.to_string()),
    }
}

/// The function a `name(...)` line would call, if it has that shape.
fn call_target(text: &str) -> Option<&str> {
    if !(text.contains('(') && text.contains(')')) {
        return None;
    }
    let name = text.split('(').next()?.trim();
    (!name.is_empty()).then_some(name)
}

/// Split `$name = expr`. A `$x == 1` comparison is not a declaration.
fn split_declaration(text: &str) -> Option<(&str, &str)> {
    if !text.starts_with('$') {
        return None;
    }
    let (name, expr) = text.split_once('=')?;
    if expr.starts_with('=') {
        return None;
    }
    let name = name.trim();
    let ident = &name[1..];
    if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name, expr.trim()))
}

/// `input,"prompt"` on the right of a declaration.
fn input_prompt(expr: &str) -> Option<String> {
    if command_name(expr) != "input" || !expr.contains(',') {
        return None;
    }
    let (_, prompt) = expr.split_once(',')?;
    Some(prompt.trim().trim_matches('"').to_string())
}

/// Everything after the first comma, each part trimmed.
fn remainder(text: &str) -> String {
    text.split(',').skip(1).map(str::trim).collect::<Vec<_>>().join(",")
}

pub(crate) fn parse_loop_count(raw: &str) -> LoopCount {
    let raw = raw.trim();
    if raw.is_empty() {
        return LoopCount::Times(1);
    }
    if raw.eq_ignore_ascii_case("infinite") {
        return LoopCount::Infinite;
    }
    match raw.parse::<f64>() {
        Ok(n) if n.is_infinite() && n > 0.0 => LoopCount::Infinite,
        Ok(n) if n.is_finite() => LoopCount::Times(if n <= 0.0 { 0 } else { n as u64 }),
        _ => LoopCount::Variable(raw.to_string()),
    }
}

struct Parser<'c> {
    lines: Vec<SourceLine>,
    pos: usize,
    open: Vec<BlockKind>,
    context: &'c mut ExecutionContext,
    diagnostics: Vec<Diagnostic>,
}

impl<'c> Parser<'c> {
    fn new(script: &str, context: &'c mut ExecutionContext) -> Self {
        let lines = script
            .lines()
            .enumerate()
            .filter_map(|(i, raw)| {
                let text = raw.trim();
                if text.is_empty() || text.starts_with('#') {
                    return None;
                }
                Some(SourceLine {
                    indent: raw.len() - raw.trim_start_matches(' ').len(),
                    text: text.to_string(),
                    number: i + 1,
                })
            })
            .collect();
        Self {
            lines,
            pos: 0,
            open: Vec::new(),
            context,
            diagnostics: Vec::new(),
        }
    }

    fn warn(&mut self, line: usize, message: String) {
        debug!(line, %message, "parse warning");
        self.diagnostics.push(Diagnostic::warning(line, message));
    }

    /// Parse lines indented at least `base_indent`, stopping at a dedent or
    /// at a terminator that belongs to an enclosing block.
    fn parse_block(&mut self, base_indent: usize) -> Result<Vec<Action>, SyntaxError> {
        let mut actions = Vec::new();

        while let Some(line) = self.lines.get(self.pos) {
            if line.indent < base_indent {
                break;
            }
            let indent = line.indent;
            let number = line.number;
            let text = line.text.clone();
            let cmd = command_name(&text);

            if let Some(kind) = BlockKind::closed_by(&cmd) {
                if self.open.contains(&kind) {
                    break;
                }
                self.warn(number, format!("'{}' without an open '{}'", cmd, kind.opener()));
                self.pos += 1;
                continue;
            }

            if cmd == "elseif" || cmd == "else" {
                if self.open.contains(&BlockKind::If) {
                    break;
                }
                self.warn(number, format!("'{}' without an open 'if'", cmd));
                self.pos += 1;
                continue;
            }

            if let Some((name, expr)) = split_declaration(&text) {
                self.pos += 1;
                if let Some(prompt) = input_prompt(expr) {
                    let text = if prompt.is_empty() {
                        format!("input_var,{}", name)
                    } else {
                        format!("input_var,{},{}", name, prompt)
                    };
                    actions.push(Action::Command { text, line: number });
                } else if self.open.is_empty() {
                    let value = evaluate(expr, self.context.variables())
                        .unwrap_or_else(|_| Value::Str(expr.to_string()));
                    debug!(line = number, name, %value, "declared variable");
                    self.context.set_variable(name, value);
                } else {
                    actions.push(Action::Assign {
                        name: name.to_string(),
                        expression: expr.to_string(),
                        line: number,
                    });
                }
                continue;
            }

            self.pos += 1;
            match cmd.as_str() {
                "loop" => {
                    let count = parse_loop_count(text.split(',').nth(1).unwrap_or(""));
                    let body = self.parse_body(BlockKind::Loop, indent)?;
                    actions.push(Action::Loop {
                        count,
                        body,
                        line: number,
                    });
                }
                "while" => {
                    let condition = remainder(&text);
                    if condition.is_empty() {
                        return Err(SyntaxError::new(number, "While requires a condition"));
                    }
                    let body = self.parse_body(BlockKind::While, indent)?;
                    actions.push(Action::While {
                        condition,
                        body,
                        line: number,
                    });
                }
                "if" => {
                    let condition = remainder(&text);
                    if condition.is_empty() {
                        return Err(SyntaxError::new(number, "If requires a condition"));
                    }
                    let branches = self.parse_if_chain(condition, number, indent)?;
                    actions.push(Action::If {
                        branches,
                        line: number,
                    });
                }
                "function" => {
                    let raw = text.split(',').nth(1).unwrap_or("");
                    let name = raw.split('(').next().unwrap_or("").trim().to_string();
                    if name.is_empty() {
                        return Err(SyntaxError::new(number, "Function requires a name"));
                    }
                    let body = self.parse_body(BlockKind::Function, indent)?;
                    debug!(line = number, name = %name, "registered function");
                    self.context.register_function(name, body);
                }
                "break" => actions.push(Action::Break { line: number }),
                "continue" => actions.push(Action::Continue { line: number }),
                "breakpoint" => actions.push(Action::Breakpoint { line: number }),
                _ => {
                    let callee = call_target(&text)
                        .filter(|name| self.context.has_function(name))
                        .map(str::to_string);
                    match callee {
                        Some(name) => actions.push(Action::CallFunction { name, line: number }),
                        None => actions.push(Action::Command { text, line: number }),
                    }
                }
            }
        }

        Ok(actions)
    }

    /// Parse the body of an opener at `indent`, then consume its own
    /// terminator if one follows.
    fn parse_body(&mut self, kind: BlockKind, indent: usize) -> Result<Vec<Action>, SyntaxError> {
        self.open.push(kind);
        let body = self.parse_block(indent + 1);
        self.open.pop();
        let body = body?;

        if let Some(next) = self.lines.get(self.pos) {
            if next.indent >= indent && BlockKind::closed_by(&command_name(&next.text)) == Some(kind) {
                self.pos += 1;
            }
        }
        Ok(body)
    }

    fn parse_if_chain(
        &mut self,
        condition: String,
        line: usize,
        indent: usize,
    ) -> Result<Vec<Branch>, SyntaxError> {
        let body = self.parse_branch(indent)?;
        let mut branches = vec![Branch {
            condition: BranchCondition::When(condition),
            body,
            line,
        }];

        while let Some(next) = self.lines.get(self.pos) {
            if next.indent < indent {
                break;
            }
            let branch_indent = next.indent;
            let number = next.number;
            let condition = match command_name(&next.text).as_str() {
                "elseif" => {
                    let cond = remainder(&next.text);
                    if cond.is_empty() {
                        self.warn(number, "'elseif' without a condition is never taken".into());
                    }
                    BranchCondition::When(cond)
                }
                "else" => BranchCondition::Else,
                "endif" => {
                    self.pos += 1;
                    break;
                }
                _ => break,
            };
            self.pos += 1;
            let body = self.parse_branch(branch_indent)?;
            branches.push(Branch {
                condition,
                body,
                line: number,
            });
        }

        Ok(branches)
    }

    fn parse_branch(&mut self, indent: usize) -> Result<Vec<Action>, SyntaxError> {
        self.open.push(BlockKind::If);
        let body = self.parse_block(indent + 1);
        self.open.pop();
        body
    }
}
