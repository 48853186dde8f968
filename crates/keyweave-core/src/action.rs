//! The action tree produced by the parser and walked by the executor.
//!
//! Every node carries the 1-based source line it came from, which is what
//! breakpoints and error messages refer to.

use serde::{Deserialize, Serialize};

/// A single node of the action tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// A raw instruction line, substituted and dispatched at runtime.
    Command { text: String, line: usize },

    /// A declaration nested inside a block, evaluated each time it runs.
    Assign {
        name: String,
        expression: String,
        line: usize,
    },

    Loop {
        count: LoopCount,
        body: Vec<Action>,
        line: usize,
    },

    While {
        condition: String,
        body: Vec<Action>,
        line: usize,
    },

    /// An `if` / `elseif` / `else` chain, tested in order.
    If { branches: Vec<Branch>, line: usize },

    Break { line: usize },

    Continue { line: usize },

    Breakpoint { line: usize },

    CallFunction { name: String, line: usize },
}

impl Action {
    /// The source line this action was parsed from.
    pub fn line(&self) -> usize {
        match self {
            Action::Command { line, .. }
            | Action::Assign { line, .. }
            | Action::Loop { line, .. }
            | Action::While { line, .. }
            | Action::If { line, .. }
            | Action::Break { line }
            | Action::Continue { line }
            | Action::Breakpoint { line }
            | Action::CallFunction { line, .. } => *line,
        }
    }

    /// Short name for tracing fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Command { .. } => "command",
            Action::Assign { .. } => "assign",
            Action::Loop { .. } => "loop",
            Action::While { .. } => "while",
            Action::If { .. } => "if",
            Action::Break { .. } => "break",
            Action::Continue { .. } => "continue",
            Action::Breakpoint { .. } => "breakpoint",
            Action::CallFunction { .. } => "call_function",
        }
    }

    /// Nested bodies of this action, in source order.
    pub fn children(&self) -> Vec<&[Action]> {
        match self {
            Action::Loop { body, .. } | Action::While { body, .. } => vec![body.as_slice()],
            Action::If { branches, .. } => branches.iter().map(|b| b.body.as_slice()).collect(),
            _ => Vec::new(),
        }
    }
}

/// How many times a `loop` block runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCount {
    Times(u64),
    Infinite,
    /// Unresolved text such as `$n`, substituted and parsed on loop entry.
    Variable(String),
}

/// One arm of an `if` chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: BranchCondition,
    pub body: Vec<Action>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCondition {
    When(String),
    /// Matches only if no earlier branch ran.
    Else,
}

impl BranchCondition {
    /// Condition text as written, `"else"` for the fallback arm.
    pub fn as_str(&self) -> &str {
        match self {
            BranchCondition::When(cond) => cond,
            BranchCondition::Else => "else",
        }
    }
}

/// Depth of the deepest nesting in `actions`. A flat list has depth 1, an
/// empty one depth 0.
pub fn tree_depth(actions: &[Action]) -> usize {
    if actions.is_empty() {
        return 0;
    }
    1 + actions
        .iter()
        .flat_map(|a| a.children())
        .map(tree_depth)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(text: &str, line: usize) -> Action {
        Action::Command {
            text: text.to_string(),
            line,
        }
    }

    #[test]
    fn test_line_and_kind() {
        let a = Action::Loop {
            count: LoopCount::Times(2),
            body: vec![cmd("echo,x", 2)],
            line: 1,
        };
        assert_eq!(a.line(), 1);
        assert_eq!(a.kind(), "loop");
        assert_eq!(Action::Break { line: 9 }.line(), 9);
    }

    #[test]
    fn test_tree_depth() {
        assert_eq!(tree_depth(&[]), 0);
        assert_eq!(tree_depth(&[cmd("a", 1)]), 1);

        let nested = Action::If {
            branches: vec![
                Branch {
                    condition: BranchCondition::When("1".into()),
                    body: vec![cmd("a", 2)],
                    line: 1,
                },
                Branch {
                    condition: BranchCondition::Else,
                    body: vec![Action::Loop {
                        count: LoopCount::Infinite,
                        body: vec![Action::Break { line: 5 }],
                        line: 4,
                    }],
                    line: 3,
                },
            ],
            line: 1,
        };
        assert_eq!(tree_depth(&[nested]), 3);
    }

    #[test]
    fn test_else_sentinel_text() {
        assert_eq!(BranchCondition::Else.as_str(), "else");
        assert_eq!(BranchCondition::When("$x > 1".into()).as_str(), "$x > 1");
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(cmd("press,a,0.1", 3)).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["line"], 3);
    }
}
