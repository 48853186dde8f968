//! Variable namespaces and function table for a single macro run.
//!
//! An [`ExecutionContext`] holds four variable namespaces, looked up in this
//! order:
//!
//! 1. loop variables (`$i`), an explicit stack of scopes, innermost first
//! 2. special variables (`@speed`, `@iterations`), set once per run
//! 3. user variables (`$name = expr`)
//! 4. system variables (`$mouse_x`, `$mouse_y`, `$screen_width`, `$screen_height`)
//!
//! It also owns the function table populated by the parser.
//!
//! # Example
//!
//! ```
//! use keyweave_core::context::ExecutionContext;
//! use keyweave_core::eval::Value;
//!
//! let mut ctx = ExecutionContext::new();
//! ctx.set_variable("$name", Value::from("world"));
//! ctx.push_loop_scope();
//! ctx.set_loop_var("$i", Value::from("2"));
//!
//! assert_eq!(ctx.substitute("echo,hello $name #$i"), "echo,hello world #2");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::action::Action;
use crate::driver::InputDriver;
use crate::eval::{Environment, Value};

/// Names of the live host-state variables.
pub const MOUSE_X: &str = "$mouse_x";
pub const MOUSE_Y: &str = "$mouse_y";
pub const SCREEN_WIDTH: &str = "$screen_width";
pub const SCREEN_HEIGHT: &str = "$screen_height";

/// Name of the implicit loop counter.
pub const LOOP_COUNTER: &str = "$i";

/// Mutable state for one macro run.
///
/// A fresh context is created for every top-level execution request, so
/// nothing leaks from one run into the next.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    loop_scopes: Vec<HashMap<String, Value>>,
    system_vars: HashMap<String, Value>,
    special_vars: HashMap<String, Value>,
    functions: HashMap<String, Arc<Vec<Action>>>,
    screen_size: Option<(u32, u32)>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// User variables only, as declared so far. The parser evaluates
    /// declarations against this map.
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Look a name up across all namespaces, honouring precedence.
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.loop_scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.special_vars.get(name))
            .or_else(|| self.variables.get(name))
            .or_else(|| self.system_vars.get(name))
    }

    /// Like [`get_variable`](Self::get_variable), falling back to `default`.
    pub fn get_variable_or(&self, name: &str, default: Value) -> Value {
        self.get_variable(name).cloned().unwrap_or(default)
    }

    pub fn variable_exists(&self, name: &str) -> bool {
        self.get_variable(name).is_some()
    }

    /// Refresh the system variables from the driver.
    ///
    /// The pointer position is queried on every call. The screen size is
    /// queried once and cached; hosts that cannot report it get `(0, 0)`.
    pub async fn update_system_vars(&mut self, driver: &dyn InputDriver) {
        let (x, y) = match driver.pointer_position().await {
            Ok(pos) => pos,
            Err(e) => {
                debug!(error = %e, "pointer position unavailable");
                (0, 0)
            }
        };

        let (w, h) = match self.screen_size {
            Some(size) => size,
            None => {
                let size = driver.screen_size().await.unwrap_or_else(|e| {
                    debug!(error = %e, "screen size unavailable");
                    (0, 0)
                });
                self.screen_size = Some(size);
                size
            }
        };

        self.system_vars.clear();
        self.system_vars.insert(MOUSE_X.to_string(), Value::from(x));
        self.system_vars.insert(MOUSE_Y.to_string(), Value::from(y));
        self.system_vars
            .insert(SCREEN_WIDTH.to_string(), Value::from(i64::from(w)));
        self.system_vars
            .insert(SCREEN_HEIGHT.to_string(), Value::from(i64::from(h)));
    }

    /// Replace every defined `$name` / `@name` token in `text` with its value.
    ///
    /// A token spans the longest run of identifier characters after the
    /// sigil, so `$i2` is only replaced when `$i2` itself is defined. Tokens
    /// with no binding are left verbatim. Replacement is a single pass; a
    /// substituted value is never scanned again.
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find(|c: char| c == '$' || c == '@') {
            out.push_str(&rest[..pos]);
            let after_sigil = &rest[pos + 1..];
            let name_len = after_sigil
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after_sigil.len());
            let token = &rest[pos..pos + 1 + name_len];

            match self.get_variable(token) {
                Some(value) if name_len > 0 => out.push_str(&value.to_string()),
                _ => out.push_str(token),
            }
            rest = &rest[pos + 1 + name_len..];
        }
        out.push_str(rest);
        out
    }

    pub fn register_function(&mut self, name: impl Into<String>, body: Vec<Action>) {
        self.functions.insert(name.into(), Arc::new(body));
    }

    pub fn get_function(&self, name: &str) -> Option<Arc<Vec<Action>>> {
        self.functions.get(name).cloned()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered functions, in no particular order.
    pub fn functions(&self) -> impl Iterator<Item = (&str, &[Action])> {
        self.functions
            .iter()
            .map(|(name, body)| (name.as_str(), body.as_slice()))
    }

    /// Enter a new loop scope. Variables bound in it shadow outer scopes
    /// until the matching [`pop_loop_scope`](Self::pop_loop_scope).
    pub fn push_loop_scope(&mut self) {
        self.loop_scopes.push(HashMap::new());
    }

    pub fn pop_loop_scope(&mut self) {
        self.loop_scopes.pop();
    }

    /// Bind a loop variable in the innermost scope, opening one if needed.
    pub fn set_loop_var(&mut self, name: impl Into<String>, value: Value) {
        if self.loop_scopes.is_empty() {
            self.loop_scopes.push(HashMap::new());
        }
        if let Some(scope) = self.loop_scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    pub fn set_special_var(&mut self, name: impl Into<String>, value: Value) {
        self.special_vars.insert(name.into(), value);
    }

    pub fn clear_loop_vars(&mut self) {
        self.loop_scopes.clear();
    }

    /// Every visible variable, merged for debug inspection.
    ///
    /// Namespaces are merged from lowest to highest precedence, so a name
    /// bound in several places shows the value [`get_variable`](Self::get_variable)
    /// would return.
    pub fn get_all_variables(&self) -> BTreeMap<String, Value> {
        let mut all = BTreeMap::new();
        all.extend(self.system_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        all.extend(self.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        all.extend(self.special_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        for scope in &self.loop_scopes {
            all.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }
}

impl Environment for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get_variable(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunDriver;

    #[test]
    fn test_loop_vars_take_precedence() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("$i", Value::from("user"));
        ctx.set_loop_var("$i", Value::from("loop"));
        assert_eq!(ctx.get_variable("$i"), Some(&Value::from("loop")));
    }

    #[test]
    fn test_special_vars_shadow_user_vars() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("@speed", Value::from(9));
        ctx.set_special_var("@speed", Value::Number(1.5));
        assert_eq!(ctx.get_variable("@speed"), Some(&Value::Number(1.5)));
    }

    #[test]
    fn test_get_variable_or_default() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.get_variable_or("$nope", Value::from(7)), Value::from(7));
        assert!(!ctx.variable_exists("$nope"));
    }

    #[test]
    fn test_nested_scopes_restore_outer_counter() {
        let mut ctx = ExecutionContext::new();
        ctx.push_loop_scope();
        ctx.set_loop_var("$i", Value::from("outer"));
        ctx.push_loop_scope();
        ctx.set_loop_var("$i", Value::from("inner"));
        assert_eq!(ctx.substitute("$i"), "inner");
        ctx.pop_loop_scope();
        assert_eq!(ctx.substitute("$i"), "outer");
        ctx.clear_loop_vars();
        assert_eq!(ctx.substitute("$i"), "$i");
    }

    #[test]
    fn test_substitute_respects_name_boundaries() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("$i", Value::from(1));
        ctx.set_variable("$i2", Value::from(22));
        assert_eq!(ctx.substitute("$i,$i2,$i3"), "1,22,$i3");
        assert_eq!(ctx.substitute("file$i.txt"), "file1.txt");
    }

    #[test]
    fn test_substitute_leaves_unknown_and_bare_sigils() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.substitute("cost $ 5 @ noon $x"), "cost $ 5 @ noon $x");
    }

    #[test]
    fn test_substitute_is_single_pass() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("$a", Value::from("$b"));
        ctx.set_variable("$b", Value::from("nope"));
        assert_eq!(ctx.substitute("$a"), "$b");
    }

    #[test]
    fn test_all_variables_merge_in_precedence_order() {
        let mut ctx = ExecutionContext::new();
        ctx.set_variable("$x", Value::from(1));
        ctx.set_variable("$i", Value::from("user"));
        ctx.set_loop_var("$i", Value::from("3"));
        ctx.set_special_var("@speed", Value::from(2));
        let all = ctx.get_all_variables();
        assert_eq!(all.get("$x"), Some(&Value::from(1)));
        assert_eq!(all.get("$i"), Some(&Value::from("3")));
        assert_eq!(all.get("@speed"), Some(&Value::from(2)));
    }

    #[test]
    fn test_functions_register_and_lookup() {
        let mut ctx = ExecutionContext::new();
        ctx.register_function(
            "heal",
            vec![Action::Command {
                text: "press,h,0.1".into(),
                line: 2,
            }],
        );
        assert!(ctx.has_function("heal"));
        assert_eq!(ctx.get_function("heal").map(|b| b.len()), Some(1));
        assert!(ctx.get_function("missing").is_none());
    }

    #[tokio::test]
    async fn test_update_system_vars_reads_driver() {
        let driver = DryRunDriver::with_screen_size(1920, 1080);
        driver.set_pointer(15, 25);
        let mut ctx = ExecutionContext::new();
        ctx.update_system_vars(&driver).await;
        assert_eq!(ctx.get_variable(MOUSE_X), Some(&Value::from(15)));
        assert_eq!(ctx.get_variable(SCREEN_WIDTH), Some(&Value::from(1920)));
        assert_eq!(ctx.substitute("$screen_height"), "1080");
    }
}
