//! Variable scopes for the execution core.
//!
//! An [`EnvStack`] is the variable view of one parser. Global and universal tables are shared by
//! reference between all parsers branched from the same root: a global set in one execution
//! thread is immediately visible to every other. Local scopes belong to the owning parser alone;
//! branching copies them, so mutations in a child never escape to the parent.

use crate::wchar::prelude::*;
use bitflags::bitflags;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

bitflags! {
    /// Flags that may be passed as the `mode` in env_stack_t::set() / environment_t::get().
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct EnvMode: u16 {
        /// Default mode. Used with `env_stack_t::get()` to indicate the caller doesn't care.
        const DEFAULT = 0;
        /// Flag for local (to the current block) variable.
        const LOCAL = 1 << 0;
        /// Flag for the topmost local scope of the innermost function.
        const FUNCTION = 1 << 1;
        /// Flag for global variable.
        const GLOBAL = 1 << 2;
        /// Flag for universal variable.
        const UNIVERSAL = 1 << 3;
        /// Flag for exported (to commands) variable.
        const EXPORT = 1 << 4;
        /// Flag for unexported variable.
        const UNEXPORT = 1 << 5;
    }
}

/// Return values for `EnvStack::set()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvStackSetResult {
    Ok,
    Scope,
    NotFound,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct EnvVarFlags: u8 {
        /// Whether the variable is exported to child processes.
        const EXPORT = 1 << 0;
    }
}

/// A variable: a value (a list of strings) and flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvVar {
    values: Arc<Vec<WString>>,
    flags: EnvVarFlags,
}

impl EnvVar {
    pub fn new(value: WString, flags: EnvVarFlags) -> Self {
        Self::new_from_vec(vec![value], flags)
    }

    pub fn new_from_vec(values: Vec<WString>, flags: EnvVarFlags) -> Self {
        EnvVar {
            values: Arc::new(values),
            flags,
        }
    }

    pub fn as_list(&self) -> &[WString] {
        &self.values
    }

    /// Returns the variable's values joined with spaces, the way `$var` interpolates in a string.
    pub fn as_string(&self) -> WString {
        let mut result = WString::new();
        for (i, val) in self.values.iter().enumerate() {
            if i > 0 {
                result.push(' ');
            }
            result.push_utfstr(val);
        }
        result
    }

    pub fn exports(&self) -> bool {
        self.flags.contains(EnvVarFlags::EXPORT)
    }
}

pub type VarTable = HashMap<WString, EnvVar>;

/// One local scope: a table of variables, and whether lookups may proceed past it.
#[derive(Clone, Default)]
struct Scope {
    env: VarTable,
    /// Whether this scope shadows (starts a new function body): lookups of FUNCTION-mode
    /// variables stop here.
    shadows: bool,
}

/// Data which is per parser but exposed through variable accessors, like `$PWD`.
#[derive(Clone)]
struct PerProcData {
    pwd: WString,
}

/// The variable stack of one parser.
pub struct EnvStack {
    /// Global variables, shared between all parsers of this shell.
    globals: Arc<Mutex<VarTable>>,

    /// Universal variables. Shared like globals; persistence is handled elsewhere.
    universals: Arc<Mutex<VarTable>>,

    /// Our local scopes, innermost last. Not shared: branching copies these.
    locals: RefCell<Vec<Scope>>,

    /// Per-parser data exposed as variables.
    perproc: RefCell<PerProcData>,
}

// Safety: an EnvStack is only read or mutated by its owning execution thread while that thread
// holds the GIL; the shared tables are behind mutexes.
unsafe impl Send for EnvStack {}
unsafe impl Sync for EnvStack {}

impl EnvStack {
    /// Create a new root stack with fresh global and universal tables and one function scope.
    pub fn new() -> Self {
        EnvStack {
            globals: Arc::new(Mutex::new(VarTable::new())),
            universals: Arc::new(Mutex::new(VarTable::new())),
            locals: RefCell::new(vec![Scope {
                env: VarTable::new(),
                shadows: true,
            }]),
            perproc: RefCell::new(PerProcData {
                pwd: current_dir_as_pwd(),
            }),
        }
    }

    /// Create the variable stack of a branched child parser. The child snapshots our local and
    /// function scopes; the global and universal tables are shared by reference.
    pub fn branch(&self) -> Self {
        EnvStack {
            globals: Arc::clone(&self.globals),
            universals: Arc::clone(&self.universals),
            locals: RefCell::new(self.locals.borrow().clone()),
            perproc: RefCell::new(self.perproc.borrow().clone()),
        }
    }

    /// Push a new scope. `shadows` should be true for function bodies, false for plain blocks.
    pub fn push(&self, shadows: bool) {
        self.locals.borrow_mut().push(Scope {
            env: VarTable::new(),
            shadows,
        });
    }

    /// Pop the innermost scope.
    pub fn pop(&self) {
        let popped = self.locals.borrow_mut().pop();
        assert!(popped.is_some(), "Popped the last scope");
        assert!(
            !self.locals.borrow().is_empty(),
            "Popped the function scope"
        );
    }

    /// Get a variable, consulting only the scopes permitted by `mode`.
    pub fn getf(&self, key: &wstr, mode: EnvMode) -> Option<EnvVar> {
        let query_local = mode.intersects(EnvMode::LOCAL | EnvMode::FUNCTION);
        let query_global = mode.contains(EnvMode::GLOBAL);
        let query_universal = mode.contains(EnvMode::UNIVERSAL);
        let query_all = !(query_local || query_global || query_universal);

        if query_all || query_global {
            if key == "PWD" {
                return Some(EnvVar::new(
                    self.perproc.borrow().pwd.clone(),
                    EnvVarFlags::EXPORT,
                ));
            }
        }

        if query_all || query_local {
            for scope in self.locals.borrow().iter().rev() {
                if let Some(var) = scope.env.get(key) {
                    return Some(var.clone());
                }
                if scope.shadows && mode.contains(EnvMode::LOCAL) {
                    break;
                }
            }
        }
        if query_all || query_global {
            if let Some(var) = self.globals.lock().unwrap().get(key) {
                return Some(var.clone());
            }
        }
        if query_all || query_universal {
            if let Some(var) = self.universals.lock().unwrap().get(key) {
                return Some(var.clone());
            }
        }
        None
    }

    /// Get a variable from any scope.
    pub fn get(&self, key: &wstr) -> Option<EnvVar> {
        self.getf(key, EnvMode::DEFAULT)
    }

    /// Get a variable unless it is empty.
    pub fn get_unless_empty(&self, key: &wstr) -> Option<EnvVar> {
        match self.get(key) {
            Some(var) if !var.as_list().is_empty() => Some(var),
            _ => None,
        }
    }

    /// Set a variable.
    pub fn set(&self, key: &wstr, mode: EnvMode, vals: Vec<WString>) -> EnvStackSetResult {
        if key == "PWD" {
            // PWD is per parser. It always has a single value.
            let mut vals = vals;
            self.perproc.borrow_mut().pwd = vals.pop().unwrap_or_default();
            return EnvStackSetResult::Ok;
        }

        let flags = if mode.contains(EnvMode::EXPORT) {
            EnvVarFlags::EXPORT
        } else if mode.contains(EnvMode::UNEXPORT) {
            EnvVarFlags::default()
        } else {
            // Keep the existing export status.
            match self.get(key) {
                Some(var) if var.exports() => EnvVarFlags::EXPORT,
                _ => EnvVarFlags::default(),
            }
        };
        let var = EnvVar::new_from_vec(vals, flags);

        if mode.contains(EnvMode::UNIVERSAL) {
            self.universals.lock().unwrap().insert(key.to_owned(), var);
        } else if mode.contains(EnvMode::GLOBAL) {
            self.globals.lock().unwrap().insert(key.to_owned(), var);
        } else if mode.contains(EnvMode::LOCAL) {
            let mut locals = self.locals.borrow_mut();
            locals.last_mut().unwrap().env.insert(key.to_owned(), var);
        } else if mode.contains(EnvMode::FUNCTION) {
            let mut locals = self.locals.borrow_mut();
            let scope = locals
                .iter_mut()
                .rev()
                .find(|scope| scope.shadows)
                .expect("No function scope");
            scope.env.insert(key.to_owned(), var);
        } else {
            // No scope flag: update the variable where it already exists, else create it in the
            // function scope.
            let mut locals = self.locals.borrow_mut();
            let existing = locals.iter().rposition(|scope| scope.env.contains_key(key));
            if let Some(idx) = existing {
                locals[idx].env.insert(key.to_owned(), var);
            } else if self.globals.lock().unwrap().contains_key(key) {
                self.globals.lock().unwrap().insert(key.to_owned(), var);
            } else if self.universals.lock().unwrap().contains_key(key) {
                self.universals.lock().unwrap().insert(key.to_owned(), var);
            } else {
                let scope = locals
                    .iter_mut()
                    .rev()
                    .find(|scope| scope.shadows)
                    .expect("No function scope");
                scope.env.insert(key.to_owned(), var);
            }
        }
        EnvStackSetResult::Ok
    }

    /// Convenience to set a single value.
    pub fn set_one(&self, key: &wstr, mode: EnvMode, val: WString) -> EnvStackSetResult {
        self.set(key, mode, vec![val])
    }

    /// Remove a variable.
    pub fn remove(&self, key: &wstr, mode: EnvMode) -> EnvStackSetResult {
        if mode.contains(EnvMode::UNIVERSAL) {
            return match self.universals.lock().unwrap().remove(key) {
                Some(_) => EnvStackSetResult::Ok,
                None => EnvStackSetResult::NotFound,
            };
        }
        if mode.contains(EnvMode::GLOBAL) {
            return match self.globals.lock().unwrap().remove(key) {
                Some(_) => EnvStackSetResult::Ok,
                None => EnvStackSetResult::NotFound,
            };
        }
        let mut locals = self.locals.borrow_mut();
        for scope in locals.iter_mut().rev() {
            if scope.env.remove(key).is_some() {
                return EnvStackSetResult::Ok;
            }
        }
        if !mode.intersects(EnvMode::LOCAL | EnvMode::FUNCTION) {
            if self.globals.lock().unwrap().remove(key).is_some() {
                return EnvStackSetResult::Ok;
            }
        }
        EnvStackSetResult::NotFound
    }

    /// Return $PWD with a terminating slash.
    pub fn get_pwd_slash(&self) -> WString {
        let mut pwd = self.perproc.borrow().pwd.clone();
        if !pwd.as_char_slice().last().is_some_and(|&c| c == '/') {
            pwd.push('/');
        }
        pwd
    }

    /// Return $PWD.
    pub fn get_pwd(&self) -> Ref<'_, WString> {
        Ref::map(self.perproc.borrow(), |p| &p.pwd)
    }

    /// Set $PWD from the process working directory.
    pub fn set_pwd_from_getcwd(&self) {
        self.perproc.borrow_mut().pwd = current_dir_as_pwd();
    }
}

fn current_dir_as_pwd() -> WString {
    match std::env::current_dir() {
        Ok(dir) => crate::common::str2wcstring(dir.to_string_lossy().as_bytes()),
        Err(_) => WString::from("/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoping() {
        let vars = EnvStack::new();
        vars.set_one(L!("alpha"), EnvMode::GLOBAL, L!("global").to_owned());
        vars.push(false);
        vars.set_one(L!("alpha"), EnvMode::LOCAL, L!("block").to_owned());
        assert_eq!(vars.get(L!("alpha")).unwrap().as_string(), "block");
        vars.pop();
        assert_eq!(vars.get(L!("alpha")).unwrap().as_string(), "global");
    }

    #[test]
    fn test_branch_isolation() {
        let parent = EnvStack::new();
        parent.set_one(L!("lcl"), EnvMode::LOCAL, L!("one").to_owned());
        let child = parent.branch();

        // The child sees the seed, but its writes do not escape.
        assert_eq!(child.get(L!("lcl")).unwrap().as_string(), "one");
        child.set_one(L!("lcl"), EnvMode::LOCAL, L!("two").to_owned());
        assert_eq!(parent.get(L!("lcl")).unwrap().as_string(), "one");

        // Globals are shared by reference.
        child.set_one(L!("gbl"), EnvMode::GLOBAL, L!("shared").to_owned());
        assert_eq!(parent.get(L!("gbl")).unwrap().as_string(), "shared");
    }

    #[test]
    fn test_default_scope_set() {
        let vars = EnvStack::new();
        vars.set_one(L!("x"), EnvMode::DEFAULT, L!("first").to_owned());
        vars.push(false);
        // No scope flag updates the existing binding rather than creating a new one.
        vars.set_one(L!("x"), EnvMode::DEFAULT, L!("second").to_owned());
        vars.pop();
        assert_eq!(vars.get(L!("x")).unwrap().as_string(), "second");
    }
}
