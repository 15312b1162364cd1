///! The definition environment for RJoy.
///!
///! A flat mapping from symbol ids to definitions: either a primitive
///! (an index into the primitive table) or a user body (a quotation).
///! Populated once with all primitives at startup; DEFINE/LIBRA blocks
///! install or replace user symbols. Symbols are never removed.
///!
///! The autoput/undeferror/echo flags live here too, so the evaluator
///! stays a function of (program, environment, stack).

use std::collections::HashMap;
use std::rc::Rc;

use crate::symbol::Sym;
use crate::value::Value;

#[derive(Clone, Debug)]
pub enum Definition {
    /// Index into the primitive table.
    Primitive(u16),
    /// Quotation body executed when the symbol is invoked.
    User(Rc<Vec<Value>>),
}

pub struct Env {
    defs: HashMap<Sym, Definition>,
    /// 0 = keep stack after a phrase, 1 = pop and print top, 2 = print all.
    pub autoput: i64,
    /// 1 = unknown symbols are an error, 0 = silently ignored.
    pub undeferror: i64,
    /// >=1 echoes input lines, >=2 also dumps the stack after an error.
    pub echo: i64,
}

impl Env {
    pub fn new() -> Self {
        Env {
            defs: HashMap::new(),
            autoput: 1,
            undeferror: 1,
            echo: 0,
        }
    }

    /// Look up a definition. Constant expected time.
    pub fn lookup(&self, sym: Sym) -> Option<&Definition> {
        self.defs.get(&sym)
    }

    /// Install a primitive. Used only during startup registration.
    pub fn define_primitive(&mut self, sym: Sym, id: u16) {
        self.defs.insert(sym, Definition::Primitive(id));
    }

    /// Install or replace a user definition.
    pub fn define_user(&mut self, sym: Sym, body: Rc<Vec<Value>>) {
        self.defs.insert(sym, Definition::User(body));
    }

    pub fn is_primitive(&self, sym: Sym) -> bool {
        matches!(self.defs.get(&sym), Some(Definition::Primitive(_)))
    }

    pub fn is_user(&self, sym: Sym) -> bool {
        matches!(self.defs.get(&sym), Some(Definition::User(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redefinition_replaces() {
        let mut env = Env::new();
        env.define_user(0, Rc::new(vec![Value::Int(1)]));
        env.define_user(0, Rc::new(vec![Value::Int(2)]));
        match env.lookup(0) {
            Some(Definition::User(body)) => assert_eq!(body[0], Value::Int(2)),
            other => panic!("expected user definition, got {other:?}"),
        }
        assert!(env.is_user(0));
        assert!(!env.is_primitive(0));
    }

    #[test]
    fn user_can_shadow_primitive() {
        let mut env = Env::new();
        env.define_primitive(3, 7);
        assert!(env.is_primitive(3));
        env.define_user(3, Rc::new(vec![]));
        assert!(env.is_user(3));
    }
}
