///! The RJoy stack machine.
///!
///! A program is a list value; executing it processes the terms in order:
///! literals push themselves, symbols dispatch to a primitive or a user
///! body. The machine keeps an explicit continuation stack of pending term
///! sequences. Invoking a user body, `i`, `x`, or the chosen branch of
///! `branch`/`ifte`/`cond` queues a frame — replacing the current frame
///! when the call was its final term — so recursion through those words
///! costs continuation entries, not host stack. Combinators that
///! interleave Rust control flow with Joy execution (`map`, `linrec`,
///! `binrec`, …) re-enter `execute`; host depth there is bounded by the
///! Joy-level recursion of those combinators and comfortably reaches
///! thousands.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use crate::env::{Definition, Env};
use crate::error::{JoyError, Result};
use crate::parser::{self, Phrase};
use crate::printer;
use crate::prims;
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FileHandle, Numeric, Value};

/// A pending term sequence: the continuation stack holds these.
struct Frame {
    terms: Rc<Vec<Value>>,
    pos: usize,
}

pub struct Evaluator {
    pub stack: Vec<Value>,
    pub env: Env,
    pub syms: SymbolTable,
    conts: Vec<Frame>,
    /// Program arguments exposed by `argv`/`argc`.
    pub args: Vec<String>,
    /// State of the `rand`/`srand` generator.
    pub rand_state: u64,
    /// Terms already read but not yet consumed by `get`.
    pub pending_input: VecDeque<Value>,
    /// Set when standard input hits end of file.
    pub stdin_eof: bool,
    start: Instant,
    sym_genrec: Sym,
}

impl Evaluator {
    pub fn new() -> Self {
        let mut syms = SymbolTable::new();
        let mut env = Env::new();
        prims::register(&mut env, &mut syms);
        let sym_genrec = syms.intern("genrec");

        Evaluator {
            stack: Vec::new(),
            env,
            syms,
            conts: Vec::new(),
            args: Vec::new(),
            rand_state: 1,
            pending_input: VecDeque::new(),
            stdin_eof: false,
            start: Instant::now(),
            sym_genrec,
        }
    }

    // ── Machine loop ──

    /// Execute a program against the current stack.
    pub fn execute(&mut self, program: Rc<Vec<Value>>) -> Result<()> {
        let base = self.conts.len();
        self.conts.push(Frame {
            terms: program,
            pos: 0,
        });
        let result = self.run_to(base);
        if result.is_err() {
            self.conts.truncate(base);
        }
        result
    }

    fn run_to(&mut self, base: usize) -> Result<()> {
        while self.conts.len() > base {
            let frame = self.conts.last_mut().unwrap();
            if frame.pos >= frame.terms.len() {
                self.conts.pop();
                continue;
            }
            let term = frame.terms[frame.pos].clone();
            frame.pos += 1;
            match term {
                Value::Symbol(sym) => self.dispatch(sym)?,
                other => self.stack.push(other),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, sym: Sym) -> Result<()> {
        match self.env.lookup(sym).cloned() {
            Some(Definition::User(body)) => {
                self.enter_program(body);
                Ok(())
            }
            Some(Definition::Primitive(id)) => prims::run(self, id),
            None => {
                if self.env.undeferror != 0 {
                    Err(JoyError::Undefined(self.syms.name(sym).to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Queue a program on the continuation stack. Replaces the current
    /// frame when it is exhausted (the invocation was its final term),
    /// which is what makes user-word and `i` tail calls run in constant
    /// space. Only safe as a combinator's final action.
    pub(crate) fn enter_program(&mut self, body: Rc<Vec<Value>>) {
        if let Some(frame) = self.conts.last_mut() {
            if frame.pos >= frame.terms.len() {
                frame.terms = body;
                frame.pos = 0;
                return;
            }
        }
        self.conts.push(Frame {
            terms: body,
            pos: 0,
        });
    }

    // ── Top-level phrases ──

    pub fn run_phrase(&mut self, phrase: &Phrase) -> Result<()> {
        match phrase {
            Phrase::Defs(defs) => {
                for (sym, body) in defs {
                    self.env.define_user(*sym, body.clone());
                }
                Ok(())
            }
            Phrase::Terms(terms) => {
                self.execute(terms.clone())?;
                match self.env.autoput {
                    1 => {
                        if let Some(top) = self.stack.pop() {
                            println!("{}", printer::print_val(&top, &self.syms));
                        }
                    }
                    2 => println!("{}", self.stack_dump()),
                    _ => {}
                }
                Ok(())
            }
        }
    }

    /// Parse and run a whole source text (files, `include`).
    pub fn run_source(&mut self, source: &str, file: &str) -> Result<()> {
        let phrases = parser::parse(source, file, &mut self.syms)?;
        for phrase in &phrases {
            self.run_phrase(phrase)?;
        }
        Ok(())
    }

    /// The stack rendered bottom to top on one line.
    pub fn stack_dump(&self) -> String {
        self.stack
            .iter()
            .map(|v| printer::print_val(v, &self.syms))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Remaining term sequences on the continuation stack, innermost first.
    pub fn continuations(&self) -> Vec<Value> {
        self.conts
            .iter()
            .rev()
            .map(|f| Value::list(f.terms[f.pos.min(f.terms.len())..].to_vec()))
            .collect()
    }

    /// Microseconds of elapsed process time, for `clock`.
    pub fn elapsed_micros(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    // ── Stack access used by primitives ──

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self, op: &'static str) -> Result<Value> {
        self.stack.pop().ok_or(JoyError::StackUnderflow {
            op,
            needed: 1,
            depth: 0,
        })
    }

    pub fn type_err(&self, op: &'static str, expected: &'static str, got: &Value) -> JoyError {
        JoyError::Type {
            op,
            expected,
            actual: got.kind().to_string(),
        }
    }

    pub fn pop_int(&mut self, op: &'static str) -> Result<i64> {
        match self.pop(op)? {
            Value::Int(i) => Ok(i),
            other => Err(self.type_err(op, "integer", &other)),
        }
    }

    pub fn pop_num(&mut self, op: &'static str) -> Result<Numeric> {
        let v = self.pop(op)?;
        if v.is_numeric() {
            Ok(crate::value::numeric_of(&v))
        } else {
            Err(self.type_err(op, "numeric", &v))
        }
    }

    pub fn pop_quot(&mut self, op: &'static str) -> Result<Rc<Vec<Value>>> {
        match self.pop(op)? {
            Value::List(l) => Ok(l),
            other => Err(self.type_err(op, "quotation", &other)),
        }
    }

    pub fn pop_string(&mut self, op: &'static str) -> Result<Rc<String>> {
        match self.pop(op)? {
            Value::Str(s) => Ok(s),
            other => Err(self.type_err(op, "string", &other)),
        }
    }

    pub fn pop_file(&mut self, op: &'static str) -> Result<FileHandle> {
        match self.pop(op)? {
            Value::File(h) => Ok(h),
            other => Err(self.type_err(op, "file", &other)),
        }
    }

    // ── Combinator support ──

    /// Stack-save test: run a predicate quotation against a copy of the
    /// stack, take the truth of the resulting top, discard all other
    /// effects.
    fn test_quot(&mut self, q: &Rc<Vec<Value>>, op: &'static str) -> Result<bool> {
        let save = self.stack.clone();
        self.execute(q.clone())?;
        let truth = self
            .stack
            .last()
            .map(Value::is_truthy)
            .ok_or(JoyError::StackUnderflow {
                op,
                needed: 1,
                depth: 0,
            })?;
        self.stack = save;
        Ok(truth)
    }

    /// Stack-save evaluation to a single value: run a quotation against a
    /// copy of the stack and return the new top.
    fn eval_quot_top(&mut self, q: &Rc<Vec<Value>>, op: &'static str) -> Result<Value> {
        let save = self.stack.clone();
        self.execute(q.clone())?;
        let top = self.pop(op)?;
        self.stack = save;
        Ok(top)
    }

    fn save_truth(&self, op: &'static str) -> Result<bool> {
        self.stack
            .last()
            .map(Value::is_truthy)
            .ok_or(JoyError::StackUnderflow {
                op,
                needed: 1,
                depth: 0,
            })
    }

    // ── Combinators ──
    //
    // Registered in the primitive table but implemented here because they
    // re-enter the machine.

    pub fn comb_i(&mut self) -> Result<()> {
        let q = self.pop_quot("i")?;
        self.enter_program(q);
        Ok(())
    }

    pub fn comb_x(&mut self) -> Result<()> {
        let q = match self.stack.last() {
            Some(v) => v
                .as_list()
                .cloned()
                .ok_or_else(|| self.type_err("x", "quotation", v))?,
            None => {
                return Err(JoyError::StackUnderflow {
                    op: "x",
                    needed: 1,
                    depth: 0,
                })
            }
        };
        self.enter_program(q);
        Ok(())
    }

    pub fn comb_dip(&mut self) -> Result<()> {
        let q = self.pop_quot("dip")?;
        let x = self.pop("dip")?;
        self.execute(q)?;
        self.push(x);
        Ok(())
    }

    pub fn comb_branch(&mut self) -> Result<()> {
        let f = self.pop_quot("branch")?;
        let t = self.pop_quot("branch")?;
        let b = self.pop("branch")?;
        self.enter_program(if b.is_truthy() { t } else { f });
        Ok(())
    }

    pub fn comb_ifte(&mut self) -> Result<()> {
        let f = self.pop_quot("ifte")?;
        let t = self.pop_quot("ifte")?;
        let b = self.pop_quot("ifte")?;
        let taken = self.test_quot(&b, "ifte")?;
        self.enter_program(if taken { t } else { f });
        Ok(())
    }

    pub fn comb_cond(&mut self) -> Result<()> {
        let clauses = self.pop_quot("cond")?;
        if clauses.is_empty() {
            return Err(JoyError::Domain {
                op: "cond",
                msg: "empty clause list".into(),
            });
        }
        for clause in clauses[..clauses.len() - 1].iter() {
            let clause = match clause {
                Value::List(c) if !c.is_empty() => c,
                other => return Err(self.type_err("cond", "non-empty clause", other)),
            };
            let pred = match &clause[0] {
                Value::List(p) => p.clone(),
                other => return Err(self.type_err("cond", "predicate quotation", other)),
            };
            if self.test_quot(&pred, "cond")? {
                self.enter_program(Rc::new(clause[1..].to_vec()));
                return Ok(());
            }
        }
        // default clause: no predicate, executed wholesale
        match clauses.last().unwrap() {
            Value::List(d) => {
                self.enter_program(d.clone());
                Ok(())
            }
            other => Err(self.type_err("cond", "default clause", other)),
        }
    }

    pub fn comb_while(&mut self) -> Result<()> {
        let d = self.pop_quot("while")?;
        let b = self.pop_quot("while")?;
        while self.test_quot(&b, "while")? {
            self.execute(d.clone())?;
        }
        Ok(())
    }

    pub fn comb_step(&mut self) -> Result<()> {
        let p = self.pop_quot("step")?;
        let a = self.pop("step")?;
        for item in prims::elements_of(&a, "step")? {
            self.push(item);
            self.execute(p.clone())?;
        }
        Ok(())
    }

    pub fn comb_map(&mut self) -> Result<()> {
        let p = self.pop_quot("map")?;
        let a = self.pop("map")?;
        let mut results = Vec::new();
        for item in prims::elements_of(&a, "map")? {
            let save = self.stack.clone();
            self.push(item);
            self.execute(p.clone())?;
            results.push(self.pop("map")?);
            self.stack = save;
        }
        let out = prims::aggregate_like(&a, results, "map")?;
        self.push(out);
        Ok(())
    }

    pub fn comb_fold(&mut self) -> Result<()> {
        let p = self.pop_quot("fold")?;
        let v0 = self.pop("fold")?;
        let a = self.pop("fold")?;
        self.push(v0);
        for item in prims::elements_of(&a, "fold")? {
            self.push(item);
            self.execute(p.clone())?;
        }
        Ok(())
    }

    pub fn comb_filter(&mut self) -> Result<()> {
        let p = self.pop_quot("filter")?;
        let a = self.pop("filter")?;
        let mut kept = Vec::new();
        for item in prims::elements_of(&a, "filter")? {
            let save = self.stack.clone();
            self.push(item.clone());
            self.execute(p.clone())?;
            let keep = self.save_truth("filter")?;
            self.stack = save;
            if keep {
                kept.push(item);
            }
        }
        let out = prims::aggregate_like(&a, kept, "filter")?;
        self.push(out);
        Ok(())
    }

    pub fn comb_split(&mut self) -> Result<()> {
        let p = self.pop_quot("split")?;
        let a = self.pop("split")?;
        let mut kept = Vec::new();
        let mut rejected = Vec::new();
        for item in prims::elements_of(&a, "split")? {
            let save = self.stack.clone();
            self.push(item.clone());
            self.execute(p.clone())?;
            let keep = self.save_truth("split")?;
            self.stack = save;
            if keep {
                kept.push(item);
            } else {
                rejected.push(item);
            }
        }
        let kept = prims::aggregate_like(&a, kept, "split")?;
        let rejected = prims::aggregate_like(&a, rejected, "split")?;
        self.push(kept);
        self.push(rejected);
        Ok(())
    }

    pub fn comb_some(&mut self) -> Result<()> {
        let p = self.pop_quot("some")?;
        let a = self.pop("some")?;
        let mut result = false;
        for item in prims::elements_of(&a, "some")? {
            let save = self.stack.clone();
            self.push(item);
            self.execute(p.clone())?;
            let t = self.save_truth("some")?;
            self.stack = save;
            if t {
                result = true;
                break;
            }
        }
        self.push(Value::Bool(result));
        Ok(())
    }

    pub fn comb_all(&mut self) -> Result<()> {
        let p = self.pop_quot("all")?;
        let a = self.pop("all")?;
        let mut result = true;
        for item in prims::elements_of(&a, "all")? {
            let save = self.stack.clone();
            self.push(item);
            self.execute(p.clone())?;
            let t = self.save_truth("all")?;
            self.stack = save;
            if !t {
                result = false;
                break;
            }
        }
        self.push(Value::Bool(result));
        Ok(())
    }

    pub fn comb_times(&mut self) -> Result<()> {
        let p = self.pop_quot("times")?;
        let n = self.pop_int("times")?;
        for _ in 0..n.max(0) {
            self.execute(p.clone())?;
        }
        Ok(())
    }

    pub fn comb_linrec(&mut self) -> Result<()> {
        let r2 = self.pop_quot("linrec")?;
        let r1 = self.pop_quot("linrec")?;
        let t = self.pop_quot("linrec")?;
        let p = self.pop_quot("linrec")?;
        self.linrec_aux(&p, &t, &r1, &r2)
    }

    fn linrec_aux(
        &mut self,
        p: &Rc<Vec<Value>>,
        t: &Rc<Vec<Value>>,
        r1: &Rc<Vec<Value>>,
        r2: &Rc<Vec<Value>>,
    ) -> Result<()> {
        if self.test_quot(p, "linrec")? {
            self.execute(t.clone())
        } else {
            self.execute(r1.clone())?;
            self.linrec_aux(p, t, r1, r2)?;
            self.execute(r2.clone())
        }
    }

    pub fn comb_tailrec(&mut self) -> Result<()> {
        let r1 = self.pop_quot("tailrec")?;
        let t = self.pop_quot("tailrec")?;
        let p = self.pop_quot("tailrec")?;
        loop {
            if self.test_quot(&p, "tailrec")? {
                self.enter_program(t);
                return Ok(());
            }
            self.execute(r1.clone())?;
        }
    }

    pub fn comb_binrec(&mut self) -> Result<()> {
        let r2 = self.pop_quot("binrec")?;
        let r1 = self.pop_quot("binrec")?;
        let t = self.pop_quot("binrec")?;
        let p = self.pop_quot("binrec")?;
        self.binrec_aux(&p, &t, &r1, &r2)
    }

    fn binrec_aux(
        &mut self,
        p: &Rc<Vec<Value>>,
        t: &Rc<Vec<Value>>,
        r1: &Rc<Vec<Value>>,
        r2: &Rc<Vec<Value>>,
    ) -> Result<()> {
        if self.test_quot(p, "binrec")? {
            self.execute(t.clone())
        } else {
            self.execute(r1.clone())?;
            let second = self.pop("binrec")?;
            self.binrec_aux(p, t, r1, r2)?;
            self.push(second);
            self.binrec_aux(p, t, r1, r2)?;
            self.execute(r2.clone())
        }
    }

    pub fn comb_genrec(&mut self) -> Result<()> {
        let r2 = self.pop_quot("genrec")?;
        let r1 = self.pop_quot("genrec")?;
        let t = self.pop_quot("genrec")?;
        let p = self.pop_quot("genrec")?;
        if self.test_quot(&p, "genrec")? {
            self.enter_program(t);
        } else {
            self.execute(r1.clone())?;
            let again = Value::list(vec![
                Value::List(p),
                Value::List(t),
                Value::List(r1),
                Value::List(r2.clone()),
                Value::Symbol(self.sym_genrec),
            ]);
            self.push(again);
            self.enter_program(r2);
        }
        Ok(())
    }

    pub fn comb_condlinrec(&mut self) -> Result<()> {
        let clauses = self.pop_quot("condlinrec")?;
        self.condnestrec_aux(&clauses)
    }

    pub fn comb_condnestrec(&mut self) -> Result<()> {
        let clauses = self.pop_quot("condnestrec")?;
        self.condnestrec_aux(&clauses)
    }

    fn condnestrec_aux(&mut self, clauses: &Rc<Vec<Value>>) -> Result<()> {
        let op: &'static str = "condnestrec";
        if clauses.is_empty() {
            return Err(JoyError::Domain {
                op,
                msg: "empty clause list".into(),
            });
        }
        let mut parts: Option<Vec<Rc<Vec<Value>>>> = None;
        for clause in clauses[..clauses.len() - 1].iter() {
            let clause = match clause {
                Value::List(c) if !c.is_empty() => c,
                other => return Err(self.type_err(op, "non-empty clause", other)),
            };
            let pred = match &clause[0] {
                Value::List(p) => p.clone(),
                other => return Err(self.type_err(op, "predicate quotation", other)),
            };
            if self.test_quot(&pred, op)? {
                parts = Some(quotation_parts(self, &clause[1..], op)?);
                break;
            }
        }
        let parts = match parts {
            Some(parts) => parts,
            // the final clause is the default: no predicate is tested
            None => match clauses.last().unwrap() {
                Value::List(d) => quotation_parts(self, d, op)?,
                other => return Err(self.type_err(op, "default clause", other)),
            },
        };
        // a single quotation runs and stops; otherwise the combinator
        // recurses between consecutive quotations
        for (i, part) in parts.iter().enumerate() {
            self.execute(part.clone())?;
            if i + 1 < parts.len() {
                self.condnestrec_aux(clauses)?;
            }
        }
        Ok(())
    }

    pub fn comb_primrec(&mut self) -> Result<()> {
        let c = self.pop_quot("primrec")?;
        let i = self.pop_quot("primrec")?;
        let x = self.pop("primrec")?;
        match x {
            Value::Int(n) => self.primrec_int(n, &i, &c),
            ref agg @ (Value::List(_) | Value::Str(_) | Value::Set(_)) => {
                let items = prims::elements_of(agg, "primrec")?;
                self.primrec_items(&items, &i, &c)
            }
            other => Err(self.type_err("primrec", "integer or aggregate", &other)),
        }
    }

    fn primrec_int(&mut self, n: i64, i: &Rc<Vec<Value>>, c: &Rc<Vec<Value>>) -> Result<()> {
        if n <= 0 {
            self.execute(i.clone())
        } else {
            self.push(Value::Int(n));
            self.primrec_int(n - 1, i, c)?;
            self.execute(c.clone())
        }
    }

    fn primrec_items(
        &mut self,
        items: &[Value],
        i: &Rc<Vec<Value>>,
        c: &Rc<Vec<Value>>,
    ) -> Result<()> {
        match items.split_first() {
            None => self.execute(i.clone()),
            Some((first, rest)) => {
                self.push(first.clone());
                self.primrec_items(rest, i, c)?;
                self.execute(c.clone())
            }
        }
    }

    /// nullary/unary/binary/ternary share this: run [P] on the live stack,
    /// then replace the result with (stack minus K args, new top).
    pub fn arity_comb(&mut self, op: &'static str, k: usize) -> Result<()> {
        let p = self.pop_quot(op)?;
        if self.stack.len() < k {
            return Err(JoyError::StackUnderflow {
                op,
                needed: k,
                depth: self.stack.len(),
            });
        }
        let top = self.eval_quot_top(&p, op)?;
        self.stack.truncate(self.stack.len() - k);
        self.push(top);
        Ok(())
    }

    /// unary2/unary3/unary4: run [P] once per argument against the stack
    /// below the arguments, collecting one result each.
    pub fn unary_k(&mut self, op: &'static str, k: usize) -> Result<()> {
        let p = self.pop_quot(op)?;
        if self.stack.len() < k {
            return Err(JoyError::StackUnderflow {
                op,
                needed: k,
                depth: self.stack.len(),
            });
        }
        let args = self.stack.split_off(self.stack.len() - k);
        let mut results = Vec::with_capacity(k);
        for arg in args {
            let save = self.stack.clone();
            self.push(arg);
            self.execute(p.clone())?;
            results.push(self.pop(op)?);
            self.stack = save;
        }
        self.stack.extend(results);
        Ok(())
    }

    pub fn comb_cleave(&mut self) -> Result<()> {
        let p2 = self.pop_quot("cleave")?;
        let p1 = self.pop_quot("cleave")?;
        if self.stack.is_empty() {
            return Err(JoyError::StackUnderflow {
                op: "cleave",
                needed: 1,
                depth: 0,
            });
        }
        let r1 = self.eval_quot_top(&p1, "cleave")?;
        let r2 = self.eval_quot_top(&p2, "cleave")?;
        self.pop("cleave")?; // the cleaved argument
        self.push(r1);
        self.push(r2);
        Ok(())
    }

    pub fn comb_infra(&mut self) -> Result<()> {
        let p = self.pop_quot("infra")?;
        let a = self.pop_quot("infra")?;
        // first element of the list is the top of the temporary stack
        let mut tmp: Vec<Value> = a.iter().rev().cloned().collect();
        std::mem::swap(&mut self.stack, &mut tmp);
        let result = self.execute(p);
        let inner = std::mem::replace(&mut self.stack, tmp);
        result?;
        let items: Vec<Value> = inner.into_iter().rev().collect();
        self.push(Value::list(items));
        Ok(())
    }
}

/// Every element of a clause tail must be a quotation.
fn quotation_parts(
    ev: &Evaluator,
    items: &[Value],
    op: &'static str,
) -> Result<Vec<Rc<Vec<Value>>>> {
    items
        .iter()
        .map(|v| match v {
            Value::List(q) => Ok(q.clone()),
            other => Err(ev.type_err(op, "quotation", other)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> Evaluator {
        let mut ev = Evaluator::new();
        ev.env.autoput = 0;
        ev.run_source(src, "test")
            .unwrap_or_else(|e| panic!("program failed: {e}"));
        ev
    }

    fn run_err(src: &str) -> JoyError {
        let mut ev = Evaluator::new();
        ev.env.autoput = 0;
        ev.run_source(src, "test").unwrap_err()
    }

    fn top(ev: &Evaluator) -> &Value {
        ev.stack.last().expect("empty stack")
    }

    fn int_list(items: &[i64]) -> Value {
        Value::list(items.iter().map(|&i| Value::Int(i)).collect())
    }

    // ── End-to-end scenarios ──

    #[test]
    fn addition() {
        let ev = run("2 3 + .");
        assert_eq!(ev.stack, vec![Value::Int(5)]);
    }

    #[test]
    fn map_squares() {
        let ev = run("[1 2 3 4] [dup *] map .");
        assert_eq!(top(&ev), &int_list(&[1, 4, 9, 16]));
    }

    #[test]
    fn primrec_factorial() {
        let ev = run("5 [1] [*] primrec .");
        assert_eq!(top(&ev), &Value::Int(120));
    }

    #[test]
    fn primrec_on_aggregate() {
        let ev = run("[1 2 3 4] [0] [+] primrec .");
        assert_eq!(top(&ev), &Value::Int(10));
    }

    #[test]
    fn linrec_flatten() {
        let ev = run("[[1 2] [3] [4 5 6]] [null] [] [uncons] [concat] linrec .");
        assert_eq!(top(&ev), &int_list(&[1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn ifte_scenario() {
        let ev = run("500 [1000 >] [2 /] [3 *] ifte .");
        assert_eq!(top(&ev), &Value::Int(1500));
    }

    #[test]
    fn set_intersection() {
        let ev = run("{1 3 5 7} {2 3 5 8} and .");
        assert_eq!(top(&ev), &Value::Set((1 << 3) | (1 << 5)));
    }

    #[test]
    fn powerlist_pairs() {
        let ev = run("[1 2 3] powerlist [size 2 =] filter .");
        assert_eq!(
            top(&ev),
            &Value::list(vec![
                int_list(&[1, 2]),
                int_list(&[1, 3]),
                int_list(&[2, 3]),
            ])
        );
    }

    // ── Invariant laws ──

    #[test]
    fn empty_program_is_neutral() {
        let ev = run("1 2 [] i .");
        assert_eq!(ev.stack, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn shuffle_laws() {
        assert_eq!(run("7 dup pop .").stack, vec![Value::Int(7)]);
        assert_eq!(
            run("1 2 swap swap .").stack,
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_eq!(run("5 dup swap .").stack, run("5 dup .").stack);
    }

    #[test]
    fn uncons_cons_round_trip() {
        assert_eq!(run("[1 2 3] uncons cons .").stack, run("[1 2 3] .").stack);
        assert_eq!(
            run("\"abc\" uncons cons .").stack,
            vec![Value::string("abc")]
        );
    }

    #[test]
    fn quotation_round_trip() {
        assert_eq!(run("[2 3 +] i .").stack, run("2 3 + .").stack);
    }

    #[test]
    fn set_algebra_laws() {
        assert_eq!(run("{1 2 3} {2 3 4} and .").stack, run("{2 3} .").stack);
        assert_eq!(run("{1 2} {1 2} xor .").stack, vec![Value::Set(0)]);
        assert_eq!(run("{1 5} not not .").stack, run("{1 5} .").stack);
        let ev = run("{1 2 3} {2 3 4} or .");
        assert_eq!(top(&ev), &Value::Set(0b11110));
    }

    #[test]
    fn fold_sums() {
        let ev = run("[1 2 3 4] 0 [+] fold .");
        assert_eq!(top(&ev), &Value::Int(10));
    }

    #[test]
    fn map_preserves_kind() {
        assert_eq!(run("{1 2 3} [succ] map .").stack, vec![Value::Set(0b11100)]);
        assert_eq!(
            run("\"abc\" [succ chr] map .").stack,
            vec![Value::string("bcd")]
        );
    }

    #[test]
    fn name_intern_round_trip() {
        let ev = run("[dup] first name intern [dup] first = .");
        assert_eq!(top(&ev), &Value::Bool(true));
    }

    #[test]
    fn reverse_reverse_identity() {
        assert_eq!(run("[1 2 3] reverse reverse .").stack, run("[1 2 3] .").stack);
        assert_eq!(run("\"joy\" reverse reverse .").stack, run("\"joy\" .").stack);
        assert_eq!(run("\"abc\" reverse .").stack, vec![Value::string("cba")]);
    }

    #[test]
    fn cleave_first_rest_cons() {
        assert_eq!(
            run("[1 2 3] [first] [rest] cleave cons .").stack,
            run("[1 2 3] .").stack
        );
    }

    // ── Combinators ──

    #[test]
    fn branch_chooses() {
        assert_eq!(run("true [1] [2] branch .").stack, vec![Value::Int(1)]);
        assert_eq!(run("false [1] [2] branch .").stack, vec![Value::Int(2)]);
    }

    #[test]
    fn while_computes_gcd() {
        let ev = run("48 36 [0 >] [dup rollup rem] while pop .");
        assert_eq!(ev.stack, vec![Value::Int(12)]);
    }

    #[test]
    fn times_repeats() {
        assert_eq!(run("0 5 [1 +] times .").stack, vec![Value::Int(5)]);
        assert_eq!(run("0 -3 [1 +] times .").stack, vec![Value::Int(0)]);
    }

    #[test]
    fn step_walks_elements() {
        assert_eq!(run("0 \"abc\" [ord +] step .").stack, vec![Value::Int(294)]);
        // set elements arrive in ascending order
        assert_eq!(
            run("[] {5 1 3} [swons] step .").stack,
            vec![int_list(&[5, 3, 1])]
        );
    }

    #[test]
    fn dip_works_under_the_top() {
        let ev = run("1 2 3 [+] dip .");
        assert_eq!(ev.stack, vec![Value::Int(3), Value::Int(3)]);
    }

    #[test]
    fn filter_and_split() {
        assert_eq!(
            run("[1 2 3 4 5] [2 rem 0 =] filter .").stack,
            vec![int_list(&[2, 4])]
        );
        let ev = run("[1 2 3 4 5] [2 rem 0 =] split .");
        assert_eq!(
            ev.stack,
            vec![int_list(&[2, 4]), int_list(&[1, 3, 5])]
        );
    }

    #[test]
    fn some_and_all() {
        assert_eq!(run("[1 2 3] [2 >] some .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("[1 2 3] [5 >] some .").stack, vec![Value::Bool(false)]);
        assert_eq!(run("[1 2 3] [0 >] all .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("[1 2 3] [1 >] all .").stack, vec![Value::Bool(false)]);
    }

    #[test]
    fn arity_combinators() {
        assert_eq!(
            run("1 2 [+] nullary .").stack,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        assert_eq!(run("1 2 [+] binary .").stack, vec![Value::Int(3)]);
        assert_eq!(run("9 [dup *] unary .").stack, vec![Value::Int(81)]);
        assert_eq!(
            run("10 1 2 [3 +] unary2 .").stack,
            vec![Value::Int(10), Value::Int(4), Value::Int(5)]
        );
    }

    #[test]
    fn infra_runs_on_a_list() {
        assert_eq!(run("[1 2 3] [+] infra .").stack, vec![int_list(&[3, 3])]);
        // the ambient stack below is untouched
        let ev = run("9 [1 2] [pop] infra .");
        assert_eq!(ev.stack, vec![Value::Int(9), int_list(&[2])]);
    }

    #[test]
    fn genrec_factorial() {
        let ev = run("5 [null] [succ] [dup pred] [i *] genrec .");
        assert_eq!(top(&ev), &Value::Int(120));
    }

    #[test]
    fn binrec_fibonacci() {
        let ev = run("10 [small] [] [pred dup pred] [+] binrec .");
        assert_eq!(top(&ev), &Value::Int(55));
    }

    #[test]
    fn tailrec_is_bounded() {
        let ev = run("100000 [null] [] [pred] tailrec .");
        assert_eq!(ev.stack, vec![Value::Int(0)]);
    }

    #[test]
    fn condlinrec_factorial() {
        let ev = run("5 [ [[null] [pop 1]] [[dup pred] [*]] ] condlinrec .");
        assert_eq!(top(&ev), &Value::Int(120));
    }

    #[test]
    fn cond_picks_first_true_clause() {
        let ev = run("3 [ [[0 <] \"neg\"] [[0 >] \"pos\"] [\"zero\"] ] cond .");
        assert_eq!(top(&ev), &Value::string("pos"));
        let ev = run("0 [ [[0 <] \"neg\"] [[0 >] \"pos\"] [\"zero\"] ] cond .");
        assert_eq!(top(&ev), &Value::string("zero"));
    }

    #[test]
    fn x_runs_without_consuming() {
        let ev = run("[pop 42] x .");
        assert_eq!(ev.stack, vec![Value::Int(42)]);
    }

    #[test]
    fn type_conditionals_keep_the_value() {
        let ev = run("3 [1] [2] ifinteger .");
        assert_eq!(ev.stack, vec![Value::Int(3), Value::Int(1)]);
        let ev = run("'a [1] [2] ifinteger .");
        assert_eq!(ev.stack, vec![Value::Char('a'), Value::Int(2)]);
    }

    // ── Deep recursion through user words ──

    #[test]
    fn tail_recursive_user_word_runs_in_constant_space() {
        let ev = run("DEFINE countdown == [0 =] [] [pred countdown] ifte . 200000 countdown .");
        assert_eq!(ev.stack, vec![Value::Int(0)]);
    }

    #[test]
    fn non_tail_user_recursion_uses_the_continuation_stack() {
        let ev = run("DEFINE sumto == [null] [] [dup pred sumto +] ifte . 10000 sumto .");
        assert_eq!(ev.stack, vec![Value::Int(50005000)]);
    }

    // ── Definitions and the environment ──

    #[test]
    fn definitions_install_and_replace() {
        assert_eq!(run("DEFINE sq == dup * . 7 sq .").stack, vec![Value::Int(49)]);
        assert_eq!(
            run("DEFINE f == 1 . DEFINE f == 2 . f .").stack,
            vec![Value::Int(2)]
        );
    }

    #[test]
    fn hide_blocks_define_both_sections() {
        let ev = run("HIDE double == 2 * IN quad == double double END 3 quad .");
        assert_eq!(ev.stack, vec![Value::Int(12)]);
    }

    #[test]
    fn undefined_symbols_respect_the_flag() {
        assert!(matches!(run_err("nosuchword ."), JoyError::Undefined(w) if w == "nosuchword"));
        let ev = run("0 setundeferror . nosuchword 42 .");
        assert_eq!(ev.stack, vec![Value::Int(42)]);
    }

    #[test]
    fn body_and_user_introspection() {
        let ev = run("DEFINE sq == dup * . [sq] first body size .");
        assert_eq!(top(&ev), &Value::Int(2));
        assert_eq!(
            run("DEFINE sq == dup * . [sq] first user .").stack,
            vec![Value::Bool(true)]
        );
        assert_eq!(run("[dup] first user .").stack, vec![Value::Bool(false)]);
    }

    // ── Errors ──

    #[test]
    fn error_kinds() {
        assert!(matches!(run_err("pop ."), JoyError::StackUnderflow { op: "pop", .. }));
        assert!(matches!(run_err("1 0 / ."), JoyError::Domain { op: "/", .. }));
        assert!(matches!(run_err("[] first ."), JoyError::Domain { op: "first", .. }));
        assert!(matches!(run_err("1 [2] + ."), JoyError::Type { op: "+", .. }));
        assert!(matches!(run_err("abort ."), JoyError::Abort));
        assert!(matches!(run_err("quit ."), JoyError::Quit(0)));
        assert!(matches!(run_err("3 quit ."), JoyError::Quit(3)));
    }

    #[test]
    fn failed_preconditions_leave_the_stack_unchanged() {
        let mut ev = Evaluator::new();
        ev.env.autoput = 0;
        let err = ev.run_source("1 [2] + .", "test").unwrap_err();
        assert!(matches!(err, JoyError::Type { .. }));
        assert_eq!(ev.stack, vec![Value::Int(1), int_list(&[2])]);
    }

    #[test]
    fn errors_abort_the_phrase_but_not_definitions() {
        let mut ev = Evaluator::new();
        ev.env.autoput = 0;
        assert!(ev.run_source("DEFINE sq == dup * . 1 0 / .", "test").is_err());
        // the definition survives for the next phrase
        ev.run_source("3 sq .", "test").unwrap();
        assert_eq!(ev.stack, vec![Value::Int(9)]);
    }

    // ── Arithmetic and comparison semantics ──

    #[test]
    fn integer_division_floors() {
        assert_eq!(run("7 2 / .").stack, vec![Value::Int(3)]);
        assert_eq!(run("-7 2 / .").stack, vec![Value::Int(-4)]);
        assert_eq!(run("7 2 rem .").stack, vec![Value::Int(1)]);
        assert_eq!(run("17 5 div .").stack, vec![Value::Int(3), Value::Int(2)]);
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        assert_eq!(run("1 2.5 + .").stack, vec![Value::Float(3.5)]);
        assert_eq!(run("2 3 + .").stack, vec![Value::Int(5)]);
    }

    #[test]
    fn char_arithmetic_coerces() {
        assert_eq!(run("'A succ .").stack, vec![Value::Int(66)]);
        assert_eq!(run("'A ord .").stack, vec![Value::Int(65)]);
        assert_eq!(run("65 chr .").stack, vec![Value::Char('A')]);
    }

    #[test]
    fn relational_polymorphism() {
        assert_eq!(run("'a 'b < .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("\"abc\" \"abd\" < .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("3 2.5 > .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("[1 2] [1 3] compare .").stack, vec![Value::Int(-1)]);
        assert_eq!(run("[1 [2 3]] [1 [2 3]] equal .").stack, vec![Value::Bool(true)]);
    }

    // ── Aggregates ──

    #[test]
    fn indexing_and_slicing() {
        assert_eq!(run("[10 20 30] 1 at .").stack, vec![Value::Int(20)]);
        assert_eq!(run("1 [10 20 30] of .").stack, vec![Value::Int(20)]);
        assert_eq!(run("[1 2 3 4] 2 drop .").stack, vec![int_list(&[3, 4])]);
        assert_eq!(run("[1 2 3 4] 2 take .").stack, vec![int_list(&[1, 2])]);
        assert!(matches!(
            run_err("[1 2] 5 at ."),
            JoyError::Domain { op: "at", .. }
        ));
    }

    #[test]
    fn swons_and_enconcat() {
        assert_eq!(run("[2 3] 1 swons .").stack, vec![int_list(&[1, 2, 3])]);
        assert_eq!(
            run("5 [1 2] [3 4] enconcat .").stack,
            vec![int_list(&[1, 2, 5, 3, 4])]
        );
        assert_eq!(
            run("\"foo\" \"bar\" concat .").stack,
            vec![Value::string("foobar")]
        );
    }

    #[test]
    fn membership() {
        assert_eq!(run("{1 3} 3 has .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("2 [1 2 3] in .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("9 [1 2 3] in .").stack, vec![Value::Bool(false)]);
    }

    #[test]
    fn set_operations() {
        assert_eq!(run("{3 5} first .").stack, vec![Value::Int(3)]);
        assert_eq!(run("{3 5} rest .").stack, vec![Value::Set(1 << 5)]);
        assert_eq!(run("setsize .").stack, vec![Value::Int(64)]);
        assert!(matches!(
            run_err("64 {} cons ."),
            JoyError::Domain { op: "cons", .. }
        ));
    }

    #[test]
    fn null_and_small_cover_numbers() {
        assert_eq!(run("0 null .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("1 small .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("[] null .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("\"ab\" small .").stack, vec![Value::Bool(false)]);
    }

    // ── stack / unstack / conts ──

    #[test]
    fn stack_lists_top_first() {
        let ev = run("1 2 3 stack first .");
        assert_eq!(top(&ev), &Value::Int(3));
    }

    #[test]
    fn unstack_installs_a_list() {
        let ev = run("[1 2] unstack .");
        assert_eq!(ev.stack, vec![Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn conts_yields_a_list_without_corrupting_state() {
        let ev = run("1 conts pop 2 .");
        assert_eq!(ev.stack, vec![Value::Int(1), Value::Int(2)]);
        let ev = run("conts .");
        assert!(matches!(top(&ev), Value::List(_)));
    }

    // ── Conversions, flags, misc ──

    #[test]
    fn number_formatting() {
        assert_eq!(run("255 'X 0 0 format .").stack, vec![Value::string("FF")]);
        assert_eq!(run("42 'd 5 0 format .").stack, vec![Value::string("   42")]);
        assert_eq!(run("-42 'd 0 4 format .").stack, vec![Value::string("-0042")]);
        assert_eq!(
            run("2.5 'f 0 2 formatf .").stack,
            vec![Value::string("2.50")]
        );
    }

    #[test]
    fn string_to_number() {
        assert_eq!(run("\"ff\" 16 strtol .").stack, vec![Value::Int(255)]);
        assert_eq!(run("\"-12\" 10 strtol .").stack, vec![Value::Int(-12)]);
        assert_eq!(run("\"2.5\" strtod .").stack, vec![Value::Float(2.5)]);
        assert!(matches!(
            run_err("\"xyz\" 10 strtol ."),
            JoyError::Domain { .. }
        ));
    }

    #[test]
    fn flag_readers() {
        // the test harness runs with autoput 0
        assert_eq!(run("autoput .").stack, vec![Value::Int(0)]);
        assert_eq!(run("undeferror .").stack, vec![Value::Int(1)]);
        assert_eq!(run("echo .").stack, vec![Value::Int(0)]);
    }

    #[test]
    fn random_generator_is_seedable() {
        assert_eq!(run("0 srand rand .").stack, vec![Value::Int(12345)]);
        let ev = run("7 srand rand 7 srand rand = .");
        assert_eq!(top(&ev), &Value::Bool(true));
    }

    #[test]
    fn gmtime_decomposes_the_epoch() {
        let ev = run("0 gmtime .");
        assert_eq!(
            top(&ev),
            &Value::list(vec![
                Value::Int(1970),
                Value::Int(1),
                Value::Int(1),
                Value::Int(0),
                Value::Int(0),
                Value::Int(0),
                Value::Bool(false),
                Value::Int(0),
                Value::Int(4),
            ])
        );
    }

    #[test]
    fn mktime_round_trips() {
        let ev = run("[2000 2 29 12 30 15] mktime gmtime first .");
        assert_eq!(top(&ev), &Value::Int(2000));
        let ev = run("[1970 1 2 0 0 0] mktime .");
        assert_eq!(top(&ev), &Value::Int(86400));
    }

    #[test]
    fn strftime_formats() {
        let ev = run("[1970 1 1 0 0 0] \"%Y-%m-%d %a\" strftime .");
        assert_eq!(top(&ev), &Value::string("1970-01-01 Thu"));
    }

    #[test]
    fn choice_and_sametype() {
        assert_eq!(run("true 1 2 choice .").stack, vec![Value::Int(1)]);
        assert_eq!(run("false 1 2 choice .").stack, vec![Value::Int(2)]);
        assert_eq!(run("1 2 sametype .").stack, vec![Value::Bool(true)]);
        assert_eq!(run("1 'a sametype .").stack, vec![Value::Bool(false)]);
    }

    #[test]
    fn getenv_of_unset_variable_is_empty() {
        let ev = run("\"RJOY_SURELY_UNSET_VAR\" getenv .");
        assert_eq!(top(&ev), &Value::string(""));
    }

    #[test]
    fn argv_reflects_arguments() {
        let mut ev = Evaluator::new();
        ev.env.autoput = 0;
        ev.args = vec!["rjoy".into(), "demo.joy".into()];
        ev.run_source("argc argv .", "test").unwrap();
        assert_eq!(
            ev.stack,
            vec![
                Value::Int(2),
                Value::list(vec![Value::string("rjoy"), Value::string("demo.joy")])
            ]
        );
    }
}
