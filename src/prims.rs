///! The primitive library.
///!
///! Every primitive is a plain function on the evaluator; the table at the
///! bottom binds names to functions and declares the minimum arity, which
///! `run` checks centrally before dispatch. A primitive whose preconditions
///! fail leaves the stack unchanged: `run` snapshots and restores it on
///! error for every non-combinator word (combinators may have already run
///! user code by the time an error surfaces, so their partial effects
///! stand and the error propagates unchanged).
///!
///! Binary numeric operations accept mixed integer/float and promote to
///! float when either side is a float; chars and booleans coerce to small
///! integers. Sequence operations are keyed on the aggregate kind
///! (list, string, set) with exhaustive matches.

use std::cmp::Ordering;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::env::{Definition, Env};
use crate::error::{JoyError, Result};
use crate::eval::Evaluator;
use crate::parser;
use crate::printer;
use crate::symbol::SymbolTable;
use crate::value::{numeric_of, FileHandle, Numeric, Value, SETSIZE, SET_MASK};

pub struct Prim {
    pub name: &'static str,
    pub arity: usize,
    pub combinator: bool,
    pub run: fn(&mut Evaluator) -> Result<()>,
}

/// Install every primitive into the environment.
pub fn register(env: &mut Env, syms: &mut SymbolTable) {
    for (id, prim) in TABLE.iter().enumerate() {
        let sym = syms.intern(prim.name);
        env.define_primitive(sym, id as u16);
    }
}

/// Dispatch a primitive: arity precheck, then the body. Non-combinators
/// get their operands restored when the body reports an error.
pub fn run(ev: &mut Evaluator, id: u16) -> Result<()> {
    let prim = &TABLE[id as usize];
    if ev.stack.len() < prim.arity {
        return Err(JoyError::StackUnderflow {
            op: prim.name,
            needed: prim.arity,
            depth: ev.stack.len(),
        });
    }
    if prim.combinator {
        (prim.run)(ev)
    } else {
        let save = ev.stack.clone();
        let result = (prim.run)(ev);
        if result.is_err() {
            ev.stack = save;
        }
        result
    }
}

// ── Aggregate helpers ──

/// The members of an aggregate, in element order (sets ascending).
pub fn elements_of(v: &Value, op: &'static str) -> Result<Vec<Value>> {
    match v {
        Value::List(l) => Ok(l.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(Value::Char).collect()),
        Value::Set(bits) => Ok((0..SETSIZE)
            .filter(|i| bits & (1u64 << i) != 0)
            .map(Value::Int)
            .collect()),
        other => Err(JoyError::Type {
            op,
            expected: "aggregate",
            actual: other.kind().to_string(),
        }),
    }
}

/// Rebuild an aggregate of the same kind as `model` from `items`.
pub fn aggregate_like(model: &Value, items: Vec<Value>, op: &'static str) -> Result<Value> {
    match model {
        Value::List(_) => Ok(Value::list(items)),
        Value::Str(_) => {
            let mut s = String::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Char(c) => s.push(c),
                    other => {
                        return Err(JoyError::Type {
                            op,
                            expected: "char elements for a string",
                            actual: other.kind().to_string(),
                        })
                    }
                }
            }
            Ok(Value::string(s))
        }
        Value::Set(_) => {
            let mut bits = 0u64;
            for item in items {
                match item {
                    Value::Int(i) if (0..SETSIZE).contains(&i) => bits |= 1u64 << i,
                    Value::Int(i) => {
                        return Err(JoyError::Domain {
                            op,
                            msg: format!("set member {i} out of range [0, {}]", SETSIZE - 1),
                        })
                    }
                    other => {
                        return Err(JoyError::Type {
                            op,
                            expected: "integer elements for a set",
                            actual: other.kind().to_string(),
                        })
                    }
                }
            }
            Ok(Value::Set(bits))
        }
        other => Err(JoyError::Type {
            op,
            expected: "aggregate",
            actual: other.kind().to_string(),
        }),
    }
}

fn empty_err(op: &'static str) -> JoyError {
    JoyError::Domain {
        op,
        msg: "empty aggregate".into(),
    }
}

fn domain(op: &'static str, msg: impl Into<String>) -> JoyError {
    JoyError::Domain {
        op,
        msg: msg.into(),
    }
}

fn file_err(op: &'static str, msg: impl Into<String>) -> JoyError {
    JoyError::File {
        op,
        msg: msg.into(),
    }
}

// ── Stack shuffling ──

fn id(_ev: &mut Evaluator) -> Result<()> {
    Ok(())
}

fn dup(ev: &mut Evaluator) -> Result<()> {
    let top = ev.stack.last().unwrap().clone();
    ev.push(top);
    Ok(())
}

fn swap(ev: &mut Evaluator) -> Result<()> {
    let len = ev.stack.len();
    ev.stack.swap(len - 1, len - 2);
    Ok(())
}

fn pop_top(ev: &mut Evaluator) -> Result<()> {
    ev.pop("pop")?;
    Ok(())
}

fn popd(ev: &mut Evaluator) -> Result<()> {
    let y = ev.pop("popd")?;
    ev.pop("popd")?;
    ev.push(y);
    Ok(())
}

fn dupd(ev: &mut Evaluator) -> Result<()> {
    let y = ev.pop("dupd")?;
    let x = ev.pop("dupd")?;
    ev.push(x.clone());
    ev.push(x);
    ev.push(y);
    Ok(())
}

fn swapd(ev: &mut Evaluator) -> Result<()> {
    let z = ev.pop("swapd")?;
    let y = ev.pop("swapd")?;
    let x = ev.pop("swapd")?;
    ev.push(y);
    ev.push(x);
    ev.push(z);
    Ok(())
}

fn rollup(ev: &mut Evaluator) -> Result<()> {
    // X Y Z -> Z X Y
    let z = ev.pop("rollup")?;
    let y = ev.pop("rollup")?;
    let x = ev.pop("rollup")?;
    ev.push(z);
    ev.push(x);
    ev.push(y);
    Ok(())
}

fn rolldown(ev: &mut Evaluator) -> Result<()> {
    // X Y Z -> Y Z X
    let z = ev.pop("rolldown")?;
    let y = ev.pop("rolldown")?;
    let x = ev.pop("rolldown")?;
    ev.push(y);
    ev.push(z);
    ev.push(x);
    Ok(())
}

fn rotate(ev: &mut Evaluator) -> Result<()> {
    // X Y Z -> Z Y X
    let z = ev.pop("rotate")?;
    let y = ev.pop("rotate")?;
    let x = ev.pop("rotate")?;
    ev.push(z);
    ev.push(y);
    ev.push(x);
    Ok(())
}

/// The `…d` variants: set the top aside, run the base shuffler, restore.
fn dipped(ev: &mut Evaluator, op: &'static str, base: fn(&mut Evaluator) -> Result<()>) -> Result<()> {
    let top = ev.pop(op)?;
    base(ev)?;
    ev.push(top);
    Ok(())
}

fn rollupd(ev: &mut Evaluator) -> Result<()> {
    dipped(ev, "rollupd", rollup)
}

fn rolldownd(ev: &mut Evaluator) -> Result<()> {
    dipped(ev, "rolldownd", rolldown)
}

fn rotated(ev: &mut Evaluator) -> Result<()> {
    dipped(ev, "rotated", rotate)
}

fn over(ev: &mut Evaluator) -> Result<()> {
    let second = ev.stack[ev.stack.len() - 2].clone();
    ev.push(second);
    Ok(())
}

fn dup2(ev: &mut Evaluator) -> Result<()> {
    let len = ev.stack.len();
    let x = ev.stack[len - 2].clone();
    let y = ev.stack[len - 1].clone();
    ev.push(x);
    ev.push(y);
    Ok(())
}

fn stack_word(ev: &mut Evaluator) -> Result<()> {
    // first element of the list is the top of the stack
    let items: Vec<Value> = ev.stack.iter().rev().cloned().collect();
    ev.push(Value::list(items));
    Ok(())
}

fn unstack(ev: &mut Evaluator) -> Result<()> {
    let l = ev.pop_quot("unstack")?;
    ev.stack = l.iter().rev().cloned().collect();
    Ok(())
}

fn choice(ev: &mut Evaluator) -> Result<()> {
    let f = ev.pop("choice")?;
    let t = ev.pop("choice")?;
    let b = ev.pop("choice")?;
    ev.push(if b.is_truthy() { t } else { f });
    Ok(())
}

// ── Arithmetic ──

fn num2(ev: &mut Evaluator, op: &'static str) -> Result<(Numeric, Numeric)> {
    let b = ev.pop_num(op)?;
    let a = ev.pop_num(op)?;
    Ok((a, b))
}

fn arith2(
    ev: &mut Evaluator,
    op: &'static str,
    fi: fn(i64, i64) -> i64,
    ff: fn(f64, f64) -> f64,
) -> Result<()> {
    let (a, b) = num2(ev, op)?;
    let v = match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => Value::Int(fi(x, y)),
        _ => Value::Float(ff(a.as_f64(), b.as_f64())),
    };
    ev.push(v);
    Ok(())
}

/// Quotient rounded toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Remainder matching floor division (sign follows the divisor).
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn add(ev: &mut Evaluator) -> Result<()> {
    arith2(ev, "+", i64::wrapping_add, |x, y| x + y)
}

fn sub(ev: &mut Evaluator) -> Result<()> {
    arith2(ev, "-", i64::wrapping_sub, |x, y| x - y)
}

fn mul(ev: &mut Evaluator) -> Result<()> {
    arith2(ev, "*", i64::wrapping_mul, |x, y| x * y)
}

fn div_slash(ev: &mut Evaluator) -> Result<()> {
    let (a, b) = num2(ev, "/")?;
    match (a, b) {
        (_, Numeric::Int(0)) => Err(domain("/", "division by zero")),
        (Numeric::Int(x), Numeric::Int(y)) => {
            ev.push(Value::Int(floor_div(x, y)));
            Ok(())
        }
        _ => {
            let y = b.as_f64();
            if y == 0.0 {
                return Err(domain("/", "division by zero"));
            }
            ev.push(Value::Float(a.as_f64() / y));
            Ok(())
        }
    }
}

fn rem(ev: &mut Evaluator) -> Result<()> {
    let (a, b) = num2(ev, "rem")?;
    match (a, b) {
        (_, Numeric::Int(0)) => Err(domain("rem", "division by zero")),
        (Numeric::Int(x), Numeric::Int(y)) => {
            ev.push(Value::Int(floor_mod(x, y)));
            Ok(())
        }
        _ => {
            let y = b.as_f64();
            if y == 0.0 {
                return Err(domain("rem", "division by zero"));
            }
            let x = a.as_f64();
            ev.push(Value::Float(x - (x / y).floor() * y));
            Ok(())
        }
    }
}

fn divmod(ev: &mut Evaluator) -> Result<()> {
    // N1 N2 -> Q R
    let (a, b) = num2(ev, "div")?;
    match (a, b) {
        (_, Numeric::Int(0)) => Err(domain("div", "division by zero")),
        (Numeric::Int(x), Numeric::Int(y)) => {
            ev.push(Value::Int(floor_div(x, y)));
            ev.push(Value::Int(floor_mod(x, y)));
            Ok(())
        }
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            if y == 0.0 {
                return Err(domain("div", "division by zero"));
            }
            let q = (x / y).floor();
            ev.push(Value::Float(q));
            ev.push(Value::Float(x - q * y));
            Ok(())
        }
    }
}

fn sign(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop_num("sign")?;
    let s = match a {
        Numeric::Int(i) => i.signum(),
        Numeric::Float(f) => {
            if f > 0.0 {
                1
            } else if f < 0.0 {
                -1
            } else {
                0
            }
        }
    };
    ev.push(Value::Int(s));
    Ok(())
}

fn neg(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop_num("neg")?;
    ev.push(match a {
        Numeric::Int(i) => Value::Int(i.wrapping_neg()),
        Numeric::Float(f) => Value::Float(-f),
    });
    Ok(())
}

fn abs(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop_num("abs")?;
    ev.push(match a {
        Numeric::Int(i) => Value::Int(i.wrapping_abs()),
        Numeric::Float(f) => Value::Float(f.abs()),
    });
    Ok(())
}

fn pred(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop_num("pred")?;
    ev.push(match a {
        Numeric::Int(i) => Value::Int(i.wrapping_sub(1)),
        Numeric::Float(f) => Value::Float(f - 1.0),
    });
    Ok(())
}

fn succ(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop_num("succ")?;
    ev.push(match a {
        Numeric::Int(i) => Value::Int(i.wrapping_add(1)),
        Numeric::Float(f) => Value::Float(f + 1.0),
    });
    Ok(())
}

fn max(ev: &mut Evaluator) -> Result<()> {
    arith2(ev, "max", i64::max, f64::max)
}

fn min(ev: &mut Evaluator) -> Result<()> {
    arith2(ev, "min", i64::min, f64::min)
}

// ── Float math ──

fn float1(ev: &mut Evaluator, op: &'static str, f: fn(f64) -> f64) -> Result<()> {
    let a = ev.pop_num(op)?;
    ev.push(Value::Float(f(a.as_f64())));
    Ok(())
}

fn float2(ev: &mut Evaluator, op: &'static str, f: fn(f64, f64) -> f64) -> Result<()> {
    let (a, b) = num2(ev, op)?;
    ev.push(Value::Float(f(a.as_f64(), b.as_f64())));
    Ok(())
}

fn sin(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "sin", f64::sin)
}
fn cos(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "cos", f64::cos)
}
fn tan(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "tan", f64::tan)
}
fn asin(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "asin", f64::asin)
}
fn acos(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "acos", f64::acos)
}
fn atan(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "atan", f64::atan)
}
fn atan2(ev: &mut Evaluator) -> Result<()> {
    float2(ev, "atan2", f64::atan2)
}
fn exp(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "exp", f64::exp)
}
fn log(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "log", f64::ln)
}
fn log10(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "log10", f64::log10)
}
fn pow(ev: &mut Evaluator) -> Result<()> {
    float2(ev, "pow", f64::powf)
}
fn sqrt(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "sqrt", f64::sqrt)
}
fn sinh(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "sinh", f64::sinh)
}
fn cosh(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "cosh", f64::cosh)
}
fn tanh(ev: &mut Evaluator) -> Result<()> {
    float1(ev, "tanh", f64::tanh)
}

fn floor(ev: &mut Evaluator) -> Result<()> {
    round_like(ev, "floor", f64::floor)
}

fn ceil(ev: &mut Evaluator) -> Result<()> {
    round_like(ev, "ceil", f64::ceil)
}

fn trunc(ev: &mut Evaluator) -> Result<()> {
    round_like(ev, "trunc", f64::trunc)
}

/// floor/ceil/trunc are the identity on integers.
fn round_like(ev: &mut Evaluator, op: &'static str, f: fn(f64) -> f64) -> Result<()> {
    let a = ev.pop_num(op)?;
    ev.push(match a {
        Numeric::Int(i) => Value::Int(i),
        Numeric::Float(x) => Value::Float(f(x)),
    });
    Ok(())
}

fn frexp(ev: &mut Evaluator) -> Result<()> {
    let f = ev.pop_num("frexp")?.as_f64();
    if f == 0.0 || !f.is_finite() {
        ev.push(Value::Float(f));
        ev.push(Value::Int(0));
        return Ok(());
    }
    let mut m = f;
    let mut e: i64 = 0;
    while m.abs() >= 1.0 {
        m /= 2.0;
        e += 1;
    }
    while m.abs() < 0.5 {
        m *= 2.0;
        e -= 1;
    }
    ev.push(Value::Float(m));
    ev.push(Value::Int(e));
    Ok(())
}

fn ldexp(ev: &mut Evaluator) -> Result<()> {
    let e = ev.pop_int("ldexp")?;
    let f = ev.pop_num("ldexp")?.as_f64();
    ev.push(Value::Float(f * 2f64.powi(e as i32)));
    Ok(())
}

fn modf(ev: &mut Evaluator) -> Result<()> {
    // F -> G H with G the fractional and H the integral part
    let f = ev.pop_num("modf")?.as_f64();
    ev.push(Value::Float(f.fract()));
    ev.push(Value::Float(f.trunc()));
    Ok(())
}

// ── Characters ──

fn ord(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("ord")?;
    match v {
        Value::Char(c) => ev.push(Value::Int(c as i64)),
        Value::Int(i) => ev.push(Value::Int(i)),
        Value::Bool(b) => ev.push(Value::Int(b as i64)),
        other => return Err(ev.type_err("ord", "char", &other)),
    }
    Ok(())
}

fn chr(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("chr")?;
    let code = match v {
        Value::Int(i) => i,
        Value::Char(c) => c as i64,
        Value::Bool(b) => b as i64,
        other => return Err(ev.type_err("chr", "integer", &other)),
    };
    if !(0..=255).contains(&code) {
        return Err(domain("chr", format!("code point {code} out of range [0, 255]")));
    }
    ev.push(Value::Char(code as u8 as char));
    Ok(())
}

// ── Comparison ──

fn compare_values(ev: &Evaluator, a: &Value, b: &Value, op: &'static str) -> Result<Ordering> {
    if a.is_numeric() && b.is_numeric() {
        return match (numeric_of(a), numeric_of(b)) {
            (Numeric::Int(x), Numeric::Int(y)) => Ok(x.cmp(&y)),
            (x, y) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .ok_or_else(|| domain(op, "comparison with nan")),
        };
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Symbol(x), Value::Symbol(y)) => Ok(ev.syms.name(*x).cmp(ev.syms.name(*y))),
        (Value::List(x), Value::List(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare_values(ev, xi, yi, op)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        (Value::Set(x), Value::Set(y)) => {
            // ascending member sequences, lexicographically
            for i in 0..SETSIZE {
                let (mx, my) = (x & (1u64 << i) != 0, y & (1u64 << i) != 0);
                match (mx, my) {
                    (true, false) => return Ok(Ordering::Less),
                    (false, true) => return Ok(Ordering::Greater),
                    _ => continue,
                }
            }
            Ok(Ordering::Equal)
        }
        _ => Err(JoyError::Type {
            op,
            expected: "comparable operands",
            actual: format!("{} vs {}", a.kind(), b.kind()),
        }),
    }
}

fn relational(ev: &mut Evaluator, op: &'static str, test: fn(Ordering) -> bool) -> Result<()> {
    let b = ev.pop(op)?;
    let a = ev.pop(op)?;
    let ord = compare_values(ev, &a, &b, op)?;
    ev.push(Value::Bool(test(ord)));
    Ok(())
}

fn lt(ev: &mut Evaluator) -> Result<()> {
    relational(ev, "<", |o| o == Ordering::Less)
}
fn le(ev: &mut Evaluator) -> Result<()> {
    relational(ev, "<=", |o| o != Ordering::Greater)
}
fn gt(ev: &mut Evaluator) -> Result<()> {
    relational(ev, ">", |o| o == Ordering::Greater)
}
fn ge(ev: &mut Evaluator) -> Result<()> {
    relational(ev, ">=", |o| o != Ordering::Less)
}

fn eq(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("=")?;
    let a = ev.pop("=")?;
    ev.push(Value::Bool(a == b));
    Ok(())
}

fn ne(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("!=")?;
    let a = ev.pop("!=")?;
    ev.push(Value::Bool(a != b));
    Ok(())
}

fn equal(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("equal")?;
    let a = ev.pop("equal")?;
    ev.push(Value::Bool(a == b));
    Ok(())
}

fn compare(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("compare")?;
    let a = ev.pop("compare")?;
    let ord = compare_values(ev, &a, &b, "compare")?;
    ev.push(Value::Int(match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }));
    Ok(())
}

// ── Logic (booleans) and set algebra share the names ──

fn and_(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("and")?;
    let a = ev.pop("and")?;
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => ev.push(Value::Bool(x && y)),
        (Value::Set(x), Value::Set(y)) => ev.push(Value::Set(x & y)),
        (a, _) => return Err(ev.type_err("and", "booleans or sets", &a)),
    }
    Ok(())
}

fn or_(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("or")?;
    let a = ev.pop("or")?;
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => ev.push(Value::Bool(x || y)),
        (Value::Set(x), Value::Set(y)) => ev.push(Value::Set(x | y)),
        (a, _) => return Err(ev.type_err("or", "booleans or sets", &a)),
    }
    Ok(())
}

fn xor(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("xor")?;
    let a = ev.pop("xor")?;
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => ev.push(Value::Bool(x != y)),
        (Value::Set(x), Value::Set(y)) => ev.push(Value::Set(x ^ y)),
        (a, _) => return Err(ev.type_err("xor", "booleans or sets", &a)),
    }
    Ok(())
}

fn not_(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("not")?;
    match a {
        Value::Bool(x) => ev.push(Value::Bool(!x)),
        Value::Set(x) => ev.push(Value::Set(!x & SET_MASK)),
        a => return Err(ev.type_err("not", "boolean or set", &a)),
    }
    Ok(())
}

// ── Aggregates ──

fn cons_value(ev: &Evaluator, op: &'static str, x: Value, a: Value) -> Result<Value> {
    match a {
        Value::List(l) => {
            let mut items = Vec::with_capacity(l.len() + 1);
            items.push(x);
            items.extend(l.iter().cloned());
            Ok(Value::list(items))
        }
        Value::Str(s) => match x {
            Value::Char(c) => {
                let mut t = String::with_capacity(s.len() + 1);
                t.push(c);
                t.push_str(&s);
                Ok(Value::string(t))
            }
            other => Err(ev.type_err(op, "char to cons onto a string", &other)),
        },
        Value::Set(bits) => match x {
            Value::Int(i) if (0..SETSIZE).contains(&i) => Ok(Value::Set(bits | (1u64 << i))),
            Value::Int(i) => Err(domain(
                op,
                format!("set member {i} out of range [0, {}]", SETSIZE - 1),
            )),
            other => Err(ev.type_err(op, "integer to cons into a set", &other)),
        },
        other => Err(ev.type_err(op, "aggregate", &other)),
    }
}

fn cons(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("cons")?;
    let x = ev.pop("cons")?;
    let v = cons_value(ev, "cons", x, a)?;
    ev.push(v);
    Ok(())
}

fn swons(ev: &mut Evaluator) -> Result<()> {
    let x = ev.pop("swons")?;
    let a = ev.pop("swons")?;
    let v = cons_value(ev, "swons", x, a)?;
    ev.push(v);
    Ok(())
}

fn first_of(v: &Value, op: &'static str) -> Result<Value> {
    match v {
        Value::List(l) => l.first().cloned().ok_or_else(|| empty_err(op)),
        Value::Str(s) => s.chars().next().map(Value::Char).ok_or_else(|| empty_err(op)),
        Value::Set(bits) => {
            if *bits == 0 {
                Err(empty_err(op))
            } else {
                Ok(Value::Int(bits.trailing_zeros() as i64))
            }
        }
        other => Err(JoyError::Type {
            op,
            expected: "aggregate",
            actual: other.kind().to_string(),
        }),
    }
}

fn rest_of(v: &Value, op: &'static str) -> Result<Value> {
    match v {
        Value::List(l) => {
            if l.is_empty() {
                Err(empty_err(op))
            } else {
                Ok(Value::list(l[1..].to_vec()))
            }
        }
        Value::Str(s) => {
            let mut chars = s.chars();
            if chars.next().is_none() {
                Err(empty_err(op))
            } else {
                Ok(Value::string(chars.as_str().to_string()))
            }
        }
        Value::Set(bits) => {
            if *bits == 0 {
                Err(empty_err(op))
            } else {
                Ok(Value::Set(bits & (bits - 1)))
            }
        }
        other => Err(JoyError::Type {
            op,
            expected: "aggregate",
            actual: other.kind().to_string(),
        }),
    }
}

fn first(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("first")?;
    let v = first_of(&a, "first")?;
    ev.push(v);
    Ok(())
}

fn rest(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("rest")?;
    let v = rest_of(&a, "rest")?;
    ev.push(v);
    Ok(())
}

fn uncons(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("uncons")?;
    let f = first_of(&a, "uncons")?;
    let r = rest_of(&a, "uncons")?;
    ev.push(f);
    ev.push(r);
    Ok(())
}

fn unswons(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("unswons")?;
    let f = first_of(&a, "unswons")?;
    let r = rest_of(&a, "unswons")?;
    ev.push(r);
    ev.push(f);
    Ok(())
}

fn concat_values(op: &'static str, a: Value, b: Value) -> Result<Value> {
    match (a, b) {
        (Value::List(x), Value::List(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::list(items))
        }
        (Value::Str(x), Value::Str(y)) => {
            let mut s = x.as_ref().clone();
            s.push_str(&y);
            Ok(Value::string(s))
        }
        (Value::Set(x), Value::Set(y)) => Ok(Value::Set(x | y)),
        (a, b) => Err(JoyError::Type {
            op,
            expected: "two aggregates of the same kind",
            actual: format!("{} vs {}", a.kind(), b.kind()),
        }),
    }
}

fn concat(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("concat")?;
    let a = ev.pop("concat")?;
    let v = concat_values("concat", a, b)?;
    ev.push(v);
    Ok(())
}

fn enconcat(ev: &mut Evaluator) -> Result<()> {
    // X S T -> S ++ [X] ++ T
    let t = ev.pop("enconcat")?;
    let s = ev.pop("enconcat")?;
    let x = ev.pop("enconcat")?;
    let xt = cons_value(ev, "enconcat", x, t)?;
    let v = concat_values("enconcat", s, xt)?;
    ev.push(v);
    Ok(())
}

fn size(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("size")?;
    let n = match &a {
        Value::List(l) => l.len() as i64,
        Value::Str(s) => s.chars().count() as i64,
        Value::Set(bits) => bits.count_ones() as i64,
        other => return Err(ev.type_err("size", "aggregate", other)),
    };
    ev.push(Value::Int(n));
    Ok(())
}

fn null(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("null")?;
    let empty = match &a {
        Value::List(l) => l.is_empty(),
        Value::Str(s) => s.is_empty(),
        Value::Set(bits) => *bits == 0,
        Value::Int(i) => *i == 0,
        Value::Float(f) => *f == 0.0,
        other => return Err(ev.type_err("null", "aggregate or number", other)),
    };
    ev.push(Value::Bool(empty));
    Ok(())
}

fn small(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("small")?;
    let small = match &a {
        Value::List(l) => l.len() <= 1,
        Value::Str(s) => s.chars().count() <= 1,
        Value::Set(bits) => bits.count_ones() <= 1,
        Value::Int(i) => (0..=1).contains(i),
        Value::Float(f) => *f == 0.0 || *f == 1.0,
        other => return Err(ev.type_err("small", "aggregate or number", other)),
    };
    ev.push(Value::Bool(small));
    Ok(())
}

fn index_into(a: &Value, idx: i64, op: &'static str) -> Result<Value> {
    let items = elements_of(a, op)?;
    if idx < 0 || idx as usize >= items.len() {
        return Err(domain(op, format!("index {idx} out of bounds")));
    }
    Ok(items[idx as usize].clone())
}

fn at(ev: &mut Evaluator) -> Result<()> {
    // A I -> X
    let i = ev.pop_int("at")?;
    let a = ev.pop("at")?;
    let v = index_into(&a, i, "at")?;
    ev.push(v);
    Ok(())
}

fn of(ev: &mut Evaluator) -> Result<()> {
    // I A -> X
    let a = ev.pop("of")?;
    let i = ev.pop_int("of")?;
    let v = index_into(&a, i, "of")?;
    ev.push(v);
    Ok(())
}

fn drop_(ev: &mut Evaluator) -> Result<()> {
    let n = ev.pop_int("drop")?;
    let a = ev.pop("drop")?;
    let items = elements_of(&a, "drop")?;
    let n = (n.max(0) as usize).min(items.len());
    let v = aggregate_like(&a, items[n..].to_vec(), "drop")?;
    ev.push(v);
    Ok(())
}

fn take(ev: &mut Evaluator) -> Result<()> {
    let n = ev.pop_int("take")?;
    let a = ev.pop("take")?;
    let mut items = elements_of(&a, "take")?;
    items.truncate(n.max(0) as usize);
    let v = aggregate_like(&a, items, "take")?;
    ev.push(v);
    Ok(())
}

fn reverse(ev: &mut Evaluator) -> Result<()> {
    let a = ev.pop("reverse")?;
    let mut items = elements_of(&a, "reverse")?;
    items.reverse();
    let v = aggregate_like(&a, items, "reverse")?;
    ev.push(v);
    Ok(())
}

fn has(ev: &mut Evaluator) -> Result<()> {
    // A X -> B
    let x = ev.pop("has")?;
    let a = ev.pop("has")?;
    let found = elements_of(&a, "has")?.contains(&x);
    ev.push(Value::Bool(found));
    Ok(())
}

fn in_(ev: &mut Evaluator) -> Result<()> {
    // X A -> B
    let a = ev.pop("in")?;
    let x = ev.pop("in")?;
    let found = elements_of(&a, "in")?.contains(&x);
    ev.push(Value::Bool(found));
    Ok(())
}

fn powerlist(ev: &mut Evaluator) -> Result<()> {
    fn subsets(items: &[Value]) -> Vec<Vec<Value>> {
        match items.split_first() {
            None => vec![Vec::new()],
            Some((x, rest)) => {
                let tail = subsets(rest);
                let mut out = Vec::with_capacity(tail.len() * 2);
                for s in &tail {
                    let mut with_x = Vec::with_capacity(s.len() + 1);
                    with_x.push(x.clone());
                    with_x.extend(s.iter().cloned());
                    out.push(with_x);
                }
                out.extend(tail);
                out
            }
        }
    }
    let a = ev.pop("powerlist")?;
    let items = elements_of(&a, "powerlist")?;
    let mut out = Vec::new();
    for subset in subsets(&items) {
        out.push(aggregate_like(&a, subset, "powerlist")?);
    }
    ev.push(Value::list(out));
    Ok(())
}

// ── Type predicates ──

fn predicate(ev: &mut Evaluator, op: &'static str, test: fn(&Value) -> bool) -> Result<()> {
    let x = ev.pop(op)?;
    ev.push(Value::Bool(test(&x)));
    Ok(())
}

fn is_integer(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "integer", |v| matches!(v, Value::Int(_)))
}
fn is_char(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "char", |v| matches!(v, Value::Char(_)))
}
fn is_logical(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "logical", |v| matches!(v, Value::Bool(_)))
}
fn is_set(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "set", |v| matches!(v, Value::Set(_)))
}
fn is_string(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "string", |v| matches!(v, Value::Str(_)))
}
fn is_list(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "list", |v| matches!(v, Value::List(_)))
}
fn is_float(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "float", |v| matches!(v, Value::Float(_)))
}
fn is_file(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "file", |v| matches!(v, Value::File(_)))
}
fn is_leaf(ev: &mut Evaluator) -> Result<()> {
    predicate(ev, "leaf", |v| !matches!(v, Value::List(_)))
}

fn is_user(ev: &mut Evaluator) -> Result<()> {
    let x = ev.pop("user")?;
    let result = match x {
        Value::Symbol(sym) => ev.env.is_user(sym),
        _ => false,
    };
    ev.push(Value::Bool(result));
    Ok(())
}

fn sametype(ev: &mut Evaluator) -> Result<()> {
    let b = ev.pop("sametype")?;
    let a = ev.pop("sametype")?;
    ev.push(Value::Bool(
        std::mem::discriminant(&a) == std::mem::discriminant(&b),
    ));
    Ok(())
}

// ── Type conditionals: X [T] [F] -> ... with X left on the stack ──

fn type_cond(ev: &mut Evaluator, op: &'static str, test: fn(&Value) -> bool) -> Result<()> {
    let f = ev.pop_quot(op)?;
    let t = ev.pop_quot(op)?;
    let x = ev.pop(op)?;
    let taken = test(&x);
    ev.push(x);
    ev.enter_program(if taken { t } else { f });
    Ok(())
}

fn ifinteger(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "ifinteger", |v| matches!(v, Value::Int(_)))
}
fn ifchar(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "ifchar", |v| matches!(v, Value::Char(_)))
}
fn iflogical(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "iflogical", |v| matches!(v, Value::Bool(_)))
}
fn ifset(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "ifset", |v| matches!(v, Value::Set(_)))
}
fn ifstring(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "ifstring", |v| matches!(v, Value::Str(_)))
}
fn iflist(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "iflist", |v| matches!(v, Value::List(_)))
}
fn iffloat(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "iffloat", |v| matches!(v, Value::Float(_)))
}
fn iffile(ev: &mut Evaluator) -> Result<()> {
    type_cond(ev, "iffile", |v| matches!(v, Value::File(_)))
}

// ── Symbol introspection ──

fn name(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("name")?;
    match v {
        Value::Symbol(sym) => {
            let s = ev.syms.name(sym).to_string();
            ev.push(Value::string(s));
            Ok(())
        }
        other => Err(ev.type_err("name", "symbol", &other)),
    }
}

fn intern(ev: &mut Evaluator) -> Result<()> {
    let s = ev.pop_string("intern")?;
    let sym = ev.syms.intern(&s);
    ev.push(Value::Symbol(sym));
    Ok(())
}

fn body(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("body")?;
    match v {
        Value::Symbol(sym) => match ev.env.lookup(sym) {
            Some(Definition::User(b)) => {
                let b = b.clone();
                ev.push(Value::List(b));
                Ok(())
            }
            _ if ev.env.is_primitive(sym) => {
                Err(domain("body", "primitive has no quotation body"))
            }
            _ => Err(domain("body", "not a user-defined symbol")),
        },
        other => Err(ev.type_err("body", "symbol", &other)),
    }
}

// ── Console I/O ──

fn put(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("put")?;
    print!("{}", printer::print_val(&v, &ev.syms));
    let _ = io::stdout().flush();
    Ok(())
}

fn putch(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("putch")?;
    let c = match v {
        Value::Char(c) => c,
        Value::Int(i) if (0..=255).contains(&i) => i as u8 as char,
        Value::Int(i) => return Err(domain("putch", format!("code point {i} out of range"))),
        other => return Err(ev.type_err("putch", "char or integer", &other)),
    };
    print!("{c}");
    let _ = io::stdout().flush();
    Ok(())
}

fn putchars(ev: &mut Evaluator) -> Result<()> {
    let s = ev.pop_string("putchars")?;
    print!("{s}");
    let _ = io::stdout().flush();
    Ok(())
}

fn newline(_ev: &mut Evaluator) -> Result<()> {
    println!();
    let _ = io::stdout().flush();
    Ok(())
}

fn get(ev: &mut Evaluator) -> Result<()> {
    loop {
        if let Some(v) = ev.pending_input.pop_front() {
            ev.push(v);
            return Ok(());
        }
        let mut line = String::new();
        let n = io::stdin()
            .read_line(&mut line)
            .map_err(|e| file_err("get", e.to_string()))?;
        if n == 0 {
            ev.stdin_eof = true;
            return Err(file_err("get", "end of input"));
        }
        let terms = parser::parse_factors(&line, "stdin", &mut ev.syms)?;
        ev.pending_input.extend(terms);
    }
}

// ── File primitives ──

fn write_to(h: &FileHandle, op: &'static str, bytes: &[u8]) -> Result<()> {
    match h {
        FileHandle::Stdin => Err(file_err(op, "stdin is not writable")),
        FileHandle::Stdout => {
            let mut out = io::stdout();
            out.write_all(bytes)
                .and_then(|_| out.flush())
                .map_err(|e| file_err(op, e.to_string()))
        }
        FileHandle::Stderr => {
            let mut err = io::stderr();
            err.write_all(bytes)
                .and_then(|_| err.flush())
                .map_err(|e| file_err(op, e.to_string()))
        }
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st.file.as_mut().ok_or_else(|| file_err(op, "use of closed file"))?;
            match file.write_all(bytes) {
                Ok(()) => Ok(()),
                Err(e) => {
                    st.err = true;
                    Err(file_err(op, e.to_string()))
                }
            }
        }
    }
}

/// Read up to `n` bytes. Sets the handle's eof flag on short reads from a
/// real file; stdin end is tracked on the evaluator.
fn read_from(ev: &mut Evaluator, h: &FileHandle, op: &'static str, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let got = match h {
        FileHandle::Stdin => io::stdin()
            .read(&mut buf)
            .map_err(|e| file_err(op, e.to_string()))?,
        FileHandle::Stdout | FileHandle::Stderr => {
            return Err(file_err(op, "stream is not readable"))
        }
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st.file.as_mut().ok_or_else(|| file_err(op, "use of closed file"))?;
            match file.read(&mut buf) {
                Ok(got) => {
                    if got == 0 && n > 0 {
                        st.eof = true;
                    }
                    got
                }
                Err(e) => {
                    st.err = true;
                    return Err(file_err(op, e.to_string()));
                }
            }
        }
    };
    if matches!(h, FileHandle::Stdin) && got == 0 && n > 0 {
        ev.stdin_eof = true;
    }
    buf.truncate(got);
    Ok(buf)
}

fn fopen(ev: &mut Evaluator) -> Result<()> {
    let mode = ev.pop_string("fopen")?;
    let path = ev.pop_string("fopen")?;
    let mut opts = std::fs::OpenOptions::new();
    match mode.trim_end_matches('b') {
        "r" => opts.read(true),
        "r+" => opts.read(true).write(true),
        "w" => opts.write(true).create(true).truncate(true),
        "w+" => opts.read(true).write(true).create(true).truncate(true),
        "a" => opts.append(true).create(true),
        "a+" => opts.read(true).append(true).create(true),
        other => return Err(domain("fopen", format!("bad mode \"{other}\""))),
    };
    let file = opts
        .open(path.as_str())
        .map_err(|e| file_err("fopen", format!("{path}: {e}")))?;
    ev.push(Value::File(FileHandle::open(file)));
    Ok(())
}

fn fclose(ev: &mut Evaluator) -> Result<()> {
    let h = ev.pop_file("fclose")?;
    if let FileHandle::Handle(rc) = h {
        rc.borrow_mut().file = None;
    }
    Ok(())
}

fn fread(ev: &mut Evaluator) -> Result<()> {
    // S N -> S L
    let n = ev.pop_int("fread")?;
    let h = ev.pop_file("fread")?;
    if n < 0 {
        return Err(domain("fread", "negative count"));
    }
    let bytes = read_from(ev, &h, "fread", n as usize)?;
    ev.push(Value::File(h));
    ev.push(Value::list(
        bytes.into_iter().map(|b| Value::Int(b as i64)).collect(),
    ));
    Ok(())
}

fn fwrite(ev: &mut Evaluator) -> Result<()> {
    // S L -> S
    let l = ev.pop_quot("fwrite")?;
    let h = ev.pop_file("fwrite")?;
    let mut bytes = Vec::with_capacity(l.len());
    for v in l.iter() {
        match v {
            Value::Int(i) if (0..=255).contains(i) => bytes.push(*i as u8),
            Value::Int(i) => return Err(domain("fwrite", format!("byte {i} out of range"))),
            other => return Err(ev.type_err("fwrite", "list of byte integers", other)),
        }
    }
    write_to(&h, "fwrite", &bytes)?;
    ev.push(Value::File(h));
    Ok(())
}

fn fgets(ev: &mut Evaluator) -> Result<()> {
    // S -> S "line"
    let h = ev.pop_file("fgets")?;
    let mut line = String::new();
    match &h {
        FileHandle::Stdin => {
            let n = io::stdin()
                .read_line(&mut line)
                .map_err(|e| file_err("fgets", e.to_string()))?;
            if n == 0 {
                ev.stdin_eof = true;
            }
        }
        FileHandle::Stdout | FileHandle::Stderr => {
            return Err(file_err("fgets", "stream is not readable"))
        }
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st
                .file
                .as_mut()
                .ok_or_else(|| file_err("fgets", "use of closed file"))?;
            let mut byte = [0u8; 1];
            loop {
                match file.read(&mut byte) {
                    Ok(0) => {
                        st.eof = true;
                        break;
                    }
                    Ok(_) => {
                        line.push(byte[0] as char);
                        if byte[0] == b'\n' {
                            break;
                        }
                    }
                    Err(e) => {
                        st.err = true;
                        return Err(file_err("fgets", e.to_string()));
                    }
                }
            }
        }
    }
    ev.push(Value::File(h));
    ev.push(Value::string(line));
    Ok(())
}

fn fgetch(ev: &mut Evaluator) -> Result<()> {
    // S -> S C; '\0' with the eof flag set at end of input
    let h = ev.pop_file("fgetch")?;
    let bytes = read_from(ev, &h, "fgetch", 1)?;
    let c = bytes.first().map_or('\0', |b| *b as char);
    ev.push(Value::File(h));
    ev.push(Value::Char(c));
    Ok(())
}

fn fput(ev: &mut Evaluator) -> Result<()> {
    // S X -> S
    let x = ev.pop("fput")?;
    let h = ev.pop_file("fput")?;
    let text = printer::print_val(&x, &ev.syms);
    write_to(&h, "fput", text.as_bytes())?;
    ev.push(Value::File(h));
    Ok(())
}

fn fputch(ev: &mut Evaluator) -> Result<()> {
    let v = ev.pop("fputch")?;
    let h = ev.pop_file("fputch")?;
    let c = match v {
        Value::Char(c) => c,
        Value::Int(i) if (0..=255).contains(&i) => i as u8 as char,
        other => return Err(ev.type_err("fputch", "char or integer", &other)),
    };
    write_to(&h, "fputch", c.to_string().as_bytes())?;
    ev.push(Value::File(h));
    Ok(())
}

fn fputchars(ev: &mut Evaluator) -> Result<()> {
    let s = ev.pop_string("fputchars")?;
    let h = ev.pop_file("fputchars")?;
    write_to(&h, "fputchars", s.as_bytes())?;
    ev.push(Value::File(h));
    Ok(())
}

fn fseek(ev: &mut Evaluator) -> Result<()> {
    // S P W -> S
    let whence = ev.pop_int("fseek")?;
    let offset = ev.pop_int("fseek")?;
    let h = ev.pop_file("fseek")?;
    let from = match whence {
        0 => SeekFrom::Start(offset.max(0) as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        w => return Err(domain("fseek", format!("bad whence {w}"))),
    };
    match &h {
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st
                .file
                .as_mut()
                .ok_or_else(|| file_err("fseek", "use of closed file"))?;
            file.seek(from).map_err(|e| file_err("fseek", e.to_string()))?;
            st.eof = false;
        }
        _ => return Err(file_err("fseek", "stream is not seekable")),
    }
    ev.push(Value::File(h));
    Ok(())
}

fn ftell(ev: &mut Evaluator) -> Result<()> {
    // S -> S I
    let h = ev.pop_file("ftell")?;
    let pos = match &h {
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st
                .file
                .as_mut()
                .ok_or_else(|| file_err("ftell", "use of closed file"))?;
            file.stream_position()
                .map_err(|e| file_err("ftell", e.to_string()))? as i64
        }
        _ => return Err(file_err("ftell", "stream is not seekable")),
    };
    ev.push(Value::File(h));
    ev.push(Value::Int(pos));
    Ok(())
}

fn fflush(ev: &mut Evaluator) -> Result<()> {
    let h = ev.pop_file("fflush")?;
    match &h {
        FileHandle::Stdout => {
            let _ = io::stdout().flush();
        }
        FileHandle::Stderr => {
            let _ = io::stderr().flush();
        }
        FileHandle::Stdin => {}
        FileHandle::Handle(rc) => {
            let mut st = rc.borrow_mut();
            let file = st
                .file
                .as_mut()
                .ok_or_else(|| file_err("fflush", "use of closed file"))?;
            file.flush().map_err(|e| file_err("fflush", e.to_string()))?;
        }
    }
    ev.push(Value::File(h));
    Ok(())
}

fn feof(ev: &mut Evaluator) -> Result<()> {
    let h = ev.pop_file("feof")?;
    let eof = match &h {
        FileHandle::Stdin => ev.stdin_eof,
        FileHandle::Stdout | FileHandle::Stderr => false,
        FileHandle::Handle(rc) => rc.borrow().eof,
    };
    ev.push(Value::File(h));
    ev.push(Value::Bool(eof));
    Ok(())
}

fn ferror(ev: &mut Evaluator) -> Result<()> {
    let h = ev.pop_file("ferror")?;
    let err = match &h {
        FileHandle::Handle(rc) => rc.borrow().err,
        _ => false,
    };
    ev.push(Value::File(h));
    ev.push(Value::Bool(err));
    Ok(())
}

fn fremove(ev: &mut Evaluator) -> Result<()> {
    let path = ev.pop_string("fremove")?;
    ev.push(Value::Bool(std::fs::remove_file(path.as_str()).is_ok()));
    Ok(())
}

fn frename(ev: &mut Evaluator) -> Result<()> {
    let to = ev.pop_string("frename")?;
    let from = ev.pop_string("frename")?;
    ev.push(Value::Bool(
        std::fs::rename(from.as_str(), to.as_str()).is_ok(),
    ));
    Ok(())
}

// ── Time ──

fn clock(ev: &mut Evaluator) -> Result<()> {
    let t = ev.elapsed_micros();
    ev.push(Value::Int(t));
    Ok(())
}

fn time(ev: &mut Evaluator) -> Result<()> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    ev.push(Value::Int(secs));
    Ok(())
}

/// Days since the epoch for a civil date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Civil date for days since the epoch.
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Decompose epoch seconds into the 9-element time list:
/// [year month day hour minute second is-dst yearday weekday].
fn broken_down(t: i64) -> Vec<Value> {
    let days = t.div_euclid(86400);
    let sod = t.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    let yday = days - days_from_civil(y, 1, 1);
    let wday = (days + 4).rem_euclid(7); // the epoch was a Thursday
    vec![
        Value::Int(y),
        Value::Int(m),
        Value::Int(d),
        Value::Int(sod / 3600),
        Value::Int(sod % 3600 / 60),
        Value::Int(sod % 60),
        Value::Bool(false),
        Value::Int(yday),
        Value::Int(wday),
    ]
}

fn localtime(ev: &mut Evaluator) -> Result<()> {
    // no timezone database: local time is UTC
    let t = ev.pop_num("localtime")?.as_f64() as i64;
    ev.push(Value::list(broken_down(t)));
    Ok(())
}

fn gmtime(ev: &mut Evaluator) -> Result<()> {
    let t = ev.pop_num("gmtime")?.as_f64() as i64;
    ev.push(Value::list(broken_down(t)));
    Ok(())
}

fn time_fields(ev: &Evaluator, l: &[Value], op: &'static str) -> Result<(i64, i64, i64, i64, i64, i64)> {
    if l.len() < 6 {
        return Err(domain(op, "time list needs at least 6 fields"));
    }
    let mut out = [0i64; 6];
    for (i, slot) in out.iter_mut().enumerate() {
        match &l[i] {
            Value::Int(v) => *slot = *v,
            other => return Err(ev.type_err(op, "integer time field", other)),
        }
    }
    Ok((out[0], out[1], out[2], out[3], out[4], out[5]))
}

fn mktime(ev: &mut Evaluator) -> Result<()> {
    let l = ev.pop_quot("mktime")?;
    let (y, m, d, h, mi, s) = time_fields(ev, &l, "mktime")?;
    let t = days_from_civil(y, m, d) * 86400 + h * 3600 + mi * 60 + s;
    ev.push(Value::Int(t));
    Ok(())
}

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];
const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn strftime(ev: &mut Evaluator) -> Result<()> {
    // T S1 -> S2
    let fmt = ev.pop_string("strftime")?;
    let l = ev.pop_quot("strftime")?;
    let (y, m, d, h, mi, s) = time_fields(ev, &l, "strftime")?;
    let days = days_from_civil(y, m, d);
    let wday = (days + 4).rem_euclid(7) as usize;
    let yday = days - days_from_civil(y, 1, 1);
    let month = ((m - 1).clamp(0, 11)) as usize;

    let mut out = String::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => out.push('%'),
            Some('%') => out.push('%'),
            Some('Y') => out.push_str(&y.to_string()),
            Some('y') => out.push_str(&format!("{:02}", y.rem_euclid(100))),
            Some('m') => out.push_str(&format!("{m:02}")),
            Some('d') => out.push_str(&format!("{d:02}")),
            Some('H') => out.push_str(&format!("{h:02}")),
            Some('M') => out.push_str(&format!("{mi:02}")),
            Some('S') => out.push_str(&format!("{s:02}")),
            Some('j') => out.push_str(&format!("{:03}", yday + 1)),
            Some('w') => out.push_str(&wday.to_string()),
            Some('a') => out.push_str(&WEEKDAYS[wday][..3]),
            Some('A') => out.push_str(WEEKDAYS[wday]),
            Some('b') => out.push_str(&MONTHS[month][..3]),
            Some('B') => out.push_str(MONTHS[month]),
            Some('p') => out.push_str(if h < 12 { "AM" } else { "PM" }),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
        }
    }
    ev.push(Value::string(out));
    Ok(())
}

// ── Random numbers: the classic C linear congruential generator ──

fn rand_(ev: &mut Evaluator) -> Result<()> {
    ev.rand_state = ev
        .rand_state
        .wrapping_mul(1103515245)
        .wrapping_add(12345)
        & 0x7FFF_FFFF;
    ev.push(Value::Int(ev.rand_state as i64));
    Ok(())
}

fn srand(ev: &mut Evaluator) -> Result<()> {
    let seed = ev.pop_int("srand")?;
    ev.rand_state = (seed as u64) & 0x7FFF_FFFF;
    Ok(())
}

// ── Conversions ──

fn strtol(ev: &mut Evaluator) -> Result<()> {
    let base = ev.pop_int("strtol")?;
    let s = ev.pop_string("strtol")?;
    if !(2..=36).contains(&base) {
        return Err(domain("strtol", format!("bad base {base}")));
    }
    let n = i64::from_str_radix(s.trim(), base as u32)
        .map_err(|_| domain("strtol", format!("cannot parse \"{s}\" in base {base}")))?;
    ev.push(Value::Int(n));
    Ok(())
}

fn strtod(ev: &mut Evaluator) -> Result<()> {
    let s = ev.pop_string("strtod")?;
    let f: f64 = s
        .trim()
        .parse()
        .map_err(|_| domain("strtod", format!("cannot parse \"{s}\"")))?;
    ev.push(Value::Float(f));
    Ok(())
}

fn format(ev: &mut Evaluator) -> Result<()> {
    // N C I J -> S: mode char, field width, minimum digits
    let prec = ev.pop_int("format")?.max(0) as usize;
    let width = ev.pop_int("format")?.max(0) as usize;
    let mode = match ev.pop("format")? {
        Value::Char(c) => c,
        other => return Err(ev.type_err("format", "mode char", &other)),
    };
    let n = match ev.pop_num("format")? {
        Numeric::Int(i) => i,
        Numeric::Float(f) => f as i64,
    };
    let mag = n.unsigned_abs();
    let mut digits = match mode {
        'd' | 'i' => mag.to_string(),
        'o' => std::format!("{mag:o}"),
        'x' => std::format!("{mag:x}"),
        'X' => std::format!("{mag:X}"),
        other => return Err(domain("format", std::format!("bad mode '{other}'"))),
    };
    while digits.len() < prec {
        digits.insert(0, '0');
    }
    let mut s = if n < 0 && matches!(mode, 'd' | 'i') {
        std::format!("-{digits}")
    } else {
        digits
    };
    while s.len() < width {
        s.insert(0, ' ');
    }
    ev.push(Value::string(s));
    Ok(())
}

fn formatf(ev: &mut Evaluator) -> Result<()> {
    // F C I J -> S
    let prec = ev.pop_int("formatf")?.max(0) as usize;
    let width = ev.pop_int("formatf")?.max(0) as usize;
    let mode = match ev.pop("formatf")? {
        Value::Char(c) => c,
        other => return Err(ev.type_err("formatf", "mode char", &other)),
    };
    let f = ev.pop_num("formatf")?.as_f64();
    let mut s = match mode {
        'f' => std::format!("{f:.prec$}"),
        'e' => std::format!("{f:.prec$e}"),
        'g' => printer::format_float(f),
        other => return Err(domain("formatf", std::format!("bad mode '{other}'"))),
    };
    while s.len() < width {
        s.insert(0, ' ');
    }
    ev.push(Value::string(s));
    Ok(())
}

// ── Flags ──

fn setautoput(ev: &mut Evaluator) -> Result<()> {
    ev.env.autoput = ev.pop_int("setautoput")?;
    Ok(())
}

fn setundeferror(ev: &mut Evaluator) -> Result<()> {
    ev.env.undeferror = ev.pop_int("setundeferror")?;
    Ok(())
}

fn setecho(ev: &mut Evaluator) -> Result<()> {
    ev.env.echo = ev.pop_int("setecho")?;
    Ok(())
}

fn autoput(ev: &mut Evaluator) -> Result<()> {
    ev.push(Value::Int(ev.env.autoput));
    Ok(())
}

fn undeferror(ev: &mut Evaluator) -> Result<()> {
    ev.push(Value::Int(ev.env.undeferror));
    Ok(())
}

fn echo(ev: &mut Evaluator) -> Result<()> {
    ev.push(Value::Int(ev.env.echo));
    Ok(())
}

// ── Process ──

fn system(ev: &mut Evaluator) -> Result<()> {
    let cmd = ev.pop_string("system")?;
    std::process::Command::new("sh")
        .arg("-c")
        .arg(cmd.as_str())
        .status()
        .map_err(|e| file_err("system", e.to_string()))?;
    Ok(())
}

fn getenv(ev: &mut Evaluator) -> Result<()> {
    let name = ev.pop_string("getenv")?;
    let value = std::env::var(name.as_str()).unwrap_or_default();
    ev.push(Value::string(value));
    Ok(())
}

fn argv(ev: &mut Evaluator) -> Result<()> {
    let args: Vec<Value> = ev.args.iter().map(|a| Value::string(a.clone())).collect();
    ev.push(Value::list(args));
    Ok(())
}

fn argc(ev: &mut Evaluator) -> Result<()> {
    ev.push(Value::Int(ev.args.len() as i64));
    Ok(())
}

fn include(ev: &mut Evaluator) -> Result<()> {
    let path = ev.pop_string("include")?;
    let source = std::fs::read_to_string(path.as_str())
        .map_err(|e| file_err("include", std::format!("{path}: {e}")))?;
    ev.run_source(&source, &path)
}

fn abort(_ev: &mut Evaluator) -> Result<()> {
    Err(JoyError::Abort)
}

fn quit(ev: &mut Evaluator) -> Result<()> {
    let code = match ev.stack.last() {
        Some(Value::Int(_)) => ev.pop_int("quit")?,
        _ => 0,
    };
    Err(JoyError::Quit(code))
}

// ── Miscellaneous ──

fn setsize(ev: &mut Evaluator) -> Result<()> {
    ev.push(Value::Int(SETSIZE));
    Ok(())
}

fn conts(ev: &mut Evaluator) -> Result<()> {
    let frames = ev.continuations();
    ev.push(Value::list(frames));
    Ok(())
}

// arity-combinator wrappers

fn nullary(ev: &mut Evaluator) -> Result<()> {
    ev.arity_comb("nullary", 0)
}
fn unary(ev: &mut Evaluator) -> Result<()> {
    ev.arity_comb("unary", 1)
}
fn binary(ev: &mut Evaluator) -> Result<()> {
    ev.arity_comb("binary", 2)
}
fn ternary(ev: &mut Evaluator) -> Result<()> {
    ev.arity_comb("ternary", 3)
}
fn unary2(ev: &mut Evaluator) -> Result<()> {
    ev.unary_k("unary2", 2)
}
fn unary3(ev: &mut Evaluator) -> Result<()> {
    ev.unary_k("unary3", 3)
}
fn unary4(ev: &mut Evaluator) -> Result<()> {
    ev.unary_k("unary4", 4)
}

// ── The table ──

const fn p(name: &'static str, arity: usize, run: fn(&mut Evaluator) -> Result<()>) -> Prim {
    Prim {
        name,
        arity,
        combinator: false,
        run,
    }
}

const fn c(name: &'static str, arity: usize, run: fn(&mut Evaluator) -> Result<()>) -> Prim {
    Prim {
        name,
        arity,
        combinator: true,
        run,
    }
}

pub static TABLE: &[Prim] = &[
    // stack shuffling
    p("id", 0, id),
    p("dup", 1, dup),
    p("swap", 2, swap),
    p("pop", 1, pop_top),
    p("popd", 2, popd),
    p("dupd", 2, dupd),
    p("swapd", 3, swapd),
    p("rollup", 3, rollup),
    p("rolldown", 3, rolldown),
    p("rotate", 3, rotate),
    p("rollupd", 4, rollupd),
    p("rolldownd", 4, rolldownd),
    p("rotated", 4, rotated),
    p("over", 2, over),
    p("dup2", 2, dup2),
    p("stack", 0, stack_word),
    p("unstack", 1, unstack),
    p("choice", 3, choice),
    // arithmetic
    p("+", 2, add),
    p("-", 2, sub),
    p("*", 2, mul),
    p("/", 2, div_slash),
    p("rem", 2, rem),
    p("div", 2, divmod),
    p("sign", 1, sign),
    p("neg", 1, neg),
    p("abs", 1, abs),
    p("pred", 1, pred),
    p("succ", 1, succ),
    p("max", 2, max),
    p("min", 2, min),
    // float math
    p("sin", 1, sin),
    p("cos", 1, cos),
    p("tan", 1, tan),
    p("asin", 1, asin),
    p("acos", 1, acos),
    p("atan", 1, atan),
    p("atan2", 2, atan2),
    p("exp", 1, exp),
    p("log", 1, log),
    p("log10", 1, log10),
    p("pow", 2, pow),
    p("sqrt", 1, sqrt),
    p("sinh", 1, sinh),
    p("cosh", 1, cosh),
    p("tanh", 1, tanh),
    p("floor", 1, floor),
    p("ceil", 1, ceil),
    p("trunc", 1, trunc),
    p("frexp", 1, frexp),
    p("ldexp", 2, ldexp),
    p("modf", 1, modf),
    // characters
    p("ord", 1, ord),
    p("chr", 1, chr),
    // comparison
    p("<", 2, lt),
    p("<=", 2, le),
    p(">", 2, gt),
    p(">=", 2, ge),
    p("=", 2, eq),
    p("!=", 2, ne),
    p("equal", 2, equal),
    p("compare", 2, compare),
    // logic and set algebra
    p("and", 2, and_),
    p("or", 2, or_),
    p("xor", 2, xor),
    p("not", 1, not_),
    // aggregates
    p("cons", 2, cons),
    p("swons", 2, swons),
    p("first", 1, first),
    p("rest", 1, rest),
    p("uncons", 1, uncons),
    p("unswons", 1, unswons),
    p("concat", 2, concat),
    p("enconcat", 3, enconcat),
    p("size", 1, size),
    p("null", 1, null),
    p("small", 1, small),
    p("at", 2, at),
    p("of", 2, of),
    p("drop", 2, drop_),
    p("take", 2, take),
    p("reverse", 1, reverse),
    p("has", 2, has),
    p("in", 2, in_),
    p("powerlist", 1, powerlist),
    // type predicates
    p("integer", 1, is_integer),
    p("char", 1, is_char),
    p("logical", 1, is_logical),
    p("set", 1, is_set),
    p("string", 1, is_string),
    p("list", 1, is_list),
    p("float", 1, is_float),
    p("file", 1, is_file),
    p("leaf", 1, is_leaf),
    p("user", 1, is_user),
    p("sametype", 2, sametype),
    // type conditionals
    c("ifinteger", 3, ifinteger),
    c("ifchar", 3, ifchar),
    c("iflogical", 3, iflogical),
    c("ifset", 3, ifset),
    c("ifstring", 3, ifstring),
    c("iflist", 3, iflist),
    c("iffloat", 3, iffloat),
    c("iffile", 3, iffile),
    // symbol introspection
    p("name", 1, name),
    p("intern", 1, intern),
    p("body", 1, body),
    // combinators
    c("i", 1, Evaluator::comb_i),
    c("x", 1, Evaluator::comb_x),
    c("dip", 2, Evaluator::comb_dip),
    c("branch", 3, Evaluator::comb_branch),
    c("ifte", 3, Evaluator::comb_ifte),
    c("cond", 1, Evaluator::comb_cond),
    c("while", 2, Evaluator::comb_while),
    c("step", 2, Evaluator::comb_step),
    c("map", 2, Evaluator::comb_map),
    c("fold", 3, Evaluator::comb_fold),
    c("filter", 2, Evaluator::comb_filter),
    c("split", 2, Evaluator::comb_split),
    c("some", 2, Evaluator::comb_some),
    c("all", 2, Evaluator::comb_all),
    c("times", 2, Evaluator::comb_times),
    c("linrec", 4, Evaluator::comb_linrec),
    c("tailrec", 3, Evaluator::comb_tailrec),
    c("binrec", 4, Evaluator::comb_binrec),
    c("genrec", 4, Evaluator::comb_genrec),
    c("condlinrec", 1, Evaluator::comb_condlinrec),
    c("condnestrec", 1, Evaluator::comb_condnestrec),
    c("primrec", 3, Evaluator::comb_primrec),
    c("nullary", 1, nullary),
    c("unary", 2, unary),
    c("binary", 3, binary),
    c("ternary", 4, ternary),
    c("unary2", 3, unary2),
    c("unary3", 4, unary3),
    c("unary4", 5, unary4),
    c("cleave", 3, Evaluator::comb_cleave),
    c("infra", 2, Evaluator::comb_infra),
    p("conts", 0, conts),
    // console i/o
    p("put", 1, put),
    p("putch", 1, putch),
    p("putchars", 1, putchars),
    p("newline", 0, newline),
    p("get", 0, get),
    // files
    p("fopen", 2, fopen),
    p("fclose", 1, fclose),
    p("fread", 2, fread),
    p("fwrite", 2, fwrite),
    p("fgets", 1, fgets),
    p("fgetch", 1, fgetch),
    p("fput", 2, fput),
    p("fputch", 2, fputch),
    p("fputchars", 2, fputchars),
    p("fputstring", 2, fputchars),
    p("fseek", 3, fseek),
    p("ftell", 1, ftell),
    p("fflush", 1, fflush),
    p("feof", 1, feof),
    p("ferror", 1, ferror),
    p("fremove", 1, fremove),
    p("frename", 2, frename),
    // time
    p("clock", 0, clock),
    p("time", 0, time),
    p("rand", 0, rand_),
    p("srand", 1, srand),
    p("localtime", 1, localtime),
    p("gmtime", 1, gmtime),
    p("mktime", 1, mktime),
    p("strftime", 2, strftime),
    // conversions
    p("strtol", 2, strtol),
    p("strtod", 1, strtod),
    p("format", 4, format),
    p("formatf", 4, formatf),
    // flags
    p("setautoput", 1, setautoput),
    p("setundeferror", 1, setundeferror),
    p("setecho", 1, setecho),
    p("autoput", 0, autoput),
    p("undeferror", 0, undeferror),
    p("echo", 0, echo),
    // process
    p("system", 1, system),
    p("getenv", 1, getenv),
    p("argv", 0, argv),
    p("argc", 0, argc),
    c("include", 1, include),
    p("abort", 0, abort),
    p("quit", 0, quit),
    p("setsize", 0, setsize),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for prim in TABLE {
            assert!(seen.insert(prim.name), "duplicate primitive {}", prim.name);
        }
    }

    #[test]
    fn floor_division_matches_the_original() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_mod(-7, 2), 1);
        assert_eq!(floor_mod(7, -2), -1);
        assert_eq!(floor_mod(-7, -2), -1);
    }

    #[test]
    fn civil_date_round_trip() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        for &days in &[-719468, -1, 0, 1, 365, 11016, 19723, 100000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
        // 2000-02-29 existed, 1900 was not a leap year
        assert_eq!(civil_from_days(days_from_civil(2000, 2, 29)), (2000, 2, 29));
        assert_eq!(civil_from_days(days_from_civil(1900, 3, 1)), (1900, 3, 1));
    }

    #[test]
    fn epoch_weekday_is_thursday() {
        let fields = broken_down(0);
        assert_eq!(fields[8], Value::Int(4));
        assert_eq!(fields[0], Value::Int(1970));
    }
}
