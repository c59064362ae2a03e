//! §6 Expression IR — `ref(path[])`, `val(any)`, `func(name, args[])` with a
//! closed operator set. This is the only expression language the query
//! compiler (§4.9) and indexes (§4.7) understand; it is intentionally not
//! extensible at runtime (a new operator means a new `Func` arm and a
//! recompile), matching the spec's "closed operator set" wording.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A function name from the closed operator set named in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Func {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    And,
    Or,
    Not,
    Like,
}

/// An expression: a column reference, a literal, or an application of a
/// closed-set function to sub-expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Ref(Vec<String>),
    Val(Value),
    Func(Func, Vec<Expr>),
}

impl Expr {
    pub fn ref_path(path: impl IntoIterator<Item = impl Into<String>>) -> Expr {
        Expr::Ref(path.into_iter().map(Into::into).collect())
    }

    pub fn val(v: impl Into<Value>) -> Expr {
        Expr::Val(v.into())
    }

    pub fn eq(a: Expr, b: Expr) -> Expr {
        Expr::Func(Func::Eq, vec![a, b])
    }

    pub fn and(exprs: Vec<Expr>) -> Expr {
        Expr::Func(Func::And, exprs)
    }

    /// Evaluates the expression against a row value. Column references
    /// resolve via [`Value::get_path`] (missing path -> null, per §4.5's
    /// null-handling contract); function application short-circuits `and`/
    /// `or` left-to-right to match SQL's ternary logic closely enough for
    /// this crate's purposes (no three-valued-logic subtleties beyond
    /// null-as-false are modeled — out of scope per spec.md's SQL-compliance
    /// non-goal).
    pub fn eval(&self, row: &Value) -> Value {
        match self {
            Expr::Ref(path) => row.get_path(path),
            Expr::Val(v) => v.clone(),
            Expr::Func(f, args) => eval_func(*f, args, row),
        }
    }
}

fn truthy(v: &Value) -> bool {
    matches!(&v.0, Json::Bool(true))
}

fn eval_func(f: Func, args: &[Expr], row: &Value) -> Value {
    match f {
        Func::Eq => Value::from(args[0].eval(row) == args[1].eval(row)),
        Func::Ne => Value::from(args[0].eval(row) != args[1].eval(row)),
        Func::Gt => Value::from(args[0].eval(row) > args[1].eval(row)),
        Func::Gte => Value::from(args[0].eval(row) >= args[1].eval(row)),
        Func::Lt => Value::from(args[0].eval(row) < args[1].eval(row)),
        Func::Lte => Value::from(args[0].eval(row) <= args[1].eval(row)),
        Func::In => {
            let needle = args[0].eval(row);
            let found = args[1..].iter().any(|a| a.eval(row) == needle);
            Value::from(found)
        }
        Func::And => Value::from(args.iter().all(|a| truthy(&a.eval(row)))),
        Func::Or => Value::from(args.iter().any(|a| truthy(&a.eval(row)))),
        Func::Not => Value::from(!truthy(&args[0].eval(row))),
        Func::Like => {
            let haystack = args[0].eval(row);
            let pattern = args[1].eval(row);
            match (&haystack.0, &pattern.0) {
                (Json::String(h), Json::String(p)) => Value::from(like_match(h, p)),
                _ => Value::from(false),
            }
        }
    }
}

/// SQL `LIKE` with `%` (any run) and `_` (single char) wildcards.
fn like_match(haystack: &str, pattern: &str) -> bool {
    fn go(h: &[u8], p: &[u8]) -> bool {
        match p.first() {
            None => h.is_empty(),
            Some(b'%') => go(h, &p[1..]) || (!h.is_empty() && go(&h[1..], p)),
            Some(b'_') => !h.is_empty() && go(&h[1..], &p[1..]),
            Some(c) => h.first() == Some(c) && go(&h[1..], &p[1..]),
        }
    }
    go(haystack.as_bytes(), pattern.as_bytes())
}

/// Whether a function is one of the monotone comparison/membership
/// operators a [`crate::index`] can evaluate directly (§4.7, §4.9
/// "pushable predicate").
pub fn is_pushable(expr: &Expr) -> bool {
    match expr {
        Expr::Ref(_) | Expr::Val(_) => true,
        Expr::Func(Func::And, args) | Expr::Func(Func::Or, args) => args.iter().all(is_pushable),
        Expr::Func(Func::Eq | Func::Gt | Func::Gte | Func::Lt | Func::Lte | Func::In, args) => {
            // Single-level column ref compared against literals only.
            matches!(args.first(), Some(Expr::Ref(p)) if p.len() == 1)
                && args[1..].iter().all(|a| matches!(a, Expr::Val(_)))
        }
        Expr::Func(Func::Not | Func::Like, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_compares_referenced_column() {
        let row = Value(json!({"status": "open"}));
        let expr = Expr::eq(Expr::ref_path(["status"]), Expr::val("open"));
        assert_eq!(expr.eval(&row), Value::from(true));
    }

    #[test]
    fn and_short_circuits_on_false() {
        let row = Value(json!({"a": 1}));
        let expr = Expr::and(vec![Expr::val(false), Expr::eq(Expr::ref_path(["a"]), Expr::val(1i64))]);
        assert_eq!(expr.eval(&row), Value::from(false));
    }

    #[test]
    fn like_supports_percent_and_underscore() {
        assert!(like_match("hello", "h%o"));
        assert!(like_match("hello", "h_llo"));
        assert!(!like_match("hello", "world"));
    }

    #[test]
    fn pushability_rejects_not_and_accepts_and_of_eq() {
        let pushable = Expr::and(vec![
            Expr::eq(Expr::ref_path(["a"]), Expr::val(1i64)),
            Expr::eq(Expr::ref_path(["b"]), Expr::val(2i64)),
        ]);
        assert!(is_pushable(&pushable));
        let not_pushable = Expr::Func(Func::Not, vec![Expr::val(true)]);
        assert!(!is_pushable(&not_pushable));
    }
}
