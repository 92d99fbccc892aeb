//! The `match` special form.
//!
//! Clauses are tried in order, each in a fresh child environment of the
//! calling one, so bindings from a failed clause never leak into the next.
//!
//! Patterns:
//! - `(quote x)` matches a value equal to `x`
//! - a symbol matches anything and binds it
//! - a list matches element-wise; `&` binds the remaining elements to the
//!   pattern after it
//! - anything else matches an equal value

use crate::env;
use crate::error::{LispError, LispResult};
use crate::eval::Machine;
use crate::printer::print_val;
use crate::structural::value_equals;
use crate::value::{Kind, ObjRef};

impl Machine {
    /// Evaluate the body of the first clause whose pattern accepts `value`
    /// and push its result. `value` must already be rooted.
    pub(crate) fn eval_match(
        &mut self,
        env: ObjRef,
        value: ObjRef,
        clauses: &[ObjRef],
    ) -> LispResult<()> {
        if clauses.len() % 2 != 0 {
            let printed: Vec<_> = clauses.iter().map(|c| print_val(&self.heap, *c)).collect();
            return Err(LispError::syntax(
                "Uneven nr of forms in match: ",
                printed.join(" "),
            ));
        }

        for clause in clauses.chunks(2) {
            let (pattern, body) = (clause[0], clause[1]);
            let clause_env = self.heap.environment(Some(env));
            self.push_root(clause_env);
            if self.match_pattern(clause_env, pattern, value)? {
                self.eval_internal(clause_env, body)?;
                self.pop_root(clause_env);
                return Ok(());
            }
            self.pop_root(clause_env);
        }

        Err(LispError::NoMatch(print_val(&self.heap, value)))
    }

    /// Try one pattern, binding pattern variables into `env`.
    pub fn match_pattern(&mut self, env: ObjRef, pattern: ObjRef, value: ObjRef) -> LispResult<bool> {
        if let Some(quoted) = self.quoted(pattern) {
            return value_equals(&self.heap, quoted, value);
        }
        match self.heap.get(pattern).kind() {
            Kind::Symbol => {
                env::extend(&mut self.heap, env, pattern, value);
                Ok(true)
            }
            Kind::Pair if self.heap.is_pair(value) => self.match_list(env, pattern, value),
            _ => value_equals(&self.heap, pattern, value),
        }
    }

    /// The `x` of a `(quote x)` pattern.
    fn quoted(&self, pattern: ObjRef) -> Option<ObjRef> {
        let head = self.heap.car_of(pattern)?;
        if self.heap.get(head).is_symbol_named("quote") {
            self.heap.nth(pattern, 1)
        } else {
            None
        }
    }

    fn match_list(&mut self, env: ObjRef, pattern: ObjRef, value: ObjRef) -> LispResult<bool> {
        let mut p = Some(pattern);
        let mut v = Some(value);
        while let Some(pat) = p.and_then(|node| self.heap.car_of(node)) {
            if self.heap.get(pat).is_symbol_named("&") {
                if let Some(rest_pattern) = p.and_then(|node| self.heap.nth(node, 1)) {
                    let rest = v.unwrap_or(self.nil());
                    return self.match_pattern(env, rest_pattern, rest);
                }
            }
            let item = match v.and_then(|node| self.heap.car_of(node)) {
                Some(item) => item,
                None => return Ok(false),
            };
            if !self.match_pattern(env, pat, item)? {
                return Ok(false);
            }
            p = p.and_then(|node| self.heap.cdr_of(node));
            v = v.and_then(|node| self.heap.cdr_of(node));
        }
        // The pattern is exhausted; so must the value be.
        Ok(v.and_then(|node| self.heap.car_of(node)).is_none())
    }
}
