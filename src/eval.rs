use std::io::Write;

use log::{debug, trace};

use crate::config::Config;
use crate::env;
use crate::error::{LispError, LispResult};
use crate::ffi::{CallDispatch, LibraryRegistry};
use crate::gc::GcStats;
use crate::globals;
use crate::heap::Heap;
use crate::printer::print_val;
use crate::reader::{self, Reader};
use crate::structural::{is_true, value_copy};
use crate::value::{Closure, Kind, Object, ObjRef};

/// The evaluation machine.
/// All interpreter state lives here so the collector can find the roots.
pub struct Machine {
    pub heap: Heap,
    /// The global environment.
    pub global: ObjRef,
    pub dispatch: Box<dyn CallDispatch>,
    pub config: Config,
    pub stats: GcStats,

    /// Canonical empty list, `true` and `false`. Permanent roots.
    nil: ObjRef,
    lisp_true: ObjRef,
    lisp_false: ObjRef,

    /// Operand stack: every evaluation step leaves its result here.
    stack: Vec<ObjRef>,
    /// Shadow stack of values that must survive a collection while native
    /// frames hold them.
    roots: Vec<ObjRef>,
    /// Printed forms of the calls in progress, outermost first.
    trace: Vec<String>,
    /// Live-object count that triggers the next collection.
    threshold: usize,
    /// Current `eval_internal` nesting.
    depth: usize,
}

#[derive(Clone, Copy, Debug)]
enum SpecialForm {
    Do,
    Let,
    Not,
    Quote,
    While,
    If,
    Match,
    Reset,
    Fn,
    Macro,
    Def,
    IsDefined,
    Ref,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_dispatch(config, Box::new(LibraryRegistry::new()))
    }

    pub fn with_dispatch(config: Config, dispatch: Box<dyn CallDispatch>) -> Self {
        let mut heap = Heap::new();
        let nil = heap.empty_list();
        let lisp_true = heap.symbol("true");
        let lisp_false = heap.symbol("false");
        let global = globals::build_globals(&mut heap, nil, lisp_true, lisp_false);
        let stack_capacity = config.stack_capacity;
        Machine {
            heap,
            global,
            dispatch,
            threshold: config.gc_threshold,
            config,
            stats: GcStats::default(),
            nil,
            lisp_true,
            lisp_false,
            stack: Vec::with_capacity(stack_capacity),
            roots: Vec::with_capacity(stack_capacity),
            trace: Vec::new(),
            depth: 0,
        }
    }

    pub fn nil(&self) -> ObjRef {
        self.nil
    }

    pub fn lisp_true(&self) -> ObjRef {
        self.lisp_true
    }

    pub fn lisp_false(&self) -> ObjRef {
        self.lisp_false
    }

    pub fn bool(&self, b: bool) -> ObjRef {
        if b {
            self.lisp_true
        } else {
            self.lisp_false
        }
    }

    pub fn is_true(&self, r: ObjRef) -> bool {
        is_true(&self.heap, r)
    }

    /// Printed forms of the calls that were in progress when the last
    /// error was raised, outermost first.
    pub fn call_trace(&self) -> &[String] {
        &self.trace
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn root_depth(&self) -> usize {
        self.roots.len()
    }

    pub fn eval_depth(&self) -> usize {
        self.depth
    }

    pub fn gc_threshold(&self) -> usize {
        self.threshold
    }

    /// Bind `key` in the global environment, replacing an existing binding.
    pub fn extend_global(&mut self, key: ObjRef, value: ObjRef) -> LispResult<()> {
        env::set(&mut self.heap, self.global, key, value)
    }

    /// Convenience for hosts: bind a global by name.
    pub fn define(&mut self, name: &str, value: ObjRef) -> LispResult<()> {
        let key = self.heap.symbol(name);
        self.extend_global(key, value)
    }

    // ========================================================================
    // Operand and root stacks
    // ========================================================================

    pub fn push(&mut self, r: ObjRef) {
        if self.stack.len() >= self.config.stack_capacity {
            panic!("Stack overflow.");
        }
        trace!("push {:?}", r);
        self.stack.push(r);
    }

    pub fn pop(&mut self) -> ObjRef {
        match self.stack.pop() {
            Some(r) => r,
            None => panic!("Stack underflow."),
        }
    }

    /// Protect a value from collection until the matching `pop_root`.
    pub fn push_root(&mut self, r: ObjRef) {
        if self.roots.len() >= self.config.stack_capacity {
            panic!("Shadow stack overflow.");
        }
        self.roots.push(r);
    }

    /// Roots are released in strict reverse order; anything else is a
    /// defect in the caller.
    pub fn pop_root(&mut self, expected: ObjRef) {
        match self.roots.pop() {
            Some(r) if r == expected => {}
            Some(r) => panic!(
                "Shadow stack unwind mismatch: expected {:?}, found {:?}",
                expected, r
            ),
            None => panic!("Shadow stack underflow."),
        }
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Full collection. Roots: the global environment, both stacks and the
    /// permanent constants.
    pub fn collect(&mut self) {
        let roots = [self.global, self.nil, self.lisp_true, self.lisp_false]
            .into_iter()
            .chain(self.stack.iter().copied())
            .chain(self.roots.iter().copied());
        self.heap.collect(roots, &mut self.stats);
    }

    /// Collect when the live count is over budget, then raise the budget.
    fn maybe_collect(&mut self) {
        if self.heap.live_count() > self.threshold {
            self.collect();
            self.threshold += self.config.gc_increment;
            debug!(
                "GC: {} objects live, next collection above {}",
                self.heap.live_count(),
                self.threshold
            );
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Evaluate one form. The returned value is unrooted: store it before
    /// evaluating anything else.
    ///
    /// On error both stacks are unwound to their depth on entry and the
    /// call trace is left for the caller to report.
    pub fn evaluate(&mut self, env: ObjRef, form: ObjRef) -> LispResult<ObjRef> {
        self.trace.clear();
        let stack_mark = self.stack.len();
        let root_mark = self.roots.len();
        self.push_root(env);
        self.push_root(form);
        match self.eval_internal(env, form) {
            Ok(()) => {
                let value = self.pop();
                self.pop_root(form);
                self.pop_root(env);
                debug_assert_eq!(self.stack.len(), stack_mark);
                Ok(value)
            }
            Err(e) => {
                self.stack.truncate(stack_mark);
                self.roots.truncate(root_mark);
                Err(e)
            }
        }
    }

    /// Read and evaluate every form of `text` in the global environment and
    /// return the last value.
    pub fn eval_str(&mut self, text: &str) -> LispResult<ObjRef> {
        let forms = Reader::new(text, &mut self.heap).read_all()?;
        let all = self.heap.list(&forms);
        self.push_root(all);
        let mut result = Ok(self.nil);
        for form in forms {
            result = self.evaluate(self.global, form);
            if result.is_err() {
                break;
            }
        }
        self.pop_root(all);
        result
    }

    /// Batch driver: evaluate every form of `text` in `env`, echoing each
    /// result to `out`. The first error is reported with its call trace and
    /// stops the batch. Malformed input is reported after the forms read
    /// before it have run.
    pub fn eval_text(&mut self, env: ObjRef, text: &str, out: &mut dyn Write) -> LispResult<()> {
        let (forms, read_error) = reader::read_forms(&mut self.heap, text);
        let all = self.heap.list(&forms);
        self.push(all);
        let outcome = self.eval_forms(env, &forms, out);
        self.pop();

        let outcome = match (outcome, read_error) {
            (Ok(()), Some(e)) => {
                writeln!(out, "ERROR: {}", e)?;
                Err(e)
            }
            (outcome, _) => outcome,
        };
        if outcome.is_err() {
            self.collect();
        }
        outcome
    }

    /// Evaluate rooted top-level forms until the first error.
    fn eval_forms(&mut self, env: ObjRef, forms: &[ObjRef], out: &mut dyn Write) -> LispResult<()> {
        for &form in forms {
            match self.evaluate(env, form) {
                Ok(value) => {
                    if self.config.echo_results {
                        writeln!(out, "{}", print_val(&self.heap, value))?;
                    }
                    if self.config.collect_after_each_form {
                        self.collect();
                    }
                }
                Err(e) => {
                    writeln!(out, "ERROR: {}", e)?;
                    self.write_trace(out)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn write_trace(&self, out: &mut dyn Write) -> LispResult<()> {
        writeln!(out, "     -----------------")?;
        for (depth, form) in self.trace.iter().enumerate().rev() {
            writeln!(out, "{:>3}  {}", depth, form)?;
        }
        writeln!(out, "     -----------------")?;
        Ok(())
    }

    /// Call `function` on already-evaluated `args`. Same rooting rules as
    /// `evaluate` for the result.
    pub fn call(&mut self, function: ObjRef, args: &[ObjRef]) -> LispResult<ObjRef> {
        let stack_mark = self.stack.len();
        let root_mark = self.roots.len();
        self.push_root(function);
        for &a in args {
            self.push_root(a);
        }
        match self.apply(function, args) {
            Ok(()) => {
                let value = self.pop();
                self.roots.truncate(root_mark);
                Ok(value)
            }
            Err(e) => {
                self.stack.truncate(stack_mark);
                self.roots.truncate(root_mark);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate `form` in `env` and push exactly one result.
    ///
    /// Calls are not tail-call optimised: every nested evaluation is a host
    /// frame, so nesting deeper than `config.max_depth` is fatal.
    pub(crate) fn eval_internal(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        if self.depth >= self.config.max_depth {
            panic!("Evaluation depth exceeded.");
        }
        self.depth += 1;
        let result = self.eval_form(env, form);
        self.depth -= 1;
        result
    }

    fn eval_form(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        self.maybe_collect();
        match self.heap.get(form).kind() {
            Kind::Pair => self.eval_list(env, form),
            Kind::Environment => self.eval_dict(env, form),
            Kind::Symbol => match env::lookup(&self.heap, env, form)? {
                Some(value) => {
                    self.push(value);
                    Ok(())
                }
                None => Err(LispError::Unbound(print_val(&self.heap, form))),
            },
            _ => {
                self.push(form);
                Ok(())
            }
        }
    }

    /// A dictionary literal evaluates to a copy with every value evaluated.
    fn eval_dict(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let dict = value_copy(&mut self.heap, form);
        self.push_root(dict);
        for cell in env::binding_cells(&self.heap, dict) {
            if let Some(expr) = self.heap.cdr(cell) {
                self.eval_internal(env, expr)?;
                let value = self.pop();
                self.heap.set_cdr(cell, Some(value));
            }
        }
        self.pop_root(dict);
        self.push(dict);
        Ok(())
    }

    fn special_form(&self, head: ObjRef) -> Option<SpecialForm> {
        let form = match self.heap.get(head).as_symbol()? {
            "do" => SpecialForm::Do,
            "let" => SpecialForm::Let,
            "not" => SpecialForm::Not,
            "quote" => SpecialForm::Quote,
            "while" => SpecialForm::While,
            "if" => SpecialForm::If,
            "match" => SpecialForm::Match,
            "reset!" => SpecialForm::Reset,
            "fn" => SpecialForm::Fn,
            "macro" => SpecialForm::Macro,
            "def" => SpecialForm::Def,
            "def?" => SpecialForm::IsDefined,
            "ref" => SpecialForm::Ref,
            _ => return None,
        };
        Some(form)
    }

    fn eval_list(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let head = match self.heap.car(form) {
            Some(head) => head,
            None => {
                // The empty list evaluates to itself.
                self.push(form);
                return Ok(());
            }
        };

        match self.special_form(head) {
            Some(SpecialForm::Do) => self.eval_do(env, form),
            Some(SpecialForm::Let) => self.eval_let(env, form),
            Some(SpecialForm::Not) => self.eval_not(env, form),
            Some(SpecialForm::Quote) => {
                let quoted = self.arg(form, 0).unwrap_or(self.nil);
                self.push(quoted);
                Ok(())
            }
            Some(SpecialForm::While) => self.eval_while(env, form),
            Some(SpecialForm::If) => self.eval_if(env, form),
            Some(SpecialForm::Match) => self.eval_match_form(env, form),
            Some(SpecialForm::Reset) => self.eval_reset(env, form),
            Some(SpecialForm::Fn) => self.eval_closure(env, form, false),
            Some(SpecialForm::Macro) => self.eval_closure(env, form, true),
            Some(SpecialForm::Def) => self.eval_def(env, form),
            Some(SpecialForm::IsDefined) => {
                let key = self
                    .arg(form, 0)
                    .ok_or_else(|| self.syntax("Too few args to 'def?': ", form))?;
                let found = env::lookup_binding(&self.heap, env, key)?.is_some();
                self.push(self.bool(found));
                Ok(())
            }
            Some(SpecialForm::Ref) => {
                let target = self
                    .arg(form, 0)
                    .ok_or_else(|| self.syntax("Too few args to 'ref': ", form))?;
                self.eval_internal(env, target)
            }
            None => self.eval_application(env, form, head),
        }
    }

    /// Argument `n` of a form, counting after the head.
    fn arg(&self, form: ObjRef, n: usize) -> Option<ObjRef> {
        self.heap.nth(form, n + 1)
    }

    /// Every form after the head.
    fn args_of(&self, form: ObjRef) -> Vec<ObjRef> {
        match self.heap.cdr(form) {
            Some(rest) => self.heap.list_items(rest),
            None => Vec::new(),
        }
    }

    fn syntax(&self, message: &str, form: ObjRef) -> LispError {
        LispError::syntax(message, print_val(&self.heap, form))
    }

    fn eval_do(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let body = self.args_of(form);
        if body.is_empty() {
            self.push(self.nil);
            return Ok(());
        }
        let last = body.len() - 1;
        for (i, expr) in body.into_iter().enumerate() {
            self.eval_internal(env, expr)?;
            if i < last {
                self.pop();
            }
        }
        Ok(())
    }

    fn eval_let(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let bindings = self
            .arg(form, 0)
            .filter(|b| self.heap.is_pair(*b))
            .ok_or_else(|| self.syntax("No bindings in 'let' form: ", form))?;
        let body = self
            .arg(form, 1)
            .ok_or_else(|| self.syntax("No body in 'let' form: ", form))?;
        if self.arg(form, 2).is_some() {
            return Err(self.syntax("Too many body forms in 'let' form (use explicit 'do'): ", form));
        }

        let items = self.heap.list_items(bindings);
        if items.len() % 2 != 0 {
            return Err(self.syntax("Uneven nr of forms in let: ", bindings));
        }
        if let Some(bad) = items
            .iter()
            .step_by(2)
            .find(|k| self.heap.get(**k).as_symbol().is_none())
        {
            return Err(self.syntax("Must bind to symbol in let form: ", *bad));
        }

        let let_env = self.heap.environment(Some(env));
        self.push_root(let_env);
        for pair in items.chunks(2) {
            self.eval_internal(let_env, pair[1])?;
            let value = self.pop();
            env::extend(&mut self.heap, let_env, pair[0], value);
        }
        self.eval_internal(let_env, body)?;
        self.pop_root(let_env);
        Ok(())
    }

    /// True iff every argument evaluates false. Stops at the first true one.
    fn eval_not(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        for expr in self.args_of(form) {
            self.eval_internal(env, expr)?;
            let value = self.pop();
            if self.is_true(value) {
                self.push(self.lisp_false);
                return Ok(());
            }
        }
        self.push(self.lisp_true);
        Ok(())
    }

    fn eval_while(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let cond = self
            .arg(form, 0)
            .ok_or_else(|| self.syntax("Missing condition in 'while' form: ", form))?;
        let body = self
            .arg(form, 1)
            .ok_or_else(|| self.syntax("Missing body in 'while' form: ", form))?;
        loop {
            self.eval_internal(env, cond)?;
            let test = self.pop();
            if !self.is_true(test) {
                break;
            }
            self.eval_internal(env, body)?;
            self.pop();
        }
        self.push(self.nil);
        Ok(())
    }

    fn eval_if(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let args = self.args_of(form);
        if args.len() < 3 {
            return Err(self.syntax("Too few body forms in 'if' form: ", form));
        }
        if args.len() > 3 {
            return Err(self.syntax("Too many body forms in 'if' form (use explicit 'do'): ", form));
        }
        self.eval_internal(env, args[0])?;
        let test = self.pop();
        let branch = if self.is_true(test) { args[1] } else { args[2] };
        self.eval_internal(env, branch)
    }

    fn eval_match_form(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let args = self.args_of(form);
        let (&scrutinee, clauses) = args
            .split_first()
            .ok_or_else(|| self.syntax("No value to match on in 'match' form: ", form))?;
        self.eval_internal(env, scrutinee)?;
        let value = self.pop();
        self.push_root(value);
        self.eval_match(env, value, clauses)?;
        self.pop_root(value);
        Ok(())
    }

    /// Rebind an existing binding in place. A symbol with no binding is left
    /// alone and the form yields nil.
    fn eval_reset(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let target = self
            .arg(form, 0)
            .filter(|t| self.heap.get(*t).as_symbol().is_some())
            .ok_or_else(|| self.syntax("Must use 'reset!' on a symbol: ", form))?;
        let value_form = self
            .arg(form, 1)
            .ok_or_else(|| self.syntax("Missing value in 'reset!' form: ", form))?;

        let cell = env::lookup_binding(&self.heap, env, target)?.filter(|cell| {
            self.heap
                .car_of(*cell)
                .map_or(false, |k| self.heap.get(k).as_symbol().is_some())
        });
        let cell = match cell {
            Some(cell) => cell,
            None => {
                log::warn!(
                    "reset! of '{}' ignored: no such binding",
                    print_val(&self.heap, target)
                );
                self.push(self.nil);
                return Ok(());
            }
        };

        self.eval_internal(env, value_form)?;
        let value = self.pop();
        self.heap.set_cdr(cell, Some(value));
        self.push(value);
        Ok(())
    }

    fn eval_closure(&mut self, env: ObjRef, form: ObjRef, is_macro: bool) -> LispResult<()> {
        let params = self
            .arg(form, 0)
            .filter(|p| self.heap.is_pair(*p))
            .ok_or_else(|| self.syntax("No parameter list in lambda: ", form))?;
        let body = self
            .arg(form, 1)
            .ok_or_else(|| self.syntax("No body in lambda: ", form))?;
        let closure = Closure {
            params,
            body,
            env,
            code: form,
        };
        let value = if is_macro {
            self.heap.macro_(closure)
        } else {
            self.heap.lambda(closure)
        };
        self.push(value);
        Ok(())
    }

    /// `def` always binds in the global environment.
    fn eval_def(&mut self, env: ObjRef, form: ObjRef) -> LispResult<()> {
        let key = self
            .arg(form, 0)
            .ok_or_else(|| self.syntax("Too few args to 'def': ", form))?;
        if self.heap.get(key).as_symbol().is_none() {
            return Err(self.syntax("Can't assign to non-symbol: ", key));
        }
        let value_form = self
            .arg(form, 1)
            .ok_or_else(|| self.syntax("Too few args to 'def': ", form))?;
        self.eval_internal(env, value_form)?;
        let value = self.pop();
        self.extend_global(key, value)?;
        self.push(value);
        Ok(())
    }

    // ========================================================================
    // Application
    // ========================================================================

    fn eval_application(&mut self, env: ObjRef, form: ObjRef, head: ObjRef) -> LispResult<()> {
        self.push_root(form);
        self.eval_internal(env, head)?;
        let function = self.pop();
        self.push_root(function);

        let is_macro = matches!(self.heap.get(function), Object::Macro(_));
        let arg_forms = self.args_of(form);
        for &arg in &arg_forms {
            if is_macro {
                self.push(arg);
            } else {
                self.eval_internal(env, arg)?;
            }
        }
        let args = self.stack.split_off(self.stack.len() - arg_forms.len());
        for &a in &args {
            self.push_root(a);
        }

        if is_macro {
            self.expand_and_eval(env, function, &args)?;
        } else {
            if self.trace.len() >= self.config.stack_capacity {
                panic!("Out of function trace stack.");
            }
            self.trace.push(print_val(&self.heap, form));
            self.apply(function, &args)?;
            self.trace.pop();
        }

        for &a in args.iter().rev() {
            self.pop_root(a);
        }
        self.pop_root(function);
        self.pop_root(form);
        Ok(())
    }

    /// Expand the macro against the unevaluated argument forms, then
    /// evaluate the expansion in the calling environment.
    fn expand_and_eval(&mut self, env: ObjRef, function: ObjRef, args: &[ObjRef]) -> LispResult<()> {
        let closure = self.closure_of(function);
        let calling_env = self.heap.environment(Some(closure.env));
        self.push_root(calling_env);
        env::extend_with_arguments(&mut self.heap, calling_env, function, closure.params, args)?;
        self.eval_internal(calling_env, closure.body)?;
        let expanded = self.pop();
        trace!("Expanded macro: {}", print_val(&self.heap, expanded));
        self.push_root(expanded);
        self.eval_internal(env, expanded)?;
        self.pop_root(expanded);
        self.pop_root(calling_env);
        Ok(())
    }

    fn closure_of(&self, function: ObjRef) -> Closure {
        match self.heap.get(function).as_closure() {
            Some(c) => *c,
            None => panic!("expected closure, got {}", self.heap.get(function).kind()),
        }
    }

    /// Apply an evaluated function to evaluated arguments and push the
    /// result. `function` and `args` must already be rooted.
    pub(crate) fn apply(&mut self, function: ObjRef, args: &[ObjRef]) -> LispResult<()> {
        match self.heap.get(function).kind() {
            Kind::Lambda => {
                let closure = self.closure_of(function);
                let calling_env = self.heap.environment(Some(closure.env));
                self.push_root(calling_env);
                env::extend_with_arguments(
                    &mut self.heap,
                    calling_env,
                    function,
                    closure.params,
                    args,
                )?;
                self.eval_internal(calling_env, closure.body)?;
                self.pop_root(calling_env);
                Ok(())
            }
            Kind::Native => {
                let func = match self.heap.get(function) {
                    Object::Native { func, .. } => *func,
                    _ => unreachable!(),
                };
                let result = func(self, args)?;
                self.push(result);
                Ok(())
            }
            Kind::Foreign => self.apply_foreign(function, args),
            Kind::Keyword => self.apply_keyword(function, args),
            _ => Err(LispError::NotCallable(print_val(&self.heap, function))),
        }
    }

    /// `(:key dict)` looks the keyword up in the dictionary.
    fn apply_keyword(&mut self, keyword: ObjRef, args: &[ObjRef]) -> LispResult<()> {
        if args.len() != 1 {
            return Err(LispError::KeywordLookup(
                "Args to keyword lookup must be a single arg.".into(),
            ));
        }
        let dict = args[0];
        if self.heap.get(dict).kind() != Kind::Environment {
            return Err(LispError::KeywordLookup(format!(
                "Arg 0 to keyword lookup must be a dictionary: {}",
                print_val(&self.heap, dict)
            )));
        }
        match env::lookup(&self.heap, dict, keyword)? {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(LispError::KeywordLookup(format!(
                "Failed to lookup keyword '{}' in {}",
                print_val(&self.heap, keyword),
                print_val(&self.heap, dict)
            ))),
        }
    }
}
