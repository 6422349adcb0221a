// The compiler.
//
// Lowers type-checked tc::Tc into bytecode, assigning frame locations to
// variables as it goes. Local slots are reference counted at compile time:
// when the last use of a slot is compiled, a Release is emitted and the
// slot becomes free for reuse. The compiler also names and collects the
// profile blocks for the module.

use std::rc::Rc;
use std::sync::Arc;

use crate::code::{Code, DebugInfo, Instr, Op, ProfileOp};
use crate::kind::DataTypeTag;
use crate::name::{Loc, Name, Namespace};
use crate::profile::BlockId;
use crate::program::{CompiledModule, CompiledProgram, LoadedProgram};
use crate::tc::{Tc, TcBinding, TcBody, TcRef};
use crate::typecheck;
use crate::var::{Var, VarSource};


// A frame location holding a value, shared by however many compile-time
// references still need it.
struct Local {
    var: Var,
    refcount: usize,
}


struct Scope {
    // Pool of locals; statics, args, and vars index into it.
    pool: Vec<Local>,

    statics: Vec<usize>,
    args: Vec<usize>,

    // The stack of in-scope variables, matching the variable indices
    // assigned by the type checker.
    vars: Vec<Option<usize>>,

    // Local slot table: which pool entry occupies each slot.
    slots: Vec<Option<usize>>,

    code: Code,

    // Debug info and profile ops attach to the next emitted instruction.
    pending_debug: Vec<DebugInfo>,
    pending_profile: Vec<ProfileOp>,
}


impl Scope {
    fn new(num_args: usize, num_statics: usize, block: BlockId) -> Scope {
        let mut pool = Vec::new();
        let statics = (0..num_statics)
            .map(|i| {
                pool.push(Local { var: Var::static_(i), refcount: 1 });
                pool.len() - 1
            })
            .collect();
        let args = (0..num_args)
            .map(|i| {
                pool.push(Local { var: Var::arg(i), refcount: 1 });
                pool.len() - 1
            })
            .collect();

        Scope {
            pool,
            statics,
            args,
            vars: Vec::new(),
            slots: Vec::new(),
            code: Code::new(num_args, num_statics, 0, block),
            pending_debug: Vec::new(),
            pending_profile: Vec::new(),
        }
    }

    // Allocate the lowest free local slot.
    fn new_local(&mut self) -> usize {
        let slot = match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.code.num_locals = self.slots.len();
                self.slots.len() - 1
            }
        };

        self.pool.push(Local { var: Var::local(slot), refcount: 1 });
        let handle = self.pool.len() - 1;
        self.slots[slot] = Some(handle);
        handle
    }

    // Drop one reference to a local. On the last reference the slot is
    // freed and, unless the frame has already exited, a Release is emitted.
    fn release_local(&mut self, local: Option<usize>, exit: bool) {
        let handle = match local {
            Some(handle) => handle,
            None => return,
        };

        self.pool[handle].refcount -= 1;
        if self.pool[handle].refcount == 0 {
            if let VarSource::Local = self.pool[handle].var.source {
                let slot = self.pool[handle].var.index;
                if !exit {
                    self.append(Op::Release { targets: vec![slot] });
                }
                self.slots[slot] = None;
            }
        }
    }

    fn push_var(&mut self, name: &Name, local: Option<usize>) {
        if let Some(handle) = local {
            self.pending_debug.push(DebugInfo::Var(name.clone(), self.pool[handle].var));
        }
        self.vars.push(local);
    }

    fn pop_var(&mut self, exit: bool) {
        let local = self.vars.pop().unwrap();
        self.release_local(local, exit);
    }

    fn set_var(&mut self, index: usize, name: &Name, local: usize) {
        let old = self.vars[index].take();
        self.release_local(old, false);
        self.vars[index] = Some(local);
        self.pending_debug.push(DebugInfo::Var(name.clone(), self.pool[local].var));
    }

    fn get_var(&self, var: Var) -> usize {
        match var.source {
            VarSource::Local => self.vars[var.index].expect("local variable has no value"),
            VarSource::Static => self.statics[var.index],
            VarSource::Arg => self.args[var.index],
        }
    }

    fn var_of(&self, handle: usize) -> Var {
        self.pool[handle].var
    }

    fn slot_of(&self, handle: usize) -> usize {
        match self.pool[handle].var.source {
            VarSource::Local => self.pool[handle].var.index,
            _ => unreachable!("destination is not a local"),
        }
    }

    fn append(&mut self, op: Op) {
        let mut instr = Instr::new(op);
        instr.debug_info = std::mem::take(&mut self.pending_debug);
        instr.profile_ops = std::mem::take(&mut self.pending_profile);
        self.code.instrs.push(instr);
    }

    fn append_profile_op(&mut self, op: ProfileOp) {
        self.pending_profile.push(op);
    }

    fn note_call_args(&mut self, argc: usize) {
        if argc > self.code.max_call_args {
            self.code.max_call_args = argc;
        }
    }

    // If exiting, release every live local other than the result and emit
    // the return.
    fn compile_exit(&mut self, exit: bool, result: Option<usize>) {
        if !exit {
            return;
        }
        let result = match result {
            Some(result) => result,
            None => return,
        };

        let targets: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, handle)| match handle {
                Some(h) if *h != result => Some(slot),
                _ => None,
            })
            .collect();
        if !targets.is_empty() {
            self.append(Op::Release { targets });
        }

        let result = self.var_of(result);
        self.append(Op::Return { result });
    }
}


// The stack of profiling blocks under construction. Block names chain with
// '.' for named sub-blocks and '!' for function bodies.
struct Blocks {
    stack: Vec<BlockId>,
    profile: Vec<Name>,
}


impl Blocks {
    fn new() -> Blocks {
        Blocks { stack: Vec::new(), profile: Vec::new() }
    }

    fn current_name(&self) -> &str {
        match self.stack.last() {
            Some(id) => &self.profile[*id].name,
            None => "",
        }
    }

    fn push_block(&mut self, name: &Name, loc: &Loc) -> BlockId {
        let mut full = String::from(self.current_name());
        if !full.is_empty() {
            full.push('.');
        }
        full.push_str(&name.name);
        if name.space == Namespace::Type {
            full.push('@');
        }

        let id = self.profile.len();
        self.profile.push(Name::normal(&full, loc.clone()));
        self.stack.push(id);
        id
    }

    // A block for a function body, executed when the function is called
    // rather than where it is defined.
    fn push_body_block(&mut self, loc: &Loc) -> BlockId {
        let full = format!("{}!", self.current_name());
        let id = self.profile.len();
        self.profile.push(Name::normal(&full, loc.clone()));
        self.stack.push(id);
        id
    }

    fn pop(&mut self) {
        self.stack.pop();
    }
}


fn enter_block(blocks: &mut Blocks, scope: &mut Scope, name: &Name, loc: &Loc, replace: bool) {
    let id = blocks.push_block(name, loc);
    scope.append_profile_op(if replace { ProfileOp::Replace(id) } else { ProfileOp::Enter(id) });
}


fn exit_block(blocks: &mut Blocks, scope: &mut Scope, exit: bool) {
    blocks.pop();
    if !exit {
        scope.append_profile_op(ProfileOp::Exit);
    }
}


// Compile an expression, returning the frame location that will hold its
// value. With exit set, the generated code returns the value instead and
// no location is produced for tail calls and select joins.
fn compile_expr(
    blocks: &mut Blocks,
    stmt: bool,
    exit: bool,
    scope: &mut Scope,
    tc: &TcRef,
) -> Option<usize> {
    if stmt {
        scope.pending_debug.push(DebugInfo::Statement(tc.loc.clone()));
    }

    match &tc.body {
        TcBody::TypeValue => {
            let local = scope.new_local();
            let dst = scope.slot_of(local);
            scope.append(Op::Type { dst });
            scope.compile_exit(exit, Some(local));
            Some(local)
        }

        TcBody::Var(var) => {
            let local = scope.get_var(*var);
            scope.pool[local].refcount += 1;
            scope.compile_exit(exit, Some(local));
            Some(local)
        }

        TcBody::Let { recursive, bindings, body } => {
            let base = scope.vars.len();

            let mut vars: Vec<Option<usize>> = Vec::new();
            for binding in bindings.iter() {
                let var = if *recursive {
                    let local = scope.new_local();
                    let dst = scope.slot_of(local);
                    scope.append(Op::RefValue { dst });
                    Some(local)
                } else {
                    None
                };
                scope.push_var(&binding.name, var);
                vars.push(var);
            }

            let mut defs = Vec::new();
            for binding in bindings.iter() {
                enter_block(blocks, scope, &binding.name, &binding.loc, false);
                let def = compile_expr(blocks, false, false, scope, &binding.tc);
                exit_block(blocks, scope, false);
                defs.push(def.unwrap());
            }

            for (i, binding) in bindings.iter().enumerate() {
                if *recursive {
                    let ref_ = scope.slot_of(vars[i].unwrap());
                    let value = scope.var_of(defs[i]);
                    scope.append(Op::RefDef {
                        ref_,
                        value,
                        loc: binding.name.loc.clone(),
                    });
                }
                scope.set_var(base + i, &binding.name, defs[i]);
            }

            let body = compile_expr(blocks, true, exit, scope, body);

            for _ in bindings.iter() {
                scope.pop_var(exit);
            }

            body
        }

        TcBody::StructValue(fields) => {
            let args: Vec<usize> = fields
                .iter()
                .map(|field| compile_expr(blocks, false, false, scope, field).unwrap())
                .collect();

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let arg_vars = args.iter().map(|a| scope.var_of(*a)).collect();
            scope.append(Op::Struct { dst, args: arg_vars });
            scope.compile_exit(exit, Some(local));

            for arg in args {
                scope.release_local(Some(arg), exit);
            }
            Some(local)
        }

        TcBody::StructCopy { source, fields } => {
            let src = compile_expr(blocks, false, false, scope, source).unwrap();

            let mut args = Vec::new();
            for (tag, field) in fields.iter().enumerate() {
                match field {
                    Some(override_) => {
                        args.push(compile_expr(blocks, false, false, scope, override_).unwrap());
                    }
                    None => {
                        let local = scope.new_local();
                        let dst = scope.slot_of(local);
                        let obj = scope.var_of(src);
                        scope.append(Op::StructAccess {
                            dst,
                            obj,
                            tag,
                            loc: tc.loc.clone(),
                        });
                        args.push(local);
                    }
                }
            }

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let arg_vars = args.iter().map(|a| scope.var_of(*a)).collect();
            scope.append(Op::Struct { dst, args: arg_vars });
            scope.compile_exit(exit, Some(local));

            scope.release_local(Some(src), exit);
            for arg in args {
                scope.release_local(Some(arg), exit);
            }
            Some(local)
        }

        TcBody::UnionValue { tag, arg } => {
            let arg = compile_expr(blocks, false, false, scope, arg).unwrap();

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let arg_var = scope.var_of(arg);
            scope.append(Op::Union { dst, tag: *tag, arg: arg_var });
            scope.compile_exit(exit, Some(local));
            scope.release_local(Some(arg), exit);
            Some(local)
        }

        TcBody::UnionSelect { condition, num_tags, targets, default_ } => {
            let cond = compile_expr(blocks, false, false, scope, condition).unwrap();

            let condition_var = scope.var_of(cond);
            scope.append(Op::UnionSelect {
                condition: condition_var,
                num_tags: *num_tags,
                targets: Vec::new(),
                default_pc: 0,
                loc: tc.loc.clone(),
            });
            let select_pc = scope.code.instrs.len() - 1;

            let target = if exit { None } else { Some(scope.new_local()) };

            // Branches that share a tc (from shared defaults) share code.
            let mut compiled: Vec<(*const Tc, usize)> = Vec::new();
            let mut exit_gotos: Vec<usize> = Vec::new();

            let mut compile_branch = |blocks: &mut Blocks,
                                      scope: &mut Scope,
                                      compiled: &mut Vec<(*const Tc, usize)>,
                                      exit_gotos: &mut Vec<usize>,
                                      binding: &TcBinding|
             -> usize {
                let key = Rc::as_ptr(&binding.tc);
                if let Some((_, pc)) = compiled.iter().find(|(k, _)| *k == key) {
                    return *pc;
                }

                let pc = scope.code.instrs.len();
                enter_block(blocks, scope, &binding.name, &binding.loc, exit);
                let result = compile_expr(blocks, true, exit, scope, &binding.tc);

                if !exit {
                    let src = scope.var_of(result.unwrap());
                    let dst = scope.slot_of(target.unwrap());
                    scope.append(Op::Copy { dst, src });
                }
                exit_block(blocks, scope, exit);
                scope.release_local(result, exit);

                if !exit {
                    exit_gotos.push(scope.code.instrs.len());
                    scope.append(Op::Goto { pc: 0 });
                }

                compiled.push((key, pc));
                pc
            };

            let mut tag_pcs = Vec::new();
            for (tag, binding) in targets.iter() {
                let pc =
                    compile_branch(blocks, scope, &mut compiled, &mut exit_gotos, binding);
                tag_pcs.push((*tag, pc));
            }
            let default_pc =
                compile_branch(blocks, scope, &mut compiled, &mut exit_gotos, default_);

            match &mut scope.code.instrs[select_pc].op {
                Op::UnionSelect { targets, default_pc: dpc, .. } => {
                    *targets = tag_pcs;
                    *dpc = default_pc;
                }
                _ => unreachable!(),
            }

            let join = scope.code.instrs.len();
            for goto_pc in exit_gotos {
                match &mut scope.code.instrs[goto_pc].op {
                    Op::Goto { pc } => *pc = join,
                    _ => unreachable!(),
                }
            }

            scope.release_local(Some(cond), exit);
            target
        }

        TcBody::DataAccess { datatype, obj, tag, loc } => {
            let obj = compile_expr(blocks, false, false, scope, obj).unwrap();

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let obj_var = scope.var_of(obj);
            let op = match datatype {
                DataTypeTag::Struct => Op::StructAccess {
                    dst,
                    obj: obj_var,
                    tag: *tag,
                    loc: loc.clone(),
                },
                DataTypeTag::Union => Op::UnionAccess {
                    dst,
                    obj: obj_var,
                    tag: *tag,
                    loc: loc.clone(),
                },
            };
            scope.append(op);
            scope.compile_exit(exit, Some(local));
            scope.release_local(Some(obj), exit);
            Some(local)
        }

        TcBody::FuncValue { body_loc, scope: capture, statics: _, args, body } => {
            let capture_vars: Vec<Var> = capture
                .iter()
                .map(|var| {
                    let handle = scope.get_var(*var);
                    scope.var_of(handle)
                })
                .collect();

            let block = blocks.push_body_block(body_loc);
            let mut func_scope = Scope::new(args.len(), capture.len(), block);

            let result = compile_expr(blocks, true, true, &mut func_scope, body);
            exit_block(blocks, &mut func_scope, true);
            func_scope.release_local(result, true);

            let code = Arc::new(func_scope.code);

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            scope.append(Op::FuncValue { dst, code, scope: capture_vars });
            scope.compile_exit(exit, Some(local));
            Some(local)
        }

        TcBody::FuncApply { func, arg } => {
            let func = compile_expr(blocks, false, false, scope, func).unwrap();
            let arg = compile_expr(blocks, false, false, scope, arg).unwrap();

            scope.note_call_args(1);

            if exit {
                // Release every live local not consumed by the call before
                // giving up the frame.
                let targets: Vec<usize> = scope
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, handle)| match handle {
                        Some(h) if *h != func && *h != arg => Some(slot),
                        _ => None,
                    })
                    .collect();
                if !targets.is_empty() {
                    scope.append(Op::Release { targets });
                }

                let func_var = scope.var_of(func);
                let arg_var = scope.var_of(arg);
                scope.append(Op::TailCall {
                    func: func_var,
                    args: vec![arg_var],
                    loc: tc.loc.clone(),
                });
                scope.release_local(Some(func), true);
                scope.release_local(Some(arg), true);
                return None;
            }

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let func_var = scope.var_of(func);
            let arg_var = scope.var_of(arg);
            scope.append(Op::Call {
                dst,
                func: func_var,
                args: vec![arg_var],
                loc: tc.loc.clone(),
            });
            scope.release_local(Some(func), false);
            scope.release_local(Some(arg), false);
            Some(local)
        }

        TcBody::List(fields) => {
            let args: Vec<usize> = fields
                .iter()
                .map(|field| compile_expr(blocks, false, false, scope, field).unwrap())
                .collect();

            let local = scope.new_local();
            let dst = scope.slot_of(local);
            let arg_vars = args.iter().map(|a| scope.var_of(*a)).collect();
            scope.append(Op::List { dst, args: arg_vars });
            scope.compile_exit(exit, Some(local));

            for arg in args {
                scope.release_local(Some(arg), exit);
            }
            Some(local)
        }

        TcBody::Literal(letters) => {
            let local = scope.new_local();
            let dst = scope.slot_of(local);
            scope.append(Op::Literal { dst, letters: letters.clone() });
            scope.compile_exit(exit, Some(local));
            Some(local)
        }
    }
}


// Compile a type-checked expression as the body of a function with the
// given argument names.
fn compile(args: &[Name], tc: &TcRef, name: &Name) -> (Arc<Code>, Vec<Name>) {
    let mut blocks = Blocks::new();
    let block = blocks.push_block(name, &name.loc);
    let mut scope = Scope::new(args.len(), 0, block);

    let result = compile_expr(&mut blocks, true, true, &mut scope, tc);
    exit_block(&mut blocks, &mut scope, true);
    scope.release_local(result, true);

    assert!(blocks.stack.is_empty());
    (Arc::new(scope.code), blocks.profile)
}


// Compile a loaded program: type check it and lower each module.
pub fn compile_program(program: &LoadedProgram) -> Option<CompiledProgram> {
    let tcs = typecheck::type_check_program(program)?;

    let modules = program
        .modules
        .iter()
        .zip(tcs.iter())
        .map(|(module, tc)| {
            let args: Vec<Name> = module.deps.iter().map(|dep| dep.full_name()).collect();
            let label = module.path.full_name();
            let (code, profile_blocks) = compile(&args, tc, &label);
            debug!("compiled module {}", module.path);
            CompiledModule {
                path: module.path.clone(),
                deps: module.deps.clone(),
                code,
                profile_blocks,
            }
        })
        .collect();

    Some(CompiledProgram { modules })
}


// Compile the main module of a loaded program.
pub fn compile_module(program: &LoadedProgram) -> Option<CompiledModule> {
    let compiled = compile_program(program)?;
    compiled.modules.into_iter().last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, Arg as AstArg, Binding, ExprBody};
    use crate::function;
    use crate::name::ModulePath;
    use crate::kind::Kind;
    use crate::program::{self, LoadedModule};
    use crate::value::{Value, ValueHeap};

    fn loc() -> Loc {
        Loc::new("test.fble", 1, 1)
    }

    fn e(body: ExprBody) -> ast::Node {
        ast::Expr::new(loc(), body)
    }

    fn n(s: &str) -> Name {
        Name::normal(s, loc())
    }

    fn tn(s: &str) -> Name {
        Name::type_name(s, loc())
    }

    fn var(s: &str) -> ast::Node {
        e(ExprBody::Var(n(s)))
    }

    fn tvar(s: &str) -> ast::Node {
        e(ExprBody::Var(tn(s)))
    }

    fn arg(type_: ast::Node, name: Name) -> AstArg {
        AstArg { type_, name }
    }

    fn unit_type() -> ast::Node {
        e(ExprBody::DataType(DataTypeTag::Struct, vec![]))
    }

    fn unit_value() -> ast::Node {
        e(ExprBody::StructValueImplicitType(vec![]))
    }

    fn bool_type() -> ast::Node {
        e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![arg(unit_type(), n("true")), arg(unit_type(), n("false"))],
        ))
    }

    fn tbind(name: &str, expr: ast::Node) -> Binding {
        Binding { kind: Some(Kind::Basic(1)), type_: None, name: tn(name), expr }
    }

    fn kbind(name: &str, expr: ast::Node) -> Binding {
        Binding { kind: Some(Kind::Basic(0)), type_: None, name: n(name), expr }
    }

    // <@>% x = expr, for bindings holding a polymorphic value.
    fn pbind(name: &str, expr: ast::Node) -> Binding {
        let kind = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(0)));
        Binding { kind: Some(kind), type_: None, name: n(name), expr }
    }

    fn vbind(type_: ast::Node, name: &str, expr: ast::Node) -> Binding {
        Binding { kind: None, type_: Some(type_), name: n(name), expr }
    }

    fn let_(bindings: Vec<Binding>, body: ast::Node) -> ast::Node {
        e(ExprBody::Let(bindings, body))
    }

    fn apply(func: ast::Node, args: Vec<ast::Node>) -> ast::Node {
        e(ExprBody::Apply(func, args))
    }

    fn main_program(expr: ast::Node) -> LoadedProgram {
        LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Main%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(expr),
            }],
        }
    }

    // Compile, link, and evaluate a single module program.
    fn run(expr: ast::Node) -> Option<(ValueHeap, Value)> {
        let program = main_program(expr);
        let compiled = compile_program(&program)?;
        let executable = program::interpret(&compiled);
        let mut heap = ValueHeap::new();
        let linked = program::link(&mut heap, &executable, None)?;
        let result = function::eval(&mut heap, linked, None)?;
        Some((heap, result))
    }

    #[test]
    fn test_compile_unit_module() {
        let compiled = compile_program(&main_program(unit_value())).unwrap();
        assert_eq!(compiled.modules.len(), 1);

        let code = &compiled.modules[0].code;
        assert_eq!(code.num_args, 0);
        assert_eq!(code.num_statics, 0);
        assert_eq!(code.num_locals, 1);
        assert!(matches!(code.instrs[0].op, Op::Struct { .. }));
        assert!(matches!(code.instrs.last().unwrap().op, Op::Return { .. }));

        // The module itself names the first profile block.
        assert_eq!(&*compiled.modules[0].profile_blocks[0].name, "/Main%");
    }

    #[test]
    fn test_local_slot_reuse() {
        // Two sequential lets whose variables don't overlap should share a
        // local slot.
        let expr = let_(
            vec![vbind(unit_type(), "x", unit_value())],
            let_(vec![vbind(unit_type(), "y", var("x"))], var("y")),
        );
        let compiled = compile_program(&main_program(expr)).unwrap();
        // x, y, and no more: the frame needs at most 2 locals.
        assert!(compiled.modules[0].code.num_locals <= 2);
    }

    #[test]
    fn test_eval_unit() {
        let (mut heap, result) = run(unit_value()).unwrap();
        let unit = heap.new_struct_value(&[]);
        assert_eq!(result, unit);
    }

    #[test]
    fn test_eval_poly_identity() {
        // % Id = <@ T@>(T@ x) { x; }; Id<Bool@>(Bool@(true: ()))
        let id = e(ExprBody::PolyValue(
            Kind::Basic(1),
            tn("T"),
            e(ExprBody::FuncValue(vec![arg(tvar("T"), n("x"))], var("x"))),
        ));
        let true_value = e(ExprBody::UnionValue(bool_type(), n("true"), unit_value()));
        let expr = let_(
            vec![pbind("Id", id)],
            apply(e(ExprBody::PolyApply(var("Id"), bool_type())), vec![true_value]),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(heap.union_tag(result), Some(0));
    }

    #[test]
    fn test_eval_vacuous_value() {
        // @ B@ = bool; B@ x = x; x -- compiles, aborts at runtime.
        let expr = let_(
            vec![tbind("B", bool_type())],
            let_(vec![vbind(tvar("B"), "x", var("x"))], var("x")),
        );

        let program = main_program(expr);
        let compiled = compile_program(&program).unwrap();
        let executable = program::interpret(&compiled);
        let mut heap = ValueHeap::new();
        let linked = program::link(&mut heap, &executable, None).unwrap();
        assert!(function::eval(&mut heap, linked, None).is_none());
    }

    #[test]
    fn test_eval_union_select() {
        // @ B@ = bool; B@ x = false; x.?(true: x, false: B@(true: ()))
        let false_value = e(ExprBody::UnionValue(tvar("B"), n("false"), unit_value()));
        let true_value = e(ExprBody::UnionValue(tvar("B"), n("true"), unit_value()));
        let select = e(ExprBody::UnionSelect(
            var("x"),
            vec![
                ast::SelectChoice { name: n("true"), expr: var("x") },
                ast::SelectChoice { name: n("false"), expr: true_value },
            ],
            None,
        ));
        let expr = let_(
            vec![tbind("B", bool_type())],
            let_(vec![vbind(tvar("B"), "x", false_value)], select),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(heap.union_tag(result), Some(0));
    }

    // The canonical list type: @ L@ = +(*(E@ head, L@ tail) cons, *() nil)
    fn list_type_binding(list: &str, elem: &str) -> Binding {
        let cons = e(ExprBody::DataType(
            DataTypeTag::Struct,
            vec![arg(tvar(elem), n("head")), arg(tvar(list), n("tail"))],
        ));
        tbind(
            list,
            e(ExprBody::DataType(
                DataTypeTag::Union,
                vec![arg(cons, n("cons")), arg(unit_type(), n("nil"))],
            )),
        )
    }

    fn list_length(heap: &ValueHeap, list: Value) -> usize {
        let mut len = 0;
        let mut list = list;
        while heap.union_tag(list) == Some(0) {
            let cell = heap.union_arg(list);
            list = heap.struct_field(cell, 1);
            len += 1;
        }
        len
    }

    #[test]
    fn test_eval_list_expression() {
        // @ E@ = *(); @ L@ = list of E@; (L@ l) { l; }[(), (), ()]
        let id = e(ExprBody::FuncValue(vec![arg(tvar("L"), n("l"))], var("l")));
        let list = e(ExprBody::List(
            id,
            vec![unit_value(), unit_value(), unit_value()],
        ));
        let expr = let_(
            vec![tbind("E", unit_type())],
            let_(vec![list_type_binding("L", "E")], list),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(list_length(&heap, result), 3);
    }

    #[test]
    fn test_eval_literal() {
        // @ Letter@ = +(h, e, l, o); Str|hello| via an identity function.
        let letter = e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![
                arg(unit_type(), n("h")),
                arg(unit_type(), n("e")),
                arg(unit_type(), n("l")),
                arg(unit_type(), n("o")),
            ],
        ));
        let id = e(ExprBody::FuncValue(vec![arg(tvar("L"), n("l"))], var("l")));
        let literal = e(ExprBody::Literal(id, crate::name::str("hello")));
        let expr = let_(
            vec![tbind("Letter", letter)],
            let_(vec![list_type_binding("L", "Letter")], literal),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(list_length(&heap, result), 5);

        let expected = [0, 1, 2, 2, 3];
        let mut list = result;
        for tag in expected {
            let cell = heap.union_arg(list);
            assert_eq!(heap.union_tag(heap.struct_field(cell, 0)), Some(tag));
            list = heap.struct_field(cell, 1);
        }
    }

    #[test]
    fn test_eval_struct_copy() {
        // @ B@ = bool; *(B@ a, B@ b) s = @(a: true, b: true);
        // s.@(b: false).b
        let true_value = e(ExprBody::UnionValue(tvar("B"), n("true"), unit_value()));
        let false_value = e(ExprBody::UnionValue(tvar("B"), n("false"), unit_value()));
        let stype = e(ExprBody::DataType(
            DataTypeTag::Struct,
            vec![arg(tvar("B"), n("a")), arg(tvar("B"), n("b"))],
        ));
        let sval = e(ExprBody::StructValueImplicitType(vec![
            (n("a"), true_value.clone()),
            (n("b"), true_value),
        ]));
        let copied = e(ExprBody::StructCopy(var("s"), vec![(n("b"), false_value)]));
        let expr = let_(
            vec![tbind("B", bool_type())],
            let_(
                vec![vbind(stype, "s", sval)],
                e(ExprBody::DataAccess(copied, n("b"))),
            ),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(heap.union_tag(result), Some(1));
    }

    #[test]
    fn test_eval_struct_copy_identity() {
        // A copy with no overrides reads the same as the source.
        let true_value = e(ExprBody::UnionValue(tvar("B"), n("true"), unit_value()));
        let false_value = e(ExprBody::UnionValue(tvar("B"), n("false"), unit_value()));
        let stype = e(ExprBody::DataType(
            DataTypeTag::Struct,
            vec![arg(tvar("B"), n("a")), arg(tvar("B"), n("b"))],
        ));
        let sval = e(ExprBody::StructValueImplicitType(vec![
            (n("a"), true_value),
            (n("b"), false_value),
        ]));
        let copied = e(ExprBody::StructCopy(var("s"), vec![]));
        let expr = let_(
            vec![tbind("B", bool_type())],
            let_(vec![vbind(stype, "s", sval)], copied),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(heap.union_tag(heap.struct_field(result, 0)), Some(0));
        assert_eq!(heap.union_tag(heap.struct_field(result, 1)), Some(1));
    }

    #[test]
    fn test_eval_tail_recursive_countdown() {
        // @ N@ = +(*() z, N@ s);
        // (N@) { N@; } loop = (N@ n) { n.?(z: n, s: loop(n.s)); };
        // loop(number)
        let ntype = e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![arg(unit_type(), n("z")), arg(tvar("N"), n("s"))],
        ));
        let ftype = e(ExprBody::FuncType(tvar("N"), tvar("N")));
        let body = e(ExprBody::UnionSelect(
            var("n"),
            vec![
                ast::SelectChoice { name: n("z"), expr: var("n") },
                ast::SelectChoice {
                    name: n("s"),
                    expr: apply(var("loop"), vec![e(ExprBody::DataAccess(var("n"), n("s")))]),
                },
            ],
            None,
        ));
        let loop_value = e(ExprBody::FuncValue(vec![arg(tvar("N"), n("n"))], body));

        let mut number = e(ExprBody::UnionValue(tvar("N"), n("z"), unit_value()));
        for _ in 0..1000 {
            number = e(ExprBody::UnionValue(tvar("N"), n("s"), number));
        }

        let expr = let_(
            vec![tbind("N", ntype)],
            let_(
                vec![vbind(ftype, "loop", loop_value)],
                apply(var("loop"), vec![number]),
            ),
        );

        let (heap, result) = run(expr).unwrap();
        assert_eq!(heap.union_tag(result), Some(0));

        // The compiled loop body ends in a tail call.
        let compiled = compile_program(&main_program(let_(
            vec![tbind("N", e(ExprBody::DataType(
                DataTypeTag::Union,
                vec![arg(unit_type(), n("z")), arg(tvar("N"), n("s"))],
            )))],
            let_(
                vec![vbind(
                    e(ExprBody::FuncType(tvar("N"), tvar("N"))),
                    "loop",
                    e(ExprBody::FuncValue(
                        vec![arg(tvar("N"), n("n"))],
                        e(ExprBody::UnionSelect(
                            var("n"),
                            vec![
                                ast::SelectChoice { name: n("z"), expr: var("n") },
                                ast::SelectChoice {
                                    name: n("s"),
                                    expr: apply(
                                        var("loop"),
                                        vec![e(ExprBody::DataAccess(var("n"), n("s")))],
                                    ),
                                },
                            ],
                            None,
                        )),
                    )),
                )],
                var("loop"),
            ),
        )))
        .unwrap();

        let code = &compiled.modules[0].code;
        let mut found_tail_call = false;
        for inner in code.reachable() {
            for instr in inner.instrs.iter() {
                if matches!(instr.op, Op::TailCall { .. }) {
                    found_tail_call = true;
                }
            }
        }
        assert!(found_tail_call);
    }

    #[test]
    fn test_eval_multi_module() {
        // /Lib% defines a bool; /Main% re-exports it.
        let lib = LoadedModule {
            path: ModulePath::parse("/Lib%").unwrap(),
            deps: vec![],
            type_: None,
            value: Some(let_(
                vec![tbind("B", bool_type())],
                e(ExprBody::UnionValue(tvar("B"), n("false"), unit_value())),
            )),
        };
        let main = LoadedModule {
            path: ModulePath::parse("/Main%").unwrap(),
            deps: vec![ModulePath::parse("/Lib%").unwrap()],
            type_: None,
            value: Some(e(ExprBody::ModulePath(ModulePath::parse("/Lib%").unwrap()))),
        };

        let program = LoadedProgram { modules: vec![lib, main] };
        let compiled = compile_program(&program).unwrap();
        let executable = program::interpret(&compiled);
        let mut heap = ValueHeap::new();
        let linked = program::link(&mut heap, &executable, None).unwrap();
        let result = function::eval(&mut heap, linked, None).unwrap();
        assert_eq!(heap.union_tag(result), Some(1));
    }

    #[test]
    fn test_profile_blocks_name_chain() {
        // Nested lets and functions produce dotted block names with '!'
        // for function bodies.
        let expr = let_(
            vec![kbind(
                "f",
                e(ExprBody::FuncValue(vec![arg(unit_type(), n("x"))], var("x"))),
            )],
            apply(var("f"), vec![unit_value()]),
        );
        let compiled = compile_program(&main_program(expr)).unwrap();
        let names: Vec<String> = compiled.modules[0]
            .profile_blocks
            .iter()
            .map(|name| String::from(&*name.name))
            .collect();

        assert!(names.contains(&String::from("/Main%")));
        assert!(names.contains(&String::from("/Main%.f")));
        assert!(names.contains(&String::from("/Main%.f!")));
    }
}
