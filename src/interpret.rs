// The bytecode interpreter.
//
// Code implements Executable by walking its instruction array with a
// program counter. The native backends emit the same behavior; anything
// observable here must hold there too.

use std::sync::Arc;

use crate::code::{Code, Op, ProfileOp};
use crate::function::{call, tail_call, Exec, Executable, Function, Profiling};
use crate::value::{Value, ValueHeap, GENERIC_TYPE, UNDEFINED, WRONG_UNION_TAG};
use crate::var::{Var, VarSource};


fn get(statics: &[Value], args: &[Value], locals: &[Value], var: Var) -> Value {
    match var.source {
        VarSource::Static => statics[var.index],
        VarSource::Arg => args[var.index],
        VarSource::Local => locals[var.index],
    }
}


impl Executable for Code {
    fn num_args(&self) -> usize {
        self.num_args
    }

    fn num_statics(&self) -> usize {
        self.num_statics
    }

    fn max_call_args(&self) -> usize {
        self.max_call_args
    }

    fn run(
        &self,
        heap: &mut ValueHeap,
        profile: &mut Profiling,
        function: &Function,
        args: &[Value],
    ) -> Exec {
        let statics = &function.statics;
        let mut locals = vec![UNDEFINED; self.num_locals];

        // Block ids in the code are relative to the module; the function
        // carries the absolute id assigned at link time.
        let block_offset = function.profile_block_id - self.profile_block_id;

        let mut pc = 0;
        loop {
            let instr = &self.instrs[pc];

            for op in instr.profile_ops.iter() {
                match op {
                    ProfileOp::Enter(block) => profile.enter(block_offset + block),
                    ProfileOp::Replace(block) => profile.replace(block_offset + block),
                    ProfileOp::Exit => profile.exit(),
                    ProfileOp::Sample(weight) => profile.sample(*weight),
                }
            }

            match &instr.op {
                Op::Struct { dst, args: sargs } => {
                    let vals: Vec<Value> =
                        sargs.iter().map(|v| get(statics, args, &locals, *v)).collect();
                    locals[*dst] = heap.new_struct_value(&vals);
                    pc += 1;
                }

                Op::Union { dst, tag, arg } => {
                    let arg = get(statics, args, &locals, *arg);
                    locals[*dst] = heap.new_union_value(*tag, arg);
                    pc += 1;
                }

                Op::StructAccess { dst, obj, tag, loc } => {
                    let sv = heap.strict_value(get(statics, args, &locals, *obj));
                    if sv.is_undefined() {
                        loc.report_error("undefined struct value access");
                        return run_abort(self, &mut locals, pc);
                    }
                    locals[*dst] = heap.struct_field(sv, *tag);
                    pc += 1;
                }

                Op::UnionAccess { dst, obj, tag, loc } => {
                    let uv = heap.strict_value(get(statics, args, &locals, *obj));
                    if uv.is_undefined() {
                        loc.report_error("undefined union value access");
                        return run_abort(self, &mut locals, pc);
                    }

                    let field = heap.union_field(uv, *tag);
                    if field == WRONG_UNION_TAG {
                        loc.report_error("union field access undefined: wrong tag");
                        return run_abort(self, &mut locals, pc);
                    }
                    locals[*dst] = field;
                    pc += 1;
                }

                Op::UnionSelect { condition, targets, default_pc, loc, .. } => {
                    let uv = heap.strict_value(get(statics, args, &locals, *condition));
                    if uv.is_undefined() {
                        loc.report_error("undefined union value select");
                        return run_abort(self, &mut locals, pc);
                    }

                    let tag = heap.union_tag(uv).unwrap();
                    pc = match targets.binary_search_by_key(&tag, |&(t, _)| t) {
                        Ok(i) => targets[i].1,
                        Err(_) => *default_pc,
                    };
                }

                Op::Goto { pc: target } => {
                    pc = *target;
                }

                Op::FuncValue { dst, code, scope } => {
                    let func_statics: Vec<Value> =
                        scope.iter().map(|v| get(statics, args, &locals, *v)).collect();
                    locals[*dst] = heap.new_func_value(
                        Arc::clone(code) as Arc<dyn Executable>,
                        block_offset + code.profile_block_id,
                        func_statics,
                    );
                    pc += 1;
                }

                Op::Call { dst, func, args: cargs, loc } => {
                    let f = heap.strict_value(get(statics, args, &locals, *func));
                    if f.is_undefined() {
                        loc.report_error("called undefined function");
                        return run_abort(self, &mut locals, pc);
                    }

                    let vals: Vec<Value> =
                        cargs.iter().map(|v| get(statics, args, &locals, *v)).collect();

                    pc += 1;
                    locals[*dst] = call(heap, profile, f, &vals);
                    if locals[*dst].is_undefined() {
                        return run_abort(self, &mut locals, pc);
                    }
                }

                Op::TailCall { func, args: cargs, loc } => {
                    let f = heap.strict_value(get(statics, args, &locals, *func));
                    if f.is_undefined() {
                        loc.report_error("called undefined function");
                        return run_abort(self, &mut locals, pc);
                    }

                    let vals: Vec<Value> =
                        cargs.iter().map(|v| get(statics, args, &locals, *v)).collect();

                    // Pass the unstripped function so a call through a
                    // reference compacts the frame properly.
                    let f = get(statics, args, &locals, *func);
                    return tail_call(heap, f, &vals);
                }

                Op::Copy { dst, src } => {
                    locals[*dst] = get(statics, args, &locals, *src);
                    pc += 1;
                }

                Op::RefValue { dst } => {
                    locals[*dst] = heap.new_ref_value();
                    pc += 1;
                }

                Op::RefDef { ref_, value, loc } => {
                    let value = get(statics, args, &locals, *value);
                    if !heap.assign_ref_value(locals[*ref_], value) {
                        loc.report_error("vacuous value");
                        return run_abort(self, &mut locals, pc);
                    }
                    pc += 1;
                }

                Op::Return { result } => {
                    return Exec::Done(get(statics, args, &locals, *result));
                }

                Op::Type { dst } => {
                    locals[*dst] = GENERIC_TYPE;
                    pc += 1;
                }

                Op::Retain { .. } => {
                    pc += 1;
                }

                Op::Release { targets } => {
                    for target in targets.iter() {
                        locals[*target] = UNDEFINED;
                    }
                    pc += 1;
                }

                Op::List { dst, args: largs } => {
                    let vals: Vec<Value> =
                        largs.iter().map(|v| get(statics, args, &locals, *v)).collect();
                    locals[*dst] = heap.new_list_value(&vals);
                    pc += 1;
                }

                Op::Literal { dst, letters } => {
                    locals[*dst] = heap.new_literal_value(letters);
                    pc += 1;
                }

                Op::Nop => {
                    pc += 1;
                }
            }
        }
    }
}


// Unwind an aborting activation.
//
// Execute the remaining instructions only as far as needed to keep the
// local slot discipline sound: no allocations, no calls. Values normally
// expected in a local may be left undefined.
fn run_abort(code: &Code, locals: &mut [Value], pc: usize) -> Exec {
    let mut pc = pc;
    loop {
        assert!(pc < code.instrs.len(), "missing return instruction");
        match &code.instrs[pc].op {
            Op::Struct { dst, .. }
            | Op::Union { dst, .. }
            | Op::StructAccess { dst, .. }
            | Op::UnionAccess { dst, .. }
            | Op::FuncValue { dst, .. }
            | Op::Call { dst, .. }
            | Op::Copy { dst, .. }
            | Op::RefValue { dst }
            | Op::Type { dst }
            | Op::List { dst, .. }
            | Op::Literal { dst, .. } => {
                locals[*dst] = UNDEFINED;
                pc += 1;
            }

            // All branches clean up the same way; follow the default.
            Op::UnionSelect { default_pc, .. } => {
                pc = *default_pc;
            }

            Op::Goto { pc: target } => {
                pc = *target;
            }

            Op::TailCall { .. } => {
                return Exec::Done(UNDEFINED);
            }

            Op::Return { .. } => {
                return Exec::Done(UNDEFINED);
            }

            Op::RefDef { .. } | Op::Retain { .. } | Op::Nop => {
                pc += 1;
            }

            Op::Release { targets } => {
                for target in targets.iter() {
                    locals[*target] = UNDEFINED;
                }
                pc += 1;
            }
        }
    }
}
