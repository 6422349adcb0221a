// The AArch64 backend.
//
// Lowers compiled bytecode to 64-bit ARM assembly with the same behavior
// as the interpreter and the C backend. Each Code object becomes one run
// function and one abort function; union selects compile to a binary
// search tree of compares over the tag. DWARF line information maps the
// generated code back to fble source so native code can be debugged at the
// source level.
//
// Callee saved registers are assigned for the duration of a run function:
//
//   R_HEAP (x19)                  the value heap
//   R_PROFILE (x20)               profile thread, or NULL
//   R_TAIL_CALL_BUFFER (x21)      the tail call buffer
//   R_ARGS (x22)                  function arguments
//   R_STATICS (x23)               function statics
//   R_LOCALS (x24)                local variables, on the stack
//   R_PROFILE_BLOCK_OFFSET (x25)  block id offset for this module
//   R_SCRATCH_0 (x26)             instruction scratch

use std::fmt::{self, Write};
use std::sync::Arc;

use crate::code::{Code, DebugInfo, Op, ProfileOp};
use crate::name::{ModulePath, Name};
use crate::program::CompiledModule;
use crate::var::{Var, VarSource};

use crate::generate_c::label_for_path;


// Offsets into the runtime's FbleFunction struct.
const FUNCTION_PROFILE_BLOCK_OFFSET: usize = 8;
const FUNCTION_STATICS: usize = 16;


fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}


fn run_name(blocks: &[Name], code: &Code) -> String {
    let block = &blocks[code.profile_block_id];
    format!("_Run.{}_{:04x}", sanitize(&block.name), code.profile_block_id)
}


// Bytes of stack space for count values, kept 16 byte aligned.
fn stack_bytes(count: usize) -> usize {
    16 * ((count + 1) / 2)
}


struct Generator {
    out: String,
}


impl Generator {
    // Load a frame variable into the given register.
    fn get_frame_var(&mut self, reg: &str, var: Var) {
        let base = match var.source {
            VarSource::Static => "R_STATICS",
            VarSource::Arg => "R_ARGS",
            VarSource::Local => "R_LOCALS",
        };
        let _ = writeln!(self.out, "  ldr {}, [{}, #{}]", reg, base, 8 * var.index);
    }

    // Store the given register to a local slot.
    fn set_frame_var(&mut self, reg: &str, dst: usize) {
        let _ = writeln!(self.out, "  str {}, [R_LOCALS, #{}]", reg, 8 * dst);
    }

    // Load the address of a label.
    fn adr(&mut self, reg: &str, label: &str) {
        let _ = writeln!(self.out, "  adrp {}, {}", reg, label);
        let _ = writeln!(self.out, "  add {}, {}, :lo12:{}", reg, reg, label);
    }
}


// Emit a binary search over sorted (tag, target) pairs, with the tag in
// x0. Misses branch to the default pc.
fn emit_search(
    gen: &mut Generator,
    prefix: &str,
    pc: usize,
    label: &mut usize,
    targets: &[(usize, usize)],
    default_pc: usize,
) {
    if targets.is_empty() {
        let _ = writeln!(gen.out, "  b {}.pc.{}", prefix, default_pc);
        return;
    }

    let mid = targets.len() / 2;
    let (tag, target) = targets[mid];
    let _ = writeln!(gen.out, "  cmp x0, #{}", tag);
    let _ = writeln!(gen.out, "  b.eq {}.pc.{}", prefix, target);

    let (left, right) = (&targets[..mid], &targets[mid + 1..]);
    if left.is_empty() && right.is_empty() {
        let _ = writeln!(gen.out, "  b {}.pc.{}", prefix, default_pc);
        return;
    }

    let low_label = *label;
    *label += 1;
    let _ = writeln!(gen.out, "  b.cc {}.pc.{}.s{}", prefix, pc, low_label);
    emit_search(gen, prefix, pc, label, right, default_pc);
    let _ = writeln!(gen.out, "{}.pc.{}.s{}:", prefix, pc, low_label);
    emit_search(gen, prefix, pc, label, left, default_pc);
}


// Pending out-of-line code: abort handlers and profiling blocks that are
// kept off the main execution path.
enum Outline {
    // Report an error and abort: label, message label, loc, pc.
    Abort { label: String, message: &'static str, line: usize, col: usize, pc: usize },

    // Run profiling ops, then return to the main path.
    Profile { label: String, ops: Vec<ProfileOp>, ret: String },
}


fn emit_code(gen: &mut Generator, blocks: &[Name], code: &Arc<Code>) {
    let run = run_name(blocks, code);
    let prefix = format!(".L.{}", run);
    let locals_bytes = stack_bytes(code.num_locals);

    let _ = writeln!(gen.out, "  .text");
    let _ = writeln!(gen.out, "  .align 2");
    let _ = writeln!(gen.out, "  .global {}", run);
    let _ = writeln!(gen.out, "{}:", run);

    // Prologue: save callee saved registers, set up the frame.
    let _ = writeln!(gen.out, "  stp x29, x30, [SP, #-80]!");
    let _ = writeln!(gen.out, "  mov x29, SP");
    let _ = writeln!(gen.out, "  stp x19, x20, [SP, #16]");
    let _ = writeln!(gen.out, "  stp x21, x22, [SP, #32]");
    let _ = writeln!(gen.out, "  stp x23, x24, [SP, #48]");
    let _ = writeln!(gen.out, "  stp x25, x26, [SP, #64]");

    let _ = writeln!(gen.out, "  mov R_HEAP, x0");
    let _ = writeln!(gen.out, "  mov R_PROFILE, x1");
    let _ = writeln!(gen.out, "  mov R_TAIL_CALL_BUFFER, x2");
    let _ = writeln!(gen.out, "  mov R_ARGS, x4");
    let _ = writeln!(
        gen.out,
        "  ldr R_STATICS, [x3, #{}]",
        FUNCTION_STATICS
    );
    let _ = writeln!(
        gen.out,
        "  ldr R_PROFILE_BLOCK_OFFSET, [x3, #{}]",
        FUNCTION_PROFILE_BLOCK_OFFSET
    );
    if locals_bytes > 0 {
        let _ = writeln!(gen.out, "  sub SP, SP, #{}", locals_bytes);
    }
    let _ = writeln!(gen.out, "  mov R_LOCALS, SP");

    let mut outline: Vec<Outline> = Vec::new();
    let mut label = 0;

    for (pc, instr) in code.instrs.iter().enumerate() {
        let _ = writeln!(gen.out, "{}.pc.{}:", prefix, pc);

        // DWARF line information for the start of each statement.
        for info in instr.debug_info.iter() {
            if let DebugInfo::Statement(loc) = info {
                let _ = writeln!(gen.out, "  .loc 1 {} {}", loc.line, loc.col);
            }
        }

        if !instr.profile_ops.is_empty() {
            let prof = format!("{}.pc.{}.prof", prefix, pc);
            let post = format!("{}.pc.{}.postprof", prefix, pc);
            let _ = writeln!(gen.out, "  cbnz R_PROFILE, {}", prof);
            let _ = writeln!(gen.out, "{}:", post);
            outline.push(Outline::Profile {
                label: prof,
                ops: instr.profile_ops.clone(),
                ret: post,
            });
        }

        let mut abort_to = |outline: &mut Vec<Outline>,
                            kind: &str,
                            message: &'static str,
                            loc: &crate::name::Loc|
         -> String {
            let label = format!("{}.pc.{}.{}", prefix, pc, kind);
            outline.push(Outline::Abort {
                label: label.clone(),
                message,
                line: loc.line,
                col: loc.col,
                pc,
            });
            label
        };

        match &instr.op {
            Op::Struct { dst, args } => {
                let sp_offset = stack_bytes(args.len());
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                }
                for (i, arg) in args.iter().enumerate() {
                    gen.get_frame_var("x0", *arg);
                    let _ = writeln!(gen.out, "  str x0, [SP, #{}]", 8 * i);
                }
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, #{}", args.len());
                let _ = writeln!(gen.out, "  mov x2, SP");
                let _ = writeln!(gen.out, "  bl FbleNewStructValue");
                gen.set_frame_var("x0", *dst);
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
                }
            }

            Op::Union { dst, tag, arg } => {
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, #{}", tag);
                gen.get_frame_var("x2", *arg);
                let _ = writeln!(gen.out, "  bl FbleNewUnionValue");
                gen.set_frame_var("x0", *dst);
            }

            Op::StructAccess { dst, obj, tag, loc } => {
                let undef = abort_to(
                    &mut outline,
                    "undef",
                    "UndefinedStructValue",
                    loc,
                );
                gen.get_frame_var("x0", *obj);
                let _ = writeln!(gen.out, "  bl FbleStrictValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", undef);
                let _ = writeln!(gen.out, "  mov x1, #{}", tag);
                let _ = writeln!(gen.out, "  bl FbleStructValueField");
                gen.set_frame_var("x0", *dst);
            }

            Op::UnionAccess { dst, obj, tag, loc } => {
                let undef = abort_to(&mut outline, "undef", "UndefinedUnionValue", loc);
                let badtag = abort_to(&mut outline, "badtag", "WrongUnionTag", loc);

                gen.get_frame_var("x0", *obj);
                let _ = writeln!(gen.out, "  bl FbleStrictValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", undef);
                let _ = writeln!(gen.out, "  mov R_SCRATCH_0, x0");
                let _ = writeln!(gen.out, "  bl FbleUnionValueTag");
                let _ = writeln!(gen.out, "  cmp x0, #{}", tag);
                let _ = writeln!(gen.out, "  b.ne {}", badtag);
                let _ = writeln!(gen.out, "  mov x0, R_SCRATCH_0");
                let _ = writeln!(gen.out, "  bl FbleUnionValueArg");
                gen.set_frame_var("x0", *dst);
            }

            Op::UnionSelect { condition, targets, default_pc, loc, .. } => {
                let undef = abort_to(&mut outline, "undef", "UndefinedUnionSelect", loc);
                gen.get_frame_var("x0", *condition);
                let _ = writeln!(gen.out, "  bl FbleStrictValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", undef);
                let _ = writeln!(gen.out, "  bl FbleUnionValueTag");
                emit_search(gen, &prefix, pc, &mut label, targets, *default_pc);
            }

            Op::Goto { pc: target } => {
                let _ = writeln!(gen.out, "  b {}.pc.{}", prefix, target);
            }

            Op::FuncValue { dst, code: func, scope } => {
                // Static executable data for the allocated function.
                let exe = format!("{}.pc.{}.exe", prefix, pc);
                let _ = writeln!(gen.out, "  .section .data");
                let _ = writeln!(gen.out, "  .align 3");
                let _ = writeln!(gen.out, "{}:", exe);
                let _ = writeln!(gen.out, "  .xword 1"); // refcount
                let _ = writeln!(gen.out, "  .xword 0x45584543"); // magic
                let _ = writeln!(gen.out, "  .xword {}", func.num_args);
                let _ = writeln!(gen.out, "  .xword {}", func.num_statics);
                let _ = writeln!(gen.out, "  .xword {}", func.max_call_args + 2);
                let _ = writeln!(gen.out, "  .xword {}", func.profile_block_id);
                let _ = writeln!(gen.out, "  .xword {}", run_name(blocks, func));
                let _ = writeln!(gen.out, "  .xword 0"); // on_free
                let _ = writeln!(gen.out, "  .text");
                let _ = writeln!(gen.out, "  .align 2");

                let sp_offset = stack_bytes(scope.len());
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                }
                for (i, var) in scope.iter().enumerate() {
                    gen.get_frame_var("x0", *var);
                    let _ = writeln!(gen.out, "  str x0, [SP, #{}]", 8 * i);
                }

                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                gen.adr("x1", &exe);
                let _ = writeln!(gen.out, "  mov x2, R_PROFILE_BLOCK_OFFSET");
                let _ = writeln!(gen.out, "  mov x3, SP");
                let _ = writeln!(gen.out, "  bl FbleNewFuncValue");
                gen.set_frame_var("x0", *dst);
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
                }
            }

            Op::Call { dst, func, args, loc } => {
                let undef =
                    abort_to(&mut outline, "undef", "UndefinedFunctionValue", loc);
                let aborted = abort_to(&mut outline, "abort", "CalleeAborted", loc);

                gen.get_frame_var("x0", *func);
                let _ = writeln!(gen.out, "  bl FbleStrictValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", undef);
                let _ = writeln!(gen.out, "  mov R_SCRATCH_0, x0");

                let sp_offset = stack_bytes(args.len());
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                }
                for (i, arg) in args.iter().enumerate() {
                    gen.get_frame_var("x0", *arg);
                    let _ = writeln!(gen.out, "  str x0, [SP, #{}]", 8 * i);
                }

                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, R_PROFILE");
                let _ = writeln!(gen.out, "  mov x2, R_SCRATCH_0");
                let _ = writeln!(gen.out, "  mov x3, #{}", args.len());
                let _ = writeln!(gen.out, "  mov x4, SP");
                let _ = writeln!(gen.out, "  bl FbleCall");
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
                }
                gen.set_frame_var("x0", *dst);
                let _ = writeln!(gen.out, "  cbz x0, {}", aborted);
            }

            Op::TailCall { func, args, loc } => {
                let undef =
                    abort_to(&mut outline, "undef", "UndefinedFunctionValue", loc);

                gen.get_frame_var("x0", *func);
                let _ = writeln!(gen.out, "  bl FbleStrictValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", undef);

                // Buffer the callee and arguments for the caller.
                gen.get_frame_var("x0", *func);
                let _ = writeln!(gen.out, "  str x0, [R_TAIL_CALL_BUFFER, #0]");
                for (i, arg) in args.iter().enumerate() {
                    gen.get_frame_var("x0", *arg);
                    let _ = writeln!(
                        gen.out,
                        "  str x0, [R_TAIL_CALL_BUFFER, #{}]",
                        8 * (i + 1)
                    );
                }
                let _ = writeln!(
                    gen.out,
                    "  str xzr, [R_TAIL_CALL_BUFFER, #{}]",
                    8 * (args.len() + 1)
                );

                gen.adr("x0", "FbleTailCallSentinelValue");
                let _ = writeln!(gen.out, "  ldr x0, [x0]");
                let _ = writeln!(gen.out, "  b {}.exit", prefix);
            }

            Op::Copy { dst, src } => {
                gen.get_frame_var("x1", *src);
                gen.set_frame_var("x1", *dst);
            }

            Op::RefValue { dst } => {
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  bl FbleNewRefValue");
                gen.set_frame_var("x0", *dst);
            }

            Op::RefDef { ref_, value, loc } => {
                let vacuous = abort_to(&mut outline, "vacuous", "VacuousValue", loc);
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                gen.get_frame_var("x1", Var::local(*ref_));
                gen.get_frame_var("x2", *value);
                let _ = writeln!(gen.out, "  bl FbleAssignRefValue");
                let _ = writeln!(gen.out, "  cbz x0, {}", vacuous);
            }

            Op::Return { result } => {
                gen.get_frame_var("x0", *result);
                let _ = writeln!(gen.out, "  b {}.exit", prefix);
            }

            Op::Type { dst } => {
                gen.adr("x0", "FbleGenericTypeValue");
                let _ = writeln!(gen.out, "  ldr x0, [x0]");
                gen.set_frame_var("x0", *dst);
            }

            Op::Retain { target } => {
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                gen.get_frame_var("x1", *target);
                let _ = writeln!(gen.out, "  bl FbleRetainValue");
            }

            Op::Release { targets } => {
                let sp_offset = stack_bytes(targets.len());
                let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                for (i, target) in targets.iter().enumerate() {
                    gen.get_frame_var("x9", Var::local(*target));
                    let _ = writeln!(gen.out, "  str x9, [SP, #{}]", 8 * i);
                }
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, #{}", targets.len());
                let _ = writeln!(gen.out, "  mov x2, SP");
                let _ = writeln!(gen.out, "  bl FbleReleaseValues");
                let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
            }

            Op::List { dst, args } => {
                let sp_offset = stack_bytes(args.len());
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                }
                for (i, arg) in args.iter().enumerate() {
                    gen.get_frame_var("x9", *arg);
                    let _ = writeln!(gen.out, "  str x9, [SP, #{}]", 8 * i);
                }
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, #{}", args.len());
                let _ = writeln!(gen.out, "  mov x2, SP");
                let _ = writeln!(gen.out, "  bl FbleNewListValue");
                gen.set_frame_var("x0", *dst);
                if sp_offset > 0 {
                    let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
                }
            }

            Op::Literal { dst, letters } => {
                let lit = format!("{}.pc.{}.letters", prefix, pc);
                let _ = writeln!(gen.out, "  .section .data");
                let _ = writeln!(gen.out, "  .align 3");
                let _ = writeln!(gen.out, "{}:", lit);
                for letter in letters.iter() {
                    let _ = writeln!(gen.out, "  .xword {}", letter);
                }
                let _ = writeln!(gen.out, "  .text");
                let _ = writeln!(gen.out, "  .align 2");
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, #{}", letters.len());
                gen.adr("x2", &lit);
                let _ = writeln!(gen.out, "  bl FbleNewLiteralValue");
                gen.set_frame_var("x0", *dst);
            }

            Op::Nop => (),
        }
    }

    // Epilogue.
    let _ = writeln!(gen.out, "{}.exit:", prefix);
    if locals_bytes > 0 {
        let _ = writeln!(gen.out, "  add SP, SP, #{}", locals_bytes);
    }
    let _ = writeln!(gen.out, "  ldp x19, x20, [SP, #16]");
    let _ = writeln!(gen.out, "  ldp x21, x22, [SP, #32]");
    let _ = writeln!(gen.out, "  ldp x23, x24, [SP, #48]");
    let _ = writeln!(gen.out, "  ldp x25, x26, [SP, #64]");
    let _ = writeln!(gen.out, "  ldp x29, x30, [SP], #80");
    let _ = writeln!(gen.out, "  ret");

    // Out-of-line code.
    for chunk in outline {
        match chunk {
            Outline::Abort { label, message, line, col, pc } => {
                let _ = writeln!(gen.out, "{}:", label);
                gen.adr("x0", &format!(".L.str.{}", message));
                let _ = writeln!(gen.out, "  mov x1, #{}", line);
                let _ = writeln!(gen.out, "  mov x2, #{}", col);
                let _ = writeln!(gen.out, "  bl .L.ReportAbort");
                let _ = writeln!(gen.out, "  mov x0, R_HEAP");
                let _ = writeln!(gen.out, "  mov x1, R_STATICS");
                let _ = writeln!(gen.out, "  mov x2, R_ARGS");
                let _ = writeln!(gen.out, "  mov x3, R_LOCALS");
                let _ = writeln!(gen.out, "  mov x4, #{}", pc);
                let _ = writeln!(gen.out, "  bl {}.abort", run);
                let _ = writeln!(gen.out, "  b {}.exit", prefix);
            }

            Outline::Profile { label, ops, ret } => {
                let _ = writeln!(gen.out, "{}:", label);
                for op in ops {
                    match op {
                        ProfileOp::Enter(block) => {
                            let _ = writeln!(gen.out, "  mov x0, R_PROFILE");
                            let _ = writeln!(
                                gen.out,
                                "  add x1, R_PROFILE_BLOCK_OFFSET, #{}",
                                block
                            );
                            let _ = writeln!(gen.out, "  bl FbleProfileEnterBlock");
                        }
                        ProfileOp::Replace(block) => {
                            let _ = writeln!(gen.out, "  mov x0, R_PROFILE");
                            let _ = writeln!(
                                gen.out,
                                "  add x1, R_PROFILE_BLOCK_OFFSET, #{}",
                                block
                            );
                            let _ = writeln!(gen.out, "  bl FbleProfileReplaceBlock");
                        }
                        ProfileOp::Exit => {
                            let _ = writeln!(gen.out, "  mov x0, R_PROFILE");
                            let _ = writeln!(gen.out, "  bl FbleProfileExitBlock");
                        }
                        ProfileOp::Sample(weight) => {
                            let _ = writeln!(gen.out, "  mov x0, R_PROFILE");
                            let _ = writeln!(gen.out, "  mov x1, #{}", weight);
                            let _ = writeln!(gen.out, "  bl FbleProfileRandomSample");
                        }
                    }
                }
                let _ = writeln!(gen.out, "  b {}", ret);
            }
        }
    }
    let _ = writeln!(gen.out);
}


// The abort function: x0 = heap, x1 = statics, x2 = args, x3 = locals,
// x4 = pc. Cleans up local variables and returns NULL.
fn emit_code_for_abort(gen: &mut Generator, blocks: &[Name], code: &Arc<Code>) {
    let run = run_name(blocks, code);
    let prefix = format!(".L.{}.abort", run);

    let _ = writeln!(gen.out, "  .text");
    let _ = writeln!(gen.out, "  .align 2");
    let _ = writeln!(gen.out, "{}.abort:", run);
    let _ = writeln!(gen.out, "  stp x29, x30, [SP, #-32]!");
    let _ = writeln!(gen.out, "  mov x29, SP");
    let _ = writeln!(gen.out, "  stp x19, x20, [SP, #16]");
    let _ = writeln!(gen.out, "  mov x19, x0"); // heap
    let _ = writeln!(gen.out, "  mov x20, x3"); // locals

    for pc in 0..code.instrs.len() {
        let _ = writeln!(gen.out, "  cmp x4, #{}", pc);
        let _ = writeln!(gen.out, "  b.eq {}.pc.{}", prefix, pc);
    }

    for (pc, instr) in code.instrs.iter().enumerate() {
        let _ = writeln!(gen.out, "{}.pc.{}:", prefix, pc);
        match &instr.op {
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
                let _ = writeln!(gen.out, "  str xzr, [x20, #{}]", 8 * dst);
            }

            Op::UnionSelect { default_pc, .. } => {
                let _ = writeln!(gen.out, "  b {}.pc.{}", prefix, default_pc);
            }

            Op::Goto { pc: target } => {
                let _ = writeln!(gen.out, "  b {}.pc.{}", prefix, target);
            }

            Op::TailCall { .. } | Op::Return { .. } => {
                let _ = writeln!(gen.out, "  b {}.done", prefix);
            }

            Op::Release { targets } => {
                let sp_offset = stack_bytes(targets.len());
                let _ = writeln!(gen.out, "  sub SP, SP, #{}", sp_offset);
                for (i, target) in targets.iter().enumerate() {
                    let _ = writeln!(gen.out, "  ldr x9, [x20, #{}]", 8 * target);
                    let _ = writeln!(gen.out, "  str x9, [SP, #{}]", 8 * i);
                }
                let _ = writeln!(gen.out, "  mov x0, x19");
                let _ = writeln!(gen.out, "  mov x1, #{}", targets.len());
                let _ = writeln!(gen.out, "  mov x2, SP");
                let _ = writeln!(gen.out, "  bl FbleReleaseValues");
                let _ = writeln!(gen.out, "  add SP, SP, #{}", sp_offset);
            }

            Op::RefDef { .. } | Op::Retain { .. } | Op::Nop => (),
        }
    }

    let _ = writeln!(gen.out, "{}.done:", prefix);
    let _ = writeln!(gen.out, "  mov x0, #0");
    let _ = writeln!(gen.out, "  ldp x19, x20, [SP, #16]");
    let _ = writeln!(gen.out, "  ldp x29, x30, [SP], #32");
    let _ = writeln!(gen.out, "  ret");
    let _ = writeln!(gen.out);
}


// Static data for a module path: an FbleModulePath the runtime can use
// directly.
fn emit_module_path(gen: &mut Generator, label: &str, path: &ModulePath) {
    let _ = writeln!(gen.out, "  .section .data");
    let _ = writeln!(gen.out, "  .align 3");

    let _ = writeln!(gen.out, "{}.src:", label);
    let _ = writeln!(gen.out, "  .xword 1");
    let _ = writeln!(gen.out, "  .xword 0x53545247"); // string magic
    let _ = writeln!(gen.out, "  .string \"{}\"", path.loc.source);
    let _ = writeln!(gen.out, "  .align 3");

    for (i, name) in path.path.iter().enumerate() {
        let _ = writeln!(gen.out, "{}.name.{}.str:", label, i);
        let _ = writeln!(gen.out, "  .xword 1");
        let _ = writeln!(gen.out, "  .xword 0x53545247");
        let _ = writeln!(gen.out, "  .string \"{}\"", name.name);
        let _ = writeln!(gen.out, "  .align 3");
    }

    let _ = writeln!(gen.out, "{}.names:", label);
    for (i, name) in path.path.iter().enumerate() {
        let _ = writeln!(gen.out, "  .xword {}.name.{}.str + 16", label, i);
        let _ = writeln!(gen.out, "  .xword 0"); // normal namespace
        let _ = writeln!(gen.out, "  .xword {}.src + 16", label);
        let _ = writeln!(gen.out, "  .xword {}", name.loc.line);
        let _ = writeln!(gen.out, "  .xword {}", name.loc.col);
    }

    let _ = writeln!(gen.out, "{}:", label);
    let _ = writeln!(gen.out, "  .xword 1"); // refcount
    let _ = writeln!(gen.out, "  .xword 0x77806584"); // module path magic
    let _ = writeln!(gen.out, "  .xword {}.src + 16", label);
    let _ = writeln!(gen.out, "  .xword {}", path.loc.line);
    let _ = writeln!(gen.out, "  .xword {}", path.loc.col);
    let _ = writeln!(gen.out, "  .xword {}", path.path.len());
    let _ = writeln!(gen.out, "  .xword {}.names", label);
}


// Generate AArch64 assembly for a compiled module.
pub fn generate_aarch64(out: &mut impl fmt::Write, module: &CompiledModule) -> fmt::Result {
    let mut gen = Generator { out: String::new() };

    // Register aliases.
    for (alias, reg) in [
        ("R_HEAP", "x19"),
        ("R_PROFILE", "x20"),
        ("R_TAIL_CALL_BUFFER", "x21"),
        ("R_ARGS", "x22"),
        ("R_STATICS", "x23"),
        ("R_LOCALS", "x24"),
        ("R_PROFILE_BLOCK_OFFSET", "x25"),
        ("R_SCRATCH_0", "x26"),
    ] {
        let _ = writeln!(gen.out, "  {} .req {}", alias, reg);
    }
    let _ = writeln!(gen.out);

    // DWARF file table: every location in this module comes from the
    // module's source file.
    let _ = writeln!(gen.out, "  .file 1 \"{}\"", module.path.loc.source);
    let _ = writeln!(gen.out);

    // Abort message strings.
    let _ = writeln!(gen.out, "  .section .data");
    for (label, message) in [
        ("CalleeAborted", "callee aborted"),
        ("UndefinedStructValue", "undefined struct value access"),
        ("UndefinedUnionValue", "undefined union value access"),
        ("UndefinedUnionSelect", "undefined union value select"),
        ("WrongUnionTag", "union field access undefined: wrong tag"),
        ("UndefinedFunctionValue", "called undefined function"),
        ("VacuousValue", "vacuous value"),
    ] {
        let _ = writeln!(gen.out, ".L.str.{}:", label);
        let _ = writeln!(gen.out, "  .string \"{}\"", message);
    }
    let _ = writeln!(gen.out, ".L.str.source:");
    let _ = writeln!(gen.out, "  .string \"{}\"", module.path.loc.source);
    let _ = writeln!(gen.out, ".L.str.abortfmt:");
    let _ = writeln!(gen.out, "  .string \"%s:%d:%d: error: %s\\n\"");
    let _ = writeln!(gen.out);

    // Error reporting helper: x0 = message, x1 = line, x2 = col.
    let _ = writeln!(gen.out, "  .text");
    let _ = writeln!(gen.out, "  .align 2");
    let _ = writeln!(gen.out, ".L.ReportAbort:");
    let _ = writeln!(gen.out, "  stp x29, x30, [SP, #-16]!");
    let _ = writeln!(gen.out, "  mov x29, SP");
    let _ = writeln!(gen.out, "  mov x5, x0");
    let _ = writeln!(gen.out, "  mov x4, x2");
    let _ = writeln!(gen.out, "  mov x3, x1");
    gen.adr("x2", ".L.str.source");
    gen.adr("x1", ".L.str.abortfmt");
    let _ = writeln!(gen.out, "  adrp x0, stderr");
    let _ = writeln!(gen.out, "  ldr x0, [x0, :lo12:stderr]");
    let _ = writeln!(gen.out, "  bl fprintf");
    let _ = writeln!(gen.out, "  ldp x29, x30, [SP], #16");
    let _ = writeln!(gen.out, "  ret");
    let _ = writeln!(gen.out);

    let codes = module.code.reachable();
    for code in codes.iter() {
        emit_code(&mut gen, &module.profile_blocks, code);
        emit_code_for_abort(&mut gen, &module.profile_blocks, code);
    }

    // Module metadata.
    emit_module_path(&mut gen, ".L.path", &module.path);
    for (i, dep) in module.deps.iter().enumerate() {
        emit_module_path(&mut gen, &format!(".L.dep.{}", i), dep);
    }

    let _ = writeln!(gen.out, "  .section .data");
    let _ = writeln!(gen.out, "  .align 3");
    let _ = writeln!(gen.out, ".L.deps:");
    for i in 0..module.deps.len() {
        let _ = writeln!(gen.out, "  .xword .L.dep.{}", i);
    }

    // Profile block names.
    for (i, block) in module.profile_blocks.iter().enumerate() {
        let _ = writeln!(gen.out, ".L.block.{}.str:", i);
        let _ = writeln!(gen.out, "  .xword 1");
        let _ = writeln!(gen.out, "  .xword 0x53545247");
        let _ = writeln!(gen.out, "  .string \"{}\"", block.name);
        let _ = writeln!(gen.out, "  .align 3");
    }
    let _ = writeln!(gen.out, ".L.blocks:");
    for (i, block) in module.profile_blocks.iter().enumerate() {
        let _ = writeln!(gen.out, "  .xword .L.block.{}.str + 16", i);
        let _ = writeln!(gen.out, "  .xword 0");
        let _ = writeln!(gen.out, "  .xword .L.path.src + 16");
        let _ = writeln!(gen.out, "  .xword {}", block.loc.line);
        let _ = writeln!(gen.out, "  .xword {}", block.loc.col);
    }

    let _ = writeln!(gen.out, "  .align 3");
    let _ = writeln!(gen.out, ".L.executable:");
    let _ = writeln!(gen.out, "  .xword 1"); // refcount
    let _ = writeln!(gen.out, "  .xword 0x45584543"); // magic
    let _ = writeln!(gen.out, "  .xword {}", module.code.num_args);
    let _ = writeln!(gen.out, "  .xword {}", module.code.num_statics);
    let _ = writeln!(gen.out, "  .xword {}", module.code.max_call_args + 2);
    let _ = writeln!(gen.out, "  .xword {}", module.code.profile_block_id);
    let _ = writeln!(gen.out, "  .xword {}", run_name(&module.profile_blocks, &module.code));
    let _ = writeln!(gen.out, "  .xword 0"); // on_free

    let _ = writeln!(gen.out, ".L.module:");
    let _ = writeln!(gen.out, "  .xword 1"); // refcount
    let _ = writeln!(gen.out, "  .xword 0x4d4f4455"); // module magic
    let _ = writeln!(gen.out, "  .xword .L.path");
    let _ = writeln!(gen.out, "  .xword {}", module.deps.len());
    let _ = writeln!(gen.out, "  .xword .L.deps");
    let _ = writeln!(gen.out, "  .xword .L.executable");
    let _ = writeln!(gen.out, "  .xword {}", module.profile_blocks.len());
    let _ = writeln!(gen.out, "  .xword .L.blocks");
    let _ = writeln!(gen.out);

    // The linker entry point: register dependencies, then this module.
    let entry = label_for_path(&module.path);
    let _ = writeln!(gen.out, "  .text");
    let _ = writeln!(gen.out, "  .align 2");
    let _ = writeln!(gen.out, "  .global {}", entry);
    let _ = writeln!(gen.out, "{}:", entry);
    let _ = writeln!(gen.out, "  stp x29, x30, [SP, #-32]!");
    let _ = writeln!(gen.out, "  mov x29, SP");
    let _ = writeln!(gen.out, "  str x19, [SP, #16]");
    let _ = writeln!(gen.out, "  mov x19, x0");
    for dep in module.deps.iter() {
        let _ = writeln!(gen.out, "  mov x0, x19");
        let _ = writeln!(gen.out, "  bl {}", label_for_path(dep));
    }
    let _ = writeln!(gen.out, "  mov x0, x19");
    gen.adr("x1", ".L.module");
    let _ = writeln!(gen.out, "  bl FbleLoadFromCompiled");
    let _ = writeln!(gen.out, "  ldr x19, [SP, #16]");
    let _ = writeln!(gen.out, "  ldp x29, x30, [SP], #32");
    let _ = writeln!(gen.out, "  ret");

    out.write_str(&gen.out)
}


// Generate an assembly main stub invoking a language-level wrapper with
// the compiled module.
pub fn generate_aarch64_main(
    out: &mut impl fmt::Write,
    main: &str,
    path: &ModulePath,
) -> fmt::Result {
    writeln!(out, "  .text")?;
    writeln!(out, "  .align 2")?;
    writeln!(out, "  .global main")?;
    writeln!(out, "main:")?;
    writeln!(out, "  stp x29, x30, [SP, #-16]!")?;
    writeln!(out, "  mov x29, SP")?;
    writeln!(out, "  adrp x2, {}", label_for_path(path))?;
    writeln!(out, "  add x2, x2, :lo12:{}", label_for_path(path))?;
    writeln!(out, "  bl {}", main)?;
    writeln!(out, "  ldp x29, x30, [SP], #16")?;
    writeln!(out, "  ret")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, Arg, ExprBody};
    use crate::compile;
    use crate::kind::DataTypeTag;
    use crate::name::Loc;
    use crate::program::{LoadedModule, LoadedProgram};

    fn loc() -> Loc {
        Loc::new("test.fble", 1, 1)
    }

    fn e(body: ExprBody) -> ast::Node {
        ast::Expr::new(loc(), body)
    }

    fn compiled_select_module() -> CompiledModule {
        let n = |s: &str| Name::normal(s, loc());
        let tn = |s: &str| Name::type_name(s, loc());
        let unit_type = e(ExprBody::DataType(DataTypeTag::Struct, vec![]));
        let unit = e(ExprBody::StructValueImplicitType(vec![]));
        let letter = e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![
                Arg { type_: unit_type.clone(), name: n("a") },
                Arg { type_: unit_type.clone(), name: n("b") },
                Arg { type_: unit_type, name: n("c") },
            ],
        ));
        let value = e(ExprBody::UnionValue(e(ExprBody::Var(tn("L"))), n("b"), unit.clone()));
        let select = e(ExprBody::UnionSelect(
            e(ExprBody::Var(n("x"))),
            vec![
                ast::SelectChoice { name: n("a"), expr: unit.clone() },
                ast::SelectChoice { name: n("b"), expr: unit.clone() },
                ast::SelectChoice { name: n("c"), expr: unit },
            ],
            None,
        ));
        let expr = e(ExprBody::Let(
            vec![ast::Binding {
                kind: Some(crate::kind::Kind::Basic(1)),
                type_: None,
                name: tn("L"),
                expr: letter,
            }],
            e(ExprBody::Let(
                vec![ast::Binding {
                    kind: None,
                    type_: Some(e(ExprBody::Var(tn("L")))),
                    name: n("x"),
                    expr: value,
                }],
                select,
            )),
        ));

        let program = LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Main%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(expr),
            }],
        };
        compile::compile_module(&program).unwrap()
    }

    #[test]
    fn test_generated_asm_shape() {
        let module = compiled_select_module();
        let mut out = String::new();
        generate_aarch64(&mut out, &module).unwrap();

        // Run function with prologue and epilogue.
        assert!(out.contains("_Run._Main__0000:"));
        assert!(out.contains("stp x29, x30"));
        assert!(out.contains("ret"));

        // Register aliases and frame sections.
        assert!(out.contains("R_HEAP .req x19"));
        assert!(out.contains("mov R_LOCALS, SP"));

        // Union select compiles to compares and branches over the tag.
        assert!(out.contains("bl FbleUnionValueTag"));
        assert!(out.contains("cmp x0, #1"));
        assert!(out.contains("b.eq"));

        // Abort handling is out of line.
        assert!(out.contains(".undef:"));
        assert!(out.contains("bl .L.ReportAbort"));

        // DWARF line info maps instructions back to the source.
        assert!(out.contains(".file 1 \"test.fble\""));
        assert!(out.contains(".loc 1 "));

        // Module metadata and entry point.
        assert!(out.contains(".L.module:"));
        assert!(out.contains("Fble_2f_Main_25_:"));
        assert!(out.contains("bl FbleLoadFromCompiled"));
    }

    #[test]
    fn test_generated_asm_tail_call() {
        // A recursive loop should write the tail call buffer and return
        // the sentinel.
        let n = |s: &str| Name::normal(s, loc());
        let tn = |s: &str| Name::type_name(s, loc());
        let unit_type = e(ExprBody::DataType(DataTypeTag::Struct, vec![]));
        let ntype = e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![
                Arg { type_: unit_type, name: n("z") },
                Arg { type_: e(ExprBody::Var(tn("N"))), name: n("s") },
            ],
        ));
        let body = e(ExprBody::UnionSelect(
            e(ExprBody::Var(n("n"))),
            vec![
                ast::SelectChoice { name: n("z"), expr: e(ExprBody::Var(n("n"))) },
                ast::SelectChoice {
                    name: n("s"),
                    expr: e(ExprBody::Apply(
                        e(ExprBody::Var(n("loop"))),
                        vec![e(ExprBody::DataAccess(e(ExprBody::Var(n("n"))), n("s")))],
                    )),
                },
            ],
            None,
        ));
        let expr = e(ExprBody::Let(
            vec![ast::Binding {
                kind: Some(crate::kind::Kind::Basic(1)),
                type_: None,
                name: tn("N"),
                expr: ntype,
            }],
            e(ExprBody::Let(
                vec![ast::Binding {
                    kind: None,
                    type_: Some(e(ExprBody::FuncType(
                        e(ExprBody::Var(tn("N"))),
                        e(ExprBody::Var(tn("N"))),
                    ))),
                    name: n("loop"),
                    expr: e(ExprBody::FuncValue(
                        vec![Arg { type_: e(ExprBody::Var(tn("N"))), name: n("n") }],
                        body,
                    )),
                }],
                e(ExprBody::Var(n("loop"))),
            )),
        ));

        let program = LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Main%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(expr),
            }],
        };
        let module = compile::compile_module(&program).unwrap();

        let mut out = String::new();
        generate_aarch64(&mut out, &module).unwrap();
        assert!(out.contains("str x0, [R_TAIL_CALL_BUFFER, #0]"));
        assert!(out.contains("FbleTailCallSentinelValue"));
    }

    #[test]
    fn test_main_stub() {
        let path = ModulePath::parse("/Main%").unwrap();
        let mut out = String::new();
        generate_aarch64_main(&mut out, "FbleTestMain", &path).unwrap();
        assert!(out.contains("  .global main"));
        assert!(out.contains("bl FbleTestMain"));
    }
}
