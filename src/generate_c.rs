// The C backend.
//
// Lowers compiled bytecode to C source targeting the runtime's C API. The
// generated code must be behaviorally identical to the interpreter: same
// values, same error messages, same tail-call protocol. Each Code object
// becomes one run function plus one abort function; the module's metadata
// becomes static data with an exported entry point for the linker.

use std::fmt::{self, Write};
use std::sync::Arc;

use crate::code::{Code, Op, ProfileOp};
use crate::name::{Loc, ModulePath, Name, Namespace};
use crate::program::CompiledModule;
use crate::var::{Var, VarSource};


// Sections of the frame, as the generated code names them.
fn section(var: Var) -> &'static str {
    match var.source {
        VarSource::Static => "s",
        VarSource::Arg => "a",
        VarSource::Local => "l",
    }
}

fn frame_var(var: Var) -> String {
    format!("{}[{}]", section(var), var.index)
}


// A C identifier for a profile block name: alphanumerics pass through,
// everything else becomes '_'.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}


// The exported symbol name for a module path, e.g. /Foo/Bar% becomes
// Fble_2f_Foo_2f_Bar_25_.
pub fn label_for_path(path: &ModulePath) -> String {
    let mut label = String::from("Fble");
    for c in format!("{}", path).chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c);
        } else {
            let _ = write!(label, "_{:02x}_", c as u32);
        }
    }
    label
}


fn string_lit(out: &mut String, string: &str) {
    out.push('"');
    for c in string.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
}


struct Generator {
    out: String,
    label_id: usize,
}


impl Generator {
    fn label(&mut self) -> String {
        let id = self.label_id;
        self.label_id += 1;
        format!("l{:x}", id)
    }

    fn static_string(&mut self, string: &str) -> String {
        let id = self.label();
        let _ = write!(self.out, "static FbleString {} = {{\n", id);
        self.out.push_str("  .refcount = 1,\n");
        self.out.push_str("  .magic = FBLE_STRING_MAGIC,\n");
        self.out.push_str("  .str = ");
        string_lit(&mut self.out, string);
        self.out.push_str("\n};\n");
        id
    }

    fn static_names(&mut self, names: &[Name]) -> String {
        let ids: Vec<(String, String)> = names
            .iter()
            .map(|name| {
                let str_id = self.static_string(&name.name);
                let src_id = self.static_string(&name.loc.source);
                (str_id, src_id)
            })
            .collect();

        let id = self.label();
        let _ = write!(self.out, "static FbleName {}[] = {{\n", id);
        for (name, (str_id, src_id)) in names.iter().zip(ids.iter()) {
            let space = match name.space {
                Namespace::Normal => 0,
                Namespace::Type => 1,
            };
            let _ = write!(self.out, "  {{ .name = &{},\n", str_id);
            let _ = write!(self.out, "    .space = {},\n", space);
            let _ = write!(
                self.out,
                "    .loc = {{ .source = &{}, .line = {}, .col = {} }}}},\n",
                src_id, name.loc.line, name.loc.col
            );
        }
        self.out.push_str("};\n");
        id
    }

    fn static_module_path(&mut self, path: &ModulePath) -> String {
        let src_id = self.static_string(&path.loc.source);
        let names_id = self.static_names(&path.path);
        let id = self.label();

        let _ = write!(self.out, "static FbleModulePath {} = {{\n", id);
        self.out.push_str("  .refcount = 1,\n");
        self.out.push_str("  .magic = FBLE_MODULE_PATH_MAGIC,\n");
        let _ = write!(
            self.out,
            "  .loc = {{ .source = &{}, .line = {}, .col = {} }},\n",
            src_id, path.loc.line, path.loc.col
        );
        let _ = write!(
            self.out,
            "  .path = {{ .size = {}, .xs = {} }},\n",
            path.path.len(),
            names_id
        );
        self.out.push_str("};\n");
        id
    }
}


// Name of the run function for a code object.
fn run_name(blocks: &[Name], code: &Code) -> String {
    let block = &blocks[code.profile_block_id];
    format!("{}_{:04x}", sanitize(&block.name), code.profile_block_id)
}


// Emit the branch to the abort handler used when an instruction fails.
fn return_abort(
    out: &mut String,
    run: &str,
    pc: usize,
    message: &str,
    loc: &Loc,
) {
    out.push_str("{\n");
    let _ = write!(out, "    ReportAbort({}, {}, {});\n", message, loc.line, loc.col);
    let _ = write!(out, "    return {}_abort(heap, s, a, l, {});\n", run, pc);
    out.push_str("  }\n");
}


// Which pcs need labels: every jump target.
fn jump_targets(code: &Code) -> Vec<bool> {
    let mut targets = vec![false; code.instrs.len()];
    for instr in code.instrs.iter() {
        match &instr.op {
            Op::UnionSelect { targets: tags, default_pc, .. } => {
                for (_, pc) in tags.iter() {
                    targets[*pc] = true;
                }
                targets[*default_pc] = true;
            }
            Op::Goto { pc } => targets[*pc] = true,
            _ => (),
        }
    }
    targets
}


fn emit_code(gen: &mut Generator, blocks: &[Name], code: &Arc<Code>) {
    let run = run_name(blocks, code);
    let out = &mut gen.out;

    let _ = write!(
        out,
        "static FbleValue* {}(FbleValueHeap* heap, FbleProfileThread* profile, \
         FbleValue** tail_call_buffer, FbleFunction* function, FbleValue** args)\n",
        run
    );
    out.push_str("{\n");
    out.push_str("  FbleValue** a = args;\n");
    let _ = write!(out, "  FbleValue* l[{}];\n", code.num_locals.max(1));
    out.push_str("  FbleValue** s = function->statics;\n");
    out.push_str("  FbleBlockId profile_block_offset = function->profile_block_offset;\n");
    out.push_str("  FbleValue* x0 = NULL;\n");

    let targets = jump_targets(code);
    let mut lit_id = 0;
    let mut exe_id = 0;

    for (pc, instr) in code.instrs.iter().enumerate() {
        if targets[pc] {
            let _ = write!(out, "pc_{}:\n", pc);
        }

        if !instr.profile_ops.is_empty() {
            out.push_str("  if (profile) {\n");
            for op in instr.profile_ops.iter() {
                match op {
                    ProfileOp::Enter(block) => {
                        let _ = write!(
                            out,
                            "    FbleProfileEnterBlock(profile, profile_block_offset + {});\n",
                            block
                        );
                    }
                    ProfileOp::Replace(block) => {
                        let _ = write!(
                            out,
                            "    FbleProfileReplaceBlock(profile, profile_block_offset + {});\n",
                            block
                        );
                    }
                    ProfileOp::Exit => {
                        out.push_str("    FbleProfileExitBlock(profile);\n");
                    }
                    ProfileOp::Sample(weight) => {
                        let _ = write!(
                            out,
                            "    FbleProfileRandomSample(profile, {});\n",
                            weight
                        );
                    }
                }
            }
            out.push_str("  }\n");
        }

        match &instr.op {
            Op::Struct { dst, args } => {
                let _ = write!(out, "  l[{}] = FbleNewStructValue_(heap, {}", dst, args.len());
                for arg in args.iter() {
                    let _ = write!(out, ", {}", frame_var(*arg));
                }
                out.push_str(");\n");
            }

            Op::Union { dst, tag, arg } => {
                let _ = write!(
                    out,
                    "  l[{}] = FbleNewUnionValue(heap, {}, {});\n",
                    dst,
                    tag,
                    frame_var(*arg)
                );
            }

            Op::StructAccess { dst, obj, tag, loc } => {
                let _ = write!(
                    out,
                    "  l[{}] = FbleStructValueField({}, {});\n",
                    dst,
                    frame_var(*obj),
                    tag
                );
                let _ = write!(out, "  if (l[{}] == NULL) ", dst);
                return_abort(out, &run, pc, "UndefinedStructValue", loc);
            }

            Op::UnionAccess { dst, obj, tag, loc } => {
                let _ = write!(
                    out,
                    "  l[{}] = FbleUnionValueField({}, {});\n",
                    dst,
                    frame_var(*obj),
                    tag
                );
                let _ = write!(out, "  if (l[{}] == NULL) ", dst);
                return_abort(out, &run, pc, "UndefinedUnionValue", loc);
                let _ = write!(out, "  if (l[{}] == FbleWrongUnionTag) {{\n", dst);
                let _ = write!(out, "    l[{}] = NULL;\n", dst);
                out.push_str("  ");
                return_abort(out, &run, pc, "WrongUnionTag", loc);
                out.push_str("  }\n");
            }

            Op::UnionSelect { condition, targets: tags, default_pc, loc, .. } => {
                let _ = write!(
                    out,
                    "  switch (FbleUnionValueTag({})) {{\n",
                    frame_var(*condition)
                );
                out.push_str("    case -1: ");
                return_abort(out, &run, pc, "UndefinedUnionSelect", loc);
                for (tag, target) in tags.iter() {
                    let _ = write!(out, "    case {}: goto pc_{};\n", tag, target);
                }
                let _ = write!(out, "    default: goto pc_{};\n", default_pc);
                out.push_str("  }\n");
            }

            Op::Goto { pc: target } => {
                let _ = write!(out, "  goto pc_{};\n", target);
            }

            Op::FuncValue { dst, code: func, scope } => {
                let func_run = run_name(blocks, func);
                let _ = write!(out, "  static FbleExecutable exe_{} = {{\n", exe_id);
                out.push_str("    .refcount = 1,\n");
                out.push_str("    .magic = FBLE_EXECUTABLE_MAGIC,\n");
                let _ = write!(out, "    .num_args = {},\n", func.num_args);
                let _ = write!(out, "    .num_statics = {},\n", func.num_statics);
                let _ = write!(
                    out,
                    "    .tail_call_buffer_size = {},\n",
                    func.max_call_args + 2
                );
                let _ = write!(out, "    .profile_block_id = {},\n", func.profile_block_id);
                let _ = write!(out, "    .run = &{},\n", func_run);
                out.push_str("    .on_free = NULL\n");
                out.push_str("  };\n");

                let _ = write!(out, "  FbleValue* fv{}[{}] = {{", pc, scope.len().max(1));
                for var in scope.iter() {
                    let _ = write!(out, "{}, ", frame_var(*var));
                }
                out.push_str("};\n");
                let _ = write!(
                    out,
                    "  l[{}] = FbleNewFuncValue(heap, &exe_{}, profile_block_offset, fv{});\n",
                    dst, exe_id, pc
                );
                exe_id += 1;
            }

            Op::Call { dst, func, args, loc } => {
                let _ = write!(out, "  FbleValue* ca{}[{}] = {{", pc, args.len().max(1));
                for arg in args.iter() {
                    let _ = write!(out, "{},", frame_var(*arg));
                }
                out.push_str("};\n");
                let _ = write!(
                    out,
                    "  l[{}] = FbleCall(heap, profile, {}, {}, ca{});\n",
                    dst,
                    frame_var(*func),
                    args.len(),
                    pc
                );
                let _ = write!(out, "  if (l[{}] == NULL) ", dst);
                return_abort(out, &run, pc, "CalleeAborted", loc);
            }

            Op::TailCall { func, args, loc } => {
                let _ = write!(out, "  x0 = FbleFuncValueFunction({});\n", frame_var(*func));
                out.push_str("  if (x0 == NULL) ");
                return_abort(out, &run, pc, "UndefinedFunctionValue", loc);

                let _ = write!(out, "  tail_call_buffer[0] = {};\n", frame_var(*func));
                for (i, arg) in args.iter().enumerate() {
                    let _ = write!(
                        out,
                        "  tail_call_buffer[{}] = {};\n",
                        i + 1,
                        frame_var(*arg)
                    );
                }
                let _ = write!(out, "  tail_call_buffer[{}] = NULL;\n", args.len() + 1);
                out.push_str("  return FbleTailCallSentinelValue;\n");
            }

            Op::Copy { dst, src } => {
                let _ = write!(out, "  l[{}] = {};\n", dst, frame_var(*src));
            }

            Op::RefValue { dst } => {
                let _ = write!(out, "  l[{}] = FbleNewRefValue(heap);\n", dst);
            }

            Op::RefDef { ref_, value, loc } => {
                let _ = write!(
                    out,
                    "  if (!FbleAssignRefValue(heap, l[{}], {})) ",
                    ref_,
                    frame_var(*value)
                );
                return_abort(out, &run, pc, "VacuousValue", loc);
            }

            Op::Return { result } => {
                let _ = write!(out, "  return {};\n", frame_var(*result));
            }

            Op::Type { dst } => {
                let _ = write!(out, "  l[{}] = FbleGenericTypeValue;\n", dst);
            }

            Op::Retain { target } => {
                let _ = write!(out, "  FbleRetainValue(heap, {});\n", frame_var(*target));
            }

            Op::Release { targets } => {
                let _ = write!(out, "  FbleReleaseValues_(heap, {}", targets.len());
                for target in targets.iter() {
                    let _ = write!(out, ", l[{}]", target);
                }
                out.push_str(");\n");
            }

            Op::List { dst, args } => {
                let _ = write!(out, "  l[{}] = FbleNewListValue_(heap, {}", dst, args.len());
                for arg in args.iter() {
                    let _ = write!(out, ", {}", frame_var(*arg));
                }
                out.push_str(");\n");
            }

            Op::Literal { dst, letters } => {
                let _ = write!(out, "  static size_t lit_{}[] = {{", lit_id);
                for letter in letters.iter() {
                    let _ = write!(out, " {},", letter);
                }
                out.push_str(" };\n");
                let _ = write!(
                    out,
                    "  l[{}] = FbleNewLiteralValue(heap, {}, lit_{});\n",
                    dst,
                    letters.len(),
                    lit_id
                );
                lit_id += 1;
            }

            Op::Nop => (),
        }
    }
    out.push_str("}\n\n");
}


// The abort handler for a code object: walk the remaining instructions
// performing only the cleanup needed for the local variable discipline.
fn emit_code_for_abort(gen: &mut Generator, blocks: &[Name], code: &Arc<Code>) {
    let run = run_name(blocks, code);
    let out = &mut gen.out;

    let _ = write!(
        out,
        "static FbleValue* {}_abort(FbleValueHeap* heap, FbleValue** s, \
         FbleValue** a, FbleValue** l, size_t pc)\n",
        run
    );
    out.push_str("{\n");
    out.push_str("  switch (pc) {\n");
    for pc in 0..code.instrs.len() {
        let _ = write!(out, "    case {}: goto abort_pc_{};\n", pc, pc);
    }
    out.push_str("  }\n");

    for (pc, instr) in code.instrs.iter().enumerate() {
        let _ = write!(out, "abort_pc_{}:\n", pc);
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
                let _ = write!(out, "  l[{}] = NULL;\n", dst);
            }

            Op::UnionSelect { default_pc, .. } => {
                let _ = write!(out, "  goto abort_pc_{};\n", default_pc);
            }

            Op::Goto { pc: target } => {
                let _ = write!(out, "  goto abort_pc_{};\n", target);
            }

            Op::TailCall { .. } => {
                out.push_str("  return NULL;\n");
            }

            Op::Return { .. } => {
                out.push_str("  return NULL;\n");
            }

            Op::Release { targets } => {
                let _ = write!(out, "  FbleReleaseValues_(heap, {}", targets.len());
                for target in targets.iter() {
                    let _ = write!(out, ", l[{}]", target);
                }
                out.push_str(");\n");
            }

            Op::RefDef { .. } | Op::Retain { .. } | Op::Nop => (),
        }
    }
    out.push_str("  return NULL;\n");
    out.push_str("}\n\n");
}


// Generate C code for a compiled module.
pub fn generate_c(out: &mut impl fmt::Write, module: &CompiledModule) -> fmt::Result {
    let mut gen = Generator { out: String::new(), label_id: 0 };

    gen.out.push_str("#include <stdlib.h>\n");
    gen.out.push_str("#include <stdio.h>\n\n");
    gen.out.push_str("#include <fble/fble-function.h>\n");
    gen.out.push_str("#include <fble/fble-link.h>\n");
    gen.out.push_str("#include <fble/fble-program.h>\n");
    gen.out.push_str("#include <fble/fble-value.h>\n\n");

    let source = gen.static_string(&module.path.loc.source);

    gen.out.push_str("static const char* CalleeAborted = \"callee aborted\";\n");
    gen.out.push_str(
        "static const char* UndefinedStructValue = \"undefined struct value access\";\n",
    );
    gen.out.push_str(
        "static const char* UndefinedUnionValue = \"undefined union value access\";\n",
    );
    gen.out.push_str(
        "static const char* UndefinedUnionSelect = \"undefined union value select\";\n",
    );
    gen.out.push_str(
        "static const char* WrongUnionTag = \"union field access undefined: wrong tag\";\n",
    );
    gen.out.push_str(
        "static const char* UndefinedFunctionValue = \"called undefined function\";\n",
    );
    gen.out.push_str("static const char* VacuousValue = \"vacuous value\";\n\n");

    gen.out.push_str("static void ReportAbort(const char* msg, int line, int col)\n");
    gen.out.push_str("{\n");
    let _ = write!(
        gen.out,
        "  fprintf(stderr, \"%s:%d:%d: error: %s\\n\", {}.str, line, col, msg);\n",
        source
    );
    gen.out.push_str("}\n\n");

    let codes = module.code.reachable();

    // Forward declarations, since functions reference each other freely.
    for code in codes.iter() {
        let run = run_name(&module.profile_blocks, code);
        let _ = write!(
            gen.out,
            "static FbleValue* {}(FbleValueHeap*, FbleProfileThread*, \
             FbleValue**, FbleFunction*, FbleValue**);\n",
            run
        );
        let _ = write!(
            gen.out,
            "static FbleValue* {}_abort(FbleValueHeap*, FbleValue**, \
             FbleValue**, FbleValue**, size_t);\n",
            run
        );
    }
    gen.out.push('\n');

    for code in codes.iter() {
        emit_code(&mut gen, &module.profile_blocks, code);
        emit_code_for_abort(&mut gen, &module.profile_blocks, code);
    }

    // Static data for the executable module.
    let path_id = gen.static_module_path(&module.path);
    let dep_ids: Vec<String> = module
        .deps
        .iter()
        .map(|dep| gen.static_module_path(dep))
        .collect();

    let deps_id = gen.label();
    let _ = write!(gen.out, "static FbleModulePath* {}[] = {{", deps_id);
    for dep in dep_ids.iter() {
        let _ = write!(gen.out, " &{},", dep);
    }
    gen.out.push_str(" NULL };\n");

    let blocks_id = gen.static_names(&module.profile_blocks);

    let exe_id = gen.label();
    let run = run_name(&module.profile_blocks, &module.code);
    let _ = write!(gen.out, "static FbleExecutable {} = {{\n", exe_id);
    gen.out.push_str("  .refcount = 1,\n");
    gen.out.push_str("  .magic = FBLE_EXECUTABLE_MAGIC,\n");
    let _ = write!(gen.out, "  .num_args = {},\n", module.code.num_args);
    let _ = write!(gen.out, "  .num_statics = {},\n", module.code.num_statics);
    let _ = write!(
        gen.out,
        "  .tail_call_buffer_size = {},\n",
        module.code.max_call_args + 2
    );
    let _ = write!(gen.out, "  .profile_block_id = {},\n", module.code.profile_block_id);
    let _ = write!(gen.out, "  .run = &{},\n", run);
    gen.out.push_str("  .on_free = NULL\n");
    gen.out.push_str("};\n");

    let module_id = gen.label();
    let _ = write!(gen.out, "static FbleExecutableModule {} = {{\n", module_id);
    gen.out.push_str("  .refcount = 1,\n");
    gen.out.push_str("  .magic = FBLE_EXECUTABLE_MODULE_MAGIC,\n");
    let _ = write!(gen.out, "  .path = &{},\n", path_id);
    let _ = write!(
        gen.out,
        "  .deps = {{ .size = {}, .xs = {} }},\n",
        module.deps.len(),
        deps_id
    );
    let _ = write!(gen.out, "  .executable = &{},\n", exe_id);
    let _ = write!(
        gen.out,
        "  .profile_blocks = {{ .size = {}, .xs = {} }},\n",
        module.profile_blocks.len(),
        blocks_id
    );
    gen.out.push_str("};\n\n");

    // The linker entry point. Dependencies register themselves first.
    for dep in module.deps.iter() {
        let _ = write!(
            gen.out,
            "extern void {}(FbleExecutableProgram* program);\n",
            label_for_path(dep)
        );
    }
    let _ = write!(
        gen.out,
        "\nvoid {}(FbleExecutableProgram* program)\n",
        label_for_path(&module.path)
    );
    gen.out.push_str("{\n");
    for dep in module.deps.iter() {
        let _ = write!(gen.out, "  {}(program);\n", label_for_path(dep));
    }
    let _ = write!(gen.out, "  FbleLoadFromCompiled(program, &{});\n", module_id);
    gen.out.push_str("}\n");

    out.write_str(&gen.out)
}


// Generate a C function with the given name exporting the module's entry
// point.
pub fn generate_c_export(
    out: &mut impl fmt::Write,
    name: &str,
    path: &ModulePath,
) -> fmt::Result {
    writeln!(out, "#include <fble/fble-link.h>\n")?;
    writeln!(out, "extern void {}(FbleExecutableProgram* program);\n", label_for_path(path))?;
    writeln!(out, "void {}(FbleExecutableProgram* program)", name)?;
    writeln!(out, "{{")?;
    writeln!(out, "  {}(program);", label_for_path(path))?;
    writeln!(out, "}}")
}


// Generate a C main stub invoking the given language-level wrapper with
// the compiled module.
pub fn generate_c_main(
    out: &mut impl fmt::Write,
    main: &str,
    path: &ModulePath,
) -> fmt::Result {
    writeln!(out, "#include <fble/fble-link.h>\n")?;
    writeln!(out, "extern void {}(FbleExecutableProgram* program);", label_for_path(path))?;
    writeln!(out, "extern int {}(int argc, const char** argv, void (*module)(FbleExecutableProgram*));\n", main)?;
    writeln!(out, "int main(int argc, const char** argv)")?;
    writeln!(out, "{{")?;
    writeln!(out, "  return {}(argc, argv, {});", main, label_for_path(path))?;
    writeln!(out, "}}")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, Arg, ExprBody};
    use crate::compile;
    use crate::kind::DataTypeTag;
    use crate::program::{LoadedModule, LoadedProgram};

    fn loc() -> Loc {
        Loc::new("test.fble", 1, 1)
    }

    fn e(body: ExprBody) -> ast::Node {
        ast::Expr::new(loc(), body)
    }

    fn compiled_identity() -> CompiledModule {
        // A module whose value is an identity function applied to unit.
        let n = |s: &str| Name::normal(s, loc());
        let unit_type = e(ExprBody::DataType(DataTypeTag::Struct, vec![]));
        let unit = e(ExprBody::StructValueImplicitType(vec![]));
        let id = e(ExprBody::FuncValue(
            vec![Arg { type_: unit_type, name: n("x") }],
            e(ExprBody::Var(n("x"))),
        ));
        let expr = e(ExprBody::Apply(id, vec![unit]));

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
    fn test_label_for_path() {
        let path = ModulePath::parse("/Foo/Bar%").unwrap();
        assert_eq!(label_for_path(&path), "Fble_2f_Foo_2f_Bar_25_");
    }

    #[test]
    fn test_generated_c_shape() {
        let module = compiled_identity();
        let mut out = String::new();
        generate_c(&mut out, &module).unwrap();

        // One run and one abort function per reachable code object.
        assert_eq!(module.code.reachable().len(), 2);
        assert!(out.contains("static FbleValue* _Main__0000("));
        assert!(out.contains("_abort("));

        // The module body allocates the function and calls it.
        assert!(out.contains("FbleNewFuncValue"));
        assert!(out.contains("FbleCall(heap, profile,"));

        // Static module metadata and the linker entry point.
        assert!(out.contains("FbleExecutableModule"));
        assert!(out.contains("void Fble_2f_Main_25_(FbleExecutableProgram* program)"));
        assert!(out.contains("FbleLoadFromCompiled"));

        // Runtime error messages match the interpreter's.
        assert!(out.contains("\"callee aborted\""));
    }

    #[test]
    fn test_generated_c_select_labels() {
        // A module with a union select compiles to a switch over tags.
        let n = |s: &str| Name::normal(s, loc());
        let tn = |s: &str| Name::type_name(s, loc());
        let unit_type = e(ExprBody::DataType(DataTypeTag::Struct, vec![]));
        let unit = e(ExprBody::StructValueImplicitType(vec![]));
        let bool_type = e(ExprBody::DataType(
            DataTypeTag::Union,
            vec![
                Arg { type_: unit_type.clone(), name: n("true") },
                Arg { type_: unit_type, name: n("false") },
            ],
        ));
        let true_value = e(ExprBody::UnionValue(
            e(ExprBody::Var(tn("B"))),
            n("true"),
            unit.clone(),
        ));
        let select = e(ExprBody::UnionSelect(
            e(ExprBody::Var(n("x"))),
            vec![
                ast::SelectChoice { name: n("true"), expr: unit.clone() },
                ast::SelectChoice { name: n("false"), expr: unit },
            ],
            None,
        ));
        let expr = e(ExprBody::Let(
            vec![ast::Binding {
                kind: Some(crate::kind::Kind::Basic(1)),
                type_: None,
                name: tn("B"),
                expr: bool_type,
            }],
            e(ExprBody::Let(
                vec![ast::Binding {
                    kind: None,
                    type_: Some(e(ExprBody::Var(tn("B")))),
                    name: n("x"),
                    expr: true_value,
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
        let module = compile::compile_module(&program).unwrap();

        let mut out = String::new();
        generate_c(&mut out, &module).unwrap();
        assert!(out.contains("switch (FbleUnionValueTag("));
        assert!(out.contains("goto pc_"));
        assert!(out.contains("UndefinedUnionSelect"));
    }

    #[test]
    fn test_generated_c_written_to_disk() {
        use std::io::{Read, Write as IoWrite};

        let module = compiled_identity();
        let mut out = String::new();
        generate_c(&mut out, &module).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(out.as_bytes()).unwrap();

        let mut read_back = String::new();
        file.reopen().unwrap().read_to_string(&mut read_back).unwrap();
        assert_eq!(read_back, out);
    }

    #[test]
    fn test_export_and_main_stubs() {
        let path = ModulePath::parse("/Main%").unwrap();

        let mut export = String::new();
        generate_c_export(&mut export, "FbleCompiledMain", &path).unwrap();
        assert!(export.contains("void FbleCompiledMain(FbleExecutableProgram* program)"));

        let mut main = String::new();
        generate_c_main(&mut main, "FbleTestMain", &path).unwrap();
        assert!(main.contains("int main(int argc, const char** argv)"));
        assert!(main.contains("FbleTestMain(argc, argv, Fble_2f_Main_25_)"));
    }
}
