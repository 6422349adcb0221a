// Program representations and the module linker.
//
// A loaded program is a list of modules in topological dependency order,
// delivered by the loader; the last module is the main module. Compiling
// produces bytecode per module; linking packages the modules as a single
// zero-argument function that computes the main module's value.

use std::sync::Arc;

use crate::ast;
use crate::code::Code;
use crate::function::{call, Exec, Executable, Function, Profiling};
use crate::name::{ModulePath, Name};
use crate::profile::{BlockId, Profile};
use crate::value::{Value, ValueHeap, UNDEFINED};


// A module as delivered by the loader. A module supplies a value, a type,
// or both; when both are given the type checker verifies the value against
// the type.
pub struct LoadedModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub type_: Option<ast::Node>,
    pub value: Option<ast::Node>,
}


pub struct LoadedProgram {
    pub modules: Vec<LoadedModule>,
}


pub struct CompiledModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub code: Arc<Code>,
    pub profile_blocks: Vec<Name>,
}


pub struct CompiledProgram {
    pub modules: Vec<CompiledModule>,
}


// A module ready for execution by any backend.
pub struct ExecutableModule {
    pub path: ModulePath,
    pub deps: Vec<ModulePath>,
    pub executable: Arc<dyn Executable>,
    pub profile_block_id: BlockId,
    pub profile_blocks: Vec<Name>,
}


pub struct ExecutableProgram {
    pub modules: Vec<ExecutableModule>,
}


// Package compiled modules for the interpreter.
pub fn interpret(program: &CompiledProgram) -> ExecutableProgram {
    let modules = program
        .modules
        .iter()
        .map(|module| ExecutableModule {
            path: module.path.clone(),
            deps: module.deps.clone(),
            executable: Arc::clone(&module.code) as Arc<dyn Executable>,
            profile_block_id: module.code.profile_block_id,
            profile_blocks: module.profile_blocks.clone(),
        })
        .collect();
    ExecutableProgram { modules }
}


// The zero-argument function produced by linking: computes each module's
// value in dependency order, passing dependency values as arguments, and
// returns the main module's value.
struct LinkedProgram {
    // Per module: its code, the absolute profile block id of its body, and
    // the indices of its dependencies.
    modules: Vec<(Arc<dyn Executable>, BlockId, Vec<usize>)>,
}


impl Executable for LinkedProgram {
    fn num_args(&self) -> usize {
        0
    }

    fn num_statics(&self) -> usize {
        0
    }

    fn max_call_args(&self) -> usize {
        self.modules.iter().map(|(e, _, _)| e.num_args()).max().unwrap_or(0)
    }

    fn run(
        &self,
        heap: &mut ValueHeap,
        profile: &mut Profiling,
        _function: &Function,
        _args: &[Value],
    ) -> Exec {
        let mut computed: Vec<Value> = Vec::with_capacity(self.modules.len());
        for (executable, block_id, deps) in self.modules.iter() {
            let args: Vec<Value> = deps.iter().map(|d| computed[*d]).collect();
            let func = heap.new_func_value(Arc::clone(executable), *block_id, Vec::new());
            let value = call(heap, profile, func, &args);
            if value.is_undefined() {
                return Exec::Done(UNDEFINED);
            }
            computed.push(value);
        }
        Exec::Done(*computed.last().unwrap())
    }
}


// Link the modules of an executable program into a single zero-argument
// function. Registers each module's profile blocks with the profile.
//
// Reports to stderr and returns None on mismatched dependency paths or
// duplicate module registration.
pub fn link(
    heap: &mut ValueHeap,
    program: &ExecutableProgram,
    mut profile: Option<&mut Profile>,
) -> Option<Value> {
    if program.modules.is_empty() {
        return None;
    }

    let mut modules = Vec::with_capacity(program.modules.len());
    for (i, module) in program.modules.iter().enumerate() {
        for prev in program.modules[..i].iter() {
            if prev.path == module.path {
                module
                    .path
                    .loc
                    .report_error(&format!("duplicate module {}", module.path));
                return None;
            }
        }

        let mut deps = Vec::with_capacity(module.deps.len());
        for dep in module.deps.iter() {
            match program.modules[..i].iter().position(|m| &m.path == dep) {
                Some(index) => deps.push(index),
                None => {
                    module.path.loc.report_error(&format!(
                        "module {} not found for {}",
                        dep, module.path
                    ));
                    return None;
                }
            }
        }

        let block_id = match profile.as_deref_mut() {
            Some(profile) => {
                let offset = profile.add_blocks(&module.profile_blocks);
                offset + module.profile_block_id
            }
            None => module.profile_block_id,
        };

        debug!("linked module {} as function {}", module.path, i);
        modules.push((Arc::clone(&module.executable), block_id, deps));
    }

    let linked = Arc::new(LinkedProgram { modules });
    Some(heap.new_func_value(linked, 0, Vec::new()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Instr, Op};
    use crate::function::eval;
    use crate::name::Loc;
    use crate::var::Var;

    fn loc() -> Loc {
        Loc::new("test.fble", 1, 1)
    }

    fn path(s: &str) -> ModulePath {
        ModulePath::parse(s).unwrap()
    }

    // A module whose value is the enum with the given tag.
    fn const_module(p: &str, tag: usize) -> ExecutableModule {
        let mut code = Code::new(0, 0, 2, 0);
        code.instrs = vec![
            Instr::new(Op::Struct { dst: 0, args: vec![] }),
            Instr::new(Op::Union { dst: 1, tag, arg: Var::local(0) }),
            Instr::new(Op::Release { targets: vec![0] }),
            Instr::new(Op::Return { result: Var::local(1) }),
        ];
        ExecutableModule {
            path: path(p),
            deps: vec![],
            executable: Arc::new(code),
            profile_block_id: 0,
            profile_blocks: vec![Name::normal(p, loc())],
        }
    }

    // A module that re-exports its single dependency's value.
    fn passthrough_module(p: &str, dep: &str) -> ExecutableModule {
        let mut code = Code::new(1, 0, 0, 0);
        code.instrs = vec![Instr::new(Op::Return { result: Var::arg(0) })];
        ExecutableModule {
            path: path(p),
            deps: vec![path(dep)],
            executable: Arc::new(code),
            profile_block_id: 0,
            profile_blocks: vec![Name::normal(p, loc())],
        }
    }

    #[test]
    fn test_link_and_eval() {
        let program = ExecutableProgram {
            modules: vec![
                const_module("/Lib%", 5),
                passthrough_module("/Main%", "/Lib%"),
            ],
        };

        let mut heap = ValueHeap::new();
        let linked = link(&mut heap, &program, None).unwrap();
        let result = eval(&mut heap, linked, None).unwrap();
        assert_eq!(heap.union_tag(result), Some(5));
    }

    #[test]
    fn test_link_missing_dep() {
        let program = ExecutableProgram {
            modules: vec![passthrough_module("/Main%", "/Lib%")],
        };
        let mut heap = ValueHeap::new();
        assert!(link(&mut heap, &program, None).is_none());
    }

    #[test]
    fn test_link_duplicate_module() {
        let program = ExecutableProgram {
            modules: vec![const_module("/Lib%", 1), const_module("/Lib%", 2)],
        };
        let mut heap = ValueHeap::new();
        assert!(link(&mut heap, &program, None).is_none());
    }

    #[test]
    fn test_link_registers_profile_blocks() {
        let program = ExecutableProgram {
            modules: vec![
                const_module("/Lib%", 5),
                passthrough_module("/Main%", "/Lib%"),
            ],
        };

        let mut heap = ValueHeap::new();
        let mut profile = Profile::new();
        let linked = link(&mut heap, &program, Some(&mut profile)).unwrap();
        let result = eval(&mut heap, linked, Some(&mut profile)).unwrap();
        assert_eq!(heap.union_tag(result), Some(5));

        assert!(profile.block_id("/Lib%").is_some());
        assert!(profile.block_id("/Main%").is_some());
    }
}
