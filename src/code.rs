// The bytecode instruction set.
//
// A Code object is the compiled body of one function: a flat sequence of
// instructions over three register sections (statics, args, locals). The
// interpreter executes it directly; the native backends lower the very same
// object to C or assembly.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::name::{Loc, Name};
use crate::profile::BlockId;
use crate::var::{LocalIndex, Var};


// Debug information attached to an instruction.
#[derive(Clone, Debug)]
pub enum DebugInfo {
    // The instruction starts a new source statement.
    Statement(Loc),

    // A variable enters scope at this instruction.
    Var(Name, Var),
}


// Profiling operations to perform before executing an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProfileOp {
    Enter(BlockId),
    Replace(BlockId),
    Exit,
    Sample(u64),
}


#[derive(Clone, Debug)]
pub struct Instr {
    pub debug_info: Vec<DebugInfo>,
    pub profile_ops: Vec<ProfileOp>,
    pub op: Op,
}


impl Instr {
    pub fn new(op: Op) -> Instr {
        Instr { debug_info: Vec::new(), profile_ops: Vec::new(), op }
    }
}


#[derive(Clone, Debug)]
pub enum Op {
    // *dst = struct(args[0], args[1], ...)
    Struct { dst: LocalIndex, args: Vec<Var> },

    // *dst = union(tag: arg)
    Union { dst: LocalIndex, tag: usize, arg: Var },

    // *dst = obj.tag
    StructAccess { dst: LocalIndex, obj: Var, tag: usize, loc: Loc },

    // *dst = obj.tag, with a tag check
    UnionAccess { dst: LocalIndex, obj: Var, tag: usize, loc: Loc },

    // pc = targets[condition.tag], or default_pc if the tag has no entry.
    // targets is sorted by tag for binary search.
    UnionSelect {
        condition: Var,
        num_tags: usize,
        targets: Vec<(usize, usize)>,
        default_pc: usize,
        loc: Loc,
    },

    // pc = target
    Goto { pc: usize },

    // *dst = code[scope[0], scope[1], ...]
    FuncValue { dst: LocalIndex, code: Arc<Code>, scope: Vec<Var> },

    // *dst = func(args[0], args[1], ...)
    Call { dst: LocalIndex, func: Var, args: Vec<Var>, loc: Loc },

    // return func(args[0], args[1], ...), reusing the frame
    TailCall { func: Var, args: Vec<Var>, loc: Loc },

    // *dst = src
    Copy { dst: LocalIndex, src: Var },

    // *dst = new ref
    RefValue { dst: LocalIndex },

    // ref->value = value
    RefDef { ref_: LocalIndex, value: Var, loc: Loc },

    // return result
    Return { result: Var },

    // *dst = the type value
    Type { dst: LocalIndex },

    // Keep target alive; a liveness annotation for the frame allocator.
    Retain { target: Var },

    // Drop the given locals; their slots may be reused.
    Release { targets: Vec<LocalIndex> },

    // *dst = [args[0], args[1], ...]
    List { dst: LocalIndex, args: Vec<Var> },

    // *dst = the literal with the given letter tags
    Literal { dst: LocalIndex, letters: Vec<usize> },

    Nop,
}


// The compiled body of a function.
//
// Locals are indexed 0..num_locals; a local slot may be reused after a
// Release names it. profile_block_id is relative to the module's profile
// blocks; the offset to absolute ids is recovered at runtime from the
// function being executed.
#[derive(Debug)]
pub struct Code {
    pub num_args: usize,
    pub num_statics: usize,
    pub num_locals: usize,
    pub max_call_args: usize,
    pub profile_block_id: BlockId,
    pub instrs: Vec<Instr>,
}


impl Code {
    pub fn new(
        num_args: usize,
        num_statics: usize,
        num_locals: usize,
        profile_block_id: BlockId,
    ) -> Code {
        Code {
            num_args,
            num_statics,
            num_locals,
            max_call_args: 0,
            profile_block_id,
            instrs: Vec::new(),
        }
    }

    // All Code objects reachable from this one through FuncValue
    // instructions, including this one, in preorder.
    pub fn reachable(self: &Arc<Code>) -> Vec<Arc<Code>> {
        let mut codes = Vec::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(code) = stack.pop() {
            for instr in code.instrs.iter() {
                if let Op::FuncValue { code: inner, .. } = &instr.op {
                    stack.push(Arc::clone(inner));
                }
            }
            codes.push(code);
        }
        codes
    }

    // Write a human readable listing of the code and everything reachable
    // from it.
    pub fn disassemble(self: &Arc<Code>, out: &mut impl fmt::Write) -> fmt::Result {
        for code in self.reachable() {
            writeln!(
                out,
                "code[{:p}]: args {}, statics {}, locals {}, block {}",
                Arc::as_ptr(&code),
                code.num_args,
                code.num_statics,
                code.num_locals,
                code.profile_block_id,
            )?;
            for (pc, instr) in code.instrs.iter().enumerate() {
                for op in instr.profile_ops.iter() {
                    writeln!(out, "        {:?}", op)?;
                }
                writeln!(out, "  {:4}. {}", pc, instr.op)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}


fn write_vars(f: &mut fmt::Formatter, vars: &[Var]) -> fmt::Result {
    write!(f, "{}", vars.iter().map(|v| v.to_string()).join(", "))
}


impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Struct { dst, args } => {
                write!(f, "l{} = struct(", dst)?;
                write_vars(f, args)?;
                write!(f, ")")
            }
            Op::Union { dst, tag, arg } => {
                write!(f, "l{} = union({}: {})", dst, tag, arg)
            }
            Op::StructAccess { dst, obj, tag, .. } => {
                write!(f, "l{} = {}.{}", dst, obj, tag)
            }
            Op::UnionAccess { dst, obj, tag, .. } => {
                write!(f, "l{} = {}.?{}", dst, obj, tag)
            }
            Op::UnionSelect { condition, targets, default_pc, .. } => {
                write!(f, "select {} (", condition)?;
                for (tag, pc) in targets.iter() {
                    write!(f, "{}: {}, ", tag, pc)?;
                }
                write!(f, ": {})", default_pc)
            }
            Op::Goto { pc } => write!(f, "goto {}", pc),
            Op::FuncValue { dst, code, scope } => {
                write!(f, "l{} = func[{:p}](", dst, Arc::as_ptr(code))?;
                write_vars(f, scope)?;
                write!(f, ")")
            }
            Op::Call { dst, func, args, .. } => {
                write!(f, "l{} = {}(", dst, func)?;
                write_vars(f, args)?;
                write!(f, ")")
            }
            Op::TailCall { func, args, .. } => {
                write!(f, "tail {}(", func)?;
                write_vars(f, args)?;
                write!(f, ")")
            }
            Op::Copy { dst, src } => write!(f, "l{} = {}", dst, src),
            Op::RefValue { dst } => write!(f, "l{} = ref", dst),
            Op::RefDef { ref_, value, .. } => write!(f, "l{} := {}", ref_, value),
            Op::Return { result } => write!(f, "return {}", result),
            Op::Type { dst } => write!(f, "l{} = type", dst),
            Op::Retain { target } => write!(f, "retain {}", target),
            Op::Release { targets } => {
                write!(f, "release ")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "l{}", target)?;
                }
                Ok(())
            }
            Op::List { dst, args } => {
                write!(f, "l{} = [", dst)?;
                write_vars(f, args)?;
                write!(f, "]")
            }
            Op::Literal { dst, letters } => {
                write!(f, "l{} = literal{:?}", dst, letters)
            }
            Op::Nop => write!(f, "nop"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble() {
        let mut inner = Code::new(1, 0, 1, 1);
        inner.instrs.push(Instr::new(Op::Copy {
            dst: 0,
            src: Var::arg(0),
        }));
        inner.instrs.push(Instr::new(Op::Return {
            result: Var::local(0),
        }));
        let inner = Arc::new(inner);

        let mut outer = Code::new(0, 0, 1, 0);
        outer.instrs.push(Instr::new(Op::FuncValue {
            dst: 0,
            code: Arc::clone(&inner),
            scope: vec![],
        }));
        outer.instrs.push(Instr::new(Op::Return {
            result: Var::local(0),
        }));
        let outer = Arc::new(outer);

        let mut listing = String::new();
        outer.disassemble(&mut listing).unwrap();
        assert!(listing.contains("return l0"));
        assert!(listing.contains("l0 = a0"));

        assert_eq!(outer.reachable().len(), 2);
    }
}
