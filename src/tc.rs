// Typed abstract syntax.
//
// Tc is like ast::Expr, except that field and variable names have been
// replaced with integer indices and types have been checked and erased. The
// type checker produces it; the compiler consumes it.

use std::rc::Rc;

use crate::kind::DataTypeTag;
use crate::name::{Loc, Name};
use crate::var::Var;


pub type TcRef = Rc<Tc>;


// Information for a binding: a let binding or a union select branch.
#[derive(Clone, Debug)]
pub struct TcBinding {
    pub name: Name,
    pub loc: Loc,
    pub tc: TcRef,
}


#[derive(Clone, Debug)]
pub struct Tc {
    pub loc: Loc,
    pub body: TcBody,
}


#[derive(Clone, Debug)]
pub enum TcBody {
    // The sole type value. All types erase to this at runtime.
    TypeValue,

    Var(Var),

    // Bindings are assigned local variables based on their position. A
    // recursive let sees all of its binders while checking each definition.
    Let {
        recursive: bool,
        bindings: Vec<TcBinding>,
        body: TcRef,
    },

    StructValue(Vec<TcRef>),

    // One entry per field of the source struct type: the override
    // expression for that field, or None to take the source's field.
    StructCopy {
        source: TcRef,
        fields: Vec<Option<TcRef>>,
    },

    UnionValue {
        tag: usize,
        arg: TcRef,
    },

    // Branches are sorted by tag. Multiple tags may share one binding (by
    // Rc identity) when they were written as a single branch; the default
    // branch is always present, synthesized from the final branch if the
    // source had no explicit default.
    UnionSelect {
        condition: TcRef,
        num_tags: usize,
        targets: Vec<(usize, TcBinding)>,
        default_: TcBinding,
    },

    DataAccess {
        datatype: DataTypeTag,
        obj: TcRef,
        tag: usize,
        loc: Loc,
    },

    // scope lists, for each captured static, where to find its value in
    // the enclosing frame. statics and args name the variables for debug
    // purposes only.
    FuncValue {
        body_loc: Loc,
        scope: Vec<Var>,
        statics: Vec<Name>,
        args: Vec<Name>,
        body: TcRef,
    },

    // Application is unary; f(a, b) is (f(a))(b).
    FuncApply {
        func: TcRef,
        arg: TcRef,
    },

    List(Vec<TcRef>),

    // letters[i] is the tag value to use for the ith letter.
    Literal(Vec<usize>),
}


impl Tc {
    pub fn new(loc: Loc, body: TcBody) -> TcRef {
        Rc::new(Tc { loc, body })
    }
}
