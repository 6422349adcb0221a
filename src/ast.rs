// Untyped abstract syntax, as delivered by the parser.
//
// The type checker consumes this tree and produces tc::Tc. Nothing else in
// the crate looks at it.

use std::rc::Rc;

use crate::kind::{DataTypeTag, Kind};
use crate::name::{Loc, ModulePath, Name, Str};


pub type Node = Rc<Expr>;


// A let binding. Exactly one of kind and type_ is set: a binding declared
// with a kind has its type inferred from the definition.
#[derive(Clone, Debug)]
pub struct Binding {
    pub kind: Option<Kind>,
    pub type_: Option<Node>,
    pub name: Name,
    pub expr: Node,
}


// One branch of a union select.
#[derive(Clone, Debug)]
pub struct SelectChoice {
    pub name: Name,
    pub expr: Node,
}


// A function argument declaration: type and name.
#[derive(Clone, Debug)]
pub struct Arg {
    pub type_: Node,
    pub name: Name,
}


#[derive(Clone, Debug)]
pub struct Expr {
    pub loc: Loc,
    pub body: ExprBody,
}


#[derive(Clone, Debug)]
pub enum ExprBody {
    // foo
    Var(Name),

    // { bindings; body }
    Let(Vec<Binding>, Node),

    // *(t1 a, t2 b) or +(t1 a, t2 b)
    DataType(DataTypeTag, Vec<Arg>),

    // (arg) { rtype; }
    FuncType(Node, Node),

    // @<expr>
    Typeof(Node),

    // @(a: e1, b: e2)
    StructValueImplicitType(Vec<(Name, Node)>),

    // expr.@(a: e1, b: e2)
    StructCopy(Node, Vec<(Name, Node)>),

    // type(field: arg)
    UnionValue(Node, Name, Node),

    // expr.?(a: e1, b: e2, : def)
    UnionSelect(Node, Vec<SelectChoice>, Option<Node>),

    // expr.field
    DataAccess(Node, Name),

    // (args) { body; }
    FuncValue(Vec<Arg>, Node),

    // <kind name> { body; }
    PolyValue(Kind, Name, Node),

    // poly<arg>
    PolyApply(Node, Node),

    // func[a, b, c]
    List(Node, Vec<Node>),

    // func|word|
    Literal(Node, Str),

    // func(a, b)
    Apply(Node, Vec<Node>),

    // package.<target>(value)
    AbstractCast(Node, Node, Node),

    // package.%(value)
    AbstractAccess(Node),

    // /Foo/Bar%
    ModulePath(ModulePath),

    // @/Foo%
    PackageType(ModulePath),
}


impl Expr {
    pub fn new(loc: Loc, body: ExprBody) -> Node {
        Rc::new(Expr { loc, body })
    }
}
