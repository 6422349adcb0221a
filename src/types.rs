// The type checker's representation of types.
//
// Types form a graph that may contain cycles, introduced by recursive let
// bindings of type variables. All types are allocated out of a TypeHeap
// arena and referred to by index, which makes the cycles harmless: traversals
// carry a visited set and the whole arena is dropped at once when type
// checking completes.

use std::collections::HashSet;
use std::fmt::Write;

use crate::kind::{DataTypeTag, Kind};
use crate::name::{Loc, ModulePath, Name};


// Index of a type in a TypeHeap.
pub type TypeId = usize;


// An assignment of a value to a type variable, used for inference.
#[derive(Clone, Debug)]
pub struct TypeAssignment {
    pub var: TypeId,
    pub value: Option<TypeId>,
}


#[derive(Clone, Debug)]
pub enum TypeData {
    // A struct or union type with ordered named fields.
    Data {
        datatype: DataTypeTag,
        fields: Vec<(Name, TypeId)>,
    },

    // Functions take exactly one argument; multi-argument functions are
    // curried.
    Func {
        arg: TypeId,
        rtype: TypeId,
    },

    // A type-level function. arg is always a Var.
    Poly {
        arg: TypeId,
        body: TypeId,
    },

    // Application of a poly, normalized away by substitution.
    PolyApply {
        poly: TypeId,
        arg: TypeId,
    },

    // The nominal key for access control. When opaque, abstract types of
    // this package do not unify with their underlying type.
    Package {
        path: ModulePath,
        opaque: bool,
    },

    // A type opaque to modules outside its package. package refers to a
    // Package type.
    Abstract {
        package: TypeId,
        inner: TypeId,
    },

    // The type of a type value.
    TypeType {
        inner: TypeId,
    },

    // A placeholder used during recursive let type checking, filled in by
    // assign_var. A Var with no value that is never assigned is vacuous.
    Var {
        name: Name,
        kind: Kind,
        value: Option<TypeId>,
    },
}


#[derive(Clone, Debug)]
pub struct Type {
    pub loc: Loc,
    pub data: TypeData,
}


pub struct TypeHeap {
    types: Vec<Type>,

    // A package whose opacity is temporarily suspended, keyed by path.
    // Used by abstract cast to check type equality from inside the
    // package.
    transparent: Option<ModulePath>,
}


impl TypeHeap {
    pub fn new() -> TypeHeap {
        TypeHeap { types: Vec::new(), transparent: None }
    }

    pub fn alloc(&mut self, loc: Loc, data: TypeData) -> TypeId {
        self.types.push(Type { loc, data });
        self.types.len() - 1
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id]
    }

    pub fn loc(&self, id: TypeId) -> Loc {
        self.types[id].loc.clone()
    }

    pub fn new_data(
        &mut self,
        loc: Loc,
        datatype: DataTypeTag,
        fields: Vec<(Name, TypeId)>,
    ) -> TypeId {
        self.alloc(loc, TypeData::Data { datatype, fields })
    }

    pub fn new_func(&mut self, loc: Loc, arg: TypeId, rtype: TypeId) -> TypeId {
        self.alloc(loc, TypeData::Func { arg, rtype })
    }

    pub fn new_poly(&mut self, loc: Loc, arg: TypeId, body: TypeId) -> TypeId {
        self.alloc(loc, TypeData::Poly { arg, body })
    }

    pub fn new_poly_apply(&mut self, loc: Loc, poly: TypeId, arg: TypeId) -> TypeId {
        self.alloc(loc, TypeData::PolyApply { poly, arg })
    }

    pub fn new_package(&mut self, loc: Loc, path: ModulePath, opaque: bool) -> TypeId {
        self.alloc(loc, TypeData::Package { path, opaque })
    }

    pub fn new_abstract(&mut self, loc: Loc, package: TypeId, inner: TypeId) -> TypeId {
        self.alloc(loc, TypeData::Abstract { package, inner })
    }

    pub fn new_type_type(&mut self, loc: Loc, inner: TypeId) -> TypeId {
        self.alloc(loc, TypeData::TypeType { inner })
    }

    pub fn new_var(&mut self, name: Name, kind: Kind) -> TypeId {
        let loc = name.loc.clone();
        self.alloc(loc, TypeData::Var { name, kind, value: None })
    }

    // Fill in the value of a type variable introduced for a recursive let.
    //
    // Returns false if the assignment would be vacuous: the value resolves
    // through a chain of variables back to the variable itself.
    pub fn assign_var(&mut self, var: TypeId, value: TypeId) -> bool {
        let mut resolved = value;
        loop {
            if resolved == var {
                return false;
            }
            match &self.types[resolved].data {
                TypeData::Var { value: Some(next), .. } => resolved = *next,
                _ => break,
            }
        }

        match &mut self.types[var].data {
            TypeData::Var { value, .. } => {
                *value = Some(resolved);
                true
            }
            _ => unreachable!("assign_var on non-var type"),
        }
    }

    // Suspend or restore the opacity of all package types with the given
    // path. Used by abstract cast, which performs its type equality check
    // with the package made transparent.
    pub fn set_transparent(&mut self, path: Option<ModulePath>) {
        self.transparent = path;
    }

    // The kind of a type: the kind classifying the type's values. Data and
    // function types describe level 0 values; typeof lifts by one level. A
    // poly's argument kind is reported lifted, since poly application takes
    // a type value.
    pub fn kind(&self, id: TypeId) -> Kind {
        match &self.types[id].data {
            TypeData::Data { .. } => Kind::Basic(0),
            TypeData::Func { .. } => Kind::Basic(0),
            TypeData::Package { .. } => Kind::Basic(0),
            TypeData::Abstract { .. } => Kind::Basic(0),
            TypeData::Poly { arg, body } => {
                Kind::Poly(Box::new(lift_kind(&self.kind(*arg))), Box::new(self.kind(*body)))
            }
            TypeData::PolyApply { poly, .. } => match self.kind(*poly) {
                Kind::Poly(_, rkind) => *rkind,
                kind => kind,
            },
            TypeData::TypeType { inner } => lift_kind(&self.kind(*inner)),
            TypeData::Var { kind, .. } => kind.clone(),
        }
    }

    // The value of the type, if this is the type of a type value. The
    // value of a poly's type is a poly of the body's value; likewise for
    // stuck poly applications.
    pub fn value_of_type(&mut self, id: TypeId) -> Option<TypeId> {
        let id = self.normal(id);
        match self.types[id].data.clone() {
            TypeData::TypeType { inner } => Some(inner),
            TypeData::Poly { arg, body } => {
                let inner = self.value_of_type(body)?;
                let loc = self.types[id].loc.clone();
                Some(self.new_poly(loc, arg, inner))
            }
            TypeData::PolyApply { poly, arg } => {
                let inner = self.value_of_type(poly)?;
                let loc = self.types[id].loc.clone();
                Some(self.new_poly_apply(loc, inner, arg))
            }
            _ => None,
        }
    }

    // Head-normalize a type: resolve chains of assigned variables and
    // reduce poly application by substitution. Poly binders are not
    // unwrapped.
    pub fn normal(&mut self, id: TypeId) -> TypeId {
        self.normal_visited(id, &mut HashSet::new())
    }

    fn normal_visited(&mut self, id: TypeId, visited: &mut HashSet<TypeId>) -> TypeId {
        if !visited.insert(id) {
            // A cycle of unassigned vars or poly applications; leave as is.
            return id;
        }

        match self.types[id].data.clone() {
            TypeData::Var { value: Some(value), .. } => self.normal_visited(value, visited),
            TypeData::PolyApply { poly, arg } => {
                let npoly = self.normal_visited(poly, visited);
                match self.types[npoly].data.clone() {
                    TypeData::Poly { arg: var, body } => {
                        let substituted = self.subst(body, var, arg);
                        self.normal_visited(substituted, visited)
                    }
                    // typeof(poly)<arg> is typeof(poly<arg>).
                    TypeData::TypeType { inner } => {
                        let loc = self.types[id].loc.clone();
                        let applied = self.new_poly_apply(loc.clone(), inner, arg);
                        let napplied = self.normal_visited(applied, visited);
                        self.new_type_type(loc, napplied)
                    }
                    _ => id,
                }
            }
            _ => id,
        }
    }

    // Substitute var := arg within body, allocating new types as needed.
    fn subst(&mut self, body: TypeId, var: TypeId, arg: TypeId) -> TypeId {
        let mut memo = std::collections::HashMap::new();
        self.subst_memo(body, var, arg, &mut memo)
    }

    fn subst_memo(
        &mut self,
        body: TypeId,
        var: TypeId,
        arg: TypeId,
        memo: &mut std::collections::HashMap<TypeId, TypeId>,
    ) -> TypeId {
        if body == var {
            return arg;
        }
        if let Some(done) = memo.get(&body) {
            return *done;
        }

        let loc = self.types[body].loc.clone();
        match self.types[body].data.clone() {
            TypeData::Data { datatype, fields } => {
                // Allocate the replacement up front so cycles through field
                // types resolve to it.
                let nid = self.alloc(
                    loc,
                    TypeData::Data { datatype, fields: Vec::new() },
                );
                memo.insert(body, nid);
                let nfields = fields
                    .iter()
                    .map(|(name, field)| {
                        (name.clone(), self.subst_memo(*field, var, arg, memo))
                    })
                    .collect();
                match &mut self.types[nid].data {
                    TypeData::Data { fields, .. } => *fields = nfields,
                    _ => unreachable!(),
                }
                nid
            }

            TypeData::Func { arg: farg, rtype } => {
                let narg = self.subst_memo(farg, var, arg, memo);
                let nrtype = self.subst_memo(rtype, var, arg, memo);
                let nid = self.new_func(loc, narg, nrtype);
                memo.insert(body, nid);
                nid
            }

            TypeData::Poly { arg: parg, body: pbody } => {
                // The binder shadows the substituted var.
                if parg == var {
                    return body;
                }
                let nbody = self.subst_memo(pbody, var, arg, memo);
                let nid = self.new_poly(loc, parg, nbody);
                memo.insert(body, nid);
                nid
            }

            TypeData::PolyApply { poly, arg: aarg } => {
                let npoly = self.subst_memo(poly, var, arg, memo);
                let narg = self.subst_memo(aarg, var, arg, memo);
                let nid = self.new_poly_apply(loc, npoly, narg);
                memo.insert(body, nid);
                nid
            }

            TypeData::Package { .. } => body,

            TypeData::Abstract { package, inner } => {
                let ninner = self.subst_memo(inner, var, arg, memo);
                let nid = self.new_abstract(loc, package, ninner);
                memo.insert(body, nid);
                nid
            }

            TypeData::TypeType { inner } => {
                let ninner = self.subst_memo(inner, var, arg, memo);
                let nid = self.new_type_type(loc, ninner);
                memo.insert(body, nid);
                nid
            }

            TypeData::Var { name, kind, value } => match value {
                None => body,
                Some(value) => {
                    let nid = self.new_var(name.clone(), kind);
                    memo.insert(body, nid);
                    let nvalue = self.subst_memo(value, var, arg, memo);
                    self.assign_var(nid, nvalue);
                    nid
                }
            },
        }
    }

    // Structural type equality, ignoring locations. Poly types compare up
    // to alpha renaming. Cyclic types terminate via the visited pair set.
    pub fn types_equal(&mut self, a: TypeId, b: TypeId) -> bool {
        let mut visited = HashSet::new();
        let mut binders = Vec::new();
        self.types_equal_rec(a, b, &mut visited, &mut binders)
    }

    fn types_equal_rec(
        &mut self,
        a: TypeId,
        b: TypeId,
        visited: &mut HashSet<(TypeId, TypeId)>,
        binders: &mut Vec<(TypeId, TypeId)>,
    ) -> bool {
        let a = self.normal(a);
        let b = self.normal(b);

        if a == b {
            return true;
        }
        if binders.iter().any(|&(x, y)| x == a && y == b) {
            return true;
        }
        if !visited.insert((a, b)) {
            // Assume equal on revisit; a difference will show up elsewhere.
            return true;
        }

        match (self.types[a].data.clone(), self.types[b].data.clone()) {
            (
                TypeData::Data { datatype: dta, fields: fa },
                TypeData::Data { datatype: dtb, fields: fb },
            ) => {
                dta == dtb
                    && fa.len() == fb.len()
                    && fa.iter().zip(fb.iter()).all(|((na, ta), (nb, tb))| {
                        na == nb && self.types_equal_rec(*ta, *tb, visited, binders)
                    })
            }

            (
                TypeData::Func { arg: aa, rtype: ra },
                TypeData::Func { arg: ab, rtype: rb },
            ) => {
                self.types_equal_rec(aa, ab, visited, binders)
                    && self.types_equal_rec(ra, rb, visited, binders)
            }

            (
                TypeData::Poly { arg: va, body: ba },
                TypeData::Poly { arg: vb, body: bb },
            ) => {
                if self.kind(va) != self.kind(vb) {
                    return false;
                }
                binders.push((va, vb));
                let result = self.types_equal_rec(ba, bb, visited, binders);
                binders.pop();
                result
            }

            (
                TypeData::PolyApply { poly: pa, arg: aa },
                TypeData::PolyApply { poly: pb, arg: ab },
            ) => {
                self.types_equal_rec(pa, pb, visited, binders)
                    && self.types_equal_rec(aa, ab, visited, binders)
            }

            (
                TypeData::Package { path: patha, .. },
                TypeData::Package { path: pathb, .. },
            ) => patha == pathb,

            (
                TypeData::Abstract { package: pa, inner: ia },
                TypeData::Abstract { package: pb, inner: ib },
            ) => {
                let paths_equal = match (&self.types[pa].data, &self.types[pb].data) {
                    (
                        TypeData::Package { path: patha, .. },
                        TypeData::Package { path: pathb, .. },
                    ) => patha == pathb,
                    _ => false,
                };
                paths_equal && self.types_equal_rec(ia, ib, visited, binders)
            }

            // A transparent abstract type unifies with its underlying type.
            (TypeData::Abstract { package, inner }, _) => {
                !self.package_opaque(package)
                    && self.types_equal_rec(inner, b, visited, binders)
            }
            (_, TypeData::Abstract { package, inner }) => {
                !self.package_opaque(package)
                    && self.types_equal_rec(a, inner, visited, binders)
            }

            (
                TypeData::TypeType { inner: ia },
                TypeData::TypeType { inner: ib },
            ) => self.types_equal_rec(ia, ib, visited, binders),

            (TypeData::Var { .. }, TypeData::Var { .. }) => false,

            _ => false,
        }
    }

    fn package_opaque(&self, package: TypeId) -> bool {
        match &self.types[package].data {
            TypeData::Package { path, opaque } => {
                *opaque && self.transparent.as_ref() != Some(path)
            }
            _ => unreachable!("abstract type without package"),
        }
    }

    // First-order unification of actual against expected, assigning values
    // to the given unassigned type variables where expected mentions them.
    //
    // Returns false on a structural mismatch or when a variable receives
    // two incompatible assignments.
    pub fn infer(
        &mut self,
        vars: &mut Vec<TypeAssignment>,
        expected: TypeId,
        actual: TypeId,
    ) -> bool {
        let mut visited = HashSet::new();
        self.infer_rec(vars, expected, actual, &mut visited)
    }

    fn infer_rec(
        &mut self,
        vars: &mut Vec<TypeAssignment>,
        expected: TypeId,
        actual: TypeId,
        visited: &mut HashSet<(TypeId, TypeId)>,
    ) -> bool {
        let expected = self.normal(expected);
        let actual = self.normal(actual);

        if !visited.insert((expected, actual)) {
            return true;
        }

        if let Some(i) = vars.iter().position(|v| v.var == expected) {
            match vars[i].value {
                None => {
                    vars[i].value = Some(actual);
                    return true;
                }
                Some(value) => return self.types_equal(value, actual),
            }
        }

        match (self.types[expected].data.clone(), self.types[actual].data.clone()) {
            (
                TypeData::Data { datatype: dta, fields: fa },
                TypeData::Data { datatype: dtb, fields: fb },
            ) if dta == dtb && fa.len() == fb.len() => {
                for ((na, ta), (nb, tb)) in fa.iter().zip(fb.iter()) {
                    if na != nb {
                        return false;
                    }
                    if !self.infer_rec(vars, *ta, *tb, visited) {
                        return false;
                    }
                }
                true
            }

            (
                TypeData::Func { arg: aa, rtype: ra },
                TypeData::Func { arg: ab, rtype: rb },
            ) => {
                self.infer_rec(vars, aa, ab, visited)
                    && self.infer_rec(vars, ra, rb, visited)
            }

            (
                TypeData::TypeType { inner: ia },
                TypeData::TypeType { inner: ib },
            ) => self.infer_rec(vars, ia, ib, visited),

            (
                TypeData::Abstract { inner: ia, .. },
                TypeData::Abstract { inner: ib, .. },
            ) => {
                self.types_equal(expected, actual)
                    || self.infer_rec(vars, ia, ib, visited)
            }

            (
                TypeData::PolyApply { poly: pa, arg: aa },
                TypeData::PolyApply { poly: pb, arg: ab },
            ) => {
                self.infer_rec(vars, pa, pb, visited)
                    && self.infer_rec(vars, aa, ab, visited)
            }

            // No variable to solve at this position; fall back to plain
            // type equality.
            _ => self.types_equal(expected, actual),
        }
    }

    // Strip outer poly binders, registering a fresh unassigned variable for
    // each in vars, and return the instantiated body.
    pub fn depoly(&mut self, id: TypeId, vars: &mut Vec<TypeAssignment>) -> TypeId {
        let mut id = self.normal(id);
        loop {
            match self.types[id].data.clone() {
                TypeData::Poly { arg, body } => {
                    let (name, kind) = match &self.types[arg].data {
                        TypeData::Var { name, kind, .. } => (name.clone(), kind.clone()),
                        _ => unreachable!("poly binder is not a var"),
                    };
                    let fresh = self.new_var(name, kind);
                    vars.push(TypeAssignment { var: fresh, value: None });
                    let body = self.subst(body, arg, fresh);
                    id = self.normal(body);
                }
                _ => return id,
            }
        }
    }

    // Render a type in roughly the surface syntax, for error messages.
    pub fn display(&self, id: TypeId) -> String {
        let mut out = String::new();
        self.display_rec(id, &mut out, &mut HashSet::new());
        out
    }

    fn display_rec(&self, id: TypeId, out: &mut String, visited: &mut HashSet<TypeId>) {
        if !visited.insert(id) {
            out.push_str("...");
            return;
        }

        match &self.types[id].data {
            TypeData::Data { datatype, fields } => {
                out.push(match datatype {
                    DataTypeTag::Struct => '*',
                    DataTypeTag::Union => '+',
                });
                out.push('(');
                for (i, (name, field)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.display_rec(*field, out, visited);
                    let _ = write!(out, " {}", name);
                }
                out.push(')');
            }

            TypeData::Func { arg, rtype } => {
                out.push('(');
                self.display_rec(*arg, out, visited);
                out.push_str(") { ");
                self.display_rec(*rtype, out, visited);
                out.push_str("; }");
            }

            TypeData::Poly { arg, body } => {
                let _ = write!(out, "<");
                match &self.types[*arg].data {
                    TypeData::Var { name, kind, .. } => {
                        let _ = write!(out, "{} {}", kind, name);
                    }
                    _ => out.push('?'),
                }
                out.push_str("> { ");
                self.display_rec(*body, out, visited);
                out.push_str("; }");
            }

            TypeData::PolyApply { poly, arg } => {
                self.display_rec(*poly, out, visited);
                out.push('<');
                self.display_rec(*arg, out, visited);
                out.push('>');
            }

            TypeData::Package { path, .. } => {
                let _ = write!(out, "@({})", path);
            }

            TypeData::Abstract { package, inner } => {
                match &self.types[*package].data {
                    TypeData::Package { path, .. } => {
                        let _ = write!(out, "{}.<", path);
                    }
                    _ => out.push_str("?.<"),
                }
                self.display_rec(*inner, out, visited);
                out.push('>');
            }

            TypeData::TypeType { inner } => {
                out.push_str("@<");
                self.display_rec(*inner, out, visited);
                out.push('>');
            }

            TypeData::Var { name, .. } => {
                let _ = write!(out, "{}", name);
            }
        }

        visited.remove(&id);
    }
}


// Lift a kind by one level, as typeof does.
pub fn lift_kind(kind: &Kind) -> Kind {
    match kind {
        Kind::Basic(level) => Kind::Basic(level + 1),
        Kind::Poly(arg, rkind) => Kind::Poly(arg.clone(), Box::new(lift_kind(rkind))),
    }
}
