// The type checker.
//
// Turns untyped ast::Expr into typed tc::Tc, resolving names to variable
// indices, checking and then erasing types, and inferring type arguments
// for polymorphic application. Failure is reported to stderr with source
// locations; the result is None and the caller short-circuits.

use crate::ast::{self, Arg, Binding, ExprBody};
use crate::kind::{DataTypeTag, Kind};
use crate::name::{Loc, ModulePath, Name, Namespace};
use crate::program::{LoadedModule, LoadedProgram};
use crate::tc::{Tc, TcBinding, TcBody, TcRef};
use crate::types::{TypeAssignment, TypeData, TypeHeap, TypeId};
use crate::var::Var;


// The name of a variable in scope: a normal name, or a module path bound
// as an argument to the module body.
#[derive(Clone, Debug, PartialEq)]
enum VarName {
    Normal(Name),
    Module(ModulePath),
}


impl VarName {
    fn as_name(&self) -> Name {
        match self {
            VarName::Normal(name) => name.clone(),
            VarName::Module(path) => path.full_name(),
        }
    }
}


// What a variable compiles to. Type-level variables carry a type but no
// runtime value; references to them synthesize a type value.
#[derive(Copy, Clone, Debug, PartialEq)]
enum ScopeVar {
    TypeLevel,
    Runtime(Var),
}


struct ScopeEntry {
    name: VarName,
    type_: TypeId,
    used: bool,
    var: ScopeVar,
}


struct Scope {
    statics: Vec<ScopeEntry>,
    args: Vec<ScopeEntry>,
    locals: Vec<ScopeEntry>,

    // Number of runtime local variables in scope. Type-level locals do not
    // consume local variable indices.
    allocated_locals: usize,

    // Where to record the sources of captured variables. None means this
    // scope does not capture: lookups that pass through it are phantom.
    captured: Option<Vec<Var>>,
}


type Checked = Option<(TypeId, TcRef)>;


struct TypeChecker<'a> {
    th: &'a mut TypeHeap,
    scopes: Vec<Scope>,
    module: ModulePath,
}


impl<'a> TypeChecker<'a> {
    fn new(th: &'a mut TypeHeap, module: ModulePath) -> TypeChecker<'a> {
        TypeChecker { th, scopes: Vec::new(), module }
    }

    // ---- scope management ----

    fn push_scope(&mut self, args: Vec<(VarName, TypeId)>, capturing: bool) {
        let args = args
            .into_iter()
            .enumerate()
            .map(|(i, (name, type_))| ScopeEntry {
                name,
                type_,
                used: false,
                var: ScopeVar::Runtime(Var::arg(i)),
            })
            .collect();
        self.scopes.push(Scope {
            statics: Vec::new(),
            args,
            locals: Vec::new(),
            allocated_locals: 0,
            captured: if capturing { Some(Vec::new()) } else { None },
        });
    }

    // Pop a scope, returning the captured variable sources and the names
    // of the static variables.
    fn pop_scope(&mut self) -> (Vec<Var>, Vec<Name>) {
        let scope = self.scopes.pop().unwrap();
        let statics = scope.statics.iter().map(|entry| entry.name.as_name()).collect();
        (scope.captured.unwrap_or_default(), statics)
    }

    fn push_local_var(&mut self, name: VarName, type_: TypeId) {
        let scope = self.scopes.last_mut().unwrap();
        let index = scope.allocated_locals;
        scope.allocated_locals += 1;
        scope.locals.push(ScopeEntry {
            name,
            type_,
            used: false,
            var: ScopeVar::Runtime(Var::local(index)),
        });
    }

    fn push_local_type_var(&mut self, name: VarName, type_: TypeId) {
        let scope = self.scopes.last_mut().unwrap();
        scope.locals.push(ScopeEntry { name, type_, used: false, var: ScopeVar::TypeLevel });
    }

    fn pop_local_var(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        if let Some(entry) = scope.locals.pop() {
            if entry.var != ScopeVar::TypeLevel {
                scope.allocated_locals -= 1;
            }
        }
    }

    fn local_used(&self, index_from_top: usize) -> bool {
        let scope = self.scopes.last().unwrap();
        scope.locals[index_from_top].used
    }

    fn set_local_type(&mut self, index: usize, type_: TypeId) {
        self.scopes.last_mut().unwrap().locals[index].type_ = type_;
    }

    // Look up a variable, marking it used and capturing it across function
    // boundaries as needed. Phantom lookups have no side effects on use
    // tracking or capture.
    fn get_var(&mut self, name: &VarName, phantom: bool) -> Option<(TypeId, ScopeVar)> {
        let top = self.scopes.len().checked_sub(1)?;
        self.get_var_at(top, name, phantom)
    }

    fn get_var_at(
        &mut self,
        level: usize,
        name: &VarName,
        phantom: bool,
    ) -> Option<(TypeId, ScopeVar)> {
        {
            let scope = &mut self.scopes[level];
            for entry in scope.locals.iter_mut().rev() {
                if &entry.name == name {
                    if !phantom && entry.var != ScopeVar::TypeLevel {
                        entry.used = true;
                    }
                    return Some((entry.type_, entry.var));
                }
            }
            for entry in scope.args.iter_mut().rev() {
                if &entry.name == name {
                    if !phantom {
                        entry.used = true;
                    }
                    return Some((entry.type_, entry.var));
                }
            }
            for entry in scope.statics.iter_mut() {
                if &entry.name == name {
                    if !phantom {
                        entry.used = true;
                    }
                    return Some((entry.type_, entry.var));
                }
            }
        }

        if level == 0 {
            return None;
        }

        let parent_phantom = self.scopes[level].captured.is_none() || phantom;
        let (type_, var) = self.get_var_at(level - 1, name, parent_phantom)?;

        if phantom || var == ScopeVar::TypeLevel {
            // The variable's value is never needed; no capture required.
            return Some((type_, var));
        }

        let scope = &mut self.scopes[level];
        let index = scope.statics.len();
        scope.statics.push(ScopeEntry {
            name: name.clone(),
            type_,
            used: true,
            var: ScopeVar::Runtime(Var::static_(index)),
        });
        if let Some(captured) = &mut scope.captured {
            match var {
                ScopeVar::Runtime(var) => captured.push(var),
                ScopeVar::TypeLevel => unreachable!(),
            }
        }
        Some((type_, ScopeVar::Runtime(Var::static_(index))))
    }

    // ---- helpers ----

    // Checks that the right namespace is used for a variable: normal names
    // for values, type names for types.
    fn check_name_space(&mut self, name: &Name, type_: TypeId) -> bool {
        let level = self.th.kind(type_).level();
        let matched = (level == 0 && name.space == Namespace::Normal)
            || (level == 1 && name.space == Namespace::Type);
        if !matched {
            name.loc.report_error(&format!(
                "the namespace of '{}' is not appropriate for something of type {}",
                name,
                self.th.display(type_)
            ));
        }
        matched
    }

    // A placeholder type for a binding declared with a kind instead of a
    // type. For a type binding the variable is wrapped in typeof, so that
    // the name refers to the type itself.
    fn new_var_type(&mut self, name: &Name, source_kind: &Kind) -> TypeId {
        let level = source_kind.level();

        // An abstract value, such as '% True = ...', gets the made up type
        // name __True@ to avoid confusing it with a type named True@.
        let type_name = if level == 0 {
            Name::type_name(&format!("__{}", name.name), name.loc.clone())
        } else {
            Name { name: name.name.clone(), space: Namespace::Type, loc: name.loc.clone() }
        };

        let var = self.th.new_var(type_name, source_kind.with_level(0));
        let mut type_ = var;
        for _ in 0..level {
            type_ = self.th.new_type_type(name.loc.clone(), type_);
        }
        type_
    }

    // Apply a poly to a type argument. Handles the two meanings of type
    // application: instantiating a type-level function, and constructing
    // an abstract type from a package type.
    fn poly_apply(
        &mut self,
        poly: &(TypeId, TcRef),
        arg_type: TypeId,
        expr_loc: &Loc,
        arg_loc: &Loc,
    ) -> Checked {
        if let Kind::Poly(expected_kind, _) = self.th.kind(poly.0) {
            let actual_kind = self.th.kind(arg_type);
            if *expected_kind != actual_kind {
                arg_loc.report_error(&format!(
                    "expected kind {}, but found something of kind {}",
                    expected_kind, actual_kind
                ));
                return None;
            }

            let arg = match self.th.value_of_type(arg_type) {
                Some(arg) => arg,
                None => {
                    arg_loc.report_error("expected type, but found something of kind %");
                    return None;
                }
            };

            let pat = self.th.new_poly_apply(expr_loc.clone(), poly.0, arg);
            return Some((pat, poly.1.clone()));
        }

        if let Some(poly_value) = self.th.value_of_type(poly.0) {
            let norm = self.th.normal(poly_value);
            if let TypeData::Package { .. } = self.th.get(norm).data {
                let arg = match self.th.value_of_type(arg_type) {
                    Some(arg) => arg,
                    None => {
                        arg_loc.report_error("expected type, but found something of kind %");
                        return None;
                    }
                };

                let abs = self.th.new_abstract(expr_loc.clone(), norm, arg);
                let tt = self.th.new_type_type(expr_loc.clone(), abs);
                return Some((tt, Tc::new(expr_loc.clone(), TcBody::TypeValue)));
            }
        }

        expr_loc.report_error("type application requires a poly or package type");
        None
    }

    // Infer values for type variables from the argument types, then check
    // the arguments and apply the poly to the inferred types.
    fn type_infer_args(
        &mut self,
        mut vars: Vec<TypeAssignment>,
        expected: &[TypeId],
        actual: &[(TypeId, TcRef)],
        poly: (TypeId, TcRef),
        loc: &Loc,
    ) -> Checked {
        let mut error = false;

        if expected.len() != actual.len() {
            loc.report_error(&format!(
                "expected {} args, but found {}",
                expected.len(),
                actual.len()
            ));
            return None;
        }

        for (e, a) in expected.iter().zip(actual.iter()) {
            if !self.th.infer(&mut vars, *e, a.0) {
                a.1.loc.report_error(&format!(
                    "expected type {}, but found {}",
                    self.th.display(*e),
                    self.th.display(a.0)
                ));
                error = true;
            }
        }

        // Applying the poly to each inferred type also checks kinds.
        let mut result = poly;
        if !error {
            for i in 0..vars.len() {
                match vars[i].value {
                    None => {
                        loc.report_error("unable to infer types for poly.");
                        error = true;
                        break;
                    }
                    Some(value) => {
                        let tt = self.th.new_type_type(loc.clone(), value);
                        match self.poly_apply(&result, tt, loc, loc) {
                            Some(applied) => result = applied,
                            None => {
                                error = true;
                                break;
                            }
                        }
                    }
                }
            }
        }

        if error {
            if !vars.is_empty() {
                eprintln!("Inferred types:");
                for var in vars.iter() {
                    let name = self.th.display(var.var);
                    match var.value {
                        Some(value) => eprintln!("  {}: {}", name, self.th.display(value)),
                        None => eprintln!("  {}: ???", name),
                    }
                }
            }
            return None;
        }

        Some(result)
    }

    // The element type of the canonical list shape the given type must
    // have: +(*(T, List) cons, *() nil).
    fn list_element_type(&mut self, list_type: TypeId) -> Option<TypeId> {
        let norm = self.th.normal(list_type);
        let fields = match &self.th.get(norm).data {
            TypeData::Data { datatype: DataTypeTag::Union, fields } if fields.len() == 2 => {
                fields.clone()
            }
            _ => return None,
        };

        let cons_norm = self.th.normal(fields[0].1);
        let cons_fields = match &self.th.get(cons_norm).data {
            TypeData::Data { datatype: DataTypeTag::Struct, fields } if fields.len() == 2 => {
                fields.clone()
            }
            _ => return None,
        };

        let nil_norm = self.th.normal(fields[1].1);
        match &self.th.get(nil_norm).data {
            TypeData::Data { datatype: DataTypeTag::Struct, fields } if fields.is_empty() => (),
            _ => return None,
        }

        if !self.th.types_equal(cons_fields[1].1, list_type) {
            return None;
        }

        Some(cons_fields[0].1)
    }

    // ---- expression checking ----

    fn check_expr(&mut self, expr: &ast::Node) -> Checked {
        let loc = expr.loc.clone();
        match &expr.body {
            ExprBody::DataType(..)
            | ExprBody::FuncType(..)
            | ExprBody::PackageType(..)
            | ExprBody::Typeof(..) => {
                let type_ = self.check_type(expr)?;
                let tt = self.th.new_type_type(loc.clone(), type_);
                Some((tt, Tc::new(loc, TcBody::TypeValue)))
            }

            ExprBody::Var(name) => {
                let var_name = VarName::Normal(name.clone());
                match self.get_var(&var_name, false) {
                    None => {
                        name.loc.report_error(&format!("variable '{}' not defined", name));
                        None
                    }
                    Some((type_, ScopeVar::TypeLevel)) => {
                        Some((type_, Tc::new(loc, TcBody::TypeValue)))
                    }
                    Some((type_, ScopeVar::Runtime(var))) => {
                        Some((type_, Tc::new(loc, TcBody::Var(var))))
                    }
                }
            }

            ExprBody::Let(bindings, body) => self.check_let(&loc, bindings, body),

            ExprBody::StructValueImplicitType(args) => {
                let mut error = false;
                let mut checked: Vec<Checked> = Vec::new();
                for (_, arg) in args.iter() {
                    let arg = self.check_expr(arg);
                    error = error || arg.is_none();
                    checked.push(arg);
                }

                let mut fields = Vec::new();
                for (i, (name, _)) in args.iter().enumerate() {
                    if let Some((type_, _)) = &checked[i] {
                        if !self.check_name_space(name, *type_) {
                            error = true;
                        }
                        fields.push((name.clone(), *type_));
                    }

                    for (other, _) in args[..i].iter() {
                        if name == other {
                            name.loc.report_error(&format!("duplicate field name '{}'", name));
                            error = true;
                        }
                    }
                }

                if error {
                    return None;
                }

                let struct_type = self.th.new_data(loc.clone(), DataTypeTag::Struct, fields);
                let tcs = checked.into_iter().map(|c| c.unwrap().1).collect();
                Some((struct_type, Tc::new(loc, TcBody::StructValue(tcs))))
            }

            ExprBody::StructCopy(src, args) => self.check_struct_copy(&loc, src, args),

            ExprBody::UnionValue(type_expr, field, arg) => {
                let type_ = self.check_type(type_expr)?;

                let mut vars = Vec::new();
                let union_type = self.th.depoly(type_, &mut vars);
                let fields = match &self.th.get(union_type).data {
                    TypeData::Data { datatype: DataTypeTag::Union, fields } => fields.clone(),
                    _ => {
                        type_expr.loc.report_error(&format!(
                            "expected a union type, but found {}",
                            self.th.display(type_)
                        ));
                        return None;
                    }
                };

                let tag = match fields.iter().position(|(name, _)| name == field) {
                    Some(tag) => tag,
                    None => {
                        field.loc.report_error(&format!(
                            "'{}' is not a field of type {}",
                            field,
                            self.th.display(type_)
                        ));
                        return None;
                    }
                };

                let arg = self.check_expr(arg)?;
                let arg_tc = arg.1.clone();

                let dummy = (type_, Tc::new(loc.clone(), TcBody::TypeValue));
                let (rtype, _) = self.type_infer_args(
                    vars,
                    &[fields[tag].1],
                    &[arg],
                    dummy,
                    &loc,
                )?;

                Some((rtype, Tc::new(loc, TcBody::UnionValue { tag, arg: arg_tc })))
            }

            ExprBody::UnionSelect(condition, choices, default_) => {
                self.check_union_select(&loc, condition, choices, default_)
            }

            ExprBody::DataAccess(object, field) => {
                let obj = self.check_expr(object)?;

                let norm = self.th.normal(obj.0);
                let (datatype, fields) = match &self.th.get(norm).data {
                    TypeData::Data { datatype, fields } => (*datatype, fields.clone()),
                    _ => {
                        object.loc.report_error(&format!(
                            "expected value of type struct or union, but found value of type {}",
                            self.th.display(obj.0)
                        ));
                        return None;
                    }
                };

                match fields.iter().position(|(name, _)| name == field) {
                    Some(tag) => Some((
                        fields[tag].1,
                        Tc::new(
                            loc,
                            TcBody::DataAccess {
                                datatype,
                                obj: obj.1,
                                tag,
                                loc: field.loc.clone(),
                            },
                        ),
                    )),
                    None => {
                        field.loc.report_error(&format!(
                            "'{}' is not a field of type {}",
                            field,
                            self.th.display(obj.0)
                        ));
                        None
                    }
                }
            }

            ExprBody::FuncValue(args, body) => self.check_func_value(&loc, args, body),

            ExprBody::PolyValue(kind, name, body) => {
                if kind.level() != 1 {
                    name.loc
                        .report_error(&format!("expected a type kind, but found {}", kind));
                    return None;
                }

                if name.space != Namespace::Type {
                    name.loc.report_error(&format!(
                        "the namespace of '{}' is not appropriate for kind {}",
                        name, kind
                    ));
                    return None;
                }

                let arg_type = self.new_var_type(name, kind);
                let arg = self.th.value_of_type(arg_type).unwrap();

                self.push_local_type_var(VarName::Normal(name.clone()), arg_type);
                let body = self.check_expr(body);
                self.pop_local_var();

                let (body_type, body_tc) = body?;
                let pt = self.th.new_poly(loc, arg, body_type);

                // Poly application erases; the value of a poly is the value
                // of its body.
                Some((pt, body_tc))
            }

            ExprBody::PolyApply(poly, arg) => {
                let poly = self.check_expr(poly)?;
                let arg_type = self.check_expr_for_type(arg)?;
                self.poly_apply(&poly, arg_type, &loc, &arg.loc)
            }

            ExprBody::List(func, args) => self.check_list(&loc, func, args),

            ExprBody::Literal(func, word) => self.check_literal(&loc, func, word),

            ExprBody::Apply(func, args) => self.check_apply(&loc, func, args),

            ExprBody::AbstractCast(package_expr, target_expr, value_expr) => {
                let package_type = self.check_type(package_expr)?;
                let norm = self.th.normal(package_type);
                let path = match &self.th.get(norm).data {
                    TypeData::Package { path, .. } => path.clone(),
                    _ => {
                        package_expr.loc.report_error(&format!(
                            "expected package type, but found {}",
                            self.th.display(package_type)
                        ));
                        return None;
                    }
                };

                let target = self.check_type(target_expr)?;
                let value = self.check_expr(value_expr)?;

                if !self.module.belongs_to(&path) {
                    loc.report_error(&format!(
                        "Module {} is not allowed access to package {}",
                        self.module, path
                    ));
                    return None;
                }

                // The cast is legal when the types match with the package
                // made transparent.
                self.th.set_transparent(Some(path.clone()));
                let legal = self.th.types_equal(target, value.0);
                self.th.set_transparent(None);

                if !legal {
                    loc.report_error(&format!(
                        "cannot cast value of type {} to {}",
                        self.th.display(value.0),
                        self.th.display(target)
                    ));
                    return None;
                }

                Some((target, value.1))
            }

            ExprBody::AbstractAccess(value_expr) => {
                let value = self.check_expr(value_expr)?;

                let norm = self.th.normal(value.0);
                let (package, inner) = match &self.th.get(norm).data {
                    TypeData::Abstract { package, inner } => (*package, *inner),
                    _ => {
                        loc.report_error(&format!(
                            "expected value of abstract type, but found some of type {}",
                            self.th.display(value.0)
                        ));
                        return None;
                    }
                };

                let path = match &self.th.get(package).data {
                    TypeData::Package { path, .. } => path.clone(),
                    _ => unreachable!("abstract type without package"),
                };

                if !self.module.belongs_to(&path) {
                    loc.report_error(&format!(
                        "Module {} is not allowed to access package {}",
                        self.module, path
                    ));
                    return None;
                }

                Some((inner, value.1))
            }

            ExprBody::ModulePath(path) => {
                let var_name = VarName::Module(path.clone());
                match self.get_var(&var_name, false) {
                    Some((type_, ScopeVar::Runtime(var))) => {
                        Some((type_, Tc::new(loc, TcBody::Var(var))))
                    }
                    _ => {
                        loc.report_error(&format!("module {} not in scope", path));
                        None
                    }
                }
            }
        }
    }

    fn check_let(&mut self, loc: &Loc, bindings: &[Binding], body: &ast::Node) -> Checked {
        let mut error = false;

        // Evaluate the types of the bindings and set up the new vars.
        let mut types: Vec<Option<TypeId>> = Vec::new();
        for (i, binding) in bindings.iter().enumerate() {
            let type_ = match (&binding.kind, &binding.type_) {
                (Some(kind), None) => Some(self.new_var_type(&binding.name, kind)),
                (None, Some(type_expr)) => {
                    let checked = self.check_type(type_expr);
                    error = error || checked.is_none();
                    checked
                }
                _ => unreachable!("binding has either a kind or a type"),
            };

            if let Some(type_) = type_ {
                if !self.check_name_space(&binding.name, type_) {
                    error = true;
                }
            }

            for other in bindings[..i].iter() {
                if binding.name == other.name {
                    binding.name.loc.report_error(&format!(
                        "duplicate variable name '{}'",
                        binding.name
                    ));
                    error = true;
                }
            }

            types.push(type_);
        }

        let base = self.scopes.last().unwrap().locals.len();
        for (i, binding) in bindings.iter().enumerate() {
            let type_ = types[i].unwrap_or_else(|| {
                // Placeholder for error recovery; never used for a tc.
                self.th.new_var(
                    Name::type_name(&binding.name.name, binding.name.loc.clone()),
                    Kind::Basic(0),
                )
            });
            self.push_local_var(VarName::Normal(binding.name.clone()), type_);
        }

        // Check the values of the bindings.
        let mut defs: Vec<Checked> = Vec::new();
        for (i, binding) in bindings.iter().enumerate() {
            let def = if error { None } else { self.check_expr(&binding.expr) };
            error = error || def.is_none();

            if let Some((def_type, _)) = &def {
                if binding.type_.is_some() {
                    let declared = types[i].unwrap();
                    if !self.th.types_equal(declared, *def_type) {
                        error = true;
                        binding.expr.loc.report_error(&format!(
                            "expected type {}, but found something of type {}",
                            self.th.display(declared),
                            self.th.display(*def_type)
                        ));
                        let dloc = self.th.loc(declared);
                        dloc.report_error(&format!("({} from here)", self.th.display(declared)));
                        let floc = self.th.loc(*def_type);
                        floc.report_error(&format!("({} from here)", self.th.display(*def_type)));
                    }
                } else {
                    let expected_kind = binding.kind.clone().unwrap();
                    let actual_kind = self.th.kind(*def_type);
                    if expected_kind != actual_kind {
                        binding.expr.loc.report_error(&format!(
                            "expected kind {}, but found something of kind {}",
                            expected_kind, actual_kind
                        ));
                        error = true;
                    }
                }
            }

            defs.push(def);
        }

        // A let is recursive iff some binding was used while checking the
        // definitions.
        let mut recursive = false;
        for i in 0..bindings.len() {
            recursive = recursive || self.local_used(base + i);
        }

        // Fill in the type values for bindings whose types were unknown.
        for (i, binding) in bindings.iter().enumerate() {
            if error || binding.kind.is_none() {
                continue;
            }
            let def_type = defs[i].as_ref().unwrap().0;
            let level = binding.kind.as_ref().unwrap().level();

            // The placeholder is wrapped in one typeof per kind level; the
            // definition's type unwraps the same number of times. The kind
            // check above guarantees the levels line up.
            let mut target = types[i].unwrap();
            for _ in 0..level {
                target = match &self.th.get(target).data {
                    TypeData::TypeType { inner } => *inner,
                    _ => unreachable!("placeholder lost its typeof wrapper"),
                };
            }
            let mut value = def_type;
            for _ in 0..level {
                value = match self.th.value_of_type(value) {
                    Some(value) => value,
                    None => unreachable!("kind checked binding has no type value"),
                };
            }

            if !self.th.assign_var(target, value) {
                binding.name.loc.report_error(&format!("{} is vacuous", binding.name));
                error = true;
            }

            // For abstract value bindings, show the inferred type in later
            // error messages rather than the made up type name.
            if level == 0 {
                self.set_local_type(base + i, def_type);
            }
        }

        let body = if error { None } else { self.check_expr(body) };
        let error = error || body.is_none();

        for _ in bindings {
            self.pop_local_var();
        }

        if error {
            return None;
        }

        let (body_type, body_tc) = body.unwrap();
        let tc_bindings = bindings
            .iter()
            .zip(defs.into_iter())
            .map(|(binding, def)| TcBinding {
                name: binding.name.clone(),
                loc: binding.expr.loc.clone(),
                tc: def.unwrap().1,
            })
            .collect();

        Some((
            body_type,
            Tc::new(
                loc.clone(),
                TcBody::Let { recursive, bindings: tc_bindings, body: body_tc },
            ),
        ))
    }

    fn check_struct_copy(
        &mut self,
        loc: &Loc,
        src: &ast::Node,
        args: &[(Name, ast::Node)],
    ) -> Checked {
        let source = self.check_expr(src)?;

        let norm = self.th.normal(source.0);
        let fields = match &self.th.get(norm).data {
            TypeData::Data { datatype: DataTypeTag::Struct, fields } => fields.clone(),
            _ => {
                src.loc.report_error(&format!(
                    "expected value of struct type, but found value of type {}",
                    self.th.display(source.0)
                ));
                return None;
            }
        };

        let mut checked: Vec<Checked> = Vec::new();
        let mut error = false;
        for (_, arg) in args.iter() {
            let arg = self.check_expr(arg);
            error = error || arg.is_none();
            checked.push(arg);
        }
        if error {
            return None;
        }

        // Overrides must appear in field declaration order.
        let mut overrides: Vec<Option<TcRef>> = Vec::new();
        let mut a = 0;
        for (name, type_) in fields.iter() {
            if a < args.len() && &args[a].0 == name {
                let (arg_type, arg_tc) = checked[a].as_ref().unwrap();
                if !self.th.types_equal(*type_, *arg_type) {
                    args[a].1.loc.report_error(&format!(
                        "expected type {}, but found {}",
                        self.th.display(*type_),
                        self.th.display(*arg_type)
                    ));
                    error = true;
                }
                overrides.push(Some(arg_tc.clone()));
                a += 1;
            } else {
                overrides.push(None);
            }
        }

        if a < args.len() {
            args[a].0.loc.report_error(&format!(
                "expected next field in struct, but found '{}'",
                args[a].0
            ));
            error = true;
        }

        if error {
            return None;
        }

        Some((
            norm,
            Tc::new(
                loc.clone(),
                TcBody::StructCopy { source: source.1, fields: overrides },
            ),
        ))
    }

    fn check_union_select(
        &mut self,
        loc: &Loc,
        condition: &ast::Node,
        choices: &[ast::SelectChoice],
        default_expr: &Option<ast::Node>,
    ) -> Checked {
        let cond = self.check_expr(condition)?;

        let norm = self.th.normal(cond.0);
        let fields = match &self.th.get(norm).data {
            TypeData::Data { datatype: DataTypeTag::Union, fields } if !fields.is_empty() => {
                fields.clone()
            }
            _ => {
                condition.loc.report_error(&format!(
                    "expected value of union type, but found value of type {}",
                    self.th.display(cond.0)
                ));
                return None;
            }
        };

        let mut error = false;
        let mut result_type: Option<TypeId> = None;
        let mut default_: Option<TcBinding> = None;
        let mut default_used = false;

        if let Some(expr) = default_expr {
            if let Some((type_, tc)) = self.check_expr(expr) {
                default_ = Some(TcBinding {
                    name: Name::normal(":", expr.loc.clone()),
                    loc: expr.loc.clone(),
                    tc,
                });
                result_type = Some(type_);
            } else {
                error = true;
            }
        }

        let mut branch = 0;
        let mut branches: Vec<(usize, TcBinding)> = Vec::new();
        for (i, (field_name, _)) in fields.iter().enumerate() {
            if branch < choices.len() && &choices[branch].name == field_name {
                let choice = &choices[branch];
                match self.check_expr(&choice.expr) {
                    Some((type_, tc)) => {
                        branches.push((
                            i,
                            TcBinding {
                                name: choice.name.clone(),
                                loc: choice.expr.loc.clone(),
                                tc,
                            },
                        ));

                        match result_type {
                            None => result_type = Some(type_),
                            Some(expected) => {
                                if !self.th.types_equal(expected, type_) {
                                    choice.expr.loc.report_error(&format!(
                                        "expected type {}, but found {}",
                                        self.th.display(expected),
                                        self.th.display(type_)
                                    ));
                                    error = true;
                                }
                            }
                        }
                    }
                    None => error = true,
                }
                branch += 1;
            } else if default_expr.is_none() {
                error = true;
                if branch < choices.len() {
                    choices[branch].name.loc.report_error(&format!(
                        "expected tag '{}', but found '{}'",
                        field_name, choices[branch].name
                    ));
                } else {
                    loc.report_error(&format!(
                        "tag '{}' missing from union select",
                        field_name
                    ));
                }
            } else {
                default_used = true;
            }
        }

        if branch < choices.len() {
            error = true;
            choices[branch].name.loc.report_error(&format!(
                "illegal use of tag '{}' in union select",
                choices[branch].name
            ));
        }

        if error {
            return None;
        }

        // The select always carries a default. If the written default went
        // unused the final branch serves as the default instead.
        let default_ = if default_used {
            default_.unwrap()
        } else {
            branches.pop().unwrap().1
        };

        Some((
            result_type.unwrap(),
            Tc::new(
                loc.clone(),
                TcBody::UnionSelect {
                    condition: cond.1,
                    num_tags: fields.len(),
                    targets: branches,
                    default_,
                },
            ),
        ))
    }

    fn check_func_value(&mut self, loc: &Loc, args: &[Arg], body: &ast::Node) -> Checked {
        // Multi-argument functions are sugar for nested single-argument
        // functions.
        let arg = &args[0];
        let arg_type = self.check_type(&arg.type_)?;

        self.push_scope(
            vec![(VarName::Normal(arg.name.clone()), arg_type)],
            true,
        );

        let result = if args.len() > 1 {
            self.check_func_value(loc, &args[1..], body)
        } else {
            self.check_expr(body)
        };

        let (captured, statics) = self.pop_scope();
        let (body_type, body_tc) = result?;

        let ft = self.th.new_func(loc.clone(), arg_type, body_type);
        let tc = Tc::new(
            loc.clone(),
            TcBody::FuncValue {
                body_loc: body.loc.clone(),
                scope: captured,
                statics,
                args: vec![arg.name.clone()],
                body: body_tc,
            },
        );
        Some((ft, tc))
    }

    fn check_list(&mut self, loc: &Loc, func: &ast::Node, args: &[ast::Node]) -> Checked {
        let f = self.check_expr(func)?;

        let mut vars = Vec::new();
        let func_type = self.th.depoly(f.0, &mut vars);
        let (arg_type, _) = match &self.th.get(func_type).data {
            TypeData::Func { arg, rtype } => (*arg, *rtype),
            _ => {
                func.loc.report_error(&format!(
                    "expected a function, but found something of type {}",
                    self.th.display(f.0)
                ));
                return None;
            }
        };

        let elem_type = match self.list_element_type(arg_type) {
            Some(elem) => elem,
            None => {
                func.loc.report_error(&format!(
                    "expected a list type, but the input to the function has type {}",
                    self.th.display(arg_type)
                ));
                return None;
            }
        };

        let mut error = false;
        let mut checked: Vec<Checked> = Vec::new();
        for arg in args.iter() {
            let arg = self.check_expr(arg);
            error = error || arg.is_none();
            checked.push(arg);
        }
        if error {
            return None;
        }

        let checked: Vec<(TypeId, TcRef)> = checked.into_iter().map(|c| c.unwrap()).collect();
        let expected: Vec<TypeId> = vec![elem_type; checked.len()];

        let poly = self.type_infer_args(vars, &expected, &checked, f, loc)?;

        let norm = self.th.normal(poly.0);
        let rtype = match &self.th.get(norm).data {
            TypeData::Func { rtype, .. } => *rtype,
            _ => unreachable!("inferred list function is not a function"),
        };

        let fields = checked.into_iter().map(|(_, tc)| tc).collect();
        let list_tc = Tc::new(loc.clone(), TcBody::List(fields));
        Some((
            rtype,
            Tc::new(loc.clone(), TcBody::FuncApply { func: poly.1, arg: list_tc }),
        ))
    }

    fn check_literal(&mut self, loc: &Loc, func: &ast::Node, word: &str) -> Checked {
        let f = self.check_expr(func)?;

        let norm = self.th.normal(f.0);
        let (arg_type, rtype) = match &self.th.get(norm).data {
            TypeData::Func { arg, rtype } => (*arg, *rtype),
            _ => {
                func.loc.report_error(&format!(
                    "expected a function, but found something of type {}",
                    self.th.display(f.0)
                ));
                return None;
            }
        };

        let elem_type = match self.list_element_type(arg_type) {
            Some(elem) => elem,
            None => {
                func.loc.report_error(&format!(
                    "expected a list type, but the input to the function has type {}",
                    self.th.display(arg_type)
                ));
                return None;
            }
        };

        let enorm = self.th.normal(elem_type);
        let fields = match &self.th.get(enorm).data {
            TypeData::Data { datatype: DataTypeTag::Union, fields } => fields.clone(),
            _ => {
                func.loc.report_error(&format!(
                    "expected union type, but element type of literal expression is {}",
                    self.th.display(elem_type)
                ));
                return None;
            }
        };

        let unit_type = self.th.new_data(loc.clone(), DataTypeTag::Struct, vec![]);

        // Greedy longest-match tokenization of the word against the field
        // names. On a tie in length the first field wins.
        let mut letters = Vec::new();
        let mut rest = word;
        let mut letter_loc = loc.clone();
        while !rest.is_empty() {
            let mut maxlen = 0;
            let mut letter = 0;
            for (j, (field_name, _)) in fields.iter().enumerate() {
                let fname: &str = &field_name.name;
                if fname.len() > maxlen && rest.starts_with(fname) {
                    maxlen = fname.len();
                    letter = j;
                }
            }

            if maxlen == 0 {
                letter_loc.report_error(&format!(
                    "next letter of literal '{}' not found in type {}",
                    rest,
                    self.th.display(elem_type)
                ));
                return None;
            }

            if !self.th.types_equal(unit_type, fields[letter].1) {
                letter_loc.report_error(&format!(
                    "expected field type {}, but '{}' has field type {}",
                    self.th.display(unit_type),
                    fields[letter].0,
                    self.th.display(fields[letter].1)
                ));
                return None;
            }

            letters.push(letter);
            for c in rest[..maxlen].chars() {
                if c == '\n' {
                    letter_loc.line += 1;
                    letter_loc.col = 0;
                }
                letter_loc.col += 1;
            }
            rest = &rest[maxlen..];
        }

        let literal_tc = Tc::new(loc.clone(), TcBody::Literal(letters));
        Some((
            rtype,
            Tc::new(loc.clone(), TcBody::FuncApply { func: f.1, arg: literal_tc }),
        ))
    }

    fn check_apply(&mut self, loc: &Loc, func: &ast::Node, args: &[ast::Node]) -> Checked {
        let misc = self.check_expr(func);
        let mut error = misc.is_none();

        let mut checked: Vec<Checked> = Vec::new();
        for arg in args.iter() {
            let arg = self.check_expr(arg);
            error = error || arg.is_none();
            checked.push(arg);
        }

        if error {
            return None;
        }

        let misc = misc.unwrap();
        let checked: Vec<(TypeId, TcRef)> = checked.into_iter().map(|c| c.unwrap()).collect();

        let nmisc = self.th.normal(misc.0);
        if let TypeData::TypeType { inner } = self.th.get(nmisc).data.clone() {
            let vnorm = self.th.normal(inner);

            // Application of a package type constructs an abstract value.
            if let TypeData::Package { path, .. } = self.th.get(vnorm).data.clone() {
                if checked.len() != 1 {
                    loc.report_error(&format!(
                        "expected 1 argument, but {} provided",
                        checked.len()
                    ));
                    return None;
                }

                if !self.module.belongs_to(&path) {
                    loc.report_error(&format!(
                        "Module {} is not allowed access to package {}",
                        self.module, path
                    ));
                    return None;
                }

                let abs = self.th.new_abstract(loc.clone(), vnorm, checked[0].0);
                return Some((abs, checked[0].1.clone()));
            }

            // Application of a struct type is struct construction, with
            // type inference over the declared field types.
            let mut vars = Vec::new();
            let struct_type = self.th.depoly(inner, &mut vars);
            if let TypeData::Data { datatype: DataTypeTag::Struct, fields } =
                self.th.get(struct_type).data.clone()
            {
                let expected: Vec<TypeId> = fields.iter().map(|(_, t)| *t).collect();
                let vtc = (inner, misc.1.clone());
                let poly = self.type_infer_args(vars, &expected, &checked, vtc, loc)?;

                let tcs = checked.into_iter().map(|(_, tc)| tc).collect();
                return Some((poly.0, Tc::new(loc.clone(), TcBody::StructValue(tcs))));
            }
        }

        // Possibly polymorphic function application, with inference done
        // one argument at a time.
        let mut result = misc;
        for arg in checked.into_iter() {
            let mut vars = Vec::new();
            let pbody = self.th.depoly(result.0, &mut vars);

            match self.th.get(pbody).data.clone() {
                TypeData::Func { arg: arg_type, .. } => {
                    let arg_tc = arg.1.clone();
                    let poly =
                        self.type_infer_args(vars, &[arg_type], &[arg], result, loc)?;

                    let fnorm = self.th.normal(poly.0);
                    let rtype = match &self.th.get(fnorm).data {
                        TypeData::Func { rtype, .. } => *rtype,
                        _ => unreachable!("applied function lost its type"),
                    };

                    let tc = Tc::new(
                        loc.clone(),
                        TcBody::FuncApply { func: poly.1, arg: arg_tc },
                    );
                    result = (rtype, tc);
                }
                _ => {
                    loc.report_error(&format!(
                        "cannot apply arguments to something of type {}",
                        self.th.display(result.0)
                    ));
                    return None;
                }
            }
        }

        Some(result)
    }

    // Type check an expression used only for its type. Variable accesses
    // are phantom: they are not marked used and not captured.
    fn check_expr_for_type(&mut self, expr: &ast::Node) -> Option<TypeId> {
        self.push_scope(Vec::new(), false);
        let result = self.check_expr(expr);
        self.scopes.pop();
        result.map(|(type_, _)| type_)
    }

    // Type check a type, returning its value.
    fn check_type(&mut self, expr: &ast::Node) -> Option<TypeId> {
        let loc = expr.loc.clone();
        match &expr.body {
            ExprBody::Typeof(inner) => self.check_expr_for_type(inner),

            ExprBody::DataType(datatype, field_exprs) => {
                let mut fields = Vec::new();
                for (i, field) in field_exprs.iter().enumerate() {
                    let compiled = self.check_type(&field.type_)?;

                    if !self.check_name_space(&field.name, compiled) {
                        return None;
                    }

                    for other in field_exprs[..i].iter() {
                        if field.name == other.name {
                            field.name.loc.report_error(&format!(
                                "duplicate field name '{}'",
                                field.name
                            ));
                            return None;
                        }
                    }

                    fields.push((field.name.clone(), compiled));
                }
                Some(self.th.new_data(loc, *datatype, fields))
            }

            ExprBody::FuncType(arg, rtype) => {
                let arg = self.check_type(arg);
                let rtype = self.check_type(rtype);
                Some(self.th.new_func(loc, arg?, rtype?))
            }

            ExprBody::PackageType(path) => {
                Some(self.th.new_package(loc, path.clone(), true))
            }

            _ => {
                let type_type = self.check_expr_for_type(expr)?;
                match self.th.value_of_type(type_type) {
                    Some(type_value) => Some(type_value),
                    None => {
                        loc.report_error(&format!(
                            "expected a type, but found value of type {}",
                            self.th.display(type_type)
                        ));
                        None
                    }
                }
            }
        }
    }
}


// Whether the expression mentions the given name anywhere. Used for
// unused-variable warnings; shadowing is deliberately ignored.
fn expr_uses(expr: &ast::Node, name: &Name) -> bool {
    match &expr.body {
        ExprBody::Var(n) => n == name,
        ExprBody::Let(bindings, body) => {
            bindings.iter().any(|b| expr_uses(&b.expr, name))
                || bindings
                    .iter()
                    .any(|b| b.type_.as_ref().map_or(false, |t| expr_uses(t, name)))
                || expr_uses(body, name)
        }
        ExprBody::DataType(_, fields) => fields.iter().any(|f| expr_uses(&f.type_, name)),
        ExprBody::FuncType(arg, rtype) => expr_uses(arg, name) || expr_uses(rtype, name),
        ExprBody::Typeof(inner) => expr_uses(inner, name),
        ExprBody::StructValueImplicitType(args) => {
            args.iter().any(|(_, e)| expr_uses(e, name))
        }
        ExprBody::StructCopy(src, args) => {
            expr_uses(src, name) || args.iter().any(|(_, e)| expr_uses(e, name))
        }
        ExprBody::UnionValue(type_, _, arg) => {
            expr_uses(type_, name) || expr_uses(arg, name)
        }
        ExprBody::UnionSelect(condition, choices, default_) => {
            expr_uses(condition, name)
                || choices.iter().any(|c| expr_uses(&c.expr, name))
                || default_.as_ref().map_or(false, |d| expr_uses(d, name))
        }
        ExprBody::DataAccess(obj, _) => expr_uses(obj, name),
        ExprBody::FuncValue(args, body) => {
            args.iter().any(|a| expr_uses(&a.type_, name)) || expr_uses(body, name)
        }
        ExprBody::PolyValue(_, _, body) => expr_uses(body, name),
        ExprBody::PolyApply(poly, arg) => expr_uses(poly, name) || expr_uses(arg, name),
        ExprBody::List(func, args) => {
            expr_uses(func, name) || args.iter().any(|a| expr_uses(a, name))
        }
        ExprBody::Literal(func, _) => expr_uses(func, name),
        ExprBody::Apply(func, args) => {
            expr_uses(func, name) || args.iter().any(|a| expr_uses(a, name))
        }
        ExprBody::AbstractCast(package, target, value) => {
            expr_uses(package, name) || expr_uses(target, name) || expr_uses(value, name)
        }
        ExprBody::AbstractAccess(value) => expr_uses(value, name),
        ExprBody::ModulePath(_) => false,
        ExprBody::PackageType(_) => false,
    }
}


// Warn about let bindings that are never mentioned again. Names starting
// with an underscore are exempt.
fn warn_about_unused_vars(expr: &ast::Node) {
    match &expr.body {
        ExprBody::Let(bindings, body) => {
            for binding in bindings.iter() {
                warn_about_unused_vars(&binding.expr);
            }
            warn_about_unused_vars(body);

            for binding in bindings.iter() {
                if binding.name.name.starts_with('_') {
                    continue;
                }
                let used = bindings.iter().any(|b| expr_uses(&b.expr, &binding.name))
                    || expr_uses(body, &binding.name);
                if !used {
                    binding.name.loc.report_warning(&format!(
                        "variable '{}' defined but not used",
                        binding.name
                    ));
                }
            }
        }

        ExprBody::FuncValue(_, body) => warn_about_unused_vars(body),
        ExprBody::PolyValue(_, _, body) => warn_about_unused_vars(body),
        ExprBody::UnionSelect(condition, choices, default_) => {
            warn_about_unused_vars(condition);
            for choice in choices.iter() {
                warn_about_unused_vars(&choice.expr);
            }
            if let Some(default_) = default_ {
                warn_about_unused_vars(default_);
            }
        }

        _ => (),
    }
}


// Type check a module given the types of its dependencies.
//
// The result is the body of a function that takes the dependencies'
// computed values as arguments, together with the module's type.
fn check_module(
    th: &mut TypeHeap,
    module: &LoadedModule,
    dep_types: &[TypeId],
) -> Option<(TypeId, TcRef)> {
    let mut checker = TypeChecker::new(th, module.path.clone());

    let args = module
        .deps
        .iter()
        .zip(dep_types.iter())
        .map(|(path, type_)| (VarName::Module(path.clone()), *type_))
        .collect();
    checker.push_scope(args, false);

    let declared = match &module.type_ {
        Some(type_expr) => Some(checker.check_type(type_expr)?),
        None => None,
    };

    let value = match &module.value {
        Some(value_expr) => {
            let checked = checker.check_expr(value_expr);
            if checked.is_some() {
                warn_about_unused_vars(value_expr);
            }
            checked
        }
        None => {
            module
                .path
                .loc
                .report_error(&format!("module {} has no value", module.path));
            None
        }
    }?;

    if let Some(declared) = declared {
        if !th.types_equal(declared, value.0) {
            let loc = th.loc(value.0);
            loc.report_error(&format!(
                "the type {} does not match interface type {} for module {}",
                th.display(value.0),
                th.display(declared),
                module.path
            ));
            return None;
        }
    }

    Some(value)
}


// Type check a program, module by module in topological order. Each
// dependency contributes its type to the modules that follow.
pub fn type_check_program(program: &LoadedProgram) -> Option<Vec<TcRef>> {
    let mut th = TypeHeap::new();
    let mut types: Vec<Option<TypeId>> = Vec::new();
    let mut tcs: Vec<Option<TcRef>> = Vec::new();
    let mut error = false;

    for (i, module) in program.modules.iter().enumerate() {
        let mut dep_types = Vec::with_capacity(module.deps.len());
        let mut skip = false;
        for dep in module.deps.iter() {
            let found = program.modules[..i]
                .iter()
                .position(|m| &m.path == dep)
                .and_then(|t| types[t]);
            match found {
                Some(type_) => dep_types.push(type_),
                None => {
                    skip = true;
                    break;
                }
            }
        }

        let checked = if skip { None } else { check_module(&mut th, module, &dep_types) };
        match checked {
            Some((type_, tc)) => {
                types.push(Some(type_));
                tcs.push(Some(tc));
            }
            None => {
                error = true;
                types.push(None);
                tcs.push(None);
            }
        }
    }

    if error {
        return None;
    }
    Some(tcs.into_iter().map(|tc| tc.unwrap()).collect())
}


// Type check the main module of a program.
pub fn type_check_module(program: &LoadedProgram) -> Option<TcRef> {
    let tcs = type_check_program(program)?;
    tcs.into_iter().last()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::DataTypeTag::{Struct, Union};

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

    fn arg(type_: ast::Node, name: Name) -> Arg {
        Arg { type_, name }
    }

    fn unit_type() -> ast::Node {
        e(ExprBody::DataType(Struct, vec![]))
    }

    fn unit_value() -> ast::Node {
        e(ExprBody::StructValueImplicitType(vec![]))
    }

    fn bool_type() -> ast::Node {
        e(ExprBody::DataType(
            Union,
            vec![arg(unit_type(), n("true")), arg(unit_type(), n("false"))],
        ))
    }

    fn true_value() -> ast::Node {
        e(ExprBody::UnionValue(bool_type(), n("true"), unit_value()))
    }

    // @ X@ = expr
    fn tbind(name: &str, expr: ast::Node) -> Binding {
        Binding { kind: Some(Kind::Basic(1)), type_: None, name: tn(name), expr }
    }

    // % x = expr
    fn kbind(name: &str, expr: ast::Node) -> Binding {
        Binding { kind: Some(Kind::Basic(0)), type_: None, name: n(name), expr }
    }

    // <@>% x = expr, for bindings holding a polymorphic value.
    fn pbind(name: &str, expr: ast::Node) -> Binding {
        let kind = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(0)));
        Binding { kind: Some(kind), type_: None, name: n(name), expr }
    }

    // T x = expr
    fn vbind(type_: ast::Node, name: &str, expr: ast::Node) -> Binding {
        Binding { kind: None, type_: Some(type_), name: n(name), expr }
    }

    fn let_(bindings: Vec<Binding>, body: ast::Node) -> ast::Node {
        e(ExprBody::Let(bindings, body))
    }

    fn apply(func: ast::Node, args: Vec<ast::Node>) -> ast::Node {
        e(ExprBody::Apply(func, args))
    }

    fn check(expr: ast::Node) -> Option<TcRef> {
        let program = LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Main%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(expr),
            }],
        };
        type_check_module(&program)
    }

    #[test]
    fn test_unit_value() {
        let tc = check(unit_value()).unwrap();
        match &tc.body {
            TcBody::StructValue(fields) => assert!(fields.is_empty()),
            other => panic!("expected struct value, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable() {
        assert!(check(var("x")).is_none());
    }

    #[test]
    fn test_let_union_value() {
        // @ Bool@ = +(*() true, *() false); Bool@ x = Bool@(true: ()); x
        let expr = let_(
            vec![tbind("Bool", bool_type())],
            let_(
                vec![vbind(
                    tvar("Bool"),
                    "x",
                    e(ExprBody::UnionValue(tvar("Bool"), n("true"), unit_value())),
                )],
                var("x"),
            ),
        );
        let tc = check(expr).unwrap();

        match &tc.body {
            TcBody::Let { recursive, bindings, body } => {
                assert!(!*recursive);
                assert_eq!(bindings.len(), 1);
                match &body.body {
                    TcBody::Let { bindings, .. } => match &bindings[0].tc.body {
                        TcBody::UnionValue { tag, .. } => assert_eq!(*tag, 0),
                        other => panic!("expected union value, got {:?}", other),
                    },
                    other => panic!("expected inner let, got {:?}", other),
                }
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_union_field() {
        let expr = e(ExprBody::UnionValue(bool_type(), n("maybe"), unit_value()));
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_declared_type_mismatch() {
        // *() x = Bool@(true: ());
        let expr = let_(vec![vbind(unit_type(), "x", true_value())], var("x"));
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_poly_identity_with_inference() {
        // % Id = <@ T@>(T@ x) { x; }; Id(Bool@(true: ()))
        let id = e(ExprBody::PolyValue(
            Kind::Basic(1),
            tn("T"),
            e(ExprBody::FuncValue(vec![arg(tvar("T"), n("x"))], var("x"))),
        ));
        let expr = let_(vec![pbind("Id", id)], apply(var("Id"), vec![true_value()]));
        let tc = check(expr).unwrap();

        match &tc.body {
            TcBody::Let { bindings, body, .. } => {
                match &bindings[0].tc.body {
                    TcBody::FuncValue { args, .. } => assert_eq!(args.len(), 1),
                    other => panic!("expected func value, got {:?}", other),
                }
                match &body.body {
                    TcBody::FuncApply { .. } => (),
                    other => panic!("expected apply, got {:?}", other),
                }
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_poly_identity_explicit_apply() {
        // % Id = <@ T@>(T@ x) { x; }; Id<Bool@>(Bool@(true: ()))
        let id = e(ExprBody::PolyValue(
            Kind::Basic(1),
            tn("T"),
            e(ExprBody::FuncValue(vec![arg(tvar("T"), n("x"))], var("x"))),
        ));
        let expr = let_(
            vec![pbind("Id", id)],
            apply(
                e(ExprBody::PolyApply(var("Id"), bool_type())),
                vec![true_value()],
            ),
        );
        assert!(check(expr).is_some());
    }

    #[test]
    fn test_uninferable_poly() {
        // % F = <@ T@>(*() x) { x; }; F(())  -- nothing constrains T@.
        let f = e(ExprBody::PolyValue(
            Kind::Basic(1),
            tn("T"),
            e(ExprBody::FuncValue(vec![arg(unit_type(), n("x"))], var("x"))),
        ));
        let expr = let_(vec![pbind("F", f)], apply(var("F"), vec![unit_value()]));
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_recursive_let() {
        // (*()) { *(); } f = (*() x) { f(x); }; f
        let ftype = e(ExprBody::FuncType(unit_type(), unit_type()));
        let fval = e(ExprBody::FuncValue(
            vec![arg(unit_type(), n("x"))],
            apply(var("f"), vec![var("x")]),
        ));
        let expr = let_(vec![vbind(ftype, "f", fval)], var("f"));
        let tc = check(expr).unwrap();
        match &tc.body {
            TcBody::Let { recursive, .. } => assert!(*recursive),
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_vacuous_let() {
        // @ X@ = X@; ()
        let expr = let_(vec![tbind("X", tvar("X"))], unit_value());
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_namespace_violation() {
        // *() x@ = ();  -- a level 0 value bound in the type namespace.
        let expr = let_(
            vec![Binding {
                kind: None,
                type_: Some(unit_type()),
                name: tn("x"),
                expr: unit_value(),
            }],
            unit_value(),
        );
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_duplicate_struct_fields() {
        let expr = e(ExprBody::StructValueImplicitType(vec![
            (n("a"), unit_value()),
            (n("a"), unit_value()),
        ]));
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_union_select() {
        // Bool@ x = true; x.?(true: (), false: ())
        let select = e(ExprBody::UnionSelect(
            var("x"),
            vec![
                ast::SelectChoice { name: n("true"), expr: unit_value() },
                ast::SelectChoice { name: n("false"), expr: unit_value() },
            ],
            None,
        ));
        let expr = let_(vec![vbind(bool_type(), "x", true_value())], select);
        let tc = check(expr).unwrap();
        match &tc.body {
            TcBody::Let { body, .. } => match &body.body {
                TcBody::UnionSelect { num_tags, targets, .. } => {
                    assert_eq!(*num_tags, 2);
                    // The final branch doubles as the default.
                    assert_eq!(targets.len(), 1);
                }
                other => panic!("expected union select, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_union_select_missing_tag() {
        let select = e(ExprBody::UnionSelect(
            var("x"),
            vec![ast::SelectChoice { name: n("true"), expr: unit_value() }],
            None,
        ));
        let expr = let_(vec![vbind(bool_type(), "x", true_value())], select);
        assert!(check(expr).is_none());
    }

    #[test]
    fn test_union_select_default() {
        let select = e(ExprBody::UnionSelect(
            var("x"),
            vec![ast::SelectChoice { name: n("true"), expr: unit_value() }],
            Some(unit_value()),
        ));
        let expr = let_(vec![vbind(bool_type(), "x", true_value())], select);
        assert!(check(expr).is_some());
    }

    #[test]
    fn test_struct_copy_field_order() {
        // *(a, b) s; overrides must come in declaration order.
        let sval = e(ExprBody::StructValueImplicitType(vec![
            (n("a"), unit_value()),
            (n("b"), unit_value()),
        ]));

        let in_order = e(ExprBody::StructCopy(
            var("s"),
            vec![(n("a"), unit_value()), (n("b"), unit_value())],
        ));
        let stype = e(ExprBody::DataType(
            Struct,
            vec![arg(unit_type(), n("a")), arg(unit_type(), n("b"))],
        ));
        let expr = let_(vec![vbind(stype.clone(), "s", sval.clone())], in_order);
        let tc = check(expr).unwrap();
        match &tc.body {
            TcBody::Let { body, .. } => match &body.body {
                TcBody::StructCopy { fields, .. } => {
                    assert_eq!(fields.len(), 2);
                    assert!(fields.iter().all(|f| f.is_some()));
                }
                other => panic!("expected struct copy, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }

        let out_of_order = e(ExprBody::StructCopy(
            var("s"),
            vec![(n("b"), unit_value()), (n("a"), unit_value())],
        ));
        let expr = let_(vec![vbind(stype, "s", sval)], out_of_order);
        assert!(check(expr).is_none());
    }

    // The canonical list type over the given element type name:
    // @ L@ = +(*(E@ head, L@ tail) cons, *() nil)
    fn list_type_binding(list: &str, elem: &str) -> Binding {
        let cons = e(ExprBody::DataType(
            Struct,
            vec![arg(tvar(elem), n("head")), arg(tvar(list), n("tail"))],
        ));
        tbind(
            list,
            e(ExprBody::DataType(
                Union,
                vec![arg(cons, n("cons")), arg(unit_type(), n("nil"))],
            )),
        )
    }

    #[test]
    fn test_literal() {
        // @ Letter@ = +(h, e, l, o); @ L@ = list of Letter@;
        // (L@ l) { l; }|hello|
        let letter = e(ExprBody::DataType(
            Union,
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

        let tc = check(expr).unwrap();
        fn literal_letters(tc: &TcRef) -> Vec<usize> {
            match &tc.body {
                TcBody::Let { body, .. } => literal_letters(body),
                TcBody::FuncApply { arg, .. } => match &arg.body {
                    TcBody::Literal(letters) => letters.clone(),
                    other => panic!("expected literal, got {:?}", other),
                },
                other => panic!("expected apply, got {:?}", other),
            }
        }
        assert_eq!(literal_letters(&tc), vec![0, 1, 2, 2, 3]);
    }

    #[test]
    fn test_literal_longest_match() {
        // Overlapping letter names: 'a' and 'aa'. Longest match wins, so
        // "aaa" tokenizes as [aa, a].
        let letter = e(ExprBody::DataType(
            Union,
            vec![arg(unit_type(), n("a")), arg(unit_type(), n("aa"))],
        ));
        let id = e(ExprBody::FuncValue(vec![arg(tvar("L"), n("l"))], var("l")));
        let literal = e(ExprBody::Literal(id, crate::name::str("aaa")));
        let expr = let_(
            vec![tbind("Letter", letter)],
            let_(vec![list_type_binding("L", "Letter")], literal),
        );

        let tc = check(expr).unwrap();
        fn literal_letters(tc: &TcRef) -> Vec<usize> {
            match &tc.body {
                TcBody::Let { body, .. } => literal_letters(body),
                TcBody::FuncApply { arg, .. } => match &arg.body {
                    TcBody::Literal(letters) => letters.clone(),
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(literal_letters(&tc), vec![1, 0]);
    }

    #[test]
    fn test_list_expression() {
        // (L@ l) { l; }[(), ()]
        let id = e(ExprBody::FuncValue(vec![arg(tvar("L"), n("l"))], var("l")));
        let list = e(ExprBody::List(id, vec![unit_value(), unit_value()]));
        let expr = let_(
            vec![tbind("Letter", unit_type())],
            let_(vec![list_type_binding("L", "Letter")], list),
        );
        let tc = check(expr).unwrap();
        fn find_list(tc: &TcRef) -> usize {
            match &tc.body {
                TcBody::Let { body, .. } => find_list(body),
                TcBody::FuncApply { arg, .. } => match &arg.body {
                    TcBody::List(fields) => fields.len(),
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(find_list(&tc), 2);
    }

    fn secret_package() -> ast::Node {
        e(ExprBody::PackageType(ModulePath::parse("/Secret%").unwrap()))
    }

    #[test]
    fn test_abstract_value_in_package() {
        // Inside /Secret%: @/Secret%(()) then access it back out.
        let wrapped = apply(secret_package(), vec![unit_value()]);
        let access = e(ExprBody::AbstractAccess(wrapped));

        let program = LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Secret/Impl%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(access),
            }],
        };
        assert!(type_check_module(&program).is_some());
    }

    #[test]
    fn test_abstract_opacity_across_packages() {
        // /Secret% exports an abstract value; /Client% may pass it along
        // but not look inside.
        let secret = LoadedModule {
            path: ModulePath::parse("/Secret%").unwrap(),
            deps: vec![],
            type_: None,
            value: Some(apply(secret_package(), vec![unit_value()])),
        };

        let client_path = ModulePath::parse("/Client%").unwrap();
        let secret_ref = e(ExprBody::ModulePath(ModulePath::parse("/Secret%").unwrap()));

        // Passing the value through is fine.
        let pass = LoadedModule {
            path: client_path.clone(),
            deps: vec![ModulePath::parse("/Secret%").unwrap()],
            type_: None,
            value: Some(secret_ref.clone()),
        };
        let program = LoadedProgram { modules: vec![secret, pass] };
        assert!(type_check_module(&program).is_some());

        // Looking inside is not.
        let secret = LoadedModule {
            path: ModulePath::parse("/Secret%").unwrap(),
            deps: vec![],
            type_: None,
            value: Some(apply(secret_package(), vec![unit_value()])),
        };
        let peek = LoadedModule {
            path: client_path,
            deps: vec![ModulePath::parse("/Secret%").unwrap()],
            type_: None,
            value: Some(e(ExprBody::AbstractAccess(secret_ref))),
        };
        let program = LoadedProgram { modules: vec![secret, peek] };
        assert!(type_check_module(&program).is_none());
    }

    #[test]
    fn test_abstract_cast() {
        // Inside the package, cast a unit into the abstract type and back.
        let cast_in = e(ExprBody::AbstractCast(
            secret_package(),
            e(ExprBody::Typeof(apply(secret_package(), vec![unit_value()]))),
            unit_value(),
        ));
        let program = LoadedProgram {
            modules: vec![LoadedModule {
                path: ModulePath::parse("/Secret/Impl%").unwrap(),
                deps: vec![],
                type_: None,
                value: Some(cast_in),
            }],
        };
        assert!(type_check_module(&program).is_some());
    }

    #[test]
    fn test_type_level_poly() {
        // <@>@ P@ = <@ T@> { *(T@ head); }; P@<Bool@>(true).head
        let pbody = e(ExprBody::DataType(Struct, vec![arg(tvar("T"), n("head"))]));
        let poly = e(ExprBody::PolyValue(Kind::Basic(1), tn("T"), pbody));
        let pkind = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(1)));

        let papply = e(ExprBody::PolyApply(tvar("P"), bool_type()));
        let construct = apply(papply, vec![true_value()]);
        let access = e(ExprBody::DataAccess(construct, n("head")));

        let expr = let_(
            vec![Binding { kind: Some(pkind), type_: None, name: tn("P"), expr: poly }],
            access,
        );
        let tc = check(expr).unwrap();
        match &tc.body {
            TcBody::Let { body, .. } => match &body.body {
                TcBody::DataAccess { tag, .. } => assert_eq!(*tag, 0),
                other => panic!("expected access, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_module_type_interface() {
        // A module whose declared type does not match its value.
        let module = LoadedModule {
            path: ModulePath::parse("/Main%").unwrap(),
            deps: vec![],
            type_: Some(bool_type()),
            value: Some(unit_value()),
        };
        let program = LoadedProgram { modules: vec![module] };
        assert!(type_check_module(&program).is_none());

        let module = LoadedModule {
            path: ModulePath::parse("/Main%").unwrap(),
            deps: vec![],
            type_: Some(unit_type()),
            value: Some(unit_value()),
        };
        let program = LoadedProgram { modules: vec![module] };
        assert!(type_check_module(&program).is_some());
    }
}

