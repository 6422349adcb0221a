// Names, source locations, and module paths.
//
// Names carry the location of their occurrence in source code; locations
// are used for all user-facing diagnostics. Module paths are sequences of
// names written /Foo/Bar% in surface syntax.

use std::fmt;
use std::rc::Rc;

use regex::Regex;


// Shared immutable string, used for source file names and identifiers.
pub type Str = Rc<String>;

pub fn str(s: &str) -> Str {
    Rc::new(String::from(s))
}


// Which namespace a name belongs to.
//
// Normal names refer to values. Type names, written with an '@' suffix in
// surface syntax, refer to types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    Normal,
    Type,
}


// A location in a source file.
#[derive(Clone, Debug)]
pub struct Loc {
    pub source: Str,
    pub line: usize,
    pub col: usize,
}


impl Loc {
    pub fn new(source: &str, line: usize, col: usize) -> Loc {
        Loc { source: str(source), line, col }
    }

    // Report an error message associated with this location to stderr.
    pub fn report_error(&self, msg: &str) {
        eprintln!("{}: error: {}", self, msg);
    }

    // Report a warning message associated with this location to stderr.
    pub fn report_warning(&self, msg: &str) {
        eprintln!("{}: warning: {}", self, msg);
    }
}


impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.col)
    }
}


// A type or variable name together with the location of its occurrence.
//
// Equality ignores the location.
#[derive(Clone, Debug)]
pub struct Name {
    pub name: Str,
    pub space: Namespace,
    pub loc: Loc,
}


impl Name {
    pub fn normal(name: &str, loc: Loc) -> Name {
        Name { name: str(name), space: Namespace::Normal, loc }
    }

    pub fn type_name(name: &str, loc: Loc) -> Name {
        Name { name: str(name), space: Namespace::Type, loc }
    }
}


impl PartialEq for Name {
    fn eq(&self, rhs: &Self) -> bool {
        self.name == rhs.name && self.space == rhs.space
    }
}

impl Eq for Name {}


impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.space {
            Namespace::Normal => write!(f, "{}", self.name),
            Namespace::Type => write!(f, "{}@", self.name),
        }
    }
}


// A module path, for example /Foo/Bar%.
//
// All names in the path belong to the normal namespace. Equality is the
// sequence of names; locations are not relevant.
#[derive(Clone, Debug)]
pub struct ModulePath {
    pub loc: Loc,
    pub path: Vec<Name>,
}


lazy_static! {
    // One path element: anything printable except the path structure
    // characters themselves.
    static ref PATH_REGEX: Regex = Regex::new(
        r"^(/[^/%\[\]]+)+%$"
    ).unwrap();
}


impl ModulePath {
    pub fn new(loc: Loc) -> ModulePath {
        ModulePath { loc, path: Vec::new() }
    }

    // Parse a module path from its surface syntax, e.g. "/Foo/Bar%".
    pub fn parse(string: &str) -> Option<ModulePath> {
        if !PATH_REGEX.is_match(string) {
            return None;
        }

        let loc = Loc::new(string, 1, 1);
        let mut path = ModulePath::new(loc.clone());
        for elem in string[1..string.len() - 1].split('/') {
            path.path.push(Name::normal(elem, loc.clone()));
        }
        Some(path)
    }

    // An FbleName for the full path, e.g. "/Foo/Bar%".
    pub fn full_name(&self) -> Name {
        Name::normal(&format!("{}", self), self.loc.clone())
    }

    // Whether this module belongs to the given package.
    //
    // A module belongs to a package if the package path is a prefix of the
    // module path, inclusive.
    pub fn belongs_to(&self, package: &ModulePath) -> bool {
        package.path.len() <= self.path.len()
            && package.path.iter().zip(self.path.iter()).all(|(a, b)| a == b)
    }
}


impl PartialEq for ModulePath {
    fn eq(&self, rhs: &Self) -> bool {
        self.path == rhs.path
    }
}

impl Eq for ModulePath {}


impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for name in self.path.iter() {
            write!(f, "/{}", name.name)?;
        }
        write!(f, "%")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Loc {
        Loc::new("test.fble", 1, 1)
    }

    #[test]
    fn test_names_equal() {
        let a = Name::normal("foo", loc());
        let b = Name::normal("foo", Loc::new("other.fble", 10, 3));
        let c = Name::type_name("foo", loc());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_path() {
        let path = ModulePath::parse("/Foo/Bar%").unwrap();
        assert_eq!(path.path.len(), 2);
        assert_eq!(&*path.path[0].name, "Foo");
        assert_eq!(&*path.path[1].name, "Bar");
        assert_eq!(format!("{}", path), "/Foo/Bar%");

        assert!(ModulePath::parse("Foo/Bar%").is_none());
        assert!(ModulePath::parse("/Foo/Bar").is_none());
        assert!(ModulePath::parse("//Bar%").is_none());
        assert!(ModulePath::parse("%").is_none());
    }

    #[test]
    fn test_belongs_to() {
        let module = ModulePath::parse("/Secret/Impl%").unwrap();
        let package = ModulePath::parse("/Secret%").unwrap();
        let other = ModulePath::parse("/Public%").unwrap();
        assert!(module.belongs_to(&package));
        assert!(module.belongs_to(&module));
        assert!(!module.belongs_to(&other));
        assert!(!package.belongs_to(&module));
    }
}
