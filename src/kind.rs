// Kinds classify types the way types classify values.
//
// A basic kind of level 0 describes normal values, level 1 describes types,
// level 2 describes types of types, and so on. A poly kind describes a
// type-level function.

use std::fmt;


// Struct versus union, for data types and data access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataTypeTag {
    Struct,
    Union,
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Basic(usize),
    Poly(Box<Kind>, Box<Kind>),
}


impl Kind {
    // The level of the kind: 0 for values, 1 for types, and so on. The
    // level of a poly kind is the level of its result.
    pub fn level(&self) -> usize {
        match self {
            Kind::Basic(level) => *level,
            Kind::Poly(_, rkind) => rkind.level(),
        }
    }

    // The same shape of kind with the level of every basic kind in result
    // position replaced by the given level.
    pub fn with_level(&self, level: usize) -> Kind {
        match self {
            Kind::Basic(_) => Kind::Basic(level),
            Kind::Poly(arg, rkind) => {
                Kind::Poly(arg.clone(), Box::new(rkind.with_level(level)))
            }
        }
    }
}


impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kind::Basic(0) => write!(f, "%"),
            Kind::Basic(level) => {
                for _ in 0..*level {
                    write!(f, "@")?;
                }
                Ok(())
            }
            Kind::Poly(arg, rkind) => write!(f, "<{}>{}", arg, rkind),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(Kind::Basic(0).level(), 0);
        assert_eq!(Kind::Basic(1).level(), 1);

        let poly = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(1)));
        assert_eq!(poly.level(), 1);
    }

    #[test]
    fn test_structural_equality() {
        let a = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(1)));
        let b = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(1)));
        let c = Kind::Poly(Box::new(Kind::Basic(2)), Box::new(Kind::Basic(1)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Kind::Basic(0)), "%");
        assert_eq!(format!("{}", Kind::Basic(1)), "@");
        let poly = Kind::Poly(Box::new(Kind::Basic(1)), Box::new(Kind::Basic(1)));
        assert_eq!(format!("{}", poly), "<@>@");
    }
}
