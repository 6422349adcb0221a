// Where to find a variable at runtime.

use std::fmt;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarSource {
    // Captured by a function from the scope where the function is defined.
    Static,

    // Passed as an argument to a function.
    Arg,

    // A local variable.
    Local,
}


// Identifies a variable in a stack frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Var {
    pub source: VarSource,
    pub index: usize,
}


impl Var {
    pub fn static_(index: usize) -> Var {
        Var { source: VarSource::Static, index }
    }

    pub fn arg(index: usize) -> Var {
        Var { source: VarSource::Arg, index }
    }

    pub fn local(index: usize) -> Var {
        Var { source: VarSource::Local, index }
    }
}


impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.source {
            VarSource::Static => write!(f, "s{}", self.index),
            VarSource::Arg => write!(f, "a{}", self.index),
            VarSource::Local => write!(f, "l{}", self.index),
        }
    }
}


// Index of a local variable slot.
pub type LocalIndex = usize;
