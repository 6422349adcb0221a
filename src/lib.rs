// fble: a strict, purely functional programming language.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// This crate is the core runtime: the type checker, the bytecode
// compiler, the interpreter and value heap, and the native code
// generators. Parsing and module loading are left to the programs
// embedding it.

extern crate itertools;
extern crate nix;
extern crate rand;
extern crate regex;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;


pub mod ast;
pub mod code;
pub mod compile;
pub mod function;
pub mod generate_aarch64;
pub mod generate_c;
pub mod interpret;
pub mod kind;
pub mod name;
pub mod profile;
pub mod program;
pub mod tc;
pub mod typecheck;
pub mod types;
pub mod value;
pub mod var;
