//! Surface syntax of MHT (Macro-Hyper-Text) templates.
//!
//! A template is a sequence of physical lines. Lines that start with a
//! `#` keyword are directives, everything else is literal content in which
//! `<#name|arg|...>` macro references are expanded. This crate only knows
//! how to recognise and take apart those pieces; evaluating them is the
//! job of the `engine` crate.

pub mod directive;
pub mod error;
pub mod invocation;
pub mod reference;

pub use directive::{Keyword, Line};
pub use error::SyntaxError;
pub use invocation::Invocation;
pub use reference::{MacroCall, ParameterKey};
