//! Command-line surface: operand parsing, usage text, and the verbosity
//! globals the display macros consult.

pub mod args;
pub mod constants;
pub mod help;
