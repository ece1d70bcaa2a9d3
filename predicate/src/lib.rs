//! The boolean query expression model shared by the grebe planner and
//! scanner: predicates, connectives, DNF normalization, reserved-predicate
//! extraction, and the dynamic value evaluator.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod dnf;
mod expr;
mod glob;
mod reserved;
mod value;

pub use dnf::{to_dnf, Conjunction, Dnf};
pub use expr::{CompareOp, Expr, KeyMatch, Predicate, ValueMatch};
pub use glob::{GlobPattern, PatternError, RegexPattern};
pub use reserved::{extract_reserved, Extracted};
pub use value::{compare_values, parse_num, ArithOp, ScalarExpr, Value};
