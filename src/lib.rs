//! # rpmmacro-rs
//! Recursive macro expansion engine for RPM-style build specifications.
//!
//! Source text is scanned for `%`-introduced references which are
//! substituted out of a stacked, scoped macro table, recursively expanded,
//! and run through a small set of builtin operators. Definitions come and
//! go dynamically during expansion (`%define`, `%global`, `%undefine`,
//! per-call argument bindings of parameterized macros), so the table is as
//! much a part of the machine as the scanner is.
//!
//! Two contexts exist process-wide, the global one and the command-line
//! one; every entry point takes an optional context and falls back to the
//! global. Build private contexts with [`Context::default()`] when you need
//! isolation.
//!
//! ```
//! use rpmmacro_rs as rpmmacro;
//!
//! let mc = rpmmacro::Context::default();
//! rpmmacro::add_macro(Some(&mc), "dist", None, ".fc38", rpmmacro::RMIL_MACROFILES);
//! let out = rpmmacro::expand(Some(&mc), "pkg-1.0%{?dist}").unwrap();
//! assert_eq!(out, "pkg-1.0.fc38");
//! ```

pub mod compress;
pub mod error;
mod file;
#[cfg(feature = "lua")]
mod lua;
mod macros;
mod util;

pub use error::MacroErr;
pub use file::{init_macros, load_macro_file};
pub use macros::{
	add_macro, cli_macro_context, define_macro, del_macro, dump_macro_table, expand, expand_macros, expand_numeric,
	free_macros, global_macro_context, is_verbose, load_macros, macro_is_defined, macro_is_parametric, rpm_expand,
	set_max_macro_depth, set_verbose, Context, MacroContext, MacroEntry, RMIL_BUILTIN, RMIL_CMDLINE, RMIL_DEFAULT,
	RMIL_GLOBAL, RMIL_MACROFILES, RMIL_OLDSPEC, RMIL_RPMRC, RMIL_SPEC,
};
