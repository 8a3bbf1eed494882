//! Macro definition files: the continuation-aware line reader, the per-file
//! loader, and the colon-separated-glob initializer.

use crate::macros::{cli_macro_context, define_macro, load_macros, reset_max_macro_depth, Context, RMIL_CMDLINE, RMIL_MACROFILES};
use color_eyre::{eyre::Context as _, Result};
use std::{
	fs::File,
	io::{BufRead, BufReader},
	path::Path,
};
use tracing::debug;

/// Read one logical line. Physical lines keep accumulating while the last
/// pre-newline character is `\` or a `%{`/`%(` group is still open; the
/// embedded newlines stay in (one `\n` per join, `\r` converted). `None`
/// means end-of-file with nothing read at all.
pub(crate) fn rdcl(f: &mut impl BufRead) -> std::io::Result<Option<std::string::String>> {
	let mut buf = std::string::String::new();
	let mut read_any = false;
	let (mut bc, mut pc) = (0i32, 0i32);
	loop {
		let mut line = std::string::String::new();
		if f.read_line(&mut line)? == 0 {
			break;
		}
		read_any = true;
		let had_eol = line.ends_with('\n') || line.ends_with('\r');
		let content = line.trim_end_matches(['\n', '\r']);
		if content.is_empty() {
			break;
		}
		let s = content.as_bytes();
		let mut i = 0;
		while i < s.len() {
			match s[i] {
				b'\\' => {
					if i + 1 < s.len() {
						i += 1;
					}
				}
				b'%' => match s.get(i + 1) {
					Some(b'{') => {
						i += 1;
						bc += 1;
					}
					Some(b'(') => {
						i += 1;
						pc += 1;
					}
					Some(b'%') => i += 1,
					_ => {}
				},
				b'{' if bc > 0 => bc += 1,
				b'}' if bc > 0 => bc -= 1,
				b'(' if pc > 0 => pc += 1,
				b')' if pc > 0 => pc -= 1,
				_ => {}
			}
			i += 1;
		}
		buf.push_str(content);
		if !had_eol {
			break;
		}
		if !content.ends_with('\\') && bc == 0 && pc == 0 {
			break;
		}
		buf.push('\n');
	}
	Ok(read_any.then_some(buf))
}

/// Load every definition from one macro file into `mc`. Lines whose first
/// non-blank character is not `%` are ignored; bad definitions are logged
/// and skipped without stopping the load.
pub fn load_macro_file(mc: Option<&Context>, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();
	let mut f = BufReader::new(File::open(path).wrap_err_with(|| format!("cannot open macro file {}", path.display()))?);
	reset_max_macro_depth();
	while let Some(line) = rdcl(&mut f)? {
		let n = line.trim_start_matches([' ', '\t']);
		let Some(def) = n.strip_prefix('%') else { continue };
		if define_macro(mc, def, RMIL_MACROFILES).is_err() {
			debug!("skipped bad definition in {}", path.display());
		}
	}
	Ok(())
}

/// Initialize `mc` from a colon-separated list of glob patterns, then
/// re-import the command-line context into the global one. Leftovers from
/// package upgrades (`.rpmnew`, `.rpmsave`, `.rpmorig`) are skipped.
pub fn init_macros(mc: Option<&Context>, macrofiles: &str) {
	for pattern in macrofiles.split(':') {
		if pattern.is_empty() {
			continue;
		}
		let pattern: std::string::String = match pattern.strip_prefix("~/") {
			Some(rest) => match std::env::var("HOME") {
				Ok(home) => format!("{home}/{rest}"),
				Err(_) => pattern.into(),
			},
			None => pattern.into(),
		};
		let Ok(paths) = glob::glob(&pattern) else { continue };
		for path in paths.flatten() {
			let p = path.to_string_lossy();
			if p.ends_with(".rpmnew") || p.ends_with(".rpmsave") || p.ends_with(".rpmorig") {
				continue;
			}
			if let Err(e) = load_macro_file(mc, &path) {
				debug!("{e:#}");
			}
		}
	}
	load_macros(Some(cli_macro_context()), RMIL_CMDLINE);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::macros::{add_macro, del_macro, expand, macro_is_defined};
	use std::io::Write;

	fn lines(text: &str) -> Vec<std::string::String> {
		let mut out = vec![];
		let mut r = std::io::BufReader::new(text.as_bytes());
		while let Some(l) = rdcl(&mut r).expect("rdcl") {
			out.push(l);
		}
		out
	}

	#[test]
	fn plain_lines_come_back_one_by_one() {
		assert_eq!(lines("one\ntwo\n"), ["one", "two"]);
		assert_eq!(lines("no trailing newline"), ["no trailing newline"]);
		assert!(lines("").is_empty());
	}

	#[test]
	fn backslash_joins_lines_and_keeps_the_newline() {
		assert_eq!(lines("a \\\nb\nc\n"), ["a \\\nb", "c"]);
	}

	#[test]
	fn open_braces_join_lines() {
		assert_eq!(lines("%{first\nsecond}\nrest\n"), ["%{first\nsecond}", "rest"]);
		assert_eq!(lines("%(echo a\necho b)\n"), ["%(echo a\necho b)"]);
		// %% opens nothing
		assert_eq!(lines("100%%{\n"), ["100%%{"]);
	}

	#[test]
	fn blank_line_ends_a_continuation() {
		// the joined newline is already in the buffer by the time the blank
		// line cuts the continuation short
		assert_eq!(lines("a \\\n\nnext\n"), ["a \\\n", "next"]);
	}

	#[test]
	fn loads_definitions_from_file() -> color_eyre::Result<()> {
		let mc = Context::default();
		let mut f = tempfile::NamedTempFile::new()?;
		writeln!(f, "# a comment, not a definition")?;
		writeln!(f)?;
		writeln!(f, "%simple	simple body")?;
		writeln!(f, "%wrapped first \\")?;
		writeln!(f, "second")?;
		writeln!(f, "%withopts(n:) hi %{{-n*}}")?;
		writeln!(f, "%ab too short, skipped")?;
		f.flush()?;
		load_macro_file(Some(&mc), f.path())?;
		assert_eq!(expand(Some(&mc), "%simple")?, "simple body");
		assert_eq!(expand(Some(&mc), "<%wrapped>")?, "<first \nsecond>");
		assert_eq!(expand(Some(&mc), "%withopts -n you\n")?, "hi you");
		assert!(!macro_is_defined(Some(&mc), "ab"));
		// macro file definitions land one below RMIL_MACROFILES
		let lvl = mc.lock().find_entry("simple").map(|me| me.level);
		assert_eq!(lvl, Some(RMIL_MACROFILES - 1));
		Ok(())
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(load_macro_file(None, "/nonexistent/macros.d/nope").is_err());
	}

	#[test]
	fn init_globs_and_skips_upgrade_leftovers() -> color_eyre::Result<()> {
		let mc = Context::default();
		let dir = tempfile::tempdir()?;
		std::fs::write(dir.path().join("macros.alpha"), "%from_alpha a\n")?;
		std::fs::write(dir.path().join("macros.beta"), "%from_beta b\n")?;
		std::fs::write(dir.path().join("macros.beta.rpmnew"), "%from_rpmnew x\n")?;
		std::fs::write(dir.path().join("macros.beta.rpmsave"), "%from_rpmsave x\n")?;
		let globs = format!("{0}/macros.*:{0}/nosuchdir/*", dir.path().display());
		init_macros(Some(&mc), &globs);
		assert!(macro_is_defined(Some(&mc), "from_alpha"));
		assert!(macro_is_defined(Some(&mc), "from_beta"));
		assert!(!macro_is_defined(Some(&mc), "from_rpmnew"));
		assert!(!macro_is_defined(Some(&mc), "from_rpmsave"));
		Ok(())
	}

	#[test]
	fn init_reimports_cli_context_into_global() {
		add_macro(Some(cli_macro_context()), "cli_reimport_probe", None, "here", RMIL_CMDLINE);
		init_macros(Some(&Context::default()), "");
		assert!(macro_is_defined(None, "cli_reimport_probe"));
		del_macro(None, "cli_reimport_probe");
		del_macro(Some(cli_macro_context()), "cli_reimport_probe");
	}
}
