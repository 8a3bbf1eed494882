//! Optional scripting host behind `%{lua:...}`.
//!
//! The script runs in a fresh Lua state with `print` rerouted into a capture
//! buffer; whatever it printed becomes the substitution. A small `rpm` table
//! carries the pure helpers. No table access is exposed to scripts: the
//! expansion holds the context lock for its whole pass, so a callback back
//! into the expander would deadlock by design.

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use rlua::{Context, ExternalError, Lua};
use std::{fmt::Write, sync::Arc};

fn b64encode(_: Context, arg: String) -> rlua::Result<String> {
	Ok(STANDARD.encode(arg))
}

fn b64decode(_: Context, arg: String) -> rlua::Result<String> {
	String::from_utf8(STANDARD.decode(arg).map_err(|e| e.to_lua_err())?).map_err(|e| e.to_lua_err())
}

/// Run `script`, returning its captured print output.
pub(crate) fn run(script: &str) -> rlua::Result<String> {
	let lua = Lua::new();
	let captured = Arc::new(Mutex::new(String::new()));
	lua.context(|ctx| -> rlua::Result<()> {
		let rpm = ctx.create_table()?;
		rpm.set("b64encode", ctx.create_function(b64encode)?)?;
		rpm.set("b64decode", ctx.create_function(b64decode)?)?;
		let globals = ctx.globals();
		globals.set("rpm", rpm)?;
		let out = captured.clone();
		globals.set(
			"print",
			ctx.create_function(move |_, s: String| {
				out.lock().write_str(&s).map_err(|e| e.to_lua_err())?;
				Ok(())
			})?,
		)?;
		ctx.load(script).exec()
	})?;
	let out = captured.lock().clone();
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn print_output_is_captured() -> rlua::Result<()> {
		assert_eq!(run("print('hai')")?, "hai");
		assert_eq!(run("for i=1,3 do print(tostring(i)) end")?, "123");
		assert_eq!(run("")?, "");
		Ok(())
	}

	#[test]
	fn base64_helpers() -> rlua::Result<()> {
		assert_eq!(run("print(rpm.b64encode('moo'))")?, "bW9v");
		assert_eq!(run("print(rpm.b64decode('bW9v'))")?, "moo");
		Ok(())
	}

	#[test]
	fn script_errors_propagate() {
		assert!(run("this is not lua").is_err());
	}
}
