use smartstring::alias::String;

/// Terminal failure classes of one expansion pass. Local problems (a bad
/// `%define`, an unknown option in a parameterized call) are logged and
/// recovered in place; only these stop the current buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroErr {
	/// Recursion ceiling hit while expanding macro bodies.
	DepthExceeded,
	/// `%(` or `%{` whose closing character never shows up.
	Unterminated(char, String),
	/// Braced reference whose name does not scan.
	BadName(String),
	/// The shell runner could not be started.
	Shell(String),
	/// The embedded scripting host failed.
	Script(String),
}

impl std::fmt::Display for MacroErr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::DepthExceeded => write!(f, "Too many levels of recursion in macro expansion. It is likely caused by recursive macro declaration."),
			Self::Unterminated(c, rest) => write!(f, "Unterminated {c}: {rest}"),
			Self::BadName(name) => write!(f, "Invalid macro name: %{name}"),
			Self::Shell(cmd) => write!(f, "Failed to open shell expansion pipe for command: {cmd}"),
			Self::Script(e) => write!(f, "Script host failure: {e}"),
		}
	}
}

impl std::error::Error for MacroErr {}
