//! The macro table and the recursive expansion engine.
//!
//! A context holds a name-ordered table of definition stacks; the expander
//! walks source text, substitutes `%`-references out of that table, runs the
//! builtin operators, and recurses into whatever it substituted. Everything
//! here is single-threaded per context; the public entry points take the
//! context lock once and keep it for the whole pass.

use crate::{
	compress::{file_compression, Compression},
	error::MacroErr,
	util::{config_dir, isblank, iseol, matchchar, popen, strtol_auto, url_path},
};
use color_eyre::{eyre::eyre, Result};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use smartstring::alias::String;
use std::{
	collections::{btree_map, BTreeMap},
	io::Write,
	path::Path,
	sync::{
		atomic::{AtomicBool, AtomicI16, Ordering},
		Arc,
	},
};
use tracing::{debug, error, warn};

/// Scoping levels for macro definitions. Only the relative order matters;
/// nested call scopes sit above [`RMIL_GLOBAL`] at the expander's depth.
pub const RMIL_BUILTIN: i16 = -20;
pub const RMIL_DEFAULT: i16 = -15;
pub const RMIL_MACROFILES: i16 = -13;
pub const RMIL_RPMRC: i16 = -11;
pub const RMIL_CMDLINE: i16 = -7;
pub const RMIL_SPEC: i16 = -3;
pub const RMIL_OLDSPEC: i16 = -1;
pub const RMIL_GLOBAL: i16 = 0;

const DEFAULT_MACRO_DEPTH: i16 = 16;

static MAX_MACRO_DEPTH: AtomicI16 = AtomicI16::new(DEFAULT_MACRO_DEPTH);
static PRINT_MACRO_TRACE: AtomicI16 = AtomicI16::new(0);
static PRINT_EXPAND_TRACE: AtomicI16 = AtomicI16::new(0);
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// One definition at one scope level. Definitions for the same name chain
/// through `prev`, newest on top; only the top is visible.
#[derive(Debug, Clone, Default)]
pub struct MacroEntry {
	pub name: String,
	/// Short-option spec a la getopt; `Some` means parameterized.
	pub opts: Option<String>,
	pub body: String,
	/// How many times this very entry was substituted.
	pub used: usize,
	pub level: i16,
	prev: Option<Box<MacroEntry>>,
}

/// The set of macros visible to one expansion, keyed and ordered by name.
#[derive(Debug, Clone, Default)]
pub struct MacroContext {
	table: BTreeMap<String, MacroEntry>,
}

/// A shareable macro context. Two of these exist process-wide (the global
/// and the command-line context); embedders can make as many more as they
/// like, and distinct contexts are safe to use from distinct threads.
pub type Context = Arc<Mutex<MacroContext>>;

lazy_static! {
	static ref GLOBAL_MCTX: Context = Context::default();
	static ref CLI_MCTX: Context = Context::default();
}

/// The process-wide global macro context, the default of every `mc` argument.
pub fn global_macro_context() -> &'static Context {
	&GLOBAL_MCTX
}

/// The process-wide command-line macro context. [`init_macros`] re-imports
/// its entries into the global context after macro files are loaded.
///
/// [`init_macros`]: crate::init_macros
pub fn cli_macro_context() -> &'static Context {
	&CLI_MCTX
}

impl MacroContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Visible definition for `name`, if any. Case-sensitive exact match.
	pub fn find_entry(&self, name: &str) -> Option<&MacroEntry> {
		self.table.get(name)
	}

	fn find_entry_mut(&mut self, name: &str) -> Option<&mut MacroEntry> {
		self.table.get_mut(name)
	}

	/// Push a definition, shadowing any current one with the same name.
	pub(crate) fn push_macro(&mut self, n: &str, o: Option<&str>, b: &str, level: i16) {
		let me = MacroEntry { name: n.into(), opts: o.map(Into::into), body: b.into(), used: 0, level, prev: None };
		match self.table.entry(n.into()) {
			btree_map::Entry::Occupied(mut slot) => {
				let shadowed = std::mem::replace(slot.get_mut(), me);
				slot.get_mut().prev = Some(Box::new(shadowed));
			}
			btree_map::Entry::Vacant(slot) => {
				slot.insert(me);
			}
		}
	}

	/// Pop the visible definition; a shadowed one becomes visible again.
	pub(crate) fn pop_macro(&mut self, n: &str) {
		if let Some(me) = self.table.remove(n) {
			if let Some(prev) = me.prev {
				self.table.insert(prev.name.clone(), *prev);
			}
		}
	}

	/// Human-readable table dump, one line per visible entry, name-ordered.
	pub fn dump(&self, fp: &mut impl Write) -> std::io::Result<()> {
		writeln!(fp, "========================")?;
		for me in self.table.values() {
			write!(fp, "{:>3}{} {}", me.level, if me.used > 0 { '=' } else { ':' }, me.name)?;
			if let Some(ref o) = me.opts {
				if !o.is_empty() {
					write!(fp, "({o})")?;
				}
			}
			if !me.body.is_empty() {
				write!(fp, "\t{}", me.body)?;
			}
			writeln!(fp)?;
		}
		writeln!(fp, "======================== active {} empty 0", self.table.len())
	}
}

/// Scan `!`/`?` prefixes between `%` (or `%{`) and the name. Each `!` flips
/// `negate`, each `?` bumps `chkexist`; they may intermix.
fn parse_macro_flags(s: &[u8], mut p: usize, negate: &mut bool, chkexist: &mut u32) -> usize {
	loop {
		match s.get(p) {
			Some(b'!') => {
				*negate = !*negate;
				p += 1;
			}
			Some(b'?') => {
				*chkexist += 1;
				p += 1;
			}
			_ => return p,
		}
	}
}

/// End of a valid macro name starting at `p`, or `None`.
///
/// Accepted: identifiers of length 1 or 3+ (length 2 is invalid), the
/// specials `0 # S P F`, `*`/`**`, option names `-X`/`-X*`, and decimal
/// argument numbers.
fn parse_macro_name(s: &[u8], p: usize) -> Option<usize> {
	let c = *s.get(p)?;
	if c.is_ascii_alphabetic() || c == b'_' {
		let mut se = p + 1;
		while se < s.len() && (s[se].is_ascii_alphanumeric() || s[se] == b'_') {
			se += 1;
		}
		match se - p {
			1 => {} // single letters recheck against the specials below
			2 => return None,
			_ => return Some(se),
		}
	}
	match c {
		b'0' | b'#' | b'S' | b'P' | b'F' => return Some(p + 1),
		b'*' => return Some(if s.get(p + 1) == Some(&b'*') { p + 2 } else { p + 1 }),
		b'-' => {
			if !s.get(p + 1)?.is_ascii_alphanumeric() {
				return None;
			}
			return Some(if s.get(p + 2) == Some(&b'*') { p + 3 } else { p + 2 });
		}
		_ => {}
	}
	if c.is_ascii_digit() {
		let mut se = p + 1;
		while se < s.len() && s[se].is_ascii_digit() {
			se += 1;
		}
		return Some(se);
	}
	None
}

/// Expansion state for one pass: the output buffer plus the exclusive borrow
/// of the table being consulted and mutated.
struct MacroBuf<'mc> {
	buf: std::string::String,
	depth: i16,
	macro_trace: i16,
	expand_trace: i16,
	mc: &'mc mut MacroContext,
}

impl<'mc> MacroBuf<'mc> {
	fn new(mc: &'mc mut MacroContext) -> Self {
		Self {
			buf: std::string::String::new(),
			depth: 0,
			macro_trace: PRINT_MACRO_TRACE.load(Ordering::Relaxed),
			expand_trace: PRINT_EXPAND_TRACE.load(Ordering::Relaxed),
			mc,
		}
	}

	/// One guarded level of recursion around [`Self::expand_inner`].
	fn expand(&mut self, src: &str) -> Result<(), MacroErr> {
		self.depth += 1;
		if self.depth > MAX_MACRO_DEPTH.load(Ordering::Relaxed) {
			error!("Too many levels of recursion in macro expansion. It is likely caused by recursive macro declaration.");
			self.depth -= 1;
			self.expand_trace = 1;
			return Err(MacroErr::DepthExceeded);
		}
		let tpos = self.buf.len();
		let rc = self.expand_inner(src);
		self.depth -= 1;
		if rc.is_err() || self.expand_trace != 0 {
			self.print_expansion(tpos);
		}
		rc
	}

	/// The main scan loop: copy literal text, dispatch every `%` form.
	fn expand_inner(&mut self, src: &str) -> Result<(), MacroErr> {
		let s = src.as_bytes();
		let mut i = 0;
		while i < s.len() {
			// copy text until the next macro
			let Some(off) = src[i..].find('%') else {
				self.buf.push_str(&src[i..]);
				break;
			};
			self.buf.push_str(&src[i..i + off]);
			i += off + 1;
			match s.get(i) {
				None => {
					self.buf.push('%');
					break;
				}
				Some(b'%') => {
					self.buf.push('%');
					i += 1;
					continue;
				}
				_ => {}
			}

			// `i` sits right after the `%`
			let mut negate = false;
			let mut chkexist = 0u32;
			#[allow(clippy::type_complexity)]
			let (f, fe, g, lastc, cont): (usize, usize, Option<(usize, usize)>, Option<usize>, usize) = match s[i] {
				b'(' => {
					// shell escape
					let Some(end) = matchchar(s, i, b'(', b')') else {
						error!("Unterminated (: {}", &src[i..]);
						return Err(MacroErr::Unterminated('(', src[i..].into()));
					};
					if self.macro_trace != 0 {
						self.print_macro(src, i, end + 1);
					}
					self.do_shell_escape(&src[i + 1..end])?;
					i = end + 1;
					continue;
				}
				b'{' => {
					let Some(end) = matchchar(s, i, b'{', b'}') else {
						error!("Unterminated {{: {}", &src[i..]);
						return Err(MacroErr::Unterminated('{', src[i..].into()));
					};
					let fs = parse_macro_flags(s, i + 1, &mut negate, &mut chkexist);
					let Some(ne) = parse_macro_name(s, fs) else {
						error!("Invalid macro name: %{}", &src[i..=end]);
						return Err(MacroErr::BadName(src[i..=end].into()));
					};
					match s[ne] {
						b':' => (fs, ne, Some((ne + 1, end)), None, end + 1),
						b' ' | b'\t' => (fs, ne, None, Some(end), end + 1),
						b'}' => (fs, ne, None, None, end + 1),
						_ => {
							error!("Invalid macro syntax: %{}", &src[i..=end]);
							return Err(MacroErr::BadName(src[i..=end].into()));
						}
					}
				}
				_ => {
					let fs = parse_macro_flags(s, i, &mut negate, &mut chkexist);
					let Some(ne) = parse_macro_name(s, fs) else {
						// not a macro after all, keep the % and rescan
						self.buf.push('%');
						continue;
					};
					let lastc = if ne < s.len() && isblank(s[ne]) {
						Some(src[ne..].find('\n').map_or(s.len(), |nl| ne + nl))
					} else {
						None
					};
					(fs, ne, None, lastc, ne)
				}
			};

			let name = &src[f..fe];
			if self.macro_trace != 0 {
				self.print_macro(src, i, cont);
			}

			// builtins dispatch on the bare name, ahead of table lookup
			match name {
				"global" => {
					i = self.do_define(src, cont, RMIL_GLOBAL, true).0;
					continue;
				}
				"define" => {
					i = self.do_define(src, cont, self.depth, false).0;
					continue;
				}
				"undefine" => {
					i = self.do_undefine(src, cont);
					continue;
				}
				"echo" | "warn" | "error" => {
					let msg = match g {
						Some((gs, ge)) if ge > gs => &src[gs..ge],
						_ => name,
					};
					self.do_output(name == "error", msg);
					i = cont;
					continue;
				}
				"trace" => {
					self.macro_trace = if negate { 0 } else { self.depth };
					self.expand_trace = self.macro_trace;
					if self.depth == 1 {
						PRINT_MACRO_TRACE.store(self.macro_trace, Ordering::Relaxed);
						PRINT_EXPAND_TRACE.store(self.expand_trace, Ordering::Relaxed);
					}
					i = cont;
					continue;
				}
				"dump" => {
					if let Err(e) = self.mc.dump(&mut std::io::stderr().lock()) {
						debug!("cannot dump macro table: {e}");
					}
					let mut j = cont;
					while j < s.len() && iseol(s[j]) {
						j += 1;
					}
					i = j;
					continue;
				}
				#[cfg(feature = "lua")]
				"lua" => {
					let script = g.map_or("", |(gs, ge)| &src[gs..ge]);
					match crate::lua::run(script) {
						Ok(out) => self.buf.push_str(&out),
						Err(e) => {
							error!("%{{lua}} script failed: {e}");
							return Err(MacroErr::Script(e.to_string().into()));
						}
					}
					i = cont;
					continue;
				}
				"basename" | "dirname" | "suffix" | "expand" | "verbose" | "uncompress" | "url2path" | "u2p" | "getenv"
				| "getconfdir" | "S" | "P" | "F" => {
					self.do_foo(negate, name, g.map(|(gs, ge)| &src[gs..ge]))?;
					i = cont;
					continue;
				}
				_ => {}
			}

			// option bindings of a parameterized call: presence test, not lookup
			if name.starts_with('-') {
				let body: Option<String> = match self.mc.find_entry_mut(name) {
					Some(me) => {
						me.used += 1;
						Some(me.body.clone())
					}
					None => None,
				};
				if body.is_some() == negate {
					i = cont;
					continue;
				}
				match g {
					Some((gs, ge)) if ge > gs => self.expand(&src[gs..ge])?,
					_ => {
						if let Some(b) = body {
							if !b.is_empty() {
								self.expand(&b)?;
							}
						}
					}
				}
				i = cont;
				continue;
			}

			// `?` existence check, for any name
			if chkexist > 0 {
				let body = self.mc.find_entry(name).map(|me| me.body.clone());
				if body.is_some() == negate {
					i = cont;
					continue;
				}
				match g {
					Some((gs, ge)) if ge > gs => self.expand(&src[gs..ge])?,
					_ => {
						if let Some(b) = body {
							if !b.is_empty() {
								self.expand(&b)?;
							}
						}
					}
				}
				i = cont;
				continue;
			}

			let Some((opts, body)) = self.mc.find_entry(name).map(|me| (me.opts.clone(), me.body.clone())) else {
				// unknown macros render as-is
				self.buf.push('%');
				continue;
			};

			// bind call arguments for parameterized macros
			let mut cont = cont;
			if let Some(ref o) = opts {
				match lastc {
					Some(lc) => {
						let bound = self.grab_args(name, o, &src[fe..lc]);
						cont = if lc < s.len() { lc + 1 } else { lc };
						if !bound {
							self.free_args();
							i = cont;
							continue;
						}
					}
					None => {
						self.mc.push_macro("**", None, "", self.depth);
						self.mc.push_macro("*", None, "", self.depth);
						self.mc.push_macro("#", None, "0", self.depth);
						self.mc.push_macro("0", None, name, self.depth);
					}
				}
			}

			let mut rc = Ok(());
			if !body.is_empty() {
				rc = self.expand(&body);
				if rc.is_ok() {
					if let Some(me) = self.mc.find_entry_mut(name) {
						me.used += 1;
					}
				}
			}
			if opts.is_some() {
				self.free_args();
			}
			rc?;
			i = cont;
		}
		Ok(())
	}

	/// Expand `src` into a buffer of its own, sharing everything else.
	fn expand_this(&mut self, src: &str) -> (std::string::String, Result<(), MacroErr>) {
		let mut umb = MacroBuf {
			buf: std::string::String::new(),
			depth: self.depth,
			macro_trace: self.macro_trace,
			expand_trace: self.expand_trace,
			mc: &mut *self.mc,
		};
		let rc = umb.expand(src);
		(umb.buf, rc)
	}

	/// `%(...)`: expand the command, run it, substitute its stdout with the
	/// trailing newline run trimmed.
	fn do_shell_escape(&mut self, cmd: &str) -> Result<(), MacroErr> {
		let (buf, rc) = self.expand_this(cmd);
		rc?;
		match popen(&buf) {
			Some(out) => {
				self.buf.push_str(out.trim_end_matches(['\n', '\r']));
				Ok(())
			}
			None => {
				error!("Failed to open shell expansion pipe for command: {buf}");
				Err(MacroErr::Shell(buf.as_str().into()))
			}
		}
	}

	/// Parse and install a `%define`/`%global` style definition starting at
	/// `se`. Returns the position to resume scanning at, and whether a
	/// definition was actually installed.
	fn do_define(&mut self, src: &str, se: usize, level: i16, expandbody: bool) -> (usize, bool) {
		let s = src.as_bytes();
		let mut p = se;

		while p < s.len() && isblank(s[p]) {
			p += 1;
		}
		let n_start = p;
		while p < s.len() && (s[p].is_ascii_alphanumeric() || s[p] == b'_') {
			p += 1;
		}
		let name = &src[n_start..p];

		// opts, if present
		let mut opts: Option<&str> = None;
		let mut unterminated_opts = false;
		if s.get(p) == Some(&b'(') {
			p += 1;
			let o_start = p;
			while p < s.len() && s[p] != b')' {
				p += 1;
			}
			opts = Some(&src[o_start..p]);
			if p < s.len() {
				p += 1; // skip )
			} else {
				unterminated_opts = true;
			}
		}

		// body, as-is start first for the whitespace check below
		let sbody = p;
		while p < s.len() && isblank(s[p]) {
			p += 1;
		}
		let body: String = if s.get(p) == Some(&b'{') {
			// silent {...} grouping
			let Some(end) = matchchar(s, p, b'{', b'}') else {
				error!("Macro %{name} has unterminated body");
				return (p, false);
			};
			let b = &src[p + 1..end];
			p = end + 1;
			b.into()
		} else {
			// free-field body runs to end-of-line, minding continuations
			// and unclosed %{/%( groups; escaped chars lose the backslash
			let (mut bc, mut pc) = (0i32, 0i32);
			let mut out: Vec<u8> = Vec::new();
			while p < s.len() && (bc > 0 || pc > 0 || !iseol(s[p])) {
				match s[p] {
					b'\\' => {
						if p + 1 < s.len() {
							p += 1;
						}
					}
					b'%' => match s.get(p + 1) {
						Some(b'{') => {
							out.push(b'%');
							p += 1;
							bc += 1;
						}
						Some(b'(') => {
							out.push(b'%');
							p += 1;
							pc += 1;
						}
						Some(b'%') => {
							out.push(b'%');
							p += 1;
						}
						_ => {}
					},
					b'{' if bc > 0 => bc += 1,
					b'}' if bc > 0 => bc -= 1,
					b'(' if pc > 0 => pc += 1,
					b')' if pc > 0 => pc -= 1,
					_ => {}
				}
				out.push(s[p]);
				p += 1;
			}
			if bc > 0 || pc > 0 {
				error!("Macro %{name} has unterminated body");
				return (p, false);
			}
			while matches!(out.last(), Some(&c) if isblank(c) || iseol(c)) {
				out.pop();
			}
			std::string::String::from_utf8_lossy(&out).as_ref().into()
		};

		while p < s.len() && iseol(s[p]) {
			p += 1;
		}
		let cont = p;

		// names start alphabetic or _ and are at least 3 chars
		let c0 = name.as_bytes().first().copied().unwrap_or(0);
		if !((c0.is_ascii_alphabetic() || c0 == b'_') && name.len() > 2) {
			error!("Macro %{name} has illegal name (%define)");
			return (cont, false);
		}
		if unterminated_opts {
			error!("Macro %{name} has unterminated opts");
			return (cont, false);
		}
		if body.is_empty() {
			error!("Macro %{name} has empty body");
			return (cont, false);
		}
		let sb = s.get(sbody).copied().unwrap_or(0);
		if !isblank(sb) && !(sb == b'\\' && iseol(s.get(sbody + 1).copied().unwrap_or(0))) {
			warn!("Macro %{name} needs whitespace before body");
		}

		let body: String = if expandbody {
			let (ebody, rc) = self.expand_this(&body);
			if rc.is_err() {
				error!("Macro %{name} failed to expand");
				return (cont, false);
			}
			ebody.as_str().into()
		} else {
			body
		};

		self.mc.push_macro(name, opts, &body, level - 1);
		(cont, true)
	}

	/// Parse and run a `%undefine`. Returns the position to resume at.
	fn do_undefine(&mut self, src: &str, se: usize) -> usize {
		let s = src.as_bytes();
		let mut p = se;
		while p < s.len() && isblank(s[p]) {
			p += 1;
		}
		let n_start = p;
		while p < s.len() && (s[p].is_ascii_alphanumeric() || s[p] == b'_') {
			p += 1;
		}
		let name = &src[n_start..p];
		while p < s.len() && iseol(s[p]) {
			p += 1;
		}
		let c0 = name.as_bytes().first().copied().unwrap_or(0);
		if !((c0.is_ascii_alphabetic() || c0 == b'_') && name.len() > 2) {
			error!("Macro %{name} has illegal name (%undefine)");
			return p;
		}
		self.mc.pop_macro(name);
		p
	}

	/// Bind the per-call argument macros for a parameterized entry. All
	/// bindings land at the current depth so [`Self::free_args`] can pop
	/// them on return. `false` means the binding was aborted.
	fn grab_args(&mut self, name: &str, opts: &str, region: &str) -> bool {
		let mut argv: Vec<std::string::String> = vec![name.to_string()];
		argv.extend(region.split([' ', '\t']).filter(|a| !a.is_empty()).map(str::to_string));
		let depth = self.depth;

		self.mc.push_macro("0", None, name, depth);
		self.mc.push_macro("**", None, &argv[1..].join(" "), depth);

		// self-contained short-option scan; stops at the first non-option
		let mut optind = 1;
		'args: while optind < argv.len() {
			let arg = argv[optind].clone();
			if !arg.starts_with('-') || arg == "-" {
				break;
			}
			optind += 1;
			if arg == "--" {
				break;
			}
			let bytes = arg.as_bytes();
			let mut j = 1;
			while j < bytes.len() {
				let c = bytes[j] as char;
				j += 1;
				let takes_arg = match opts.find(c) {
					Some(pos) if c != ':' => opts[pos + 1..].starts_with(':'),
					_ => {
						error!("Unknown option {c} in {name}({opts})");
						return false;
					}
				};
				if !takes_arg {
					self.mc.push_macro(&format!("-{c}"), None, &format!("-{c}"), depth);
					continue;
				}
				let optarg: std::string::String = if j < bytes.len() {
					arg[j..].to_string()
				} else if optind < argv.len() {
					optind += 1;
					argv[optind - 1].clone()
				} else {
					error!("Unknown option {c} in {name}({opts})");
					return false;
				};
				self.mc.push_macro(&format!("-{c}"), None, &format!("-{c} {optarg}"), depth);
				self.mc.push_macro(&format!("-{c}*"), None, &optarg, depth);
				continue 'args;
			}
		}

		self.mc.push_macro("#", None, &format!("{}", argv.len() - optind), depth);
		for (k, a) in argv[optind..].iter().enumerate() {
			self.mc.push_macro(&format!("{}", k + 1), None, a, depth);
		}
		self.mc.push_macro("*", None, &argv[optind..].join(" "), depth);
		true
	}

	/// Tear down every binding at or above the current depth.
	fn free_args(&mut self) {
		let depth = self.depth;
		let names: Vec<String> = self.mc.table.iter().filter(|(_, me)| me.level >= depth).map(|(n, _)| n.clone()).collect();
		for n in &names {
			self.mc.pop_macro(n);
		}
	}

	/// `%echo`/`%warn` go to raw stderr, `%error` to the error channel.
	/// Expansion continues either way.
	fn do_output(&mut self, waserror: bool, msg: &str) {
		let (buf, _rc) = self.expand_this(msg);
		if waserror {
			error!("{buf}");
		} else {
			eprint!("{buf}");
		}
	}

	/// The string-operator builtins: expand the argument, transform it, and
	/// expand the result once more.
	fn do_foo(&mut self, negate: bool, f: &str, g: Option<&str>) -> Result<(), MacroErr> {
		let buf = match g {
			Some(g) => self.expand_this(g).0,
			None => std::string::String::new(),
		};
		let b: Option<std::string::String> = match f {
			"basename" => Some(match buf.rfind('/') {
				Some(pos) => buf[pos + 1..].to_string(),
				None => buf,
			}),
			"dirname" => Some(match buf.rfind('/') {
				Some(pos) => buf[..pos].to_string(),
				None => buf,
			}),
			"suffix" => buf.rfind('.').map(|pos| buf[pos + 1..].to_string()),
			"expand" => Some(buf),
			"verbose" => (is_verbose() != negate).then_some(buf),
			"url2path" | "u2p" => {
				let path = url_path(&buf);
				Some(if path.is_empty() { "/".to_string() } else { path.to_string() })
			}
			"uncompress" => {
				let t = buf.trim_start_matches([' ', '\t']);
				let t = &t[..t.find([' ', '\t']).unwrap_or(t.len())];
				Some(match file_compression(Path::new(t)) {
					Compression::Not => format!("%__cat {t}"),
					Compression::Other => format!("%__gzip -dc {t}"),
					Compression::Bzip2 => format!("%__bzip2 -dc {t}"),
					Compression::Zip => format!("%__unzip {t}"),
					Compression::Lzma | Compression::Xz => format!("%__xz -dc {t}"),
					Compression::Lzip => format!("%__lzip -dc {t}"),
					Compression::Lrzip => format!("%__lrzip -dqo- {t}"),
					Compression::SevenZip => format!("%__7zip x {t}"),
				})
			}
			"getenv" => std::env::var(buf.as_str()).ok(),
			"getconfdir" => Some(config_dir()),
			"S" => Some(if buf.bytes().all(|c| c.is_ascii_digit()) { format!("%SOURCE{buf}") } else { buf }),
			"P" => Some(if buf.bytes().all(|c| c.is_ascii_digit()) { format!("%PATCH{buf}") } else { buf }),
			"F" => Some(format!("file{buf}.file")),
			_ => None,
		};
		if let Some(b) = b {
			self.expand(&b)?;
		}
		Ok(())
	}

	/// Pre-print the macro about to be expanded (`%trace`, raw stderr).
	fn print_macro(&self, src: &str, s: usize, se: usize) {
		let indent = (2 * self.depth + 1).max(0) as usize;
		if s >= se {
			eprintln!("{:>3}>{:indent$}(empty)", self.depth, "");
			return;
		}
		let bytes = src.as_bytes();
		// print only to the first end-of-line
		let mut senl = se;
		while senl < bytes.len() && !iseol(bytes[senl]) {
			senl += 1;
		}
		let choplen = (61 - 2 * self.depth).max(0) as usize;
		let mut ellipsis = "";
		if senl - s > choplen {
			senl = s + choplen;
			while !src.is_char_boundary(senl) {
				senl -= 1;
			}
			ellipsis = "...";
		}
		eprint!("{:>3}>{:indent$}%{}^", self.depth, "", &src[s..se]);
		if se + 1 < bytes.len() && senl > se + 1 {
			eprint!("{}{ellipsis}", &src[se + 1..senl]);
		}
		eprintln!();
	}

	/// Post-print what just got expanded (`%trace`, debug channel).
	fn print_expansion(&self, tpos: usize) {
		let indent = (2 * self.depth + 1).max(0) as usize;
		let t = &self.buf[tpos..];
		if t.is_empty() {
			debug!("{:>3}<{:indent$}(empty)", self.depth, "");
			return;
		}
		let te = t.trim_end_matches(['\n', '\r']);
		let mut shown = te;
		let mut ellipsis = "";
		if self.depth > 0 {
			// only the last line of the expansion
			shown = te.rfind('\n').map_or(te, |pos| &te[pos + 1..]);
			let choplen = (61 - 2 * self.depth).max(0) as usize;
			if shown.len() > choplen {
				let mut end = choplen;
				while !shown.is_char_boundary(end) {
					end -= 1;
				}
				shown = &shown[..end];
				ellipsis = "...";
			}
		}
		debug!("{:>3}<{:indent$}{shown}{ellipsis}", self.depth, "");
	}
}

fn ctx_of(mc: Option<&Context>) -> Context {
	mc.cloned().unwrap_or_else(|| Arc::clone(global_macro_context()))
}

/// Expand `src` against `mc` (the global context when `None`) and return the
/// result as a fresh string.
pub fn expand(mc: Option<&Context>, src: &str) -> Result<std::string::String> {
	let ctx = ctx_of(mc);
	let mut guard = ctx.lock();
	let mut mb = MacroBuf::new(&mut guard);
	let rc = mb.expand(src);
	let out = mb.buf;
	drop(guard);
	rc?;
	Ok(out)
}

/// Concatenate `args` and expand the lot; the usual way to build `%{?...}`
/// prefixed queries.
pub fn rpm_expand(mc: Option<&Context>, args: &[&str]) -> Result<std::string::String> {
	expand(mc, &args.concat())
}

/// Expand `sbuf` in place. On failure `sbuf` still holds whatever partial
/// expansion was produced.
pub fn expand_macros(mc: Option<&Context>, sbuf: &mut std::string::String) -> Result<()> {
	let src = std::mem::take(sbuf);
	let ctx = ctx_of(mc);
	let mut guard = ctx.lock();
	let mut mb = MacroBuf::new(&mut guard);
	let rc = mb.expand(&src);
	*sbuf = mb.buf;
	drop(guard);
	rc?;
	Ok(())
}

/// Expand `expr` and read the result as a number: `Y`/`y` is 1, `N`/`n` is
/// 0, otherwise a base-auto integer. Anything unparseable (including an
/// expansion still starting with `%`) is 0.
pub fn expand_numeric(mc: Option<&Context>, expr: &str) -> i64 {
	let ctx = ctx_of(mc);
	let mut guard = ctx.lock();
	let mut mb = MacroBuf::new(&mut guard);
	let _rc = mb.expand(expr);
	let val = mb.buf;
	match val.bytes().next() {
		None | Some(b'%') => 0,
		Some(b'Y' | b'y') => 1,
		Some(b'N' | b'n') => 0,
		_ => strtol_auto(&val).unwrap_or(0),
	}
}

/// Parse exactly one definition, `name[(opts)] body`, without the `%define`
/// keyword, and install it at `level`.
pub fn define_macro(mc: Option<&Context>, def: &str, level: i16) -> Result<()> {
	let ctx = ctx_of(mc);
	let mut guard = ctx.lock();
	let mut mb = MacroBuf::new(&mut guard);
	let (_, installed) = mb.do_define(def, 0, level, false);
	if installed {
		Ok(())
	} else {
		Err(eyre!("Macro definition failed: {def}"))
	}
}

/// Push a definition directly, no parsing, no validation.
pub fn add_macro(mc: Option<&Context>, n: &str, o: Option<&str>, b: &str, level: i16) {
	ctx_of(mc).lock().push_macro(n, o, b, level);
}

/// Pop the visible definition of `n`, revealing any shadowed one.
pub fn del_macro(mc: Option<&Context>, n: &str) {
	ctx_of(mc).lock().pop_macro(n);
}

/// Is `name` currently defined in `mc`?
pub fn macro_is_defined(mc: Option<&Context>, name: &str) -> bool {
	ctx_of(mc).lock().find_entry(name).is_some()
}

/// Is `name` defined and parameterized (carrying an option spec)?
pub fn macro_is_parametric(mc: Option<&Context>, name: &str) -> bool {
	ctx_of(mc).lock().find_entry(name).is_some_and(|me| me.opts.is_some())
}

/// Import every visible entry of `mc` into the global context at `level`.
/// Importing the global context into itself is a no-op.
pub fn load_macros(mc: Option<&Context>, level: i16) {
	let src = ctx_of(mc);
	if Arc::ptr_eq(&src, global_macro_context()) {
		return;
	}
	let entries: Vec<(String, Option<String>, String)> =
		src.lock().table.values().map(|me| (me.name.clone(), me.opts.clone(), me.body.clone())).collect();
	let mut global = global_macro_context().lock();
	for (n, o, b) in &entries {
		global.push_macro(n, o.as_deref(), b, level - 1);
	}
}

/// Drop every definition in every stack of `mc`.
pub fn free_macros(mc: Option<&Context>) {
	ctx_of(mc).lock().table.clear();
}

/// Write the table of `mc` to `fp` in dump format.
pub fn dump_macro_table(mc: Option<&Context>, fp: &mut impl Write) -> std::io::Result<()> {
	ctx_of(mc).lock().dump(fp)
}

/// Recursion ceiling of the expander; macro file loading resets it to the
/// default of 16.
pub fn set_max_macro_depth(depth: i16) {
	MAX_MACRO_DEPTH.store(depth.max(1), Ordering::Relaxed);
}

pub(crate) fn reset_max_macro_depth() {
	MAX_MACRO_DEPTH.store(DEFAULT_MACRO_DEPTH, Ordering::Relaxed);
}

/// Verbosity switch consulted by `%{verbose:...}`.
pub fn set_verbose(verbose: bool) {
	VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
	VERBOSE.load(Ordering::Relaxed)
}
