//! Byte-level helpers shared by the expander and the macro file reader.
//!
//! Classification is ASCII-only on purpose: macro names, flags and bracket
//! structure are all ASCII, and anything multibyte just flows through the
//! expansion buffer untouched.

pub(crate) const fn isblank(c: u8) -> bool {
	matches!(c, b' ' | b'\t')
}

pub(crate) const fn iseol(c: u8) -> bool {
	matches!(c, b'\n' | b'\r')
}

/// Index of the `pr` matching the `pl` at `p`, honoring nesting and
/// backslash escapes. `p` must sit on the opening character.
pub(crate) fn matchchar(s: &[u8], mut p: usize, pl: u8, pr: u8) -> Option<usize> {
	let mut lvl = 0i32;
	while p < s.len() {
		let c = s[p];
		p += 1;
		if c == b'\\' {
			// escaped chars never open or close
			p += 1;
			continue;
		}
		if c == pr {
			lvl -= 1;
			if lvl <= 0 {
				return Some(p - 1);
			}
		} else if c == pl {
			lvl += 1;
		}
	}
	None
}

/// Run `cmd` through `sh -c` and hand back whatever it printed.
pub(crate) fn popen(cmd: &str) -> Option<std::string::String> {
	Some(String::from_utf8_lossy(&std::process::Command::new("sh").args(["-c", cmd]).output().ok()?.stdout).to_string())
}

/// Strip scheme and authority off a URL, leaving the path. No scheme means
/// the string already is a path.
pub(crate) fn url_path(url: &str) -> &str {
	let Some(pos) = url.find("://") else { return url };
	match url[pos + 3..].find('/') {
		Some(slash) => &url[pos + 3 + slash..],
		None => "",
	}
}

/// Configuration directory reported by `%getconfdir`.
pub(crate) fn config_dir() -> std::string::String {
	std::env::var("RPM_CONFIGDIR").unwrap_or_else(|_| "/usr/lib/rpm".to_string())
}

/// strtol(3)-style integer scan with automatic radix: leading whitespace and
/// sign, `0x` hex, leading `0` octal, and the whole rest must be digits.
pub(crate) fn strtol_auto(s: &str) -> Option<i64> {
	let t = s.trim_start();
	let (neg, t) = match t.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, t.strip_prefix('+').unwrap_or(t)),
	};
	let (radix, digits) = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
		(16, hex)
	} else if t.len() > 1 && t.starts_with('0') {
		(8, &t[1..])
	} else {
		(10, t)
	};
	if digits.is_empty() {
		return None;
	}
	let v = i64::from_str_radix(digits, radix).ok()?;
	Some(if neg { -v } else { v })
}
