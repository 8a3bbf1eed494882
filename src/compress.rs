//! Compression probe behind the `%uncompress` builtin.
//!
//! Classifies a file by its magic bytes so the expander can pick the right
//! decompression pipeline. An unreadable file is reported as [`Other`],
//! which downstream maps to the gzip pipeline.
//!
//! [`Other`]: Compression::Other

use std::{fs::File, io::Read, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	/// Plain file, cat it.
	Not,
	/// gzip family (also the fallback when the probe cannot tell).
	Other,
	Bzip2,
	Zip,
	Lzma,
	Xz,
	Lzip,
	Lrzip,
	SevenZip,
}

/// Sniff the compression kind of `path`.
pub fn file_compression(path: &Path) -> Compression {
	let mut magic = Vec::with_capacity(13);
	if File::open(path).and_then(|f| f.take(13).read_to_end(&mut magic)).is_err() {
		return Compression::Other;
	}
	if magic.starts_with(b"BZh") {
		Compression::Bzip2
	} else if magic.starts_with(b"PK\x03\x04") {
		Compression::Zip
	} else if magic.starts_with(b"LZIP") {
		Compression::Lzip
	} else if magic.starts_with(b"LRZI") {
		Compression::Lrzip
	} else if magic.starts_with(b"7z\xbc\xaf\x27\x1c") {
		Compression::SevenZip
	} else if magic.starts_with(b"\xfd7zXZ\x00") {
		Compression::Xz
	} else if magic.starts_with(&[0x5d, 0x00, 0x00]) {
		Compression::Lzma
	} else if magic.len() >= 2 && magic[0] == 0x1f && matches!(magic[1], 0x8b | 0x9e | 0x1e | 0x9d | 0xa0) {
		// gzip and its elderly relatives, gzip -dc reads them all
		Compression::Other
	} else {
		Compression::Not
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn probe(bytes: &[u8]) -> Compression {
		let mut f = tempfile::NamedTempFile::new().expect("tempfile");
		f.write_all(bytes).expect("write magic");
		file_compression(f.path())
	}

	#[test]
	fn classifies_magic_bytes() {
		assert_eq!(probe(b"BZh91AY"), Compression::Bzip2);
		assert_eq!(probe(b"PK\x03\x04rest"), Compression::Zip);
		assert_eq!(probe(b"\x1f\x8b\x08\x00"), Compression::Other);
		assert_eq!(probe(b"\xfd7zXZ\x00data"), Compression::Xz);
		assert_eq!(probe(b"LZIP\x01"), Compression::Lzip);
		assert_eq!(probe(b"LRZI\x00"), Compression::Lrzip);
		assert_eq!(probe(b"7z\xbc\xaf\x27\x1c..."), Compression::SevenZip);
		assert_eq!(probe(&[0x5d, 0x00, 0x00, 0x80]), Compression::Lzma);
		assert_eq!(probe(b"just text"), Compression::Not);
		assert_eq!(probe(b""), Compression::Not);
	}

	#[test]
	fn unreadable_defaults_to_gzip() {
		assert_eq!(file_compression(Path::new("/nonexistent/nowhere.tar")), Compression::Other);
	}
}
