//! Binary key-value catalog (VDF) reader and writer.
//!
//! The shortcuts catalog is a nested mapping of typed fields:
//!
//! | tag  | meaning                              |
//! |------|--------------------------------------|
//! | 0x00 | begin nested mapping                 |
//! | 0x01 | NUL-terminated UTF-8 string value    |
//! | 0x02 | 4-byte little-endian signed int      |
//! | 0x08 | end of current mapping               |
//!
//! Field names are NUL-terminated and matched case-insensitively.  Unknown
//! tags are fatal to the parse attempt — a corrupt catalog must never be
//! rewritten from a half-parsed tree.  Entry order is preserved so a
//! parse/serialize round-trip is byte-exact for well-formed files.

use thiserror::Error;

const TAG_MAP: u8 = 0x00;
const TAG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_END: u8 = 0x08;

#[derive(Debug, Error)]
pub enum VdfError {
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),
    #[error("unknown tag 0x{0:02x} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("trailing bytes after final end tag")]
    TrailingData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdfValue {
    Map(VdfMap),
    String(String),
    Int(i32),
}

/// An order-preserving mapping of field name → value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VdfMap(pub Vec<(String, VdfValue)>);

impl VdfMap {
    /// Case-insensitive field lookup.
    pub fn get(&self, key: &str) -> Option<&VdfValue> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(VdfValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(VdfValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Set a string field, replacing an existing one case-insensitively or
    /// appending when absent.
    pub fn set_string(&mut self, key: &str, value: &str) {
        for (k, v) in &mut self.0 {
            if k.eq_ignore_ascii_case(key) {
                *v = VdfValue::String(value.to_owned());
                return;
            }
        }
        self.0
            .push((key.to_owned(), VdfValue::String(value.to_owned())));
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, VdfError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(VdfError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn cstr(&mut self) -> Result<String, VdfError> {
        let start = self.pos;
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(VdfError::UnexpectedEof(start))?;
        let s = String::from_utf8_lossy(&self.data[start..start + nul]).into_owned();
        self.pos = start + nul + 1;
        Ok(s)
    }

    fn i32_le(&mut self) -> Result<i32, VdfError> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(VdfError::UnexpectedEof(self.pos));
        }
        let v = i32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos = end;
        Ok(v)
    }

    fn map(&mut self) -> Result<VdfMap, VdfError> {
        let mut entries = Vec::new();
        loop {
            let tag = self.u8()?;
            if tag == TAG_END {
                return Ok(VdfMap(entries));
            }
            let name = self.cstr()?;
            let value = match tag {
                TAG_MAP => VdfValue::Map(self.map()?),
                TAG_STRING => VdfValue::String(self.cstr()?),
                TAG_INT => VdfValue::Int(self.i32_le()?),
                other => return Err(VdfError::UnknownTag(other, self.pos - 1)),
            };
            entries.push((name, value));
        }
    }
}

/// Parse a whole catalog file.  The top level is a map terminated by a final
/// 0x08; trailing bytes are rejected.
pub fn parse(data: &[u8]) -> Result<VdfMap, VdfError> {
    let mut r = Reader { data, pos: 0 };
    let map = r.map()?;
    if r.pos != data.len() {
        return Err(VdfError::TrailingData);
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a catalog back to bytes, including the final end tag.
pub fn serialize(map: &VdfMap) -> Vec<u8> {
    let mut out = Vec::new();
    write_map(map, &mut out);
    out
}

fn write_map(map: &VdfMap, out: &mut Vec<u8>) {
    for (name, value) in &map.0 {
        match value {
            VdfValue::Map(m) => {
                out.push(TAG_MAP);
                write_cstr(name, out);
                write_map(m, out);
            }
            VdfValue::String(s) => {
                out.push(TAG_STRING);
                write_cstr(name, out);
                write_cstr(s, out);
            }
            VdfValue::Int(i) => {
                out.push(TAG_INT);
                write_cstr(name, out);
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
    }
    out.push(TAG_END);
}

fn write_cstr(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

// ---------------------------------------------------------------------------
// Shortcut catalog helpers
// ---------------------------------------------------------------------------

/// The catalog id of one entry: `(raw_appid & 0xFFFFFFFF) | 0x80000000`.
pub fn entry_app_id(entry: &VdfMap) -> Option<u32> {
    entry.get_int("appid").map(|raw| (raw as u32) | 0x8000_0000)
}

/// Set the icon path on the entry matching `app_id`.
///
/// Returns true if an entry was found and patched.
pub fn patch_icon(root: &mut VdfMap, app_id: u32, icon_path: &str) -> bool {
    let Some(VdfValue::Map(shortcuts)) = root
        .0
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("shortcuts"))
        .map(|(_, v)| v)
    else {
        return false;
    };
    for (_, value) in &mut shortcuts.0 {
        if let VdfValue::Map(entry) = value {
            if entry_app_id(entry) == Some(app_id) {
                entry.set_string("icon", icon_path);
                return true;
            }
        }
    }
    false
}

/// Iterate the shortcut entries of a parsed catalog.
pub fn shortcut_entries(root: &VdfMap) -> impl Iterator<Item = &VdfMap> {
    let shortcuts = match root.get("shortcuts") {
        Some(VdfValue::Map(m)) => Some(m),
        _ => None,
    };
    shortcuts
        .into_iter()
        .flat_map(|m| m.0.iter())
        .filter_map(|(_, v)| match v {
            VdfValue::Map(entry) => Some(entry),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembled catalog with two entries, matching the layout Steam
    /// writes: `\x00shortcuts\x00` then indexed entry maps.
    fn sample_catalog() -> Vec<u8> {
        let root = VdfMap(vec![(
            "shortcuts".to_owned(),
            VdfValue::Map(VdfMap(vec![
                (
                    "0".to_owned(),
                    VdfValue::Map(VdfMap(vec![
                        ("appid".to_owned(), VdfValue::Int(-1_491_338_950)),
                        ("AppName".to_owned(), VdfValue::String("Celeste".to_owned())),
                        (
                            "Exe".to_owned(),
                            VdfValue::String("/home/deck/Games/Celeste/Celeste".to_owned()),
                        ),
                        ("icon".to_owned(), VdfValue::String(String::new())),
                        (
                            "tags".to_owned(),
                            VdfValue::Map(VdfMap(vec![(
                                "0".to_owned(),
                                VdfValue::String("capydeploy".to_owned()),
                            )])),
                        ),
                    ])),
                ),
                (
                    "1".to_owned(),
                    VdfValue::Map(VdfMap(vec![
                        ("appid".to_owned(), VdfValue::Int(7)),
                        ("AppName".to_owned(), VdfValue::String("Other".to_owned())),
                    ])),
                ),
            ])),
        )]);
        serialize(&root)
    }

    #[test]
    fn parse_serialize_is_byte_exact() {
        let bytes = sample_catalog();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(serialize(&parsed), bytes);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let bytes = sample_catalog();
        let parsed = parse(&bytes).unwrap();
        let entry = shortcut_entries(&parsed).next().unwrap();
        assert_eq!(entry.get_str("appname"), Some("Celeste"));
        assert_eq!(entry.get_str("APPNAME"), Some("Celeste"));
    }

    #[test]
    fn entry_id_carries_high_bit() {
        let bytes = sample_catalog();
        let parsed = parse(&bytes).unwrap();
        let ids: Vec<u32> = shortcut_entries(&parsed)
            .filter_map(entry_app_id)
            .collect();
        assert_eq!(ids[1], 7 | 0x8000_0000);
        assert!(ids.iter().all(|id| id & 0x8000_0000 != 0));
    }

    #[test]
    fn patch_icon_updates_matching_entry() {
        let bytes = sample_catalog();
        let mut parsed = parse(&bytes).unwrap();
        let target = (7u32) | 0x8000_0000;
        assert!(patch_icon(&mut parsed, target, "/grid/icon.png"));
        let reparsed = parse(&serialize(&parsed)).unwrap();
        let entry = shortcut_entries(&reparsed).nth(1).unwrap();
        assert_eq!(entry.get_str("icon"), Some("/grid/icon.png"));
    }

    #[test]
    fn patch_icon_misses_unknown_app_id() {
        let bytes = sample_catalog();
        let mut parsed = parse(&bytes).unwrap();
        assert!(!patch_icon(&mut parsed, 0x8000_1234, "/x.png"));
    }

    #[test]
    fn unknown_tag_is_fatal() {
        // 0x03 is not a valid tag.
        let bad = vec![0x03, b'k', 0x00, 0x08];
        assert!(matches!(parse(&bad), Err(VdfError::UnknownTag(0x03, _))));
    }

    #[test]
    fn truncated_input_is_fatal() {
        let mut bytes = sample_catalog();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(parse(&bytes), Err(VdfError::UnexpectedEof(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample_catalog();
        bytes.push(0xFF);
        assert!(matches!(parse(&bytes), Err(VdfError::TrailingData)));
    }
}
