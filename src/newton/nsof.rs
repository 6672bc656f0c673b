//! Newton Streamed Object Format.
//!
//! A compact tag-prefixed codec for the structured values the Dock
//! protocol exchanges: immediates (integers, true/nil, characters),
//! symbols, UTF-16 strings, arrays and frames. Values live in an arena
//! and reference each other by index, which keeps the object graph
//! explicit and lets the precedent table express shared sub-objects:
//! the first occurrence of an object is encoded in full and assigned
//! the next precedent index, later occurrences are two-byte back
//! references. Sharing is detected by structural equality, not
//! identity.
//!
//! Reals and integers beyond 30 bits appear in the format but are not
//! produced by any supported verb; the decoder reports them as
//! unsupported rather than guessing.

use alloc::string::String;
use alloc::vec::Vec;

/// Index of an object in an [`NsArena`].
pub type ObjId = usize;

/// A value: either an immediate or a reference into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsRef {
    Int(i32),
    True,
    Nil,
    Char(u16),
    Obj(ObjId),
}

/// A heap object. Frame keys are symbol objects, kept as a parallel
/// list the way the wire format encodes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsObj {
    Symbol(String),
    String(Vec<u16>),
    Array(Vec<NsRef>),
    Frame(Vec<(ObjId, NsRef)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsofError {
    /// Input ended in the middle of a value.
    Truncated,
    /// The stream did not start with version 0x02.
    BadVersion(u8),
    /// Unknown or out-of-place tag byte.
    BadTag(u8),
    /// A precedent index referenced nothing.
    BadPrecedent(u32),
    /// A frame key was not a symbol.
    BadFrameKey,
    /// Reals and large-integer encodings are not exercised by the
    /// supported verbs.
    Unsupported,
    /// The string terminator was missing or the length odd.
    BadString,
}

const TAG_IMMEDIATE: u8 = 0;
const TAG_ARRAY: u8 = 5;
const TAG_FRAME: u8 = 6;
const TAG_SYMBOL: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_PRECEDENT: u8 = 9;
/// The handheld encodes a top-level nil with its own tag.
const TAG_NIL: u8 = 10;

const IMM_TRUE: i32 = 0x1A;
const IMM_NIL: i32 = 0x02;

const VERSION: u8 = 0x02;

/// Equality comparisons stop at this depth; the Dock values are flat.
const MAX_EQ_DEPTH: u32 = 32;

#[derive(Debug, Default)]
pub struct NsArena {
    objs: Vec<NsObj>,
}

impl NsArena {
    pub fn new() -> NsArena {
        NsArena::default()
    }

    pub fn alloc(&mut self, obj: NsObj) -> ObjId {
        self.objs.push(obj);
        self.objs.len() - 1
    }

    pub fn get(&self, id: ObjId) -> &NsObj {
        &self.objs[id]
    }

    pub fn symbol(&mut self, name: &str) -> ObjId {
        self.alloc(NsObj::Symbol(String::from(name)))
    }

    /// A string object from UTF-8 text, stored as UTF-16 code units.
    pub fn string(&mut self, text: &str) -> ObjId {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.alloc(NsObj::String(units))
    }

    pub fn string_utf16(&mut self, units: Vec<u16>) -> ObjId {
        self.alloc(NsObj::String(units))
    }

    pub fn array(&mut self, elements: Vec<NsRef>) -> ObjId {
        self.alloc(NsObj::Array(elements))
    }

    pub fn frame(&mut self, slots: Vec<(ObjId, NsRef)>) -> ObjId {
        self.alloc(NsObj::Frame(slots))
    }

    /// The UTF-16 contents if the value is a string.
    pub fn as_string(&self, value: NsRef) -> Option<&[u16]> {
        match value {
            NsRef::Obj(id) => match self.get(id) {
                NsObj::String(units) => Some(units),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_array(&self, value: NsRef) -> Option<&[NsRef]> {
        match value {
            NsRef::Obj(id) => match self.get(id) {
                NsObj::Array(elements) => Some(elements),
                _ => None,
            },
            _ => None,
        }
    }

    /// Lossy UTF-8 rendition of a string value.
    pub fn string_to_utf8(&self, value: NsRef) -> Option<String> {
        let units = self.as_string(value)?;
        Some(
            char::decode_utf16(units.iter().copied())
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        )
    }
}

/// Structural equality between two values, possibly across arenas.
pub fn structurally_eq(a_arena: &NsArena, a: NsRef, b_arena: &NsArena, b: NsRef) -> bool {
    eq_at_depth(a_arena, a, b_arena, b, MAX_EQ_DEPTH)
}

fn eq_at_depth(a_arena: &NsArena, a: NsRef, b_arena: &NsArena, b: NsRef, depth: u32) -> bool {
    if depth == 0 {
        return false;
    }
    match (a, b) {
        (NsRef::Obj(a_id), NsRef::Obj(b_id)) => {
            match (a_arena.get(a_id), b_arena.get(b_id)) {
                (NsObj::Symbol(x), NsObj::Symbol(y)) => x == y,
                (NsObj::String(x), NsObj::String(y)) => x == y,
                (NsObj::Array(x), NsObj::Array(y)) => {
                    x.len() == y.len()
                        && x.iter()
                            .zip(y)
                            .all(|(&u, &v)| eq_at_depth(a_arena, u, b_arena, v, depth - 1))
                }
                (NsObj::Frame(x), NsObj::Frame(y)) => {
                    x.len() == y.len()
                        && x.iter().zip(y).all(|(&(ka, va), &(kb, vb))| {
                            eq_at_depth(
                                a_arena,
                                NsRef::Obj(ka),
                                b_arena,
                                NsRef::Obj(kb),
                                depth - 1,
                            ) && eq_at_depth(a_arena, va, b_arena, vb, depth - 1)
                        })
                }
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn push_xlong(out: &mut Vec<u8>, value: i32) {
    if (0..255).contains(&value) {
        out.push(value as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    }
}

/// Encode a value, version byte included.
pub fn encode(arena: &NsArena, root: NsRef, out: &mut Vec<u8>) {
    out.push(VERSION);
    let mut precedents: Vec<ObjId> = Vec::new();
    encode_value(arena, root, out, &mut precedents);
}

fn encode_value(arena: &NsArena, value: NsRef, out: &mut Vec<u8>, precedents: &mut Vec<ObjId>) {
    match value {
        NsRef::Int(i) => {
            out.push(TAG_IMMEDIATE);
            push_xlong(out, i << 2);
        }
        NsRef::True => {
            out.push(TAG_IMMEDIATE);
            push_xlong(out, IMM_TRUE);
        }
        NsRef::Nil => {
            out.push(TAG_IMMEDIATE);
            push_xlong(out, IMM_NIL);
        }
        NsRef::Char(c) => {
            out.push(TAG_IMMEDIATE);
            push_xlong(out, ((c as i32) << 4) | 6);
        }
        NsRef::Obj(id) => {
            // Second and later occurrences become back references.
            if let Some(index) = precedents
                .iter()
                .position(|&seen| seen == id || objects_eq(arena, seen, id))
            {
                out.push(TAG_PRECEDENT);
                push_xlong(out, index as i32);
                return;
            }
            precedents.push(id);
            match arena.get(id) {
                NsObj::Symbol(name) => {
                    out.push(TAG_SYMBOL);
                    push_xlong(out, name.len() as i32);
                    out.extend_from_slice(name.as_bytes());
                }
                NsObj::String(units) => {
                    out.push(TAG_STRING);
                    push_xlong(out, (units.len() * 2 + 2) as i32);
                    for unit in units {
                        out.extend_from_slice(&unit.to_be_bytes());
                    }
                    out.extend_from_slice(&[0, 0]);
                }
                NsObj::Array(elements) => {
                    out.push(TAG_ARRAY);
                    push_xlong(out, elements.len() as i32);
                    for &element in elements {
                        encode_value(arena, element, out, precedents);
                    }
                }
                NsObj::Frame(slots) => {
                    out.push(TAG_FRAME);
                    push_xlong(out, slots.len() as i32);
                    for &(key, _) in slots {
                        encode_value(arena, NsRef::Obj(key), out, precedents);
                    }
                    for &(_, slot_value) in slots {
                        encode_value(arena, slot_value, out, precedents);
                    }
                }
            }
        }
    }
}

fn objects_eq(arena: &NsArena, a: ObjId, b: ObjId) -> bool {
    eq_at_depth(arena, NsRef::Obj(a), arena, NsRef::Obj(b), MAX_EQ_DEPTH)
}

/// Decode one value from `data` into `arena`.
pub fn decode(arena: &mut NsArena, data: &[u8]) -> Result<NsRef, NsofError> {
    let mut decoder = Decoder {
        data,
        pos: 0,
        precedents: Vec::new(),
    };
    let version = decoder.next()?;
    if version != VERSION {
        return Err(NsofError::BadVersion(version));
    }
    decoder.decode_value(arena)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    precedents: Vec<NsRef>,
}

impl Decoder<'_> {
    fn next(&mut self) -> Result<u8, NsofError> {
        let byte = *self.data.get(self.pos).ok_or(NsofError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn xlong(&mut self) -> Result<i32, NsofError> {
        let first = self.next()?;
        if first < 0xFF {
            return Ok(first as i32);
        }
        let mut word = [0u8; 4];
        for byte in &mut word {
            *byte = self.next()?;
        }
        Ok(i32::from_be_bytes(word))
    }

    fn decode_value(&mut self, arena: &mut NsArena) -> Result<NsRef, NsofError> {
        let tag = self.next()?;
        match tag {
            TAG_IMMEDIATE => {
                let imm = self.xlong()?;
                if imm == IMM_TRUE {
                    Ok(NsRef::True)
                } else if imm == IMM_NIL {
                    Ok(NsRef::Nil)
                } else if imm & 3 == 0 {
                    Ok(NsRef::Int(imm >> 2))
                } else if imm & 0xF == 6 {
                    Ok(NsRef::Char((imm >> 4) as u16))
                } else {
                    Err(NsofError::Unsupported)
                }
            }
            TAG_SYMBOL => {
                let len = self.xlong()? as usize;
                let mut name = String::with_capacity(len);
                for _ in 0..len {
                    name.push(self.next()? as char);
                }
                let id = arena.alloc(NsObj::Symbol(name));
                self.precedents.push(NsRef::Obj(id));
                Ok(NsRef::Obj(id))
            }
            TAG_STRING => {
                let byte_len = self.xlong()? as usize;
                if byte_len < 2 || byte_len % 2 != 0 {
                    return Err(NsofError::BadString);
                }
                let mut units = Vec::with_capacity(byte_len / 2 - 1);
                for _ in 0..(byte_len / 2 - 1) {
                    let hi = self.next()?;
                    let lo = self.next()?;
                    units.push(u16::from_be_bytes([hi, lo]));
                }
                if self.next()? != 0 || self.next()? != 0 {
                    return Err(NsofError::BadString);
                }
                let id = arena.alloc(NsObj::String(units));
                self.precedents.push(NsRef::Obj(id));
                Ok(NsRef::Obj(id))
            }
            TAG_ARRAY => {
                let count = self.xlong()? as usize;
                // Insert the slot first so self-references resolve.
                let id = arena.alloc(NsObj::Array(Vec::new()));
                self.precedents.push(NsRef::Obj(id));
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.decode_value(arena)?);
                }
                arena.objs[id] = NsObj::Array(elements);
                Ok(NsRef::Obj(id))
            }
            TAG_FRAME => {
                let count = self.xlong()? as usize;
                let id = arena.alloc(NsObj::Frame(Vec::new()));
                self.precedents.push(NsRef::Obj(id));
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.decode_value(arena)? {
                        NsRef::Obj(key) if matches!(arena.get(key), NsObj::Symbol(_)) => {
                            keys.push(key);
                        }
                        _ => return Err(NsofError::BadFrameKey),
                    }
                }
                let mut slots = Vec::with_capacity(count);
                for key in keys {
                    slots.push((key, self.decode_value(arena)?));
                }
                arena.objs[id] = NsObj::Frame(slots);
                Ok(NsRef::Obj(id))
            }
            TAG_PRECEDENT => {
                let index = self.xlong()? as u32;
                self.precedents
                    .get(index as usize)
                    .copied()
                    .ok_or(NsofError::BadPrecedent(index))
            }
            TAG_NIL => Ok(NsRef::Nil),
            other => Err(NsofError::BadTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn encodes_immediates_like_the_handheld() {
        let arena = NsArena::new();
        let mut out = Vec::new();
        encode(&arena, NsRef::Int(2), &mut out);
        assert_eq!(out, [0x02, 0x00, 0x08]);

        out.clear();
        encode(&arena, NsRef::True, &mut out);
        assert_eq!(out, [0x02, 0x00, 0x1A]);

        out.clear();
        encode(&arena, NsRef::Nil, &mut out);
        assert_eq!(out, [0x02, 0x00, 0x02]);

        out.clear();
        encode(&arena, NsRef::Char('X' as u16), &mut out);
        assert_eq!(out, [0x02, 0x00, 0xFF, 0x00, 0x00, 0x05, 0x86]);
    }

    #[test]
    fn encodes_symbol_and_string() {
        let mut arena = NsArena::new();
        let sym = arena.symbol("name");
        let mut out = Vec::new();
        encode(&arena, NsRef::Obj(sym), &mut out);
        assert_eq!(out, [0x02, 0x07, 0x04, b'n', b'a', b'm', b'e']);

        let mut arena = NsArena::new();
        let s = arena.string("Hi");
        out.clear();
        encode(&arena, NsRef::Obj(s), &mut out);
        assert_eq!(
            out,
            [0x02, 0x08, 0x06, 0x00, b'H', 0x00, b'i', 0x00, 0x00]
        );
    }

    #[test]
    fn round_trips_nested_values() {
        let mut arena = NsArena::new();
        let name = arena.symbol("name");
        let kind = arena.symbol("type");
        let disk = arena.string("Disk");
        let frame = arena.frame(vec![
            (name, NsRef::Obj(disk)),
            (kind, NsRef::Int(2)),
        ]);
        let root = arena.array(vec![NsRef::Obj(frame), NsRef::True, NsRef::Nil]);

        let mut wire = Vec::new();
        encode(&arena, NsRef::Obj(root), &mut wire);

        let mut decoded_arena = NsArena::new();
        let decoded = decode(&mut decoded_arena, &wire).unwrap();
        assert!(structurally_eq(
            &arena,
            NsRef::Obj(root),
            &decoded_arena,
            decoded
        ));
    }

    #[test]
    fn shared_objects_become_precedents() {
        let mut arena = NsArena::new();
        let sym = arena.symbol("type");
        // The same symbol object twice and a structurally equal twin.
        let twin = arena.symbol("type");
        let root = arena.array(vec![NsRef::Obj(sym), NsRef::Obj(sym), NsRef::Obj(twin)]);

        let mut wire = Vec::new();
        encode(&arena, NsRef::Obj(root), &mut wire);
        // version, array tag, count, symbol in full, then two 2-byte
        // precedent references (tag 9, index 1 = first non-root object).
        let symbol_bytes = 2 + "type".len();
        assert_eq!(wire.len(), 3 + symbol_bytes + 2 + 2);
        assert_eq!(&wire[wire.len() - 4..], [9, 1, 9, 1]);

        let mut decoded_arena = NsArena::new();
        let decoded = decode(&mut decoded_arena, &wire).unwrap();
        let elements = decoded_arena.as_array(decoded).unwrap();
        // All three collapse onto one shared decoded object.
        assert_eq!(elements[0], elements[1]);
        assert_eq!(elements[1], elements[2]);
    }

    #[test]
    fn rejects_bad_input() {
        let mut arena = NsArena::new();
        assert_eq!(decode(&mut arena, &[0x03, 0x00, 0x08]), Err(NsofError::BadVersion(0x03)));
        assert_eq!(decode(&mut arena, &[0x02, 0x04]), Err(NsofError::BadTag(4)));
        assert_eq!(decode(&mut arena, &[0x02, 0x05, 0x02, 0x00]), Err(NsofError::Truncated));
        assert_eq!(
            decode(&mut arena, &[0x02, 0x09, 0x00]),
            Err(NsofError::BadPrecedent(0))
        );
    }
}
