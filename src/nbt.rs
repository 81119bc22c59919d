//! Named Binary Tag model and codec.
//!
//! Serializes and deserializes [`Tag`] trees to and from the binary NBT
//! format, in either byte order. The root of a well-formed stream is always
//! a named [`Compound`]. `.dat` files are gzip-compressed roots; chunk
//! payloads embedded in region files are raw (the region file applies its
//! own zlib/gzip framing).
//!
//! In addition to the standard kinds 0..=11 this codec understands kind 12
//! as an array of 16-bit integers, an extension used by older tooling and
//! some mods.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

// ─── Kinds ──────────────────────────────────────────────────────────────────

pub const TAG_END: u8 = 0;
pub const TAG_BYTE: u8 = 1;
pub const TAG_SHORT: u8 = 2;
pub const TAG_INT: u8 = 3;
pub const TAG_LONG: u8 = 4;
pub const TAG_FLOAT: u8 = 5;
pub const TAG_DOUBLE: u8 = 6;
pub const TAG_BYTE_ARRAY: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_LIST: u8 = 9;
pub const TAG_COMPOUND: u8 = 10;
pub const TAG_INT_ARRAY: u8 = 11;
pub const TAG_SHORT_ARRAY: u8 = 12;

/// Byte order for the fixed-width numeric encodings. Big-endian is the
/// Minecraft standard; little-endian variants exist for some platform ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// The kind discriminant of a [`Tag`], matching the on-disk kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    ByteArray,
    String,
    List,
    Compound,
    IntArray,
    ShortArray,
}

impl TagKind {
    pub fn id(self) -> u8 {
        match self {
            TagKind::Byte => TAG_BYTE,
            TagKind::Short => TAG_SHORT,
            TagKind::Int => TAG_INT,
            TagKind::Long => TAG_LONG,
            TagKind::Float => TAG_FLOAT,
            TagKind::Double => TAG_DOUBLE,
            TagKind::ByteArray => TAG_BYTE_ARRAY,
            TagKind::String => TAG_STRING,
            TagKind::List => TAG_LIST,
            TagKind::Compound => TAG_COMPOUND,
            TagKind::IntArray => TAG_INT_ARRAY,
            TagKind::ShortArray => TAG_SHORT_ARRAY,
        }
    }

    pub fn from_id(id: u8) -> Result<TagKind, NbtFormatError> {
        Ok(match id {
            TAG_BYTE => TagKind::Byte,
            TAG_SHORT => TagKind::Short,
            TAG_INT => TagKind::Int,
            TAG_LONG => TagKind::Long,
            TAG_FLOAT => TagKind::Float,
            TAG_DOUBLE => TagKind::Double,
            TAG_BYTE_ARRAY => TagKind::ByteArray,
            TAG_STRING => TagKind::String,
            TAG_LIST => TagKind::List,
            TAG_COMPOUND => TagKind::Compound,
            TAG_INT_ARRAY => TagKind::IntArray,
            TAG_SHORT_ARRAY => TagKind::ShortArray,
            other => return Err(NbtFormatError::UnknownKind(other)),
        })
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NbtFormatError {
    #[error("tag stream truncated at offset {offset}: {needed} more bytes needed")]
    Truncated { offset: usize, needed: usize },

    #[error("root tag is not a compound (kind byte {0:#04x})")]
    BadRoot(u8),

    #[error("asked to load root tag of zero length")]
    Empty,

    #[error("unknown tag kind {0}")]
    UnknownKind(u8),

    #[error("negative length prefix {0}")]
    NegativeLength(i32),

    #[error("tag string is not valid UTF-8")]
    InvalidString,

    #[error("string of {0} bytes exceeds the 65535-byte limit")]
    StringTooLong(usize),

    #[error("cannot insert {given:?} into a list of {expected:?}")]
    ListKindMismatch { expected: TagKind, given: TagKind },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Tag model ──────────────────────────────────────────────────────────────

/// One node of an NBT tree. Names are carried by the owning [`Compound`];
/// list members are unnamed by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<u8>),
    String(String),
    List(TagList),
    Compound(Compound),
    IntArray(Vec<i32>),
    ShortArray(Vec<i16>),
}

impl Tag {
    pub fn kind(&self) -> TagKind {
        match self {
            Tag::Byte(_) => TagKind::Byte,
            Tag::Short(_) => TagKind::Short,
            Tag::Int(_) => TagKind::Int,
            Tag::Long(_) => TagKind::Long,
            Tag::Float(_) => TagKind::Float,
            Tag::Double(_) => TagKind::Double,
            Tag::ByteArray(_) => TagKind::ByteArray,
            Tag::String(_) => TagKind::String,
            Tag::List(_) => TagKind::List,
            Tag::Compound(_) => TagKind::Compound,
            Tag::IntArray(_) => TagKind::IntArray,
            Tag::ShortArray(_) => TagKind::ShortArray,
        }
    }

    pub fn as_compound(&self) -> Option<&Compound> {
        match self {
            Tag::Compound(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_compound_mut(&mut self) -> Option<&mut Compound> {
        match self {
            Tag::Compound(c) => Some(c),
            _ => None,
        }
    }
}

macro_rules! tag_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Tag {
            fn from(v: $ty) -> Tag {
                Tag::$variant(v)
            }
        })*
    };
}

tag_from! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    Vec<u8> => ByteArray,
    String => String,
    TagList => List,
    Compound => Compound,
    Vec<i32> => IntArray,
    Vec<i16> => ShortArray,
}

impl From<&str> for Tag {
    fn from(v: &str) -> Tag {
        Tag::String(v.to_string())
    }
}

/// A homogeneous list of unnamed values of a single kind.
///
/// The element kind is fixed by the first insertion and all members must
/// match; an empty list defaults to [`TagKind::Byte`].
#[derive(Debug, Clone, PartialEq)]
pub struct TagList {
    kind: TagKind,
    items: Vec<Tag>,
}

impl Default for TagList {
    fn default() -> Self {
        TagList::new()
    }
}

impl TagList {
    pub fn new() -> TagList {
        TagList {
            kind: TagKind::Byte,
            items: Vec::new(),
        }
    }

    pub fn of(kind: TagKind) -> TagList {
        TagList {
            kind,
            items: Vec::new(),
        }
    }

    /// Build a list of compounds. Convenience for entity-style lists.
    pub fn from_compounds(items: impl IntoIterator<Item = Compound>) -> TagList {
        TagList {
            kind: TagKind::Compound,
            items: items.into_iter().map(Tag::Compound).collect(),
        }
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a value. The first value fixes the element kind; later values
    /// must match it.
    pub fn push(&mut self, tag: impl Into<Tag>) -> Result<(), NbtFormatError> {
        let tag = tag.into();
        if self.items.is_empty() {
            self.kind = tag.kind();
        } else if tag.kind() != self.kind {
            return Err(NbtFormatError::ListKindMismatch {
                expected: self.kind,
                given: tag.kind(),
            });
        }
        self.items.push(tag);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Tag> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Tag> {
        self.items.iter_mut()
    }

    /// Iterate the compound members, skipping any non-compound entries.
    pub fn compounds(&self) -> impl Iterator<Item = &Compound> {
        self.items.iter().filter_map(Tag::as_compound)
    }

    pub fn compounds_mut(&mut self) -> impl Iterator<Item = &mut Compound> {
        self.items.iter_mut().filter_map(Tag::as_compound_mut)
    }

    pub fn retain(&mut self, f: impl FnMut(&Tag) -> bool) {
        self.items.retain(f);
    }
}

impl<'a> IntoIterator for &'a TagList {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An ordered mapping of unique names to tags.
///
/// `insert` replaces an existing entry of the same name (last write wins)
/// unless duplicate-keys mode was enabled for this compound. Decoding
/// preserves duplicate entries exactly as read; `get` returns the first
/// match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Compound {
    entries: Vec<(String, Tag)>,
    duplicate_keys: bool,
}

impl Compound {
    pub fn new() -> Compound {
        Compound::default()
    }

    /// A compound that keeps duplicate names on `insert` instead of
    /// replacing. Matches the permissive mode some modded data needs.
    pub fn with_duplicate_keys() -> Compound {
        Compound {
            entries: Vec::new(),
            duplicate_keys: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tag: impl Into<Tag>) {
        let name = name.into();
        let tag = tag.into();
        if !self.duplicate_keys {
            if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = tag;
                return;
            }
        }
        self.entries.push((name, tag));
    }

    pub fn remove(&mut self, name: &str) -> Option<Tag> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tag> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tag)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    // ── Typed accessors ──

    pub fn get_byte(&self, name: &str) -> Option<i8> {
        match self.get(name)? {
            Tag::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_short(&self, name: &str) -> Option<i16> {
        match self.get(name)? {
            Tag::Short(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            Tag::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Tag::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            Tag::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Tag::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Tag::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_byte_array(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            Tag::ByteArray(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_byte_array_mut(&mut self, name: &str) -> Option<&mut Vec<u8>> {
        match self.get_mut(name)? {
            Tag::ByteArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_int_array(&self, name: &str) -> Option<&[i32]> {
        match self.get(name)? {
            Tag::IntArray(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_int_array_mut(&mut self, name: &str) -> Option<&mut Vec<i32>> {
        match self.get_mut(name)? {
            Tag::IntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_short_array(&self, name: &str) -> Option<&[i16]> {
        match self.get(name)? {
            Tag::ShortArray(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&TagList> {
        match self.get(name)? {
            Tag::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_list_mut(&mut self, name: &str) -> Option<&mut TagList> {
        match self.get_mut(name)? {
            Tag::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_compound(&self, name: &str) -> Option<&Compound> {
        self.get(name)?.as_compound()
    }

    pub fn get_compound_mut(&mut self, name: &str) -> Option<&mut Compound> {
        self.get_mut(name)?.as_compound_mut()
    }

    /// Serialize this compound as a gzip-compressed named root, the framing
    /// used for `level.dat` and other standalone `.dat` files.
    pub fn save_gzipped(&self, name: &str) -> Result<Vec<u8>, NbtFormatError> {
        let mut raw = Vec::new();
        write_nbt(&mut raw, Some(name), self, Endianness::Big)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }
}

// ─── Decoding ───────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], NbtFormatError> {
        let remaining = self.data.len() - self.pos;
        if n > remaining {
            return Err(NbtFormatError::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, NbtFormatError> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8, NbtFormatError> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> Result<u16, NbtFormatError> {
        let b: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Big => u16::from_be_bytes(b),
            Endianness::Little => u16::from_le_bytes(b),
        })
    }

    fn read_i16(&mut self) -> Result<i16, NbtFormatError> {
        Ok(self.read_u16()? as i16)
    }

    fn read_i32(&mut self) -> Result<i32, NbtFormatError> {
        let b: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Big => i32::from_be_bytes(b),
            Endianness::Little => i32::from_le_bytes(b),
        })
    }

    fn read_i64(&mut self) -> Result<i64, NbtFormatError> {
        let b: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Big => i64::from_be_bytes(b),
            Endianness::Little => i64::from_le_bytes(b),
        })
    }

    fn read_f32(&mut self) -> Result<f32, NbtFormatError> {
        Ok(f32::from_bits(self.read_i32()? as u32))
    }

    fn read_f64(&mut self) -> Result<f64, NbtFormatError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// Length prefix for array payloads: declared count, bounds-checked.
    fn read_count(&mut self) -> Result<usize, NbtFormatError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(NbtFormatError::NegativeLength(count));
        }
        Ok(count as usize)
    }

    fn read_string(&mut self) -> Result<String, NbtFormatError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| NbtFormatError::InvalidString)
    }

    fn read_value(&mut self, kind: TagKind) -> Result<Tag, NbtFormatError> {
        Ok(match kind {
            TagKind::Byte => Tag::Byte(self.read_i8()?),
            TagKind::Short => Tag::Short(self.read_i16()?),
            TagKind::Int => Tag::Int(self.read_i32()?),
            TagKind::Long => Tag::Long(self.read_i64()?),
            TagKind::Float => Tag::Float(self.read_f32()?),
            TagKind::Double => Tag::Double(self.read_f64()?),
            TagKind::ByteArray => {
                let count = self.read_count()?;
                Tag::ByteArray(self.take(count)?.to_vec())
            }
            TagKind::String => Tag::String(self.read_string()?),
            TagKind::List => Tag::List(self.read_list()?),
            TagKind::Compound => Tag::Compound(self.read_compound()?),
            // Int/Short array elements are always big-endian, regardless of
            // the selected byte order (legacy behavior).
            TagKind::IntArray => {
                let count = self.read_count()?;
                let bytes = self.take(count * 4)?;
                Tag::IntArray(
                    bytes
                        .chunks_exact(4)
                        .map(|b| i32::from_be_bytes(b.try_into().unwrap()))
                        .collect(),
                )
            }
            TagKind::ShortArray => {
                let count = self.read_count()?;
                let bytes = self.take(count * 2)?;
                Tag::ShortArray(
                    bytes
                        .chunks_exact(2)
                        .map(|b| i16::from_be_bytes(b.try_into().unwrap()))
                        .collect(),
                )
            }
        })
    }

    fn read_list(&mut self) -> Result<TagList, NbtFormatError> {
        let kind_id = self.read_u8()?;
        let count = self.read_count()?;
        // Empty lists in the wild carry kind 0 (or junk); default them to
        // Byte rather than failing.
        if count == 0 {
            let kind = TagKind::from_id(kind_id).unwrap_or(TagKind::Byte);
            return Ok(TagList::of(kind));
        }
        let kind = TagKind::from_id(kind_id)?;
        let mut list = TagList::of(kind);
        for _ in 0..count {
            let value = self.read_value(kind)?;
            list.items.push(value);
        }
        Ok(list)
    }

    fn read_compound(&mut self) -> Result<Compound, NbtFormatError> {
        let mut compound = Compound::new();
        // Stops at an End byte, or at the end of the buffer for tolerance of
        // truncated-terminator streams.
        while !self.at_end() {
            let kind_id = self.read_u8()?;
            if kind_id == TAG_END {
                break;
            }
            let kind = TagKind::from_id(kind_id)?;
            let name = self.read_string()?;
            let value = self.read_value(kind)?;
            // Duplicates from disk are preserved as read.
            compound.entries.push((name, value));
        }
        Ok(compound)
    }
}

/// Decode a raw (uncompressed) NBT stream. Returns the root compound and its
/// name. Fails with [`NbtFormatError`] if the stream is empty, the root kind
/// is not a compound, or any declared length runs past the end of the buffer.
pub fn read_nbt(data: &[u8], endian: Endianness) -> Result<(Compound, String), NbtFormatError> {
    if data.is_empty() {
        return Err(NbtFormatError::Empty);
    }
    let mut reader = Reader {
        data,
        pos: 0,
        endian,
    };
    let kind = reader.read_u8()?;
    if kind != TAG_COMPOUND {
        return Err(NbtFormatError::BadRoot(kind));
    }
    let name = reader.read_string()?;
    let root = reader.read_compound()?;
    Ok((root, name))
}

/// Decode a `.dat`-style buffer: transparently gunzips if the data is
/// gzip-framed, then decodes big-endian.
pub fn load(data: &[u8]) -> Result<(Compound, String), NbtFormatError> {
    match try_gunzip(data) {
        Some(raw) => read_nbt(&raw, Endianness::Big),
        None => read_nbt(data, Endianness::Big),
    }
}

/// Gunzip `data` if it looks like a gzip stream; `None` when it does not
/// decode as one.
pub fn try_gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

// ─── Encoding ───────────────────────────────────────────────────────────────

struct Writer<'a> {
    out: &'a mut Vec<u8>,
    endian: Endianness,
}

impl<'a> Writer<'a> {
    fn write_u16(&mut self, v: u16) {
        match self.endian {
            Endianness::Big => self.out.extend_from_slice(&v.to_be_bytes()),
            Endianness::Little => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn write_i32(&mut self, v: i32) {
        match self.endian {
            Endianness::Big => self.out.extend_from_slice(&v.to_be_bytes()),
            Endianness::Little => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn write_i64(&mut self, v: i64) {
        match self.endian {
            Endianness::Big => self.out.extend_from_slice(&v.to_be_bytes()),
            Endianness::Little => self.out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    fn write_string(&mut self, s: &str) -> Result<(), NbtFormatError> {
        let bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(NbtFormatError::StringTooLong(bytes.len()));
        }
        self.write_u16(bytes.len() as u16);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn write_value(&mut self, tag: &Tag) -> Result<(), NbtFormatError> {
        match tag {
            Tag::Byte(v) => self.out.push(*v as u8),
            Tag::Short(v) => self.write_u16(*v as u16),
            Tag::Int(v) => self.write_i32(*v),
            Tag::Long(v) => self.write_i64(*v),
            Tag::Float(v) => self.write_i32(v.to_bits() as i32),
            Tag::Double(v) => self.write_i64(v.to_bits() as i64),
            Tag::ByteArray(v) => {
                self.write_i32(v.len() as i32);
                self.out.extend_from_slice(v);
            }
            Tag::String(v) => self.write_string(v)?,
            Tag::List(list) => {
                self.out.push(list.kind.id());
                self.write_i32(list.items.len() as i32);
                for item in &list.items {
                    self.write_value(item)?;
                }
            }
            Tag::Compound(compound) => self.write_compound(compound)?,
            Tag::IntArray(v) => {
                self.write_i32(v.len() as i32);
                for value in v {
                    self.out.extend_from_slice(&value.to_be_bytes());
                }
            }
            Tag::ShortArray(v) => {
                self.write_i32(v.len() as i32);
                for value in v {
                    self.out.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    fn write_compound(&mut self, compound: &Compound) -> Result<(), NbtFormatError> {
        for (name, tag) in &compound.entries {
            self.out.push(tag.kind().id());
            self.write_string(name)?;
            self.write_value(tag)?;
        }
        self.out.push(TAG_END);
        Ok(())
    }
}

/// Encode `root` as a raw NBT stream with the given root name (empty when
/// `None`), mirroring [`read_nbt`].
pub fn write_nbt(
    out: &mut Vec<u8>,
    name: Option<&str>,
    root: &Compound,
    endian: Endianness,
) -> Result<(), NbtFormatError> {
    let mut writer = Writer { out, endian };
    writer.out.push(TAG_COMPOUND);
    writer.write_string(name.unwrap_or(""))?;
    writer.write_compound(root)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical "hello world" fixture: a root compound named
    /// "hello world" holding one string "name" = "Bananrama".
    fn hello_world_bytes() -> Vec<u8> {
        let mut data = vec![0x0a, 0x00, 0x0b];
        data.extend_from_slice(b"hello world");
        data.extend_from_slice(&[0x08, 0x00, 0x04]);
        data.extend_from_slice(b"name");
        data.extend_from_slice(&[0x00, 0x09]);
        data.extend_from_slice(b"Bananrama");
        data.push(0x00);
        data
    }

    #[test]
    fn test_hello_world_fixture() {
        let data = hello_world_bytes();
        let (root, name) = read_nbt(&data, Endianness::Big).unwrap();
        assert_eq!(name, "hello world");
        assert_eq!(root.len(), 1);
        assert_eq!(root.get_str("name"), Some("Bananrama"));
    }

    #[test]
    fn test_hello_world_reencodes_identically() {
        let data = hello_world_bytes();
        let (root, name) = read_nbt(&data, Endianness::Big).unwrap();
        let mut out = Vec::new();
        write_nbt(&mut out, Some(&name), &root, Endianness::Big).unwrap();
        assert_eq!(out, data);
    }

    fn sample_tree() -> Compound {
        let mut inner = Compound::new();
        inner.insert("created-on", 1264099775885i64);
        inner.insert("name", "Compound tag #0");

        let mut list = TagList::new();
        list.push(Tag::Compound(inner.clone())).unwrap();
        list.push(Tag::Compound(inner)).unwrap();

        let mut doubles = TagList::new();
        for i in 0..4 {
            doubles.push(0.5 * i as f64).unwrap();
        }

        let mut root = Compound::new();
        root.insert("byteTest", 127i8);
        root.insert("shortTest", 32767i16);
        root.insert("intTest", 2147483647i32);
        root.insert("longTest", 9223372036854775807i64);
        root.insert("floatTest", 0.49823147f32);
        root.insert("doubleTest", 0.4931287132182315f64);
        root.insert("stringTest", "HELLO WORLD THIS IS A TEST STRING \u{c5}\u{c4}\u{d6}!");
        root.insert("byteArrayTest", (0u8..100).collect::<Vec<u8>>());
        root.insert("intArrayTest", vec![1i32, -2, 300000, -400000]);
        root.insert("shortArrayTest", vec![1i16, -2, 300, -400]);
        root.insert("listTest (compound)", list);
        root.insert("listTest (double)", doubles);
        root
    }

    #[test]
    fn test_roundtrip_big_endian() {
        let root = sample_tree();
        let mut out = Vec::new();
        write_nbt(&mut out, Some("Level"), &root, Endianness::Big).unwrap();
        let (decoded, name) = read_nbt(&out, Endianness::Big).unwrap();
        assert_eq!(name, "Level");
        assert_eq!(decoded, root);
    }

    #[test]
    fn test_roundtrip_little_endian() {
        let root = sample_tree();
        let mut out = Vec::new();
        write_nbt(&mut out, Some("Level"), &root, Endianness::Little).unwrap();
        let (decoded, name) = read_nbt(&out, Endianness::Little).unwrap();
        assert_eq!(name, "Level");
        assert_eq!(decoded, root);
    }

    #[test]
    fn test_endianness_changes_numeric_encoding() {
        let mut root = Compound::new();
        root.insert("v", 0x01020304i32);
        let mut big = Vec::new();
        let mut little = Vec::new();
        write_nbt(&mut big, None, &root, Endianness::Big).unwrap();
        write_nbt(&mut little, None, &root, Endianness::Little).unwrap();
        assert_ne!(big, little);
        // Cross-decoding reads the bytes with the wrong significance.
        let (wrong, _) = read_nbt(&big, Endianness::Little).unwrap();
        assert_eq!(wrong.get_int("v"), Some(0x04030201));
    }

    #[test]
    fn test_int_array_elements_stay_big_endian() {
        let mut root = Compound::new();
        root.insert("a", vec![1i32]);
        let mut out = Vec::new();
        write_nbt(&mut out, None, &root, Endianness::Little).unwrap();
        // kind, name len (LE), entry kind, entry name "a", count 1 (LE),
        // then the element itself, still big-endian: 00 00 00 01.
        assert_eq!(&out[out.len() - 5..out.len() - 1], &[0x00, 0x00, 0x00, 0x01]);
        let (decoded, _) = read_nbt(&out, Endianness::Little).unwrap();
        assert_eq!(decoded.get_int_array("a"), Some(&[1i32][..]));
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(
            read_nbt(&[], Endianness::Big),
            Err(NbtFormatError::Empty)
        ));
    }

    #[test]
    fn test_non_compound_root_fails() {
        // A root string tag is not a valid NBT file.
        let data = [0x08, 0x00, 0x00];
        assert!(matches!(
            read_nbt(&data, Endianness::Big),
            Err(NbtFormatError::BadRoot(0x08))
        ));
    }

    #[test]
    fn test_truncated_string_length_fails() {
        // Root compound with a string entry whose declared length (200)
        // exceeds the remaining bytes.
        let mut data = vec![0x0a, 0x00, 0x00];
        data.extend_from_slice(&[0x08, 0x00, 0x01, b'x', 0x00, 200]);
        data.extend_from_slice(b"short");
        assert!(matches!(
            read_nbt(&data, Endianness::Big),
            Err(NbtFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_truncated_array_count_fails() {
        // Byte array declaring 1000 elements with 3 bytes present.
        let mut data = vec![0x0a, 0x00, 0x00];
        data.extend_from_slice(&[0x07, 0x00, 0x01, b'a']);
        data.extend_from_slice(&1000i32.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            read_nbt(&data, Endianness::Big),
            Err(NbtFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_negative_list_count_fails() {
        let mut data = vec![0x0a, 0x00, 0x00];
        data.extend_from_slice(&[0x09, 0x00, 0x01, b'l', TAG_BYTE]);
        data.extend_from_slice(&(-5i32).to_be_bytes());
        data.push(0x00);
        assert!(matches!(
            read_nbt(&data, Endianness::Big),
            Err(NbtFormatError::NegativeLength(-5))
        ));
    }

    #[test]
    fn test_list_kind_fixed_on_first_insert() {
        let mut list = TagList::new();
        assert_eq!(list.kind(), TagKind::Byte);
        list.push(3i32).unwrap();
        assert_eq!(list.kind(), TagKind::Int);
        assert!(matches!(
            list.push(1i8),
            Err(NbtFormatError::ListKindMismatch { .. })
        ));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_empty_list_with_end_kind_decodes() {
        // Empty lists in the wild have been seen with element kind 0.
        let mut data = vec![0x0a, 0x00, 0x00];
        data.extend_from_slice(&[0x09, 0x00, 0x01, b'l', 0x00]);
        data.extend_from_slice(&0i32.to_be_bytes());
        data.push(0x00);
        let (root, _) = read_nbt(&data, Endianness::Big).unwrap();
        let list = root.get_list("l").unwrap();
        assert!(list.is_empty());
        assert_eq!(list.kind(), TagKind::Byte);
    }

    #[test]
    fn test_compound_last_write_wins() {
        let mut c = Compound::new();
        c.insert("k", 1i32);
        c.insert("k", 2i32);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get_int("k"), Some(2));
    }

    #[test]
    fn test_compound_duplicate_keys_mode() {
        let mut c = Compound::with_duplicate_keys();
        c.insert("k", 1i32);
        c.insert("k", 2i32);
        assert_eq!(c.len(), 2);
        // First match wins on read.
        assert_eq!(c.get_int("k"), Some(1));
    }

    #[test]
    fn test_compound_preserves_insertion_order() {
        let mut c = Compound::new();
        c.insert("b", 1i8);
        c.insert("a", 2i8);
        c.insert("c", 3i8);
        let names: Vec<&str> = c.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn test_gzipped_dat_roundtrip() {
        let root = sample_tree();
        let bytes = root.save_gzipped("Data").unwrap();
        // Must actually be gzip-framed.
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let (decoded, name) = load(&bytes).unwrap();
        assert_eq!(name, "Data");
        assert_eq!(decoded, root);
    }

    #[test]
    fn test_load_accepts_raw_stream() {
        let data = hello_world_bytes();
        let (root, _) = load(&data).unwrap();
        assert_eq!(root.get_str("name"), Some("Bananrama"));
    }
}
