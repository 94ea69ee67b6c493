//! # Remopack
//!
//! A small, bounded TLV byte format for values crossing a process boundary.
//!
//! ## Philosophy
//!
//! - **Explicit State**: The encoder tracks open scopes on a stack and back-patches
//!   container lengths when a scope closes. Nothing is buffered behind your back.
//! - **Skippable**: Every item is `[Tag][Length?][Value]`, so a reader can step over
//!   anything it does not understand.
//! - **Zero-Copy Reads**: Decoders are bounds-checked views over the input slice.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! All integers are Little-Endian.


/// Encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`, or a different tag was expected.
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Closing a scope that does not match the innermost open scope.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Wrote a second item into a scope that holds exactly one.
    TooManyItems(Scope),
    /// Closed a scope that holds exactly one item without writing it.
    EmptyScope(Scope),
    /// Wrote something other than a variant directly into a map.
    InvalidMapEntry,
    /// The reader finished with unread bytes left over.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "invalid tag byte: {:#04x}", b),
            Error::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            Error::UnexpectedEnd => write!(f, "unexpected end of buffer"),
            Error::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds the u32 length limit", n),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::ScopeUnderflow => write!(f, "no open scope to close"),
            Error::ScopeStillOpen => write!(f, "cannot finalize with open scopes"),
            Error::TooManyItems(s) => write!(f, "too many items in {:?} scope; expected exactly 1", s),
            Error::EmptyScope(s) => write!(f, "empty {:?} scope; expected exactly 1 item", s),
            Error::InvalidMapEntry => write!(f, "map entries must be variants"),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for remopack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of an encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Null = 0x01,
    Undefined = 0x02,
    True = 0x03,
    False = 0x04,
    U32 = 0x05,
    U64 = 0x06,
    S64 = 0x07,
    F64 = 0x08,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,
    OptionNone = 0x30,
    OptionSome = 0x31,
    Variant = 0x32,
}

impl Tag {
    /// Returns the Tag for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        let tag = match b {
            0x01 => Tag::Null,
            0x02 => Tag::Undefined,
            0x03 => Tag::True,
            0x04 => Tag::False,
            0x05 => Tag::U32,
            0x06 => Tag::U64,
            0x07 => Tag::S64,
            0x08 => Tag::F64,
            0x10 => Tag::String,
            0x11 => Tag::Bytes,
            0x20 => Tag::List,
            0x21 => Tag::Map,
            0x30 => Tag::OptionNone,
            0x31 => Tag::OptionSome,
            0x32 => Tag::Variant,
            _ => return None,
        };
        Some(tag)
    }

    /// Width of the fixed payload following the tag, or `None` for length-prefixed items.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::Null | Tag::Undefined | Tag::True | Tag::False | Tag::OptionNone => Some(0),
            Tag::U32 => Some(4),
            Tag::U64 | Tag::S64 | Tag::F64 => Some(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::OptionSome | Tag::Variant => None,
        }
    }
}

/// Kinds of open container on the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any number of items.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Key-value container; allows only variants.
    Map,
    /// `Some` payload; exactly one item.
    Option,
    /// Named payload; exactly one item after the name.
    Variant,
}

impl Scope {
    fn holds_exactly_one(self) -> bool {
        matches!(self, Scope::Option | Scope::Variant)
    }
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A scope-checked encoder.
///
/// Container lengths are written as placeholders and patched when the scope
/// closes. Every write is validated against the innermost open scope:
///
/// 1. Map scopes accept only variants.
/// 2. Option and variant scopes accept exactly one item.
/// 3. Bytes can only be taken out once the stack is back at the root.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Consumes the encoder and returns the encoded bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.top();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            scope if frame.count >= 1 => Err(Error::TooManyItems(scope)),
            _ => Ok(()),
        }
    }

    fn scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.top().count += 1;
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.top().count += 1;
        Ok(())
    }

    fn begin(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let frame = self.top();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if frame.scope.holds_exactly_one() && frame.count == 0 {
            return Err(Error::EmptyScope(frame.scope));
        }

        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        let body_len = self.buf.len() - frame.start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[frame.start - 4..frame.start].copy_from_slice(&len.to_le_bytes());
        self.top().count += 1;
        Ok(())
    }

    /// Encodes `null`.
    pub fn null(&mut self) -> Result<()> { self.scalar(Tag::Null, &[]) }
    /// Encodes `undefined`.
    pub fn undefined(&mut self) -> Result<()> { self.scalar(Tag::Undefined, &[]) }
    /// Encodes a boolean.
    pub fn bool(&mut self, v: bool) -> Result<()> { self.scalar(if v { Tag::True } else { Tag::False }, &[]) }
    /// Encodes an unsigned 32-bit integer.
    pub fn u32(&mut self, v: u32) -> Result<()> { self.scalar(Tag::U32, &v.to_le_bytes()) }
    /// Encodes an unsigned 64-bit integer.
    pub fn u64(&mut self, v: u64) -> Result<()> { self.scalar(Tag::U64, &v.to_le_bytes()) }
    /// Encodes a signed 64-bit integer.
    pub fn s64(&mut self, v: i64) -> Result<()> { self.scalar(Tag::S64, &v.to_le_bytes()) }
    /// Encodes a 64-bit float.
    pub fn f64(&mut self, v: f64) -> Result<()> { self.scalar(Tag::F64, &v.to_le_bytes()) }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> { self.blob(Tag::String, v.as_bytes()) }
    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.blob(Tag::Bytes, v) }

    /// Begins a list. Close with `list_end()`.
    pub fn list_begin(&mut self) -> Result<()> { self.begin(Tag::List, Scope::List) }
    /// Ends a list.
    pub fn list_end(&mut self) -> Result<()> { self.end(Scope::List) }

    /// Begins a map. Only `variant_begin()` is allowed directly inside.
    pub fn map_begin(&mut self) -> Result<()> { self.begin(Tag::Map, Scope::Map) }
    /// Ends a map.
    pub fn map_end(&mut self) -> Result<()> { self.end(Scope::Map) }

    /// Encodes an absent optional value.
    pub fn option_none(&mut self) -> Result<()> { self.scalar(Tag::OptionNone, &[]) }
    /// Begins a present optional value. Exactly one item must follow.
    pub fn option_some_begin(&mut self) -> Result<()> { self.begin(Tag::OptionSome, Scope::Option) }
    /// Ends a present optional value.
    pub fn option_some_end(&mut self) -> Result<()> { self.end(Scope::Option) }

    /// Begins a named payload. Exactly one item must follow.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // The name is metadata; the payload slot is still empty.
        self.top().count = 0;
        Ok(())
    }
    /// Ends a named payload.
    pub fn variant_end(&mut self) -> Result<()> { self.end(Scope::Variant) }
}

/// A zero-copy, bounds-checked reader over a byte slice.
///
/// Reading advances the view. Container reads return new decoders restricted
/// to the container body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` once every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fails with `TrailingBytes` unless the view is fully consumed.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() { Ok(()) } else { Err(Error::TrailingBytes(self.buf.len())) }
    }

    /// Peeks the next tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?.try_into().map_err(|_| Error::UnexpectedEnd)
    }

    fn take_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn expect(&mut self, tag: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != tag {
            return Err(Error::InvalidTag(found as u8));
        }
        self.take(1)?;
        Ok(())
    }

    fn enter(&mut self, tag: Tag) -> Result<Decoder<'a>> {
        self.expect(tag)?;
        let len = self.take_len()?;
        Ok(Decoder::new(self.take(len)?))
    }

    /// Skips the next item, including any nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        match tag.fixed_width() {
            Some(width) => { self.take(width)?; }
            None => {
                let len = self.take_len()?;
                self.take(len)?;
            }
        }
        Ok(())
    }

    /// Decodes `null`.
    pub fn null(&mut self) -> Result<()> { self.expect(Tag::Null) }
    /// Decodes `undefined`.
    pub fn undefined(&mut self) -> Result<()> { self.expect(Tag::Undefined) }

    /// Decodes a boolean.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::True => { self.take(1)?; Ok(true) }
            Tag::False => { self.take(1)?; Ok(false) }
            other => Err(Error::InvalidTag(other as u8)),
        }
    }

    /// Decodes an unsigned 32-bit integer.
    pub fn u32(&mut self) -> Result<u32> { self.expect(Tag::U32)?; Ok(u32::from_le_bytes(self.take_array()?)) }
    /// Decodes an unsigned 64-bit integer.
    pub fn u64(&mut self) -> Result<u64> { self.expect(Tag::U64)?; Ok(u64::from_le_bytes(self.take_array()?)) }
    /// Decodes a signed 64-bit integer.
    pub fn s64(&mut self) -> Result<i64> { self.expect(Tag::S64)?; Ok(i64::from_le_bytes(self.take_array()?)) }
    /// Decodes a 64-bit float.
    pub fn f64(&mut self) -> Result<f64> { self.expect(Tag::F64)?; Ok(f64::from_le_bytes(self.take_array()?)) }

    /// Decodes a UTF-8 string slice.
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect(Tag::String)?;
        let len = self.take_len()?;
        std::str::from_utf8(self.take(len)?).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect(Tag::Bytes)?;
        let len = self.take_len()?;
        self.take(len)
    }

    /// Enters a list.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    /// Enters a map.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter(Tag::Map)? })
    }

    /// Decodes an optional value, returning a decoder over the payload if present.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => { self.take(1)?; Ok(None) }
            Tag::OptionSome => Ok(Some(self.enter(Tag::OptionSome)?)),
            other => Err(Error::InvalidTag(other as u8)),
        }
    }

    /// Decodes a named payload as `(name, payload decoder)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Iterator over the items of a list, one sub-decoder per item.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns the next item, failing with `UnexpectedEnd` if the list is exhausted.
    pub fn expect_next(&mut self) -> Result<Decoder<'a>> {
        self.next().unwrap_or(Err(Error::UnexpectedEnd))
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = Result<Decoder<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dec.is_empty() {
            return None;
        }
        let mut lookahead = self.dec.clone();
        if let Err(e) = lookahead.skip() {
            // Poison the iterator so a malformed list ends here.
            self.dec = Decoder::new(&[]);
            return Some(Err(e));
        }
        let len = self.dec.remaining() - lookahead.remaining();
        Some(self.dec.take(len).map(Decoder::new))
    }
}

/// Iterator over the `(key, value decoder)` entries of a map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> Iterator for MapIter<'a> {
    type Item = Result<(&'a str, Decoder<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dec.is_empty() {
            return None;
        }
        let entry = self.dec.variant();
        if entry.is_err() {
            self.dec = Decoder::new(&[]);
        }
        Some(entry)
    }
}
