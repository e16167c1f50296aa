//! ISO-8583 field codec.
//!
//! Message layout (ASCII variant):
//!
//! ```text
//! MTI (4 digits) | primary bitmap (16 hex) | [secondary bitmap (16 hex)] | fields...
//! ```
//!
//! Bit 1 of the primary bitmap announces the secondary bitmap and is not a
//! field. Every other set bit must have a [`FieldFormat`] in the codec's
//! [`FieldSpec`]; fields are decoded in ascending order.

use bytes::{BufMut, Bytes, BytesMut};
use isoswitch_core::message::{FieldId, FieldMap, MTI_FIELD};

use crate::error::{CodecError, Result};

/// Highest field number a two-bitmap message can carry
pub const MAX_FIELD: FieldId = 128;

const MTI_LEN: usize = 4;
const BITMAP_HEX_LEN: usize = 16;

/// Turns frame payloads into field maps and back.
pub trait FieldCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<FieldMap>;
    fn encode(&self, fields: &FieldMap) -> Result<Bytes>;
}

/// Wire format of one data element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// Exactly `n` characters
    Fixed(usize),
    /// 2-digit length prefix, up to `max` characters
    LlVar(usize),
    /// 3-digit length prefix, up to `max` characters
    LllVar(usize),
}

impl FieldFormat {
    const fn prefix_len(self) -> usize {
        match self {
            Self::Fixed(_) => 0,
            Self::LlVar(_) => 2,
            Self::LllVar(_) => 3,
        }
    }
}

/// Field-number → format table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    formats: Vec<Option<FieldFormat>>,
}

impl FieldSpec {
    /// Empty table; every field is unknown.
    pub fn new() -> Self {
        Self {
            formats: vec![None; usize::from(MAX_FIELD) + 1],
        }
    }

    /// Define (or redefine) a field. Ids outside `2..=128` are ignored.
    #[must_use]
    pub fn with(mut self, id: FieldId, format: FieldFormat) -> Self {
        if (2..=MAX_FIELD).contains(&id) {
            self.formats[usize::from(id)] = Some(format);
        }
        self
    }

    #[inline]
    pub fn get(&self, id: FieldId) -> Option<FieldFormat> {
        self.formats.get(usize::from(id)).copied().flatten()
    }

    /// Common financial subset.
    pub fn standard() -> Self {
        use FieldFormat::{Fixed, LlVar};
        Self::new()
            .with(2, LlVar(19)) // primary account number
            .with(3, Fixed(6)) // processing code
            .with(4, Fixed(12)) // amount
            .with(7, Fixed(10)) // transmission date/time
            .with(11, Fixed(6)) // STAN
            .with(12, Fixed(6)) // local time
            .with(13, Fixed(4)) // local date
            .with(32, LlVar(11)) // acquiring institution
            .with(37, Fixed(12)) // retrieval reference number
            .with(38, Fixed(6)) // authorization id
            .with(39, Fixed(2)) // response code
            .with(41, Fixed(8)) // terminal id
            .with(42, Fixed(15)) // merchant id
            .with(49, Fixed(3)) // currency
            .with(70, Fixed(3)) // network management code
            .with(90, Fixed(42)) // original data elements
            .with(102, LlVar(28))
            .with(103, LlVar(28))
            .with(128, Fixed(16)) // MAC
    }
}

impl Default for FieldSpec {
    fn default() -> Self {
        Self::standard()
    }
}

/// Reference ASCII ISO-8583 codec with hex bitmaps.
#[derive(Debug, Clone, Default)]
pub struct Iso8583Codec {
    spec: FieldSpec,
}

impl Iso8583Codec {
    pub fn new(spec: FieldSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, field: FieldId) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated(field))?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated(field))?;
        self.pos = end;
        Ok(slice)
    }

    fn take_ascii(&mut self, n: usize, field: FieldId) -> Result<&'a str> {
        let bytes = self.take(n, field)?;
        if !bytes.is_ascii() {
            return Err(CodecError::NotAscii(field));
        }
        std::str::from_utf8(bytes).map_err(|_| CodecError::NotAscii(field))
    }

    fn take_bitmap(&mut self) -> Result<u64> {
        let text = self.take(BITMAP_HEX_LEN, 1).map_err(|_| CodecError::InvalidBitmap)?;
        let mut raw = [0u8; 8];
        hex::decode_to_slice(text, &mut raw).map_err(|_| CodecError::InvalidBitmap)?;
        Ok(u64::from_be_bytes(raw))
    }
}

// Bit n (1-based, MSB first) of a 64-bit bitmap.
#[inline]
const fn bit(n: u32) -> u64 {
    1u64 << (64 - n)
}

impl FieldCodec for Iso8583Codec {
    fn decode(&self, payload: &[u8]) -> Result<FieldMap> {
        let mut cur = Cursor { buf: payload, pos: 0 };
        let mti = cur.take(MTI_LEN, MTI_FIELD).map_err(|_| CodecError::InvalidMti)?;
        if !mti.iter().all(u8::is_ascii_digit) {
            return Err(CodecError::InvalidMti);
        }

        let primary = cur.take_bitmap()?;
        let secondary = if primary & bit(1) != 0 {
            cur.take_bitmap()?
        } else {
            0
        };

        let mut fields = FieldMap::new();
        // MTI checked as ASCII digits above
        fields.insert(MTI_FIELD, String::from_utf8_lossy(mti).into_owned());

        for id in 2..=MAX_FIELD {
            let present = if id <= 64 {
                primary & bit(u32::from(id)) != 0
            } else {
                secondary & bit(u32::from(id - 64)) != 0
            };
            if !present {
                continue;
            }

            let format = self.spec.get(id).ok_or(CodecError::UnknownField(id))?;
            let len = match format {
                FieldFormat::Fixed(n) => n,
                FieldFormat::LlVar(max) | FieldFormat::LllVar(max) => {
                    let digits = cur.take_ascii(format.prefix_len(), id)?;
                    let len: usize = digits
                        .parse()
                        .map_err(|_| CodecError::FieldLength { field: id, len: 0 })?;
                    if len > max {
                        return Err(CodecError::FieldLength { field: id, len });
                    }
                    len
                }
            };
            let value = cur.take_ascii(len, id)?;
            fields.insert(id, value);
        }

        Ok(fields)
    }

    fn encode(&self, fields: &FieldMap) -> Result<Bytes> {
        let mti = fields.get(MTI_FIELD).ok_or(CodecError::MissingMti)?;
        if mti.len() != MTI_LEN || !mti.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::InvalidMti);
        }

        let ids: Vec<FieldId> = fields.ids().into_iter().filter(|&id| id != MTI_FIELD).collect();
        let mut primary = 0u64;
        let mut secondary = 0u64;
        for &id in &ids {
            match id {
                2..=64 => primary |= bit(u32::from(id)),
                65..=MAX_FIELD => secondary |= bit(u32::from(id - 64)),
                _ => return Err(CodecError::UnknownField(id)),
            }
        }
        if secondary != 0 {
            primary |= bit(1);
        }

        let mut out = BytesMut::with_capacity(64);
        out.put_slice(mti.as_bytes());
        out.put_slice(hex::encode_upper(primary.to_be_bytes()).as_bytes());
        if secondary != 0 {
            out.put_slice(hex::encode_upper(secondary.to_be_bytes()).as_bytes());
        }

        for id in ids {
            let format = self.spec.get(id).ok_or(CodecError::UnknownField(id))?;
            let value = fields.get(id).unwrap_or_default();
            if !value.is_ascii() {
                return Err(CodecError::NotAscii(id));
            }
            let len = value.len();
            match format {
                FieldFormat::Fixed(n) if len != n => {
                    return Err(CodecError::FieldLength { field: id, len });
                }
                FieldFormat::Fixed(_) => {}
                FieldFormat::LlVar(max) => {
                    if len > max.min(99) {
                        return Err(CodecError::FieldLength { field: id, len });
                    }
                    out.put_slice(format!("{len:02}").as_bytes());
                }
                FieldFormat::LllVar(max) => {
                    if len > max.min(999) {
                        return Err(CodecError::FieldLength { field: id, len });
                    }
                    out.put_slice(format!("{len:03}").as_bytes());
                }
            }
            out.put_slice(value.as_bytes());
        }

        Ok(out.freeze())
    }
}
