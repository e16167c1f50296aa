//! Codec pair used on every connection.

use bytes::{Bytes, BytesMut};
use isoswitch_core::error::Result;
use isoswitch_core::message::FieldMap;
use isoswitch_core::options::GatewayOptions;
use isoswitch_iso8583::{FieldCodec, FrameCodec, Iso8583Codec, LengthHeader, LengthPrefixFramer};
use std::sync::Arc;

/// Framing plus field codec, shared by all connections.
#[derive(Clone)]
pub struct Wire {
    framer: Arc<dyn FrameCodec>,
    fields: Arc<dyn FieldCodec>,
}

impl Wire {
    pub fn new(framer: Arc<dyn FrameCodec>, fields: Arc<dyn FieldCodec>) -> Self {
        Self { framer, fields }
    }

    /// Binary 2-byte length header and the standard field table.
    pub fn standard(options: &GatewayOptions) -> Self {
        Self::new(
            Arc::new(LengthPrefixFramer::new(LengthHeader::Binary2, options.max_frame_size)),
            Arc::new(Iso8583Codec::default()),
        )
    }

    /// Take one frame payload off the front of `src`.
    #[inline]
    pub fn next_frame(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        Ok(self.framer.decode(src)?)
    }

    /// Frame a payload for writing.
    pub fn frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = BytesMut::with_capacity(payload.len() + 4);
        self.framer.encode(payload, &mut out)?;
        Ok(out.to_vec())
    }

    #[inline]
    pub fn decode_fields(&self, payload: &[u8]) -> Result<FieldMap> {
        Ok(self.fields.decode(payload)?)
    }

    pub fn encode_fields(&self, fields: &FieldMap) -> Result<Bytes> {
        Ok(self.fields.encode(fields)?)
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire").finish_non_exhaustive()
    }
}
