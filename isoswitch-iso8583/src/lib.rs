//! # Isoswitch ISO-8583
//!
//! Sans-IO wire layer for the isoswitch gateway:
//! - **Framing**: length-prefix frames with a 2-byte binary or 4-digit ASCII header
//! - **Fields**: reference ISO-8583 codec (ASCII MTI, hex bitmaps, fixed/LLVAR/LLLVAR fields)
//!
//! Both layers sit behind traits ([`FrameCodec`], [`FieldCodec`]) so links
//! with a different dialect can plug in their own implementation.
//!
//! ```rust
//! use bytes::BytesMut;
//! use isoswitch_iso8583::{FieldCodec, FrameCodec, Iso8583Codec, LengthPrefixFramer};
//! use isoswitch_core::message::{FieldMap, MTI_FIELD};
//!
//! let codec = Iso8583Codec::default();
//! let framer = LengthPrefixFramer::default();
//!
//! let fields = FieldMap::new().with(MTI_FIELD, "0800").with(11, "000001");
//! let mut wire = BytesMut::new();
//! framer.encode(&codec.encode(&fields).unwrap(), &mut wire).unwrap();
//!
//! let payload = framer.decode(&mut wire).unwrap().unwrap();
//! assert_eq!(codec.decode(&payload).unwrap(), fields);
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod fields;
pub mod framing;

pub use error::CodecError;
pub use fields::{FieldCodec, FieldFormat, FieldSpec, Iso8583Codec};
pub use framing::{FrameCodec, LengthHeader, LengthPrefixFramer};
