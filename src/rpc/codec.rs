//! Pass-through gRPC codec for pre-serialized messages.
//!
//! Arguments are stored as wire bytes, so the invoker never needs the concrete
//! Rust type of a request. The codec writes those bytes unchanged and hands the
//! response body back as a byte container of the caller's choosing.

use std::any::{Any, type_name};
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Values the raw codec refuses to convert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("raw codec cannot marshal values of type `{type_name}`")]
    UnsupportedMarshal { type_name: &'static str },
    #[error("raw codec cannot unmarshal into values of type `{type_name}`")]
    UnsupportedUnmarshal { type_name: &'static str },
}

/// One encoded protobuf message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame(pub Bytes);

/// Convert a byte or string value into a frame.
pub fn marshal<T: Any>(value: &T) -> Result<RawFrame, CodecError> {
    let value = value as &dyn Any;
    if let Some(bytes) = value.downcast_ref::<Vec<u8>>() {
        return Ok(RawFrame(Bytes::copy_from_slice(bytes)));
    }
    if let Some(bytes) = value.downcast_ref::<Bytes>() {
        return Ok(RawFrame(bytes.clone()));
    }
    if let Some(text) = value.downcast_ref::<String>() {
        return Ok(RawFrame(Bytes::copy_from_slice(text.as_bytes())));
    }
    if let Some(text) = value.downcast_ref::<&'static str>() {
        return Ok(RawFrame(Bytes::from_static(text.as_bytes())));
    }
    Err(CodecError::UnsupportedMarshal {
        type_name: type_name::<T>(),
    })
}

/// Copy a frame into a byte container.
pub fn unmarshal_into<T: Any>(frame: &RawFrame, target: &mut T) -> Result<(), CodecError> {
    let target = target as &mut dyn Any;
    if let Some(bytes) = target.downcast_mut::<Vec<u8>>() {
        bytes.clear();
        bytes.extend_from_slice(&frame.0);
        return Ok(());
    }
    if let Some(bytes) = target.downcast_mut::<Bytes>() {
        *bytes = frame.0.clone();
        return Ok(());
    }
    Err(CodecError::UnsupportedUnmarshal {
        type_name: type_name::<T>(),
    })
}

/// Sends [`RawFrame`]s and reads responses back into `T`.
///
/// `T` must be one of the shapes [`unmarshal_into`] accepts; any other type
/// fails every response with an `INTERNAL` status naming it.
#[derive(Debug)]
pub struct RawCodec<T = Bytes>(PhantomData<fn() -> T>);

impl<T> Default for RawCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec for RawCodec<T>
where
    T: Any + Default + Send + 'static,
{
    type Encode = RawFrame;
    type Decode = T;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder<T>;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder(PhantomData)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = RawFrame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item.0);
        Ok(())
    }
}

#[derive(Debug)]
pub struct RawDecoder<T>(PhantomData<fn() -> T>);

impl<T> Decoder for RawDecoder<T>
where
    T: Any + Default + Send + 'static,
{
    type Item = T;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let frame = RawFrame(src.copy_to_bytes(src.remaining()));
        let mut item = T::default();
        unmarshal_into(&frame, &mut item).map_err(|err| Status::internal(err.to_string()))?;
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_accepts_byte_and_string_shapes() {
        assert_eq!(
            marshal(&vec![1u8, 2, 3]).expect("vec"),
            RawFrame(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(
            marshal(&Bytes::from_static(b"ab")).expect("bytes").0,
            Bytes::from_static(b"ab")
        );
        assert_eq!(
            marshal(&"hi".to_string()).expect("string").0,
            Bytes::from_static(b"hi")
        );
        assert_eq!(marshal(&"static").expect("str").0, Bytes::from_static(b"static"));
    }

    #[test]
    fn marshal_rejects_other_shapes_with_type_name() {
        let err = marshal(&42u64).expect_err("u64 is not bytes");
        assert_eq!(err, CodecError::UnsupportedMarshal { type_name: "u64" });
        assert!(err.to_string().contains("u64"));
    }

    #[test]
    fn unmarshal_fills_byte_containers_only() {
        let frame = RawFrame(Bytes::from_static(b"payload"));

        let mut buf = vec![9u8; 3];
        unmarshal_into(&frame, &mut buf).expect("vec");
        assert_eq!(buf, b"payload");

        let mut bytes = Bytes::new();
        unmarshal_into(&frame, &mut bytes).expect("bytes");
        assert_eq!(bytes, Bytes::from_static(b"payload"));

        let mut text = String::new();
        let err = unmarshal_into(&frame, &mut text).expect_err("string target");
        assert!(matches!(err, CodecError::UnsupportedUnmarshal { .. }));
    }
}
