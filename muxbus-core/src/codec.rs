use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::status::{Result, Status};

/// A message serializer/deserializer pair for one side of a call.
///
/// The framework never inspects payload bytes; the concrete format is
/// chosen by whoever registers the method or builds the call. Decode
/// failures are INVALID_ARGUMENT (the peer sent something unreadable),
/// encode failures are INTERNAL (our own value failed to serialise).
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + Sync + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Bytes>;
    fn decode(&self, bytes: Bytes) -> Result<Self::Message>;
}

/// JSON codec over any serde type.
///
/// Dynamic payloads (the source's primitive wrapper envelopes) are just
/// `JsonCodec<serde_json::Value>`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> JsonCodec<T> {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        JsonCodec::new()
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Bytes> {
        let vec = serde_json::to_vec(message)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))?;
        Ok(Bytes::from(vec))
    }

    fn decode(&self, bytes: Bytes) -> Result<T> {
        serde_json::from_slice(&bytes)
            .map_err(|e| Status::invalid_argument(format!("failed to decode message: {e}")))
    }
}

/// UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl MessageCodec for Utf8Codec {
    type Message = String;

    fn encode(&self, message: &String) -> Result<Bytes> {
        Ok(Bytes::from(message.clone().into_bytes()))
    }

    fn decode(&self, bytes: Bytes) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Status::invalid_argument("payload is not valid UTF-8"))
    }
}

/// Identity codec for opaque byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl MessageCodec for BytesCodec {
    type Message = Bytes;

    fn encode(&self, message: &Bytes) -> Result<Bytes> {
        Ok(message.clone())
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            nonce: u64,
        }

        let codec = JsonCodec::<Ping>::new();
        let bytes = codec.encode(&Ping { nonce: 42 }).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), Ping { nonce: 42 });
    }

    #[test]
    fn json_decode_failure_is_invalid_argument() {
        let codec = JsonCodec::<u32>::new();
        let err = codec.decode(Bytes::from_static(b"not json")).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::InvalidArgument);
    }

    #[test]
    fn dynamic_value_round_trip() {
        let codec = JsonCodec::<serde_json::Value>::new();
        let value = serde_json::json!({"v": {"nested": [1, "two", null, true]}});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), value);
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        let err = Utf8Codec.decode(Bytes::from_static(&[0xff, 0xfe])).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::InvalidArgument);
    }

    #[test]
    fn bytes_codec_is_identity() {
        let payload = Bytes::from_static(b"\x00\x01\x02");
        assert_eq!(BytesCodec.encode(&payload).unwrap(), payload);
        assert_eq!(BytesCodec.decode(payload.clone()).unwrap(), payload);
    }
}
