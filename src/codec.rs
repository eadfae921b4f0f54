//! Value codecs for the child result channel.
//!
//! A [`Codec`] turns a work function's return value into the byte payload
//! of a frame and back. [`JsonCodec`] is the default implementation.
//! [`TaggedCodec`] layers per-type freeze/thaw hooks on top of any inner
//! codec: a claimed value travels as `<TAG>!::!<BODY>`, and an empty tag
//! selects the inner codec on decode.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Separator between the codec tag and the payload body.
pub const TAG_SEPARATOR: &[u8] = b"!::!";

/// Errors raised while encoding or decoding a child value.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value cannot be represented by this codec.
    #[error("unserializable value: {0}")]
    Unsupported(String),

    #[error("failed to decode child payload: {0}")]
    Decode(String),

    #[error("unknown codec tag {0:?}")]
    UnknownTag(String),

    #[error("payload is missing the codec tag separator")]
    MissingSeparator,
}

/// Capability contract for moving one value across the pipe.
///
/// `decode` must be the inverse of `encode` for every representable value.
pub trait Codec {
    type Value: Clone + 'static;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, CodecError>;
}

/// Default codec: JSON via serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Unsupported(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

type FreezeFn<T> = Box<dyn Fn(&T) -> Option<Vec<u8>>>;
type ThawFn<T> = Box<dyn Fn(&[u8]) -> Result<T, CodecError>>;

struct Hook<T> {
    tag: String,
    freeze: FreezeFn<T>,
    thaw: ThawFn<T>,
}

/// A codec with per-type freeze/thaw hooks.
///
/// On encode, the first hook whose `freeze` claims the value wins and the
/// payload becomes `<TAG>!::!<BODY>`. Unclaimed values fall through to the
/// inner codec under an empty tag. On decode, the tag selects the hook.
pub struct TaggedCodec<C: Codec> {
    inner: C,
    hooks: Vec<Hook<C::Value>>,
}

impl<C: Codec> TaggedCodec<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            hooks: Vec::new(),
        }
    }

    /// Register a freeze/thaw hook under `tag`.
    ///
    /// `freeze` returns `None` for values it does not claim. `thaw` must
    /// invert `freeze` for every claimed value.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is empty or contains the tag separator.
    pub fn with_hook<F, G>(mut self, tag: &str, freeze: F, thaw: G) -> Self
    where
        F: Fn(&C::Value) -> Option<Vec<u8>> + 'static,
        G: Fn(&[u8]) -> Result<C::Value, CodecError> + 'static,
    {
        assert!(!tag.is_empty(), "codec tag must not be empty");
        assert!(
            !tag.as_bytes()
                .windows(TAG_SEPARATOR.len())
                .any(|w| w == TAG_SEPARATOR),
            "codec tag must not contain the tag separator"
        );
        self.hooks.push(Hook {
            tag: tag.to_string(),
            freeze: Box::new(freeze),
            thaw: Box::new(thaw),
        });
        self
    }
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(TAG_SEPARATOR.len())
        .position(|w| w == TAG_SEPARATOR)
}

impl<C: Codec> Codec for TaggedCodec<C> {
    type Value = C::Value;

    fn encode(&self, value: &C::Value) -> Result<Vec<u8>, CodecError> {
        for hook in &self.hooks {
            if let Some(body) = (hook.freeze)(value) {
                let mut out = Vec::with_capacity(hook.tag.len() + TAG_SEPARATOR.len() + body.len());
                out.extend_from_slice(hook.tag.as_bytes());
                out.extend_from_slice(TAG_SEPARATOR);
                out.extend_from_slice(&body);
                return Ok(out);
            }
        }
        let body = self.inner.encode(value)?;
        let mut out = Vec::with_capacity(TAG_SEPARATOR.len() + body.len());
        out.extend_from_slice(TAG_SEPARATOR);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<C::Value, CodecError> {
        let at = find_separator(bytes).ok_or(CodecError::MissingSeparator)?;
        let (tag, body) = (&bytes[..at], &bytes[at + TAG_SEPARATOR.len()..]);
        if tag.is_empty() {
            return self.inner.decode(body);
        }
        let tag = String::from_utf8_lossy(tag);
        match self.hooks.iter().find(|hook| hook.tag == tag) {
            Some(hook) => (hook.thaw)(body),
            None => Err(CodecError::UnknownTag(tag.into_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec::<serde_json::Value>::new();
        let value = serde_json::json!({"answer": 42, "items": [1, 2, 3]});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_tagged_default_path_uses_empty_tag() {
        let codec = TaggedCodec::new(JsonCodec::<serde_json::Value>::new());
        let value = serde_json::json!("plain");
        let bytes = codec.encode(&value).unwrap();
        assert!(bytes.starts_with(TAG_SEPARATOR));
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_tagged_hook_roundtrip() {
        let codec = TaggedCodec::new(JsonCodec::<serde_json::Value>::new()).with_hook(
            "upper",
            |value| {
                value
                    .as_str()
                    .filter(|s| s.starts_with("special:"))
                    .map(|s| s.to_uppercase().into_bytes())
            },
            |body| {
                Ok(serde_json::Value::String(
                    String::from_utf8_lossy(body).into_owned(),
                ))
            },
        );

        let claimed = serde_json::json!("special:payload");
        let bytes = codec.encode(&claimed).unwrap();
        assert!(bytes.starts_with(b"upper!::!"));
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            serde_json::json!("SPECIAL:PAYLOAD")
        );

        let unclaimed = serde_json::json!("ordinary");
        let bytes = codec.encode(&unclaimed).unwrap();
        assert!(bytes.starts_with(TAG_SEPARATOR));
        assert_eq!(codec.decode(&bytes).unwrap(), unclaimed);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let codec = TaggedCodec::new(JsonCodec::<serde_json::Value>::new());
        let err = codec.decode(b"mystery!::!{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(tag) if tag == "mystery"));
    }

    #[test]
    fn test_missing_separator_is_rejected() {
        let codec = TaggedCodec::new(JsonCodec::<serde_json::Value>::new());
        let err = codec.decode(b"no separator here").unwrap_err();
        assert!(matches!(err, CodecError::MissingSeparator));
    }

    #[test]
    #[should_panic(expected = "codec tag must not contain the tag separator")]
    fn test_tag_containing_separator_panics() {
        let _ = TaggedCodec::new(JsonCodec::<serde_json::Value>::new()).with_hook(
            "bad!::!tag",
            |_| None,
            |_| Err(CodecError::MissingSeparator),
        );
    }
}
