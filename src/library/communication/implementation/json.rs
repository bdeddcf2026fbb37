//! Serialization and deserialization provided by [`serde_json`] using marker traits
//!
//! Broker implementations only hand out raw bytes. By implementing the marker traits in this module they
//! receive default implementations of the higher-level traits which translate between the serialized
//! payload and strongly typed data using [`serde_json`]. Swapping the serialization format later on
//! only requires different marker traits.

use super::super::broker::{Delivery, Envelope, RawDelivery};
use crate::library::BoxedError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker trait providing a default [`Delivery`] implementation based on [`serde_json`]
pub trait JsonDelivery: RawDelivery {}

impl<D> Delivery for D
where
    D: JsonDelivery,
{
    /// Parses the payload using [`serde_json::from_slice`]
    fn parse_payload<T>(&self) -> Result<T, BoxedError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.payload()).map_err(Into::into)
    }
}

/// Serializes a value using [`serde_json::to_vec`] and wraps it in an [`Envelope`] with a JSON content type
pub fn json_envelope<T: Serialize + ?Sized>(value: &T) -> Result<Envelope, BoxedError> {
    Ok(Envelope::json(serde_json::to_vec(value)?))
}
