use std::any::type_name;

use rkyv::{
    de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator, AlignedVec, Archive, CheckBytes,
    Deserialize, Serialize,
};

use crate::error::Error;

/// Anything that can travel inside a message or an element snapshot.
///
/// Implemented for every rkyv type whose archive can be validated, so
/// payloads only need `#[derive(Archive, Serialize, Deserialize)]` with
/// `#[archive(check_bytes)]`.
pub trait Payload: Sized + Send + 'static {
    fn pack(&self) -> Result<Vec<u8>, Error>;
    fn unpack(bytes: &[u8]) -> Result<Self, Error>;
}

impl<T> Payload for T
where
    T: Archive + Serialize<AllocSerializer<256>> + Send + 'static,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    fn pack(&self) -> Result<Vec<u8>, Error> {
        let bytes = rkyv::to_bytes::<_, 256>(self)
            .map_err(|_| Error::Serialize(type_name::<T>()))?;
        Ok(bytes.as_slice().to_vec())
    }

    fn unpack(bytes: &[u8]) -> Result<Self, Error> {
        // archives are read in place, so they need the alignment rkyv wrote
        // them with; payloads sliced out of an envelope don't have it
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<T>(&aligned)
            .map_err(|_| Error::Deserialize(type_name::<T>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Archive, Serialize, Deserialize, Debug, PartialEq)]
    #[archive(check_bytes)]
    struct Ghost {
        iteration: u64,
        values: Vec<f64>,
    }

    #[test]
    fn struct_survives_packing() {
        let ghost = Ghost {
            iteration: 3,
            values: vec![0.5, 1.5],
        };
        let bytes = ghost.pack().unwrap();
        assert_eq!(Ghost::unpack(&bytes).unwrap(), ghost);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Ghost::unpack(&[1, 2, 3]),
            Err(Error::Deserialize(_))
        ));
    }
}
