use core::fmt;

/// Lowercase, zero-padded hex rendering of a byte slice, used for registry
/// fingerprints in diagnostics.
pub struct HexSlice<'a>(&'a [u8]);

impl<'a> HexSlice<'a> {
    fn new<T>(data: &'a T) -> HexSlice<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexSlice(data.as_ref())
    }

    /// Only the first `n` bytes, enough to tell fingerprints apart in logs.
    pub fn short(&self, n: usize) -> HexSlice<'a> {
        HexSlice(&self.0[..n.min(self.0.len())])
    }
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    fn hex(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_every_byte() {
        assert_eq!([0x0a_u8, 0xff, 0x00].hex().to_string(), "0aff00");
    }

    #[test]
    fn short_prefix() {
        let bytes = [1u8, 2, 3, 4];
        assert_eq!(bytes.hex().short(2).to_string(), "0102");
        assert_eq!(bytes.hex().short(10).to_string(), "01020304");
    }
}
