use core::fmt;

/// Abbreviated hex rendering for identifiers in log output. Only the first
/// few bytes are shown, which is enough to tell peers apart in a trace.
pub struct ShortHex<'a>(&'a [u8]);

const SHOWN_BYTES: usize = 6;

impl fmt::Display for ShortHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(SHOWN_BYTES) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > SHOWN_BYTES {
            write!(f, "..")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ShortHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait ShortHexExt {
    fn short_hex(&self) -> ShortHex<'_>;
}

impl<T> ShortHexExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn short_hex(&self) -> ShortHex<'_> {
        ShortHex(self.as_ref())
    }
}
