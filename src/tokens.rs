//! One-time token generation for verification links.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};

/// Raw entropy per token: 256 bits.
pub const TOKEN_BYTES: usize = 32;

/// Create a new single-use token for confirmation, recovery, invite and email change links.
///
/// The value is drawn from the OS CSPRNG and encoded as unpadded base64url, so it
/// can be embedded in URLs and emails as-is.
///
/// # Errors
/// Returns an error only if the OS entropy source fails; callers must treat this
/// as fatal because no safe token can be issued.
pub fn generate_token() -> Result<String, rand::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}
