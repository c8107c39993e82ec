//! Credential pair and the handshake frame codec.
//!
//! The login frame is the one message on the socket without a type
//! discriminator: it is distinguished by being the first frame after
//! connect. `|u32 usernameLen| |utf8| |u32 passwordLen| |utf8|`.

use crate::codec::{read_string, write_string, DecodeError, DecodeResult};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LoginData {
    pub username: String,
    pub password: String,
}

impl LoginData {
    #[inline]
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> LoginData {
        LoginData {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Passwords stay out of log output.
impl fmt::Debug for LoginData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoginData")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Serializes the credential pair as the handshake payload.
pub fn encode_login(login: &LoginData) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + login.username.len() + login.password.len());
    write_string(&login.username, &mut payload).expect("infallible write into Vec");
    write_string(&login.password, &mut payload).expect("infallible write into Vec");
    payload
}

/// Parses a handshake payload. Rejects trailing bytes: the first frame must
/// be exactly a credential pair.
pub fn decode_login(payload: &[u8]) -> DecodeResult<LoginData> {
    let mut cursor = Cursor::new(payload);
    let username = read_string(&mut cursor)?;
    let password = read_string(&mut cursor)?;
    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(DecodeError::TrailingBytes(payload.len() - consumed));
    }
    Ok(LoginData { username, password })
}
