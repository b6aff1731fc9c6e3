//! Authentication strategies for the startup phase.
//!
//! The server picks the method and announces it with a method code; each
//! supported method implements the same challenge/response shape: produce a
//! response for the current challenge, repeat until `AuthenticationOk`.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::{borrow::Cow, fmt};

/// MD5 password response.
///
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex(hasher.finalize().as_slice());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(hasher.finalize().as_slice()))
}

fn hex(digest: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(digest.len() * 2);
    for &b in digest {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

/// SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677).
///
/// Channel binding is not supported, the gs2 header is always `n,,`.
pub(crate) struct ScramSha256 {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<[u8; 32]>,
}

impl ScramSha256 {
    pub const MECHANISM: &'static str = "SCRAM-SHA-256";

    pub fn new(user: &str, password: &str) -> Self {
        use rand::Rng;
        let nonce = rand::rng()
            .sample_iter(&rand::distr::Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(user, password, nonce)
    }

    fn with_nonce(user: &str, password: &str, client_nonce: String) -> Self {
        // RFC 5802: escape '=' as '=3D' and ',' as '=2C' in the username.
        // The server authenticates the user from the startup message and
        // ignores this field, but it still participates in the auth message.
        let user = user.replace('=', "=3D").replace(',', "=2C");
        let client_first_bare = format!("n={user},r={client_nonce}");
        Self {
            password: password.into(),
            client_nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    /// The client-first message, the body of `SASLInitialResponse`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Process the server-first challenge and produce the client-final
    /// message, the body of `SASLResponse`.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, AuthError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| AuthError::failed("server challenge is not utf8"))?;

        // server-first-message: r=<nonce>,s=<salt>,i=<iterations>
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                server_nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|_| AuthError::failed("invalid salt"))?);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(v.parse().map_err(|_| AuthError::failed("invalid iteration count"))?);
            }
        }

        let server_nonce = server_nonce.ok_or(AuthError::failed("missing server nonce"))?;
        let salt = salt.ok_or(AuthError::failed("missing salt"))?;
        let iterations: u32 = iterations.ok_or(AuthError::failed("missing iteration count"))?;
        if iterations == 0 {
            return Err(AuthError::failed("invalid iteration count"));
        }

        // the full nonce must extend the one this client sent
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(AuthError::failed("server nonce mismatch"));
        }

        // SaltedPassword = PBKDF2-HMAC-SHA-256(password, salt, i)
        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        // "biws" is base64("n,,"), the gs2 header without channel binding
        let client_final_without_proof = format!("c=biws,r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof,
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify the server-final message proves the server knew the password.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), AuthError> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| AuthError::failed("server-final is not utf8"))?;
        let signature = server_final
            .strip_prefix("v=")
            .ok_or(AuthError::failed("malformed server-final"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| AuthError::failed("invalid server signature encoding"))?;

        let expected = self
            .server_signature
            .ok_or(AuthError::failed("server-final before challenge"))?;

        if signature != expected {
            return Err(AuthError::failed("server signature mismatch"));
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// An error in the authentication exchange.
pub enum AuthError {
    /// The server requires a method this client does not implement.
    Unsupported { method: &'static str },
    /// The challenge/response exchange failed.
    Failed { reason: Cow<'static, str> },
}

impl AuthError {
    pub(crate) fn unsupported(method: &'static str) -> Self {
        Self::Unsupported { method }
    }

    pub(crate) fn failed(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Failed { reason: reason.into() }
    }
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { method } => {
                write!(f, "authentication method {method} is not supported")
            },
            Self::Failed { reason } => write!(f, "authentication failed: {reason}"),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_response_shape() {
        let response = md5_password("user", "pencil", [1, 2, 3, 4]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        assert!(response[3..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    /// The SCRAM-SHA-256 example exchange from RFC 7677 §3.
    #[test]
    fn scram_rfc7677_vector() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());

        assert_eq!(scram.client_first(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first =
            b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = scram.client_final(server_first).unwrap();
        assert_eq!(
            client_final,
            b"c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=".to_vec(),
        );

        scram
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn scram_rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "clientnonce".into());
        let err = scram.client_final(b"r=evilnonce,s=AAAA,i=4096");
        assert!(err.is_err());
    }

    #[test]
    fn scram_rejects_bad_server_signature() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());
        let server_first =
            b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        scram.client_final(server_first).unwrap();
        assert!(scram.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
    }
}
