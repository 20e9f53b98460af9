//! Signing with private keys held in this process.
//!
//! `ssh_key::PrivateKey::try_sign` fails for every RSA key in the 0.6
//! series: its conversion to `rsa::RsaPrivateKey` passes `p` twice as the
//! primes.  RSA keys are therefore rebuilt here from their components and
//! signed as `rsa-sha2-512`, which is what the SSH agent client requests.
//! Other key types go through `ssh-key` unchanged.

use rsa::BigUint;
use rsa::pkcs1v15::SigningKey;
use sha2::Sha512;
use signature::{SignatureEncoding as _, Signer as _};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, HashAlg, PrivateKey, Signature};

use crate::AuthError;

/// Sign `message` with `key`, as an SSH agent holding it would.
pub fn sign_with_key(key: &PrivateKey, message: &[u8]) -> Result<Signature, AuthError> {
    match key.key_data() {
        KeypairData::Rsa(keypair) => sign_rsa(keypair, message),
        _ => key
            .try_sign(message)
            .map_err(|e| AuthError::Agent(format!("signing failed: {e}"))),
    }
}

fn sign_rsa(keypair: &RsaKeypair, message: &[u8]) -> Result<Signature, AuthError> {
    let private = rsa::RsaPrivateKey::from_components(
        uint(keypair.public.n.as_positive_bytes(), "n")?,
        uint(keypair.public.e.as_positive_bytes(), "e")?,
        uint(keypair.private.d.as_positive_bytes(), "d")?,
        vec![
            uint(keypair.private.p.as_positive_bytes(), "p")?,
            uint(keypair.private.q.as_positive_bytes(), "q")?,
        ],
    )
    .map_err(|e| AuthError::Agent(format!("rsa key: {e}")))?;

    let sig = SigningKey::<Sha512>::new(private)
        .try_sign(message)
        .map_err(|e| AuthError::Agent(format!("rsa sign: {e}")))?;

    Signature::new(
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        },
        sig.to_vec(),
    )
    .map_err(|e| AuthError::Agent(format!("rsa signature: {e}")))
}

fn uint(bytes: Option<&[u8]>, component: &str) -> Result<BigUint, AuthError> {
    bytes
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| AuthError::Agent(format!("rsa key: component {component} is not positive")))
}
