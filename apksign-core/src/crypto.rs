//! Component A: hash & crypto primitives.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rasn_pkix::Certificate;
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    sha2::{Digest, Sha256},
    Pkcs1v15Sign, RsaPrivateKey,
};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Streams `reader` to EOF in bounded chunks, never materializing the whole
/// input, and returns its SHA-256 digest.
pub fn sha256_of_stream(mut reader: impl Read) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// SHA-256 of an in-memory byte slice.
pub fn sha256_of_bytes(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Base64-encodes a digest the way `MANIFEST.MF`/`*.SF` entries expect.
pub fn base64_digest(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// RSA-PKCS#1-v1.5-SHA256 signs `data` (not its digest — the digest is
/// computed internally), matching the v1 and v2 signing requirements.
pub fn rsa_sign_sha256(priv_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let digest = Sha256::digest(data);
    priv_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .context("RSA signing failed")
}

/// Parses a combined PEM blob for exactly one `CERTIFICATE` section and one
/// RSA private key section (`RSA PRIVATE KEY`, PKCS#1, or `PRIVATE KEY`,
/// PKCS#8), in either order, tolerating surrounding whitespace. Returns the
/// parsed certificate, its DER bytes, and the private key.
pub fn load_certificate(pem_data: &[u8]) -> Result<(Certificate, Vec<u8>, RsaPrivateKey)> {
    let sections = pem::parse_many(pem_data).context("Invalid PEM data")?;

    let mut cert = None;
    let mut cert_der = None;
    let mut priv_key = None;

    for section in &sections {
        match section.tag() {
            "CERTIFICATE" => {
                cert_der = Some(section.contents().to_vec());
                cert = Some(
                    rasn::der::decode::<Certificate>(section.contents())
                        .map_err(|err| anyhow!("Invalid certificate: {err}"))?,
                );
            }
            "RSA PRIVATE KEY" => {
                priv_key = Some(
                    RsaPrivateKey::from_pkcs1_der(section.contents())
                        .context("Invalid PKCS#1 private key")?,
                );
            }
            "PRIVATE KEY" => {
                priv_key = Some(
                    RsaPrivateKey::from_pkcs8_der(section.contents())
                        .context("Invalid PKCS#8 private key")?,
                );
            }
            _ => {}
        }
    }

    match (cert, cert_der, priv_key) {
        (Some(cert), Some(cert_der), Some(priv_key)) => Ok((cert, cert_der, priv_key)),
        _ => Err(anyhow!("PEM data must contain one CERTIFICATE and one private key section")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_digest_matches_known_vector() {
        let digest = sha256_of_bytes(b"hello\n");
        assert_eq!(base64_digest(&digest), "WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=");
    }

    #[test]
    fn load_certificate_rejects_missing_key() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(load_certificate(pem.as_bytes()).is_err());
    }
}
