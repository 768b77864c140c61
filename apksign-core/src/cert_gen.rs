//! Component A: synthesizes a fresh self-signed RSA certificate, for callers
//! that don't supply their own PEM. Not used on the hot signing path.

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::{
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use time::{Duration, OffsetDateTime};

const RSA_KEY_BITS: usize = 2048;
const CERT_COMMON_NAME: &str = "Unknown";
const VALIDITY_BEFORE_DAYS: i64 = 365 * 10;
const VALIDITY_AFTER_DAYS: i64 = 365 * 50;

/// Generates a fresh RSA-2048 key pair and a self-signed X.509 certificate
/// (CN=Unknown, valid from 10 years ago to 50 years from now), PEM-encoding
/// both into a single combined blob that `load_certificate` can read back.
pub fn generate_new_certificate_pem() -> Result<String> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).context("Generating RSA private key")?;
    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("Encoding private key as PKCS#8 PEM")?
        .to_string();

    let key_pair = KeyPair::from_pem(&private_key_pem).context("Loading generated key pair")?;

    let mut params =
        CertificateParams::new(Vec::new()).context("Building certificate parameters")?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, CERT_COMMON_NAME);
    params.distinguished_name = distinguished_name;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(VALIDITY_BEFORE_DAYS);
    params.not_after = now + Duration::days(VALIDITY_AFTER_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .context("Self-signing certificate")?;

    Ok(format!("{}\n{}", cert.pem(), private_key_pem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::load_certificate;

    #[test]
    fn generated_pem_round_trips_through_loader() {
        let pem = generate_new_certificate_pem().unwrap();
        let (_cert, der, _key) = load_certificate(pem.as_bytes()).unwrap();
        assert!(!der.is_empty());
    }
}
