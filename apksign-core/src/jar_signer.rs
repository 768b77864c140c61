//! Component C: JAR (v1) signature scheme.
//!
//! Manifest/signature-file rendering follows the section-at-a-time approach
//! in the `google-pack` signer's `v1_signing` module (`create_manifest_entry`
//! reused unchanged for both the manifest and the signature file, so the
//! exact bytes hashed into `BS.SF` are the same bytes written into
//! `MANIFEST.MF`, with no re-slicing needed). The PKCS#7 `SignedData` block
//! is built the same way, via `rasn-cms`.

use std::{collections::HashMap, fs::File};

use anyhow::{anyhow, Context, Result};
use rasn::types::{Integer, Oid};
use rasn_cms::{
    algorithms::RSA, pkcs7_compat::EncapsulatedContentInfo, pkcs7_compat::SignedData,
    AlgorithmIdentifier, Certificate as CmsCertificate, CertificateChoices, ContentInfo,
    IssuerAndSerialNumber, SignerIdentifier, SignerInfo,
};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{base64_digest, sha256_of_bytes};
use crate::zip::ZipFile;

pub(crate) const META_INF_PREFIX: &str = "META-INF/";
pub(crate) const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub(crate) const SIGNATURE_FILE_PATH: &str = "META-INF/BS.SF";
pub(crate) const RSA_BLOCK_PATH: &str = "META-INF/BS.RSA";

const CREATED_BY: &str = "1.0 (apksign-core)";

const OID_SHA256: &Oid =
    Oid::JOINT_ISO_ITU_T_COUNTRY_US_ORGANIZATION_GOV_CSOR_NIST_ALGORITHMS_HASH_SHA256;
const OID_PKCS7_DATA: &Oid = Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_DATA;
const OID_PKCS7_SIGNED_DATA: &Oid = Oid::ISO_MEMBER_BODY_US_RSADSI_PKCS7_SIGNED_DATA;

/// A trusted digest of an entry's uncompressed content as of a known
/// modification time, as recorded by a prior call to
/// [`crate::collect_pre_patch_hashes`]. Serializable so a caller can persist
/// it between process invocations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrePatchHash {
    pub digest_b64: String,
    pub last_modified: u32,
}

pub(crate) struct V1Artifacts {
    pub manifest: Vec<u8>,
    pub signature_file: Vec<u8>,
    pub rsa_block: Vec<u8>,
}

fn render_manifest_header() -> Vec<u8> {
    format!("Manifest-Version: 1.0\r\nCreated-By: {CREATED_BY}\r\n\r\n").into_bytes()
}

fn render_signature_file_header(manifest_digest_b64: &str) -> Vec<u8> {
    format!(
        "Signature-Version: 1.0\r\nSHA-256-Digest-Manifest: {manifest_digest_b64}\r\nCreated-By: {CREATED_BY}\r\nX-Android-APK-Signed: 2\r\n\r\n"
    )
    .into_bytes()
}

fn render_section(name: &str, digest_b64: &str) -> Vec<u8> {
    format!("Name: {name}\r\nSHA-256-Digest: {digest_b64}\r\n\r\n").into_bytes()
}

/// Builds the manifest, signature file and RSA block for every non-`META-INF/`
/// entry currently in `zip`, in central-directory order. Entries present in
/// `known_hashes` with a matching `last_modified` are not re-hashed.
pub(crate) fn build_v1_artifacts(
    zip: &mut ZipFile<File>,
    cert_der: &[u8],
    priv_key: &RsaPrivateKey,
    known_hashes: Option<&HashMap<String, PrePatchHash>>,
) -> Result<V1Artifacts> {
    let entry_list: Vec<(String, u32)> = zip
        .iter_entries_in_order()
        .filter(|(name, _)| !name.starts_with(META_INF_PREFIX))
        .map(|(name, cdh)| (name.to_string(), cdh.last_modified))
        .collect();

    let mut manifest = render_manifest_header();
    let mut sections: Vec<Vec<u8>> = Vec::with_capacity(entry_list.len());

    for (name, last_modified) in &entry_list {
        let cached = known_hashes
            .and_then(|map| map.get(name))
            .filter(|cached| cached.last_modified == *last_modified);

        let digest_b64 = match cached {
            Some(cached) => cached.digest_b64.clone(),
            None => {
                let contents = zip
                    .read_file(name)
                    .with_context(|| format!("Reading entry {name} for manifest hashing"))?;
                base64_digest(&sha256_of_bytes(&contents))
            }
        };

        let section = render_section(name, &digest_b64);
        manifest.extend_from_slice(&section);
        sections.push(section);
    }

    let manifest_digest = base64_digest(&sha256_of_bytes(&manifest));
    let mut signature_file = render_signature_file_header(&manifest_digest);
    for ((name, _), section) in entry_list.iter().zip(sections.iter()) {
        let section_digest = base64_digest(&sha256_of_bytes(section));
        signature_file.extend_from_slice(&render_section(name, &section_digest));
    }

    let rsa_block = build_pkcs7_signed_data(&signature_file, cert_der, priv_key)?;

    Ok(V1Artifacts {
        manifest,
        signature_file,
        rsa_block,
    })
}

// Detached PKCS#7 SignedData over `signed_content`, signed with `priv_key`
// and carrying `cert_der` as the sole signer certificate.
fn build_pkcs7_signed_data(
    signed_content: &[u8],
    cert_der: &[u8],
    priv_key: &RsaPrivateKey,
) -> Result<Vec<u8>> {
    let signature = crate::crypto::rsa_sign_sha256(priv_key, signed_content)
        .context("RSA signing of PKCS#7 block failed")?;

    let cert: CmsCertificate = rasn::der::decode(cert_der)
        .map_err(|err| anyhow!("Re-decoding certificate for PKCS#7 block: {err}"))?;

    let signer_info = SignerInfo {
        version: Integer::Primitive(1),
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone(),
        }),
        digest_algorithm: AlgorithmIdentifier {
            algorithm: OID_SHA256.into(),
            parameters: None,
        },
        signed_attrs: None,
        signature_algorithm: AlgorithmIdentifier {
            algorithm: RSA.into(),
            parameters: None,
        },
        signature: signature.into(),
        unsigned_attrs: None,
    };

    let signed_data = SignedData {
        version: Integer::Primitive(1),
        digest_algorithms: vec![AlgorithmIdentifier {
            algorithm: OID_SHA256.into(),
            parameters: None,
        }]
        .into(),
        encap_content_info: EncapsulatedContentInfo {
            content_type: OID_PKCS7_DATA.into(),
            content: None,
        },
        certificates: Some(vec![CertificateChoices::Certificate(Box::new(cert))].into()),
        crls: None,
        signer_infos: vec![signer_info].into(),
    };

    let inner = rasn::der::encode(&signed_data)
        .map_err(|err| anyhow!("Encoding PKCS#7 SignedData: {err}"))?;

    let wrapper = ContentInfo {
        content_type: OID_PKCS7_SIGNED_DATA.into(),
        content: rasn::types::Any::new(inner),
    };

    rasn::der::encode(&wrapper).map_err(|err| anyhow!("Encoding PKCS#7 ContentInfo: {err}"))
}

/// Best-effort reverse parse of an existing `META-INF/MANIFEST.MF` into a
/// `{ EntryName → PrePatchHash }` cache, tolerating folded continuation
/// lines. Returns `None` (never an error) if the archive has no manifest, or
/// the manifest isn't `Manifest-Version: 1.0`.
pub(crate) fn collect_pre_patch_hashes(zip: &mut ZipFile<File>) -> Option<HashMap<String, PrePatchHash>> {
    if !zip.contains_file(MANIFEST_PATH) {
        return None;
    }

    let raw = zip.read_file(MANIFEST_PATH).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let normalized = text.replace("\r\n", "\n");

    let mut logical_lines: Vec<String> = Vec::new();
    for raw_line in normalized.split('\n') {
        if let Some(continuation) = raw_line.strip_prefix(' ') {
            if let Some(last) = logical_lines.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        logical_lines.push(raw_line.to_string());
    }

    if logical_lines.first().map(String::as_str) != Some("Manifest-Version: 1.0") {
        return None;
    }

    let mut lines = logical_lines.into_iter();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
    }

    let mut result = HashMap::new();
    let mut current_fields: Vec<(String, String)> = Vec::new();

    for line in lines {
        if line.is_empty() {
            if let Some((name, hash)) = finalize_section(&current_fields, zip) {
                result.insert(name, hash);
            }
            current_fields.clear();
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            current_fields.push((key.to_string(), value.to_string()));
        }
    }
    if let Some((name, hash)) = finalize_section(&current_fields, zip) {
        result.insert(name, hash);
    }

    Some(result)
}

fn finalize_section(
    fields: &[(String, String)],
    zip: &ZipFile<File>,
) -> Option<(String, PrePatchHash)> {
    let name = fields.iter().find(|(k, _)| k == "Name")?.1.clone();
    let digest_b64 = fields.iter().find(|(k, _)| k == "SHA-256-Digest")?.1.clone();
    let last_modified = zip.get_entry(&name)?.last_modified;
    Some((name, PrePatchHash { digest_b64, last_modified }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_header_matches_expected_bytes() {
        assert_eq!(
            render_manifest_header(),
            b"Manifest-Version: 1.0\r\nCreated-By: 1.0 (apksign-core)\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn manifest_section_matches_known_digest() {
        let digest = sha256_of_bytes(b"hello\n");
        let section = render_section("a.txt", &base64_digest(&digest));
        assert_eq!(
            section,
            b"Name: a.txt\r\nSHA-256-Digest: WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=\r\n\r\n"
                .to_vec()
        );
    }

    fn fixture_zip(dir: &std::path::Path, entry: &[u8]) -> ZipFile<File> {
        let path = dir.join("fixture.apk");
        let mut zip = ZipFile::create_new(File::create(&path).unwrap());
        zip.create_entry_stored("a.txt", entry).unwrap();
        zip.save_unsigned().unwrap();
        drop(zip);
        ZipFile::open(File::open(&path).unwrap()).unwrap()
    }

    #[test]
    fn known_hash_with_matching_last_modified_is_reused_without_rehashing() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = fixture_zip(dir.path(), b"hello\n");
        let last_modified = zip.get_entry("a.txt").unwrap().last_modified;

        let pem = crate::generate_new_certificate_pem().unwrap();
        let (_cert, cert_der, priv_key) = crate::crypto::load_certificate(pem.as_bytes()).unwrap();

        let mut known = HashMap::new();
        known.insert(
            "a.txt".to_string(),
            PrePatchHash {
                digest_b64: "not-the-real-digest".to_string(),
                last_modified,
            },
        );

        let artifacts = build_v1_artifacts(&mut zip, &cert_der, &priv_key, Some(&known)).unwrap();
        let manifest = String::from_utf8(artifacts.manifest).unwrap();
        assert!(manifest.contains("SHA-256-Digest: not-the-real-digest\r\n"));
    }

    #[test]
    fn known_hash_with_stale_last_modified_is_rehashed() {
        let dir = tempfile::tempdir().unwrap();
        let mut zip = fixture_zip(dir.path(), b"hello\n");
        let last_modified = zip.get_entry("a.txt").unwrap().last_modified;

        let pem = crate::generate_new_certificate_pem().unwrap();
        let (_cert, cert_der, priv_key) = crate::crypto::load_certificate(pem.as_bytes()).unwrap();

        let mut known = HashMap::new();
        known.insert(
            "a.txt".to_string(),
            PrePatchHash {
                digest_b64: "stale-digest".to_string(),
                last_modified: last_modified.wrapping_add(1),
            },
        );

        let artifacts = build_v1_artifacts(&mut zip, &cert_der, &priv_key, Some(&known)).unwrap();
        let manifest = String::from_utf8(artifacts.manifest).unwrap();
        assert!(!manifest.contains("stale-digest"));
        assert!(manifest.contains("SHA-256-Digest: WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=\r\n"));
    }

    #[test]
    fn continuation_line_is_unfolded_without_separator() {
        let normalized = "Manifest-Version: 1.0\n\nName: ab\n cd\nSHA-256-Digest: X\n\n";
        let mut logical_lines: Vec<String> = Vec::new();
        for raw_line in normalized.split('\n') {
            if let Some(continuation) = raw_line.strip_prefix(' ') {
                if let Some(last) = logical_lines.last_mut() {
                    last.push_str(continuation);
                    continue;
                }
            }
            logical_lines.push(raw_line.to_string());
        }
        assert!(logical_lines.contains(&"Name: abcd".to_string()));
    }
}
