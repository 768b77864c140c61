//! APK signing and repackaging core: given a ZIP-format APK and a PEM
//! certificate/key pair, produces a byte-correct, Android-verifiable signed
//! APK satisfying both the legacy JAR signing scheme (v1) and APK Signature
//! Scheme v2, 4-byte-aligning STORED entries in between.
//!
//! Device communication, downloads, mod management and UI are all external
//! collaborators; this crate only ever observes and rewrites a single ZIP
//! file on disk.

mod cert_gen;
mod crypto;
mod error;
mod jar_signer;
mod v2_signer;
mod zip;

use std::{
    collections::HashMap,
    fs::File,
    io::Write,
    path::Path,
    sync::OnceLock,
};

use log::info;

pub use cert_gen::generate_new_certificate_pem;
pub use error::SignError;
pub use jar_signer::PrePatchHash;

use zip::ZipFile;

/// Alignment, in bytes, required of every STORED entry's payload offset.
const STORE_ALIGNMENT: u16 = 4;

static BUILTIN_CERT_PEM: OnceLock<Result<String, String>> = OnceLock::new();

/// Signs the APK at `path` in place, using the certificate and RSA private
/// key in `pem_text`. `known_hashes`, if given, lets entries whose content
/// and last-modified time are unchanged skip re-hashing.
///
/// On any failure the original file is left untouched: all work happens on
/// a scoped temporary file in the same directory, swapped in only once every
/// step (JAR signing, alignment, v2 signing) has succeeded.
pub fn sign_apk(
    path: &Path,
    pem_text: &str,
    known_hashes: Option<&HashMap<String, PrePatchHash>>,
) -> Result<(), SignError> {
    let (cert, cert_der, priv_key) =
        crypto::load_certificate(pem_text.as_bytes()).map_err(|_| SignError::BadCertificate)?;

    sign_with_materials(path, &cert, &cert_der, &priv_key, known_hashes)
}

/// Like [`sign_apk`], but uses a certificate generated lazily on first call
/// and cached for the lifetime of the process, rather than a PEM supplied by
/// the caller. Intended for development/debug signing only.
pub fn sign_apk_with_builtin_cert(
    path: &Path,
    known_hashes: Option<&HashMap<String, PrePatchHash>>,
) -> Result<(), SignError> {
    let pem = BUILTIN_CERT_PEM
        .get_or_init(|| generate_new_certificate_pem().map_err(|err| format!("{err:#}")))
        .as_ref()
        .map_err(|err| SignError::SigningFailed(format!("generating the builtin debug certificate: {err}")))?;
    sign_apk(path, pem, known_hashes)
}

/// Reads the `META-INF/MANIFEST.MF` already present in the APK at `path`
/// and returns a `{ EntryName → PrePatchHash }` cache a later [`sign_apk`]
/// call can reuse, or `None` if the archive has no manifest or it isn't in
/// a format this crate can round-trip.
pub fn collect_pre_patch_hashes(path: &Path) -> Option<HashMap<String, PrePatchHash>> {
    let file = File::open(path).ok()?;
    let mut zip = ZipFile::open(file).ok()?;
    jar_signer::collect_pre_patch_hashes(&mut zip)
}

fn sign_with_materials(
    path: &Path,
    cert: &rasn_pkix::Certificate,
    cert_der: &[u8],
    priv_key: &rsa::RsaPrivateKey,
    known_hashes: Option<&HashMap<String, PrePatchHash>>,
) -> Result<(), SignError> {
    let scratch_dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(scratch_dir)?;
    {
        let mut original = File::open(path)?;
        std::io::copy(&mut original, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
    }

    let working_file = tmp.as_file().try_clone()?;
    let mut archive =
        ZipFile::open(working_file).map_err(SignError::from_anyhow_as_malformed)?;

    let removed = archive.delete_entries_with_prefix(jar_signer::META_INF_PREFIX);
    info!("Removed {removed} existing META-INF entries");

    info!("Building JAR v1 signature artifacts");
    let artifacts = jar_signer::build_v1_artifacts(&mut archive, cert_der, priv_key, known_hashes)
        .map_err(SignError::from_anyhow_as_signing)?;

    archive.set_store_alignment(STORE_ALIGNMENT);
    archive
        .create_entry_stored(jar_signer::MANIFEST_PATH, &artifacts.manifest)
        .map_err(SignError::from_anyhow_as_signing)?;
    archive
        .create_entry_stored(jar_signer::SIGNATURE_FILE_PATH, &artifacts.signature_file)
        .map_err(SignError::from_anyhow_as_signing)?;
    archive
        .create_entry_stored(jar_signer::RSA_BLOCK_PATH, &artifacts.rsa_block)
        .map_err(SignError::from_anyhow_as_signing)?;

    info!("Aligning STORED entries to {STORE_ALIGNMENT} bytes");
    archive
        .align_entries(STORE_ALIGNMENT, scratch_dir)
        .map_err(SignError::from_anyhow_as_signing)?;

    info!("Writing APK Signature Scheme v2 block");
    archive
        .save_and_sign_v2(priv_key, cert)
        .map_err(SignError::from_anyhow_as_signing)?;

    drop(archive);
    tmp.persist(path).map_err(|err| SignError::Io(err.error))?;
    info!("Signed APK written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_minimal_apk(dir: &Path, entry_name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join("test.apk");
        let file = File::create(&path).unwrap();
        let mut zip = ZipFile::create_new(file);
        zip.create_entry_stored(entry_name, contents).unwrap();
        zip.save_unsigned().unwrap();
        drop(zip);
        path
    }

    #[test]
    fn sign_apk_produces_expected_meta_inf_entries() {
        let dir = tempfile::tempdir().unwrap();
        let apk_path = write_minimal_apk(dir.path(), "a.txt", b"hello\n");

        let pem = generate_new_certificate_pem().unwrap();
        sign_apk(&apk_path, &pem, None).unwrap();

        let file = File::open(&apk_path).unwrap();
        let mut signed = ZipFile::open(file).unwrap();
        assert!(signed.contains_file(jar_signer::MANIFEST_PATH));
        assert!(signed.contains_file(jar_signer::SIGNATURE_FILE_PATH));
        assert!(signed.contains_file(jar_signer::RSA_BLOCK_PATH));
        assert_eq!(signed.read_file("a.txt").unwrap(), b"hello\n");

        let manifest = signed.read_file(jar_signer::MANIFEST_PATH).unwrap();
        let manifest_text = String::from_utf8(manifest).unwrap();
        assert!(manifest_text.contains(
            "Name: a.txt\r\nSHA-256-Digest: WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=\r\n"
        ));
    }

    #[test]
    fn signing_replaces_foreign_meta_inf_entries() {
        let dir = tempfile::tempdir().unwrap();
        let apk_path = dir.path().join("test.apk");
        let file = File::create(&apk_path).unwrap();
        let mut zip = ZipFile::create_new(file);
        zip.create_entry_stored("a.txt", b"hi\n").unwrap();
        zip.create_entry_stored("META-INF/CERT.SF", b"stale\n").unwrap();
        zip.create_entry_stored("META-INF/CERT.RSA", b"stale\n").unwrap();
        zip.create_entry_stored("META-INF/MANIFEST.MF", b"stale\n").unwrap();
        zip.save_unsigned().unwrap();
        drop(zip);

        let pem = generate_new_certificate_pem().unwrap();
        sign_apk(&apk_path, &pem, None).unwrap();

        let file = File::open(&apk_path).unwrap();
        let signed = ZipFile::open(file).unwrap();
        assert!(!signed.contains_file("META-INF/CERT.SF"));
        assert!(!signed.contains_file("META-INF/CERT.RSA"));
        assert!(signed.contains_file(jar_signer::MANIFEST_PATH));
    }

    #[test]
    fn malformed_archive_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let apk_path = dir.path().join("bad.apk");
        std::fs::write(&apk_path, vec![0u8; 128]).unwrap();
        let before = std::fs::read(&apk_path).unwrap();

        let pem = generate_new_certificate_pem().unwrap();
        let result = sign_apk(&apk_path, &pem, None);
        assert!(result.is_err());

        let after = std::fs::read(&apk_path).unwrap();
        assert_eq!(before, after);
    }
}
