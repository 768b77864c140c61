//! Component B ("ZIP surgeon") and component D ("Zip aligner").
//!
//! `ZipFile` reads, writes and deletes entries directly against the backing
//! file, generalized in two ways a single-purpose extractor wouldn't need:
//!
//! - entries are tracked in central-directory order (not just by name), so
//!   that JAR manifest construction can observe a deterministic order;
//! - a dedicated `align_entries` pass re-aligns every STORED entry in the
//!   archive, not just ones newly written in this call.

use anyhow::{anyhow, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use crc::{Algorithm, Crc};
use libflate::deflate;
use rasn_pkix::Certificate;
use rsa::RsaPrivateKey;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write},
    path::Path,
};

use self::data::{CentDirHeader, EndOfCentDir, LocalFileHeader};
use crate::v2_signer;

pub mod data;

/// Minimum version needed to extract ZIP files made by this module.
pub const VERSION_NEEDED_TO_EXTRACT: u16 = 0x0002;
pub const UINT16_MAX_VALUE: u16 = 0xffff;

/// The CRC-32 algorithm used by the ZIP file format.
pub const ZIP_CRC: Crc<u32> = Crc::<u32>::new(&Algorithm {
    width: 32,
    poly: 0x04c11db7,
    init: 0xffffffff,
    refin: true,
    refout: true,
    xorout: 0xffffffff,
    check: 0xcbf43926,
    residue: 0xdebb20e3,
});

/// Calculates the ZIP CRC-32 of the data within the given stream, reading
/// until EOF in bounded chunks.
pub fn crc_of_stream(mut stream: impl Read) -> Result<u32> {
    let mut crc = ZIP_CRC.digest();
    let mut buffer = vec![0u8; 4096];

    loop {
        let read_bytes = stream.read(&mut buffer)?;
        if read_bytes == 0 {
            break Ok(crc.finalize());
        }
        crc.update(&buffer[0..read_bytes]);
    }
}

/// The compression method of a file within the archive, which may be an
/// unsupported method the core doesn't know how to read/write.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum FileCompression {
    Deflate,
    Store,
    Unsupported(u16),
}

pub struct ZipFile<T: Read + Seek> {
    file: T,
    entries: HashMap<String, CentDirHeader>,
    // Central-directory iteration order, maintained across reads, writes and deletes.
    order: Vec<String>,
    end_of_entries_offset: u32,
    // Alignment of entries created with the STORE compression method, applied inline
    // as new entries are written. The separate `align_entries` pass re-aligns the
    // whole archive, including entries this field never touched.
    store_alignment: u16,
}

/// Scans backward from EOF for the EOCD signature, tolerating a nonzero ZIP
/// comment (unlike the simplified zero-comment assumption in the abstract
/// spec, this mirrors actual ZIP readers and is strictly more permissive).
/// Fails if no EOCD is found within the trailing 64 KiB.
pub fn locate_eocd(file: &mut (impl Read + Seek)) -> Result<u64> {
    let archive_size = file.seek(SeekFrom::End(0))?;
    if archive_size < EndOfCentDir::MIN_SIZE as u64 {
        return Err(anyhow!("File too small to be a valid ZIP archive"));
    }

    let max_comment_len = std::cmp::min(
        archive_size - EndOfCentDir::MIN_SIZE as u64,
        UINT16_MAX_VALUE as u64,
    );

    let eocd_empty_comment_pos = archive_size - EndOfCentDir::MIN_SIZE as u64;
    for expected_comment_len in 0..=max_comment_len {
        let eocd_pos = eocd_empty_comment_pos - expected_comment_len;
        file.seek(SeekFrom::Start(eocd_pos))?;

        if file.read_u32::<LE>()? == EndOfCentDir::HEADER {
            file.seek(SeekFrom::Start(
                eocd_pos + EndOfCentDir::COMMENT_LENGTH_FIELD_OFFSET as u64,
            ))?;
            let actual_comment_len = file.read_u16::<LE>()? as u64;

            if actual_comment_len == expected_comment_len {
                return Ok(eocd_pos);
            }
        }
    }

    Err(anyhow!("No EOCD found in archive"))
}

impl<T: Read + Seek> ZipFile<T> {
    /// Opens a ZIP archive from a readable, seekable stream.
    pub fn open(mut file: T) -> Result<Self> {
        let eocd_pos = locate_eocd(&mut file).context("Locating EOCD")?;

        let mut buf_file = BufReader::new(&mut file);
        buf_file.seek(SeekFrom::Start(eocd_pos))?;
        let eocd: EndOfCentDir = EndOfCentDir::read(&mut buf_file).context("Invalid EOCD")?;
        buf_file.seek(SeekFrom::Start(eocd.cent_dir_offset as u64))?;

        let mut entries = HashMap::new();
        let mut order = Vec::new();
        let mut last_lfh_offset = 0;

        for _ in 0..eocd.cent_dir_records {
            let cd_record = CentDirHeader::read(&mut buf_file).context("Invalid CD file header")?;
            last_lfh_offset = last_lfh_offset.max(cd_record.local_header_offset);

            order.push(cd_record.file_name.clone());
            entries.insert(cd_record.file_name.clone(), cd_record);
        }

        // Read the last LFH to find the first byte after the last entry. Using the CD
        // offset instead would leave any existing signing block intact but wasted.
        buf_file.seek(SeekFrom::Start(last_lfh_offset as u64))?;
        let last_header = LocalFileHeader::read(&mut buf_file)?;

        Ok(Self {
            end_of_entries_offset: (buf_file.stream_position()?
                + last_header.compressed_len as u64)
                .try_into()
                .context("ZIP file too large")?,
            file,
            entries,
            order,
            store_alignment: 1,
        })
    }

    /// Reads the contents of the named entry into a freshly allocated buffer.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(vec![]);
        self.read_file_contents(name, &mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn read_lfh_and_seek_to_contents(
        &mut self,
        name: &str,
    ) -> Result<(LocalFileHeader, &CentDirHeader, BufReader<&mut T>)> {
        let cd_header = match self.entries.get(name) {
            Some(header) => header,
            None => return Err(anyhow!("File with name {name} did not exist")),
        };

        let mut buf_reader = BufReader::new(&mut self.file);
        buf_reader.seek(SeekFrom::Start(cd_header.local_header_offset as u64))?;
        let lfh = LocalFileHeader::read(&mut buf_reader).context("Invalid local file header")?;

        Ok((lfh, cd_header, buf_reader))
    }

    /// Streams the contents of the named entry (decompressing if necessary)
    /// to `write_to`, reading in bounded chunks rather than buffering the
    /// whole entry.
    pub fn read_file_contents(&mut self, name: &str, write_to: &mut impl Write) -> Result<()> {
        let (lfh, cdh, mut buf_reader) = self.read_lfh_and_seek_to_contents(name)?;
        let mut compressed_contents = (&mut buf_reader).take(cdh.compressed_len as u64);

        match lfh.compression_method {
            FileCompression::Deflate => {
                let mut decoder = deflate::Decoder::new(compressed_contents);
                std::io::copy(&mut decoder, write_to)?;
            }
            FileCompression::Store => {
                std::io::copy(&mut compressed_contents, write_to)?;
            }
            FileCompression::Unsupported(method) => {
                return Err(anyhow!(
                    "Compression method `{method}` not supported for reading"
                ))
            }
        };

        Ok(())
    }

    /// Returns the entries in central-directory iteration order.
    pub fn iter_entries_in_order(&self) -> impl Iterator<Item = (&str, &CentDirHeader)> {
        self.order
            .iter()
            .map(move |name| (name.as_str(), self.entries.get(name).expect("order/entries desync")))
    }

    /// Returns an iterator over the entry names, in no particular order.
    pub fn iter_entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_ref)
    }

    /// Returns true if and only if a file exists with name `name`.
    pub fn contains_file(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get_entry(&self, name: &str) -> Option<&CentDirHeader> {
        self.entries.get(name)
    }
}

// Copies `from` to `to`, calculating the ZIP CRC-32 of the copied data.
fn copy_to_with_crc(from: &mut impl Read, to: &mut impl Write) -> Result<u32> {
    const BUFFER_SIZE: usize = 4096;
    let mut buffer = vec![0; BUFFER_SIZE];

    let mut crc = ZIP_CRC.digest();
    loop {
        let bytes_read = from.read(&mut buffer)?;
        if bytes_read == 0 {
            break Ok(crc.finalize());
        }
        crc.update(&buffer[0..bytes_read]);
        to.write_all(&buffer[0..bytes_read])?;
    }
}

impl ZipFile<File> {
    /// Creates a fresh, empty archive backed by `file`, which should be a
    /// newly created, empty file. Used to build a ZIP from scratch rather
    /// than editing an existing one.
    pub fn create_new(file: File) -> Self {
        Self {
            file,
            entries: HashMap::new(),
            order: Vec::new(),
            end_of_entries_offset: 0,
            store_alignment: 1,
        }
    }

    /// Sets the alignment applied inline to entries written with the STORE
    /// compression method going forward. Does not retroactively align
    /// existing entries — use `align_entries` for that.
    pub fn set_store_alignment(&mut self, alignment: u16) {
        self.store_alignment = alignment;
    }

    // Builds the extra field needed to align `data_offset` to `store_alignment`.
    fn create_alignment_field(alignment: u16, data_offset: u64) -> Result<Vec<u8>> {
        const ALIGNMENT_EXTRA_DATA_HEADER: u16 = 0xD935;

        let offset_from_alignment = data_offset % alignment as u64;
        if offset_from_alignment == 0 {
            return Ok(Vec::new());
        }

        let after_min_len = data_offset + 6;
        let padding_bytes = (alignment as u64 - (after_min_len % alignment as u64)) % alignment as u64;

        let mut output_buf: Vec<u8> = Vec::new();
        let mut cursor = Cursor::new(&mut output_buf);

        cursor.write_u16::<LE>(ALIGNMENT_EXTRA_DATA_HEADER)?;
        cursor.write_u16::<LE>((padding_bytes + 2) as u16)?;
        cursor.write_u16::<LE>(alignment)?;
        for _ in 0..padding_bytes {
            cursor.write_u8(0)?;
        }

        Ok(output_buf)
    }

    fn record_new_entry(&mut self, name: &str) {
        if !self.entries.contains_key(name) {
            self.order.push(name.to_string());
        }
    }

    /// Writes a file to the ZIP with the given entry name, reading `contents` until EOF.
    pub fn write_file(
        &mut self,
        name: &str,
        contents: &mut (impl Read + Seek),
        compression_method: FileCompression,
    ) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.end_of_entries_offset as u64))?;

        let lfh_offset = self.file.stream_position()?;
        let unaligned_post_lfh_offset = self.file.stream_position()? + 30 + name.len() as u64;
        let alignment_field = if compression_method == FileCompression::Store {
            Self::create_alignment_field(self.store_alignment, unaligned_post_lfh_offset)?
        } else {
            Vec::new()
        };

        self.file.seek(SeekFrom::Start(
            unaligned_post_lfh_offset + alignment_field.len() as u64,
        ))?;

        let data_start = self.file.stream_position()?;

        contents.seek(SeekFrom::Start(0))?;
        let crc32 = match compression_method {
            FileCompression::Deflate => {
                let mut buf_writer = BufWriter::new(&mut self.file);
                let mut encoder = deflate::Encoder::new(&mut buf_writer);
                let crc = copy_to_with_crc(contents, &mut encoder)
                    .context("Writing/compressing file data")?;
                encoder.finish().into_result()?;

                self.end_of_entries_offset = buf_writer
                    .stream_position()?
                    .try_into()
                    .context("ZIP file too large")?;
                crc
            }
            FileCompression::Store => {
                let crc =
                    copy_to_with_crc(contents, &mut self.file).context("Writing file data")?;
                self.end_of_entries_offset = self
                    .file
                    .stream_position()?
                    .try_into()
                    .context("ZIP file too large")?;
                crc
            }
            FileCompression::Unsupported(method) => {
                return Err(anyhow!("Compression method `{method}` is not supported"))
            }
        };

        let compressed_len: u32 = (self.end_of_entries_offset as u64 - data_start)
            .try_into()
            .context("Compressed file length too big for 32 bit ZIP file")?;
        let uncompressed_len: u32 = contents
            .stream_position()?
            .try_into()
            .context("Uncompressed file length too big for 32 bit ZIP file")?;

        let local_header = LocalFileHeader {
            version_needed: VERSION_NEEDED_TO_EXTRACT,
            flags: 0,
            compression_method,
            last_modified: 0,
            crc32,
            compressed_len,
            uncompressed_len,
            file_name: name.to_string(),
            extra_field: alignment_field,
        };

        self.file.seek(SeekFrom::Start(lfh_offset))?;
        local_header
            .write(&mut BufWriter::new(&mut self.file))
            .context("Writing local file header")?;

        let central_dir_header = CentDirHeader {
            os_version_made_by: 0,
            version_needed: VERSION_NEEDED_TO_EXTRACT,
            flags: 0,
            compression_method,
            last_modified: 0,
            crc32,
            compressed_len,
            uncompressed_len,
            file_name: name.to_string(),
            extra_field: Vec::new(),
            internal_attrs: 0,
            external_attrs: 0,
            local_header_offset: lfh_offset.try_into().context("ZIP file too big")?,
            comment: String::new(),
        };

        self.record_new_entry(name);
        self.entries.insert(name.to_string(), central_dir_header);
        Ok(())
    }

    /// Writes an entry with the STORE compression method (no compression),
    /// as required for JAR signature artifacts whose byte offsets must be
    /// predictable for v2 hashing.
    pub fn create_entry_stored(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        self.write_file(name, &mut Cursor::new(contents), FileCompression::Store)
    }

    /// Deletes the file with the given name, if it existed. Returns whether
    /// an entry was actually removed.
    pub fn delete_file(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.entries.remove(name).is_some()
    }

    /// Deletes every entry whose name starts with `prefix`. Returns the number removed.
    pub fn delete_entries_with_prefix(&mut self, prefix: &str) -> usize {
        let to_remove: Vec<String> = self
            .order
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();

        for name in &to_remove {
            self.entries.remove(name);
        }
        self.order.retain(|name| !name.starts_with(prefix));
        to_remove.len()
    }

    /// Component D: rewrites the whole archive so that every STORED entry's
    /// payload starts on an `alignment`-byte boundary, using a scoped
    /// temporary file created in `scratch_dir` (normally the APK's own
    /// directory) and swapped back in on success.
    ///
    /// Deflated entries are never touched, since they're never mmapped.
    pub fn align_entries(&mut self, alignment: u16, scratch_dir: &Path) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(scratch_dir)
            .context("Creating scratch file for alignment pass")?;

        let mut new_entries: HashMap<String, CentDirHeader> = HashMap::new();

        for name in &self.order {
            let cd_header = self.entries.get(name).expect("order/entries desync").clone();

            self.file
                .seek(SeekFrom::Start(cd_header.local_header_offset as u64))?;
            let mut buf_reader = BufReader::new(&mut self.file);
            let lfh = LocalFileHeader::read(&mut buf_reader).context("Invalid local file header")?;

            let new_lfh_offset = tmp.as_file().stream_position()?;
            let unaligned_post_lfh_offset = new_lfh_offset + 30 + lfh.file_name.len() as u64;

            let extra_field = if cd_header.compression_method == FileCompression::Store {
                Self::create_alignment_field(alignment, unaligned_post_lfh_offset)?
            } else {
                Vec::new()
            };

            let new_lfh = LocalFileHeader {
                extra_field: extra_field.clone(),
                ..lfh.clone()
            };

            tmp.as_file_mut()
                .seek(SeekFrom::Start(new_lfh_offset))?;
            new_lfh
                .write(tmp.as_file_mut())
                .context("Writing re-aligned local file header")?;

            std::io::copy(
                &mut (&mut buf_reader).take(cd_header.compressed_len as u64),
                tmp.as_file_mut(),
            )
            .context("Copying entry content during alignment pass")?;

            let mut new_cd_header = cd_header.clone();
            new_cd_header.local_header_offset = new_lfh_offset
                .try_into()
                .context("Archive too large to re-align")?;
            new_entries.insert(name.clone(), new_cd_header);
        }

        self.end_of_entries_offset = tmp
            .as_file()
            .stream_position()?
            .try_into()
            .context("Archive too large to re-align")?;
        self.entries = new_entries;

        // Swap the realigned content back into the original file handle.
        self.file.seek(SeekFrom::Start(0))?;
        tmp.as_file_mut().seek(SeekFrom::Start(0))?;
        let realigned_len = std::io::copy(tmp.as_file_mut(), &mut self.file)
            .context("Copying re-aligned archive back")?;
        self.file.set_len(realigned_len)?;
        self.file.seek(SeekFrom::Start(realigned_len))?;

        Ok(())
    }

    /// Saves the central directory without signing the archive. Not used by
    /// the signing pipeline (which always goes through `save_and_sign_v2`),
    /// but kept for callers that want a plain, unsigned ZIP — e.g. building
    /// a fresh test fixture from scratch.
    #[allow(unused)]
    pub fn save_unsigned(&mut self) -> Result<()> {
        self.file.set_len(self.end_of_entries_offset as u64)?;
        self.file
            .seek(SeekFrom::Start(self.end_of_entries_offset as u64))?;

        for name in &self.order {
            self.entries
                .get(name)
                .expect("order/entries desync")
                .write(&mut self.file)?;
        }

        let eocd = EndOfCentDir {
            cent_dir_records: self
                .entries
                .len()
                .try_into()
                .context("Too many ZIP entries")?,
            cent_dir_size: (self.file.stream_position()? - self.end_of_entries_offset as u64)
                .try_into()
                .context("Central directory too big")?,
            cent_dir_offset: self.end_of_entries_offset,
            comment: Vec::new(),
        };

        eocd.write(&mut self.file)
            .context("Saving end of central directory")?;
        Ok(())
    }

    /// Saves the central directory while signing the APK with the v2
    /// signature scheme (component E). Any existing signing block, central
    /// directory and EOCD are discarded unconditionally, since everything
    /// after `end_of_entries_offset` is truncated before the new block is
    /// written.
    pub fn save_and_sign_v2(&mut self, priv_key: &RsaPrivateKey, cert: &Certificate) -> Result<()> {
        let mut cd_bytes = Vec::new();
        let mut cd_cursor = Cursor::new(&mut cd_bytes);

        for name in &self.order {
            self.entries
                .get(name)
                .expect("order/entries desync")
                .write(&mut cd_cursor)?;
        }

        let mut eocd = EndOfCentDir {
            cent_dir_records: self
                .entries
                .len()
                .try_into()
                .context("Too many ZIP entries")?,
            cent_dir_size: cd_bytes
                .len()
                .try_into()
                .context("Central directory too big")?,
            cent_dir_offset: 0, // Set once the signing block's length is known.
            comment: Vec::new(),
        };

        self.file.set_len(self.end_of_entries_offset as u64)?;
        self.file
            .seek(SeekFrom::Start(self.end_of_entries_offset as u64))?;

        v2_signer::write_v2_signature(&mut self.file, priv_key, cert, &cd_bytes, eocd.clone())
            .context("Signing APK")?;

        eocd.cent_dir_offset = self
            .file
            .stream_position()?
            .try_into()
            .context("APK file too big")?;
        self.file.write_all(&cd_bytes)?;
        eocd.write(&mut self.file)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_test_zip(entry: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut cursor = Cursor::new(&mut buf);
            let lfh = LocalFileHeader {
                version_needed: VERSION_NEEDED_TO_EXTRACT,
                flags: 0,
                compression_method: FileCompression::Store,
                last_modified: 0,
                crc32: crc_of_stream(Cursor::new(entry)).unwrap(),
                compressed_len: entry.len() as u32,
                uncompressed_len: entry.len() as u32,
                file_name: "a.txt".to_string(),
                extra_field: Vec::new(),
            };
            lfh.write(&mut cursor).unwrap();
            cursor.write_all(entry).unwrap();

            let cd_offset = cursor.position() as u32;
            let cdh = CentDirHeader {
                os_version_made_by: 0,
                version_needed: VERSION_NEEDED_TO_EXTRACT,
                flags: 0,
                compression_method: FileCompression::Store,
                last_modified: 0,
                crc32: crc_of_stream(Cursor::new(entry)).unwrap(),
                compressed_len: entry.len() as u32,
                uncompressed_len: entry.len() as u32,
                internal_attrs: 0,
                external_attrs: 0,
                local_header_offset: 0,
                file_name: "a.txt".to_string(),
                extra_field: Vec::new(),
                comment: String::new(),
            };
            cdh.write(&mut cursor).unwrap();
            let cd_size = cursor.position() as u32 - cd_offset;

            let eocd = EndOfCentDir {
                cent_dir_records: 1,
                cent_dir_size: cd_size,
                cent_dir_offset: cd_offset,
                comment: Vec::new(),
            };
            eocd.write(&mut cursor).unwrap();
        }
        buf
    }

    #[test]
    fn locate_eocd_finds_trailer() {
        let buf = build_test_zip(b"hello\n");
        let mut cursor = Cursor::new(buf);
        let pos = locate_eocd(&mut cursor).unwrap();
        assert!(pos > 0);
    }

    #[test]
    fn open_reads_single_entry() {
        let buf = build_test_zip(b"hello\n");
        let cursor = Cursor::new(buf);
        let mut zip = ZipFile::open(cursor).unwrap();
        assert!(zip.contains_file("a.txt"));
        assert_eq!(zip.read_file("a.txt").unwrap(), b"hello\n");
    }

    #[test]
    fn locate_eocd_fails_on_non_zip() {
        let mut cursor = Cursor::new(vec![0u8; 128]);
        assert!(locate_eocd(&mut cursor).is_err());
    }

    #[test]
    fn align_entries_aligns_every_stored_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unaligned.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = ZipFile::create_new(file);

        // Odd-length names/content throw off natural alignment, so the
        // un-aligned offsets here won't land on a 4-byte boundary by luck.
        zip.create_entry_stored("a.txt", b"1").unwrap();
        zip.create_entry_stored("bb.txt", b"22").unwrap();
        zip.create_entry_stored("ccc.txt", b"333").unwrap();
        zip.save_unsigned().unwrap();
        drop(zip);

        let file = std::fs::File::open(&path).unwrap();
        let mut zip = ZipFile::open(file).unwrap();
        zip.align_entries(4, dir.path()).unwrap();

        for name in ["a.txt", "bb.txt", "ccc.txt"] {
            let cdh = zip.get_entry(name).unwrap().clone();
            let data_offset =
                cdh.local_header_offset as u64 + 30 + name.len() as u64 + cdh_extra_len(&zip, name);
            assert_eq!(data_offset % 4, 0, "{name} payload not aligned");
        }
        assert_eq!(zip.read_file("bb.txt").unwrap(), b"22");
    }

    // Re-reads the local file header to get the extra field length actually
    // written during alignment (the CD's own extra field is left empty).
    fn cdh_extra_len(zip: &ZipFile<File>, name: &str) -> u64 {
        let cdh = zip.entries.get(name).unwrap();
        let mut file = &zip.file;
        file.seek(SeekFrom::Start(cdh.local_header_offset as u64))
            .unwrap();
        let lfh = LocalFileHeader::read(&mut file).unwrap();
        lfh.extra_field.len() as u64
    }
}
