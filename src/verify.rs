//! Per-file verifier sidecars.
//!
//! A sidecar lives at `<xml_root>/<gamename>/<filename>.xml`:
//!
//! ```text
//! <file name="..." md5="..." chunks="N" total_size="BYTES">
//!   <chunk id="0" from="0" to="10485759" method="md5">HEX</chunk>
//!   ...
//! </file>
//! ```
//!
//! The same document shape is served remotely for installers and
//! patches; resume/skip decisions compare the local and remote copies,
//! and repair restreams only the chunk ranges whose digest disagrees.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::utils;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("invalid verifier XML: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerifierChunk {
    pub id: u32,
    pub from: u64,
    pub to: u64,
    pub md5: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileVerifier {
    pub name: String,
    pub md5: String,
    pub total_size: u64,
    pub chunks: Vec<VerifierChunk>,
}

/// Sidecar location for a downloaded file.
pub fn xml_path(xml_dir: &Path, gamename: &str, filename: &str) -> PathBuf {
    if gamename.is_empty() {
        xml_dir.join(format!("{}.xml", filename))
    } else {
        xml_dir.join(gamename).join(format!("{}.xml", filename))
    }
}

impl FileVerifier {
    pub fn parse(xml: &str) -> Result<FileVerifier, VerifierError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut verifier = FileVerifier::default();
        let mut seen_file = false;
        let mut current: Option<VerifierChunk> = None;

        loop {
            match reader
                .read_event()
                .map_err(|e| VerifierError::Malformed(e.to_string()))?
            {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"file" => {
                        seen_file = true;
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|e| VerifierError::Malformed(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"name" => verifier.name = value.into_owned(),
                                b"md5" => verifier.md5 = value.into_owned(),
                                b"total_size" => {
                                    verifier.total_size = value.parse().unwrap_or(0)
                                }
                                _ => {}
                            }
                        }
                    }
                    b"chunk" => {
                        let mut chunk = VerifierChunk::default();
                        for attr in e.attributes().flatten() {
                            let value = attr
                                .unescape_value()
                                .map_err(|e| VerifierError::Malformed(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"id" => chunk.id = value.parse().unwrap_or(0),
                                b"from" => chunk.from = value.parse().unwrap_or(0),
                                b"to" => chunk.to = value.parse().unwrap_or(0),
                                _ => {}
                            }
                        }
                        current = Some(chunk);
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    if let Some(chunk) = &mut current {
                        chunk.md5 = t
                            .unescape()
                            .map_err(|e| VerifierError::Malformed(e.to_string()))?
                            .trim()
                            .to_string();
                    }
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"chunk" {
                        if let Some(chunk) = current.take() {
                            verifier.chunks.push(chunk);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_file {
            return Err(VerifierError::Malformed("no file element".into()));
        }
        Ok(verifier)
    }

    pub fn load(path: &Path) -> Result<FileVerifier, VerifierError> {
        let xml = std::fs::read_to_string(path)?;
        FileVerifier::parse(&xml)
    }

    /// Hashes a local file into a verifier record with `chunk_size`-byte
    /// chunks (the last one short).
    pub fn create(filepath: &Path, chunk_size: u64) -> Result<FileVerifier, VerifierError> {
        let mut file = std::fs::File::open(filepath)?;
        let total_size = file.metadata()?.len();
        let chunk_size = chunk_size.max(1);

        let mut verifier = FileVerifier {
            name: filepath
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            total_size,
            ..FileVerifier::default()
        };

        let mut whole = Md5::new();
        let mut offset = 0u64;
        let mut id = 0u32;
        let mut buf = vec![0u8; 1024 * 1024];
        while offset < total_size {
            let len = chunk_size.min(total_size - offset);
            file.seek(SeekFrom::Start(offset))?;

            let mut chunk_hasher = Md5::new();
            let mut remaining = len;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                chunk_hasher.update(&buf[..n]);
                whole.update(&buf[..n]);
                remaining -= n as u64;
            }

            verifier.chunks.push(VerifierChunk {
                id,
                from: offset,
                to: offset + len - 1,
                md5: utils::hex(&chunk_hasher.finalize()),
            });
            offset += len;
            id += 1;
        }
        // zero length files still get a whole-file hash
        verifier.md5 = utils::hex(&whole.finalize());
        Ok(verifier)
    }

    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new(Vec::new());
        let mut file_elem = BytesStart::new("file");
        file_elem.push_attribute(("name", self.name.as_str()));
        file_elem.push_attribute(("md5", self.md5.as_str()));
        file_elem.push_attribute(("chunks", self.chunks.len().to_string().as_str()));
        file_elem.push_attribute(("total_size", self.total_size.to_string().as_str()));
        writer.write_event(Event::Start(file_elem)).expect("write to vec");

        for chunk in &self.chunks {
            let mut chunk_elem = BytesStart::new("chunk");
            chunk_elem.push_attribute(("id", chunk.id.to_string().as_str()));
            chunk_elem.push_attribute(("from", chunk.from.to_string().as_str()));
            chunk_elem.push_attribute(("to", chunk.to.to_string().as_str()));
            chunk_elem.push_attribute(("method", "md5"));
            writer.write_event(Event::Start(chunk_elem)).expect("write to vec");
            writer
                .write_event(Event::Text(BytesText::new(&chunk.md5)))
                .expect("write to vec");
            writer
                .write_event(Event::End(BytesEnd::new("chunk")))
                .expect("write to vec");
        }

        writer
            .write_event(Event::End(BytesEnd::new("file")))
            .expect("write to vec");
        String::from_utf8(writer.into_inner()).expect("xml is utf-8")
    }

    /// Writes the sidecar under `<xml_dir>/<gamename>/`.
    pub fn save(&self, xml_dir: &Path, gamename: &str) -> Result<PathBuf, VerifierError> {
        let path = xml_path(xml_dir, gamename, &self.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.to_xml())?;
        Ok(path)
    }

    /// Indices of chunks whose on-disk bytes hash differently.
    pub fn mismatched_chunks(&self, filepath: &Path) -> Result<Vec<usize>, VerifierError> {
        let mut bad = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let len = chunk.to - chunk.from + 1;
            let hash = utils::file_md5_range(filepath, chunk.from, len)?;
            if hash != chunk.md5 {
                bad.push(i);
            }
        }
        Ok(bad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        r#"<file name="setup_foo.exe" md5="aabb" chunks="2" total_size="20">"#,
        r#"<chunk id="0" from="0" to="9" method="md5">c0ffee</chunk>"#,
        r#"<chunk id="1" from="10" to="19" method="md5">f00d</chunk>"#,
        r#"</file>"#
    );

    #[test]
    fn parses_file_and_chunks() {
        let v = FileVerifier::parse(SAMPLE).unwrap();
        assert_eq!(v.name, "setup_foo.exe");
        assert_eq!(v.md5, "aabb");
        assert_eq!(v.total_size, 20);
        assert_eq!(v.chunks.len(), 2);
        assert_eq!(v.chunks[1].from, 10);
        assert_eq!(v.chunks[1].to, 19);
        assert_eq!(v.chunks[1].md5, "f00d");
    }

    #[test]
    fn rejects_documents_without_file_element() {
        assert!(FileVerifier::parse("<other/>").is_err());
        assert!(FileVerifier::parse("not xml <<<").is_err());
    }

    #[test]
    fn create_then_parse_agrees() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("payload.bin");
        let data: Vec<u8> = (0u16..5000).map(|v| (v % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let created = FileVerifier::create(&path, 2048).unwrap();
        assert_eq!(created.total_size, 5000);
        assert_eq!(created.chunks.len(), 3);
        assert_eq!(created.chunks[2].from, 4096);
        assert_eq!(created.chunks[2].to, 4999);
        assert_eq!(created.md5, utils::file_md5(&path).unwrap());

        let parsed = FileVerifier::parse(&created.to_xml()).unwrap();
        assert_eq!(parsed, created);
    }

    #[test]
    fn mismatched_chunks_finds_the_bad_range() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("payload.bin");
        let mut data = vec![7u8; 4096];
        std::fs::write(&path, &data).unwrap();
        let v = FileVerifier::create(&path, 1024).unwrap();

        // corrupt the third chunk only
        data[2100] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        assert_eq!(v.mismatched_chunks(&path).unwrap(), vec![2]);
    }

    #[test]
    fn xml_path_layout() {
        let p = xml_path(Path::new("/cache/xml"), "foo", "setup.exe");
        assert_eq!(p, Path::new("/cache/xml/foo/setup.exe.xml"));
        let p2 = xml_path(Path::new("/cache/xml"), "", "setup.exe");
        assert_eq!(p2, Path::new("/cache/xml/setup.exe.xml"));
    }
}
