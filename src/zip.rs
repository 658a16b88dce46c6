//! Zip structures of the installer archives.
//!
//! An installer binary is a shell script prelude followed by a zip
//! archive. This module parses the pieces the range-request repository
//! needs: the script/payload sizes announced in the prelude, the end of
//! central directory records (classic and Zip64) and the central
//! directory entries with the extra fields that matter (Zip64 extended
//! info, extended timestamp, Info-ZIP new Unix, which is skipped).
//! Nothing here does IO; callers hand in byte windows they fetched.

use chrono::NaiveDate;
use regex::Regex;

pub const CD_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub const EOCD64_SIGNATURE: u32 = 0x0606_4b50;

const EXTRA_ZIP64: u16 = 0x0001;
const EXTRA_EXTENDED_TIMESTAMP: u16 = 0x5455;
const EXTRA_INFOZIP_UNIX_NEW: u16 = 0x7875;

pub const COMPRESSION_STORE: u16 = 0;
pub const COMPRESSION_DEFLATE: u16 = 8;

/// Little-endian cursor over a byte window.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader { data, pos: 0 }
    }

    fn at(data: &'a [u8], pos: usize) -> ByteReader<'a> {
        ByteReader { data, pos }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    fn skip(&mut self, len: usize) {
        self.pos = (self.pos + len).min(self.data.len());
    }
}

/// Byte length of the shell script prelude, derived from the
/// `offset=`head -n N "$0"`` line: the length of the first N lines.
pub fn mojosetup_script_size(head: &[u8]) -> Option<u64> {
    let text = String::from_utf8_lossy(&head[..head.len().min(16 * 1024)]);
    let re = Regex::new(r#"offset=`head -n (\d+) "\$0""#).expect("static regex");
    let lines: usize = re.captures(&text)?.get(1)?.as_str().parse().ok()?;

    let mut seen = 0usize;
    for (i, b) in head.iter().enumerate() {
        if *b == b'\n' {
            seen += 1;
            if seen == lines {
                return Some((i + 1) as u64);
            }
        }
    }
    None
}

/// Declared archive payload size from the `filesizes="K"` prelude line.
pub fn mojosetup_installer_size(head: &[u8]) -> Option<u64> {
    let text = String::from_utf8_lossy(&head[..head.len().min(16 * 1024)]);
    let re = Regex::new(r#"filesizes="(\d+)""#).expect("static regex");
    re.captures(&text)?.get(1)?.as_str().parse().ok()
}

#[derive(Clone, Debug, Default)]
pub struct ZipEocd {
    pub cd_records_total: u64,
    pub cd_size: u64,
    pub cd_start_offset: u64,
}

/// Scans backwards for a signature. Returns the offset of the signature
/// inside `data`.
pub fn find_signature_backwards(data: &[u8], signature: u32) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    let sig = signature.to_le_bytes();
    (0..=data.len() - 4).rev().find(|&pos| data[pos..pos + 4] == sig)
}

pub fn find_eocd(data: &[u8]) -> Option<usize> {
    find_signature_backwards(data, EOCD_SIGNATURE)
}

pub fn find_eocd64(data: &[u8]) -> Option<usize> {
    find_signature_backwards(data, EOCD64_SIGNATURE)
}

pub fn read_eocd(data: &[u8], pos: usize) -> Option<ZipEocd> {
    let mut r = ByteReader::at(data, pos);
    if r.u32()? != EOCD_SIGNATURE {
        return None;
    }
    r.skip(2); // disk number
    r.skip(2); // cd start disk
    r.skip(2); // cd records on this disk
    let total = r.u16()? as u64;
    let cd_size = r.u32()? as u64;
    let cd_start_offset = r.u32()? as u64;
    Some(ZipEocd {
        cd_records_total: total,
        cd_size,
        cd_start_offset,
    })
}

/// Zip64 EOCD carries the wide versions of the counters; only the fields
/// the classic record saturates are consulted.
pub fn read_eocd64(data: &[u8], pos: usize) -> Option<ZipEocd> {
    let mut r = ByteReader::at(data, pos);
    if r.u32()? != EOCD64_SIGNATURE {
        return None;
    }
    r.u64()?; // record size
    r.skip(2); // version made by
    r.skip(2); // version needed
    r.skip(4); // disk number
    r.skip(4); // cd start disk
    r.u64()?; // cd records on this disk
    let total = r.u64()?;
    let cd_size = r.u64()?;
    let cd_start_offset = r.u64()?;
    Some(ZipEocd {
        cd_records_total: total,
        cd_size,
        cd_start_offset,
    })
}

#[derive(Clone, Debug, Default)]
pub struct ZipCdEntry {
    pub filename: String,
    pub compression_method: u16,
    pub crc32: u32,
    pub comp_size: u64,
    pub uncomp_size: u64,
    /// Relative offset of the local header within the archive.
    pub local_header_offset: u64,
    /// Upper half of the external attributes: unix mode bits.
    pub unix_mode: u16,
    /// Modification time, unix seconds, when a valid one was stored.
    pub timestamp: Option<i64>,
}

/// Reads one central directory entry at the cursor. Also accepts a local
/// file header (used when extracting a downloaded member that still has
/// its header in front).
fn read_cd_entry(r: &mut ByteReader) -> Option<ZipCdEntry> {
    let header = r.u32()?;
    let is_local = header == LOCAL_HEADER_SIGNATURE;
    if !is_local && header != CD_HEADER_SIGNATURE {
        return None;
    }

    let mut entry = ZipCdEntry::default();

    if !is_local {
        r.skip(2); // version made by
    }
    r.skip(2); // version needed
    r.skip(2); // general purpose flags
    entry.compression_method = r.u16()?;
    let mod_time = r.u16()?;
    let mod_date = r.u16()?;
    entry.crc32 = r.u32()?;
    entry.comp_size = r.u32()? as u64;
    entry.uncomp_size = r.u32()? as u64;
    let filename_len = r.u16()? as usize;
    let extra_len = r.u16()? as usize;

    let mut comment_len = 0usize;
    let mut disk_num = 0u32;
    if !is_local {
        comment_len = r.u16()? as usize;
        disk_num = r.u16()? as u32;
        r.skip(2); // internal attributes
        let external = r.u32()?;
        entry.unix_mode = (external >> 16) as u16;
        entry.local_header_offset = r.u32()? as u64;
    }

    entry.filename = String::from_utf8_lossy(r.take(filename_len)?).into_owned();
    entry.timestamp = dos_datetime_to_unix(mod_date, mod_time);

    let extra = r.take(extra_len)?;
    let mut er = ByteReader::new(extra);
    while er.remaining() >= 4 {
        let id = er.u16()?;
        let size = er.u16()? as usize;
        match id {
            EXTRA_ZIP64 => {
                let field_start = er.pos;
                // fields appear only for saturated classic fields
                if entry.uncomp_size == u32::MAX as u64 {
                    entry.uncomp_size = er.u64()?;
                }
                if entry.comp_size == u32::MAX as u64 {
                    entry.comp_size = er.u64()?;
                }
                if entry.local_header_offset == u32::MAX as u64 {
                    entry.local_header_offset = er.u64()?;
                }
                if disk_num == u16::MAX as u32 {
                    er.u32()?;
                }
                er.skip(size.saturating_sub(er.pos - field_start));
            }
            EXTRA_EXTENDED_TIMESTAMP => {
                let field_start = er.pos;
                let flags = er.u8()?;
                if flags & 0x1 != 0 {
                    entry.timestamp = er.u32().map(|t| t as i64);
                }
                if is_local {
                    if flags & 0x2 != 0 {
                        er.u32()?; // access time, unused
                    }
                    if flags & 0x4 != 0 {
                        er.u32()?; // creation time, unused
                    }
                }
                er.skip(size.saturating_sub(er.pos - field_start));
            }
            EXTRA_INFOZIP_UNIX_NEW => {
                // uid/gid are not applied to extracted files
                er.skip(size);
            }
            _ => er.skip(size),
        }
    }

    r.skip(comment_len);
    Some(entry)
}

/// Reads `count` central directory entries starting at `pos`.
pub fn read_cd_entries(data: &[u8], pos: usize, count: u64) -> Vec<ZipCdEntry> {
    let mut r = ByteReader::at(data, pos);
    let mut entries = Vec::new();
    for _ in 0..count {
        match read_cd_entry(&mut r) {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }
    entries
}

/// Parses the local file header in front of a downloaded member.
pub fn read_local_entry(data: &[u8]) -> Option<(ZipCdEntry, usize)> {
    let mut r = ByteReader::new(data);
    let entry = read_cd_entry(&mut r)?;
    Some((entry, r.pos))
}

pub fn dos_datetime_to_unix(date: u16, time: u16) -> Option<i64> {
    let year = ((date & 0xFE00) >> 9) as i32 + 1980;
    let month = ((date & 0x1E0) >> 5) as u32;
    let day = (date & 0x1F) as u32;
    let hour = ((time & 0xF800) >> 11) as u32;
    let minute = ((time & 0x7E0) >> 5) as u32;
    let second = 2 * (time & 0x1F) as u32;

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc().timestamp())
}

pub fn is_symlink(unix_mode: u16) -> bool {
    unix_mode & 0xF000 == 0xA000
}

/// Inflates a member's payload. `store`d members pass through.
pub fn extract_member(data: &[u8], compression_method: u16) -> std::io::Result<Vec<u8>> {
    match compression_method {
        COMPRESSION_STORE => Ok(data.to_vec()),
        COMPRESSION_DEFLATE => {
            use std::io::Read;
            // raw deflate stream, no zlib header or trailing checksum
            let mut decoder = flate2::read::DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported compression method {}", other),
        )),
    }
}

/// A downloadable member of an installer archive, with its byte range
/// inside the installer binary.
#[derive(Clone, Debug, Default)]
pub struct ZipMember {
    pub path: String,
    pub comp_size: u64,
    pub uncomp_size: u64,
    pub crc32: u32,
    pub unix_mode: u16,
    pub compression_method: u16,
    pub timestamp: Option<i64>,
    /// Local-header offset relative to the start of the installer binary.
    pub start_offset: u64,
    /// Inclusive end of the member's byte range.
    pub end_offset: u64,
    pub installer_url: String,
    // split-file bookkeeping
    pub is_split_file: bool,
    pub split_base_path: String,
    pub split_start_offset: u64,
    pub split_end_offset: u64,
}

/// Builds members from central directory entries, rebasing offsets onto
/// the installer binary and assigning each member's end offset from its
/// successor (the last one ends where the central directory starts).
pub fn members_from_entries(
    entries: Vec<ZipCdEntry>,
    zip_start_offset: u64,
    cd_offset_in_installer: u64,
    installer_url: &str,
) -> Vec<ZipMember> {
    let mut members: Vec<ZipMember> = entries
        .into_iter()
        .map(|e| ZipMember {
            path: e.filename,
            comp_size: e.comp_size,
            uncomp_size: e.uncomp_size,
            crc32: e.crc32,
            unix_mode: e.unix_mode,
            compression_method: e.compression_method,
            timestamp: e.timestamp,
            start_offset: zip_start_offset + e.local_header_offset,
            end_offset: 0,
            installer_url: installer_url.to_string(),
            ..ZipMember::default()
        })
        .collect();

    members.sort_by_key(|m| m.start_offset);
    for i in 0..members.len() {
        members[i].end_offset = if i + 1 < members.len() {
            members[i + 1].start_offset.saturating_sub(1)
        } else {
            cd_offset_in_installer.saturating_sub(1)
        };
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn put_u16(v: &mut Vec<u8>, x: u16) {
        v.extend_from_slice(&x.to_le_bytes());
    }
    fn put_u32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_le_bytes());
    }

    /// One synthetic central directory entry.
    fn cd_entry(name: &str, comp: u32, uncomp: u32, offset: u32, mode: u16) -> Vec<u8> {
        let mut v = Vec::new();
        put_u32(&mut v, CD_HEADER_SIGNATURE);
        put_u16(&mut v, 3 << 8); // version made by: unix
        put_u16(&mut v, 20); // version needed
        put_u16(&mut v, 0); // flags
        put_u16(&mut v, COMPRESSION_DEFLATE);
        put_u16(&mut v, 0x6c32); // mod time 13:33:36
        put_u16(&mut v, 0x58c5); // mod date 2024-06-05
        put_u32(&mut v, 0xdeadbeef); // crc32
        put_u32(&mut v, comp);
        put_u32(&mut v, uncomp);
        put_u16(&mut v, name.len() as u16);
        put_u16(&mut v, 0); // extra len
        put_u16(&mut v, 0); // comment len
        put_u16(&mut v, 0); // disk number
        put_u16(&mut v, 0); // internal attrs
        put_u32(&mut v, (mode as u32) << 16); // external attrs
        put_u32(&mut v, offset);
        v.extend_from_slice(name.as_bytes());
        v
    }

    fn eocd(records: u16, cd_size: u32, cd_offset: u32) -> Vec<u8> {
        let mut v = Vec::new();
        put_u32(&mut v, EOCD_SIGNATURE);
        put_u16(&mut v, 0);
        put_u16(&mut v, 0);
        put_u16(&mut v, records);
        put_u16(&mut v, records);
        put_u32(&mut v, cd_size);
        put_u32(&mut v, cd_offset);
        put_u16(&mut v, 0); // comment length
        v
    }

    #[test]
    fn script_prelude_sizes() {
        let head = b"#!/bin/sh\nscript_line_2\noffset=`head -n 3 \"$0\" | wc -c | tr -d \" \"`\nBINARYDATA".to_vec();
        // first 3 lines end right before BINARYDATA
        let size = mojosetup_script_size(&head).unwrap();
        assert_eq!(&head[size as usize..], b"BINARYDATA");

        let head2 = b"#!/bin/sh\nfilesizes=\"123456\"\n".to_vec();
        assert_eq!(mojosetup_installer_size(&head2), Some(123456));
        assert_eq!(mojosetup_script_size(b"no markers here"), None);
    }

    #[test]
    fn eocd_scan_and_parse() {
        let mut tail = vec![0u8; 64]; // junk before
        let cd = [
            cd_entry("data/noarch/a.bin", 100, 200, 0, 0o100644),
            cd_entry("data/noarch/b.bin", 50, 80, 150, 0o100755),
        ]
        .concat();
        let cd_size = cd.len() as u32;
        tail.extend_from_slice(&cd);
        tail.extend_from_slice(&eocd(2, cd_size, 5000));

        let pos = find_eocd(&tail).unwrap();
        let parsed = read_eocd(&tail, pos).unwrap();
        assert_eq!(parsed.cd_records_total, 2);
        assert_eq!(parsed.cd_size, cd_size as u64);
        assert_eq!(parsed.cd_start_offset, 5000);

        let entries = read_cd_entries(&tail, 64, parsed.cd_records_total);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "data/noarch/a.bin");
        assert_eq!(entries[0].comp_size, 100);
        assert_eq!(entries[0].uncomp_size, 200);
        assert_eq!(entries[1].unix_mode, 0o100755);
        assert_eq!(entries[1].local_header_offset, 150);
        assert!(entries[0].timestamp.is_some());
    }

    #[test]
    fn member_end_offsets_chain() {
        let entries = vec![
            {
                let bytes = cd_entry("b", 10, 10, 500, 0o100644);
                read_cd_entries(&bytes, 0, 1).remove(0)
            },
            {
                let bytes = cd_entry("a", 10, 10, 100, 0o100644);
                read_cd_entries(&bytes, 0, 1).remove(0)
            },
        ];
        // zip starts at 1000 inside the installer, cd at 1900
        let members = members_from_entries(entries, 1000, 1900, "http://x/installer.sh");
        assert_eq!(members[0].path, "a");
        assert_eq!(members[0].start_offset, 1100);
        assert_eq!(members[0].end_offset, 1499);
        assert_eq!(members[1].start_offset, 1500);
        assert_eq!(members[1].end_offset, 1899);
    }

    #[test]
    fn symlink_mode_detection() {
        assert!(is_symlink(0o120777));
        assert!(!is_symlink(0o100644));
        assert!(!is_symlink(0o040755));
    }

    #[test]
    fn dos_timestamps() {
        // 2024-06-05 13:33:36 -> date 0x58c5, time 0x6c32
        let ts = dos_datetime_to_unix(0x58c5, 0x6c32).unwrap();
        let dt = chrono::DateTime::from_timestamp(ts, 0).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-06-05 13:33:36");
        // month 0 is invalid
        assert_eq!(dos_datetime_to_unix(0, 0), None);
    }

    #[test]
    fn deflate_member_roundtrip() {
        let payload = b"hello hello hello hello hello";
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(payload).unwrap();
        let compressed = enc.finish().unwrap();

        let out = extract_member(&compressed, COMPRESSION_DEFLATE).unwrap();
        assert_eq!(out, payload);

        let stored = extract_member(payload, COMPRESSION_STORE).unwrap();
        assert_eq!(stored, payload);

        assert!(extract_member(payload, 99).is_err());
    }

    #[test]
    fn zip64_extra_overrides_saturated_fields() {
        let name = "big.bin";
        let mut v = Vec::new();
        put_u32(&mut v, CD_HEADER_SIGNATURE);
        put_u16(&mut v, 3 << 8);
        put_u16(&mut v, 45);
        put_u16(&mut v, 0);
        put_u16(&mut v, COMPRESSION_DEFLATE);
        put_u16(&mut v, 0);
        put_u16(&mut v, 0);
        put_u32(&mut v, 0);
        put_u32(&mut v, u32::MAX); // comp saturated
        put_u32(&mut v, u32::MAX); // uncomp saturated
        put_u16(&mut v, name.len() as u16);
        put_u16(&mut v, 4 + 16); // extra: header + two u64
        put_u16(&mut v, 0);
        put_u16(&mut v, 0);
        put_u16(&mut v, 0);
        put_u32(&mut v, 0);
        put_u32(&mut v, 77); // local header offset
        v.extend_from_slice(name.as_bytes());
        // zip64 extra field: uncomp first, then comp
        put_u16(&mut v, EXTRA_ZIP64);
        put_u16(&mut v, 16);
        v.extend_from_slice(&(5_000_000_000u64).to_le_bytes());
        v.extend_from_slice(&(4_000_000_000u64).to_le_bytes());

        let entries = read_cd_entries(&v, 0, 1);
        assert_eq!(entries[0].uncomp_size, 5_000_000_000);
        assert_eq!(entries[0].comp_size, 4_000_000_000);
        assert_eq!(entries[0].local_header_offset, 77);
    }
}
