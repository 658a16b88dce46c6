//! Small shared helpers: file hashing, human readable sizes and ETAs,
//! JSON file IO and permission/mtime adjustment.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};

/// Streaming md5 of a whole file, hex encoded.
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut f = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        match f.read(&mut buf)? {
            0 => break,
            n => hasher.update(&buf[..n]),
        }
    }
    Ok(hex(&hasher.finalize()))
}

/// md5 of `len` bytes starting at `offset`.
pub fn file_md5_range(path: &Path, offset: u64, len: u64) -> std::io::Result<String> {
    let mut f = fs::File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut hasher = Md5::new();
    let mut remaining = len;
    let mut buf = [0u8; 1024 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = f.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shorter than hashed range",
            ));
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex(&hasher.finalize()))
}

pub fn chunk_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

/// CRC32 of a byte range of a file, formatted like zip stores it.
pub fn file_crc32_range(path: &Path, offset: u64, len: u64) -> std::io::Result<String> {
    let mut f = fs::File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = len;
    let mut buf = [0u8; 1024 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = f.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

pub fn file_crc32(path: &Path) -> std::io::Result<String> {
    let len = fs::metadata(path)?.len();
    file_crc32_range(path, 0, len)
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// "123.45 MB" style size string.
pub fn size_string(bytes: u64) -> String {
    let mut value = bytes as f64 / 1048576.0;
    let mut unit = "MB";
    for next in ["GB", "TB", "PB"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", value, unit)
}

/// hh:mm:ss, or mm:ss below one hour.
pub fn eta_string(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// "12.34MB/s" / "56.78kB/s".
pub fn rate_string(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 1048576.0 {
        format!("{:.2}MB/s", bytes_per_sec / 1048576.0)
    } else {
        format!("{:.2}kB/s", bytes_per_sec / 1024.0)
    }
}

pub fn read_json_file(path: &Path) -> Option<serde_json::Value> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Tightens a sensitive file to owner read/write. No-op off unix or when
/// the user asked to respect their umask.
pub fn restrict_permissions(path: &Path, respect_umask: bool) -> std::io::Result<()> {
    if respect_umask {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Applies zip external-attribute mode bits to an extracted file.
#[cfg(unix)]
pub fn set_mode_bits(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode & 0o777);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn set_mode_bits(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Sets a file's modification time from unix seconds.
pub fn set_file_mtime(path: &Path, unix_secs: i64) -> std::io::Result<()> {
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(unix_secs, 0))
}

pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn md5_matches_known_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(file_md5(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn ranged_md5_matches_slice() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);
        assert_eq!(file_md5_range(&path, 2, 3).unwrap(), chunk_md5(b"234"));
    }

    #[test]
    fn ranged_md5_past_eof_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        fs::write(&path, b"short").unwrap();
        assert!(file_md5_range(&path, 0, 100).is_err());
    }

    #[test]
    fn crc32_formats_like_zip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        fs::write(&path, b"123456789").unwrap();
        // well-known CRC32 check value
        assert_eq!(file_crc32(&path).unwrap(), "cbf43926");
    }

    #[test]
    fn size_strings() {
        assert_eq!(size_string(10 * 1048576), "10.00 MB");
        assert_eq!(size_string(3 * 1024 * 1048576), "3.00 GB");
    }

    #[test]
    fn eta_strings() {
        assert_eq!(eta_string(Duration::from_secs(59)), "00:59");
        assert_eq!(eta_string(Duration::from_secs(3661)), "1:01:01");
    }
}
