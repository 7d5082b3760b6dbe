use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::code;

const HASH_BUF_BYTES: usize = 1024 * 1024;

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for value in bytes {
        output.push_str(format!("{value:02x}").as_str());
    }
    output
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(Sha256::digest(bytes).as_slice())
}

fn read_error(path: &Path, error: std::io::Error) -> AppError {
    AppError::new(code::IO_ERROR, "file read failed")
        .with_detail(format!("{}: {error}", path.display()))
}

/// Full-file streaming digest. Blocking; run it under `run_blocking` from
/// async contexts. Returns `(size, lowercase_hex)`.
pub fn file_sha256_hex(path: &Path) -> AppResult<(u64, String)> {
    let mut file = std::fs::File::open(path).map_err(|error| read_error(path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_BYTES];
    let mut total = 0u64;
    loop {
        let read_count = file
            .read(buffer.as_mut_slice())
            .map_err(|error| read_error(path, error))?;
        if read_count == 0 {
            break;
        }
        total += read_count as u64;
        hasher.update(&buffer[..read_count]);
    }
    Ok((total, hex_encode(hasher.finalize().as_slice())))
}

/// Digest of exactly `[offset, offset + length)`. The caller has already
/// validated the range against the file size.
pub fn range_sha256_hex(path: &Path, offset: u64, length: u64) -> AppResult<String> {
    let mut file = std::fs::File::open(path).map_err(|error| read_error(path, error))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|error| read_error(path, error))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_BYTES];
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(HASH_BUF_BYTES as u64) as usize;
        let read_count = file
            .read(&mut buffer[..want])
            .map_err(|error| read_error(path, error))?;
        if read_count == 0 {
            return Err(AppError::new(code::INVALID_RANGE, "range exceeds file length")
                .with_ctx("remaining", remaining.to_string()));
        }
        hasher.update(&buffer[..read_count]);
        remaining -= read_count as u64;
    }
    Ok(hex_encode(hasher.finalize().as_slice()))
}

/// Feed `[0, prefix_len)` of an already-open file into a running hasher.
/// Both transfer ends do this before the first new chunk so the final
/// digest covers the whole file, not just the transmitted suffix. Leaves
/// the file cursor at `prefix_len`.
pub async fn seed_prefix(
    file: &mut tokio::fs::File,
    prefix_len: u64,
    hasher: &mut Sha256,
) -> AppResult<()> {
    use tokio::io::AsyncSeekExt;

    file.seek(SeekFrom::Start(0)).await.map_err(|error| {
        AppError::new(code::IO_ERROR, "seek failed").with_detail(error.to_string())
    })?;

    let mut buffer = vec![0u8; HASH_BUF_BYTES];
    let mut remaining = prefix_len;
    while remaining > 0 {
        let want = remaining.min(HASH_BUF_BYTES as u64) as usize;
        let read_count = file.read(&mut buffer[..want]).await.map_err(|error| {
            AppError::new(code::IO_ERROR, "prefix read failed").with_detail(error.to_string())
        })?;
        if read_count == 0 {
            return Err(AppError::new(code::IO_ERROR, "file shorter than resume prefix")
                .with_ctx("remaining", remaining.to_string()));
        }
        hasher.update(&buffer[..read_count]);
        remaining -= read_count as u64;
    }
    Ok(())
}
