use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Streaming SHA-256 check. A missing file is a mismatch, not an error.
pub fn verify_sha256(path: &Path, expected_hex: &str) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());
    Ok(digest.eq_ignore_ascii_case(expected_hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"abc").unwrap();
        // sha256("abc")
        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_sha256(&path, expected).unwrap());
        assert!(verify_sha256(&path, &expected.to_uppercase()).unwrap());
        assert!(!verify_sha256(&path, &"00".repeat(32)).unwrap());
    }

    #[test]
    fn missing_file_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!verify_sha256(&dir.path().join("nope"), &"00".repeat(32)).unwrap());
    }
}
