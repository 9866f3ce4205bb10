//! Multi-file storage round trip (the four-file reference layout).
//!
//! Run with: cargo test --test storage_test

use std::fs;
use std::path::PathBuf;

use tswift::storage::{Storage, MULTIFILE_PATHNAME};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tswift_st_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

const FILES: [(&str, u64); 4] = [
    ("files/a.tst", 100),
    ("files/b.tst", 200),
    ("files/c.tst", 1024),
    ("files/d.tst", 5 * 1024),
];

/// Build the swarm byte space: spec prefix followed by the concatenated
/// files. The spec size counts its own digits, fixed-point style.
fn build_asset() -> (Vec<u8>, u64) {
    let mut body = String::new();
    for (path, size) in FILES {
        body.push_str(&format!("{path} {size}\n"));
    }
    let without_digits = MULTIFILE_PATHNAME.len() + 1 + 1 + body.len();
    let mut spec_size = without_digits;
    loop {
        let digits = spec_size.to_string().len();
        if without_digits + digits == spec_size {
            break;
        }
        spec_size = without_digits + digits;
    }
    let spec = format!("{MULTIFILE_PATHNAME} {spec_size}\n{body}");
    assert_eq!(spec.len(), spec_size);

    let mut asset = spec.into_bytes();
    for (i, (_, size)) in FILES.iter().enumerate() {
        let fill = b'A' + i as u8;
        asset.extend(std::iter::repeat(fill).take(*size as usize));
    }
    (asset, spec_size as u64)
}

#[test]
fn test_multifile_write_then_read() {
    let dir = temp_dir("roundtrip");
    let (asset, spec_size) = build_asset();
    let swarm_path = dir.join("swarm.mfspec");
    let mut storage = Storage::open(&swarm_path, &dir, 0).unwrap();

    // Write the whole byte space in uneven slabs, like chunks would.
    let mut off = 0usize;
    for slab in [200usize, 1000, 64, 3000, 10_000] {
        if off >= asset.len() {
            break;
        }
        let end = asset.len().min(off + slab);
        let n = storage.write(&asset[off..end], off as u64).unwrap();
        assert_eq!(n, end - off);
        off = end;
    }
    assert_eq!(off, asset.len());
    assert!(storage.is_ready());
    assert_eq!(storage.size_from_spec(), Some(asset.len() as u64));

    // Each file materialised with the right bytes.
    let mut expect_start = spec_size;
    for (i, (path, size)) in FILES.iter().enumerate() {
        let on_disk = fs::read(dir.join(path)).unwrap();
        assert_eq!(on_disk.len() as u64, *size, "{path}");
        assert!(on_disk.iter().all(|&b| b == b'A' + i as u8), "{path}");
        // And reading via the global offset returns the same bytes.
        let mut buf = vec![0u8; *size as usize];
        let n = storage.read(&mut buf, expect_start).unwrap();
        assert_eq!(n as u64, *size);
        assert_eq!(buf, on_disk);
        expect_start += size;
    }

    // A read spanning every file boundary reconstructs the asset.
    let mut all = vec![0u8; asset.len()];
    let n = storage.read(&mut all, 0).unwrap();
    assert_eq!(n, asset.len());
    assert_eq!(all, asset);
}

#[test]
fn test_multifile_reopen_from_disk() {
    let dir = temp_dir("reopen");
    let (asset, _) = build_asset();
    let swarm_path = dir.join("swarm.mfspec");
    {
        let mut storage = Storage::open(&swarm_path, &dir, 0).unwrap();
        storage.write(&asset, 0).unwrap();
    }
    // A fresh open recognises the spec file and rebuilds the table.
    let mut storage = Storage::open(&swarm_path, &dir, 0).unwrap();
    assert!(storage.is_ready());
    let mut all = vec![0u8; asset.len()];
    let n = storage.read(&mut all, 0).unwrap();
    assert_eq!(n, asset.len());
    assert_eq!(all, asset);
}

#[test]
fn test_multifile_not_ready_until_spec_done() {
    let dir = temp_dir("notready");
    let (asset, spec_size) = build_asset();
    let swarm_path = dir.join("swarm.mfspec");
    let mut storage = Storage::open(&swarm_path, &dir, 0).unwrap();

    // Half the spec: the store must not accept mid-swarm traffic yet.
    let half = (spec_size / 2) as usize;
    storage.write(&asset[..half], 0).unwrap();
    assert!(!storage.is_ready());
    assert!(storage.write(&asset[8000..8100], 8000).is_err());
    let mut buf = [0u8; 16];
    assert!(storage.read(&mut buf, 0).is_err());

    // Finishing the spec unlocks it.
    storage.write(&asset[half..], half as u64).unwrap();
    assert!(storage.is_ready());
}
