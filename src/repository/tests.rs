use super::*;
use std::fs;
use tempfile::TempDir;

fn setup() -> (TempDir, Repository) {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repository::init(&temp_dir.path().join("repo")).unwrap();
    (temp_dir, repo)
}

fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

#[test]
fn test_init_writes_uuid_config() {
    let (_tmp, repo) = setup();
    let uuid = repo.config_value("uuid").unwrap();
    assert_eq!(uuid.len(), 36);

    // Reopening reads the same config back.
    let reopened = Repository::open(repo.path()).unwrap();
    assert_eq!(reopened.config_value("uuid"), Some(uuid));
}

#[test]
fn test_init_refuses_non_empty_dir() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("stray"), "x").unwrap();
    assert!(Repository::init(temp_dir.path()).is_err());
}

#[test]
fn test_open_requires_config() {
    let temp_dir = TempDir::new().unwrap();
    assert!(Repository::open(temp_dir.path()).is_err());
}

#[test]
fn test_config_syntax_error_names_line() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join(CONFIG_FILE),
        "# comment\nuuid=abc\nbroken line\n",
    )
    .unwrap();
    let err = Repository::open(temp_dir.path()).unwrap_err();
    assert!(err.to_string().contains("line 3"));
}

#[test]
fn test_add_empty_file() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "empty", b"");

    let (hash, was_new) = repo.add(&source).unwrap();
    assert!(was_new);
    assert_eq!(hash, sha256(b""));
    assert!(repo.blob_path(&hash).is_file());
    assert!(repo.tree_path(&hash).is_file());
    assert!(repo.parity_path(&hash).is_file());
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::AllOk);
}

#[test]
fn test_add_one_short_block() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "a", b"A");

    let (hash, _) = repo.add(&source).unwrap();
    assert_eq!(hash, sha256(b"A"));

    // Sidecar holds a single level-0 leaf with a 1-byte payload.
    let tree_bytes = fs::read(repo.tree_path(&hash)).unwrap();
    assert_eq!(tree_bytes.len(), 41);
    assert_eq!(tree_bytes[0], 0);
    assert_eq!(i64::from_le_bytes(tree_bytes[1..9].try_into().unwrap()), 1);
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::AllOk);
}

#[test]
fn test_add_is_sharded_and_idempotent() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![7u8; 5000]);

    let (hash, was_new) = repo.add(&source).unwrap();
    assert!(was_new);
    let (again, was_new) = repo.add(&source).unwrap();
    assert_eq!(hash, again);
    assert!(!was_new);

    let hex = hex::encode(hash);
    let blob = repo.blob_path(&hash);
    assert!(blob.ends_with(
        PathBuf::from(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..6])
            .join(&hex)
    ));
}

#[test]
fn test_add_detects_size_collision() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", b"hello world");
    let (hash, _) = repo.add(&source).unwrap();

    // Grow the stored blob behind the repository's back; re-adding the
    // same content must now fail instead of silently overwriting.
    let blob = repo.blob_path(&hash);
    let mut stored = fs::read(&blob).unwrap();
    stored.extend_from_slice(b"!!");
    fs::write(&blob, stored).unwrap();
    assert!(matches!(
        repo.add(&source),
        Err(FilemassError::Integrity(_))
    ));
}

#[test]
fn test_error_check_missing_entry() {
    let (_tmp, repo) = setup();
    let absent = sha256(b"never added");
    assert_eq!(
        repo.error_check(&absent).unwrap(),
        ErrorCheckResult::NotFound
    );
    assert_eq!(repo.error_fix(&absent).unwrap(), ErrorFixResult::NotFound);
}

#[test]
fn test_error_check_flags_flipped_byte() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![0u8; 2048]);
    let (hash, _) = repo.add(&source).unwrap();

    let blob = repo.blob_path(&hash);
    let mut data = fs::read(&blob).unwrap();
    data[512] = 0xff;
    fs::write(&blob, data).unwrap();
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::Error);
}

#[test]
fn test_error_check_flags_truncation_and_growth() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![3u8; 3000]);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);
    let original = fs::read(&blob).unwrap();

    fs::write(&blob, &original[..2500]).unwrap();
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::Error);

    let mut grown = original.clone();
    grown.extend_from_slice(&[9u8; 100]);
    fs::write(&blob, grown).unwrap();
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::Error);
}

#[test]
fn test_error_fix_on_intact_file() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![1u8; 4000]);
    let (hash, _) = repo.add(&source).unwrap();
    assert_eq!(
        repo.error_fix(&hash).unwrap(),
        ErrorFixResult::WasNotBroken
    );
}

#[test]
fn test_error_fix_restores_flipped_byte() {
    let (tmp, repo) = setup();
    // Two full zero blocks, then flip one byte (scenario from the parity
    // design: hash-only substitution finds it).
    let original = vec![0u8; 2048];
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();

    let blob = repo.blob_path(&hash);
    let mut damaged = fs::read(&blob).unwrap();
    damaged[512] = 0xff;
    fs::write(&blob, damaged).unwrap();

    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&blob).unwrap(), original);
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::AllOk);
}

#[test]
fn test_error_fix_restores_any_single_flip() {
    let (tmp, repo) = setup();
    let original: Vec<u8> = (0..3500u32).map(|i| (i % 251) as u8).collect();
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);

    for offset in [0usize, 1023, 1024, 2047, 3499] {
        let mut damaged = original.clone();
        damaged[offset] ^= 0x5a;
        fs::write(&blob, &damaged).unwrap();
        assert_eq!(
            repo.error_fix(&hash).unwrap(),
            ErrorFixResult::Fixed,
            "offset {offset}"
        );
        assert_eq!(fs::read(&blob).unwrap(), original, "offset {offset}");
    }
}

#[test]
fn test_error_fix_restores_swapped_bytes() {
    let (tmp, repo) = setup();
    let original: Vec<u8> = (0..2048u32).map(|i| (i % 199) as u8).collect();
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);

    let mut damaged = original.clone();
    damaged.swap(100, 101);
    fs::write(&blob, &damaged).unwrap();
    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&blob).unwrap(), original);
}

#[test]
fn test_error_fix_regenerates_missing_tree_sidecar() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![4u8; 2500]);
    let (hash, _) = repo.add(&source).unwrap();
    let tree_path = repo.tree_path(&hash);
    let original_sidecar = fs::read(&tree_path).unwrap();

    fs::remove_file(&tree_path).unwrap();
    assert_eq!(
        repo.error_check(&hash).unwrap(),
        ErrorCheckResult::NotFound
    );
    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&tree_path).unwrap(), original_sidecar);
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::AllOk);
}

#[test]
fn test_error_fix_regenerates_missing_parity_sidecar() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![5u8; 2500]);
    let (hash, _) = repo.add(&source).unwrap();
    let parity_path = repo.parity_path(&hash);
    let original_parity = fs::read(&parity_path).unwrap();

    fs::remove_file(&parity_path).unwrap();
    assert_eq!(
        repo.error_fix(&hash).unwrap(),
        ErrorFixResult::WasNotBroken
    );
    assert_eq!(fs::read(&parity_path).unwrap(), original_parity);
}

#[test]
fn test_error_fix_truncates_trailing_sidecar_bytes() {
    let (tmp, repo) = setup();
    let source = write_source(&tmp, "data", &vec![6u8; 2048]);
    let (hash, _) = repo.add(&source).unwrap();
    let tree_path = repo.tree_path(&hash);

    let mut sidecar = fs::read(&tree_path).unwrap();
    let clean_len = sidecar.len();
    sidecar.extend_from_slice(&[0xee; 7]);
    fs::write(&tree_path, sidecar).unwrap();

    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&tree_path).unwrap().len(), clean_len);
    assert_eq!(repo.error_check(&hash).unwrap(), ErrorCheckResult::AllOk);
}

#[test]
fn test_error_fix_truncates_over_long_blob() {
    let (tmp, repo) = setup();
    let original = vec![8u8; 2048];
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);

    let mut grown = original.clone();
    grown.extend_from_slice(&[0xaa; 300]);
    fs::write(&blob, grown).unwrap();

    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&blob).unwrap(), original);
}

#[test]
fn test_error_fix_gives_up_on_truncated_blob() {
    let (tmp, repo) = setup();
    let original = vec![9u8; 2048];
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);

    fs::write(&blob, &original[..1500]).unwrap();
    assert_eq!(
        repo.error_fix(&hash).unwrap(),
        ErrorFixResult::FailedToFix
    );
    // Nothing was written to the damaged blob.
    assert_eq!(fs::read(&blob).unwrap(), &original[..1500]);
}

#[test]
fn test_error_fix_uses_parity_for_heavy_block_damage() {
    let (tmp, repo) = setup();
    let original: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
    let source = write_source(&tmp, "data", &original);
    let (hash, _) = repo.add(&source).unwrap();
    let blob = repo.blob_path(&hash);

    // Wreck a whole block; single-edit search cannot recover this, parity
    // can.
    let mut damaged = original.clone();
    for byte in &mut damaged[1024..2048] {
        *byte = 0xde;
    }
    fs::write(&blob, &damaged).unwrap();

    assert_eq!(repo.error_fix(&hash).unwrap(), ErrorFixResult::Fixed);
    assert_eq!(fs::read(&blob).unwrap(), original);
}

#[test]
fn test_error_fix_reports_mislabeled_tree() {
    let (tmp, repo) = setup();
    let source_a = write_source(&tmp, "a", &vec![1u8; 2048]);
    let source_b = write_source(&tmp, "b", &vec![2u8; 2048]);
    let (hash_a, _) = repo.add(&source_a).unwrap();
    let (hash_b, _) = repo.add(&source_b).unwrap();

    // Replace a's sidecar with b's healthy tree and damage a's blob: the
    // stored tree self-checks but vouches for a different hash, which must
    // not guide a repair.
    fs::copy(repo.tree_path(&hash_b), repo.tree_path(&hash_a)).unwrap();
    let blob_a = repo.blob_path(&hash_a);
    let mut damaged = fs::read(&blob_a).unwrap();
    damaged[0] ^= 0xff;
    fs::write(&blob_a, &damaged).unwrap();

    assert_eq!(
        repo.error_fix(&hash_a).unwrap(),
        ErrorFixResult::FailedToFix
    );
    // The damaged blob was left untouched.
    assert_eq!(fs::read(&blob_a).unwrap(), damaged);
}
