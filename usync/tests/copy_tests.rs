//! End-to-end local copy scenarios through the real binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand::{RngCore, SeedableRng};

fn usync() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("usync").unwrap();
    cmd.arg("--quiet");
    cmd
}

fn setup() -> (tempfile::TempDir, tempfile::TempDir) {
    (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap())
}

fn assert_trees_identical(src: &Path, dst: &Path) {
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            assert!(dst_path.is_dir(), "missing directory {:?}", dst_path);
            assert_trees_identical(&src_path, &dst_path);
        } else {
            assert_eq!(
                fs::read(&src_path).unwrap(),
                fs::read(&dst_path).unwrap(),
                "contents differ for {:?}",
                dst_path
            );
        }
    }
}

#[test]
fn check_help() {
    usync().arg("--help").assert().success();
}

#[test]
fn single_file_to_new_path() {
    let (src_dir, dst_dir) = setup();
    let src = src_dir.path().join("hello.txt");
    fs::write(&src, b"Hello!").unwrap();
    let dst = dst_dir.path().join("copy-of-hello.txt");

    usync()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(fs::read(&dst).unwrap(), b"Hello!");
}

#[test]
fn ten_small_files() {
    let (src_dir, dst_dir) = setup();
    for i in 0..10 {
        fs::write(
            src_dir.path().join(format!("f{}", i)),
            format!("File {} content", i),
        )
        .unwrap();
    }
    let dst = dst_dir.path().join("out");

    usync()
        .args([src_dir.path().to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    for i in 0..10 {
        assert_eq!(
            fs::read_to_string(dst.join(format!("f{}", i))).unwrap(),
            format!("File {} content", i)
        );
    }
}

#[test]
fn one_mebibyte_of_random_bytes() {
    let (src_dir, dst_dir) = setup();
    let mut payload = vec![0u8; 1024 * 1024];
    rand::rngs::StdRng::seed_from_u64(42).fill_bytes(&mut payload);
    let src = src_dir.path().join("random.bin");
    fs::write(&src, &payload).unwrap();
    let dst = dst_dir.path().join("random.bin");

    usync()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(fs::read(&dst).unwrap(), payload);
}

#[test]
fn file_size_exactly_one_chunk() {
    let (src_dir, dst_dir) = setup();
    let payload = vec![0x5au8; 4096];
    let src = src_dir.path().join("exact.bin");
    fs::write(&src, &payload).unwrap();
    let dst = dst_dir.path().join("exact.bin");

    usync()
        .args([
            "--chunk-size",
            "4096",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(fs::read(&dst).unwrap(), payload);
}

#[test]
fn one_byte_and_empty_files() {
    let (src_dir, dst_dir) = setup();
    fs::write(src_dir.path().join("one"), b"x").unwrap();
    fs::write(src_dir.path().join("zero"), b"").unwrap();
    let dst = dst_dir.path().join("out");

    usync()
        .args([src_dir.path().to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(fs::read(dst.join("one")).unwrap(), b"x");
    assert_eq!(fs::metadata(dst.join("zero")).unwrap().len(), 0);
}

#[test]
fn more_files_than_queue_depth() {
    let (src_dir, dst_dir) = setup();
    for i in 0..20 {
        fs::write(src_dir.path().join(format!("f{:02}", i)), vec![i as u8; 500]).unwrap();
    }
    let dst = dst_dir.path().join("out");

    usync()
        .args([
            "--queue-depth",
            "4",
            src_dir.path().to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_trees_identical(src_dir.path(), &dst);
}

#[test]
fn nested_tree_reproduced() {
    let (src_dir, dst_dir) = setup();
    let src = src_dir.path();
    fs::create_dir_all(src.join("a/b/c")).unwrap();
    fs::write(src.join("a/level_a.txt"), b"A").unwrap();
    fs::write(src.join("a/b/level_b.txt"), b"B").unwrap();
    fs::write(src.join("a/b/c/deep.txt"), b"deep").unwrap();
    let dst = dst_dir.path().join("out");

    usync()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_trees_identical(src, &dst);
    for dir in ["a", "a/b", "a/b/c"] {
        let mode = fs::metadata(dst.join(dir)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o700, 0o700, "{} mode {:o}", dir, mode);
    }
}

#[test]
fn names_with_spaces_dashes_unicode() {
    let (src_dir, dst_dir) = setup();
    let src = src_dir.path();
    fs::create_dir_all(src.join("with space")).unwrap();
    fs::write(src.join("with space/da-sh_under.txt"), b"1").unwrap();
    fs::write(src.join("ファイル.bin"), b"2").unwrap();
    let dst = dst_dir.path().join("out");

    usync()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_trees_identical(src, &dst);
}

#[test]
fn permission_bits_preserved() {
    let (src_dir, dst_dir) = setup();
    let src = src_dir.path().join("tool.sh");
    fs::write(&src, b"#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();
    let dst = dst_dir.path().join("tool.sh");

    usync()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);
}

#[test]
fn no_splice_path() {
    let (src_dir, dst_dir) = setup();
    fs::write(src_dir.path().join("buffered.bin"), vec![3u8; 300_000]).unwrap();
    let dst = dst_dir.path().join("out");

    usync()
        .args([
            "--no-splice",
            src_dir.path().to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(fs::read(dst.join("buffered.bin")).unwrap(), vec![3u8; 300_000]);
}

#[test]
fn sync_mode() {
    let (src_dir, dst_dir) = setup();
    fs::write(src_dir.path().join("s.bin"), vec![8u8; 100_000]).unwrap();
    let dst = dst_dir.path().join("out");

    usync()
        .args([
            "--sync",
            src_dir.path().to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(fs::read(dst.join("s.bin")).unwrap(), vec![8u8; 100_000]);
}

#[test]
fn multiple_workers() {
    let (src_dir, dst_dir) = setup();
    for i in 0..40 {
        fs::write(src_dir.path().join(format!("w{}", i)), vec![i as u8; 2048]).unwrap();
    }
    let dst = dst_dir.path().join("out");

    usync()
        .args([
            "-j",
            "3",
            src_dir.path().to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_trees_identical(src_dir.path(), &dst);
}

#[test]
fn missing_source_exits_nonzero() {
    use predicates::prelude::*;
    let (_src_dir, dst_dir) = setup();
    usync()
        .args(["/nonexistent/usync-test-path", dst_dir.path().to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("usync:"));
}

#[test]
fn missing_arguments_exit_nonzero() {
    usync().assert().failure();
}
