use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "hoist-core-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn write_file(root: &std::path::Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("file has parent")).expect("must create parent");
    fs::write(path, contents).expect("must write file");
}

#[test]
fn parse_manifest_with_bin_map_and_extra_fields() {
    let raw = r#"{
        "name": "npm",
        "version": "999.999.999",
        "description": "a package manager",
        "bin": { "npm": "./bin/npm-cli.js", "npx": "bin/npx-cli.js" },
        "dependencies": { "abbrev": "^2.0.0" },
        "finalize": "lib/cli/exit-handler.json"
    }"#;

    let manifest = PackageManifest::from_json_str(raw).expect("manifest should parse");
    assert_eq!(manifest.name, "npm");
    assert_eq!(manifest.version.to_string(), "999.999.999");
    assert_eq!(manifest.finalize.as_deref(), Some("lib/cli/exit-handler.json"));
    assert_eq!(
        manifest.extra.get("description").and_then(|v| v.as_str()),
        Some("a package manager")
    );

    let commands = manifest.commands().expect("commands should normalize");
    assert_eq!(commands.get("npm").map(String::as_str), Some("bin/npm-cli.js"));
    assert_eq!(commands.get("npx").map(String::as_str), Some("bin/npx-cli.js"));
}

#[test]
fn string_bin_is_named_after_unscoped_package() {
    let raw = r#"{ "name": "@acme/tool", "version": "1.2.3", "bin": "cli.js" }"#;
    let manifest = PackageManifest::from_json_str(raw).expect("manifest should parse");

    assert_eq!(manifest.unscoped_name(), "tool");
    let commands = manifest.commands().expect("commands should normalize");
    assert_eq!(commands.len(), 1);
    assert_eq!(commands.get("tool").map(String::as_str), Some("cli.js"));
    assert_eq!(manifest.tarball_file_name(), "acme-tool-1.2.3.tgz");
}

#[test]
fn manifest_without_bin_declares_no_commands() {
    let manifest = PackageManifest::from_json_str(r#"{ "name": "npm", "version": "1.0.0" }"#)
        .expect("manifest should parse");
    assert!(manifest.commands().expect("commands").is_empty());
    assert_eq!(manifest.tarball_file_name(), "npm-1.0.0.tgz");
}

#[test]
fn manifest_rejects_escaping_bin_paths_and_bad_names() {
    let escaping = r#"{ "name": "x", "version": "1.0.0", "bin": { "x": "../outside.js" } }"#;
    let err = PackageManifest::from_json_str(escaping).expect_err("must reject '..'");
    assert!(format!("{err:#}").contains("must not include '..'"), "unexpected: {err:#}");

    let absolute = r#"{ "name": "x", "version": "1.0.0", "bin": { "x": "/usr/bin/x" } }"#;
    let err = PackageManifest::from_json_str(absolute).expect_err("must reject absolute");
    assert!(format!("{err:#}").contains("must be relative"), "unexpected: {err:#}");

    let nested_command = r#"{ "name": "x", "version": "1.0.0", "bin": { "a/b": "x.js" } }"#;
    let err = PackageManifest::from_json_str(nested_command).expect_err("must reject slash");
    assert!(format!("{err:#}").contains("plain file name"), "unexpected: {err:#}");

    let bad_scope = r#"{ "name": "@acme", "version": "1.0.0" }"#;
    assert!(PackageManifest::from_json_str(bad_scope).is_err());

    let bad_version = r#"{ "name": "x", "version": "latest" }"#;
    assert!(PackageManifest::from_json_str(bad_version).is_err());
}

#[test]
fn pack_then_unpack_reproduces_tree_with_dependencies() {
    let source = test_dir("pack-src");
    write_file(
        &source,
        "package.json",
        r#"{ "name": "npm", "version": "999.999.999", "bin": { "npm": "bin/npm-cli.js" } }"#,
    );
    write_file(&source, "bin/npm-cli.js", "#!/usr/bin/env node\n");
    write_file(&source, "node_modules/abbrev/package.json", "{}");
    write_file(&source, ".git/HEAD", "ref: refs/heads/main\n");

    let (summary, bytes) = pack_to_bytes(&source).expect("pack should succeed");
    assert_eq!(summary.file_name, "npm-999.999.999.tgz");
    assert_eq!(
        summary.files,
        vec![
            "bin/npm-cli.js".to_string(),
            "node_modules/abbrev/package.json".to_string(),
            "package.json".to_string(),
        ]
    );

    let dest = test_dir("pack-dest");
    unpack_tarball(bytes.as_slice(), &dest).expect("unpack should succeed");
    assert!(dest.join("package.json").is_file());
    assert!(dest.join("bin/npm-cli.js").is_file());
    assert!(dest.join("node_modules/abbrev/package.json").is_file());
    assert!(!dest.join(".git").exists());
    assert!(!dest.join("package").exists(), "leading component must be stripped");

    let (_, repacked) = pack_to_bytes(&source).expect("second pack should succeed");
    assert_eq!(bytes, repacked, "packing the same tree is deterministic");

    let _ = fs::remove_dir_all(source);
    let _ = fs::remove_dir_all(dest);
}

#[test]
fn pack_skips_previous_tarball_of_same_version() {
    let source = test_dir("pack-skip");
    write_file(&source, "package.json", r#"{ "name": "tool", "version": "1.0.0" }"#);
    write_file(&source, "tool-1.0.0.tgz", "stale");

    let (summary, _) = pack_to_bytes(&source).expect("pack should succeed");
    assert_eq!(summary.files, vec!["package.json".to_string()]);

    let _ = fs::remove_dir_all(source);
}

#[test]
fn unpack_rejects_parent_dir_entries() {
    let mut bytes = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let contents = b"owned";
        let mut header = tar::Header::new_gnu();
        let name = b"package/../../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append(&header, &contents[..])
            .expect("must append raw entry");
        let encoder = builder.into_inner().expect("must finish tar");
        encoder.finish().expect("must finish gzip");
    }

    let dest = test_dir("unpack-evil");
    let err = unpack_tarball(bytes.as_slice(), &dest).expect_err("must reject '..' entry");
    assert!(format!("{err:#}").contains("unsafe path"), "unexpected: {err:#}");
    assert!(!dest.join("evil.txt").exists());

    let _ = fs::remove_dir_all(dest);
}

#[cfg(unix)]
#[test]
fn unpack_rejects_entries_written_through_chained_symlinks() {
    let mut bytes = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut bytes, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, target) in [("package/s", "."), ("package/x", "s/..")] {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).expect("must set link path");
            header.set_link_name(target).expect("must set link target");
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_cksum();
            builder
                .append(&header, std::io::empty())
                .expect("must append link entry");
        }
        let contents = b"owned";
        let mut header = tar::Header::new_gnu();
        header.set_path("package/x/escaped.txt").expect("must set path");
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append(&header, &contents[..])
            .expect("must append file entry");
        let encoder = builder.into_inner().expect("must finish tar");
        encoder.finish().expect("must finish gzip");
    }

    let root = test_dir("unpack-chained-links");
    let dest = root.join("a").join("b").join("dest");
    fs::create_dir_all(&dest).expect("must create dest");
    let err = unpack_tarball(bytes.as_slice(), &dest).expect_err("must reject link traversal");
    assert!(
        format!("{err:#}").contains("passes through a symlink"),
        "unexpected: {err:#}"
    );
    assert!(!root.join("a").join("b").join("escaped.txt").exists());
    assert!(!root.join("a").join("escaped.txt").exists());

    let _ = fs::remove_dir_all(root);
}

#[test]
fn reserved_command_names_are_rejected() {
    for command in ["node_modules", ".npmrc", ".hoistrc", ".hoist-tmp-npm"] {
        let raw = format!(
            r#"{{ "name": "tool", "version": "1.0.0", "bin": {{ "{command}": "cli.js" }} }}"#
        );
        let err = PackageManifest::from_json_str(&raw)
            .expect_err("reserved command name must be rejected");
        assert!(
            format!("{err:#}").contains("reserved"),
            "unexpected for {command}: {err:#}"
        );
    }
}

#[test]
fn unpack_rejects_corrupt_stream() {
    let dest = test_dir("unpack-corrupt");
    let result = unpack_tarball(&b"definitely not gzip"[..], &dest);
    assert!(result.is_err());
    let _ = fs::remove_dir_all(dest);
}
