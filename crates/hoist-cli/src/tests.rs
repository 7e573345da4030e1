use super::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use hoist_installer::{resolve_command, GlobalNamespace, SearchContext};

use crate::completion::write_completions_script;
use crate::config::ResolvedConfig;
use crate::dispatch::{format_ls_lines, run_pack, run_with_renderer};
use crate::render::{render_section_header, render_status_line, OutputStyle, TerminalRenderer};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "hoist-cli-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn write_package(dir: &Path, manifest: &str, files: &[(&str, &str)]) {
    fs::create_dir_all(dir).expect("must create package dir");
    fs::write(dir.join("package.json"), manifest).expect("must write manifest");
    for (relative, contents) in files {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("must create parent");
        }
        fs::write(path, contents).expect("must write package file");
    }
}

/// Runs `hoist <args>` against a sandbox prefix, registry, cache and config.
fn run_in(root: &Path, args: &[&str]) -> anyhow::Result<()> {
    let prefix = root.join("prefix").display().to_string();
    let registry = root.join("registry").display().to_string();
    let cache = root.join("cache").display().to_string();
    let userconfig = root.join("hoistrc").display().to_string();
    let mut argv = vec!["hoist"];
    argv.extend_from_slice(args);
    argv.extend_from_slice(&[
        "--prefix",
        &prefix,
        "--registry",
        &registry,
        "--cache",
        &cache,
        "--userconfig",
        &userconfig,
    ]);
    let cli = Cli::try_parse_from(argv).expect("command must parse");
    run_with_renderer(cli, TerminalRenderer::from_style(OutputStyle::Plain))
}

fn namespace_in(root: &Path) -> GlobalNamespace {
    GlobalNamespace::for_prefix(root.join("prefix"))
}

fn bin_only(namespace: &GlobalNamespace) -> SearchContext {
    SearchContext::Dirs(vec![namespace.bin_dir().to_path_buf()])
}

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<HashMap<_, _>>();
    move |key| map.get(key).cloned()
}

#[test]
fn install_parses_global_flag_and_trailing_global_args() {
    let cli = Cli::try_parse_from(["hoist", "install", "-g", "npm@latest", "--prefix", "/opt/h"])
        .expect("command must parse");
    assert_eq!(cli.global.prefix.as_deref(), Some(Path::new("/opt/h")));
    match cli.command {
        Commands::Install { source, global } => {
            assert_eq!(source, "npm@latest");
            assert!(global);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn verbose_flag_counts_occurrences() {
    let cli = Cli::try_parse_from(["hoist", "-vv", "prefix"]).expect("command must parse");
    assert_eq!(cli.global.verbose, 2);
    assert!(matches!(cli.command, Commands::Prefix));
}

#[test]
fn publish_tag_defaults_to_latest() {
    let cli = Cli::try_parse_from(["hoist", "publish", "pkg"]).expect("command must parse");
    match cli.command {
        Commands::Publish { dir, tag } => {
            assert_eq!(dir.as_deref(), Some(Path::new("pkg")));
            assert_eq!(tag, "latest");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn install_requires_a_source() {
    let err = Cli::try_parse_from(["hoist", "install", "-g"]).expect_err("source is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn config_prefers_flags_then_env_then_user_config() {
    let root = test_root("config");
    let rc = root.join("hoistrc");
    fs::write(
        &rc,
        "prefix = /from/config\nregistry = https://config.example/\ncache = /config/cache\n",
    )
    .expect("write rc");

    let args = GlobalArgs {
        userconfig: Some(rc.clone()),
        ..GlobalArgs::default()
    };
    let resolved = ResolvedConfig::resolve_with(&args, env_from(&[])).expect("resolve");
    assert_eq!(resolved.prefix, PathBuf::from("/from/config"));
    assert_eq!(resolved.registry, "https://config.example/");
    assert_eq!(resolved.cache_dir, PathBuf::from("/config/cache"));

    let env = env_from(&[
        ("HOIST_PREFIX", "/from/env"),
        ("HOIST_REGISTRY", "https://env.example/"),
    ]);
    let resolved = ResolvedConfig::resolve_with(&args, env).expect("resolve");
    assert_eq!(resolved.prefix, PathBuf::from("/from/env"));
    assert_eq!(resolved.registry, "https://env.example/");

    let args = GlobalArgs {
        prefix: Some(PathBuf::from("/from/flag")),
        registry: Some("https://flag.example/".to_string()),
        userconfig: Some(rc),
        ..GlobalArgs::default()
    };
    let env = env_from(&[("HOIST_PREFIX", "/from/env")]);
    let resolved = ResolvedConfig::resolve_with(&args, env).expect("resolve");
    assert_eq!(resolved.prefix, PathBuf::from("/from/flag"));
    assert_eq!(resolved.registry, "https://flag.example/");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn config_defaults_cache_under_prefix_and_reads_home_rc() {
    let root = test_root("config-default");
    fs::write(root.join(".hoistrc"), "registry = https://home.example/\n").expect("write rc");
    let home_key = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    let home = root.display().to_string();
    let args = GlobalArgs {
        prefix: Some(root.join("prefix")),
        ..GlobalArgs::default()
    };

    let resolved = ResolvedConfig::resolve_with(&args, env_from(&[(home_key, home.as_str())]))
        .expect("resolve");
    assert_eq!(resolved.registry, "https://home.example/");
    assert_eq!(resolved.cache_dir, root.join("prefix").join("cache"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "added npm@10.0.0"),
        "added npm@10.0.0"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "added npm@10.0.0"),
        "[OK] added npm@10.0.0"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "marker cleared"),
        "[WARN] marker cleared"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "still broken"),
        "[ERR] still broken"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "info", "checking"),
        "[..] checking"
    );
}

#[test]
fn section_headers_only_render_in_rich_mode() {
    assert_eq!(render_section_header(OutputStyle::Plain, "doctor"), None);
    assert_eq!(
        render_section_header(OutputStyle::Rich, "doctor").as_deref(),
        Some("== doctor ==")
    );
}

#[test]
fn completions_script_names_the_binary() {
    let mut script = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut script).expect("completions");
    let script = String::from_utf8(script).expect("utf8");
    assert!(script.contains("hoist"));
    assert!(script.contains("install"));
}

#[test]
fn install_without_global_flag_is_rejected() {
    let root = test_root("no-global");
    let err = run_in(&root, &["install", "npm"]).expect_err("must require --global");
    assert!(err.to_string().contains("--global"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn pack_then_install_links_commands_into_prefix() {
    let root = test_root("pack-install");
    let package = root.join("src").join("tool");
    write_package(
        &package,
        r#"{ "name": "@acme/tool", "version": "1.2.3", "bin": { "tool": "bin/tool.js" } }"#,
        &[("bin/tool.js", "#!/bin/sh\necho tool\n")],
    );

    let out = root.join("out");
    let file_name = run_pack(&package, Some(&out)).expect("pack");
    assert_eq!(file_name, "acme-tool-1.2.3.tgz");

    let tarball = out.join(&file_name).display().to_string();
    run_in(&root, &["install", "-g", &tarball]).expect("install");

    let namespace = namespace_in(&root);
    let resolved = resolve_command("tool", &bin_only(&namespace))
        .expect("resolve")
        .expect("tool must be linked");
    if cfg!(unix) {
        let package_dir =
            fs::canonicalize(namespace.package_dir("@acme/tool")).expect("package dir");
        assert!(resolved.starts_with(&package_dir));
    }

    let lines = format_ls_lines(&namespace).expect("ls");
    assert_eq!(lines[1], "`-- @acme/tool@1.2.3");

    run_in(&root, &["doctor"]).expect("namespace is consistent");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn publish_to_directory_registry_then_install_by_name() {
    let root = test_root("publish");
    let package = root.join("src").join("npm");
    write_package(
        &package,
        r#"{ "name": "npm", "version": "999.999.999" }"#,
        &[],
    );
    let dir = package.display().to_string();
    run_in(&root, &["publish", &dir]).expect("publish");

    run_in(&root, &["install", "--global", "npm@latest"]).expect("install by tag");
    let namespace = namespace_in(&root);
    let lines = format_ls_lines(&namespace).expect("ls");
    assert_eq!(lines[1], "`-- npm@999.999.999");
    assert!(root
        .join("cache")
        .join("tarballs")
        .join("npm")
        .join("999.999.999.tgz")
        .is_file());

    let _ = fs::remove_dir_all(root);
}

#[test]
fn finalization_failure_reports_loader_message_verbatim() {
    let root = test_root("lazy");
    let package = root.join("src").join("npm");
    write_package(
        &package,
        r#"{ "name": "npm", "version": "999.999.999", "bin": { "npm": "bin/npm-cli.js" },
             "finalize": "lib/cli/exit-handler.json" }"#,
        &[
            ("bin/npm-cli.js", "#!/bin/sh\necho npm\n"),
            (
                "lib/cli/exit-handler.json",
                r#"{ "defer": ["./LAZY_REQUIRE_CANARY"] }"#,
            ),
        ],
    );
    let file_name = run_pack(&package, Some(&root.join("out"))).expect("pack");
    let tarball = root.join("out").join(file_name).display().to_string();

    let err = run_in(&root, &["install", "-g", &tarball]).expect_err("hook must fail");
    assert_eq!(format!("{err:#}"), "Cannot find module './LAZY_REQUIRE_CANARY'");

    // The package stays installed, so the command is still reachable.
    let namespace = namespace_in(&root);
    assert!(resolve_command("npm", &bin_only(&namespace))
        .expect("resolve")
        .is_some());

    let err = run_in(&root, &["install", "-g", &tarball]).expect_err("retry fails identically");
    assert_eq!(format!("{err:#}"), "Cannot find module './LAZY_REQUIRE_CANARY'");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn install_of_missing_tarball_names_the_failed_step() {
    let root = test_root("missing");
    let missing = root.join("nope.tgz").display().to_string();
    let err = run_in(&root, &["install", "-g", &missing]).expect_err("must fail");
    let rendered = format!("{err:#}");
    assert!(rendered.starts_with("install failed during fetch: failed to read tarball"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn which_errors_for_unknown_command() {
    let root = test_root("which");
    let err = run_in(&root, &["which", "hoist-definitely-missing-command"])
        .expect_err("must not resolve");
    assert!(err.to_string().contains("command not found"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn ls_reports_empty_namespace() {
    let root = test_root("ls-empty");
    let namespace = namespace_in(&root);
    let lines = format_ls_lines(&namespace).expect("ls");
    assert_eq!(
        lines,
        vec![
            namespace.module_root().display().to_string(),
            "`-- (empty)".to_string()
        ]
    );
    let _ = fs::remove_dir_all(root);
}
