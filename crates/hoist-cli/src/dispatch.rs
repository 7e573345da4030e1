use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hoist_core::{pack_to_bytes, PackageManifest};
use hoist_installer::{
    install, installed_packages, repair_namespace, resolve_command, verify_namespace, ApplyReport,
    GlobalNamespace, InstallError, InstallMode, InstallOperation, InstallSource, SearchContext,
};
use hoist_registry::PublishRequest;
use tracing::debug;

use crate::completion::write_completions_script;
use crate::config::ResolvedConfig;
use crate::render::{render_status_line, OutputStyle, TerminalRenderer};
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current();
    run_with_renderer(cli, renderer)
}

pub(crate) fn run_with_renderer(cli: Cli, renderer: TerminalRenderer) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let config = ResolvedConfig::resolve(&cli.global)?;
    match cli.command {
        Commands::Install { source, global } => {
            if !global {
                return Err(anyhow!(
                    "hoist only installs into the global namespace; pass --global (-g)"
                ));
            }
            run_install(&config, &source, renderer)
        }
        Commands::Pack {
            dir,
            pack_destination,
        } => {
            let file_name = run_pack(&package_dir_arg(dir)?, pack_destination.as_deref())?;
            println!("{file_name}");
            Ok(())
        }
        Commands::Publish { dir, tag } => {
            let published = run_publish(&config, &package_dir_arg(dir)?, &tag)?;
            renderer.print_status("ok", &format!("+ {published}"));
            Ok(())
        }
        Commands::Which { command } => {
            let namespace = config.namespace();
            match resolve_command(&command, &SearchContext::namespace_first(&namespace))? {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => Err(anyhow!("command not found: {command}")),
            }
        }
        Commands::Ls { global } => {
            if !global {
                debug!("ls always lists the global namespace");
            }
            let namespace = config.namespace();
            renderer.print_lines(&format_ls_lines(&namespace)?);
            Ok(())
        }
        Commands::Doctor { fix } => run_doctor(&config.namespace(), fix, renderer),
        Commands::Prefix => {
            println!("{}", config.prefix.display());
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn package_dir_arg(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("failed to read current directory"),
    }
}

fn run_install(config: &ResolvedConfig, source: &str, renderer: TerminalRenderer) -> Result<()> {
    let source = InstallSource::parse(source)?;
    let operation = InstallOperation::new(source.clone(), config.namespace())
        .with_cache(config.tarball_cache());
    let backend = config.registry_backend()?;

    let spinner = renderer.start_spinner("install", &source.to_string());
    match install(operation, backend.source()) {
        Ok(report) => {
            spinner.finish_success();
            renderer.print_lines(&format_install_lines(&report, renderer.style()));
            Ok(())
        }
        Err(InstallError::Finalization { report, error }) => {
            spinner.finish_abandon();
            renderer.eprint_status(
                "warn",
                &format!(
                    "{}@{} was installed but its finalization hook failed ({} step)",
                    report.name(),
                    report.version(),
                    error.step
                ),
            );
            Err(anyhow::Error::new(error))
        }
        Err(InstallError::Apply(failure)) => {
            spinner.finish_abandon();
            let step = failure.step;
            let err = anyhow::Error::new(failure);
            if step.after_mutation() {
                Err(err.context("namespace may be partially updated; run `hoist doctor --fix`"))
            } else {
                Err(err)
            }
        }
    }
}

pub(crate) fn format_install_lines(report: &ApplyReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    let verb = match report.mode {
        InstallMode::Fresh => "added",
        InstallMode::Replace => "changed",
        InstallMode::SelfReplace => "replaced running",
    };
    lines.push(render_status_line(
        style,
        "ok",
        &format!("{verb} {}@{}", report.name(), report.version()),
    ));
    if let Some(recovered) = &report.recovered {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("recovered interrupted install of {recovered}"),
        ));
    }
    for command in &report.linked_commands {
        lines.push(format!("  linked {command}"));
    }
    for command in &report.removed_commands {
        lines.push(format!("  removed {command}"));
    }
    lines
}

/// Packs `dir` into `destination` (the current directory by default) and
/// returns the tarball's file name.
pub(crate) fn run_pack(dir: &Path, destination: Option<&Path>) -> Result<String> {
    let (summary, bytes) = pack_to_bytes(dir)?;
    let destination = match destination {
        Some(destination) => destination.to_path_buf(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    fs::create_dir_all(&destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    let path = destination.join(&summary.file_name);
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    debug!(
        path = %path.display(),
        files = summary.files.len(),
        unpacked_size = summary.unpacked_size,
        "packed package"
    );
    Ok(summary.file_name)
}

/// Publishes `dir` and returns `name@version`.
pub(crate) fn run_publish(config: &ResolvedConfig, dir: &Path, tag: &str) -> Result<String> {
    let manifest = PackageManifest::load(dir)?;
    let (_, tarball) = pack_to_bytes(dir)?;
    let published = format!("{}@{}", manifest.name, manifest.version);
    let backend = config.registry_backend()?;
    backend
        .publisher()
        .publish(&PublishRequest {
            manifest,
            tarball,
            tag: tag.to_string(),
        })
        .with_context(|| format!("failed to publish {published} to {}", backend.location()))?;
    Ok(published)
}

pub(crate) fn format_ls_lines(namespace: &GlobalNamespace) -> Result<Vec<String>> {
    let mut lines = vec![namespace.module_root().display().to_string()];
    let packages = installed_packages(namespace)?;
    if packages.is_empty() {
        lines.push("`-- (empty)".to_string());
        return Ok(lines);
    }
    let last = packages.len() - 1;
    for (index, package) in packages.iter().enumerate() {
        let branch = if index == last { "`--" } else { "+--" };
        let label = match PackageManifest::load(&namespace.package_dir(package)) {
            Ok(manifest) => format!("{}@{}", manifest.name, manifest.version),
            Err(_) => format!("{package} (invalid manifest)"),
        };
        lines.push(format!("{branch} {label}"));
    }
    Ok(lines)
}

fn run_doctor(namespace: &GlobalNamespace, fix: bool, renderer: TerminalRenderer) -> Result<()> {
    renderer.print_section("doctor");
    println!("prefix bin: {}", namespace.bin_dir().display());
    println!("module root: {}", namespace.module_root().display());

    let problems = verify_namespace(namespace)?;
    if problems.is_empty() {
        renderer.print_status("ok", "namespace is consistent");
        return Ok(());
    }
    for problem in &problems {
        renderer.print_status("warn", &problem.to_string());
    }
    if !fix {
        return Err(anyhow!(
            "found {} problem(s); run `hoist doctor --fix` to repair",
            problems.len()
        ));
    }

    let report = repair_namespace(namespace)?;
    if let Some(marker) = &report.cleared_marker {
        renderer.print_status("ok", &format!("cleared interrupted install marker ({marker})"));
    }
    for package in &report.relinked_packages {
        renderer.print_status("ok", &format!("relinked {package}"));
    }
    for command in &report.removed_commands {
        renderer.print_status("ok", &format!("removed dangling command {command}"));
    }

    let remaining = verify_namespace(namespace)?;
    if remaining.is_empty() {
        renderer.print_status("ok", "namespace repaired");
        Ok(())
    } else {
        for problem in &remaining {
            renderer.print_status("err", &problem.to_string());
        }
        Err(anyhow!("{} problem(s) remain after repair", remaining.len()))
    }
}
