//! Locating the guest runtime's shared library.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tracing::debug;
use xshell::{Shell, cmd};

use crate::{
    TRACE_TARGET,
    error::{Error, Result},
    probe::{Version, parse_version},
};

/// Environment variable that overrides discovery.
pub const LIBRARY_PATH_ENV: &str = "LIBPYTHON_PATH";

#[cfg(target_os = "macos")]
const EXTENSION: &str = "dylib";
#[cfg(not(target_os = "macos"))]
const EXTENSION: &str = "so";

/// Find a usable libpython.
///
/// `LIBPYTHON_PATH` is returned as-is when set. Otherwise `pkg-config` is
/// asked for the `python3` library directory, then a list of well-known
/// prefixes is searched. The highest version found in the first matching
/// directory wins.
///
/// # Errors
/// Returns [`Error::LibraryNotFound`] if nothing matches.
pub fn lib() -> Result<PathBuf> {
    locate(std::env::var_os(LIBRARY_PATH_ENV))
}

fn locate(overridden: Option<OsString>) -> Result<PathBuf> {
    if let Some(path) = overridden.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    if !cfg!(unix) {
        return Err(Error::LibraryNotFound);
    }

    if let Some(found) = pkg_config_libdir("python3").and_then(|dir| find_in(&[dir], EXTENSION)) {
        debug!(target: TRACE_TARGET, path = %found.display(), "found library via pkg-config");
        return Ok(found);
    }
    let found = find_in(&search_paths(), EXTENSION).ok_or(Error::LibraryNotFound)?;
    debug!(target: TRACE_TARGET, path = %found.display(), "found library");
    Ok(found)
}

fn pkg_config(args: &[&str]) -> Option<String> {
    let sh = Shell::new().ok()?;
    cmd!(sh, "pkg-config {args...}")
        .quiet()
        .ignore_stderr()
        .read()
        .ok()
}

fn pkg_config_libdir(package: &str) -> Option<PathBuf> {
    let flags = pkg_config(&["--libs", package]);
    if let Some(dir) = flags.and_then(|flags| libdir_from_flags(&flags)) {
        return Some(dir);
    }
    let dir = pkg_config(&["--variable=libdir", package])?;
    let dir = dir.trim();
    (!dir.is_empty()).then(|| PathBuf::from(dir))
}

/// First `-L` directory in a linker flag list.
fn libdir_from_flags(flags: &str) -> Option<PathBuf> {
    flags
        .split_whitespace()
        .filter_map(|flag| flag.strip_prefix("-L"))
        .find(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if cfg!(target_os = "macos") {
        paths.push("/usr/local/Frameworks/Python.framework/Versions/Current/lib".into());
    }
    if cfg!(target_os = "linux") {
        paths.push("/usr/lib/x86_64-linux-gnu".into());
        paths.push("/usr/lib/aarch64-linux-gnu".into());
    }
    paths.push("/usr/local/lib".into());
    paths.push("/usr/lib".into());
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        paths.push(home.join(".pyenv/versions/*/lib"));
        paths.push(home.join("miniconda3/lib"));
        paths.push(home.join("anaconda3/lib"));
        paths.push(home.join(".local/lib"));
    }
    paths
}

/// Search each prefix (which may itself be a glob) in order and return the
/// preferred library of the first one with any match.
fn find_in(prefixes: &[PathBuf], extension: &str) -> Option<PathBuf> {
    prefixes.iter().find_map(|prefix| {
        let pattern = prefix.join(format!("libpython*.{extension}"));
        let matches = glob::glob(&pattern.to_string_lossy())
            .ok()?
            .filter_map(std::result::Result::ok)
            .filter(|path| path.is_file());
        preferred_version(matches)
    })
}

/// Highest `libpythonX.Y` wins; unversioned names sort last, ties break on
/// the path.
fn preferred_version(paths: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    paths.into_iter().max_by(|a, b| {
        (library_version(a), a.as_path()).cmp(&(library_version(b), b.as_path()))
    })
}

fn library_version(path: &Path) -> Option<Version> {
    let name = path.file_name()?.to_str()?;
    parse_version(name.strip_prefix("libpython")?)
}
