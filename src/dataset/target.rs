// SPDX-License-Identifier: PMPL-1.0-or-later

//! Target project handling: function bodies are carved out of the project
//! tree by a [`FunctionCarver`], purified and cached one file per function.
//!
//! The production carver shells out to universal-ctags; tests inject their
//! own carver so the binary is not required.

use crate::dataset::{dir_is_empty, list_files};
use crate::purify::purify_function;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const C_CPP_EXTENSIONS: [&str; 12] = [
    "c", "cc", "cxx", "cpp", "c++", "cp", "h", "hh", "hp", "hpp", "hxx", "h++",
];

/// One function carved out of the project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarvedFunction {
    pub name: String,
    /// Path of the containing file, relative to the project root.
    pub rel_path: String,
    pub source: String,
}

/// Capability seam for the external function splitter.
pub trait FunctionCarver {
    fn carve(&self, project_dir: &Path) -> Result<Vec<CarvedFunction>>;
}

/// Carver backed by universal-ctags.
pub struct CtagsCarver {
    pub ctags_path: PathBuf,
}

impl Default for CtagsCarver {
    fn default() -> Self {
        Self {
            ctags_path: PathBuf::from("ctags"),
        }
    }
}

impl FunctionCarver for CtagsCarver {
    fn carve(&self, project_dir: &Path) -> Result<Vec<CarvedFunction>> {
        let output = Command::new(&self.ctags_path)
            .args([
                "-R",
                "--kinds-C++=f",
                "-u",
                "--fields=-fP+ne",
                "--language-force=c++",
                "--output-format=json",
                "-f",
                "-",
            ])
            .arg(project_dir)
            .output()
            .with_context(|| format!("running {}", self.ctags_path.display()))?;
        if !output.status.success() {
            bail!(
                "ctags exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let mut functions = Vec::new();
        let mut current_file = String::new();
        let mut current_code: Vec<String> = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.is_empty() {
                continue;
            }
            let info: Value = match serde_json::from_str(line) {
                Ok(info) => info,
                Err(err) => {
                    warn!("unparsable ctags record: {err}");
                    continue;
                }
            };
            let Some(path) = info.get("path").and_then(Value::as_str) else {
                continue;
            };
            if path != current_file {
                if !has_c_cpp_extension(Path::new(path)) {
                    continue;
                }
                match fs::read_to_string(path) {
                    Ok(content) => {
                        current_code = content.split('\n').map(str::to_string).collect();
                        current_file = path.to_string();
                    }
                    Err(err) => {
                        warn!("failed to read {path}: {err}");
                        continue;
                    }
                }
            }
            let (Some(name), Some(line_no), Some(end)) = (
                info.get("name").and_then(Value::as_str),
                info.get("line").and_then(Value::as_u64),
                info.get("end").and_then(Value::as_u64),
            ) else {
                continue;
            };
            let start = (line_no as usize).saturating_sub(1);
            let end = (end as usize).min(current_code.len());
            if start >= end {
                continue;
            }

            let mut body_lines = current_code[start..end].to_vec();
            reconstruct_declaration(&mut body_lines, name, info.get("typeref"));
            let rel_path = Path::new(path)
                .strip_prefix(project_dir)
                .unwrap_or(Path::new(path))
                .to_string_lossy()
                .into_owned();
            functions.push(CarvedFunction {
                name: name.to_string(),
                rel_path,
                source: body_lines.join("\n"),
            });
        }
        Ok(functions)
    }
}

/// ctags sometimes reports the declaration line without its return type;
/// rebuild it from the `typeref` field when present.
fn reconstruct_declaration(body_lines: &mut [String], name: &str, typeref: Option<&Value>) {
    let Some(first) = body_lines.first().cloned() else {
        return;
    };
    let func_type = match typeref.and_then(Value::as_str) {
        Some(typeref) => {
            let mut parts = typeref.splitn(2, ':');
            let head = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default();
            let spelled = if head == "typename" {
                rest.to_string()
            } else if rest.is_empty() {
                head.to_string()
            } else {
                format!("{head} {rest}")
            };
            if spelled.ends_with('*') || spelled.ends_with('&') {
                spelled
            } else {
                format!("{spelled} ")
            }
        }
        None => String::new(),
    };
    if let Some((_, tail)) = first.split_once(name) {
        body_lines[0] = format!("{func_type}{name}{tail}");
    }
}

fn has_c_cpp_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| C_CPP_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Cache file name for one carved function: `<name>@@@<rel path with @#@
/// separators>`, percent-escaping `%` and `/`.
fn mangle_cache_name(name: &str, rel_path: &str) -> String {
    let joined = rel_path
        .split(['/', '\\'])
        .collect::<Vec<_>>()
        .join("@#@");
    format!("{name}@@@{joined}")
        .replace('%', "%25")
        .replace('/', "%2F")
}

pub struct TargetProject {
    cache_dir: PathBuf,
    total_carved: usize,
}

impl TargetProject {
    /// Carve, purify and cache the project's functions. A non-empty cache is
    /// reused unless `rebuild` is set.
    pub fn prepare(
        project_dir: &Path,
        processed_root: &Path,
        carver: &dyn FunctionCarver,
        rebuild: bool,
    ) -> Result<Self> {
        if !project_dir.exists() {
            bail!("target project {} does not exist", project_dir.display());
        }
        let project_name = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let cache_dir = processed_root.join(project_name);

        if !rebuild && !dir_is_empty(&cache_dir) {
            info!("using cached target functions");
            let total_carved = list_files(&cache_dir)?.len();
            return Ok(Self {
                cache_dir,
                total_carved,
            });
        }

        fs::remove_dir_all(&cache_dir).ok();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("creating {}", cache_dir.display()))?;

        info!(
            "extracting functions from {} into {}",
            project_dir.display(),
            cache_dir.display()
        );
        let carved = carver.carve(project_dir)?;
        let total_carved = carved.len();
        let mut kept = 0;
        for function in carved {
            let Some(code) = purify_function(&function.source, false) else {
                continue;
            };
            let file_name = mangle_cache_name(&function.name, &function.rel_path);
            debug!("caching target function {file_name}");
            fs::write(cache_dir.join(file_name), code)?;
            kept += 1;
        }
        info!("target project: {kept} functions kept of {total_carved} carved");
        Ok(Self {
            cache_dir,
            total_carved,
        })
    }

    pub fn funcs(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.cache_dir)
    }

    /// Total functions reported by the carver, including discarded ones.
    pub fn total_carved(&self) -> usize {
        self.total_carved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCarver(Vec<CarvedFunction>);

    impl FunctionCarver for StubCarver {
        fn carve(&self, _project_dir: &Path) -> Result<Vec<CarvedFunction>> {
            Ok(self.0.clone())
        }
    }

    const BODY: &str = r#"int copy_data(char *dst, const char *src, int n) {
    int i = 0;
    while (i < n) {
        dst[i] = src[i];
        i++;
    }
    dst[n] = 0;
    return i;
}"#;

    #[test]
    fn caches_purified_functions_under_mangled_names() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        let carver = StubCarver(vec![
            CarvedFunction {
                name: "copy_data".into(),
                rel_path: "src/util.c".into(),
                source: BODY.into(),
            },
            // Too small, discarded by purification.
            CarvedFunction {
                name: "tiny".into(),
                rel_path: "src/util.c".into(),
                source: "int tiny() { return 0; }".into(),
            },
        ]);
        let target = TargetProject::prepare(&project, &dir.path().join("processed"), &carver, true)
            .unwrap();
        let funcs = target.funcs().unwrap();
        assert_eq!(funcs.len(), 1);
        assert_eq!(target.total_carved(), 2);
        let name = funcs[0].file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "copy_data@@@src@#@util.c");
    }

    #[test]
    fn cache_reused_unless_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        let carver = StubCarver(vec![CarvedFunction {
            name: "copy_data".into(),
            rel_path: "a.c".into(),
            source: BODY.into(),
        }]);
        let processed = dir.path().join("processed");
        let first = TargetProject::prepare(&project, &processed, &carver, true).unwrap();
        assert_eq!(first.funcs().unwrap().len(), 1);

        // An empty carver with rebuild=false must serve the old cache.
        let empty = StubCarver(Vec::new());
        let second = TargetProject::prepare(&project, &processed, &empty, false).unwrap();
        assert_eq!(second.funcs().unwrap().len(), 1);

        let third = TargetProject::prepare(&project, &processed, &empty, true).unwrap();
        assert!(third.funcs().unwrap().is_empty());
    }

    #[test]
    fn mangling_escapes_separators() {
        assert_eq!(
            mangle_cache_name("f", "deep/nested/dir/file.c"),
            "f@@@deep@#@nested@#@dir@#@file.c"
        );
        assert_eq!(mangle_cache_name("f", "odd%name.c"), "f@@@odd%25name.c");
    }

    #[test]
    fn declaration_reconstruction_uses_typeref() {
        let mut lines = vec!["copy_data(char *dst) {".to_string()];
        reconstruct_declaration(
            &mut lines,
            "copy_data",
            Some(&Value::String("typename:int".into())),
        );
        assert_eq!(lines[0], "int copy_data(char *dst) {");

        let mut pointer = vec!["lookup(int k) {".to_string()];
        reconstruct_declaration(
            &mut pointer,
            "lookup",
            Some(&Value::String("typename:struct entry *".into())),
        );
        assert_eq!(pointer[0], "struct entry *lookup(int k) {");
    }
}
