// Copyright (c) The NotebookValidator Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Image recipe selection and synthesis.
//!
//! The same fallback order drives both the local selection over a checkout
//! (used for warnings and for S2I input shaping) and the inline shell script
//! embedded into the pipeline's generate-dockerfile task.

use std::fs;
use std::path::{Component, Path, PathBuf};

use nbv_crds::BuildSettings;

use crate::error::{Error, Result};

const APP_DIR: &str = "/opt/app-root/src";
const EXECUTOR_PACKAGES: &str = "papermill jupyter nbformat";
const LARGE_REQUIREMENTS_BYTES: u64 = 100 * 1024;

/// Where the recipe came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipeSource {
    /// An existing Dockerfile inside the checkout, used verbatim.
    Existing(PathBuf),
    Generated,
}

#[derive(Clone, Debug)]
pub struct Synthesis {
    pub content: String,
    pub source: RecipeSource,
    pub requirements: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Join a user-supplied relative path onto the checkout root, rejecting
/// absolute paths, leading `..`, and anything that escapes the root after
/// lexical normalization.
pub fn safe_join(root: &Path, candidate: &str) -> Result<PathBuf> {
    let path = Path::new(candidate);
    if path.is_absolute() {
        return Err(Error::UnsafePath(candidate.to_string()));
    }

    let mut normalized = PathBuf::new();
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(Error::UnsafePath(candidate.to_string()));
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafePath(candidate.to_string()));
            }
        }
    }

    let joined = root.join(normalized);
    if !joined.starts_with(root) {
        return Err(Error::UnsafePath(candidate.to_string()));
    }

    Ok(joined)
}

/// Validate a spec-supplied path without touching a checkout: it must stay
/// inside whatever root it is later joined onto.
pub fn ensure_relative(candidate: &str) -> Result<()> {
    safe_join(Path::new("/workspace/source"), candidate).map(|_| ())
}

/// Pick or generate the image recipe for a checked-out tree.
pub fn synthesize(build: &BuildSettings, notebook_path: &str, root: &Path) -> Result<Synthesis> {
    let mut warnings = vec![];

    let dockerfile = existing_dockerfile(build, root)?;
    let requirements = locate_requirements(build, notebook_path, root)?;

    if dockerfile.is_some() && requirements.is_some() {
        warnings.push("both a Dockerfile and a requirements file are present in the checkout".to_string());
    }
    if let Some(path) = &requirements {
        if let Ok(metadata) = fs::metadata(path) {
            if metadata.len() > LARGE_REQUIREMENTS_BYTES {
                warnings.push(format!("requirements file {} is unusually large", path.display()));
            }
        }
    }

    // Existing Dockerfile wins when the user prefers it, when requirements
    // generation is switched off, or when there is nothing to generate from.
    let use_existing = dockerfile.is_some()
        && (build.prefer_dockerfile() || !build.auto_generate_requirements() || requirements.is_none());

    if use_existing {
        let path = dockerfile.unwrap();
        let content = fs::read_to_string(&path).map_err(Error::IoError)?;
        if content.contains("pip install") && !content.contains("--no-cache-dir") {
            warnings.push(format!("{} runs pip install without --no-cache-dir", path.display()));
        }
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        return Ok(Synthesis { content, source: RecipeSource::Existing(relative), requirements, warnings });
    }

    let requirements_rel = build
        .auto_generate_requirements()
        .then_some(requirements.as_ref())
        .flatten()
        .map(|path| path.strip_prefix(root).unwrap_or(path).to_path_buf());
    let content = generate(&build.base_image(), requirements_rel.as_deref());

    Ok(Synthesis { content, source: RecipeSource::Generated, requirements: requirements_rel, warnings })
}

/// Render a reproducible Dockerfile from the base image and an optional
/// requirements file.
pub fn generate(base_image: &str, requirements: Option<&Path>) -> String {
    let mut lines = vec![
        format!("FROM {base_image}"),
        String::new(),
        format!("WORKDIR {APP_DIR}"),
        String::new(),
        format!("RUN pip install --no-cache-dir {EXECUTOR_PACKAGES}"),
    ];

    if let Some(requirements) = requirements {
        lines.push(String::new());
        lines.push(format!("COPY {} ./requirements.txt", requirements.display()));
        lines.push("RUN pip install --no-cache-dir -r requirements.txt".to_string());
    }

    lines.push(String::new());
    lines.push(format!("COPY . {APP_DIR}"));
    lines.push(String::new());

    lines.join("\n")
}

/// The inline script run by the pipeline's generate-dockerfile task. Tekton
/// substitutes the `$(params.*)` and `$(workspaces.*)` references before the
/// shell sees the text; the fallback order matches [`synthesize`].
pub fn task_script() -> String {
    let generated = generate("$(params.base-image)", None);
    format!(
        r#"#!/usr/bin/env sh
set -e
cd "$(workspaces.source.path)"

if [ -n "$(params.dockerfile-path)" ] && [ -f "$(params.dockerfile-path)" ]; then
  cp "$(params.dockerfile-path)" ./Dockerfile
elif [ -f ./Dockerfile ]; then
  :
elif [ -f ./Containerfile ]; then
  cp ./Containerfile ./Dockerfile
else
  cat > ./Dockerfile <<'NBV_EOF'
{generated}
NBV_EOF
  if [ -f ./requirements.txt ]; then
    cat >> ./Dockerfile <<'NBV_EOF'
COPY requirements.txt ./requirements.txt
RUN pip install --no-cache-dir -r requirements.txt
NBV_EOF
  fi
fi

echo "Using Dockerfile:"
cat ./Dockerfile
"#
    )
}

fn existing_dockerfile(build: &BuildSettings, root: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = &build.dockerfile {
        let joined = safe_join(root, path)?;
        return Ok(joined.is_file().then_some(joined));
    }

    for candidate in ["Dockerfile", "Containerfile"] {
        let joined = root.join(candidate);
        if joined.is_file() {
            return Ok(Some(joined));
        }
    }

    Ok(None)
}

/// Find the requirements file: the explicit path first, then the ordered
/// source list, then auto-detection next to the notebook and at the
/// conventional locations.
fn locate_requirements(build: &BuildSettings, notebook_path: &str, root: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = &build.requirements_file {
        let joined = safe_join(root, path)?;
        return Ok(joined.is_file().then_some(joined));
    }

    if let Some(sources) = &build.requirements_sources {
        for source in sources {
            let joined = safe_join(root, source)?;
            if joined.is_file() {
                return Ok(Some(joined));
            }
        }
        return Ok(None);
    }

    let notebook_dir = safe_join(root, notebook_path)?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());

    for candidate in [
        notebook_dir.join("requirements.txt"),
        root.join("notebooks").join("requirements.txt"),
        root.join("requirements.txt"),
    ] {
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn checkout() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let root = Path::new("/checkout");

        assert!(safe_join(root, "nb.ipynb").is_ok());
        assert!(safe_join(root, "notebooks/./deep/../nb.ipynb").is_ok());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "../outside").is_err());
        assert!(safe_join(root, "a/../../outside").is_err());
    }

    #[test]
    fn test_generate_is_reproducible() {
        let one = generate("python:3.11", Some(Path::new("requirements.txt")));
        let two = generate("python:3.11", Some(Path::new("requirements.txt")));
        assert_eq!(one, two);
        assert!(one.starts_with("FROM python:3.11"));
        assert!(one.contains("RUN pip install --no-cache-dir -r requirements.txt"));
        assert!(one.is_ascii());
    }

    #[test]
    fn test_synthesize_from_requirements() {
        let dir = checkout();
        fs::write(dir.path().join("requirements.txt"), "pandas==2.0\n").unwrap();

        let build = BuildSettings { enabled: true, ..Default::default() };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();

        assert_eq!(result.source, RecipeSource::Generated);
        assert_eq!(result.requirements, Some(PathBuf::from("requirements.txt")));
        assert!(result.content.contains("requirements.txt"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_prefer_dockerfile_wins_over_requirements() {
        let dir = checkout();
        fs::write(dir.path().join("requirements.txt"), "pandas\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let build = BuildSettings {
            enabled: true,
            prefer_dockerfile: Some(true),
            ..Default::default()
        };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();

        assert_eq!(result.source, RecipeSource::Existing(PathBuf::from("Dockerfile")));
        assert_eq!(result.content, "FROM scratch\n");
        // Both recipe kinds present: warn, but do not consult requirements.
        assert!(result.warnings.iter().any(|w| w.contains("both")));
    }

    #[test]
    fn test_generation_switched_off_keeps_dockerfile() {
        let dir = checkout();
        fs::write(dir.path().join("requirements.txt"), "pandas\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let build = BuildSettings {
            enabled: true,
            auto_generate_requirements: Some(false),
            ..Default::default()
        };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();
        assert_eq!(result.source, RecipeSource::Existing(PathBuf::from("Dockerfile")));
    }

    #[test]
    fn test_requirements_win_without_preference() {
        let dir = checkout();
        fs::write(dir.path().join("requirements.txt"), "pandas\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let build = BuildSettings { enabled: true, ..Default::default() };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();
        assert_eq!(result.source, RecipeSource::Generated);
    }

    #[test]
    fn test_notebook_adjacent_requirements_detected_first() {
        let dir = checkout();
        fs::create_dir_all(dir.path().join("notebooks/demo")).unwrap();
        fs::write(dir.path().join("notebooks/demo/requirements.txt"), "numpy\n").unwrap();
        fs::write(dir.path().join("requirements.txt"), "pandas\n").unwrap();

        let build = BuildSettings { enabled: true, ..Default::default() };
        let result = synthesize(&build, "notebooks/demo/nb.ipynb", dir.path()).unwrap();
        assert_eq!(result.requirements, Some(PathBuf::from("notebooks/demo/requirements.txt")));
    }

    #[test]
    fn test_ordered_sources_respected() {
        let dir = checkout();
        fs::write(dir.path().join("second.txt"), "numpy\n").unwrap();

        let build = BuildSettings {
            enabled: true,
            requirements_sources: Some(vec!["first.txt".into(), "second.txt".into()]),
            ..Default::default()
        };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();
        assert_eq!(result.requirements, Some(PathBuf::from("second.txt")));
    }

    #[test]
    fn test_minimal_dockerfile_when_nothing_found() {
        let dir = checkout();

        let build = BuildSettings { enabled: true, base_image: Some("python:3.11".into()), ..Default::default() };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();

        assert_eq!(result.source, RecipeSource::Generated);
        assert!(result.requirements.is_none());
        assert!(result.content.starts_with("FROM python:3.11"));
    }

    #[test]
    fn test_pip_cache_warning_on_existing_dockerfile() {
        let dir = checkout();
        fs::write(dir.path().join("Dockerfile"), "FROM python:3.11\nRUN pip install pandas\n").unwrap();

        let build = BuildSettings { enabled: true, ..Default::default() };
        let result = synthesize(&build, "nb.ipynb", dir.path()).unwrap();

        assert_eq!(result.source, RecipeSource::Existing(PathBuf::from("Dockerfile")));
        assert!(result.warnings.iter().any(|w| w.contains("--no-cache-dir")));
    }

    #[test]
    fn test_traversal_in_spec_paths_rejected() {
        let dir = checkout();
        let build = BuildSettings {
            enabled: true,
            requirements_file: Some("../../etc/passwd".into()),
            ..Default::default()
        };
        assert!(synthesize(&build, "nb.ipynb", dir.path()).is_err());

        let build = BuildSettings {
            enabled: true,
            dockerfile: Some("/etc/passwd".into()),
            ..Default::default()
        };
        assert!(synthesize(&build, "nb.ipynb", dir.path()).is_err());
    }

    #[test]
    fn test_task_script_mirrors_fallback_order() {
        let script = task_script();

        let dockerfile_param = script.find("$(params.dockerfile-path)").unwrap();
        let plain = script.find("-f ./Dockerfile").unwrap();
        let containerfile = script.find("-f ./Containerfile").unwrap();
        let generated = script.find("$(params.base-image)").unwrap();

        assert!(dockerfile_param < plain && plain < containerfile && containerfile < generated);
        assert!(script.contains("requirements.txt"));
        assert!(script.contains("--no-cache-dir"));
    }
}
