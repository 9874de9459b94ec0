use crate::config;
use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// File name (without extension) of the base system prompt.
pub const BASE_PROMPT_NAME: &str = "ATOM";
/// Prefix marking tool prompts that are layered on top of the base prompt.
pub const TOOL_PREFIX: &str = "atom_";
/// Substituted with the configured iteration cap when present in the base prompt.
pub const MAX_ITERATIONS_PLACEHOLDER: &str = "{max_iterations}";

const PROMPT_EXTENSION: &str = "md";

#[derive(Debug)]
pub enum PromptError {
    NotFound {
        name: String,
        searched: Vec<PathBuf>,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::NotFound { name, searched } => {
                let dirs: Vec<String> = searched
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect();
                write!(
                    f,
                    "prompt file {} not found in any of: {}",
                    name,
                    dirs.join(", ")
                )
            }
            PromptError::Io { path, source } => {
                write!(f, "failed to read prompt at {}: {}", path.display(), source)
            }
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::Io { source, .. } => Some(source),
            PromptError::NotFound { .. } => None,
        }
    }
}

/// Resolves prompt files from an ordered directory search path and composes
/// the system prompt for a run. The search path is fixed at construction:
/// project-local overrides, then the user scope, then the packaged prompts,
/// then an operator-supplied extra directory (`ATOM_PROMPTS_DIR`).
#[derive(Debug, Clone)]
pub struct PromptResolver {
    search_dirs: Vec<PathBuf>,
}

impl PromptResolver {
    pub fn new(project_dir: Option<&Path>) -> Self {
        let mut search_dirs = Vec::new();
        if let Some(project_dir) = project_dir {
            search_dirs.push(project_dir.join(".atom").join("prompts"));
        }
        search_dirs.push(config::atom_home().join("prompts"));
        search_dirs.push(bundled_prompts_dir());
        if let Ok(extra) = env::var("ATOM_PROMPTS_DIR") {
            if !extra.trim().is_empty() {
                search_dirs.push(PathBuf::from(extra));
            }
        }
        Self { search_dirs }
    }

    /// Resolver over an explicit directory list, first match wins.
    pub fn with_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Composes the system prompt for `tool_name`:
    /// no tool → base prompt; `atom_x` → base prompt, blank line, `X` prompt;
    /// any other name → that prompt alone.
    pub fn compose(
        &self,
        tool_name: Option<&str>,
        max_iterations: u32,
    ) -> Result<String, PromptError> {
        match tool_name {
            None => self.base_prompt(max_iterations),
            Some(name) => match name.strip_prefix(TOOL_PREFIX) {
                Some(tool) => {
                    let base = self.base_prompt(max_iterations)?;
                    let tool_text = self.read_prompt(&prompt_file_name(tool))?;
                    Ok(format!("{}\n\n{}", base, tool_text))
                }
                None => self.read_prompt(&prompt_file_name(name)),
            },
        }
    }

    /// All resolvable prompts as (tool name, winning source directory),
    /// earlier directories shadowing later ones.
    pub fn list(&self) -> Vec<(String, PathBuf)> {
        let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
        for dir in &self.search_dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(PROMPT_EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                seen.entry(stem.to_string()).or_insert_with(|| dir.clone());
            }
        }
        seen.into_iter().collect()
    }

    fn base_prompt(&self, max_iterations: u32) -> Result<String, PromptError> {
        let text = self.read_prompt(&prompt_file_name(BASE_PROMPT_NAME))?;
        Ok(text.replace(MAX_ITERATIONS_PLACEHOLDER, &max_iterations.to_string()))
    }

    fn read_prompt(&self, file_name: &str) -> Result<String, PromptError> {
        for dir in &self.search_dirs {
            let path = dir.join(file_name);
            if path.is_file() {
                return fs::read_to_string(&path)
                    .map_err(|source| PromptError::Io { path, source });
            }
        }
        Err(PromptError::NotFound {
            name: file_name.to_string(),
            searched: self.search_dirs.clone(),
        })
    }
}

fn prompt_file_name(tool: &str) -> String {
    format!("{}.{}", tool.to_uppercase(), PROMPT_EXTENSION)
}

fn bundled_prompts_dir() -> PathBuf {
    let installed = config::atom_home().join("share").join("prompts");
    if installed.is_dir() {
        return installed;
    }
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("prompts");
    if manifest.is_dir() {
        return manifest;
    }
    PathBuf::from("prompts")
}
