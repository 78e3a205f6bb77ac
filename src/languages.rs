use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Compilation and execution recipe for one language tag. A passive data
/// value: adding a language touches only this table, never the pipeline.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LanguageSpec {
    /// Filename the submitted source is written to inside the workspace.
    pub source_file: String,
    /// Filename the compiler produces; ignored for interpreted languages.
    #[serde(default)]
    pub executable_file: String,
    /// Compile argv, run with cwd = workspace. Empty for interpreted languages.
    #[serde(default)]
    pub compile_cmd: Vec<String>,
    /// Run argv, relative to the workspace (or sandbox box) directory.
    pub run_cmd: Vec<String>,
}

impl LanguageSpec {
    pub fn is_interpreted(&self) -> bool {
        self.compile_cmd.is_empty()
    }

    /// The file the sandbox ultimately runs: the compiler output, or the
    /// source itself for interpreted languages.
    pub fn executable_ref(&self) -> &str {
        if self.is_interpreted() {
            &self.source_file
        } else {
            &self.executable_file
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LanguageConfigError {
    #[error("failed to read language config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse language config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Tag-indexed table of language recipes, fixed at startup.
#[derive(Clone, Debug, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// The built-in table mirroring what the judge images ship with.
    pub fn builtin() -> Self {
        let mut registry = LanguageRegistry::default();
        registry.register(
            "cpp",
            LanguageSpec {
                source_file: "main.cpp".to_string(),
                executable_file: "main.out".to_string(),
                compile_cmd: argv(&["g++", "main.cpp", "-o", "main.out", "-O2", "-static", "-Wall"]),
                run_cmd: argv(&["./main.out"]),
            },
        );
        registry.register(
            "python",
            LanguageSpec {
                source_file: "main.py".to_string(),
                executable_file: String::new(),
                compile_cmd: vec![],
                run_cmd: argv(&["python3", "main.py"]),
            },
        );
        registry
    }

    /// Loads a `{ "<tag>": LanguageSpec, ... }` JSON file, replacing the
    /// built-in table entirely.
    pub fn from_json_file(path: &Path) -> Result<Self, LanguageConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LanguageConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let languages: HashMap<String, LanguageSpec> =
            serde_json::from_str(&raw).map_err(|source| LanguageConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(LanguageRegistry { languages })
    }

    pub fn register(&mut self, tag: impl Into<String>, spec: LanguageSpec) {
        self.languages.insert(tag.into(), spec);
    }

    pub fn get(&self, tag: &str) -> Option<&LanguageSpec> {
        self.languages.get(tag)
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_has_cpp_and_python() {
        let registry = LanguageRegistry::builtin();
        let cpp = registry.get("cpp").unwrap();
        assert_eq!(cpp.source_file, "main.cpp");
        assert_eq!(cpp.executable_ref(), "main.out");
        assert!(!cpp.is_interpreted());

        let python = registry.get("python").unwrap();
        assert!(python.is_interpreted());
        assert_eq!(python.executable_ref(), "main.py");
    }

    #[test]
    fn unknown_tag_is_none() {
        assert!(LanguageRegistry::builtin().get("cobol").is_none());
    }

    #[test]
    fn interpreted_means_empty_compile_command() {
        let spec = LanguageSpec {
            source_file: "main.txt".to_string(),
            executable_file: String::new(),
            compile_cmd: vec![],
            run_cmd: argv(&["/bin/cat", "main.txt"]),
        };
        assert!(spec.is_interpreted());
        assert_eq!(spec.executable_ref(), "main.txt");
    }

    #[test]
    fn registry_loads_from_json_file() {
        let dir = std::env::temp_dir().join(format!("judged-langs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("languages.json");
        std::fs::write(
            &path,
            r#"{
                "c": {
                    "source_file": "main.c",
                    "executable_file": "main.out",
                    "compile_cmd": ["gcc", "main.c", "-o", "main.out", "-O2"],
                    "run_cmd": ["./main.out"]
                }
            }"#,
        )
        .unwrap();

        let registry = LanguageRegistry::from_json_file(&path).unwrap();
        let c = registry.get("c").unwrap();
        assert_eq!(c.compile_cmd[0], "gcc");
        assert!(registry.get("cpp").is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("judged-langs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("languages.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = LanguageRegistry::from_json_file(&path).unwrap_err();
        assert!(matches!(err, LanguageConfigError::Parse { .. }));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
