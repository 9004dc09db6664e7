//! Function definitions: parsing, loading and compilation.
//!
//! A function file is JSON, YAML or TOML (picked by extension) holding a
//! `function` section and a `profile` section. [`load`] reads, parses and
//! compiles it into a shared [`ScalarFunction`].

pub mod compile;
pub mod spec;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};

pub use compile::{CompiledMessage, CompiledTask, ScalarFunction};
pub use spec::{
    EnsembleDef, FunctionDef, FunctionFile, MemberDef, MessageDef, ProfileDef, TaskDef, TaskKind,
};

/// Serialization format of a function file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }
}

impl FunctionFile {
    pub fn parse(source: &str, format: Format) -> ConfigResult<Self> {
        let parsed = match format {
            Format::Json => serde_json::from_str(source).map_err(|e| e.to_string()),
            Format::Yaml => serde_yaml::from_str(source).map_err(|e| e.to_string()),
            Format::Toml => toml::from_str(source).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            format: format.name(),
            message,
        })
    }

    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let format = Format::from_path(path)?;
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source, format)
    }
}

/// Parse and compile a function from source text.
pub fn compile_str(source: &str, format: Format) -> ConfigResult<Arc<ScalarFunction>> {
    let file = FunctionFile::parse(source, format)?;
    ScalarFunction::compile(file).map(Arc::new)
}

/// Read, parse and compile a function file.
pub fn load(path: &Path) -> ConfigResult<Arc<ScalarFunction>> {
    let function = ScalarFunction::compile(FunctionFile::from_path(path)?)?;
    info!(
        path = %path.display(),
        function = %function.name,
        tasks = function.tasks.len(),
        "loaded function"
    );
    Ok(Arc::new(function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOML_FUNCTION: &str = r#"
[function]
name = "tiny"
output = "tasks[0].scores[0]"

[[function.tasks]]
kind = "vector.completion"
responses = ["yes", "no"]

[[function.tasks.messages]]
role = "user"
content = "'Is the sky blue?'"

[[profile.tasks]]
weights = [1.0]

[[profile.tasks.members]]
model = "openai/gpt-4o-mini"
mode = "ranked_logprobs"
options = { top_logprobs = 20 }
"#;

    #[test]
    fn format_by_extension() {
        assert_eq!(Format::from_path(Path::new("f.YAML")).unwrap(), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("f.yml")).unwrap(), Format::Yaml);
        assert!(matches!(
            Format::from_path(Path::new("f.ini")),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn toml_function_compiles() {
        let function = compile_str(TOML_FUNCTION, Format::Toml).unwrap();
        assert_eq!(function.name, "tiny");
        let member = &function.tasks[0].profile.members()[0];
        assert_eq!(member.options["top_logprobs"], 20);
    }

    #[test]
    fn parse_errors_name_the_format() {
        let err = FunctionFile::parse("function: [", Format::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "yaml", .. }));
    }

    #[test]
    fn load_from_disk() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(TOML_FUNCTION.as_bytes()).unwrap();
        let function = load(file.path()).unwrap();
        assert_eq!(function.tasks.len(), 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/function.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
