//! Per-file state carried between pipeline stages.
//!
//! The scheduler creates a `FileInfo` at ingest; each stage takes
//! ownership, fills in the fields it is responsible for, and hands the
//! record back inside an `OperatorReturn`. Fields set by an earlier stage
//! are read-only for later ones.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{bail, Result};

/// File information header.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Basename of the file.
    pub filename: String,
    /// Type name assigned by the classifier.
    pub file_type: String,
    /// MD5 hex digest computed by the classifier when the type requests
    /// it; empty otherwise.
    pub file_hash: String,
    /// Directory of the file relative to the first matching base path;
    /// empty when no base path matches.
    pub sub_path: PathBuf,
    pub hot_path: PathBuf,
    pub warm_path: PathBuf,
    pub cold_path: PathBuf,
    pub file_hot_path: PathBuf,
    pub file_warm_path: PathBuf,
    pub file_cold_path: PathBuf,
    /// Jobs still to run, in order; filled by the classifier, drained by
    /// a worker.
    pub job_queue: VecDeque<Job>,
    /// Jobs that completed successfully.
    pub finished_jobs: Vec<Job>,
}

/// A templated external command attached to a file.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub template: CommandTemplate,
    /// Resolved executable; set by the worker at execution time.
    pub command_name: String,
    /// Resolved arguments; set by the worker at execution time.
    pub command_args: Vec<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, template: CommandTemplate) -> Job {
        Job {
            name: name.into(),
            template,
            command_name: String::new(),
            command_args: Vec::new(),
        }
    }
}

/// A command template referencing `FileInfo` fields as `{{.Field}}`.
///
/// The expanded string is split on whitespace to form the argv, so
/// embedded spaces in expanded fields are not supported.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    source: String,
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone)]
enum TemplatePart {
    Literal(String),
    Field(TemplateField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateField {
    Filename,
    FileType,
    FileHash,
    SubPath,
    HotPath,
    WarmPath,
    ColdPath,
    FileHotPath,
    FileWarmPath,
    FileColdPath,
}

impl TemplateField {
    fn parse(name: &str) -> Option<TemplateField> {
        match name {
            "Filename" => Some(TemplateField::Filename),
            "FileType" => Some(TemplateField::FileType),
            "FileHash" => Some(TemplateField::FileHash),
            "SubPath" => Some(TemplateField::SubPath),
            "HotPath" => Some(TemplateField::HotPath),
            "WarmPath" => Some(TemplateField::WarmPath),
            "ColdPath" => Some(TemplateField::ColdPath),
            "FileHotPath" => Some(TemplateField::FileHotPath),
            "FileWarmPath" => Some(TemplateField::FileWarmPath),
            "FileColdPath" => Some(TemplateField::FileColdPath),
            _ => None,
        }
    }

    fn resolve(self, file: &FileInfo) -> String {
        match self {
            TemplateField::Filename => file.filename.clone(),
            TemplateField::FileType => file.file_type.clone(),
            TemplateField::FileHash => file.file_hash.clone(),
            TemplateField::SubPath => file.sub_path.display().to_string(),
            TemplateField::HotPath => file.hot_path.display().to_string(),
            TemplateField::WarmPath => file.warm_path.display().to_string(),
            TemplateField::ColdPath => file.cold_path.display().to_string(),
            TemplateField::FileHotPath => file.file_hot_path.display().to_string(),
            TemplateField::FileWarmPath => file.file_warm_path.display().to_string(),
            TemplateField::FileColdPath => file.file_cold_path.display().to_string(),
        }
    }
}

impl CommandTemplate {
    /// Parse a template, rejecting unknown field names and unclosed
    /// placeholders up front so misconfigured jobs fail at startup rather
    /// than at execution time.
    pub fn parse(source: &str) -> Result<CommandTemplate> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{.") {
            if open > 0 {
                parts.push(TemplatePart::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 3..];
            let Some(close) = after_open.find("}}") else {
                bail!("unclosed placeholder in command template <{source}>");
            };
            let name = &after_open[..close];
            let Some(field) = TemplateField::parse(name) else {
                bail!("unknown template field <{name}> in command template <{source}>");
            };
            parts.push(TemplatePart::Field(field));
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }
        Ok(CommandTemplate {
            source: source.to_string(),
            parts,
        })
    }

    /// Expand the template against a file record.
    pub fn expand(&self, file: &FileInfo) -> String {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Field(field) => out.push_str(&field.resolve(file)),
            }
        }
        out
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> FileInfo {
        FileInfo {
            filename: "run42.dat".into(),
            file_type: "raw".into(),
            file_hash: "deadbeef".into(),
            sub_path: PathBuf::from("run42"),
            hot_path: PathBuf::from("/data/hot/run42"),
            warm_path: PathBuf::from("/data/warm/run42"),
            file_warm_path: PathBuf::from("/data/warm/run42/run42.dat"),
            ..FileInfo::default()
        }
    }

    #[test]
    fn expands_fields_in_place() {
        let template =
            CommandTemplate::parse("/usr/bin/touch {{.WarmPath}}/{{.Filename}}.done").unwrap();
        assert_eq!(
            template.expand(&sample_file()),
            "/usr/bin/touch /data/warm/run42/run42.dat.done"
        );
    }

    #[test]
    fn literal_only_templates_pass_through() {
        let template = CommandTemplate::parse("/bin/true").unwrap();
        assert_eq!(template.expand(&sample_file()), "/bin/true");
    }

    #[test]
    fn unknown_field_is_rejected_at_parse_time() {
        let err = CommandTemplate::parse("echo {{.Nope}}").unwrap_err();
        assert!(err.to_string().contains("unknown template field"));
    }

    #[test]
    fn unclosed_placeholder_is_rejected() {
        let err = CommandTemplate::parse("echo {{.Filename").unwrap_err();
        assert!(err.to_string().contains("unclosed placeholder"));
    }

    #[test]
    fn adjacent_placeholders_expand() {
        let template = CommandTemplate::parse("{{.FileType}}{{.FileHash}}").unwrap();
        assert_eq!(template.expand(&sample_file()), "rawdeadbeef");
    }
}
