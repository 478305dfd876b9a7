//! File content hashing.
//!
//! The pipeline identifies file content by MD5 hex digest. Hashing runs
//! in-process by default; `hash.command` selects an external tool instead
//! (its first whitespace-separated output token is taken as the digest,
//! the `md5sum` output convention).

use std::io::Read;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::config::HashConfig;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Hasher {
    command: Option<(String, Option<String>)>,
}

impl Hasher {
    pub fn from_config(config: &HashConfig) -> Hasher {
        let command = if config.command.is_empty() {
            None
        } else {
            let opt = if config.cmd_opt.is_empty() {
                None
            } else {
                Some(config.cmd_opt.clone())
            };
            Some((config.command.clone(), opt))
        };
        Hasher { command }
    }

    /// MD5 hex digest of the file at `path`.
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        match &self.command {
            Some((command, opt)) => hash_with_command(command, opt.as_deref(), path),
            None => hash_in_process(path),
        }
    }
}

fn hash_in_process(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("reading {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

fn hash_with_command(command: &str, opt: Option<&str>, path: &Path) -> Result<String> {
    let mut cmd = Command::new(command);
    if let Some(opt) = opt {
        cmd.arg(opt);
    }
    let output = cmd
        .arg(path)
        .output()
        .with_context(|| format!("running hash command <{command}>"))?;
    if !output.status.success() {
        bail!(
            "hash command <{command}> exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    match stdout.split_whitespace().next() {
        Some(token) => Ok(token.to_string()),
        None => bail!("hash command <{command}> produced no output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, opt: &str) -> HashConfig {
        HashConfig {
            required: true,
            command: command.to_string(),
            cmd_opt: opt.to_string(),
        }
    }

    #[test]
    fn in_process_md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dat");
        std::fs::write(&path, "abc").unwrap();
        let hasher = Hasher::from_config(&config("", ""));
        assert_eq!(
            hasher.hash_file(&path).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn identical_content_hashes_identically() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.dat");
        let second = dir.path().join("b.dat");
        std::fs::write(&first, "payload").unwrap();
        std::fs::write(&second, "payload").unwrap();
        let hasher = Hasher::from_config(&config("", ""));
        assert_eq!(
            hasher.hash_file(&first).unwrap(),
            hasher.hash_file(&second).unwrap()
        );
    }

    #[test]
    fn external_command_output_is_tokenized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dat");
        std::fs::write(&path, "abc").unwrap();
        // `echo deadbeef <path>` stands in for a real hashing tool.
        let hasher = Hasher::from_config(&config("echo", "deadbeef"));
        assert_eq!(hasher.hash_file(&path).unwrap(), "deadbeef");
    }

    #[test]
    fn missing_file_is_an_error() {
        let hasher = Hasher::from_config(&config("", ""));
        assert!(hasher.hash_file(Path::new("/no/such/file")).is_err());
    }
}
