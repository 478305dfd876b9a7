//! Hot-to-warm mover.
//!
//! Materializes each file into the warm tree with the sub-path mirrored
//! beneath the warm root. The copy lands under a temporary name and is
//! renamed into place, so downstream observers never see a partial file.
//! When the classifier hashed the source, the warm copy is re-hashed and
//! compared before the source is deleted; a mismatch keeps the source and
//! drops the bad copy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info};

use crate::config::{HashConfig, MoverConfig};
use crate::fileinfo::FileInfo;
use crate::hasher::Hasher;
use crate::pipeline::{OperatorReturn, StageContext, StageInput};

const OPERATOR: &str = "mover";
const TEMP_SUFFIX: &str = ".hmtemp";
#[cfg(unix)]
const WARM_FILE_MODE: u32 = 0o664;

pub struct Mover {
    dest_dir: PathBuf,
    hasher: Hasher,
    hash_required: bool,
    /// Directories already created this run.
    ensured: HashSet<PathBuf>,
}

impl Mover {
    pub fn new(mover_config: &MoverConfig, hash_config: &HashConfig) -> Mover {
        Mover {
            dest_dir: std::path::absolute(&mover_config.dest_dir)
                .unwrap_or_else(|_| mover_config.dest_dir.clone()),
            hasher: Hasher::from_config(hash_config),
            hash_required: hash_config.required,
            ensured: HashSet::new(),
        }
    }

    pub fn run(mut self, ctx: StageContext) {
        if !self.dest_dir.is_dir() {
            error!(
                "mover destination directory is not valid: <{}>",
                self.dest_dir.display()
            );
            ctx.cannot_continue();
            return;
        }

        info!("mover started successfully");
        loop {
            match ctx.next_file() {
                StageInput::Idle => continue,
                StageInput::Done => break,
                StageInput::File(file) => {
                    let ret = self.move_file(file);
                    if !ctx.send_return(ret) {
                        break;
                    }
                }
            }
        }
        info!("mover finished");
    }

    fn move_file(&mut self, mut file: FileInfo) -> OperatorReturn {
        let input_path = file.hot_path.join(&file.filename);
        let warm_dir = self.dest_dir.join(&file.sub_path);
        let output_path = warm_dir.join(&file.filename);
        file.warm_path = warm_dir.clone();
        file.file_warm_path = output_path.clone();

        if !self.ensured.contains(&warm_dir) {
            debug!("creating directory <{}>", warm_dir.display());
            if let Err(err) = std::fs::create_dir_all(&warm_dir) {
                let err = anyhow!(err).context(format!(
                    "couldn't make directory <{}>",
                    warm_dir.display()
                ));
                error!("{err:#}");
                return OperatorReturn::failed(OPERATOR, file, err, true);
            }
            self.ensured.insert(warm_dir.clone());
        }

        let start = Instant::now();
        let bytes = match stage_copy(&input_path, &output_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("{err:#}");
                return OperatorReturn::failed(OPERATOR, file, err, true);
            }
        };
        debug!(
            "copied {bytes} bytes to <{}> in {} ms",
            output_path.display(),
            start.elapsed().as_millis()
        );

        if !file.file_hash.is_empty() {
            match self.hasher.hash_file(&output_path) {
                Err(err) => {
                    let err = err.context(format!(
                        "error while hashing the warm copy <{}>",
                        output_path.display()
                    ));
                    error!("{err:#}");
                    return OperatorReturn::failed(OPERATOR, file, err, self.hash_required);
                }
                Ok(warm_hash) if warm_hash != file.file_hash => {
                    let _ = std::fs::remove_file(&output_path);
                    let err = anyhow!(
                        "warm and hot copies of the file do not match!\n\tinput: {}\n\toutput: {}",
                        input_path.display(),
                        output_path.display()
                    );
                    error!("{err}");
                    return OperatorReturn::failed(OPERATOR, file, err, true);
                }
                Ok(_) => {}
            }
        }

        // Copies match (or no hash was requested); the hot original can go.
        if let Err(err) = std::fs::remove_file(&input_path) {
            let err = anyhow!(err).context(format!(
                "error removing file <{}>",
                input_path.display()
            ));
            error!("{err:#}");
            return OperatorReturn::failed(OPERATOR, file, err, true);
        }

        OperatorReturn::clean(OPERATOR, file)
    }
}

/// Copy through a temporary name, rename into place, fix the mode. On
/// failure the destination is cleaned up best-effort and the source kept.
fn stage_copy(source: &Path, destination: &Path) -> Result<u64> {
    let temp_name = {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(TEMP_SUFFIX);
        destination.with_file_name(name)
    };

    let copy_result = (|| -> Result<u64> {
        let bytes = std::fs::copy(source, &temp_name).with_context(|| {
            format!(
                "error copying ({} -> {})",
                source.display(),
                temp_name.display()
            )
        })?;
        std::fs::rename(&temp_name, destination).with_context(|| {
            format!("error renaming the staged copy to {}", destination.display())
        })?;
        Ok(bytes)
    })();

    match copy_result {
        Ok(bytes) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    destination,
                    std::fs::Permissions::from_mode(WARM_FILE_MODE),
                );
            }
            Ok(bytes)
        }
        Err(err) => {
            let _ = std::fs::remove_file(&temp_name);
            let _ = std::fs::remove_file(destination);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Hasher;

    fn mover_for(warm: &Path) -> Mover {
        Mover::new(
            &MoverConfig {
                dest_dir: warm.to_path_buf(),
            },
            &HashConfig::default(),
        )
    }

    fn file_in(hot: &Path, sub: &str, name: &str, content: &str) -> FileInfo {
        let dir = hot.join(sub);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        FileInfo {
            filename: name.to_string(),
            hot_path: dir,
            file_hot_path: path,
            sub_path: PathBuf::from(sub),
            ..FileInfo::default()
        }
    }

    #[test]
    fn verified_move_mirrors_the_sub_path_and_removes_the_source() {
        let hot = tempfile::tempdir().unwrap();
        let warm = tempfile::tempdir().unwrap();
        let mut file = file_in(hot.path(), "run1", "a.dat", "abc");
        file.file_hash = Hasher::from_config(&HashConfig::default())
            .hash_file(&file.file_hot_path)
            .unwrap();

        let mut mover = mover_for(warm.path());
        let ret = mover.move_file(file);
        assert!(ret.error.is_none(), "unexpected error: {:?}", ret.error);

        let warm_copy = warm.path().join("run1/a.dat");
        assert_eq!(std::fs::read_to_string(&warm_copy).unwrap(), "abc");
        assert!(!hot.path().join("run1/a.dat").exists());
        assert_eq!(ret.file.file_warm_path, warm_copy);
        assert!(!warm.path().join("run1/a.dat.hmtemp").exists());
    }

    #[test]
    fn hash_mismatch_is_fatal_and_keeps_the_source() {
        let hot = tempfile::tempdir().unwrap();
        let warm = tempfile::tempdir().unwrap();
        let mut file = file_in(hot.path(), "run1", "a.dat", "abc");
        file.file_hash = "0000000000000000000000000000dead".to_string();

        let mut mover = mover_for(warm.path());
        let ret = mover.move_file(file);
        assert!(ret.fatal);
        assert!(ret.error.unwrap().to_string().contains("do not match"));
        assert!(hot.path().join("run1/a.dat").exists());
        assert!(!warm.path().join("run1/a.dat").exists());
    }

    #[test]
    fn unverified_move_still_removes_the_source() {
        let hot = tempfile::tempdir().unwrap();
        let warm = tempfile::tempdir().unwrap();
        let file = file_in(hot.path(), "", "b.dat", "xyz");

        let mut mover = mover_for(warm.path());
        let ret = mover.move_file(file);
        assert!(ret.error.is_none());
        assert!(warm.path().join("b.dat").exists());
        assert!(!hot.path().join("b.dat").exists());
    }

    #[cfg(unix)]
    #[test]
    fn warm_copy_gets_the_expected_mode() {
        use std::os::unix::fs::PermissionsExt;
        let hot = tempfile::tempdir().unwrap();
        let warm = tempfile::tempdir().unwrap();
        let file = file_in(hot.path(), "", "c.dat", "data");

        let mut mover = mover_for(warm.path());
        let ret = mover.move_file(file);
        assert!(ret.error.is_none());
        let mode = std::fs::metadata(warm.path().join("c.dat"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o664);
    }

    #[test]
    fn missing_source_is_fatal() {
        let warm = tempfile::tempdir().unwrap();
        let file = FileInfo {
            filename: "ghost.dat".into(),
            hot_path: PathBuf::from("/no/such"),
            ..FileInfo::default()
        };
        let mut mover = mover_for(warm.path());
        let ret = mover.move_file(file);
        assert!(ret.fatal);
    }
}
