//! Warm-to-cold shipper.
//!
//! Archives the warm copy with rsync in `--relative` mode: the command
//! runs with its working directory set to the warm root and is given the
//! file's sub-path, so the destination receives the identical sub-tree.
//! The destination is a local directory or `[user@]host:path`. Shipping
//! failures are non-fatal; the scheduler records them and carries on.

use std::path::PathBuf;
use std::process::Command;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::config::ShipperConfig;
use crate::fileinfo::FileInfo;
use crate::pipeline::{OperatorReturn, StageContext, StageInput};

const OPERATOR: &str = "shipper";
const SYNC_COMMAND: &str = "rsync";

pub struct Shipper {
    /// rsync destination: an absolute local path or a remote target.
    destination: String,
    /// Cold root recorded on the file; for remote targets this is the
    /// path on the remote host.
    cold_root: PathBuf,
    /// Warm root the relative sub-paths are resolved against.
    warm_root: PathBuf,
}

impl Shipper {
    pub fn new(config: &ShipperConfig, warm_root: PathBuf) -> Shipper {
        let (destination, cold_root) = if config.hostname.is_empty() {
            let local = std::path::absolute(&config.dest_dir)
                .unwrap_or_else(|_| config.dest_dir.clone());
            (local.display().to_string(), local)
        } else {
            let target = if config.username.is_empty() {
                format!("{}:{}", config.hostname, config.dest_dir.display())
            } else {
                format!(
                    "{}@{}:{}",
                    config.username,
                    config.hostname,
                    config.dest_dir.display()
                )
            };
            (target, config.dest_dir.clone())
        };
        Shipper {
            destination,
            cold_root,
            warm_root,
        }
    }

    pub fn run(self, ctx: StageContext) {
        info!("shipper started successfully");
        loop {
            match ctx.next_file() {
                StageInput::Idle => continue,
                StageInput::Done => break,
                StageInput::File(file) => {
                    let ret = self.ship(file);
                    if !ctx.send_return(ret) {
                        break;
                    }
                }
            }
        }
        info!("shipper finished");
    }

    fn ship(&self, mut file: FileInfo) -> OperatorReturn {
        let relative = file.sub_path.join(&file.filename);
        file.cold_path = self.cold_root.join(&file.sub_path);
        file.file_cold_path = self.cold_root.join(&relative);

        debug!(
            "rsync command: {SYNC_COMMAND} -a --relative {} {} (cwd {})",
            relative.display(),
            self.destination,
            self.warm_root.display()
        );
        let status = Command::new(SYNC_COMMAND)
            .arg("-a")
            .arg("--relative")
            .arg(&relative)
            .arg(&self.destination)
            .current_dir(&self.warm_root)
            .status();

        match status {
            Ok(status) if status.success() => OperatorReturn::clean(OPERATOR, file),
            Ok(status) => {
                let err = anyhow!(
                    "error on running {SYNC_COMMAND} for <{}>: exit status {status}",
                    file.filename
                );
                warn!("{err}");
                OperatorReturn::failed(OPERATOR, file, err, false)
            }
            Err(spawn_err) => {
                let err = anyhow!(
                    "error on running {SYNC_COMMAND} for <{}>: {spawn_err}",
                    file.filename
                );
                warn!("{err}");
                OperatorReturn::failed(OPERATOR, file, err, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn shipped_file(warm: &Path, sub: &str, name: &str, content: &str) -> FileInfo {
        let dir = warm.join(sub);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
        FileInfo {
            filename: name.to_string(),
            sub_path: PathBuf::from(sub),
            warm_path: dir.clone(),
            file_warm_path: dir.join(name),
            ..FileInfo::default()
        }
    }

    fn rsync_available() -> bool {
        Command::new(SYNC_COMMAND)
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn local_shipment_preserves_the_sub_tree() {
        if !rsync_available() {
            eprintln!("rsync not available; skipping");
            return;
        }
        let warm = tempfile::tempdir().unwrap();
        let cold = tempfile::tempdir().unwrap();
        let file = shipped_file(warm.path(), "run1", "a.dat", "abc");

        let shipper = Shipper::new(
            &ShipperConfig {
                active: true,
                dest_dir: cold.path().to_path_buf(),
                hostname: String::new(),
                username: String::new(),
            },
            warm.path().to_path_buf(),
        );
        let ret = shipper.ship(file);
        assert!(ret.error.is_none(), "unexpected error: {:?}", ret.error);
        assert_eq!(
            std::fs::read_to_string(cold.path().join("run1/a.dat")).unwrap(),
            "abc"
        );
        assert_eq!(ret.file.file_cold_path, cold.path().join("run1/a.dat"));
    }

    #[test]
    fn shipping_failure_is_not_fatal() {
        if !rsync_available() {
            eprintln!("rsync not available; skipping");
            return;
        }
        let warm = tempfile::tempdir().unwrap();
        let file = FileInfo {
            filename: "ghost.dat".into(),
            sub_path: PathBuf::new(),
            ..FileInfo::default()
        };
        let shipper = Shipper::new(
            &ShipperConfig {
                active: true,
                dest_dir: PathBuf::from("/no/such/destination/root"),
                hostname: String::new(),
                username: String::new(),
            },
            warm.path().to_path_buf(),
        );
        let ret = shipper.ship(file);
        assert!(!ret.fatal);
        assert!(ret.error.is_some());
    }

    #[test]
    fn remote_targets_are_assembled_from_host_and_user() {
        let shipper = Shipper::new(
            &ShipperConfig {
                active: true,
                dest_dir: PathBuf::from("/archive"),
                hostname: "cold.example.org".into(),
                username: "hornet".into(),
            },
            PathBuf::from("/warm"),
        );
        assert_eq!(shipper.destination, "hornet@cold.example.org:/archive");

        let no_user = Shipper::new(
            &ShipperConfig {
                active: true,
                dest_dir: PathBuf::from("/archive"),
                hostname: "cold.example.org".into(),
                username: String::new(),
            },
            PathBuf::from("/warm"),
        );
        assert_eq!(no_user.destination, "cold.example.org:/archive");
    }
}
