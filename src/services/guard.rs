//! 本机单实例保护
//!
//! pid 文件以 create-new 方式创建；所属进程已退出的陈旧文件会被回收

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("another migration is running (pid {pid}, {})", .path.display())]
    Busy { pid: u32, path: PathBuf },
    #[error("cannot create guard file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 持有期间阻止本机再启动一个编排器，Drop 时删除 pid 文件
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, GuardError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GuardError::Io {
                path: path.clone(),
                source,
            })?;
        }

        // 最多回收一次陈旧文件
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(|source| GuardError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    debug!(path = %path.display(), "Instance guard acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_pid(&path) {
                        Some(pid) if pid_alive(pid) => {
                            return Err(GuardError::Busy { pid, path });
                        }
                        stale => {
                            warn!(path = %path.display(), pid = ?stale, "Reclaiming stale guard file");
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
                Err(source) => return Err(GuardError::Io { path, source }),
            }
        }

        Err(GuardError::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "guard file keeps reappearing"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    Path::new("/proc").join(pid.to_string()).exists()
}
