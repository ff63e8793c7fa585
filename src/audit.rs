use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Append-only daily file of statements run through `execute_logged`.
///
/// One file per local day, `<dir>/YYYY-MM-DD_logSQL.sql`, one `statement;` per line.
#[derive(Debug)]
pub(crate) struct AuditLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn file_for_today(&self) -> PathBuf {
        let day = chrono::Local::now().format("%Y-%m-%d");
        self.dir.join(format!("{day}_logSQL.sql"))
    }

    pub(crate) fn append(&self, sql: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_dir(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for_today())?;
        writeln!(file, "{sql};")
    }
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        fs::create_dir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_terminated_statements() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("sql"));
        log.append("UPDATE t SET a = 1").unwrap();
        log.append("DELETE FROM t").unwrap();

        let text = fs::read_to_string(log.file_for_today()).unwrap();
        assert_eq!(text, "UPDATE t SET a = 1;\nDELETE FROM t;\n");
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let log = AuditLog::new(blocker.join("nested"));
        assert!(log.append("SELECT 1").is_err());
    }
}
