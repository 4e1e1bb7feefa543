use hypernode_types::{JobId, JobResult};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::SandboxError;

/// Lines of job output kept in the reported result.
pub const LOG_TAIL_LINES: usize = 50;

/// Bytes read from the end of each log stream.
pub const LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Largest result file copied out of the mount.
pub const RESULT_MAX_BYTES: u64 = 1024 * 1024;

pub const RESULT_FILE: &str = "out/result.json";
pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";

/// Per-job data mount. The directory and everything in it is deleted on drop, so
/// only what `extract` copies out survives the run.
#[derive(Debug)]
pub struct JobWorkdir {
    dir: TempDir,
}

impl JobWorkdir {
    pub fn create(root: &Path, job_id: &JobId) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let prefix = format!("{}-", sanitize(job_id.as_str()));
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;
        fs::create_dir_all(dir.path().join("in"))?;
        fs::create_dir_all(dir.path().join("out"))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn result_path(&self) -> PathBuf {
        self.dir.path().join(RESULT_FILE)
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.path().join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.path().join(STDERR_FILE)
    }

    /// Copy the declared result and the log tail out of the mount.
    ///
    /// Logs are read from the end of each stream and decoded lossily, so neither a
    /// chatty job nor stray binary output costs the node memory or the tail. A result
    /// larger than [`RESULT_MAX_BYTES`] is an error rather than a truncated value.
    pub fn extract(&self) -> Result<JobResult, SandboxError> {
        let output = read_result(&self.result_path())?;

        let mut logs = tail_lines(&self.stdout_path(), LOG_TAIL_LINES);
        logs.extend(tail_lines(&self.stderr_path(), LOG_TAIL_LINES));

        Ok(JobResult {
            output,
            logs,
            exit_code: None,
        })
    }

    /// Delete the mount now instead of on drop, surfacing I/O errors.
    pub fn discard(self) -> io::Result<()> {
        self.dir.close()
    }
}

fn read_result(path: &Path) -> Result<Option<serde_json::Value>, SandboxError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata()?.len();
    if size > RESULT_MAX_BYTES {
        return Err(SandboxError::ResultTooLarge {
            size,
            limit: RESULT_MAX_BYTES,
        });
    }

    // The file may still be growing if a leftover writer had the path open.
    let mut raw = Vec::with_capacity(size as usize);
    file.take(RESULT_MAX_BYTES + 1).read_to_end(&mut raw)?;
    if raw.len() as u64 > RESULT_MAX_BYTES {
        return Err(SandboxError::ResultTooLarge {
            size: raw.len() as u64,
            limit: RESULT_MAX_BYTES,
        });
    }

    let text = String::from_utf8_lossy(&raw);
    Ok(Some(serde_json::from_str(&text).unwrap_or_else(|_| {
        serde_json::Value::String(text.into_owned())
    })))
}

fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match read_tail(path) {
        Ok(text) => tail(&text, n),
        Err(_) => Vec::new(),
    }
}

/// The last [`LOG_TAIL_BYTES`] of a file, starting at a line boundary.
fn read_tail(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let start = file.metadata()?.len().saturating_sub(LOG_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut raw = Vec::new();
    file.take(LOG_TAIL_BYTES).read_to_end(&mut raw)?;
    if start > 0 {
        // Landed mid-line; drop the fragment.
        let cut = raw.iter().position(|b| *b == b'\n').map_or(raw.len(), |i| i + 1);
        raw.drain(..cut);
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// The last `max` bytes of `text`, moved forward to a character boundary.
pub(crate) fn clip_front(text: &str, max: usize) -> &str {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

pub(crate) fn tail(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

/// Restrict ids to characters safe for paths and container names.
pub(crate) fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_then_discard() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job/../1")).unwrap();
        let mount = wd.path().to_path_buf();
        assert!(mount.starts_with(root.path()));
        assert!(mount.join("in").is_dir());

        fs::write(wd.result_path(), r#"{"tokens": 100}"#).unwrap();
        fs::write(wd.stdout_path(), "line1\nline2\n").unwrap();
        fs::write(mount.join("in/weights.bin"), vec![0u8; 16]).unwrap();

        let result = wd.extract().unwrap();
        assert_eq!(result.output, Some(serde_json::json!({"tokens": 100})));
        assert_eq!(result.logs, vec!["line1", "line2"]);

        wd.discard().unwrap();
        assert!(!mount.exists());
    }

    #[test]
    fn non_json_result_is_kept_as_text() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job-2")).unwrap();
        fs::write(wd.result_path(), "done").unwrap();
        assert_eq!(wd.extract().unwrap().output, Some(serde_json::json!("done")));
    }

    #[test]
    fn binary_garbage_does_not_cost_the_log() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job-3")).unwrap();
        fs::write(wd.stdout_path(), b"line1\nline2\n\xff\xfe\nline3\n").unwrap();

        let logs = wd.extract().unwrap().logs;
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[0], "line1");
        assert_eq!(logs[1], "line2");
        assert!(logs[2].contains('\u{FFFD}'));
        assert_eq!(logs[3], "line3");
    }

    #[test]
    fn huge_log_yields_only_its_tail() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job-4")).unwrap();
        let mut text = String::new();
        for i in 0..200_000 {
            text.push_str(&format!("row {}\n", i));
        }
        assert!(text.len() as u64 > 10 * LOG_TAIL_BYTES);
        fs::write(wd.stdout_path(), &text).unwrap();

        let logs = wd.extract().unwrap().logs;
        assert_eq!(logs.len(), LOG_TAIL_LINES);
        assert_eq!(logs.last().map(String::as_str), Some("row 199999"));
        assert!(logs.iter().all(|l| l.starts_with("row ")));
    }

    #[test]
    fn oversized_result_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job-5")).unwrap();
        fs::write(wd.result_path(), vec![b'a'; RESULT_MAX_BYTES as usize + 1]).unwrap();

        match wd.extract() {
            Err(SandboxError::ResultTooLarge { size, limit }) => {
                assert_eq!(size, RESULT_MAX_BYTES + 1);
                assert_eq!(limit, RESULT_MAX_BYTES);
            }
            other => panic!("expected an oversized result error, got {:?}", other),
        }
        wd.discard().unwrap();
    }

    #[test]
    fn missing_result_is_none() {
        let root = tempfile::tempdir().unwrap();
        let wd = JobWorkdir::create(root.path(), &JobId::new("job-6")).unwrap();
        assert_eq!(wd.extract().unwrap().output, None);
    }

    #[test]
    fn tail_keeps_last_lines() {
        let text = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail(&text, 3), vec!["7", "8", "9"]);
        assert!(tail("", 3).is_empty());
        assert_eq!(sanitize("a b/c"), "a-b-c");
        assert_eq!(clip_front("héllo", 4), "llo");
        assert_eq!(clip_front("abc", 10), "abc");
    }
}
