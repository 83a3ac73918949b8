//! Stand-in engine for tests
//!
//! A POSIX shell script invoked as `sh <script>` that mimics the parts of
//! `pdflatex` the driver relies on. Markers in the document pick a behavior:
//! `FAKE-REJECT` exits non-zero, `FAKE-SLOW` sleeps past short timeouts,
//! `FAKE-NOPDF` exits zero without output, `FAKE-FLAKY-SECOND` fails the
//! second pass after writing the PDF on the first. Every pass appends a
//! line to `passes.log` and records its PID in `engine.pid` in the working
//! directory.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::EngineConfig;

const SCRIPT: &str = r#"
if [ "$1" = "--version" ]; then
  echo "pdfTeX 3.141592653 (fake)"
  exit 0
fi
for doc; do :; done
echo "pass" >> passes.log
echo $$ > engine.pid
base=$(basename "$doc" .tex)
echo "This is pdfTeX (fake), processing $doc"
if grep -q 'FAKE-REJECT' "$doc"; then
  echo "! Undefined control sequence."
  echo "fatal: emergency stop" >&2
  exit 1
fi
if grep -q 'FAKE-SLOW' "$doc"; then
  sleep 10
fi
if grep -q 'FAKE-NOPDF' "$doc"; then
  exit 0
fi
if grep -q 'FAKE-FLAKY-SECOND' "$doc" && [ -f "$base.pdf" ]; then
  exit 1
fi
printf '%%PDF-1.5\n%% fake output\n' > "$base.pdf"
exit 0
"#;

pub(crate) struct FakeEngine {
    dir: TempDir,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake-pdflatex.sh"), SCRIPT).unwrap();
        Self { dir }
    }

    /// Config running the fake engine, with workspaces under `workspace_root`
    pub(crate) fn config(&self, workspace_root: &Path) -> EngineConfig {
        let script = self.dir.path().join("fake-pdflatex.sh");
        EngineConfig::default()
            .with_program("sh")
            .with_program_args([script.to_string_lossy().into_owned()])
            .with_workspace_root(workspace_root)
            .with_min_free_bytes(0)
    }
}

/// Config pointing at an engine binary that does not exist
pub(crate) fn missing_engine_config(workspace_root: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_program("/nonexistent/bin/pdflatex-missing")
        .with_workspace_root(workspace_root)
}

/// Number of passes recorded by the fake engine in `dir`
pub(crate) fn pass_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("passes.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

/// Build an in-memory zip from `(path, contents)` pairs
pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Directory entries currently under `root`
pub(crate) fn entries_under(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}

/// PID of the fake engine running in the first workspace under `root`
#[cfg(target_os = "linux")]
pub(crate) async fn engine_pid(root: &Path) -> u32 {
    for _ in 0..200 {
        let pid = std::fs::read_dir(root).ok().and_then(|entries| {
            entries.flatten().find_map(|entry| {
                std::fs::read_to_string(entry.path().join("engine.pid"))
                    .ok()
                    .and_then(|pid| pid.trim().parse().ok())
            })
        });
        if let Some(pid) = pid {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("fake engine never started under {}", root.display());
}

/// Wait for `pid` to exit; a zombie awaiting reaping counts as exited
#[cfg(target_os = "linux")]
pub(crate) async fn process_gone(pid: u32) -> bool {
    for _ in 0..100 {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => return true,
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next());
                if state == Some("Z") {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
