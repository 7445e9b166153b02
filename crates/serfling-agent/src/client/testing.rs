//! Scripted stand-in for the `serf` binary.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::SerfClient;

/// Shell script that logs its arguments and then runs `body`.
pub struct FakeSerf {
    dir: TempDir,
    path: PathBuf,
}

impl FakeSerf {
    #[allow(clippy::unwrap_used)]
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serf");
        let calls = dir.path().join("calls");
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$*\" >> '{}'\n{body}\n",
            calls.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn client(&self) -> SerfClient {
        SerfClient::new("127.0.0.1:7373").with_serf(&self.path)
    }

    /// Argument lines of every invocation so far.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls"))
            .map(|log| log.lines().map(ToString::to_string).collect())
            .unwrap_or_default()
    }
}
