use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use tempfile::TempDir;

use crate::context::Context;

/// Writes `body` as a shell script standing in for gpg and returns a
/// context that runs it. The script ignores the options it is given
/// unless `body` looks at `$@`.
///
/// The script is written under another name and renamed into place, so
/// no writable descriptor to the executed path is open while other tests
/// spawn processes.
pub(crate) fn fake_gpg(body: &str) -> (TempDir, Context) {
    let dir = TempDir::new().unwrap();
    let staging = dir.path().join("gpg.tmp");
    let path = dir.path().join("gpg");
    {
        let mut file = File::create(&staging).unwrap();
        write!(file, "#!/bin/sh\n{body}\n").unwrap();
        file.sync_all().unwrap();
    }
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
    fs::rename(&staging, &path).unwrap();
    let ctx = Context::with_binary(path.to_string_lossy());
    (dir, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_gpg_leaves_only_the_script() {
        let (dir, ctx) = fake_gpg("exit 0");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("gpg")]);
        let mode = fs::metadata(ctx.binary()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
