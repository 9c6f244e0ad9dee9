//! Channel allocation under descriptor pressure.
//!
//! Kept in its own test binary: the test lowers `RLIMIT_NOFILE` for the
//! whole process while it runs, which would break unrelated tests
//! sharing the process.

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use stagepipe::{PipeChannel, StagepipeError};
use tempfile::TempDir;

#[tokio::test]
async fn failed_open_unlinks_fifo() {
    let dir = TempDir::new().unwrap();
    let fifo = dir.path().join("starved");

    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    let lowered = std::cmp::min(48, hard);
    setrlimit(Resource::RLIMIT_NOFILE, lowered, hard).unwrap();

    // Fill the descriptor table so the FIFO is created but neither end
    // can be opened.
    let mut hogs = Vec::new();
    while let Ok(file) = std::fs::File::open("/dev/null") {
        hogs.push(file);
    }

    let result = PipeChannel::open(dir.path(), "starved");

    drop(hogs);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, StagepipeError::Allocation(_)));
    assert!(
        !fifo.exists(),
        "a failed allocation must not leave the FIFO on disk"
    );
}
