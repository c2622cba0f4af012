//! Scenario 5: cross-process visibility through the shared segment,
//! driven with a real `fork()` so the two sides are genuinely separate
//! processes attaching to the same named shared memory object.

use std::process::exit;

use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use shared_page_cache::{Cache, CacheConfig};

/// P1 (the child) writes 4096 bytes of `X` at offset 0 and `fsync`s. P2
/// (the parent) waits for the child to exit, then independently attaches
/// to the same segment, opens the same file, and reads offset 0 — it must
/// see all `X`, purely from the segment P1 populated.
#[test]
fn write_in_one_process_is_visible_in_another() {
    let segment_name = format!("/sp_cache_it_{}_xproc", std::process::id());
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();

    // SAFETY: the child only touches its own fresh Cache attachment and
    // the backing file by path; it does not touch any state inherited
    // from the parent's Rust runtime beyond what fork() itself copies.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let config = CacheConfig::for_test(segment_name.clone(), 4);
            let cache = match Cache::initialize(&config) {
                Ok(c) => c,
                Err(_) => exit(1),
            };
            let handle = match cache.open(&path, OFlag::O_RDWR) {
                Ok(h) => h,
                Err(_) => exit(2),
            };
            if cache.write(handle, &[b'X'; 4096]).is_err() {
                exit(3);
            }
            if cache.fsync(handle).is_err() {
                exit(4);
            }
            if cache.close(handle).is_err() {
                exit(5);
            }
            exit(0);
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).expect("waitpid");
            assert_eq!(status, WaitStatus::Exited(child, 0), "child process failed");

            let config = CacheConfig::for_test(segment_name, 4);
            let cache = Cache::initialize(&config).expect("attach shared segment");
            let handle = cache.open(&path, OFlag::O_RDONLY).unwrap();

            let mut buf = vec![0u8; 4096];
            let n = cache.read(handle, &mut buf).unwrap();
            assert_eq!(n, 4096);
            assert!(buf.iter().all(|&b| b == b'X'));

            cache.close(handle).unwrap();
        }
    }
}
