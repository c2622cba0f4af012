//! A user-space, inter-process-shared page cache in front of `O_DIRECT`
//! file I/O.
//!
//! Applications link this crate and call a small set of file operations —
//! [`Cache::open`], [`Cache::close`], [`Cache::read`], [`Cache::write`],
//! [`Cache::seek`], [`Cache::fsync`] — that are syntactically equivalent to
//! the OS calls they wrap, but route all data through a fixed-size,
//! inter-process-shared cache of fixed-size pages managed by a CLOCK
//! replacement policy. The backing files are opened with the OS page cache
//! bypassed (`O_DIRECT`), so this cache is the sole source of buffering;
//! durability beyond a client-invoked [`Cache::fsync`] or [`Cache::close`]
//! is not provided.
//!
//! ```no_run
//! use nix::fcntl::OFlag;
//! use shared_page_cache::{Cache, CacheConfig, Whence};
//!
//! let cache = Cache::initialize(&CacheConfig::default())?;
//! let handle = cache.open("/data/example.bin".as_ref(), OFlag::O_RDWR)?;
//! let mut buf = [0u8; 4096];
//! cache.read(handle, &mut buf)?;
//! cache.seek(handle, 0, Whence::Start)?;
//! cache.write(handle, &buf)?;
//! cache.fsync(handle)?;
//! cache.close(handle)?;
//! # Ok::<(), shared_page_cache::CacheError>(())
//! ```
//!
//! Module layout follows the system's leaf-to-root data flow: a client call
//! enters through [`cache::Cache`], which consults its [`descriptor`] table,
//! drives the page-aligned [`io`] loop, which in turn asks the
//! [`engine`] to locate or install a page in the [`segment`], all
//! serialized by the [`mutex::RobustMutex`] embedded in that segment.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod io;
pub mod key;
pub mod mutex;
pub mod segment;

pub use cache::{Cache, RawHandle, Whence};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use key::FileKey;
