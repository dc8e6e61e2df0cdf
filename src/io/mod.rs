//! I/O operations: remote image listing, store construction, and local files.

pub mod fs;
mod remote;
mod store;

pub use fs::{ensure_dir, DirStatus, RelocationStats, RelocationTargets, LOCAL_IMAGE_EXTENSIONS};
pub use remote::{is_remote_image, ImageLister, RemoteImageObject, REMOTE_IMAGE_EXTENSIONS};
pub use store::{create_remote_store, create_s3_store, parse_s3_uri};
