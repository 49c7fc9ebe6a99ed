pub mod enumerate;
pub mod folder_worker;

pub use enumerate::{is_image_file, FileEnumerator, WalkDirEnumerator, IMAGE_EXTENSIONS};
pub use folder_worker::{FolderListener, FolderListing, FolderWorker};
