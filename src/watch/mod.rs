pub mod branch;
pub mod files;

pub use branch::BranchWatcher;
pub use files::FileWatcher;
