//! Translation trees: table shapes, entry attributes, directory storage and the walk.

pub(crate) mod arena;
mod entry;
mod format;
pub(crate) mod walk;

pub use entry::{CachePolicy, PageEntry, PageFlags};
pub use format::{Narrow, PagingFormat, TranslationMode, Wide};
