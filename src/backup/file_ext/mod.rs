use std::sync::Arc;

/// Extension a writer stage contributes to the archive file name.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
