/// Suffix a layer adds to the archive name, `None` when the layer is off.
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<&'static str>;
}
