pub mod hash;

/// Reads the full contents of a file synchronously.
///
/// The configuration cache file is small (a single control-plane
/// JSON document), so there is no benefit to an async read here; callers that
/// need this off the request path already run it inside a blocking-friendly
/// background task.
pub fn file_read_sync(path: impl AsRef<std::path::Path>) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}
