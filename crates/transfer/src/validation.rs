use std::path::{Component, Path};

use chunkline_protocol::TransferRequest;
use chunkline_protocol::constants::MAX_TRANSFER_SIZE;

use crate::TransferError;

/// Validates a request before it is allowed into the admission queue.
///
/// Rejects:
/// - Empty ids or content types
/// - Declared sizes above [`MAX_TRANSFER_SIZE`]
/// - File names that are not a single plain path component
/// - Malformed whole-file digests
pub fn validate_request(request: &TransferRequest) -> Result<(), TransferError> {
    if request.id.trim().is_empty() {
        return Err(TransferError::InvalidRequest("empty transfer id".into()));
    }
    if request.content_type.trim().is_empty() {
        return Err(TransferError::InvalidRequest(format!(
            "{}: empty content type",
            request.id
        )));
    }
    if request.total_size > MAX_TRANSFER_SIZE {
        return Err(TransferError::InvalidRequest(format!(
            "{}: declared size {} exceeds limit {MAX_TRANSFER_SIZE}",
            request.id, request.total_size
        )));
    }
    if let Some(digest) = &request.file_digest
        && (digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()))
    {
        return Err(TransferError::InvalidRequest(format!(
            "{}: malformed file digest",
            request.id
        )));
    }
    if request
        .encryption_key_id
        .as_deref()
        .is_some_and(|k| k.trim().is_empty())
    {
        return Err(TransferError::InvalidRequest(format!(
            "{}: empty encryption key id",
            request.id
        )));
    }
    validate_file_name(&request.file_name)
}

/// Validates that a file name is a single component with no traversal.
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidRequest("empty file name".into()));
    }

    let path = Path::new(file_name);

    if path.is_absolute() {
        return Err(TransferError::InvalidRequest(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) | (_, Some(Component::ParentDir)) => {
            Err(TransferError::InvalidRequest(format!(
                "parent directory traversal not allowed: {file_name}"
            )))
        }
        _ => Err(TransferError::InvalidRequest(format!(
            "file name must not contain directories: {file_name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest::new("report.pdf", 1024).with_id("t1")
    }

    #[test]
    fn accepts_plain_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn rejects_empty_id() {
        assert!(validate_request(&request().with_id("  ")).is_err());
    }

    #[test]
    fn rejects_empty_content_type() {
        assert!(validate_request(&request().with_content_type("")).is_err());
    }

    #[test]
    fn rejects_oversized_transfer() {
        let mut req = request();
        req.total_size = MAX_TRANSFER_SIZE + 1;
        assert!(matches!(
            validate_request(&req),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_malformed_digest() {
        assert!(validate_request(&request().with_file_digest("abc")).is_err());
        assert!(validate_request(&request().with_file_digest("a".repeat(64))).is_ok());
    }

    #[test]
    fn rejects_blank_key_id() {
        assert!(validate_request(&request().with_encryption_key(" ")).is_err());
    }

    #[test]
    fn rejects_empty_file_name() {
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_file_name("../../../etc/passwd").is_err());
        assert!(validate_file_name("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_file_name("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_nested_path() {
        assert!(validate_file_name("sub/dir/file.txt").is_err());
    }

    #[test]
    fn accepts_simple_and_dot_names() {
        assert!(validate_file_name("game.exe").is_ok());
        assert!(validate_file_name(".bashrc").is_ok());
    }
}
