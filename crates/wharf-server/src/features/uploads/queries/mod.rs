//! Upload queries

pub mod get_upload;
pub mod list_uploads;

pub use get_upload::{GetUploadError, GetUploadQuery, UploadDetails, UploadTableItem};
pub use list_uploads::{ListUploadsError, ListUploadsQuery, ListUploadsResponse};
