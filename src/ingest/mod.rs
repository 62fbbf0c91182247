//! Ingestion pipeline: format extraction (§4.A), archive recursion
//! (§4.B), and URL validation/fetching. `chunk`, `concepts`, and
//! `cluster` pick up from the `ExtractedText` this module produces.

pub mod archive;
pub mod extractors;
pub mod url;

pub use archive::{extract_zip_archive, ArchiveLimits, ArchiveStats};
pub use extractors::{extract, extract_image, extract_url, ExtractedText, Extractor, ExtractorRegistry, NoopOcr, OcrEngine};
pub use url::{validate_url, validate_url_resolving};
