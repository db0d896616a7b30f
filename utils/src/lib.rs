mod archive;
mod log;
mod time;

pub use self::log::setup_logging;
pub use archive::{build_tar_gzip, extract_tar_gzip, is_empty_dir};
pub use time::{elapsed_since, get_timestamp, parse_timestamp};
