pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_path_exists, assert_stub};
pub use fixtures::{CountingDownloader, TestWorkspace, call_count};
pub use logging::init_test_logging;
