//! Browser process management: executable location, launch with an
//! ephemeral CDP port, readiness probing, and teardown.

mod discovery;
mod error;
mod launcher;
mod platform;

pub use discovery::{BrowserVersion, query_version};
pub use error::ChromeError;
pub use launcher::{BrowserProcess, LaunchSpec, launch_browser, pick_cdp_port};
pub use platform::{Channel, locate_browser};
