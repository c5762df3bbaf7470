//! User-Agent strings sent to library hosts.

/// Project URL advertised in the User-Agent so hosts can reach the maintainers.
const PROJECT_UA_URL: &str = "https://github.com/manuscript-downloader/manuscript-downloader";

/// Default User-Agent for every fetch (tool name, version, contact URL).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (digital-library-archiver; +{PROJECT_UA_URL})")
}
