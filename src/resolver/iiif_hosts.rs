//! Host adapters that map a library viewer URL onto its IIIF manifest URL.
//!
//! Each host is one table row: a pattern with named captures and a rule that
//! turns those captures into manifest URLs. The manifest itself goes through
//! the shared IIIF parser.

use async_trait::async_trait;
use regex::{Captures, Regex};
use tracing::debug;

use crate::manifest::{Manifest, Source};

use super::iiif::{looks_like_manifest_url, parse_iiif_manifest};
use super::utils::compile_static_regex;
use super::{Adapter, AdapterPriority, ResolveContext, ResolveError};

/// How a host row turns pattern captures into manifest URLs.
#[derive(Debug, Clone, Copy)]
pub enum ManifestRule {
    /// Manifest URL with `${name}` references to the pattern's groups.
    Template(&'static str),
    /// Candidate manifest URLs, tried in order; empty rejects the URL.
    Derived(fn(&Captures<'_>) -> Vec<String>),
}

/// One row of the host table.
#[derive(Debug, Clone, Copy)]
pub struct IiifHost {
    /// Adapter identifier.
    pub id: &'static str,
    /// Viewer URL pattern; named groups feed the rule.
    pub pattern: &'static str,
    /// Manifest URL construction.
    pub manifest: ManifestRule,
}

impl IiifHost {
    const fn template(id: &'static str, pattern: &'static str, template: &'static str) -> Self {
        Self {
            id,
            pattern,
            manifest: ManifestRule::Template(template),
        }
    }

    const fn derived(
        id: &'static str,
        pattern: &'static str,
        derive: fn(&Captures<'_>) -> Vec<String>,
    ) -> Self {
        Self {
            id,
            pattern,
            manifest: ManifestRule::Derived(derive),
        }
    }
}

/// Built-in host table.
#[must_use]
pub fn default_hosts() -> Vec<IiifHost> {
    vec![
        IiifHost::template(
            "bodleian",
            r"(?i)^https?://digital\.bodleian\.ox\.ac\.uk/objects/(?P<id>[^/?#]+)",
            "https://iiif.bodleian.ox.ac.uk/iiif/manifest/${id}.json",
        ),
        IiifHost::template(
            "vatican",
            r"(?i)^https?://digi\.vatlib\.it/view/(?P<id>[^/?#]+)",
            "https://digi.vatlib.it/iiif/${id}/manifest.json",
        ),
        IiifHost::template(
            "manchester",
            r"^https?://(?:www\.)?digitalcollections\.manchester\.ac\.uk/view/(?P<id>MS-[A-Z]+-\d+)",
            "https://www.digitalcollections.manchester.ac.uk/iiif/${id}",
        ),
        IiifHost::template(
            "munich",
            r"(?i)^https?://(?:www\.)?digitale-sammlungen\.de/(?:[a-z]{2}/)?view/(?P<id>[a-z0-9]+)",
            "https://api.digitale-sammlungen.de/iiif/presentation/v2/${id}/manifest",
        ),
        IiifHost::template(
            "yale",
            r"(?i)^https?://collections\.library\.yale\.edu/catalog/(?P<id>\d+)",
            "https://collections.library.yale.edu/manifests/${id}",
        ),
        IiifHost::template(
            "e-rara",
            r"(?i)^https?://(?:www\.)?e-rara\.ch/[^?#]*?titleinfo/(?P<id>\d+)",
            "https://www.e-rara.ch/i3f/v20/${id}/manifest",
        ),
        IiifHost::template(
            "berlin",
            r"(?i)^https?://digital\.staatsbibliothek-berlin\.de/[^#]*?[?&]PPN=(?P<ppn>PPN\d+)",
            "https://content.staatsbibliothek-berlin.de/dc/${ppn}/manifest",
        ),
        IiifHost::template(
            "loc",
            r"(?i)^https?://(?:www\.)?loc\.gov/(?P<kind>item|resource)/(?P<id>[^/?#]+)",
            "https://www.loc.gov/${kind}/${id}/manifest.json",
        ),
        IiifHost::template(
            "grenoble",
            r"(?i)^https?://pagella\.bm-grenoble\.fr/[^#]*?ark:/12148/(?P<id>[^/?#]+)",
            "https://pagella.bm-grenoble.fr/iiif/ark:/12148/${id}/manifest.json",
        ),
        IiifHost::template(
            "heidelberg",
            r"(?i)^https?://digi\.ub\.uni-heidelberg\.de/diglit/(?P<id>[^/?#]+)",
            "https://digi.ub.uni-heidelberg.de/diglit/iiif3/${id}/manifest",
        ),
        IiifHost::derived(
            "graz",
            r"(?i)^https?://unipub\.uni-graz\.at/[^?#]*?content/(?P<kind>titleinfo|pageview)/(?P<id>\d+)",
            graz_manifests,
        ),
        IiifHost::template(
            "hhu",
            r"(?i)^https?://digital\.ulb\.hhu\.de/[^?#]*?(?:titleinfo|pageview|v20)/(?P<id>\d+)",
            "https://digital.ulb.hhu.de/i3f/v20/${id}/manifest",
        ),
        IiifHost::template(
            "vienna-manuscripta",
            r"(?i)^https?://(?:www\.)?manuscripta\.at/diglit/(?P<id>AT\d+-\d+)",
            "https://manuscripta.at/diglit/iiif/${id}/manifest.json",
        ),
        IiifHost::derived(
            "verona",
            r"(?i)^https?://(?:www\.)?nuovabibliotecamanoscritta\.it/[^#]*?[?&]codice(?:Digital)?=(?P<code>\d+)",
            verona_manifests,
        ),
        IiifHost::derived(
            "unicatt",
            r"(?i)^https?://digitallibrary\.unicatt\.it/veneranda/(?P<id>[0-9a-f]{8,})(?:[/?#]|$)",
            unicatt_manifests,
        ),
        IiifHost::derived(
            "toronto",
            r"(?i)^https?://collections\.library\.utoronto\.ca/view/(?P<id>[^/?#]+)",
            toronto_manifests,
        ),
    ]
}

/// Pageview ids sit two above the title record they belong to.
fn graz_manifests(caps: &Captures<'_>) -> Vec<String> {
    let Ok(mut id) = caps["id"].parse::<u64>() else {
        return Vec::new();
    };
    if caps["kind"].eq_ignore_ascii_case("pageview") {
        let Some(title_id) = id.checked_sub(2) else {
            return Vec::new();
        };
        id = title_id;
    }
    vec![format!("https://unipub.uni-graz.at/i3f/v20/{id}/manifest")]
}

/// The Verona viewer's numeric codes map onto the regional library's manifest ids.
fn verona_manifests(caps: &Captures<'_>) -> Vec<String> {
    let manifest_id = match &caps["code"] {
        "12" => "CXLV1331",
        "14" => "CVII1001",
        "15" => "LXXXIX841",
        "17" => "msClasseIII81",
        _ => return Vec::new(),
    };
    vec![format!(
        "https://nbm.regione.veneto.it/documenti/mirador_json/manifest/{manifest_id}.json"
    )]
}

/// Manifests are sharded by the first eight two-character slices of the id.
fn unicatt_manifests(caps: &Captures<'_>) -> Vec<String> {
    let id = &caps["id"];
    let mut path = String::new();
    for start in (0..id.len().min(15)).step_by(2) {
        let end = (start + 2).min(id.len());
        path.push_str(&id[start..end]);
        path.push('/');
    }
    path.push_str(id);
    vec![format!(
        "https://digitallibrary.unicatt.it/veneranda/data/public/manifests/{path}.json"
    )]
}

/// Item ids like `fisher:F10025` are served under either encoding and either
/// presentation version.
fn toronto_manifests(caps: &Captures<'_>) -> Vec<String> {
    let id = &caps["id"];
    let encoded = id.replace(':', "%3A");
    let mut candidates = Vec::new();
    for version in ["v2", "v3"] {
        for variant in [id, encoded.as_str()] {
            let url = format!("https://iiif.library.utoronto.ca/presentation/{version}/{variant}/manifest");
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
    }
    candidates
}

/// Adapter for one [`IiifHost`] row.
#[derive(Debug)]
pub struct IiifHostAdapter {
    host: IiifHost,
    pattern: Regex,
}

impl IiifHostAdapter {
    /// Compiles the host's pattern.
    #[must_use]
    pub fn new(host: IiifHost) -> Self {
        Self {
            pattern: compile_static_regex(host.pattern),
            host,
        }
    }

    /// Manifest URLs for a viewer URL in the order they should be tried.
    #[must_use]
    pub fn manifest_candidates(&self, url: &str) -> Vec<String> {
        let Some(captures) = self.pattern.captures(url.trim()) else {
            return Vec::new();
        };
        match self.host.manifest {
            ManifestRule::Template(template) => {
                let mut manifest = String::new();
                captures.expand(template, &mut manifest);
                vec![manifest]
            }
            ManifestRule::Derived(derive) => derive(&captures),
        }
    }

    /// Preferred manifest URL for a viewer URL, if the pattern matches.
    #[must_use]
    pub fn manifest_url(&self, url: &str) -> Option<String> {
        self.manifest_candidates(url).into_iter().next()
    }
}

#[async_trait]
impl Adapter for IiifHostAdapter {
    fn id(&self) -> &'static str {
        self.host.id
    }

    fn priority(&self) -> AdapterPriority {
        AdapterPriority::Specialized
    }

    // Direct manifest links are left to the generic IIIF adapter.
    fn matches(&self, url: &str) -> bool {
        !looks_like_manifest_url(url) && self.pattern.is_match(url.trim())
    }

    async fn resolve(&self, url: &str, ctx: &ResolveContext) -> Result<Manifest, ResolveError> {
        let candidates = self.manifest_candidates(url);
        let mut last_error = ResolveError::unsupported_source(url);
        for manifest_url in candidates {
            debug!(adapter = self.id(), manifest_url = %manifest_url, "Fetching host manifest");
            match ctx.fetch_json(self.id(), &manifest_url).await {
                Ok(document) => return parse_iiif_manifest(&document, Source::new(url, self.id())),
                Err(error) => {
                    debug!(adapter = self.id(), manifest_url = %manifest_url, error = %error, "Manifest candidate failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }
}
