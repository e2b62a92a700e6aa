use crate::core::geo::TileCoord;

/// Anything that can produce a tile URL for a coordinate
pub trait TileSource: Send + Sync {
    /// Build a URL for the requested `coord`.
    fn url(&self, coord: TileCoord) -> String;
}

/// The default OpenStreetMap tile servers, rotating over subdomains
pub struct OpenStreetMapSource {
    subdomains: Vec<&'static str>,
}

impl OpenStreetMapSource {
    pub fn new() -> Self {
        Self {
            subdomains: vec!["a", "b", "c"],
        }
    }
}

impl Default for OpenStreetMapSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TileSource for OpenStreetMapSource {
    fn url(&self, coord: TileCoord) -> String {
        let sub = pick_subdomain(&self.subdomains, coord).unwrap_or("a");
        format!(
            "https://{}.tile.openstreetmap.org/{}/{}/{}.png",
            sub, coord.z, coord.x, coord.y
        )
    }
}

/// URL template with `{z}`, `{x}`, `{y}` and optional `{s}` (subdomain) placeholders
///
/// ```
/// use maplet_tiles::tiles::source::{TileSource, UrlTemplateSource};
/// use maplet_tiles::TileCoord;
///
/// let source = UrlTemplateSource::new("https://tiles.example/{z}/{x}/{y}.pbf");
/// assert_eq!(source.url(TileCoord::new(3, 5, 4)), "https://tiles.example/4/3/5.pbf");
/// ```
#[derive(Debug, Clone)]
pub struct UrlTemplateSource {
    template: String,
    subdomains: Vec<String>,
}

impl UrlTemplateSource {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            subdomains: Vec::new(),
        }
    }

    pub fn with_subdomains<I, S>(mut self, subdomains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl TileSource for UrlTemplateSource {
    fn url(&self, coord: TileCoord) -> String {
        let url = self
            .template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string());

        match pick_subdomain(&self.subdomains, coord) {
            Some(sub) => url.replace("{s}", sub),
            None => url,
        }
    }
}

/// Deterministic subdomain for a coordinate, spreading neighbours across servers
fn pick_subdomain<S: AsRef<str>>(subdomains: &[S], coord: TileCoord) -> Option<&str> {
    if subdomains.is_empty() {
        return None;
    }
    let idx = (coord.x as usize + coord.y as usize) % subdomains.len();
    Some(subdomains[idx].as_ref())
}
